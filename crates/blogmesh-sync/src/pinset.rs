use std::collections::HashSet;
use std::sync::RwLock;

use blogmesh_types::Cid;

/// CIDs this process has fetched, verified and committed to retain.
///
/// Grows monotonically; nothing is ever removed.
#[derive(Debug, Default)]
pub struct PinSet {
    cids: RwLock<HashSet<Cid>>,
}

impl PinSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.cids.read().expect("pinset lock poisoned").contains(cid)
    }

    /// Returns `true` if the CID was not already present.
    pub(crate) fn insert(&self, cid: Cid) -> bool {
        self.cids.write().expect("pinset lock poisoned").insert(cid)
    }

    pub fn len(&self) -> usize {
        self.cids.read().expect("pinset lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted copy of the set.
    pub fn snapshot(&self) -> Vec<Cid> {
        let mut cids: Vec<Cid> = self
            .cids
            .read()
            .expect("pinset lock poisoned")
            .iter()
            .copied()
            .collect();
        cids.sort();
        cids
    }
}
