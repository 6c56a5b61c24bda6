use tokio::sync::watch;

use crate::state::BlogState;

/// Publish-subscribe cell holding the blog currently shown.
///
/// The acquisition loop is the only writer; everything else reads through
/// [`BlogObservers::subscribe`] or [`BlogObservers::current`]. Subscribers
/// see `None` until a complete blog has been acquired.
#[derive(Debug)]
pub struct BlogObservers {
    tx: watch::Sender<Option<BlogState>>,
}

impl Default for BlogObservers {
    fn default() -> Self {
        Self::new()
    }
}

impl BlogObservers {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<BlogState>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Option<BlogState> {
        self.tx.borrow().clone()
    }

    /// Replace the shown blog. Returns false when nothing changed.
    pub(crate) fn publish(&self, state: BlogState) -> bool {
        self.tx.send_if_modified(|current| {
            if current.as_ref() == Some(&state) {
                return false;
            }
            *current = Some(state);
            true
        })
    }

    pub(crate) fn clear(&self) {
        self.tx.send_if_modified(|current| current.take().is_some());
    }
}
