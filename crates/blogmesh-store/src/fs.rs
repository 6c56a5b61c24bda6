use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use blogmesh_crypto::KeypairIdentity;
use blogmesh_types::Cid;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

const DATASTORE_DIR: &str = "datastore";
const BLOCKSTORE_DIR: &str = "blockstore";
const IDENTITY_KEY: &str = "identity";

/// On-disk state of one node.
///
/// ```text
/// <root>/datastore/   key-value entries (peer identity, log metadata, pins)
/// <root>/blockstore/  blob bytes, one file per CID
/// ```
///
/// Both directories are keyed by content or identity hashes and may be
/// deleted independently to reset a node.
#[derive(Clone, Debug)]
pub struct DataDir {
    root: PathBuf,
    datastore: FsDatastore,
    blockstore: FsBlockstore,
}

impl DataDir {
    /// Open (creating if needed) the data directory at `root`.
    ///
    /// Fails if either store directory cannot be created or written to.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        let datastore = FsDatastore::open(root.join(DATASTORE_DIR))?;
        let blockstore = FsBlockstore::open(root.join(BLOCKSTORE_DIR))?;
        info!(root = %root.display(), "opened data directory");
        Ok(Self {
            root,
            datastore,
            blockstore,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn datastore(&self) -> &FsDatastore {
        &self.datastore
    }

    pub fn blockstore(&self) -> &FsBlockstore {
        &self.blockstore
    }

    /// Load the persisted node identity, generating and storing one on first use.
    pub fn load_or_create_identity(&self) -> StoreResult<KeypairIdentity> {
        match self.datastore.get::<String>(IDENTITY_KEY) {
            Ok(Some(secret)) => match decode_secret(&secret) {
                Some(bytes) => return Ok(KeypairIdentity::from_secret(bytes)),
                None => {
                    warn!("stored identity is malformed, replacing it");
                    self.datastore.delete(IDENTITY_KEY)?;
                }
            },
            Ok(None) => {}
            Err(StoreError::CorruptEntry { key, reason }) => {
                warn!(%key, %reason, "stored identity is corrupt, replacing it");
                self.datastore.delete(IDENTITY_KEY)?;
            }
            Err(e) => return Err(e),
        }
        let identity = KeypairIdentity::generate();
        self.datastore
            .put(IDENTITY_KEY, &hex::encode(identity.secret_bytes()))?;
        info!(peer = %identity.peer_id(), "generated new node identity");
        Ok(identity)
    }
}

fn decode_secret(s: &str) -> Option<[u8; 32]> {
    hex::decode(s).ok()?.try_into().ok()
}

/// Ensure `dir` exists and accepts writes.
fn prepare_dir(dir: &Path) -> StoreResult<()> {
    fs::create_dir_all(dir)?;
    let check = dir.join(".write-check");
    fs::write(&check, b"ok")?;
    fs::remove_file(&check)?;
    Ok(())
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write `data` to `path` via a temporary file and rename.
///
/// Each write gets its own temporary name so concurrent writers of one
/// key never rename each other's file.
fn write_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("{}-{seq}.tmp", std::process::id()));
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// File-per-key JSON datastore.
///
/// Keys are arbitrary strings; file names are their hex encoding.
#[derive(Clone, Debug)]
pub struct FsDatastore {
    dir: PathBuf,
}

impl FsDatastore {
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        prepare_dir(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(key)))
    }

    pub fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StoreResult<()> {
        let data =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&self.path_for(key), &data)
    }

    /// Read a key. A value that cannot be decoded is reported as `CorruptEntry`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let data = match fs::read(self.path_for(key)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| StoreError::CorruptEntry {
                key: key.to_owned(),
                reason: e.to_string(),
            })
    }

    /// Delete a key. Returns `true` if it existed.
    pub fn delete(&self, key: &str) -> StoreResult<bool> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// All keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            let Some(key) = hex::decode(stem).ok().and_then(|b| String::from_utf8(b).ok())
            else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Load every entry under `prefix`.
    ///
    /// Entries that fail to decode are logged and deleted so they do not
    /// fail again on the next start.
    pub fn load_prefix<T: DeserializeOwned>(&self, prefix: &str) -> StoreResult<Vec<(String, T)>> {
        let mut out = Vec::new();
        for key in self.keys_with_prefix(prefix)? {
            match self.get::<T>(&key) {
                Ok(Some(value)) => out.push((key, value)),
                Ok(None) => {}
                Err(StoreError::CorruptEntry { key, reason }) => {
                    warn!(%key, %reason, "deleting corrupt datastore entry");
                    self.delete(&key)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

/// File-per-blob content-addressed blockstore.
#[derive(Clone, Debug)]
pub struct FsBlockstore {
    dir: PathBuf,
}

impl FsBlockstore {
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        prepare_dir(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, cid: &Cid) -> PathBuf {
        self.dir.join(cid.to_hex())
    }

    /// Store bytes and return their identifier. Idempotent.
    pub fn put(&self, data: &[u8]) -> StoreResult<Cid> {
        let cid = Cid::for_bytes(data);
        let path = self.path_for(&cid);
        if !path.exists() {
            write_atomic(&path, data)?;
        }
        Ok(cid)
    }

    /// Read a blob, verifying its hash.
    ///
    /// A block whose bytes no longer match its identifier is deleted and
    /// reported as absent.
    pub fn get(&self, cid: &Cid) -> StoreResult<Option<Bytes>> {
        let path = self.path_for(cid);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !cid.verify(&data) {
            warn!(%cid, "deleting corrupt block");
            fs::remove_file(&path)?;
            return Ok(None);
        }
        debug!(%cid, size = data.len(), "read block");
        Ok(Some(Bytes::from(data)))
    }

    pub fn has(&self, cid: &Cid) -> bool {
        self.path_for(cid).exists()
    }
}
