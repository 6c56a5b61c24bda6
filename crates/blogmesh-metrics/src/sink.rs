use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Destination for a metrics snapshot.
pub trait MetricsSink: Send + Sync {
    fn flush(&self, exposition: &str) -> io::Result<()>;
}

/// Writes the full exposition to a file, replacing previous contents.
#[derive(Clone, Debug)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for FileSink {
    fn flush(&self, exposition: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, exposition)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), bytes = exposition.len(), "flushed metrics");
        Ok(())
    }
}
