use anyhow::{Context, Result};
use bytes::Bytes;
use std::fs;
use std::path::{Path, PathBuf};

use crate::protocol::PeerAddr;

/// On-disk home for seed files and finished downloads. Downloads are written
/// under an owner-qualified name so peers sharing one directory never
/// clobber each other's copies.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> FileStore {
        FileStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads the full content of a seed file.
    pub fn load(&self, name: &str) -> Result<Bytes> {
        let path = self.root.join(name);
        let content =
            fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Bytes::from(content))
    }

    /// Writes a downloaded file as `<host>_<port>_<name>`, creating the root
    /// directory on first use. Returns the path written.
    pub fn save_download(&self, owner: &PeerAddr, name: &str, content: &[u8]) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let path = self
            .root
            .join(format!("{}_{}_{}", owner.host, owner.port, name));
        fs::write(&path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}
