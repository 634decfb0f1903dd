use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use crate::core::errors::{EngineError, Result};
use crate::storage::connection::{ConnectError, ConnectionFactory, StoreConnection};

/// Opens sled trees; all connections to one path share a single `sled::Db`.
pub struct SledConnectionFactory {
    tree_name: String,
    databases: Mutex<HashMap<PathBuf, sled::Db>>,
}

impl SledConnectionFactory {
    pub fn new(tree_name: impl Into<String>) -> Self {
        Self {
            tree_name: tree_name.into(),
            databases: Mutex::new(HashMap::new()),
        }
    }

    fn open_db(&self, path: &Path) -> std::result::Result<sled::Db, ConnectError> {
        let mut databases = self.databases.lock();
        if let Some(db) = databases.get(path) {
            return Ok(db.clone());
        }
        // sled stores are directories; anything else at the path is unusable
        if path.exists() && !path.is_dir() {
            return Err(ConnectError::Corrupted(format!(
                "{} is not a store directory",
                path.display()
            )));
        }
        let db = sled::Config::new()
            .path(path)
            .open()
            .map_err(classify)?;
        debug!(path = %path.display(), "Opened sled store");
        databases.insert(path.to_path_buf(), db.clone());
        Ok(db)
    }
}

impl ConnectionFactory for SledConnectionFactory {
    fn connect(&self, path: &Path) -> std::result::Result<Box<dyn StoreConnection>, ConnectError> {
        let db = self.open_db(path)?;
        let tree = db.open_tree(&self.tree_name).map_err(classify)?;
        Ok(Box::new(SledConnection {
            tree,
            healthy: AtomicBool::new(true),
        }))
    }

    fn release(&self, path: &Path) {
        if let Some(db) = self.databases.lock().remove(path) {
            if let Err(e) = db.flush() {
                warn!(path = %path.display(), error = %e, "Flush on release failed");
            }
        }
    }
}

/// Map sled open errors onto corruption vs. transient failures
pub fn classify(err: sled::Error) -> ConnectError {
    match err {
        sled::Error::Corruption { .. } => ConnectError::Corrupted(err.to_string()),
        sled::Error::Unsupported(msg) => ConnectError::Corrupted(msg),
        sled::Error::ReportableBug(msg) => ConnectError::Corrupted(msg),
        sled::Error::Io(io) if io.kind() == ErrorKind::InvalidData => {
            ConnectError::Corrupted(io.to_string())
        }
        sled::Error::Io(io) => ConnectError::Transient(io.to_string()),
        other => ConnectError::Transient(other.to_string()),
    }
}

/// A handle onto one sled tree
pub struct SledConnection {
    tree: sled::Tree,
    healthy: AtomicBool,
}

impl SledConnection {
    fn check<T>(&self, operation: &str, result: sled::Result<T>) -> Result<T> {
        result.map_err(|e| {
            if matches!(e, sled::Error::Io(_) | sled::Error::Corruption { .. }) {
                self.healthy.store(false, Ordering::Release);
            }
            EngineError::database(operation, e)
        })
    }
}

impl StoreConnection for SledConnection {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self.check("read", self.tree.get(key.as_bytes()))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check("write", self.tree.insert(key.as_bytes(), value))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let previous = self.check("remove", self.tree.remove(key.as_bytes()))?;
        Ok(previous.is_some())
    }

    fn flush(&self) -> Result<()> {
        self.check("flush", self.tree.flush())?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connections_share_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quotes.db");
        let factory = SledConnectionFactory::new("cache");

        let first = factory.connect(&path).unwrap();
        let second = factory.connect(&path).unwrap();
        first.write("AAPL", b"189.5").unwrap();
        assert_eq!(second.read("AAPL").unwrap(), Some(b"189.5".to_vec()));
        assert!(second.remove("AAPL").unwrap());
        assert!(first.read("AAPL").unwrap().is_none());
        assert!(first.is_healthy());
    }

    #[test]
    fn test_file_at_store_path_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quotes.db");
        std::fs::write(&path, b"\x00garbage").unwrap();

        let factory = SledConnectionFactory::new("cache");
        let err = factory.connect(&path).err().unwrap();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_classify() {
        assert!(classify(sled::Error::Unsupported("format v9".into())).is_corruption());
        let busy = std::io::Error::new(ErrorKind::WouldBlock, "locked");
        assert!(!classify(sled::Error::Io(busy)).is_corruption());
    }
}
