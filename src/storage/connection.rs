use std::path::Path;
use thiserror::Error;

use crate::core::errors::Result;

/// One handle onto the backing store
pub trait StoreConnection: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn write(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Returns whether the key existed
    fn remove(&self, key: &str) -> Result<bool>;

    fn flush(&self) -> Result<()>;

    /// False once the handle has seen an error that makes it unfit for reuse
    fn is_healthy(&self) -> bool;
}

/// Why a connection could not be created
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// Store content is unreadable; remediation may help
    #[error("store corrupted: {0}")]
    Corrupted(String),
    /// Lock contention, permissions, resource limits; retrying later may help
    #[error("connection failed: {0}")]
    Transient(String),
}

impl ConnectError {
    pub fn is_corruption(&self) -> bool {
        matches!(self, ConnectError::Corrupted(_))
    }
}

/// Opens connections to the store at a path
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self, path: &Path) -> std::result::Result<Box<dyn StoreConnection>, ConnectError>;

    /// Drop any state held for `path` so the files can be moved or deleted
    fn release(&self, _path: &Path) {}
}
