//! Storage layer
//!
//! Pooled connections over an embedded sled store, with fail-fast
//! initialisation and remediation of corrupted stores.

pub mod connection;
pub mod pool;
pub mod sled_store;

pub use connection::{ConnectError, ConnectionFactory, StoreConnection};
pub use pool::{ConnectionPoolManager, PoolState, PoolStats, PooledConnection};
pub use sled_store::SledConnectionFactory;
