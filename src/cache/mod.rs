pub mod coordinator;
pub mod tier;

pub use coordinator::{CacheCoordinator, CacheMetrics};
pub use tier::{CacheEntry, Tier};
