pub mod ready_queue;
pub mod scheduler;

pub use ready_queue::ReadyQueue;
pub use scheduler::{CapacityProvider, Scheduler, SchedulerStats};
