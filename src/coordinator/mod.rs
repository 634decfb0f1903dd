pub mod coordinator;
pub mod events;

pub use coordinator::{
    CoordinatorParts, EngineStats, ExecutionCoordinator, PassthroughScorer, PriorityScorer,
    TaskCounts,
};
pub use events::{EngineEvent, EventBus, Subscription, SubscriptionId};
