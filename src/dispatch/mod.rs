//! Node registry, transports and health-aware dispatch.

pub mod dispatcher;
pub mod heartbeat;
pub mod http;
pub mod node;
pub mod registry;
pub mod transport;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use heartbeat::{HeartbeatMonitor, SweepReport};
pub use http::HttpTransport;
pub use node::{Node, NodeConfig, NodeHealth, NodeKind};
pub use registry::{HealthTransition, NodeRegistry};
pub use transport::{LocalTransport, NodeTransport};
