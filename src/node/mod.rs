//! The HTTP surface a remote worker node exposes, and its wire types.

pub mod protocol;
pub mod server;

pub use protocol::{
    CancelResponse, ExecuteRequest, ExecuteResponse, HealthResponse, NodeStatsResponse,
    TaskStatusResponse,
};
pub use server::{build_router, serve, NodeServer, DEFAULT_RESULT_RETENTION};
