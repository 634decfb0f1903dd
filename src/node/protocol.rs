//! Request and response bodies shared by the node server and the HTTP transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::model::{TaskId, TaskKind, TaskState};
use crate::dispatch::node::NodeHealth;

/// `POST /api/v1/task/execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub task_id: TaskId,
    pub task_type: String,
    #[serde(default)]
    pub task_data: Value,
    #[serde(default)]
    pub priority: i32,
    /// Seconds the node may spend on the task
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TaskKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub accepted: bool,
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `GET /api/v1/task/{task_id}/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `GET /api/v1/health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: NodeHealth,
    pub load: usize,
    pub capacity: usize,
}

/// `GET /api/v1/node/stats`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatsResponse {
    pub load: usize,
    pub capacity: usize,
    pub health: NodeHealth,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
}

/// `POST /api/v1/task/{task_id}/cancel`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_execute_request_minimal_body() {
        let request: ExecuteRequest = serde_json::from_value(json!({
            "task_id": "t1",
            "task_type": "import"
        }))
        .unwrap();
        assert_eq!(request.priority, 0);
        assert_eq!(request.task_data, Value::Null);
        assert!(request.timeout.is_none());
        assert!(request.kind.is_none());
    }

    #[test]
    fn test_status_omits_empty_fields() {
        let body = serde_json::to_value(TaskStatusResponse {
            state: TaskState::Running,
            result: None,
            error: None,
        })
        .unwrap();
        assert_eq!(body, json!({"state": "running"}));
    }
}
