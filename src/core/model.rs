use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

// Type aliases
pub type TaskId = String;
pub type NodeId = String;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of work a node knows how to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Pull a dataset from an external source into the store
    Import { source: String, dataset: String },
    /// Derive data from previously imported datasets
    Transform { operation: String },
    /// Write data out of the store
    Export { target: String },
    /// Anything else, routed by name
    Custom { name: String },
}

impl TaskKind {
    /// Routing key used by handler registries and the node wire protocol
    pub fn task_type(&self) -> &str {
        match self {
            TaskKind::Import { .. } => "import",
            TaskKind::Transform { .. } => "transform",
            TaskKind::Export { .. } => "export",
            TaskKind::Custom { name } => name,
        }
    }
}

/// What a finished task produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success(Value),
    Failure(String),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }
}

/// Specification for creating new tasks
#[derive(Debug, Clone)]
pub struct TaskSpec {
    id: TaskId,
    kind: TaskKind,
    payload: Value,
    priority: i32,
    dependencies: BTreeSet<TaskId>,
    timeout: Option<Duration>,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, kind: TaskKind) -> Self {
        Self {
            id: id.into(),
            kind,
            payload: Value::Object(serde_json::Map::new()),
            priority: 0,
            dependencies: BTreeSet::new(),
            timeout: None,
        }
    }

    /// Spec with a generated unique id
    pub fn generated(kind: TaskKind) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), kind)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Core task record, owned by the execution coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    kind: TaskKind,
    payload: Value,
    priority: i32,
    dependencies: BTreeSet<TaskId>,
    state: TaskState,
    assigned_node: Option<NodeId>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    outcome: Option<TaskOutcome>,
    timeout: Option<Duration>,
    attempts: u32,
}

impl Task {
    /// Create task from specification
    pub fn from_spec(spec: TaskSpec) -> Self {
        Self {
            id: spec.id,
            kind: spec.kind,
            payload: spec.payload,
            priority: spec.priority,
            dependencies: spec.dependencies,
            state: TaskState::Pending,
            assigned_node: None,
            created_at: Utc::now(),
            completed_at: None,
            outcome: None,
            timeout: spec.timeout,
            attempts: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn dependencies(&self) -> &BTreeSet<TaskId> {
        &self.dependencies
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn assigned_node(&self) -> Option<&str> {
        self.assigned_node.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn outcome(&self) -> Option<&TaskOutcome> {
        self.outcome.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Dispatch attempts consumed so far across all nodes
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    pub(crate) fn mark_running(&mut self) {
        self.state = TaskState::Running;
    }

    pub(crate) fn mark_requeued(&mut self, attempts: u32) {
        self.state = TaskState::Ready;
        self.assigned_node = None;
        self.attempts = attempts;
    }

    pub(crate) fn finish(&mut self, state: TaskState, outcome: Option<TaskOutcome>) {
        self.state = state;
        self.outcome = outcome;
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn assign(&mut self, node_id: NodeId, attempts: u32) {
        self.assigned_node = Some(node_id);
        self.attempts = attempts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_from_spec_defaults() {
        let spec = TaskSpec::new(
            "quotes-2024",
            TaskKind::Import {
                source: "csv".into(),
                dataset: "quotes".into(),
            },
        )
        .with_priority(5)
        .with_dependencies(["calendar", "symbols"])
        .with_payload(json!({"path": "/data/quotes.csv"}));

        let task = Task::from_spec(spec);
        assert_eq!(task.id(), "quotes-2024");
        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(task.priority(), 5);
        assert_eq!(task.dependencies().len(), 2);
        assert!(task.assigned_node().is_none());
        assert!(task.completed_at().is_none());
        assert_eq!(task.kind().task_type(), "import");
    }

    #[test]
    fn test_task_kind_is_tagged() {
        let kind = TaskKind::Custom {
            name: "rebalance".into(),
        };
        let encoded = serde_json::to_value(&kind).unwrap();
        assert_eq!(encoded, json!({"type": "custom", "name": "rebalance"}));
        assert_eq!(kind.task_type(), "rebalance");
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Ready.is_terminal());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = TaskSpec::generated(TaskKind::Export { target: "x".into() });
        let b = TaskSpec::generated(TaskKind::Export { target: "x".into() });
        assert_ne!(a.id(), b.id());
    }
}
