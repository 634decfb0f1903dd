use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

use crate::core::errors::{EngineError, Result};
use crate::core::model::{Task, TaskId, TaskOutcome, TaskState};
use crate::resolver::graph::DependencyGraph;

/// Tasks whose state changed as a consequence of a completion
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompletionEffects {
    /// Dependents promoted to Ready, ascending by id
    pub ready: Vec<TaskId>,
    /// Transitive dependents cancelled, ascending by id
    pub cancelled: Vec<TaskId>,
}

struct ResolverState {
    graph: DependencyGraph,
    states: HashMap<TaskId, TaskState>,
}

/// Validates submissions against the dependency graph and decides readiness.
///
/// The graph and the per-task states live behind a single lock.
pub struct DependencyResolver {
    inner: Mutex<ResolverState>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ResolverState {
                graph: DependencyGraph::new(),
                states: HashMap::new(),
            }),
        }
    }

    /// Submit a single task. See [`submit_batch`](Self::submit_batch).
    pub fn submit(&self, task: &mut Task) -> Result<TaskState> {
        self.submit_batch(std::slice::from_mut(task))
            .map(|states| states[0])
    }

    /// Submit tasks whose dependencies are either already known or part of the batch.
    ///
    /// The whole batch is rejected without touching the graph if any task is a
    /// duplicate, names an unknown dependency, or closes a cycle. On success each
    /// task's state is set to Ready, Pending or Cancelled and returned in order.
    pub fn submit_batch(&self, tasks: &mut [Task]) -> Result<Vec<TaskState>> {
        let mut inner = self.inner.lock();

        let mut pending: BTreeMap<TaskId, BTreeSet<TaskId>> = BTreeMap::new();
        for task in tasks.iter() {
            if inner.graph.contains(task.id()) || pending.contains_key(task.id()) {
                return Err(EngineError::DuplicateTask(task.id().to_string()));
            }
            pending.insert(task.id().to_string(), task.dependencies().clone());
        }
        for (task_id, deps) in &pending {
            if let Some(missing) = deps
                .iter()
                .find(|dep| !inner.graph.contains(dep) && !pending.contains_key(*dep))
            {
                return Err(EngineError::UnknownDependency {
                    task_id: task_id.clone(),
                    dependency: missing.clone(),
                });
            }
        }
        if let Some(cycle) = inner.graph.find_cycle(pending.keys().cloned(), &pending) {
            let task_id = cycle.first().cloned().unwrap_or_default();
            warn!(task_id = %task_id, cycle = ?cycle, "Rejecting submission that closes a cycle");
            return Err(EngineError::DependencyConflict { task_id, cycle });
        }

        // Validation passed; from here on the mutation cannot fail
        for (task_id, deps) in pending {
            inner.graph.insert(task_id, deps);
        }

        // Decide states in topological order so in-batch dependencies are settled first
        let batch_order: Vec<TaskId> = inner
            .graph
            .topological_order()
            .into_iter()
            .filter(|id| tasks.iter().any(|t| t.id() == id))
            .collect();
        for task_id in &batch_order {
            let state = Self::initial_state(&inner, task_id);
            inner.states.insert(task_id.clone(), state);
        }

        let mut result = Vec::with_capacity(tasks.len());
        for task in tasks.iter_mut() {
            let state = inner
                .states
                .get(task.id())
                .copied()
                .unwrap_or(TaskState::Pending);
            task.set_state(state);
            debug!(task_id = %task.id(), state = %state, "Task accepted by resolver");
            result.push(state);
        }
        Ok(result)
    }

    fn initial_state(inner: &ResolverState, task_id: &str) -> TaskState {
        let mut all_succeeded = true;
        for dep in inner.graph.dependencies(task_id) {
            match inner.states.get(dep) {
                Some(TaskState::Failed) | Some(TaskState::Cancelled) => {
                    return TaskState::Cancelled
                }
                Some(TaskState::Succeeded) => {}
                _ => all_succeeded = false,
            }
        }
        if all_succeeded {
            TaskState::Ready
        } else {
            TaskState::Pending
        }
    }

    /// Record a task's terminal outcome and compute the effect on its dependents.
    ///
    /// Success promotes direct dependents whose dependencies have all succeeded.
    /// Failure cancels every transitive dependent without checking readiness.
    /// A task that already reached a terminal state keeps it and has no effects.
    pub fn mark_completed(&self, task_id: &str, outcome: &TaskOutcome) -> Result<CompletionEffects> {
        let mut inner = self.inner.lock();
        if !inner.graph.contains(task_id) {
            return Err(EngineError::TaskNotFound(task_id.to_string()));
        }
        if let Some(state) = inner.states.get(task_id).filter(|s| s.is_terminal()) {
            debug!(task_id = %task_id, state = %state, "Ignoring completion of finished task");
            return Ok(CompletionEffects::default());
        }

        match outcome {
            TaskOutcome::Success(_) => {
                inner
                    .states
                    .insert(task_id.to_string(), TaskState::Succeeded);
                let candidates: Vec<TaskId> = inner.graph.dependents(task_id).cloned().collect();
                let mut ready = Vec::new();
                for dependent in candidates {
                    if inner.states.get(&dependent) != Some(&TaskState::Pending) {
                        continue;
                    }
                    let satisfied = inner
                        .graph
                        .dependencies(&dependent)
                        .all(|dep| inner.states.get(dep) == Some(&TaskState::Succeeded));
                    if satisfied {
                        inner.states.insert(dependent.clone(), TaskState::Ready);
                        ready.push(dependent);
                    }
                }
                if !ready.is_empty() {
                    info!(task_id = %task_id, promoted = ?ready, "Dependents ready");
                }
                Ok(CompletionEffects {
                    ready,
                    cancelled: Vec::new(),
                })
            }
            TaskOutcome::Failure(_) => {
                inner.states.insert(task_id.to_string(), TaskState::Failed);
                let cancelled = Self::cancel_dependents(&mut inner, task_id);
                Ok(CompletionEffects {
                    ready: Vec::new(),
                    cancelled,
                })
            }
        }
    }

    /// Mark a task cancelled and cancel everything downstream of it.
    ///
    /// Returns an empty list when the task has already finished.
    pub fn mark_cancelled(&self, task_id: &str) -> Result<Vec<TaskId>> {
        let mut inner = self.inner.lock();
        if !inner.graph.contains(task_id) {
            return Err(EngineError::TaskNotFound(task_id.to_string()));
        }
        if let Some(state) = inner.states.get(task_id).filter(|s| s.is_terminal()) {
            debug!(task_id = %task_id, state = %state, "Ignoring cancel of finished task");
            return Ok(Vec::new());
        }
        inner
            .states
            .insert(task_id.to_string(), TaskState::Cancelled);
        Ok(Self::cancel_dependents(&mut inner, task_id))
    }

    fn cancel_dependents(inner: &mut ResolverState, task_id: &str) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        for dependent in inner.graph.transitive_dependents(task_id) {
            let state = inner.states.get(&dependent).copied();
            if state.map(|s| s.is_terminal()).unwrap_or(false) {
                continue;
            }
            inner
                .states
                .insert(dependent.clone(), TaskState::Cancelled);
            cancelled.push(dependent);
        }
        if !cancelled.is_empty() {
            warn!(task_id = %task_id, cancelled = ?cancelled, "Cancelled downstream tasks");
        }
        cancelled
    }

    /// Record that a Ready task was handed out for execution
    pub fn mark_running(&self, task_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.states.get_mut(task_id) {
            if *state == TaskState::Ready {
                *state = TaskState::Running;
            }
        }
    }

    /// Record that a Running task went back to the ready queue
    pub fn mark_requeued(&self, task_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.states.get_mut(task_id) {
            if *state == TaskState::Running {
                *state = TaskState::Ready;
            }
        }
    }

    pub fn state(&self, task_id: &str) -> Option<TaskState> {
        self.inner.lock().states.get(task_id).copied()
    }

    /// Direct dependents, ascending by id
    pub fn dependents(&self, task_id: &str) -> Vec<TaskId> {
        self.inner.lock().graph.dependents(task_id).cloned().collect()
    }

    pub fn topological_order(&self) -> Vec<TaskId> {
        self.inner.lock().graph.topological_order()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}
