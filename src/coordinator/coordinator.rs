use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheCoordinator, CacheMetrics};
use crate::coordinator::events::{EngineEvent, EventBus, Subscription, SubscriptionId};
use crate::core::config::EngineConfig;
use crate::core::errors::{EngineError, Result};
use crate::core::model::{NodeId, Task, TaskId, TaskOutcome, TaskSpec, TaskState};
use crate::dispatch::{
    DispatchOutcome, Dispatcher, HeartbeatMonitor, HttpTransport, LocalTransport, Node, NodeConfig,
    NodeRegistry, NodeTransport,
};
use crate::handler::HandlerRegistry;
use crate::node::protocol::ExecuteRequest;
use crate::resolver::DependencyResolver;
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::storage::{
    ConnectionFactory, ConnectionPoolManager, PoolState, PoolStats, SledConnectionFactory,
};

/// Adjusts a task's priority at submission time
pub trait PriorityScorer: Send + Sync {
    fn score(&self, task: &Task) -> i32;
}

/// Keeps the submitted priority
pub struct PassthroughScorer;

impl PriorityScorer for PassthroughScorer {
    fn score(&self, task: &Task) -> i32 {
        task.priority()
    }
}

/// Optional collaborators for [`ExecutionCoordinator::with_parts`]
pub struct CoordinatorParts {
    pub factory: Arc<dyn ConnectionFactory>,
    /// Transports for configured remote nodes; nodes without one get an HTTP transport
    pub transports: HashMap<NodeId, Arc<dyn NodeTransport>>,
    pub scorer: Arc<dyn PriorityScorer>,
}

impl CoordinatorParts {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            transports: HashMap::new(),
            scorer: Arc::new(PassthroughScorer),
        }
    }

    pub fn with_transport(mut self, node_id: impl Into<NodeId>, transport: Arc<dyn NodeTransport>) -> Self {
        self.transports.insert(node_id.into(), transport);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn PriorityScorer>) -> Self {
        self.scorer = scorer;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub tasks: TaskCounts,
    /// Ready tasks waiting for room in the ready queue
    pub backlog: usize,
    pub scheduler: SchedulerStats,
    pub cache: CacheMetrics,
    pub pool: PoolStats,
    pub nodes: Vec<Node>,
}

struct CoordinatorInner {
    config: EngineConfig,
    tasks: RwLock<HashMap<TaskId, Task>>,
    resolver: DependencyResolver,
    scheduler: Arc<Scheduler>,
    registry: Arc<NodeRegistry>,
    dispatcher: Arc<Dispatcher>,
    cache: Arc<CacheCoordinator>,
    pool: ConnectionPoolManager,
    events: Arc<EventBus>,
    scorer: Arc<dyn PriorityScorer>,
    /// Ready tasks that did not fit in the ready queue
    backlog: Mutex<VecDeque<TaskId>>,
    /// Tasks whose dispatch future is still running
    dispatching: DashSet<TaskId>,
    /// Bumped whenever a task reaches a terminal state
    completions: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
}

/// Owns every task and drives it from submission to a terminal state.
pub struct ExecutionCoordinator {
    inner: Arc<CoordinatorInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionCoordinator {
    /// Start an engine backed by a sled store, with HTTP transports for remote nodes
    pub async fn start(config: EngineConfig, handlers: HandlerRegistry) -> Result<Self> {
        let factory = Arc::new(SledConnectionFactory::new(config.pool.tree_name.clone()));
        Self::with_parts(config, handlers, CoordinatorParts::new(factory)).await
    }

    pub async fn with_parts(
        config: EngineConfig,
        handlers: HandlerRegistry,
        parts: CoordinatorParts,
    ) -> Result<Self> {
        config.validate()?;
        let CoordinatorParts {
            factory,
            mut transports,
            scorer,
        } = parts;
        let events = Arc::new(EventBus::new());
        let mut handles = Vec::new();

        let pool = ConnectionPoolManager::new(config.pool.clone(), factory);
        handles.push(spawn_pool_watcher(&pool, events.clone()));
        let pool_state = pool.initialize(config.pool.target_size).await?;
        if pool_state != PoolState::Ready {
            warn!(
                state = %pool_state,
                path = %config.pool.store_path.display(),
                "Store unavailable, continuing without persistence"
            );
        }
        let cache = Arc::new(CacheCoordinator::new(config.cache.clone(), pool.clone()));

        let registry = Arc::new(NodeRegistry::new(config.health.clone()));
        let scheduler = Arc::new(
            Scheduler::new(config.scheduler.queue_capacity, registry.clone())
                .with_tie_break(config.scheduler.tie_break),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            config.dispatch.clone(),
            events.clone(),
        ));

        if config.local_workers > 0 {
            let local = LocalTransport::new(
                config.local_node_id.clone(),
                config.local_workers,
                Arc::new(handlers),
            )
            .with_cache(cache.clone());
            registry.register(Node::local(config.local_node_id.clone(), config.local_workers));
            dispatcher.add_transport(config.local_node_id.clone(), Arc::new(local));
        }
        for node in &config.remote_nodes {
            let transport: Arc<dyn NodeTransport> = match transports.remove(&node.node_id) {
                Some(transport) => transport,
                None => Arc::new(HttpTransport::new(node.node_id.clone(), node.base_url())),
            };
            registry.register(Node::from_config(node));
            dispatcher.add_transport(node.node_id.clone(), transport);
        }

        let (completions, _) = watch::channel(0u64);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(CoordinatorInner {
            config,
            tasks: RwLock::new(HashMap::new()),
            resolver: DependencyResolver::new(),
            scheduler: scheduler.clone(),
            registry,
            dispatcher: dispatcher.clone(),
            cache,
            pool,
            events,
            scorer,
            backlog: Mutex::new(VecDeque::new()),
            dispatching: DashSet::new(),
            completions,
            shutdown,
        });

        handles.push(tokio::spawn(inner.clone().run_dispatch_loop(shutdown_rx.clone())));
        let monitor = HeartbeatMonitor::new(dispatcher, scheduler);
        handles.push(tokio::spawn(monitor.run(shutdown_rx)));

        info!(
            local_workers = inner.config.local_workers,
            remote_nodes = inner.config.remote_nodes.len(),
            pool = %pool_state,
            "Execution coordinator started"
        );
        Ok(Self {
            inner,
            handles: Mutex::new(handles),
        })
    }

    pub fn submit(&self, spec: TaskSpec) -> Result<TaskId> {
        let mut ids = self.submit_batch(vec![spec])?;
        ids.pop()
            .ok_or_else(|| EngineError::internal("empty submission result"))
    }

    /// Submit tasks atomically; dependencies may point at earlier tasks or into the batch
    pub fn submit_batch(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskId>> {
        self.inner.submit_batch(specs)
    }

    /// Cancel a task and everything downstream of it.
    ///
    /// Returns false if the task had already finished.
    pub fn cancel(&self, task_id: &str) -> Result<bool> {
        self.inner.cancel(task_id)
    }

    /// Snapshot of a task
    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.inner.tasks.read().get(task_id).cloned()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.inner.tasks.read().values().cloned().collect()
    }

    /// Wait until the task reaches a terminal state
    pub async fn wait_for_task(&self, task_id: &str, timeout: Duration) -> Result<Task> {
        let mut completions = self.inner.completions.subscribe();
        let wait = async {
            loop {
                match self.task(task_id) {
                    None => return Err(EngineError::TaskNotFound(task_id.to_string())),
                    Some(task) if task.state().is_terminal() => return Ok(task),
                    Some(_) => {}
                }
                if completions.changed().await.is_err() {
                    return Err(EngineError::internal("coordinator stopped"));
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout {
                task_id: task_id.to_string(),
                node_id: self
                    .inner
                    .dispatcher
                    .assigned_node(task_id)
                    .unwrap_or_default(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Register a remote node reached over HTTP, or refresh a known one
    pub fn register_node(&self, config: NodeConfig) -> Result<()> {
        let transport = Arc::new(HttpTransport::new(config.node_id.clone(), config.base_url()));
        self.register_node_with(config, transport)
    }

    pub fn register_node_with(&self, config: NodeConfig, transport: Arc<dyn NodeTransport>) -> Result<()> {
        config.validate()?;
        let inner = &self.inner;
        inner
            .dispatcher
            .add_transport(config.node_id.clone(), transport);
        if !inner.registry.register(Node::from_config(&config)) {
            // Re-registration doubles as a heartbeat
            let transition = inner.registry.heartbeat(
                &config.node_id,
                Some(config.max_workers),
                chrono::Utc::now(),
            );
            inner.dispatcher.publish_transition(transition);
        }
        inner.scheduler.notify_capacity();
        Ok(())
    }

    pub fn deregister_node(&self, node_id: &str) -> bool {
        let removed = self.inner.registry.deregister(node_id).is_some();
        self.inner.dispatcher.remove_transport(node_id);
        removed
    }

    /// Record a heartbeat pushed by a known node.
    ///
    /// Unknown nodes announce themselves through [`register_node`](Self::register_node),
    /// which also counts as a heartbeat for a node that is already registered.
    pub fn heartbeat(&self, node_id: &str, capacity: Option<usize>) -> Result<()> {
        let inner = &self.inner;
        if !inner.registry.contains(node_id) {
            return Err(EngineError::configuration(format!(
                "heartbeat from unregistered node {}",
                node_id
            )));
        }
        let transition = inner
            .registry
            .heartbeat(node_id, capacity, chrono::Utc::now());
        if transition.is_some() {
            inner.scheduler.notify_capacity();
        }
        inner.dispatcher.publish_transition(transition);
        Ok(())
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    pub fn cache(&self) -> Arc<CacheCoordinator> {
        self.inner.cache.clone()
    }

    pub fn registry(&self) -> Arc<NodeRegistry> {
        self.inner.registry.clone()
    }

    /// Dependency order of every submitted task
    pub fn topological_order(&self) -> Vec<TaskId> {
        self.inner.resolver.topological_order()
    }

    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        let mut tasks = TaskCounts::default();
        for task in inner.tasks.read().values() {
            match task.state() {
                TaskState::Pending => tasks.pending += 1,
                TaskState::Ready => tasks.ready += 1,
                TaskState::Running => tasks.running += 1,
                TaskState::Succeeded => tasks.succeeded += 1,
                TaskState::Failed => tasks.failed += 1,
                TaskState::Cancelled => tasks.cancelled += 1,
            }
        }
        EngineStats {
            tasks,
            backlog: inner.backlog.lock().len(),
            scheduler: inner.scheduler.stats(),
            cache: inner.cache.metrics(),
            pool: inner.pool.stats(),
            nodes: inner.registry.snapshot(),
        }
    }

    /// Stop the background loops, interrupt running tasks and close the pool
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }

        let running: Vec<TaskId> = inner.dispatching.iter().map(|id| id.key().clone()).collect();
        for task_id in running {
            inner.dispatcher.interrupt(&task_id);
        }
        inner.pool.close().await;
        info!("Execution coordinator stopped");
    }
}

impl CoordinatorInner {
    fn submit_batch(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskId>> {
        let mut tasks: Vec<Task> = specs.into_iter().map(Task::from_spec).collect();
        for task in tasks.iter_mut() {
            let priority = self.scorer.score(task);
            task.set_priority(priority);
        }
        self.resolver.submit_batch(&mut tasks)?;

        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id().to_string()).collect();
        {
            let mut table = self.tasks.write();
            for mut task in tasks {
                // Readiness is applied below so a concurrent promotion is not lost
                task.set_state(TaskState::Pending);
                table.insert(task.id().to_string(), task);
            }
        }
        for id in &ids {
            self.events.publish(EngineEvent::TaskSubmitted {
                task_id: id.clone(),
            });
        }
        for id in &ids {
            match self.resolver.state(id) {
                Some(TaskState::Ready) => self.make_ready(id),
                Some(TaskState::Cancelled) => {
                    self.mark_cancelled(id);
                }
                _ => {}
            }
        }
        debug!(count = ids.len(), "Tasks submitted");
        Ok(ids)
    }

    fn cancel(&self, task_id: &str) -> Result<bool> {
        let state = self
            .tasks
            .read()
            .get(task_id)
            .map(|task| task.state())
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        if state.is_terminal() {
            return Ok(false);
        }

        // The task table decides the race with finish_task; the loser leaves the resolver alone
        if !self.mark_cancelled(task_id) {
            return Ok(false);
        }
        // A Ready task may have been launched since the state was read
        self.dispatcher.interrupt(task_id);
        for dependent in self.resolver.mark_cancelled(task_id)? {
            self.mark_cancelled(&dependent);
        }
        info!(task_id = %task_id, "Task cancelled");
        Ok(true)
    }

    /// Pending -> Ready, then into the ready queue or the backlog
    fn make_ready(&self, task_id: &str) {
        let priority = {
            let mut tasks = self.tasks.write();
            match tasks.get_mut(task_id) {
                Some(task) if task.state() == TaskState::Pending => {
                    task.set_state(TaskState::Ready);
                    task.priority()
                }
                _ => return,
            }
        };
        self.events.publish(EngineEvent::TaskReady {
            task_id: task_id.to_string(),
        });
        if let Err(e) = self.scheduler.enqueue(task_id, priority) {
            warn!(task_id = %task_id, error = %e, "Ready queue full, holding task in backlog");
            self.backlog.lock().push_back(task_id.to_string());
        }
    }

    /// Move a non-terminal task to Cancelled; false if it already finished
    fn mark_cancelled(&self, task_id: &str) -> bool {
        {
            let mut tasks = self.tasks.write();
            match tasks.get_mut(task_id) {
                Some(task) if !task.state().is_terminal() => task.finish(TaskState::Cancelled, None),
                _ => return false,
            }
        }
        self.scheduler.remove(task_id);
        self.events.publish(EngineEvent::TaskCancelled {
            task_id: task_id.to_string(),
        });
        self.completions.send_modify(|n| *n += 1);
        true
    }

    /// Move held-back tasks into the ready queue while it has room
    fn drain_backlog(&self) {
        let held: Vec<TaskId> = self.backlog.lock().drain(..).collect();
        if held.is_empty() {
            return;
        }

        let mut remaining = held.into_iter();
        let mut blocked = None;
        for task_id in remaining.by_ref() {
            let priority = match self.tasks.read().get(&task_id) {
                Some(task) if task.state() == TaskState::Ready => task.priority(),
                _ => continue,
            };
            if self.scheduler.enqueue(&task_id, priority).is_err() {
                blocked = Some(task_id);
                break;
            }
        }

        if let Some(first) = blocked {
            // Keep the original order ahead of anything backlogged meanwhile
            let mut backlog = self.backlog.lock();
            for task_id in remaining.rev() {
                backlog.push_front(task_id);
            }
            backlog.push_front(first);
        }
    }

    async fn run_dispatch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let batch = self.config.scheduler.dispatch_batch;
        let poll = self.config.scheduler.poll_interval;
        info!(batch, poll_ms = poll.as_millis() as u64, "Dispatch loop started");

        loop {
            self.drain_backlog();
            for task_id in self.scheduler.pull(batch) {
                self.clone().launch(task_id);
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.scheduler.wait_for_work() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
        info!("Dispatch loop stopped");
    }

    /// Mark a pulled task Running and hand it to the dispatcher on its own future
    fn launch(self: Arc<Self>, task_id: TaskId) {
        let prepared = {
            let mut tasks = self.tasks.write();
            match tasks.get_mut(&task_id) {
                Some(task) if task.state() == TaskState::Ready => {
                    task.mark_running();
                    let timeout = task
                        .timeout()
                        .unwrap_or_else(|| self.dispatcher.default_timeout());
                    let request = ExecuteRequest {
                        task_id: task_id.clone(),
                        task_type: task.kind().task_type().to_string(),
                        task_data: task.payload().clone(),
                        priority: task.priority(),
                        timeout: Some(timeout.as_secs().max(1)),
                        kind: Some(task.kind().clone()),
                    };
                    Some((request, task.attempts(), timeout))
                }
                _ => None,
            }
        };
        let Some((request, attempts, timeout)) = prepared else {
            self.scheduler.complete(&task_id);
            return;
        };
        self.resolver.mark_running(&task_id);
        self.dispatching.insert(task_id.clone());

        tokio::spawn(async move {
            let outcome = self.dispatcher.dispatch(request, attempts, timeout).await;
            self.handle_outcome(&task_id, outcome).await;
            self.dispatching.remove(&task_id);
        });
    }

    async fn handle_outcome(&self, task_id: &str, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Completed {
                node_id,
                outcome,
                attempts,
            } => {
                let state = if outcome.is_success() {
                    TaskState::Succeeded
                } else {
                    TaskState::Failed
                };
                self.finish_task(task_id, state, outcome, Some(node_id), attempts)
                    .await;
                // Only now may the slot count towards another task
                self.scheduler.complete(task_id);
            }
            DispatchOutcome::Requeue { reason, attempts } => {
                let priority = {
                    let mut tasks = self.tasks.write();
                    match tasks.get_mut(task_id) {
                        Some(task) if task.state() == TaskState::Running => {
                            task.mark_requeued(attempts);
                            Some(task.priority())
                        }
                        _ => None,
                    }
                };
                let Some(priority) = priority else {
                    self.scheduler.complete(task_id);
                    return;
                };
                self.resolver.mark_requeued(task_id);
                self.scheduler.requeue(task_id, priority);
                self.events.publish(EngineEvent::TaskRequeued {
                    task_id: task_id.to_string(),
                    reason: reason.to_string(),
                });
            }
            DispatchOutcome::Exhausted(err) => {
                let attempts = match &err {
                    EngineError::DispatchExhausted { attempts, .. } => *attempts,
                    _ => 0,
                };
                self.finish_task(
                    task_id,
                    TaskState::Failed,
                    TaskOutcome::Failure(err.to_string()),
                    None,
                    attempts,
                )
                .await;
                self.scheduler.complete(task_id);
            }
            DispatchOutcome::Cancelled { .. } => {
                self.scheduler.complete(task_id);
                debug!(task_id = %task_id, "Dispatch ended by cancellation");
            }
        }
    }

    /// Record the outcome, persist it, then settle dependents
    async fn finish_task(
        &self,
        task_id: &str,
        state: TaskState,
        outcome: TaskOutcome,
        node_id: Option<NodeId>,
        attempts: u32,
    ) {
        let record = {
            let mut tasks = self.tasks.write();
            let Some(task) = tasks.get_mut(task_id) else {
                return;
            };
            if task.state() != TaskState::Running {
                // Cancelled while the dispatch was in flight
                return;
            }
            if let Some(node_id) = &node_id {
                task.assign(node_id.clone(), attempts);
            }
            task.finish(state, Some(outcome.clone()));
            task.clone()
        };

        if self.config.persist_task_records {
            if let Err(e) = self.persist(&record).await {
                warn!(task_id = %task_id, error = %e, "Could not persist task record");
            }
        }

        match &outcome {
            TaskOutcome::Success(_) => {
                info!(task_id = %task_id, node_id = ?node_id, "Task succeeded");
                self.events.publish(EngineEvent::TaskSucceeded {
                    task_id: task_id.to_string(),
                    node_id: node_id.unwrap_or_default(),
                });
            }
            TaskOutcome::Failure(message) => {
                error!(task_id = %task_id, node_id = ?node_id, error = %message, "Task failed");
                self.events.publish(EngineEvent::TaskFailed {
                    task_id: task_id.to_string(),
                    error: message.clone(),
                });
            }
        }

        match self.resolver.mark_completed(task_id, &outcome) {
            Ok(effects) => {
                for ready in effects.ready {
                    self.make_ready(&ready);
                }
                for cancelled in effects.cancelled {
                    self.mark_cancelled(&cancelled);
                }
            }
            Err(e) => error!(task_id = %task_id, error = %e, "Resolver rejected completion"),
        }
        self.completions.send_modify(|n| *n += 1);
    }

    async fn persist(&self, task: &Task) -> Result<()> {
        let value = serde_json::to_value(task)?;
        self.cache.put(&format!("task/{}", task.id()), value).await
    }
}

fn spawn_pool_watcher(pool: &ConnectionPoolManager, events: Arc<EventBus>) -> JoinHandle<()> {
    let mut states = pool.watch_state();
    tokio::spawn(async move {
        let mut previous = *states.borrow_and_update();
        while states.changed().await.is_ok() {
            let next = *states.borrow_and_update();
            if next != previous {
                events.publish(EngineEvent::PoolStateChanged {
                    from: previous,
                    to: next,
                });
                previous = next;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::TaskContext;
    use crate::core::model::TaskKind;
    use serde_json::json;

    fn config(dir: &tempfile::TempDir) -> EngineConfig {
        let mut config = EngineConfig::development();
        config.pool.store_path = dir.path().join("store");
        config.pool.target_size = 2;
        config
    }

    fn handlers() -> HandlerRegistry {
        let mut handlers = HandlerRegistry::new();
        handlers
            .register_fn("import", |ctx: TaskContext| async move {
                ctx.write(&format!("rows/{}", ctx.task_id), json!(10)).await?;
                Ok(json!({"rows": 10}))
            })
            .register_fn("fail", |_ctx: TaskContext| async move {
                Err(anyhow::anyhow!("upstream returned 503"))
            })
            .register_fn("slow", |_ctx: TaskContext| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!(null))
            });
        handlers
    }

    fn import(id: &str) -> TaskSpec {
        TaskSpec::new(
            id,
            TaskKind::Import {
                source: "csv".into(),
                dataset: id.into(),
            },
        )
    }

    #[tokio::test]
    async fn test_runs_chain_and_persists_records() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ExecutionCoordinator::start(config(&dir), handlers())
            .await
            .unwrap();

        engine
            .submit_batch(vec![import("a"), import("b").with_dependencies(["a"])])
            .unwrap();
        let b = engine
            .wait_for_task("b", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(b.state(), TaskState::Succeeded);
        assert_eq!(b.assigned_node(), Some("local"));

        let a = engine.task("a").unwrap();
        assert!(a.completed_at().unwrap() <= b.completed_at().unwrap());

        let record = engine.cache().get("task/a").await.unwrap().unwrap();
        assert_eq!(record["state"], json!("succeeded"));
        assert_eq!(engine.cache().get("rows/b").await.unwrap(), Some(json!(10)));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_cancels_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ExecutionCoordinator::start(config(&dir), handlers())
            .await
            .unwrap();

        engine
            .submit_batch(vec![
                TaskSpec::new("bad", TaskKind::Custom { name: "fail".into() }),
                import("after").with_dependencies(["bad"]),
            ])
            .unwrap();
        let after = engine
            .wait_for_task("after", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(after.state(), TaskState::Cancelled);

        let bad = engine.task("bad").unwrap();
        assert_eq!(bad.state(), TaskState::Failed);
        match bad.outcome() {
            Some(TaskOutcome::Failure(message)) => assert!(message.contains("503")),
            other => panic!("unexpected outcome {:?}", other),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.local_workers = 0;
        config.remote_nodes.push(NodeConfig::new("offline", "127.0.0.1", 9));
        let engine = ExecutionCoordinator::start(config, handlers()).await.unwrap();

        engine.submit(import("root")).unwrap();
        engine
            .submit(import("child").with_dependencies(["root"]))
            .unwrap();

        assert!(engine.cancel("root").unwrap());
        assert!(!engine.cancel("root").unwrap());
        assert_eq!(engine.task("child").unwrap().state(), TaskState::Cancelled);
        assert!(matches!(
            engine.cancel("ghost"),
            Err(EngineError::TaskNotFound(_))
        ));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_running_task_frees_slot() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ExecutionCoordinator::start(config(&dir), handlers())
            .await
            .unwrap();

        engine
            .submit_batch(vec![
                TaskSpec::new("s", TaskKind::Custom { name: "slow".into() }),
                import("d").with_dependencies(["s"]),
            ])
            .unwrap();
        for _ in 0..200 {
            if engine.registry().get("local").unwrap().load == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(engine.task("s").unwrap().state(), TaskState::Running);

        assert!(engine.cancel("s").unwrap());
        assert_eq!(engine.task("s").unwrap().state(), TaskState::Cancelled);
        assert_eq!(engine.task("d").unwrap().state(), TaskState::Cancelled);
        assert_eq!(engine.registry().get("local").unwrap().load, 0);

        engine.submit(import("later")).unwrap();
        let later = engine
            .wait_for_task("later", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(later.state(), TaskState::Succeeded);
        // The interrupted run never reports back over the cancellation
        assert_eq!(engine.task("s").unwrap().state(), TaskState::Cancelled);
        assert_eq!(engine.stats().scheduler.in_flight, 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_backlog_drains_in_order_once_queue_has_room() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.local_workers = 1;
        config.scheduler.queue_capacity = 1;
        let engine = ExecutionCoordinator::start(config, handlers()).await.unwrap();

        engine
            .submit(TaskSpec::new("s", TaskKind::Custom { name: "slow".into() }))
            .unwrap();
        for _ in 0..200 {
            if engine.registry().get("local").unwrap().load == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for id in ["q1", "q2", "q3"] {
            engine.submit(import(id)).unwrap();
        }
        let stats = engine.stats();
        assert_eq!(stats.scheduler.queued, 1);
        assert_eq!(stats.backlog, 2);

        // A cancelled backlog entry is dropped rather than enqueued
        assert!(engine.cancel("q2").unwrap());
        assert!(engine.cancel("s").unwrap());

        let q3 = engine
            .wait_for_task("q3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(q3.state(), TaskState::Succeeded);
        let q1 = engine.task("q1").unwrap();
        assert_eq!(q1.state(), TaskState::Succeeded);
        assert!(q1.completed_at().unwrap() <= q3.completed_at().unwrap());
        assert_eq!(engine.task("q2").unwrap().state(), TaskState::Cancelled);
        assert_eq!(engine.stats().backlog, 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeat_requires_registration() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ExecutionCoordinator::start(config(&dir), handlers())
            .await
            .unwrap();

        assert!(matches!(
            engine.heartbeat("edge-1", None),
            Err(EngineError::Configuration { .. })
        ));
        engine
            .register_node(NodeConfig::new("edge-1", "127.0.0.1", 9).with_max_workers(3))
            .unwrap();
        assert_eq!(engine.registry().get("edge-1").unwrap().capacity, 3);

        engine.heartbeat("edge-1", Some(5)).unwrap();
        let node = engine.registry().get("edge-1").unwrap();
        assert_eq!(node.capacity, 5);
        assert!(node.last_heartbeat.is_some());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_priority_scorer_applied() {
        struct Boost;
        impl PriorityScorer for Boost {
            fn score(&self, task: &Task) -> i32 {
                task.priority() + 100
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let parts = CoordinatorParts::new(Arc::new(SledConnectionFactory::new("cache")))
            .with_scorer(Arc::new(Boost));
        let engine = ExecutionCoordinator::with_parts(config(&dir), handlers(), parts)
            .await
            .unwrap();
        engine.submit(import("x").with_priority(5)).unwrap();
        assert_eq!(engine.task("x").unwrap().priority(), 105);
        engine.shutdown().await;
    }
}
