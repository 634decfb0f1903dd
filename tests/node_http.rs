//! The HTTP transport against a live node server on a loopback port.

use import_engine::dispatch::HttpTransport;
use import_engine::node::{build_router, ExecuteRequest, NodeServer};
use import_engine::{
    EngineError, HandlerRegistry, NodeConfig, NodeHealth, NodeTransport, TaskContext, TaskOutcome,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

async fn spawn_node() -> HttpTransport {
    let mut handlers = HandlerRegistry::new();
    handlers
        .register_fn("import", |ctx: TaskContext| async move {
            Ok(json!({"id": ctx.task_id}))
        })
        .register_fn("broken", |_ctx: TaskContext| async move {
            Err::<Value, _>(anyhow::anyhow!("malformed header row"))
        })
        .register_fn("slow", |_ctx: TaskContext| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        });
    let server = NodeServer::new(
        NodeConfig::new("remote-1", "127.0.0.1", 0).with_max_workers(2),
        handlers,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(Arc::new(server));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    HttpTransport::new("remote-1", format!("http://{}", addr))
        .with_status_poll(Duration::from_millis(10))
}

fn request(task_id: &str, task_type: &str) -> ExecuteRequest {
    ExecuteRequest {
        task_id: task_id.to_string(),
        task_type: task_type.to_string(),
        task_data: json!({"rows": 3}),
        priority: 0,
        timeout: Some(60),
        kind: None,
    }
}

#[tokio::test]
async fn health_and_execute_round_trip() {
    let transport = spawn_node().await;

    let health = transport.health().await.unwrap();
    assert_eq!(health.status, NodeHealth::Healthy);
    assert_eq!(health.load, 0);
    assert_eq!(health.capacity, 2);

    let outcome = transport.execute(request("t1", "import")).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Success(json!({"id": "t1"})));
}

#[tokio::test]
async fn handler_error_comes_back_as_failure() {
    let transport = spawn_node().await;
    match transport.execute(request("t2", "broken")).await.unwrap() {
        TaskOutcome::Failure(message) => assert!(message.contains("malformed header row")),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn rejected_task_is_a_failover_error() {
    let transport = spawn_node().await;
    let err = transport
        .execute(request("t3", "reindex"))
        .await
        .unwrap_err();
    assert!(err.is_failover());
    assert!(err.to_string().contains("no handler"));
}

#[tokio::test]
async fn remote_cancel_stops_running_task() {
    let transport = Arc::new(spawn_node().await);
    let running = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.execute(request("long", "slow")).await })
    };

    for _ in 0..100 {
        if transport.health().await.unwrap().load == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(transport.health().await.unwrap().load, 1);

    assert!(transport.cancel("long").await.unwrap());
    assert!(!transport.cancel("long").await.unwrap());
    assert!(!transport.cancel("never-sent").await.unwrap());

    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(EngineError::Cancelled { ref task_id }) if task_id == "long"));
}
