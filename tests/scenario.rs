//! End-to-end fleet scenarios: server control plane plus device agents on
//! separate store links

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use fleet_gateway::api::{self, ApiState};
use fleet_gateway::db::{self, WatermarkRepo};
use fleet_gateway::identity::DeviceIdentity;
use fleet_gateway::{
    CommandKind, DeviceAgent, DeviceStatus, MemoryStore, SharedStore, Telemetry, Watermark,
};
use serde_json::Value;
use tower::ServiceExt;

mod common;
use common::{RecordingHandler, assert_no_command, eventually, next_command, start_control};

fn identity(device_id: &str) -> DeviceIdentity {
    DeviceIdentity {
        device_id: device_id.to_string(),
        ..DeviceIdentity::generate("test-host")
    }
}

fn request_as(device_id: &str) -> Request<Body> {
    Request::builder()
        .uri("/api/status")
        .header("x-device-id", device_id)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn a1b2_block_unblock_and_broadcast() {
    let server = MemoryStore::new();
    let control = start_control(&server).await;
    let app = api::router(Arc::new(ApiState {
        control: Arc::clone(&control),
        api_key: None,
    }));
    let registry = control.registry();

    // Unknown device, absent from the listing
    assert!(registry.list().await.unwrap().is_empty());

    // One request registers it as active
    let response = app.clone().oneshot(request_as("a1b2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    eventually(|| {
        let registry = registry.clone();
        async move { registry.list().await.unwrap().len() == 1 }
    })
    .await;
    let devices = registry.list().await.unwrap();
    assert_eq!(devices[0].id, "a1b2");
    assert_eq!(devices[0].status, DeviceStatus::Active);

    // Block it; the next request is refused
    registry
        .set_status("a1b2", DeviceStatus::Blocked, Some("policy"))
        .await
        .unwrap();
    let gate = Arc::clone(control.gate());
    eventually(|| {
        let gate = Arc::clone(&gate);
        async move { gate.is_blocked("a1b2") }
    })
    .await;

    let response = app.clone().oneshot(request_as("a1b2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = serde_json::from_slice(
        &axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(body["code"], "DEVICE_BLOCKED");
    assert_eq!(body["deviceId"], "a1b2...");

    // The device comes up and picks up the pending block notice
    let link = server.attach();
    let (handler, mut rx) = RecordingHandler::new();
    let agent = DeviceAgent::start(
        Arc::new(link.clone()),
        identity("a1b2"),
        handler,
        Arc::new(Watermark::in_memory("a1b2")),
        Telemetry::new(),
    )
    .await
    .unwrap();

    let notice = next_command(&mut rx).await;
    assert_eq!(notice.kind, CommandKind::BlockDevice);
    assert_eq!(notice.payload_text(), Some("policy"));

    // Unblock
    registry
        .set_status("a1b2", DeviceStatus::Active, None)
        .await
        .unwrap();
    assert_eq!(next_command(&mut rx).await.kind, CommandKind::UnblockDevice);
    eventually(|| {
        let gate = Arc::clone(&gate);
        async move { !gate.is_blocked("a1b2") }
    })
    .await;
    let response = app.clone().oneshot(request_as("a1b2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Broadcast while the device is offline runs once on reconnect
    link.set_online(false);
    control
        .bus()
        .send_broadcast(CommandKind::RestartApp, Value::Null)
        .await
        .unwrap();
    assert_no_command(&mut rx).await;

    link.set_online(true);
    assert_eq!(next_command(&mut rx).await.kind, CommandKind::RestartApp);
    assert_no_command(&mut rx).await;

    // Another reconnect replays nothing
    link.set_online(false);
    link.set_online(true);
    assert_no_command(&mut rx).await;

    agent.shutdown().await;
    control.shutdown();
}

#[tokio::test]
async fn broadcast_watermark_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("fleet.db");

    let server = MemoryStore::new();
    let control = start_control(&server).await;
    control
        .bus()
        .send_broadcast(CommandKind::UpdateIcons, Value::Null)
        .await
        .unwrap();

    let open = || {
        let pool = db::init(&db_path).unwrap();
        Arc::new(Watermark::load("dev_restart", WatermarkRepo::new(pool)).unwrap())
    };

    let (handler, mut rx) = RecordingHandler::new();
    let first = DeviceAgent::start(
        Arc::new(server.attach()),
        identity("dev_restart"),
        handler,
        open(),
        Telemetry::new(),
    )
    .await
    .unwrap();
    assert_eq!(next_command(&mut rx).await.kind, CommandKind::UpdateIcons);
    first.shutdown().await;

    // Same device, new process: the stored broadcast is not repeated
    let (handler, mut rx) = RecordingHandler::new();
    let second = DeviceAgent::start(
        Arc::new(server.attach()),
        identity("dev_restart"),
        handler,
        open(),
        Telemetry::new(),
    )
    .await
    .unwrap();
    assert_no_command(&mut rx).await;

    control
        .bus()
        .send_broadcast(CommandKind::RefreshTools, Value::Null)
        .await
        .unwrap();
    assert_eq!(next_command(&mut rx).await.kind, CommandKind::RefreshTools);

    second.shutdown().await;
    control.shutdown();
}

#[tokio::test]
async fn broadcast_reaches_every_device_once() {
    let server = MemoryStore::new();
    let control = start_control(&server).await;

    let mut agents = Vec::new();
    let mut receivers = Vec::new();
    for id in ["dev_a", "dev_b", "dev_c"] {
        let (handler, rx) = RecordingHandler::new();
        let agent = DeviceAgent::start(
            Arc::new(server.attach()),
            identity(id),
            handler,
            Arc::new(Watermark::in_memory(id)),
            Telemetry::new(),
        )
        .await
        .unwrap();
        agents.push(agent);
        receivers.push(rx);
    }

    control
        .bus()
        .send_broadcast(CommandKind::RefreshTools, Value::Null)
        .await
        .unwrap();

    for rx in &mut receivers {
        assert_eq!(next_command(rx).await.kind, CommandKind::RefreshTools);
        assert_no_command(rx).await;
    }

    // Every device acknowledged
    eventually(|| {
        let server = server.clone();
        async move {
            server
                .get("commands/responses")
                .await
                .unwrap()
                .and_then(|v| v.as_object().map(serde_json::Map::len))
                == Some(3)
        }
    })
    .await;

    for agent in agents {
        agent.shutdown().await;
    }
    control.shutdown();
}

#[tokio::test]
async fn targeted_commands_stay_with_their_device() {
    let server = MemoryStore::new();
    let control = start_control(&server).await;

    let (handler_a, mut rx_a) = RecordingHandler::new();
    let (handler_b, mut rx_b) = RecordingHandler::new();
    let a = DeviceAgent::start(
        Arc::new(server.attach()),
        identity("dev_a"),
        handler_a,
        Arc::new(Watermark::in_memory("dev_a")),
        Telemetry::new(),
    )
    .await
    .unwrap();
    let b = DeviceAgent::start(
        Arc::new(server.attach()),
        identity("dev_b"),
        handler_b,
        Arc::new(Watermark::in_memory("dev_b")),
        Telemetry::new(),
    )
    .await
    .unwrap();

    control
        .bus()
        .send_targeted("dev_a", CommandKind::RestartApp, Value::Null)
        .await
        .unwrap();

    assert_eq!(next_command(&mut rx_a).await.kind, CommandKind::RestartApp);
    assert_no_command(&mut rx_b).await;

    a.shutdown().await;
    b.shutdown().await;
    control.shutdown();
}

#[tokio::test]
async fn pending_targeted_command_is_replaced_before_delivery() {
    let server = MemoryStore::new();
    let control = start_control(&server).await;
    let link = server.attach();

    let (handler, mut rx) = RecordingHandler::new();
    let agent = DeviceAgent::start(
        Arc::new(link.clone()),
        identity("dev1"),
        handler,
        Arc::new(Watermark::in_memory("dev1")),
        Telemetry::new(),
    )
    .await
    .unwrap();

    link.set_online(false);
    let bus = control.bus();
    bus.send_targeted("dev1", CommandKind::RefreshTools, Value::Null)
        .await
        .unwrap();
    bus.send_targeted("dev1", CommandKind::RestartApp, Value::Null)
        .await
        .unwrap();
    link.set_online(true);

    assert_eq!(next_command(&mut rx).await.kind, CommandKind::RestartApp);
    assert_no_command(&mut rx).await;

    agent.shutdown().await;
    control.shutdown();
}
