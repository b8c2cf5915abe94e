//! HTTP and WebSocket surface tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

use wd_core::config::ServerConfig;
use wd_core::store::{InstanceStore, MemoryStore};
use wd_core::InstanceId;
use wd_server::{http, ControlPlane};

use common::{eventually, ScriptedSpawner, UnreachableConnector};

fn plane_with(config: ServerConfig) -> (ControlPlane, ScriptedSpawner) {
    let spawner = ScriptedSpawner::default();
    let plane = ControlPlane::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(spawner.clone()),
        Arc::new(UnreachableConnector),
    );
    plane.start();
    (plane, spawner)
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            request = request.header("content-type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let (plane, _) = plane_with(ServerConfig::default());
    let app = http::router(plane);

    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
}

#[tokio::test]
async fn test_instance_lifecycle() {
    let (plane, spawner) = plane_with(ServerConfig::default());
    let app = http::router(plane.clone());
    let id = InstanceId::new("i1");

    let (status, body) = call(
        &app,
        Method::POST,
        "/instances",
        Some(json!({ "id": "i1", "name": "api", "workingDir": "/srv/api" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], "i1");
    assert_eq!(body["status"], "idle");
    assert!(plane.terminals().has(&id));

    let (status, _) = call(
        &app,
        Method::POST,
        "/instances",
        Some(json!({ "id": "i1", "workingDir": "/srv/api" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(spawner.spawned(), 1);

    let (status, list) = call(&app, Method::GET, "/instances", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, _) = call(&app, Method::DELETE, "/instances/i1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    eventually("session gone", || !plane.terminals().has(&id)).await;
    assert!(plane.store().get(&id).await.unwrap().is_none());

    let (status, _) = call(&app, Method::DELETE, "/instances/i1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_remote_instance_with_unreachable_machine_is_rolled_back() {
    let (plane, spawner) = plane_with(ServerConfig::default());
    let app = http::router(plane.clone());

    let (status, body) = call(
        &app,
        Method::POST,
        "/instances",
        Some(json!({
            "id": "r1",
            "workingDir": "/home/dev",
            "machine": { "kind": "remote", "machineId": "gpu-box" }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].as_str().unwrap().contains("gpu-box"));
    assert_eq!(spawner.spawned(), 0);
    assert!(plane
        .store()
        .get(&InstanceId::new("r1"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_hooks_drive_status() {
    let (plane, _) = plane_with(ServerConfig::default());
    let app = http::router(plane.clone());
    call(
        &app,
        Method::POST,
        "/instances",
        Some(json!({ "id": "i1", "workingDir": "/srv" })),
    )
    .await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/hooks/i1",
        Some(json!({ "hook_event_name": "UserPromptSubmit", "session_id": "abc" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "previous": "idle", "status": "working", "changed": true }));

    let (status, body) = call(
        &app,
        Method::POST,
        "/hooks/i1",
        Some(json!({ "status": "idle" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "idle");

    let (status, _) = call(&app, Method::POST, "/hooks/i1", Some(json!({ "status": "asleep" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, Method::POST, "/hooks/ghost", Some(json!({ "status": "idle" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, report) = call(&app, Method::GET, "/instances/i1/conflicts", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["transitions"].as_array().unwrap().len(), 2);
    assert_eq!(report["count"], 1);
}

#[tokio::test]
async fn test_tunnel_routes() {
    let (plane, _) = plane_with(ServerConfig::default());
    let app = http::router(plane);

    let (status, body) = call(&app, Method::GET, "/tunnels", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, _) = call(&app, Method::GET, "/tunnels/gpu-box", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, Method::POST, "/tunnels/gpu-box/reconnect", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_projects_are_listed_from_configured_dir() {
    let projects = tempfile::tempdir().unwrap();
    let folder = projects.path().join("-definitely-not-a-real-dir");
    std::fs::create_dir(&folder).unwrap();
    std::fs::write(folder.join("one.jsonl"), "{}\n").unwrap();
    std::fs::write(folder.join("notes.txt"), "skip").unwrap();

    let config = ServerConfig {
        projects_dir: Some(projects.path().to_path_buf()),
        ..ServerConfig::default()
    };
    let (plane, _) = plane_with(config);
    let app = http::router(plane);

    let (status, body) = call(&app, Method::GET, "/projects", None).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["encoded"], "-definitely-not-a-real-dir");
    assert_eq!(entries[0]["sessionCount"], 1);
    assert_eq!(entries[0]["decoded"]["verified"], false);
}

#[tokio::test]
async fn test_websocket_viewer_over_loopback() {
    let (plane, spawner) = plane_with(ServerConfig::default());
    plane
        .create_instance(serde_json::from_value(json!({ "id": "i1", "workingDir": "/srv" })).unwrap())
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = http::router(plane.clone());
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();

    async fn next_json<S>(socket: &mut S) -> Value
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), socket.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    let hello = next_json(&mut socket).await;
    assert_eq!(hello["type"], "connected");
    assert!(hello["connectionId"].is_string());

    socket
        .send(Message::Text("definitely not json".to_string()))
        .await
        .unwrap();
    let error = next_json(&mut socket).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "invalid_message");

    socket
        .send(Message::Text(
            json!({ "type": "subscribe", "instanceId": "i1" }).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(next_json(&mut socket).await["type"], "lockGranted");

    spawner.emit(&InstanceId::new("i1"), b"hello").await;
    let data = next_json(&mut socket).await;
    assert_eq!(data["type"], "data");
    assert_eq!(data["data"], json!(b"hello".to_vec()));

    plane
        .handle_hook(&InstanceId::new("i1"), "SessionEnd".parse().unwrap())
        .await
        .unwrap();
    loop {
        let frame = next_json(&mut socket).await;
        if frame["type"] == "status:changed" && frame["source"] == "hook" {
            assert_eq!(frame["status"], "disconnected");
            assert_eq!(frame["instanceId"], "i1");
            break;
        }
    }

    socket.close(None).await.unwrap();
    eventually("viewer disconnected", || {
        plane.gateway().connection_count() == 0
    })
    .await;
    server.abort();
}
