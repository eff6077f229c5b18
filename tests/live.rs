mod common;

use common::{TestServer, client};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, protocol::frame::coding::CloseCode},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(server: &TestServer) -> Socket {
    let (socket, _) = timeout(Duration::from_secs(5), connect_async(server.ws_url("/ws/live")))
        .await
        .expect("connect timeout")
        .expect("connect failed");
    socket
}

async fn send(socket: &mut Socket, message: Value) {
    socket
        .send(Message::Text(message.to_string()))
        .await
        .expect("send");
}

/// Next text frame as JSON. Panics on close or timeout.
async fn recv(socket: &mut Socket) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("receive timeout")
            .expect("stream ended")
            .expect("socket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).expect("json frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {:?}", other),
        }
    }
}

/// Collects frames for `request_id` up to and including its completion.
async fn recv_run(socket: &mut Socket, request_id: &str) -> Vec<Value> {
    let mut frames = Vec::new();
    loop {
        let frame = recv(socket).await;
        if frame["requestId"] != request_id {
            continue;
        }
        let done = frame["type"] == "run_complete";
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

async fn server_with_script(code: &str) -> (TestServer, String, String) {
    let server = TestServer::start().await.expect("server starts");
    let client = client();
    server
        .create_script(
            &client,
            json!({"name": "Scene", "endpoint": "scene", "code": code}),
        )
        .await;
    let (id, secret) = server.create_service_account(&client, "live").await;
    (server, id, secret)
}

async fn authenticated(server: &TestServer, id: &str, secret: &str) -> Socket {
    let mut socket = connect(server).await;
    send(
        &mut socket,
        json!({"type": "auth", "serviceId": id, "serviceSecret": secret}),
    )
    .await;
    let reply = recv(&mut socket).await;
    assert_eq!(reply["type"], "auth_ok");
    assert_eq!(reply["serviceId"], id);
    socket
}

#[tokio::test]
async fn test_ping_pong_without_auth() {
    let (server, _, _) = server_with_script("PRINT 1").await;
    let mut socket = connect(&server).await;

    send(&mut socket, json!({"type": "ping"})).await;
    assert_eq!(recv(&mut socket).await, json!({"type": "pong"}));
}

#[tokio::test]
async fn test_run_before_auth_is_refused() {
    let (server, _, _) = server_with_script("PRINT 1").await;
    let mut socket = connect(&server).await;

    send(&mut socket, json!({"type": "run", "endpoint": "scene"})).await;
    assert_eq!(recv(&mut socket).await["type"], "auth_error");
}

#[tokio::test]
async fn test_run_streams_events_and_state_activity() {
    let (server, id, secret) = server_with_script(
        "REQUIRED $room\nGET sensor.lux AS $lux\nCALL light.turn_on WITH {\"entity_id\": \"light.\" + $room}\nSTATE input_text.last = $room\nPRINT $lux",
    )
    .await;
    server.home_assistant.set("sensor.lux", "300");
    let mut socket = authenticated(&server, &id, &secret).await;

    send(
        &mut socket,
        json!({"type": "run", "endpoint": "scene", "variables": {"room": "den"}, "requestId": "r1"}),
    )
    .await;
    let frames = recv_run(&mut socket, "r1").await;

    assert_eq!(frames.first().unwrap()["type"], "run_started");
    let actions: Vec<&str> = frames
        .iter()
        .filter(|f| f["type"] == "ha_state")
        .map(|f| f["action"].as_str().unwrap())
        .collect();
    assert_eq!(actions, vec!["read", "call", "write"]);
    assert!(frames.iter().any(|f| f["type"] == "run_event" && f["event"]["type"] == "line"));

    let complete = frames.last().unwrap();
    assert_eq!(complete["success"], true);
    assert_eq!(complete["output"], "300");
    assert!(complete["durationMs"].is_u64());

    assert_eq!(server.home_assistant.calls()[0].0, "light.turn_on");
    assert_eq!(server.home_assistant.state("input_text.last").as_deref(), Some("den"));
}

#[tokio::test]
async fn test_failed_run_reports_line() {
    let (server, id, secret) = server_with_script("PRINT 1\nCALL broken.service").await;
    let mut socket = authenticated(&server, &id, &secret).await;

    send(&mut socket, json!({"type": "run", "endpoint": "scene", "requestId": "r1"})).await;
    let frames = recv_run(&mut socket, "r1").await;
    let complete = frames.last().unwrap();
    assert_eq!(complete["success"], false);
    assert_eq!(complete["line"], 2);
    assert_eq!(complete["status"], 502);
}

#[tokio::test]
async fn test_unknown_endpoint_completes_with_failure() {
    let (server, id, secret) = server_with_script("PRINT 1").await;
    let mut socket = authenticated(&server, &id, &secret).await;

    send(&mut socket, json!({"type": "run", "endpoint": "missing", "requestId": "r9"})).await;
    let frame = recv(&mut socket).await;
    assert_eq!(frame["type"], "run_complete");
    assert_eq!(frame["success"], false);
}

#[tokio::test]
async fn test_duplicate_request_id() {
    let (server, id, secret) = server_with_script("PRINT 1").await;
    let mut socket = authenticated(&server, &id, &secret).await;

    send(&mut socket, json!({"type": "run", "endpoint": "scene", "requestId": "same"})).await;
    recv_run(&mut socket, "same").await;

    send(&mut socket, json!({"type": "run", "endpoint": "scene", "requestId": "same"})).await;
    let frame = recv(&mut socket).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["requestId"], "same");
}

#[tokio::test]
async fn test_auth_failures_close_with_rate_limit_code() {
    let server = TestServer::start_with(|config| {
        config.live.auth_failure_max = 2;
    })
    .await
    .unwrap();
    let mut socket = connect(&server).await;
    let bad = json!({"type": "auth", "serviceId": "nobody", "serviceSecret": "wrong"});

    send(&mut socket, bad.clone()).await;
    assert_eq!(recv(&mut socket).await["type"], "auth_error");
    send(&mut socket, bad.clone()).await;
    assert_eq!(recv(&mut socket).await["type"], "auth_error");
    send(&mut socket, bad).await;

    let frame = timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("close timeout")
        .expect("stream ended")
        .expect("socket error");
    match frame {
        Message::Close(Some(close)) => assert_eq!(close.code, CloseCode::from(4429)),
        other => panic!("expected close frame, got {:?}", other),
    }

    // The address stays blocked for new connections
    let mut socket = connect(&server).await;
    let frame = timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("close timeout")
        .expect("stream ended")
        .expect("socket error");
    assert!(matches!(frame, Message::Close(Some(_))));
}
