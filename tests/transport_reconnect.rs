use commandwave_sync::sync::SessionId;
use commandwave_sync::transport::{ConnectionState, Identity, OutboundMessage, Transport, TransportChannel};
use commandwave_sync::ReconnectPolicy;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, accept_hdr_async};

const WAIT: Duration = Duration::from_secs(5);

fn quick_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(100),
        max_attempts: Some(5),
    }
}

fn record(channel: &TransportChannel, event: &'static str, tx: &mpsc::UnboundedSender<(String, Value)>) {
    let tx = tx.clone();
    channel.on(event, move |data| {
        let _ = tx.send((event.to_string(), data.clone()));
    });
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<(String, Value)>) -> (String, Value) {
    timeout(WAIT, rx.recv())
        .await
        .expect("event within timeout")
        .expect("channel open")
}

#[tokio::test]
async fn reconnects_after_server_drops_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let query = Arc::new(Mutex::new(None::<String>));
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();

    let seen_query = query.clone();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept first");
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            *seen_query.lock().expect("lock") = req.uri().query().map(str::to_string);
            Ok(resp)
        };
        let mut ws = accept_hdr_async(stream, callback).await.expect("handshake");
        let created = json!({
            "event": "terminal_created",
            "data": {"terminal_id": "9001", "port": 9001, "name": "Recon"}
        });
        ws.send(Message::Text(created.to_string())).await.expect("send");
        // A lifecycle frame from the server must not reach handlers.
        ws.send(Message::Text(json!({"event": "reconnecting", "data": {"attempt": 99}}).to_string()))
            .await
            .expect("send");
        if let Some(Ok(Message::Text(text))) = ws.next().await {
            let _ = frames_tx.send(text);
        }
        let _ = ws.close(None).await;

        let (stream, _) = listener.accept().await.expect("accept second");
        let mut ws = accept_async(stream).await.expect("handshake");
        while let Some(Ok(message)) = ws.next().await {
            if message.is_close() {
                break;
            }
        }
    });

    let channel = TransportChannel::new(format!("ws://{}/ws", addr), quick_policy());
    let (tx, mut rx) = mpsc::unbounded_channel();
    for event in [
        "connection_established",
        "connection_lost",
        "reconnecting",
        "terminal_created",
    ] {
        record(&channel, event, &tx);
    }
    assert!(!channel.send(&OutboundMessage::JoinTerminal {
        terminal_id: SessionId::from_port(9001),
    }));

    channel.connect(&Identity::new("alice")).expect("connect");
    // Second call while running is a no-op.
    channel.connect(&Identity::new("alice")).expect("connect again");

    let (event, data) = next_event(&mut rx).await;
    assert_eq!(event, "connection_established");
    assert_eq!(data["reconnected"], json!(false));
    assert!(channel.is_connected());
    assert!(channel.send(&OutboundMessage::JoinTerminal {
        terminal_id: SessionId::from_port(9001),
    }));

    let (event, data) = next_event(&mut rx).await;
    assert_eq!(event, "terminal_created");
    assert_eq!(data["name"], "Recon");

    let frame = timeout(WAIT, frames_rx.recv()).await.expect("frame").expect("frame");
    let frame: Value = serde_json::from_str(&frame).expect("json");
    assert_eq!(frame, json!({"event": "join_terminal", "data": {"terminal_id": "9001"}}));
    assert_eq!(query.lock().expect("lock").as_deref(), Some("username=alice"));

    let (event, _) = next_event(&mut rx).await;
    assert_eq!(event, "connection_lost");
    let (event, data) = next_event(&mut rx).await;
    assert_eq!(event, "reconnecting");
    assert_eq!(data["attempt"], json!(1));
    let (event, data) = next_event(&mut rx).await;
    assert_eq!(event, "connection_established");
    assert_eq!(data["reconnected"], json!(true));

    channel.disconnect().await;
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    let (event, _) = next_event(&mut rx).await;
    assert_eq!(event, "connection_lost");
    assert!(!channel.send(&OutboundMessage::LeaveTerminal {
        terminal_id: SessionId::from_port(9001),
    }));

    timeout(WAIT, server).await.expect("server done").expect("server task");
}

#[tokio::test]
async fn gives_up_after_attempt_budget() {
    // Bind then drop to get a port nobody listens on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr")
    };
    let policy = ReconnectPolicy {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
        max_attempts: Some(2),
    };
    let channel = TransportChannel::new(format!("ws://{}/ws", addr), policy);
    let (tx, mut rx) = mpsc::unbounded_channel();
    record(&channel, "reconnecting", &tx);

    channel.connect(&Identity::new("bob")).expect("connect");
    for expected in 1..=2 {
        let (_, data) = next_event(&mut rx).await;
        assert_eq!(data["attempt"], json!(expected));
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert!(rx.try_recv().is_err(), "no third attempt");
}
