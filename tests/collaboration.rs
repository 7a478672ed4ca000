use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use colabri_sync::client::{Backoff, Session, SessionConfig, SessionState};
use colabri_sync::collab::DocRegistry;
use colabri_sync::config::{Config, CoordinatorSettings};
use colabri_sync::db::MemoryOpStore;
use colabri_sync::error::ErrorCode;
use colabri_sync::models::{apply_edits, ServerMessage};
use colabri_sync::{build_app, AppState};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(5);

async fn spawn_server(settings: CoordinatorSettings) -> (SocketAddr, Arc<AppState>) {
    let store = Arc::new(MemoryOpStore::new());
    let state = Arc::new(AppState {
        config: Config::default(),
        registry: DocRegistry::new(store, settings),
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{}/ws", addr)
}

/// TCP forwarder between clients and the server whose links can be cut
struct Relay {
    addr: SocketAddr,
    open: Arc<AtomicBool>,
    cut: broadcast::Sender<()>,
}

impl Relay {
    async fn spawn(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let open = Arc::new(AtomicBool::new(true));
        let (cut, _) = broadcast::channel(4);
        let (accepting, links) = (open.clone(), cut.clone());
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                // Refused connections are dropped before the handshake.
                if !accepting.load(Ordering::SeqCst) {
                    continue;
                }
                let mut cut_rx = links.subscribe();
                tokio::spawn(async move {
                    let Ok(mut outbound) = TcpStream::connect(upstream).await else {
                        return;
                    };
                    tokio::select! {
                        _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {}
                        _ = cut_rx.recv() => {}
                    }
                });
            }
        });
        Self { addr, open, cut }
    }

    fn url(&self) -> String {
        ws_url(self.addr)
    }

    /// Drop every live link and refuse new ones
    fn sever(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.cut.send(());
    }

    fn restore(&self) {
        self.open.store(true, Ordering::SeqCst);
    }
}

fn default_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        sweep_interval: Duration::from_millis(50),
        ..CoordinatorSettings::default()
    }
}

fn client_config(heartbeat: Duration) -> SessionConfig {
    SessionConfig {
        backoff: Backoff::new(Duration::from_millis(20), Duration::from_millis(200), 5),
        heartbeat_interval: heartbeat,
        outbox_capacity: 256,
    }
}

fn inbox(session: &Session) -> mpsc::UnboundedReceiver<ServerMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    session.on_message(move |msg| {
        let _ = tx.send(msg.clone());
    });
    rx
}

async fn next_where<F>(rx: &mut mpsc::UnboundedReceiver<ServerMessage>, mut pred: F) -> ServerMessage
where
    F: FnMut(&ServerMessage) -> bool,
{
    timeout(WAIT, async {
        loop {
            let msg = rx.recv().await.expect("session inbox closed");
            if pred(&msg) {
                return msg;
            }
        }
    })
    .await
    .expect("timed out waiting for message")
}

/// Replica of a read-only participant: joined content plus the edits of
/// every applied operation.
struct Mirror {
    content: String,
}

impl Mirror {
    fn apply(&mut self, msg: &ServerMessage) {
        match msg {
            ServerMessage::Joined(joined) => self.content = joined.content.clone(),
            ServerMessage::Applied(applied) => apply_edits(&mut self.content, &applied.edits).unwrap(),
            _ => {}
        }
    }
}

#[tokio::test]
async fn concurrent_inserts_converge_for_every_client() {
    let (addr, state) = spawn_server(default_settings()).await;
    let url = ws_url(addr);

    let alice = Session::connect(&url, "task-1", "alice", client_config(Duration::from_secs(10)))
        .await
        .unwrap();
    let mut alice_rx = inbox(&alice);
    next_where(&mut alice_rx, |m| matches!(m, ServerMessage::Joined(_))).await;

    let bob = Session::connect(&url, "task-1", "bob", client_config(Duration::from_secs(10)))
        .await
        .unwrap();
    let mut bob_rx = inbox(&bob);
    next_where(&mut bob_rx, |m| matches!(m, ServerMessage::Joined(_))).await;

    // Seed the document, then race two inserts at the same position.
    let seed = alice
        .submit(json!({"kind": "insert", "position": 0, "text": "0123456789"}), 0)
        .unwrap();
    next_where(&mut alice_rx, |m| matches!(m, ServerMessage::Ack(a) if a.op_id == seed)).await;
    next_where(&mut bob_rx, |m| matches!(m, ServerMessage::Applied(_))).await;

    let a = alice.submit(json!({"kind": "insert", "position": 5, "text": "AA"}), 1).unwrap();
    let b = bob.submit(json!({"kind": "insert", "position": 5, "text": "B"}), 1).unwrap();

    let mut alice_order = Vec::new();
    while alice_order.len() < 2 {
        match next_where(&mut alice_rx, |m| matches!(m, ServerMessage::Ack(_) | ServerMessage::Applied(_))).await {
            ServerMessage::Ack(ack) => alice_order.push((ack.sequence, ack.op_id)),
            ServerMessage::Applied(applied) => alice_order.push((applied.sequence, applied.op_id)),
            _ => unreachable!(),
        }
    }
    let mut bob_order = Vec::new();
    while bob_order.len() < 2 {
        match next_where(&mut bob_rx, |m| matches!(m, ServerMessage::Ack(_) | ServerMessage::Applied(_))).await {
            ServerMessage::Ack(ack) => bob_order.push((ack.sequence, ack.op_id)),
            ServerMessage::Applied(applied) => bob_order.push((applied.sequence, applied.op_id)),
            _ => unreachable!(),
        }
    }
    assert_eq!(alice_order, bob_order);
    let ids: Vec<_> = alice_order.iter().map(|(_, id)| *id).collect();
    assert!(ids.contains(&a) && ids.contains(&b));

    let snapshot = state.registry.snapshot("task-1").await.unwrap();
    assert_eq!(snapshot.version, 3);
    assert_eq!(snapshot.content.chars().count(), 13);
    assert!(snapshot.content.starts_with("01234") && snapshot.content.ends_with("56789"));
    assert!(snapshot.content.contains("AA") && snapshot.content.contains('B'));
    assert_eq!(alice.version(), 3);
    assert_eq!(bob.version(), 3);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn applied_edits_reproduce_the_server_content() {
    let (addr, state) = spawn_server(default_settings()).await;
    let url = ws_url(addr);

    let writer = Session::connect(&url, "chat-7", "writer", client_config(Duration::from_secs(10)))
        .await
        .unwrap();
    let mut writer_rx = inbox(&writer);
    next_where(&mut writer_rx, |m| matches!(m, ServerMessage::Joined(_))).await;

    let reader = Session::connect(&url, "chat-7", "reader", client_config(Duration::from_secs(10)))
        .await
        .unwrap();
    let mut reader_rx = inbox(&reader);
    let mut mirror = Mirror { content: String::new() };
    let joined = next_where(&mut reader_rx, |m| matches!(m, ServerMessage::Joined(_))).await;
    mirror.apply(&joined);

    // Later edits are made against stale bases.
    let edits = [
        (0, json!({"kind": "insert", "position": 0, "text": "hello world"})),
        (0, json!({"kind": "insert", "position": 0, "text": ">> "})),
        (1, json!({"kind": "delete", "position": 6, "length": 5})),
        (1, json!({"kind": "replace", "position": 0, "length": 5, "text": "héllo"})),
    ];
    for (base, payload) in edits {
        writer.submit(payload, base).unwrap();
    }

    let mut applied = 0;
    while applied < 4 {
        let msg = next_where(&mut reader_rx, |m| matches!(m, ServerMessage::Applied(_))).await;
        mirror.apply(&msg);
        applied += 1;
    }
    let snapshot = state.registry.snapshot("chat-7").await.unwrap();
    assert_eq!(mirror.content, snapshot.content);

    writer.close().await;
    reader.close().await;
}

#[tokio::test]
async fn stale_sessions_rejoin_and_catch_up() {
    let settings = CoordinatorSettings {
        liveness_timeout: Duration::from_millis(300),
        sweep_interval: Duration::from_millis(50),
        ..CoordinatorSettings::default()
    };
    let (addr, _state) = spawn_server(settings).await;
    let url = ws_url(addr);

    // Heartbeats far apart: the server drops this session repeatedly.
    let sleepy = Session::connect(&url, "task-9", "sleepy", client_config(Duration::from_secs(10)))
        .await
        .unwrap();
    let mut sleepy_rx = inbox(&sleepy);
    next_where(&mut sleepy_rx, |m| matches!(m, ServerMessage::Joined(_))).await;

    let busy = Session::connect(&url, "task-9", "busy", client_config(Duration::from_millis(100)))
        .await
        .unwrap();
    let mut busy_rx = inbox(&busy);
    next_where(&mut busy_rx, |m| matches!(m, ServerMessage::Joined(_))).await;

    next_where(&mut sleepy_rx, |m| {
        matches!(m, ServerMessage::Error(e) if e.code == ErrorCode::StaleSession)
    })
    .await;

    for (base, text) in ["a", "b", "c"].into_iter().enumerate() {
        let op_id = busy
            .submit(json!({"kind": "insert", "position": base, "text": text}), base as u64)
            .unwrap();
        next_where(&mut busy_rx, |m| matches!(m, ServerMessage::Ack(a) if a.op_id == op_id)).await;
    }

    next_where(&mut sleepy_rx, |m| matches!(m, ServerMessage::History(_))).await;
    timeout(WAIT, async {
        while sleepy.version() < 3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("sleepy session never caught up");
    assert_eq!(sleepy.state(), SessionState::Connected);

    sleepy.close().await;
    busy.close().await;
}

#[tokio::test]
async fn raw_sockets_get_protocol_errors() {
    let (addr, _state) = spawn_server(default_settings()).await;
    let url = ws_url(addr);
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();

    async fn next_error(socket: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin)) -> ServerMessage {
        let frame = timeout(WAIT, socket.next()).await.unwrap().unwrap().unwrap();
        let text = frame.into_text().unwrap();
        serde_json::from_str(text.as_str()).unwrap()
    }

    socket.send(Message::Text("not json".into())).await.unwrap();
    match next_error(&mut socket).await {
        ServerMessage::Error(e) => assert_eq!(e.code, ErrorCode::InvalidMessage),
        other => panic!("expected error, got {:?}", other),
    }

    let op = json!({
        "type": "op",
        "opId": "6f0b4a1e-52e1-4d8e-9d8a-2f5c4e7f0a11",
        "docId": "task-1",
        "baseVersion": 0,
        "payload": {"kind": "insert", "position": 0, "text": "x"},
        "timestamp": 1_700_000_000_000i64
    });
    socket.send(Message::Text(op.to_string().into())).await.unwrap();
    match next_error(&mut socket).await {
        ServerMessage::Error(e) => {
            assert_eq!(e.code, ErrorCode::StaleSession);
            assert!(e.op_id.is_some());
        }
        other => panic!("expected error, got {:?}", other),
    }

    socket.send(Message::Text(json!({"type": "ping"}).to_string().into())).await.unwrap();
    assert!(matches!(next_error(&mut socket).await, ServerMessage::Pong(_)));
}

#[tokio::test]
async fn operations_based_past_the_server_are_dropped_after_one_rejoin() {
    let (addr, state) = spawn_server(default_settings()).await;
    let alice = Session::connect(&ws_url(addr), "empty", "alice", client_config(Duration::from_secs(10)))
        .await
        .unwrap();
    let mut rx = inbox(&alice);
    next_where(&mut rx, |m| matches!(m, ServerMessage::Joined(_))).await;

    let ahead = alice
        .submit(json!({"kind": "insert", "position": 0, "text": "x"}), 5)
        .unwrap();
    next_where(&mut rx, |m| {
        matches!(m, ServerMessage::Error(e) if e.code == ErrorCode::StaleSession && e.op_id == Some(ahead))
    })
    .await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    let (mut joined, mut stale) = (0, 0);
    while let Ok(msg) = rx.try_recv() {
        match msg {
            ServerMessage::Joined(_) => joined += 1,
            ServerMessage::Error(e) if e.code == ErrorCode::StaleSession => stale += 1,
            _ => {}
        }
    }
    assert_eq!(joined, 1, "one rejoin, then quiet");
    assert_eq!(stale, 0);
    assert_eq!(alice.state(), SessionState::Connected);

    let fine = alice
        .submit(json!({"kind": "insert", "position": 0, "text": "ok"}), 0)
        .unwrap();
    next_where(&mut rx, |m| matches!(m, ServerMessage::Ack(a) if a.op_id == fine)).await;
    let snapshot = state.registry.snapshot("empty").await.unwrap();
    assert_eq!(snapshot.content, "ok");
    assert_eq!(snapshot.version, 1);

    alice.close().await;
}

#[tokio::test]
async fn sessions_the_server_keeps_dropping_give_up() {
    let settings = CoordinatorSettings {
        liveness_timeout: Duration::from_millis(100),
        sweep_interval: Duration::from_millis(20),
        ..CoordinatorSettings::default()
    };
    let (addr, _state) = spawn_server(settings).await;
    let config = SessionConfig {
        backoff: Backoff::new(Duration::from_millis(20), Duration::from_millis(100), 3),
        ..client_config(Duration::from_secs(10))
    };
    let session = Session::connect(&ws_url(addr), "task-3", "drowsy", config).await.unwrap();
    let mut rx = inbox(&session);

    let mut stale = 0;
    loop {
        match next_where(&mut rx, |m| matches!(m, ServerMessage::Error(_))).await {
            ServerMessage::Error(e) if e.code == ErrorCode::StaleSession => stale += 1,
            ServerMessage::Error(e) => {
                assert_eq!(e.code, ErrorCode::ConnectionFailed);
                break;
            }
            _ => unreachable!(),
        }
    }
    assert_eq!(stale, 4);
    assert_eq!(session.state(), SessionState::Failed);
    assert!(session
        .submit(json!({"kind": "insert", "position": 0, "text": "late"}), 0)
        .is_err());
}

#[tokio::test]
async fn lost_connections_reconnect_catch_up_and_resend() {
    let (addr, state) = spawn_server(default_settings()).await;
    let relay = Relay::spawn(addr).await;

    let config = SessionConfig {
        backoff: Backoff::new(Duration::from_millis(50), Duration::from_millis(400), 5),
        ..client_config(Duration::from_secs(10))
    };
    let alice = Session::connect(&relay.url(), "notes", "alice", config).await.unwrap();
    let mut alice_rx = inbox(&alice);
    next_where(&mut alice_rx, |m| matches!(m, ServerMessage::Joined(_))).await;

    let bob = Session::connect(&ws_url(addr), "notes", "bob", client_config(Duration::from_secs(10)))
        .await
        .unwrap();
    let mut bob_rx = inbox(&bob);
    next_where(&mut bob_rx, |m| matches!(m, ServerMessage::Joined(_))).await;

    let first = bob.submit(json!({"kind": "insert", "position": 0, "text": "a"}), 0).unwrap();
    next_where(&mut bob_rx, |m| matches!(m, ServerMessage::Ack(a) if a.op_id == first)).await;
    next_where(&mut alice_rx, |m| matches!(m, ServerMessage::Applied(a) if a.op_id == first)).await;
    assert_eq!(alice.version(), 1);

    relay.sever();
    let pending = alice
        .submit(json!({"kind": "insert", "position": 1, "text": "z"}), 1)
        .unwrap();
    timeout(WAIT, async {
        while alice.state() != SessionState::Reconnecting {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("alice never noticed the outage");

    let mut missed = Vec::new();
    for (base, text) in [(1u64, "b"), (2, "c")] {
        let op_id = bob
            .submit(json!({"kind": "insert", "position": base, "text": text}), base)
            .unwrap();
        next_where(&mut bob_rx, |m| matches!(m, ServerMessage::Ack(a) if a.op_id == op_id)).await;
        missed.push(op_id);
    }
    relay.restore();

    match next_where(&mut alice_rx, |m| matches!(m, ServerMessage::History(_))).await {
        ServerMessage::History(history) => {
            let seen: Vec<(u64, uuid::Uuid)> = history
                .operations
                .iter()
                .map(|r| (r.sequence, r.operation.op_id))
                .collect();
            assert_eq!(seen, vec![(2, missed[0]), (3, missed[1])]);
        }
        _ => unreachable!(),
    }
    match next_where(&mut alice_rx, |m| matches!(m, ServerMessage::Ack(a) if a.op_id == pending)).await {
        ServerMessage::Ack(ack) => assert_eq!(ack.sequence, 4),
        _ => unreachable!(),
    }
    assert_eq!(alice.state(), SessionState::Connected);
    assert_eq!(alice.version(), 4);

    let (version, operations) = state.registry.history("notes", 0).await.unwrap();
    assert_eq!(version, 4);
    assert_eq!(operations.iter().filter(|r| r.operation.op_id == pending).count(), 1);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn exhausted_reconnects_fail_the_session() {
    let (addr, _state) = spawn_server(default_settings()).await;
    let relay = Relay::spawn(addr).await;

    let alice = Session::connect(&relay.url(), "notes", "alice", client_config(Duration::from_secs(10)))
        .await
        .unwrap();
    let mut rx = inbox(&alice);
    next_where(&mut rx, |m| matches!(m, ServerMessage::Joined(_))).await;

    relay.sever();
    next_where(&mut rx, |m| {
        matches!(m, ServerMessage::Error(e) if e.code == ErrorCode::ConnectionFailed)
    })
    .await;
    assert_eq!(alice.state(), SessionState::Failed);
    assert!(alice
        .submit(json!({"kind": "insert", "position": 0, "text": "lost"}), 0)
        .is_err());
}
