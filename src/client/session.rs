use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::Backoff;
use crate::error::{ErrorCode, SyncError};
use crate::models::{
    CatchupMessage, ClientMessage, HeartbeatMessage, JoinMessage, LeaveMessage, OpMessage, ServerMessage,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handler = Box<dyn Fn(&ServerMessage) + Send + Sync>;

/// Client transport settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backoff: Backoff,
    pub heartbeat_interval: Duration,
    pub outbox_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            heartbeat_interval: Duration::from_secs(10),
            outbox_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

struct Inbound {
    handlers: Vec<Handler>,
    // Messages that arrived before the first handler was registered
    backlog: Vec<ServerMessage>,
}

/// What an inbound message means for the connection driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    /// The server dropped our session and expects a new `join`
    Rejoin,
    /// The document moved forward while we were attached
    Progress,
}

struct Shared {
    doc_id: String,
    user_id: String,
    capacity: usize,
    outbox: Mutex<VecDeque<ClientMessage>>,
    outbox_ready: Notify,
    unacked: Mutex<VecDeque<OpMessage>>,
    inbound: Mutex<Inbound>,
    state: Mutex<SessionState>,
    version: AtomicU64,
    degraded: AtomicBool,
    // The outbox is held back until the server answers `join`
    joined: AtomicBool,
    // Version to catch up from once `joined` arrives
    catchup_from: Mutex<Option<u64>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn new(doc_id: &str, user_id: &str, capacity: usize) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            user_id: user_id.to_string(),
            capacity: capacity.max(1),
            outbox: Mutex::new(VecDeque::new()),
            outbox_ready: Notify::new(),
            unacked: Mutex::new(VecDeque::new()),
            inbound: Mutex::new(Inbound {
                handlers: Vec::new(),
                backlog: Vec::new(),
            }),
            state: Mutex::new(SessionState::Connected),
            version: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            joined: AtomicBool::new(false),
            catchup_from: Mutex::new(None),
        }
    }

    fn is_joined(&self) -> bool {
        self.joined.load(Ordering::Relaxed)
    }

    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: SessionState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("Session on {} moved {:?} -> {:?}", self.doc_id, *current, state);
            *current = state;
        }
    }

    /// Queue a message, dropping the oldest one when the outbox is full
    fn enqueue(&self, message: ClientMessage) {
        {
            let mut outbox = lock(&self.outbox);
            outbox.push_back(message);
            while outbox.len() > self.capacity {
                outbox.pop_front();
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!("Outbox for {} overflowed; dropping oldest messages", self.doc_id);
                }
            }
        }
        self.outbox_ready.notify_one();
    }

    fn pop_outbox(&self) -> Option<ClientMessage> {
        lock(&self.outbox).pop_front()
    }

    fn push_front(&self, message: ClientMessage) {
        lock(&self.outbox).push_front(message);
    }

    fn track(&self, op: &OpMessage) {
        let mut unacked = lock(&self.unacked);
        unacked.push_back(op.clone());
        while unacked.len() > self.capacity {
            unacked.pop_front();
        }
    }

    fn settle(&self, op_id: Uuid) {
        lock(&self.unacked).retain(|op| op.op_id != op_id);
    }

    /// Put operations that were sent but never acknowledged back in front
    /// of the outbox. The server deduplicates by opId.
    fn requeue_unacked(&self) {
        let unacked: Vec<OpMessage> = lock(&self.unacked).iter().cloned().collect();
        let mut outbox = lock(&self.outbox);
        let queued: HashSet<Uuid> = outbox
            .iter()
            .filter_map(|m| match m {
                ClientMessage::Op(op) => Some(op.op_id),
                _ => None,
            })
            .collect();
        for op in unacked.into_iter().rev().filter(|op| !queued.contains(&op.op_id)) {
            outbox.push_front(ClientMessage::Op(op));
        }
    }

    /// Drop queued and unacknowledged operations based on a version the
    /// server does not have. They can never be accepted.
    fn discard_unreachable(&self, current: u64) {
        let unreachable = |op: &OpMessage| op.base_version > current;
        let mut unacked = lock(&self.unacked);
        for op in unacked.iter().filter(|op| unreachable(*op)) {
            warn!(
                "Dropping operation {} on {}: based on version {}, server is at {}",
                op.op_id, self.doc_id, op.base_version, current
            );
        }
        unacked.retain(|op| !unreachable(op));
        lock(&self.outbox).retain(|m| !matches!(m, ClientMessage::Op(op) if unreachable(op)));
    }

    /// Start a new `join` handshake; `catchup_from` is set when rejoining
    fn begin_join(&self, catchup_from: Option<u64>) {
        self.joined.store(false, Ordering::Relaxed);
        *lock(&self.catchup_from) = catchup_from;
    }

    /// The server accepted our `join`: its version is authoritative
    fn on_joined(&self, version: u64) {
        self.version.store(version, Ordering::Relaxed);
        self.discard_unreachable(version);
        if let Some(since_version) = lock(&self.catchup_from).take() {
            self.requeue_unacked();
            if since_version <= version {
                self.push_front(ClientMessage::Catchup(CatchupMessage {
                    doc_id: self.doc_id.clone(),
                    since_version,
                }));
            } else {
                warn!(
                    "Server has {} at version {} but we saw {}; continuing from its state",
                    self.doc_id, version, since_version
                );
            }
        }
        self.joined.store(true, Ordering::Relaxed);
        self.outbox_ready.notify_one();
    }

    /// Record and dispatch one inbound frame
    fn receive(&self, text: &str) -> Option<Signal> {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring undecodable message on {}: {}", self.doc_id, e);
                return None;
            }
        };
        let mut signal = None;
        match &message {
            ServerMessage::Joined(joined) => self.on_joined(joined.version),
            ServerMessage::Ack(ack) => {
                self.version.fetch_max(ack.sequence, Ordering::Relaxed);
                self.settle(ack.op_id);
                signal = Some(Signal::Progress);
            }
            ServerMessage::Applied(applied) => {
                self.version.fetch_max(applied.sequence, Ordering::Relaxed);
                signal = Some(Signal::Progress);
            }
            ServerMessage::History(history) => {
                if let Some(last) = history.operations.last() {
                    self.version.fetch_max(last.sequence, Ordering::Relaxed);
                }
            }
            ServerMessage::Error(err) if err.code == ErrorCode::StaleSession => {
                // Operations rejected here stay unacknowledged and are resent
                // after the rejoin unless their base version is unreachable.
                self.joined.store(false, Ordering::Relaxed);
                signal = Some(Signal::Rejoin);
            }
            ServerMessage::Error(err) => {
                // Rejected outright; resending would be rejected again.
                if let Some(op_id) = err.op_id {
                    self.settle(op_id);
                }
            }
            ServerMessage::Presence(_) | ServerMessage::Pong(_) => {}
        }
        self.dispatch(message);
        signal
    }

    fn dispatch(&self, message: ServerMessage) {
        let mut inbound = lock(&self.inbound);
        if inbound.handlers.is_empty() {
            inbound.backlog.push(message);
            return;
        }
        for handler in &inbound.handlers {
            handler(&message);
        }
    }

    fn join_message(&self) -> ClientMessage {
        ClientMessage::Join(JoinMessage {
            doc_id: self.doc_id.clone(),
            user_id: self.user_id.clone(),
        })
    }

    fn heartbeat_message(&self) -> ClientMessage {
        ClientMessage::Heartbeat(HeartbeatMessage {
            doc_id: self.doc_id.clone(),
            user_id: self.user_id.clone(),
        })
    }

    fn leave_message(&self) -> ClientMessage {
        ClientMessage::Leave(LeaveMessage {
            doc_id: self.doc_id.clone(),
            user_id: self.user_id.clone(),
        })
    }
}

/// Client side of one document connection.
///
/// Owns a background task that keeps the socket alive: it reconnects with
/// exponential backoff, rejoins, requests the operations it missed and
/// resends operations that were never acknowledged.
pub struct Session {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Session {
    /// Connect to `url` and join `doc_id` as `user_id`
    pub async fn connect(url: &str, doc_id: &str, user_id: &str, config: SessionConfig) -> Result<Self, SyncError> {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let stream = connect_with_retry(url, &config.backoff, &mut shutdown_rx)
            .await?
            .ok_or(SyncError::Transport("session closed while connecting".to_string()))?;
        info!("Connected to {} for document {}", url, doc_id);

        let shared = Arc::new(Shared::new(doc_id, user_id, config.outbox_capacity));
        let task = tokio::spawn(run(url.to_string(), config, shared.clone(), stream, shutdown_rx));

        Ok(Self {
            shared,
            shutdown,
            task: Some(task),
        })
    }

    pub fn doc_id(&self) -> &str {
        &self.shared.doc_id
    }

    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Last document version seen in `joined`, `ack`, `applied` or `history`
    pub fn version(&self) -> u64 {
        self.shared.version.load(Ordering::Relaxed)
    }

    /// True once the outbox has dropped a message
    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::Relaxed)
    }

    /// Queue a message for the server. Never blocks.
    pub fn send(&self, message: ClientMessage) -> Result<(), SyncError> {
        match self.shared.state() {
            SessionState::Failed | SessionState::Closed => {
                Err(SyncError::Transport("session is no longer connected".to_string()))
            }
            SessionState::Connected | SessionState::Reconnecting => {
                if let ClientMessage::Op(op) = &message {
                    self.shared.track(op);
                }
                self.shared.enqueue(message);
                Ok(())
            }
        }
    }

    /// Submit an edit made against `base_version`; returns its opId
    pub fn submit(&self, payload: Value, base_version: u64) -> Result<Uuid, SyncError> {
        let op_id = Uuid::new_v4();
        self.send(ClientMessage::Op(OpMessage {
            op_id,
            doc_id: self.shared.doc_id.clone(),
            base_version,
            payload,
            timestamp: Utc::now(),
        }))?;
        Ok(op_id)
    }

    /// Register a handler for inbound messages. Handlers run on the session
    /// task in arrival order and must not register further handlers.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        let mut inbound = lock(&self.shared.inbound);
        for message in std::mem::take(&mut inbound.backlog) {
            handler(&message);
        }
        inbound.handlers.push(Box::new(handler));
    }

    /// Send `leave` and stop the background task
    pub async fn close(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Session task for {} ended abnormally: {}", self.shared.doc_id, e);
            }
        }
        self.shared.set_state(SessionState::Closed);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

enum Outcome {
    Closed,
    Lost(String),
    GaveUp(SyncError),
}

async fn connect_with_retry(
    url: &str,
    backoff: &Backoff,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<WsStream>, SyncError> {
    let mut last_error = String::from("no connection attempt made");
    for attempt in 1..=backoff.max_attempts {
        if *shutdown.borrow() {
            return Ok(None);
        }
        tokio::select! {
            connected = connect_async(url) => match connected {
                Ok((stream, _)) => return Ok(Some(stream)),
                Err(e) => {
                    warn!("Connection attempt {}/{} to {} failed: {}", attempt, backoff.max_attempts, url, e);
                    last_error = e.to_string();
                }
            },
            _ = shutdown.changed() => return Ok(None),
        }
        if attempt == backoff.max_attempts {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff.delay(attempt)) => {}
            _ = shutdown.changed() => return Ok(None),
        }
    }
    Err(SyncError::ConnectionFailed {
        attempts: backoff.max_attempts,
        reason: last_error,
    })
}

async fn run(
    url: String,
    config: SessionConfig,
    shared: Arc<Shared>,
    mut stream: WsStream,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut rejoin_from = None;
    loop {
        match drive(stream, &config, &shared, &mut shutdown, rejoin_from).await {
            Outcome::Closed => {
                shared.set_state(SessionState::Closed);
                break;
            }
            Outcome::GaveUp(e) => {
                fail(&shared, e);
                break;
            }
            Outcome::Lost(reason) => {
                warn!("Connection for {} lost: {}", shared.doc_id, reason);
                shared.set_state(SessionState::Reconnecting);
                rejoin_from = Some(shared.version.load(Ordering::Relaxed));
                match connect_with_retry(&url, &config.backoff, &mut shutdown).await {
                    Ok(Some(reconnected)) => {
                        info!("Reconnected to {} for document {}", url, shared.doc_id);
                        stream = reconnected;
                    }
                    Ok(None) => {
                        shared.set_state(SessionState::Closed);
                        break;
                    }
                    Err(e) => {
                        fail(&shared, e);
                        break;
                    }
                }
            }
        }
    }
    debug!("Session task for {} stopped", shared.doc_id);
}

fn fail(shared: &Shared, e: SyncError) {
    error!("Giving up on document {}: {}", shared.doc_id, e);
    shared.set_state(SessionState::Failed);
    shared.dispatch(ServerMessage::error(&e, None));
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Serve one established connection until it drops or the session closes
async fn drive(
    stream: WsStream,
    config: &SessionConfig,
    shared: &Shared,
    shutdown: &mut watch::Receiver<bool>,
    rejoin_from: Option<u64>,
) -> Outcome {
    let (mut sink, mut source) = stream.split();

    if let Err(reason) = greet(&mut sink, shared, rejoin_from).await {
        return Outcome::Lost(reason);
    }
    shared.set_state(SessionState::Connected);

    let mut heartbeat = interval_at(Instant::now() + config.heartbeat_interval, config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Rejoins requested by the server on this socket, paced like reconnects
    let mut rejoin_at: Option<Instant> = None;
    let mut stale_rejoins: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = send(&mut sink, &shared.leave_message()).await;
                let _ = sink.close().await;
                return Outcome::Closed;
            }
            _ = shared.outbox_ready.notified() => {
                if shared.is_joined() {
                    if let Err(reason) = flush(&mut sink, shared).await {
                        return Outcome::Lost(reason);
                    }
                }
            }
            _ = heartbeat.tick() => {
                if shared.is_joined() {
                    if let Err(reason) = send(&mut sink, &shared.heartbeat_message()).await {
                        return Outcome::Lost(reason);
                    }
                }
            }
            _ = wait_until(rejoin_at) => {
                rejoin_at = None;
                let since = shared.version.load(Ordering::Relaxed);
                info!("Rejoining {} from version {} (attempt {})", shared.doc_id, since, stale_rejoins);
                if let Err(reason) = greet(&mut sink, shared, Some(since)).await {
                    return Outcome::Lost(reason);
                }
            }
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => match shared.receive(text.as_str()) {
                    Some(Signal::Rejoin) if rejoin_at.is_none() => {
                        stale_rejoins += 1;
                        if stale_rejoins > config.backoff.max_attempts {
                            let _ = sink.close().await;
                            return Outcome::GaveUp(SyncError::ConnectionFailed {
                                attempts: config.backoff.max_attempts,
                                reason: "server kept reporting a stale session".to_string(),
                            });
                        }
                        let delay = config.backoff.delay(stale_rejoins);
                        info!("Session on {} went stale; rejoining in {:?}", shared.doc_id, delay);
                        rejoin_at = Some(Instant::now() + delay);
                    }
                    Some(Signal::Progress) => stale_rejoins = 0,
                    _ => {}
                },
                Some(Ok(Message::Close(_))) | None => return Outcome::Lost("closed by server".to_string()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Outcome::Lost(e.to_string()),
            },
        }
    }
}

/// Send `join`. The outbox, plus a `catchup` from `rejoin_from` when
/// rejoining, is released once the server answers with `joined`.
async fn greet(
    sink: &mut SplitSink<WsStream, Message>,
    shared: &Shared,
    rejoin_from: Option<u64>,
) -> Result<(), String> {
    shared.begin_join(rejoin_from);
    send(sink, &shared.join_message()).await
}

async fn flush(sink: &mut SplitSink<WsStream, Message>, shared: &Shared) -> Result<(), String> {
    while let Some(message) = shared.pop_outbox() {
        if let Err(reason) = send(sink, &message).await {
            shared.push_front(message);
            return Err(reason);
        }
    }
    Ok(())
}

async fn send(sink: &mut SplitSink<WsStream, Message>, message: &ClientMessage) -> Result<(), String> {
    let text = serde_json::to_string(message).map_err(|e| e.to_string())?;
    sink.send(Message::Text(text.into())).await.map_err(|e| e.to_string())
}
