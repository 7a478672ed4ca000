use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::document::{Document, Prepared};
use super::presence::PresenceTracker;
use crate::config::CoordinatorSettings;
use crate::db::OpStore;
use crate::error::SyncError;
use crate::models::{
    AcceptedOperation, AckMessage, AppliedMessage, HistoryMessage, JoinedMessage, Operation, PresenceEntry,
    PresenceMessage, PresenceSet, ServerMessage,
};

/// Per-connection outbound queue. Unbounded so a slow socket never stalls
/// the document task.
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

pub(crate) type DocMap = Mutex<HashMap<String, DocHandle>>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorState {
    Uninitialized,
    Active,
    Draining,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocSnapshot {
    pub doc_id: String,
    pub version: u64,
    pub content: String,
    pub presence: PresenceSet,
    pub state: CoordinatorState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorStats {
    pub doc_id: String,
    pub state: CoordinatorState,
    pub sessions: usize,
    pub version: u64,
    pub available: bool,
}

pub(crate) enum Command {
    Attach {
        connection_id: Uuid,
        user_id: String,
        outbound: Outbound,
        reply: oneshot::Sender<Result<u64, SyncError>>,
    },
    Submit {
        connection_id: Uuid,
        op: Operation,
        reply_to: Outbound,
    },
    CatchUp {
        connection_id: Uuid,
        since: u64,
        reply_to: Outbound,
    },
    Heartbeat {
        connection_id: Uuid,
    },
    Detach {
        connection_id: Uuid,
    },
    History {
        since: u64,
        reply: oneshot::Sender<Result<(u64, Vec<AcceptedOperation>), SyncError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<DocSnapshot, SyncError>>,
    },
    Stats {
        reply: oneshot::Sender<CoordinatorStats>,
    },
}

/// Address of one running coordinator
#[derive(Clone, Debug)]
pub struct DocHandle {
    doc_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<Command>,
}

impl DocHandle {
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    fn send(&self, command: Command) -> Result<(), SyncError> {
        self.tx.send(command).map_err(|_| SyncError::CoordinatorClosed)
    }

    /// Attach a connection; the coordinator sends `joined` on `outbound`
    /// and returns the version it reported.
    pub async fn attach(&self, connection_id: Uuid, user_id: &str, outbound: Outbound) -> Result<u64, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Attach {
            connection_id,
            user_id: user_id.to_string(),
            outbound,
            reply,
        })?;
        rx.await.map_err(|_| SyncError::CoordinatorClosed)?
    }

    pub fn submit(&self, connection_id: Uuid, op: Operation, reply_to: Outbound) -> Result<(), SyncError> {
        self.send(Command::Submit {
            connection_id,
            op,
            reply_to,
        })
    }

    pub fn catch_up(&self, connection_id: Uuid, since: u64, reply_to: Outbound) -> Result<(), SyncError> {
        self.send(Command::CatchUp {
            connection_id,
            since,
            reply_to,
        })
    }

    pub fn heartbeat(&self, connection_id: Uuid) -> Result<(), SyncError> {
        self.send(Command::Heartbeat { connection_id })
    }

    pub fn detach(&self, connection_id: Uuid) -> Result<(), SyncError> {
        self.send(Command::Detach { connection_id })
    }

    pub async fn history(&self, since: u64) -> Result<(u64, Vec<AcceptedOperation>), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::History { since, reply })?;
        rx.await.map_err(|_| SyncError::CoordinatorClosed)?
    }

    pub async fn snapshot(&self) -> Result<DocSnapshot, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        rx.await.map_err(|_| SyncError::CoordinatorClosed)?
    }

    pub async fn stats(&self) -> Result<CoordinatorStats, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        rx.await.map_err(|_| SyncError::CoordinatorClosed)
    }
}

#[derive(Debug)]
struct ClientSession {
    connection_id: Uuid,
    user_id: String,
    outbound: Outbound,
    last_seen: Instant,
}

/// Single writer for one document: owns its log, replica, presence and
/// attached sessions, and processes commands one at a time.
pub struct Coordinator {
    doc_id: String,
    generation: u64,
    settings: CoordinatorSettings,
    store: Arc<dyn OpStore>,
    docs: Weak<DocMap>,
    state: CoordinatorState,
    document: Result<Document, SyncError>,
    presence: PresenceTracker,
    sessions: Vec<ClientSession>,
    evict_at: Option<Instant>,
}

impl Coordinator {
    /// Spawn a coordinator task and return its handle
    pub(crate) fn spawn(
        doc_id: &str,
        generation: u64,
        settings: CoordinatorSettings,
        store: Arc<dyn OpStore>,
        docs: Weak<DocMap>,
    ) -> DocHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            doc_id: doc_id.to_string(),
            generation,
            settings,
            store,
            docs,
            state: CoordinatorState::Uninitialized,
            document: Ok(Document::new(doc_id)),
            presence: PresenceTracker::new(doc_id, settings.idle_timeout, settings.liveness_timeout),
            sessions: Vec::new(),
            evict_at: None,
        };
        tokio::spawn(coordinator.run(rx));
        DocHandle {
            doc_id: doc_id.to_string(),
            generation,
            tx,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        self.load().await;
        self.evict_at = Some(Instant::now() + self.settings.drain_grace);

        let mut sweep = tokio::time::interval(self.settings.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let evict_at = self.evict_at;
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = sweep.tick() => self.sweep(),
                _ = wait_until(evict_at) => {
                    if self.try_close() {
                        break;
                    }
                }
            }
        }

        self.shutdown(rx).await;
    }

    async fn load(&mut self) {
        let loaded = match self.store.load(&self.doc_id).await {
            Ok(records) => Document::load(&self.doc_id, records),
            Err(e) => Err(SyncError::DocumentUnavailable {
                doc_id: self.doc_id.clone(),
                reason: e.to_string(),
            }),
        };
        match &loaded {
            Ok(document) => info!("Document {} loaded at version {}", self.doc_id, document.version()),
            Err(e) => error!("Document {} cannot be activated: {}", self.doc_id, e),
        }
        self.document = loaded;
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Attach {
                connection_id,
                user_id,
                outbound,
                reply,
            } => {
                let _ = reply.send(self.attach(connection_id, user_id, outbound));
            }
            Command::Submit {
                connection_id,
                op,
                reply_to,
            } => self.submit(connection_id, op, reply_to).await,
            Command::CatchUp {
                connection_id,
                since,
                reply_to,
            } => self.catch_up(connection_id, since, reply_to),
            Command::Heartbeat { connection_id } => self.heartbeat(connection_id),
            Command::Detach { connection_id } => self.detach(connection_id),
            Command::History { since, reply } => {
                let _ = reply.send(self.history(since).map(|ops| (self.version(), ops)));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn attach(&mut self, connection_id: Uuid, user_id: String, outbound: Outbound) -> Result<u64, SyncError> {
        let document = self.document.as_ref().map_err(Clone::clone)?;
        let version = document.version();
        let content = document.content();

        self.sessions.retain(|s| s.connection_id != connection_id);
        let presence_changed = self.presence.mark_active(&user_id);
        let joined = ServerMessage::Joined(JoinedMessage {
            doc_id: self.doc_id.clone(),
            version,
            content,
            presence: self.presence.snapshot(),
        });
        if outbound.send(joined).is_err() {
            debug!("Connection {} went away while joining {}", connection_id, self.doc_id);
        }
        self.sessions.push(ClientSession {
            connection_id,
            user_id: user_id.clone(),
            outbound,
            last_seen: Instant::now(),
        });

        if self.state != CoordinatorState::Active {
            info!("Document {} is active ({:?} -> Active)", self.doc_id, self.state);
        }
        self.state = CoordinatorState::Active;
        self.evict_at = None;

        info!(
            "User {} joined document {} on connection {} ({} sessions)",
            user_id,
            self.doc_id,
            connection_id,
            self.sessions.len()
        );
        if presence_changed {
            self.broadcast_presence(Some(connection_id), Vec::new());
        }
        Ok(version)
    }

    async fn submit(&mut self, connection_id: Uuid, mut op: Operation, reply_to: Outbound) {
        let op_id = op.op_id;
        let reject = |err: &SyncError| {
            let _ = reply_to.send(ServerMessage::error(err, Some(op_id)));
        };

        let Some(session) = self.session_mut(connection_id) else {
            reject(&SyncError::StaleSession);
            return;
        };
        session.last_seen = Instant::now();
        op.author_id = session.user_id.clone();
        let user_id = session.user_id.clone();

        let document = match self.document.as_mut() {
            Ok(document) => document,
            Err(e) => {
                reject(&*e);
                return;
            }
        };

        let (record, resolution) = match document.prepare(op) {
            Ok(Prepared::Duplicate(existing)) => {
                debug!("Operation {} already accepted at sequence {}", op_id, existing.sequence);
                let _ = reply_to.send(ServerMessage::Ack(AckMessage {
                    op_id,
                    sequence: existing.sequence,
                }));
                return;
            }
            Ok(Prepared::New { record, resolution }) => (record, resolution),
            Err(e) => {
                warn!("Rejected operation {} on {}: {}", op_id, self.doc_id, e);
                reject(&e);
                return;
            }
        };

        if let Err(e) = self.store.append(&self.doc_id, &record).await {
            error!("Failed to persist operation {} on {}: {}", op_id, self.doc_id, e);
            reject(&e);
            return;
        }

        let accepted = match document.commit(record, &resolution) {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to commit operation {} on {}: {}", op_id, self.doc_id, e);
                reject(&e);
                return;
            }
        };
        debug!("Accepted operation {} on {} at sequence {}", op_id, self.doc_id, accepted.sequence);

        let _ = reply_to.send(ServerMessage::Ack(AckMessage {
            op_id,
            sequence: accepted.sequence,
        }));
        let applied = AppliedMessage::from(&accepted);
        for session in self.sessions.iter().filter(|s| s.connection_id != connection_id) {
            let _ = session.outbound.send(ServerMessage::Applied(applied.clone()));
        }

        if self.presence.mark_active(&user_id) {
            self.broadcast_presence(None, Vec::new());
        }
    }

    fn catch_up(&mut self, connection_id: Uuid, since: u64, reply_to: Outbound) {
        let Some(session) = self.session_mut(connection_id) else {
            let _ = reply_to.send(ServerMessage::error(&SyncError::StaleSession, None));
            return;
        };
        session.last_seen = Instant::now();
        let user_id = session.user_id.clone();
        self.presence.touch(&user_id);

        // Pushed on the connection's own queue so it stays ordered relative
        // to later `applied` messages.
        let message = match self.history(since) {
            Ok(operations) => {
                debug!(
                    "Catch-up for {} on {} from version {}: {} operations",
                    connection_id,
                    self.doc_id,
                    since,
                    operations.len()
                );
                ServerMessage::History(HistoryMessage {
                    doc_id: self.doc_id.clone(),
                    operations,
                })
            }
            Err(e) => ServerMessage::error(&e, None),
        };
        let _ = reply_to.send(message);
    }

    fn heartbeat(&mut self, connection_id: Uuid) {
        if let Some(session) = self.session_mut(connection_id) {
            session.last_seen = Instant::now();
            let user_id = session.user_id.clone();
            self.presence.touch(&user_id);
        }
    }

    fn detach(&mut self, connection_id: Uuid) {
        let Some(index) = self.sessions.iter().position(|s| s.connection_id == connection_id) else {
            return;
        };
        let session = self.sessions.remove(index);
        info!(
            "User {} left document {} on connection {}",
            session.user_id, self.doc_id, connection_id
        );
        if let Some(gone) = self.forget_user_if_gone(&session.user_id) {
            self.broadcast_presence(None, vec![gone]);
        }
        self.drain_if_empty();
    }

    fn history(&self, since: u64) -> Result<Vec<AcceptedOperation>, SyncError> {
        let document = self.document.as_ref().map_err(Clone::clone)?;
        let current = document.version();
        if since > current {
            return Err(SyncError::FutureBaseVersion { base: since, current });
        }
        Ok(document.log().since(since).cloned().collect())
    }

    fn snapshot(&self) -> Result<DocSnapshot, SyncError> {
        let document = self.document.as_ref().map_err(Clone::clone)?;
        Ok(DocSnapshot {
            doc_id: self.doc_id.clone(),
            version: document.version(),
            content: document.content(),
            presence: self.presence.snapshot(),
            state: self.state,
        })
    }

    fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            doc_id: self.doc_id.clone(),
            state: self.state,
            sessions: self.sessions.len(),
            version: self.version(),
            available: self.document.is_ok(),
        }
    }

    fn version(&self) -> u64 {
        self.document.as_ref().map_or(0, Document::version)
    }

    fn sweep(&mut self) {
        let now = Instant::now();

        let liveness = self.settings.liveness_timeout;
        let (expired, alive): (Vec<ClientSession>, Vec<ClientSession>) = std::mem::take(&mut self.sessions)
            .into_iter()
            .partition(|s| now.saturating_duration_since(s.last_seen) >= liveness);
        self.sessions = alive;

        let outcome = self.presence.sweep(now);
        let changed = !outcome.idled.is_empty();
        for entry in &outcome.expired {
            debug!("Presence of {} on {} expired", entry.user_id, self.doc_id);
        }

        let mut dropped = expired;
        let (gone, kept): (Vec<ClientSession>, Vec<ClientSession>) = std::mem::take(&mut self.sessions)
            .into_iter()
            .partition(|s| outcome.expired.iter().any(|e| e.user_id == s.user_id));
        self.sessions = kept;
        dropped.extend(gone);
        let mut departed = outcome.expired;

        for session in dropped {
            info!(
                "Connection {} of {} on {} missed its liveness window",
                session.connection_id, session.user_id, self.doc_id
            );
            let _ = session
                .outbound
                .send(ServerMessage::error(&SyncError::StaleSession, None));
            departed.extend(self.forget_user_if_gone(&session.user_id));
        }

        if changed || !departed.is_empty() {
            self.broadcast_presence(None, departed);
        }
        self.drain_if_empty();
    }

    fn forget_user_if_gone(&mut self, user_id: &str) -> Option<PresenceEntry> {
        if self.sessions.iter().any(|s| s.user_id == user_id) {
            return None;
        }
        self.presence.remove(user_id)
    }

    fn drain_if_empty(&mut self) {
        if self.sessions.is_empty() && self.state == CoordinatorState::Active {
            info!(
                "Document {} has no sessions left; draining for {:?}",
                self.doc_id, self.settings.drain_grace
            );
            self.state = CoordinatorState::Draining;
            self.evict_at = Some(Instant::now() + self.settings.drain_grace);
        }
    }

    /// Send the presence set to every session; `departed` users are listed
    /// once more as offline.
    fn broadcast_presence(&self, skip: Option<Uuid>, departed: Vec<PresenceEntry>) {
        let mut set = self.presence.snapshot();
        set.extend(departed);
        set.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        let message = ServerMessage::Presence(PresenceMessage {
            doc_id: self.doc_id.clone(),
            set,
        });
        for session in self.sessions.iter().filter(|s| Some(s.connection_id) != skip) {
            let _ = session.outbound.send(message.clone());
        }
    }

    fn session_mut(&mut self, connection_id: Uuid) -> Option<&mut ClientSession> {
        self.sessions.iter_mut().find(|s| s.connection_id == connection_id)
    }

    /// Remove this coordinator from the registry once its grace period ran out
    fn try_close(&mut self) -> bool {
        if !self.sessions.is_empty() {
            self.evict_at = None;
            return false;
        }
        if let Some(docs) = self.docs.upgrade() {
            let mut docs = docs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if docs.get(&self.doc_id).map(DocHandle::generation) == Some(self.generation) {
                docs.remove(&self.doc_id);
            }
        }
        info!("Document {} evicted ({:?} -> Closed)", self.doc_id, self.state);
        self.state = CoordinatorState::Closed;
        true
    }

    /// Refuse whatever was queued after the coordinator decided to close
    async fn shutdown(self, mut rx: mpsc::UnboundedReceiver<Command>) {
        rx.close();
        while let Some(command) = rx.recv().await {
            match command {
                Command::Attach { reply, .. } => {
                    let _ = reply.send(Err(SyncError::CoordinatorClosed));
                }
                Command::Submit { op, reply_to, .. } => {
                    let _ = reply_to.send(ServerMessage::error(&SyncError::StaleSession, Some(op.op_id)));
                }
                Command::CatchUp { reply_to, .. } => {
                    let _ = reply_to.send(ServerMessage::error(&SyncError::StaleSession, None));
                }
                Command::History { reply, .. } => {
                    let _ = reply.send(Err(SyncError::CoordinatorClosed));
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(Err(SyncError::CoordinatorClosed));
                }
                Command::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                Command::Heartbeat { .. } | Command::Detach { .. } => {}
            }
        }
        debug!("Coordinator for {} stopped", self.doc_id);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
