//! In-process message bus: named actor mailboxes, correlation ids for
//! fire-and-forget calls, a heartbeat table and the telemetry broadcast.

use crate::telemetry::{TelemetryPublisher, TelemetryRecord, TELEMETRY_BROADCAST_BUFFER_SIZE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

pub type CorrelationId = u64;

/// How long an unclaimed reply stays fetchable by default.
pub const DEFAULT_REPLY_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("no actor named {0:?} is registered")]
    UnknownActor(String),
    #[error("an actor named {0:?} is already registered")]
    DuplicateActor(String),
    #[error("no pending call with correlation id {0}")]
    UnknownCorrelation(CorrelationId),
}

/// Result of one remote call as seen by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Ok(Value),
    Err(String),
}

impl Reply {
    pub fn into_result(self) -> Result<Value, String> {
        match self {
            Reply::Ok(value) => Ok(value),
            Reply::Err(message) => Err(message),
        }
    }
}

#[derive(Debug)]
pub struct Call {
    pub id: CorrelationId,
    pub operation: String,
    pub args: Value,
    responder: oneshot::Sender<Reply>,
}

impl Call {
    /// Delivers the reply. Returns `false` if nobody can collect it anymore.
    pub fn respond(self, reply: Reply) -> bool {
        self.responder.send(reply).is_ok()
    }
}

#[derive(Debug)]
pub enum Delivery {
    Call(Call),
    Timeout,
    Disconnected,
}

/// The bus as the actor loop sees it.
pub trait Mailbox: Send + 'static {
    fn name(&self) -> &str;

    /// Waits at most `timeout` for the next call.
    fn poll(&mut self, timeout: Duration) -> impl Future<Output = Delivery> + Send;

    fn heartbeat(&mut self);
}

#[derive(Debug)]
struct Registration {
    generation: u64,
    sender: mpsc::UnboundedSender<Call>,
}

#[derive(Debug)]
struct PendingReply {
    receiver: oneshot::Receiver<Reply>,
    queued_at: Instant,
}

#[derive(Debug)]
struct BusInner {
    mailboxes: Mutex<HashMap<String, Registration>>,
    pending: Mutex<HashMap<CorrelationId, PendingReply>>,
    heartbeats: Mutex<HashMap<String, Instant>>,
    telemetry: broadcast::Sender<TelemetryRecord>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
    reply_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Bus {
    pub fn new() -> Self {
        Self::with_reply_ttl(DEFAULT_REPLY_TTL)
    }

    /// Bus whose unclaimed replies are dropped once older than `reply_ttl`.
    pub fn with_reply_ttl(reply_ttl: Duration) -> Self {
        let (telemetry, _) = broadcast::channel(TELEMETRY_BROADCAST_BUFFER_SIZE);
        Self {
            inner: Arc::new(BusInner {
                mailboxes: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                heartbeats: Mutex::new(HashMap::new()),
                telemetry,
                next_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                reply_ttl,
            }),
        }
    }

    pub fn register(&self, name: &str) -> Result<ActorEndpoint, BusError> {
        let mut mailboxes = lock(&self.inner.mailboxes);
        if mailboxes.get(name).is_some_and(|current| !current.sender.is_closed()) {
            return Err(BusError::DuplicateActor(name.to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        mailboxes.insert(name.to_string(), Registration { generation, sender });
        debug!("registered actor {}", name);

        Ok(ActorEndpoint {
            name: name.to_string(),
            receiver,
            generation,
            bus: self.clone(),
        })
    }

    /// Removes the actor's mailbox. Its loop drains what is already queued
    /// and then sees the mailbox disconnect.
    pub fn deregister(&self, name: &str) -> bool {
        let removed = lock(&self.inner.mailboxes).remove(name).is_some();
        if removed {
            debug!("deregistered actor {}", name);
        }
        removed
    }

    pub fn actors(&self) -> Vec<String> {
        lock(&self.inner.mailboxes)
            .iter()
            .filter(|(_, registration)| !registration.sender.is_closed())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Queues a call on the actor's mailbox and returns immediately.
    pub fn call_async(&self, actor: &str, operation: &str, args: Value) -> Result<CorrelationId, BusError> {
        let sender = lock(&self.inner.mailboxes)
            .get(actor)
            .map(|registration| registration.sender.clone())
            .ok_or_else(|| BusError::UnknownActor(actor.to_string()))?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (responder, receiver) = oneshot::channel();
        let call = Call {
            id,
            operation: operation.to_string(),
            args,
            responder,
        };

        sender.send(call).map_err(|_| BusError::UnknownActor(actor.to_string()))?;

        let mut pending = lock(&self.inner.pending);
        self.evict_expired(&mut pending);
        pending.insert(
            id,
            PendingReply {
                receiver,
                queued_at: Instant::now(),
            },
        );
        drop(pending);
        debug!("queued {}#{} for {}", operation, id, actor);
        Ok(id)
    }

    /// Fetches the reply for `id`, waiting at most `timeout`.
    ///
    /// `Ok(None)` means the actor has not answered yet; the call stays
    /// fetchable. A delivered reply is handed out exactly once.
    pub async fn read_response(&self, id: CorrelationId, timeout: Duration) -> Result<Option<Reply>, BusError> {
        let mut entry = lock(&self.inner.pending)
            .remove(&id)
            .ok_or(BusError::UnknownCorrelation(id))?;

        match tokio::time::timeout(timeout, &mut entry.receiver).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => {
                warn!("call #{} was dropped without a reply", id);
                Ok(Some(Reply::Err("actor dropped the call without replying".to_string())))
            }
            Err(_) => {
                lock(&self.inner.pending).insert(id, entry);
                Ok(None)
            }
        }
    }

    /// Calls whose replies are still waiting to be fetched.
    pub fn pending_calls(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    fn evict_expired(&self, pending: &mut HashMap<CorrelationId, PendingReply>) {
        let before = pending.len();
        pending.retain(|_, entry| entry.queued_at.elapsed() < self.inner.reply_ttl);
        let evicted = before - pending.len();
        if evicted > 0 {
            debug!("dropped {} unclaimed repl(ies) older than {:?}", evicted, self.inner.reply_ttl);
        }
    }

    pub fn record_heartbeat(&self, actor: &str) {
        lock(&self.inner.heartbeats).insert(actor.to_string(), Instant::now());
    }

    pub fn last_heartbeat(&self, actor: &str) -> Option<Instant> {
        lock(&self.inner.heartbeats).get(actor).copied()
    }

    pub fn is_alive(&self, actor: &str, max_age: Duration) -> bool {
        self.last_heartbeat(actor)
            .is_some_and(|seen| seen.elapsed() <= max_age)
    }

    pub fn publisher(&self) -> TelemetryPublisher {
        TelemetryPublisher::new(self.inner.telemetry.clone())
    }

    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<TelemetryRecord> {
        self.inner.telemetry.subscribe()
    }

    fn unregister(&self, name: &str, generation: u64) {
        let mut mailboxes = lock(&self.inner.mailboxes);
        if mailboxes.get(name).is_some_and(|current| current.generation == generation) {
            mailboxes.remove(name);
            debug!("unregistered actor {}", name);
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// An actor's registration on the bus. Dropping it unregisters the actor.
#[derive(Debug)]
pub struct ActorEndpoint {
    name: String,
    receiver: mpsc::UnboundedReceiver<Call>,
    generation: u64,
    bus: Bus,
}

impl Mailbox for ActorEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self, timeout: Duration) -> impl Future<Output = Delivery> + Send {
        async move {
            match tokio::time::timeout(timeout, self.receiver.recv()).await {
                Ok(Some(call)) => Delivery::Call(call),
                Ok(None) => Delivery::Disconnected,
                Err(_) => Delivery::Timeout,
            }
        }
    }

    fn heartbeat(&mut self) {
        self.bus.record_heartbeat(&self.name);
    }
}

impl Drop for ActorEndpoint {
    fn drop(&mut self) {
        self.bus.unregister(&self.name, self.generation);
    }
}
