//! Best-effort fan-out of progress events to per-job subscribers.
//!
//! Nothing here is durable. Events published while nobody is subscribed to a
//! job are dropped; clients recover the authoritative state by reading the job.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use redis::AsyncCommands;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::progress::ProgressEvent;

pub type ProgressHandler = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Outbound channel to connected browser clients (pub/sub, sockets).
pub trait ProgressTransport: Send + Sync {
    /// Must return promptly; the publisher calls it inline.
    fn forward(&self, event: &ProgressEvent);
}

#[derive(Default)]
pub struct ProgressRelay {
    subscribers: RwLock<HashMap<Uuid, Vec<(u64, ProgressHandler)>>>,
    next_id: AtomicU64,
    transport: Option<Arc<dyn ProgressTransport>>,
}

impl ProgressRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(transport: Arc<dyn ProgressTransport>) -> Self {
        Self {
            transport: Some(transport),
            ..Self::default()
        }
    }

    /// Register `handler` for events of `job_id` until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe<F>(self: &Arc<Self>, job_id: Uuid, handler: F) -> Subscription
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(job_id)
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            relay: Arc::downgrade(self),
            job_id,
            id,
            active: true,
        }
    }

    /// Subscribe through a bounded channel.
    ///
    /// When the receiver falls `capacity` events behind, the channel is
    /// closed: the receiver gets what was buffered and then `None`, and should
    /// read the job for its current state. A lagging receiver therefore never
    /// misses a terminal event without noticing.
    pub fn subscribe_channel(
        self: &Arc<Self>,
        job_id: Uuid,
        capacity: usize,
    ) -> (Subscription, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let tx = Mutex::new(Some(tx));
        let subscription = self.subscribe(job_id, move |event| {
            let mut slot = tx.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(sender) = slot.as_ref() else {
                return;
            };
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(job_id = %event.job_id, "Progress subscriber lagging, closing its channel");
                    *slot = None;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => *slot = None,
            }
        });
        (subscription, rx)
    }

    /// Deliver `event` to every current subscriber of its job, then to the
    /// transport. A panicking handler is logged and does not affect the others.
    pub fn publish(&self, event: ProgressEvent) {
        let handlers: Vec<ProgressHandler> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.job_id)
            .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::warn!(job_id = %event.job_id, kind = %event.kind(), "Progress handler panicked");
            }
        }

        if let Some(transport) = &self.transport {
            transport.forward(&event);
        }
    }

    pub fn subscriber_count(&self, job_id: Uuid) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .map_or(0, Vec::len)
    }

    fn remove(&self, job_id: Uuid, id: u64) {
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(subs) = subscribers.get_mut(&job_id) {
            subs.retain(|(sub_id, _)| *sub_id != id);
            if subs.is_empty() {
                subscribers.remove(&job_id);
            }
        }
    }
}

/// Handle for one registered handler. Dropping it unsubscribes.
pub struct Subscription {
    relay: Weak<ProgressRelay>,
    job_id: Uuid,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(relay) = self.relay.upgrade() {
            relay.remove(self.job_id, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Events waiting for the Redis publisher before new ones are dropped.
const REDIS_QUEUE_CAPACITY: usize = 1024;
/// Pause between connection attempts while Redis is unreachable.
const REDIS_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Publishes every event as JSON on the Redis channel
/// `conversion:progress:<job_id>`.
///
/// Events are queued to a background task so publishers never wait on Redis.
/// The queue is bounded; when it is full, events are dropped.
pub struct RedisTransport {
    tx: mpsc::Sender<ProgressEvent>,
}

impl RedisTransport {
    /// Must be called from within a Tokio runtime.
    pub fn spawn(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let (tx, rx) = mpsc::channel(REDIS_QUEUE_CAPACITY);
        tokio::spawn(publish_loop(client, rx));
        Ok(Self { tx })
    }
}

impl ProgressTransport for RedisTransport {
    fn forward(&self, event: &ProgressEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(event.clone()) {
            tracing::debug!(job_id = %event.job_id, "Redis publish queue full, event dropped");
        }
    }
}

pub fn redis_channel(job_id: Uuid) -> String {
    format!("conversion:progress:{job_id}")
}

async fn publish_loop(client: redis::Client, mut rx: mpsc::Receiver<ProgressEvent>) {
    let mut conn = None;
    let mut retry_at: Option<Instant> = None;
    while let Some(event) = rx.recv().await {
        if conn.is_none() {
            if retry_at.is_some_and(|at| Instant::now() < at) {
                continue;
            }
            match client.get_multiplexed_async_connection().await {
                Ok(c) => {
                    conn = Some(c);
                    retry_at = None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Redis unavailable, dropping progress events for a while");
                    retry_at = Some(Instant::now() + REDIS_RECONNECT_DELAY);
                    continue;
                }
            }
        }

        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize progress event");
                continue;
            }
        };

        if let Some(c) = conn.as_mut() {
            if let Err(e) = c.publish::<_, _, ()>(redis_channel(event.job_id), payload).await {
                tracing::warn!(error = %e, "Redis publish failed, reconnecting on next event");
                conn = None;
            }
        }
    }
}
