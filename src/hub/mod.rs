//! Event hub: fan-out of pipeline events to live observers.
//!
//! Every observer owns a bounded inbound queue. [`EventHub::publish`] never
//! waits: it offers the event to each queue with `try_send`, and when a
//! queue is full the event is dropped for that observer only
//! (reject-newest). A slow observer therefore never stalls the pipeline or
//! other observers.
//!
//! The registry sits behind a reader/writer lock. Publish holds the shared
//! lock for the whole fan-out; subscribe and unsubscribe take the exclusive
//! lock. An observer subscribed after a publish started cannot see that
//! event, and one unsubscribed before it cannot receive it.
//!
//! The hub also runs a keepalive ticker (see [`EventHub::start`]) that
//! offers a [`Delivery::Keepalive`] to every queue at a fixed interval so
//! transports can detect half-open connections.

pub mod frame;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::types::Event;

/// Default per-observer queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Default keepalive interval.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(15);

/// Identity of one observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(Uuid);

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// What an observer receives from its queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A published pipeline event.
    Event(Event),
    /// Periodic liveness signal; carries no pipeline meaning.
    Keepalive,
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Observers whose queue accepted the event.
    pub delivered: usize,
    /// Observers that missed the event because their queue was full.
    pub dropped: usize,
}

/// Hub tuning.
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Bounded capacity of each observer's queue.
    pub queue_capacity: usize,
    /// Interval between keepalive signals.
    pub keepalive: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            keepalive: DEFAULT_KEEPALIVE,
        }
    }
}

/// Registry slot for one observer. Leaving the registry, whether by
/// unsubscribe, transport loss or hub stop, marks the observer detached.
struct Slot {
    tx: mpsc::Sender<Delivery>,
    dropped: Arc<AtomicU64>,
    attached: Arc<AtomicBool>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.attached.store(false, Ordering::Release);
    }
}

type Registry = RwLock<HashMap<ObserverId, Slot>>;

/// Explicitly owned pub-sub hub. Construct one per process and share it
/// by `Arc`.
pub struct EventHub {
    registry: Arc<Registry>,
    config: HubConfig,
    shutdown_tx: watch::Sender<bool>,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("config", &self.config)
            .field("observers", &self.observer_count())
            .finish_non_exhaustive()
    }
}

impl EventHub {
    /// Create a hub. No keepalives are sent until [`EventHub::start`].
    pub fn new(config: HubConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
            config: HubConfig {
                queue_capacity: config.queue_capacity.max(1),
                keepalive: config.keepalive,
            },
            shutdown_tx,
            keepalive_task: Mutex::new(None),
        }
    }

    /// Start the keepalive ticker. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut task = self
            .keepalive_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let interval = self.config.keepalive;
        let shutdown_rx = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(run_keepalive(registry, interval, shutdown_rx)));
        info!(keepalive_secs = interval.as_secs(), "event hub started");
    }

    /// Stop the keepalive ticker and close every observer queue.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self
            .keepalive_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let count = registry.len();
        registry.clear();
        info!(observers = count, "event hub stopped");
    }

    /// Register a new observer with an empty queue.
    pub fn subscribe(&self) -> Observer {
        let id = ObserverId(Uuid::new_v4());
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let attached = Arc::new(AtomicBool::new(true));
        {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            registry.insert(
                id,
                Slot {
                    tx,
                    dropped: Arc::clone(&dropped),
                    attached: Arc::clone(&attached),
                },
            );
        }
        debug!(observer = %id, "observer subscribed");
        Observer {
            id,
            rx,
            dropped,
            attached,
            registry: Arc::clone(&self.registry),
            open: true,
        }
    }

    /// Remove an observer and close its queue.
    pub fn unsubscribe(&self, observer: &mut Observer) {
        observer.close();
    }

    /// Offer `event` to every registered observer without waiting.
    pub fn publish(&self, event: Event) -> PublishReport {
        let mut report = PublishReport::default();
        let mut closed = Vec::new();
        {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            for (id, slot) in registry.iter() {
                match slot.tx.try_send(Delivery::Event(event.clone())) {
                    Ok(()) => report.delivered = report.delivered.saturating_add(1),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        report.dropped = report.dropped.saturating_add(1);
                        slot.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            observer = %id,
                            event_type = ?event.event_type,
                            entry_id = ?event.entry_id,
                            "observer queue full, event dropped"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        if !closed.is_empty() {
            remove_observers(&self.registry, &closed);
        }
        trace!(
            delivered = report.delivered,
            dropped = report.dropped,
            "event published"
        );
        report
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The hub's effective configuration.
    pub fn config(&self) -> HubConfig {
        self.config
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

fn remove_observers(registry: &Registry, ids: &[ObserverId]) {
    let mut registry = registry.write().unwrap_or_else(PoisonError::into_inner);
    for id in ids {
        if registry.remove(id).is_some() {
            debug!(observer = %id, "observer transport gone, unsubscribed");
        }
    }
}

async fn run_keepalive(
    registry: Arc<Registry>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let every = every.max(Duration::from_millis(1));
    let start = tokio::time::Instant::now()
        .checked_add(every)
        .unwrap_or_else(tokio::time::Instant::now);
    let mut ticker = tokio::time::interval_at(start, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut closed = Vec::new();
                {
                    let registry = registry.read().unwrap_or_else(PoisonError::into_inner);
                    for (id, slot) in registry.iter() {
                        // A full queue already proves the observer is attached.
                        if let Err(mpsc::error::TrySendError::Closed(_)) =
                            slot.tx.try_send(Delivery::Keepalive)
                        {
                            closed.push(*id);
                        }
                    }
                }
                if !closed.is_empty() {
                    remove_observers(&registry, &closed);
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!("keepalive ticker stopped");
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// A live subscription. Open on creation; closed by [`Observer::close`],
/// [`EventHub::unsubscribe`], hub shutdown, or drop.
pub struct Observer {
    id: ObserverId,
    rx: mpsc::Receiver<Delivery>,
    dropped: Arc<AtomicU64>,
    attached: Arc<AtomicBool>,
    registry: Arc<Registry>,
    open: bool,
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl Observer {
    /// This observer's identity.
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Whether the observer is still registered with the hub.
    ///
    /// False after [`Observer::close`], and also once the hub has stopped
    /// or dropped the registration.
    pub fn is_open(&self) -> bool {
        self.open && self.attached.load(Ordering::Acquire)
    }

    /// Events this observer missed because its queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait for the next delivery.
    ///
    /// Returns `None` once the observer is closed and its queue drained.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Take the next delivery if one is already queued.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next pipeline event, skipping keepalives.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await? {
                Delivery::Event(event) => return Some(event),
                Delivery::Keepalive => continue,
            }
        }
    }

    /// Unregister from the hub and close the queue.
    ///
    /// Deliveries already queued can still be drained with [`Observer::recv`].
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        remove_observers(&self.registry, &[self.id]);
        self.rx.close();
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.close();
    }
}

impl Stream for Observer {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
