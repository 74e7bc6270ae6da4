//! Controller runtime.
//!
//! Turns typed watch streams into keys, feeds them through a deduplicating
//! queue and runs one reconcile at a time per controller. Whatever the
//! reconciler returns is executed here:
//!
//! - `Action::Done`: forget the key until the next event.
//! - `Action::Requeue` / `Action::RequeueAfter`: run it again.
//! - `Err(_)`: run it again after an exponential backoff, reset on success.
//!
//! A lagged watch stream resyncs the controller's primary kind.

mod queue;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ipruler_reconcile::{Action, BackoffPolicy};
use tokio::sync::{broadcast, broadcast::error::RecvError, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ReconcileError;
use crate::resources::{ObjectKey, Resource};
use crate::store::WatchEvent;

use self::queue::WorkQueue;

const TRIGGER_CAPACITY: usize = 1024;

/// Triggers taken between two reconciles.
const TRIGGER_BATCH: usize = 64;

/// A level-triggered reconciler for one primary kind.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Controller name used in logs.
    fn name(&self) -> &'static str;

    /// Converge `key` towards its desired state.
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;

    /// Every key of the primary kind. Enqueued at start and after a lag.
    async fn resync(&self) -> Result<Vec<ObjectKey>, ReconcileError>;
}

#[derive(Debug)]
enum Trigger {
    Key(ObjectKey),
    Resync,
}

type Source =
    Box<dyn FnOnce(mpsc::Sender<Trigger>, watch::Receiver<bool>) -> JoinHandle<()> + Send>;

/// Drives one [`Reconciler`] from any number of watch streams.
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    shutdown: watch::Receiver<bool>,
    backoff: BackoffPolicy,
    sources: Vec<Source>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            reconciler,
            shutdown,
            backoff: BackoffPolicy::default(),
            sources: Vec::new(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Feed events of kind `K` into the queue. `mapper` picks the keys to
    /// enqueue for each event and acts as the predicate: an empty result
    /// drops the event.
    pub fn watches<K, F>(self, events: broadcast::Receiver<WatchEvent<K>>, mapper: F) -> Self
    where
        K: Resource,
        F: Fn(&WatchEvent<K>) -> Vec<ObjectKey> + Send + Sync + 'static,
    {
        self.source(events, move |event| {
            mapper(event).into_iter().map(Trigger::Key).collect()
        })
    }

    /// Resync the primary kind whenever `predicate` accepts an event of kind `K`.
    ///
    /// For secondary changes whose affected keys cannot be named from the
    /// event alone.
    pub fn resyncs_on<K, P>(self, events: broadcast::Receiver<WatchEvent<K>>, predicate: P) -> Self
    where
        K: Resource,
        P: Fn(&WatchEvent<K>) -> bool + Send + Sync + 'static,
    {
        self.source(events, move |event| {
            if predicate(event) {
                vec![Trigger::Resync]
            } else {
                Vec::new()
            }
        })
    }

    fn source<K, F>(mut self, events: broadcast::Receiver<WatchEvent<K>>, triggers: F) -> Self
    where
        K: Resource,
        F: Fn(&WatchEvent<K>) -> Vec<Trigger> + Send + Sync + 'static,
    {
        let controller = self.reconciler.name();
        self.sources.push(Box::new(move |tx, shutdown| {
            tokio::spawn(forward(controller, events, triggers, tx, shutdown))
        }));
        self
    }

    /// Run until shutdown is signaled.
    #[instrument(skip_all, fields(controller = self.reconciler.name()))]
    pub async fn run(self) {
        let Self {
            reconciler,
            mut shutdown,
            backoff,
            sources,
        } = self;

        let (tx, mut rx) = mpsc::channel(TRIGGER_CAPACITY);
        let forwarders: Vec<JoinHandle<()>> = sources
            .into_iter()
            .map(|source| source(tx.clone(), shutdown.clone()))
            .collect();

        info!(sources = forwarders.len(), "Starting controller");

        let mut worker = Worker {
            reconciler,
            backoff,
            tx,
            queue: WorkQueue::default(),
            failures: HashMap::new(),
        };
        worker.resync().await;

        loop {
            let deadline = worker.queue.next_deadline();
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = std::future::ready(()), if worker.queue.has_ready() => {
                    if let Some(key) = worker.queue.pop() {
                        worker.process(key).await;
                    }
                    // Take what arrived meanwhile so triggers keep pace with work.
                    for _ in 0..TRIGGER_BATCH {
                        match rx.try_recv() {
                            Ok(trigger) => worker.accept(trigger).await,
                            Err(_) => break,
                        }
                    }
                }
                trigger = rx.recv() => match trigger {
                    Some(trigger) => worker.accept(trigger).await,
                    None => break,
                },
                _ = sleep_until_due(deadline), if deadline.is_some() => {
                    worker.queue.promote_due(Instant::now());
                }
            }
        }

        for forwarder in forwarders {
            forwarder.abort();
        }
        info!(pending = worker.queue.len(), "Controller shutting down");
    }
}

struct Worker<R: Reconciler> {
    reconciler: Arc<R>,
    backoff: BackoffPolicy,
    tx: mpsc::Sender<Trigger>,
    queue: WorkQueue,
    failures: HashMap<ObjectKey, u32>,
}

impl<R: Reconciler> Worker<R> {
    async fn accept(&mut self, trigger: Trigger) {
        match trigger {
            Trigger::Key(key) => self.queue.push(key),
            Trigger::Resync => self.resync().await,
        }
    }

    async fn process(&mut self, key: ObjectKey) {
        match self.reconciler.reconcile(&key).await {
            Ok(action) => {
                self.failures.remove(&key);
                match action {
                    Action::Done => {}
                    Action::Requeue => self.queue.push(key),
                    Action::RequeueAfter(delay) => {
                        self.queue.push_after(key, Instant::now() + delay)
                    }
                }
            }
            Err(e) => {
                let attempt = self.failures.entry(key.clone()).or_insert(0);
                let delay = self.backoff.delay(*attempt);
                *attempt = attempt.saturating_add(1);
                error!(
                    namespace = %key.namespace,
                    name = %key.name,
                    attempt = *attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Reconcile failed"
                );
                self.queue.push_after(key, Instant::now() + delay);
            }
        }
    }

    async fn resync(&mut self) {
        match self.reconciler.resync().await {
            Ok(keys) => {
                debug!(keys = keys.len(), "Resynced");
                for key in keys {
                    self.queue.push(key);
                }
            }
            Err(e) => {
                let delay = self.backoff.delay(0);
                warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Resync failed");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Trigger::Resync).await;
                });
            }
        }
    }
}

async fn sleep_until_due(deadline: Option<Instant>) {
    tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)).await
}

async fn forward<K, F>(
    controller: &'static str,
    mut events: broadcast::Receiver<WatchEvent<K>>,
    triggers_for: F,
    tx: mpsc::Sender<Trigger>,
    mut shutdown: watch::Receiver<bool>,
) where
    K: Resource,
    F: Fn(&WatchEvent<K>) -> Vec<Trigger>,
{
    loop {
        tokio::select! {
            event = events.recv() => {
                let triggers: Vec<Trigger> = match event {
                    Ok(event) => triggers_for(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(controller, kind = K::KIND, skipped, "Watch lagged, resyncing");
                        vec![Trigger::Resync]
                    }
                    Err(RecvError::Closed) => return,
                };
                for trigger in triggers {
                    if tx.send(trigger).await.is_err() {
                        return;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Maps an event to the key of the record it carries.
pub fn own_key<K: Resource>(event: &WatchEvent<K>) -> Vec<ObjectKey> {
    vec![event.object().key()]
}
