use crate::backend::{Backend, FetchError};
use crate::metrics::Metrics;
use crate::model::{self, MetricsSnapshot};
use crate::session::{now_unix, Host, SessionRegistry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Classified poll-time failure, published in place of a snapshot. None of
/// these stop the polling loop.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PollError {
    #[error("host has no active session")]
    NotConnected,
    #[error("remote metrics command failed: {0}")]
    RemoteFetch(String),
    #[error("{0}")]
    Unknown(String),
}

/// Latest published state for one host. `Pending` only exists before the
/// first fetch completes; after that a subscriber always sees either the
/// most recent snapshot or the most recent classified error.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum PollState {
    Pending,
    Snapshot(MetricsSnapshot),
    Error(PollError),
}

struct HostPoller {
    // Generation marker: a subscription only detaches from the generation
    // it attached to, so a stale drop cannot cancel a replacement poller.
    generation: u64,
    latest: watch::Receiver<PollState>,
    cancel: watch::Sender<bool>,
    subscribers: usize,
}

/// Runs one independent polling task per connected host. Each task owns its
/// own publish slot (a watch channel); the only structure shared across
/// tasks is the session registry it consults before every fetch.
#[derive(Clone)]
pub struct MetricsPoller {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    backend: Arc<dyn Backend>,
    registry: SessionRegistry,
    metrics: Arc<Metrics>,
    interval: Duration,
    next_generation: AtomicU64,
    // std Mutex so Subscription::drop can decrement without an executor;
    // never held across an await.
    pollers: Mutex<HashMap<Host, HostPoller>>,
}

impl MetricsPoller {
    pub fn new(
        backend: Arc<dyn Backend>,
        registry: SessionRegistry,
        metrics: Arc<Metrics>,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                backend,
                registry,
                metrics,
                interval,
                next_generation: AtomicU64::new(0),
                pollers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts the polling task for a host, replacing (and cancelling) any
    /// task already running for it. A replaced task's subscribers keep their
    /// last published state and must re-subscribe.
    pub fn start(&self, host: Host) {
        let (state_tx, state_rx) = watch::channel(PollState::Pending);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        let previous = {
            let mut pollers = self.inner.pollers.lock().unwrap_or_else(|e| e.into_inner());
            pollers.insert(
                host.clone(),
                HostPoller {
                    generation,
                    latest: state_rx,
                    cancel: cancel_tx,
                    subscribers: 0,
                },
            )
        };
        if let Some(previous) = previous {
            let _ = previous.cancel.send(true);
        }

        let backend = self.inner.backend.clone();
        let registry = self.inner.registry.clone();
        let metrics = self.inner.metrics.clone();
        let interval = self.inner.interval;
        tokio::spawn(run_poller(
            host, backend, registry, metrics, interval, state_tx, cancel_rx,
        ));
    }

    /// Cancels the host's polling task outright (disconnect path).
    pub fn stop(&self, host: &Host) {
        let removed = {
            let mut pollers = self.inner.pollers.lock().unwrap_or_else(|e| e.into_inner());
            pollers.remove(host)
        };
        if let Some(poller) = removed {
            let _ = poller.cancel.send(true);
        }
    }

    pub fn is_running(&self, host: &Host) -> bool {
        let pollers = self.inner.pollers.lock().unwrap_or_else(|e| e.into_inner());
        pollers.contains_key(host)
    }

    pub fn running_count(&self) -> usize {
        let pollers = self.inner.pollers.lock().unwrap_or_else(|e| e.into_inner());
        pollers.len()
    }

    /// Point-in-time read of the latest published state, without counting as
    /// a subscriber.
    pub fn latest(&self, host: &Host) -> Option<PollState> {
        let pollers = self.inner.pollers.lock().unwrap_or_else(|e| e.into_inner());
        pollers.get(host).map(|p| p.latest.borrow().clone())
    }

    /// Subscribes to a host's published states. Dropping the returned handle
    /// unsubscribes; when the last subscriber is gone the polling task is
    /// cancelled.
    pub fn subscribe(&self, host: &Host) -> Option<Subscription> {
        let (generation, rx) = {
            let mut pollers = self.inner.pollers.lock().unwrap_or_else(|e| e.into_inner());
            let poller = pollers.get_mut(host)?;
            poller.subscribers += 1;
            (poller.generation, poller.latest.clone())
        };
        Some(Subscription {
            host: host.clone(),
            generation,
            rx,
            poller: self.clone(),
        })
    }

    fn unsubscribe(&self, host: &Host, generation: u64) {
        let last_gone = {
            let mut pollers = self.inner.pollers.lock().unwrap_or_else(|e| e.into_inner());
            match pollers.get_mut(host) {
                Some(poller) if poller.generation == generation => {
                    poller.subscribers = poller.subscribers.saturating_sub(1);
                    if poller.subscribers == 0 {
                        pollers.remove(host)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(poller) = last_gone {
            let _ = poller.cancel.send(true);
        }
    }
}

pub struct Subscription {
    host: Host,
    generation: u64,
    rx: watch::Receiver<PollState>,
    poller: MetricsPoller,
}

impl Subscription {
    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn current(&self) -> PollState {
        self.rx.borrow().clone()
    }

    /// Waits for the next published state. Errs once the polling task has
    /// been cancelled and the channel closed.
    pub async fn changed(&mut self) -> Result<PollState, watch::error::RecvError> {
        self.rx.changed().await?;
        Ok(self.rx.borrow_and_update().clone())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.poller.unsubscribe(&self.host, self.generation);
    }
}

async fn run_poller(
    host: Host,
    backend: Arc<dyn Backend>,
    registry: SessionRegistry,
    metrics: Arc<Metrics>,
    interval: Duration,
    state_tx: watch::Sender<PollState>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(host = %host, "poller started");

    loop {
        tokio::select! {
            _ = cancel_rx.changed() => {
                break;
            }
            _ = ticker.tick() => {
                let state = poll_once(&host, backend.as_ref(), &registry).await;
                metrics.inc_poll(poll_class(&state));
                // A cancellation that raced the in-flight fetch must not
                // publish a stale result.
                if *cancel_rx.borrow() {
                    break;
                }
                let _ = state_tx.send(state);
            }
        }
    }

    debug!(host = %host, "poller stopped");
}

/// One fetch-and-classify pass. Never returns `Pending` and never fails:
/// every outcome becomes a publishable state.
async fn poll_once(host: &Host, backend: &dyn Backend, registry: &SessionRegistry) -> PollState {
    match registry.get(host).await {
        Some(session) if session.is_connected() => {}
        _ => return PollState::Error(PollError::NotConnected),
    }

    match backend.fetch_metrics(host).await {
        Ok(payload) => match model::normalize(host, &payload, now_unix()) {
            Ok(snapshot) => PollState::Snapshot(snapshot),
            Err(err) => PollState::Error(PollError::Unknown(err.to_string())),
        },
        Err(FetchError::NotConnected) => PollState::Error(PollError::NotConnected),
        Err(FetchError::RemoteFetch(detail)) => PollState::Error(PollError::RemoteFetch(detail)),
        Err(FetchError::Transport(detail)) => PollState::Error(PollError::Unknown(detail)),
    }
}

fn poll_class(state: &PollState) -> &'static str {
    match state {
        PollState::Pending => "pending",
        PollState::Snapshot(_) => "snapshot",
        PollState::Error(PollError::NotConnected) => "not_connected",
        PollState::Error(PollError::RemoteFetch(_)) => "remote_fetch",
        PollState::Error(PollError::Unknown(_)) => "unknown",
    }
}
