//! The executor loop: couples `Ready` work units with registered handlers,
//! retries on transient storage conflicts, and runs the lease reaper and
//! the counter applier as sibling background tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::handler::{CommandRegistry, FailureClass, Outcome};
use crate::model::ExceptionCategory;
use crate::store::{DispatchOutcome, LeaseOutcome, Store};

const MAX_RETRY_ATTEMPTS: u32 = 8;
const BASE_BACKOFF: StdDuration = StdDuration::from_millis(20);
const MAX_BACKOFF: StdDuration = StdDuration::from_secs(2);

/// Retry `op` while it fails with [`StoreError::Retryable`], using jittered
/// exponential backoff. Any other error propagates immediately. This is the
/// only place a row-lock deadlock or serialization failure is allowed to be
/// handled — by the time an error reaches handler code it is no longer
/// transient.
pub async fn retry_on_conflict<F, Fut, T>(mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(StoreError::Retryable) if attempt < MAX_RETRY_ATTEMPTS => {
                let backoff = BASE_BACKOFF
                    .saturating_mul(1 << attempt.min(6))
                    .min(MAX_BACKOFF);
                let jitter = StdDuration::from_millis(fastrand::u64(0..=backoff.as_millis() as u64));
                tracing::debug!(attempt, backoff_ms = jitter.as_millis() as u64, "retrying after storage conflict");
                tokio::time::sleep(jitter).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Configuration for one dispatcher instance.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub node: String,
    pub batch_size: i64,
    pub poll_interval: StdDuration,
    pub reap_interval: StdDuration,
    pub applier_interval: StdDuration,
    pub applier_batch: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            node: format!("node-{}", Uuid::new_v4()),
            batch_size: 16,
            poll_interval: StdDuration::from_millis(250),
            reap_interval: StdDuration::from_secs(5),
            applier_interval: StdDuration::from_secs(1),
            applier_batch: 500,
        }
    }
}

/// Builds a [`Dispatcher`] from a store, a handler registry, and config —
/// mirroring the builder pattern used elsewhere for wiring up runtimes.
pub struct DispatcherBuilder {
    store: Arc<dyn Store>,
    registry: CommandRegistry,
    config: DispatcherConfig,
}

impl DispatcherBuilder {
    pub fn new(store: Arc<dyn Store>, registry: CommandRegistry) -> Self {
        Self {
            store,
            registry,
            config: DispatcherConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            store: self.store,
            registry: Arc::new(self.registry),
            config: self.config,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn Store>,
    registry: Arc<CommandRegistry>,
    config: DispatcherConfig,
}

/// A running dispatcher. Dropping or calling [`DispatcherHandle::shutdown`]
/// asks all worker, reaper, and applier tasks to stop after their current
/// unit of work; it does not forcibly cancel an in-flight handler.
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

impl Dispatcher {
    /// Spawn one worker task per registered payload type, plus the reaper
    /// and applier tasks. Returns a handle that can request shutdown.
    pub fn start(&self) -> DispatcherHandle {
        let (tx, rx) = watch::channel(false);
        let mut tasks = Vec::new();

        for payload_type in self.registry.payload_types() {
            let store = self.store.clone();
            let registry = self.registry.clone();
            let config = self.config.clone();
            let mut shutdown = rx.clone();
            let payload_type = payload_type.to_string();
            tasks.push(tokio::spawn(
                async move {
                    worker_loop(store, registry, config, payload_type, &mut shutdown).await;
                }
                .in_current_span(),
            ));
        }

        {
            let store = self.store.clone();
            let interval = self.config.reap_interval;
            let mut shutdown = rx.clone();
            tasks.push(tokio::spawn(async move {
                reaper_loop(store, interval, &mut shutdown).await;
            }));
        }

        {
            let store = self.store.clone();
            let interval = self.config.applier_interval;
            let batch = self.config.applier_batch;
            let mut shutdown = rx.clone();
            tasks.push(tokio::spawn(async move {
                applier_loop(store, interval, batch, &mut shutdown).await;
            }));
        }

        DispatcherHandle { shutdown: tx, tasks }
    }
}

async fn worker_loop(
    store: Arc<dyn Store>,
    registry: Arc<CommandRegistry>,
    config: DispatcherConfig,
    payload_type: String,
    shutdown: &mut watch::Receiver<bool>,
) {
    let ttl = registry
        .lease_ttl(&payload_type)
        .unwrap_or_else(|| Duration::seconds(60));
    let mut tick = tokio::time::interval(config.poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tick.tick() => {
                if let Err(err) = run_batch(&store, &registry, &config, &payload_type, ttl).await {
                    tracing::error!(payload_type = %payload_type, error = %err, "dispatcher batch failed");
                }
            }
        }
    }
}

async fn run_batch(
    store: &Arc<dyn Store>,
    registry: &Arc<CommandRegistry>,
    config: &DispatcherConfig,
    payload_type: &str,
    ttl: Duration,
) -> StoreResult<()> {
    let claimed = retry_on_conflict(|| {
        store.claim_ready(payload_type, config.batch_size, &config.node, Utc::now(), ttl)
    })
    .await?;

    for unit in claimed {
        let store = store.clone();
        let registry = registry.clone();
        let payload_type = payload_type.to_string();
        tokio::spawn(async move {
            execute_one(store, registry, unit, payload_type, ttl).await;
        });
    }
    Ok(())
}

#[tracing::instrument(skip(store, registry), fields(work_unit_id = unit.id))]
async fn execute_one(
    store: Arc<dyn Store>,
    registry: Arc<CommandRegistry>,
    unit: crate::model::WorkUnit,
    payload_type: String,
    ttl: Duration,
) {
    let Some(lease_holder) = unit.lease_holder else {
        tracing::error!("claimed work unit has no lease_holder; skipping");
        return;
    };

    let deadline = ttl
        .to_std()
        .unwrap_or(StdDuration::from_secs(60));

    let outcome = tokio::time::timeout(deadline, async {
        registry.dispatch(&payload_type, unit.payload.clone()).await
    })
    .await;

    let dispatch_outcome = match outcome {
        Err(_timeout) => {
            tracing::warn!("handler exceeded its lease deadline, treating as transient");
            let _ = store
                .log_exception(
                    unit.id,
                    ExceptionCategory::Transient,
                    "handler exceeded lease deadline",
                    "",
                )
                .await;
            DispatchOutcome::Reschedule(Utc::now() + Duration::seconds(30) + jitter())
        }
        Ok(None) => {
            tracing::error!("no handler registered for payload type");
            return;
        }
        Ok(Some(Ok(Outcome::Succeeded))) => DispatchOutcome::Succeeded,
        Ok(Some(Ok(Outcome::Infeasible))) => DispatchOutcome::Infeasible,
        Ok(Some(Ok(Outcome::Reschedule(delay)))) => DispatchOutcome::Reschedule(Utc::now() + delay),
        Ok(Some(Err(err))) => {
            let class = registry.classify(&payload_type, &err);
            let category = match class {
                FailureClass::Transient => ExceptionCategory::Transient,
                FailureClass::Permanent => ExceptionCategory::Permanent,
            };
            let _ = store
                .log_exception(unit.id, category, &err.to_string(), &format!("{err:?}"))
                .await;
            match class {
                FailureClass::Transient => {
                    DispatchOutcome::Reschedule(Utc::now() + Duration::seconds(30))
                }
                FailureClass::Permanent => DispatchOutcome::Infeasible,
            }
        }
    };

    let result = retry_on_conflict(|| {
        store.apply_outcome_if_leased(unit.id, lease_holder, dispatch_outcome.clone())
    })
    .await;

    match result {
        Ok(LeaseOutcome::Applied) => {}
        Ok(LeaseOutcome::StaleLease) => {
            tracing::debug!("lease expired before outcome could be applied; discarding");
        }
        Err(err @ StoreError::ContractViolation { id, .. }) => {
            tracing::error!(work_unit_id = id, error = %err, "contract violation applying dispatch outcome");
            let message = err.to_string();
            let _ = store.log_exception(id, ExceptionCategory::ContractViolation, &message, "").await;
        }
        Err(err) => tracing::error!(error = %err, "failed to apply dispatch outcome"),
    }
}

/// A few seconds of jitter so that many units timing out at once don't all
/// come back up for reschedule in lockstep. No work unit tracks an attempt
/// count, so this is a fixed delay rather than a growing one.
fn jitter() -> Duration {
    Duration::milliseconds(fastrand::i64(0..=5_000))
}

async fn reaper_loop(store: Arc<dyn Store>, interval: StdDuration, shutdown: &mut watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tick.tick() => {
                match retry_on_conflict(|| store.reap_expired_leases(Utc::now())).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(reaped = n, "reaped expired leases"),
                    Err(err) => tracing::error!(error = %err, "lease reaper failed"),
                }
            }
        }
    }
}

async fn applier_loop(
    store: Arc<dyn Store>,
    interval: StdDuration,
    batch: i64,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tick.tick() => {
                match retry_on_conflict(|| store.apply_counter_deltas(batch)).await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(applied = n, "applied counter deltas"),
                    Err(err) => tracing::error!(error = %err, "counter applier failed"),
                }
            }
        }
    }
}
