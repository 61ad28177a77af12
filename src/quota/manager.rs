//! Quota manager: admission decisions and cross-node reconciliation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::QuotaConfig;
use crate::grpc::proto::waterline::v1::{Allocation, Update};
use crate::mesh::UpdatePublisher;

use super::counter::Counter;
use super::unix_now;

/// Bound on locally accepted allocations awaiting the reconciliation task.
const ALLOC_QUEUE_DEPTH: usize = 100;

/// Admission errors returned to callers of [`QuotaManager::allocate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocateError {
    /// Rate or window limit exceeded. Recoverable by caller backoff.
    #[error("too many requests")]
    TooManyRequests,
    /// Internal fault, e.g. a saturated reconciliation queue.
    #[error("internal server error")]
    ServerError,
}

/// Counter key for a (resource, bucket) pair.
fn key(resource: &str, bucket: &str) -> String {
    format!("{}:{}", resource, bucket)
}

/// The quota manager owns all counters, applies the admission policy and
/// both emits and consumes reconciliation broadcasts.
///
/// A fleet of managers converges on an approximate global limit: each
/// node admits against its own counters, which combine real-time local
/// usage with periodically broadcast usage from peers. Staleness is
/// bounded by the flush interval.
pub struct QuotaManager {
    /// Process-unique id, used to discard self-originated broadcasts.
    id: String,
    config: QuotaConfig,
    /// Guards structural changes only; each counter synchronizes its own
    /// count operations.
    counters: Mutex<HashMap<String, Arc<Counter>>>,
    alloc_tx: mpsc::Sender<Allocation>,
    /// Taken by the reconciliation task on start.
    alloc_rx: Mutex<Option<mpsc::Receiver<Allocation>>>,
    shutdown: watch::Sender<bool>,
}

impl QuotaManager {
    /// Create a new manager. The reconciliation task is not running until
    /// [`QuotaManager::start`] is called.
    pub fn new(config: QuotaConfig) -> Self {
        let (alloc_tx, alloc_rx) = mpsc::channel(ALLOC_QUEUE_DEPTH);
        let (shutdown, _) = watch::channel(false);

        Self {
            id: Uuid::new_v4().to_string(),
            config,
            counters: Mutex::new(HashMap::new()),
            alloc_tx,
            alloc_rx: Mutex::new(Some(alloc_rx)),
            shutdown,
        }
    }

    /// This node's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Spawn the reconciliation task, publishing flushed usage through
    /// `publisher`. Subsequent calls are no-ops.
    pub fn start(self: &Arc<Self>, publisher: Arc<dyn UpdatePublisher>) {
        let Some(allocs) = self.alloc_rx.lock().take() else {
            warn!("reconciliation task already started");
            return;
        };

        info!(node_id = %self.id, "starting reconciliation task");

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run(allocs, publisher).await;
        });
    }

    /// Admit an allocation request for `resource`/`bucket`.
    ///
    /// Grants up to the remaining per-second headroom, capping rather than
    /// rejecting once past the hard limits. Accepted allocations are
    /// queued for the next reconciliation flush.
    pub fn allocate(
        &self,
        resource: &str,
        bucket: &str,
        requested: i64,
    ) -> Result<i64, AllocateError> {
        let k = key(resource, bucket);

        trace!(key = %k, requested, "allocation requested");

        let mut counters = self.counters.lock();
        let counter = counters
            .entry(k.clone())
            .or_insert_with(|| {
                debug!(key = %k, window_secs = self.config.window_secs, "creating counter");
                Counter::new(
                    self.config.window_secs,
                    Duration::from_secs(self.config.slide_interval_secs),
                )
            })
            .clone();

        let current = counter.current();
        let window_used = counter.window_total();

        if current >= self.config.rate_limit {
            debug!(key = %k, current, "rate limit exceeded");
            return Err(AllocateError::TooManyRequests);
        }

        if self.config.total_limit > 0 && window_used >= self.config.total_limit {
            debug!(key = %k, window_used, "window total limit exceeded");
            return Err(AllocateError::TooManyRequests);
        }

        // Cap to the remaining per-second headroom.
        let granted = requested.min(self.config.rate_limit - current);

        counter.increment(granted);
        drop(counters);

        // Hand the accepted allocation to the reconciliation task. A full
        // queue degrades the request, not the admission path latency.
        self.alloc_tx
            .try_send(Allocation {
                resource: resource.to_string(),
                bucket: bucket.to_string(),
                total: granted,
                timestamp: unix_now(),
            })
            .map_err(|_| AllocateError::ServerError)?;

        trace!(key = %k, granted, "allocation granted");

        Ok(granted)
    }

    /// Merge a usage update broadcast by a peer node.
    ///
    /// Self-originated updates are discarded; broadcasts are delivered to
    /// all participants including the sender. Remote usage is merged
    /// unconditionally, admission already happened at the origin.
    pub fn apply_update(&self, update: &Update) {
        if update.origin_id == self.id {
            trace!("discarding self-originated update");
            return;
        }

        debug!(
            origin = %update.origin_id,
            allocations = update.allocations.len(),
            "applying usage update"
        );

        let mut counters = self.counters.lock();
        for alloc in &update.allocations {
            let k = key(&alloc.resource, &alloc.bucket);
            let counter = counters
                .entry(k)
                .or_insert_with(|| {
                    Counter::new(
                        self.config.window_secs,
                        Duration::from_secs(self.config.slide_interval_secs),
                    )
                })
                .clone();

            counter.increment_at(alloc.total, alloc.timestamp);
        }
    }

    /// Window usage for a key, `None` if no counter exists. Primarily
    /// useful for tests.
    pub fn window_total(&self, resource: &str, bucket: &str) -> Option<i64> {
        let counters = self.counters.lock();
        counters.get(&key(resource, bucket)).map(|c| c.window_total())
    }

    /// Number of live counters.
    pub fn counter_count(&self) -> usize {
        self.counters.lock().len()
    }

    /// Stop the reconciliation task and every counter's slide task.
    /// Idempotent.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        for counter in self.counters.lock().values() {
            counter.stop();
        }
    }

    /// Reconciliation loop: drains accepted allocations into an aggregate,
    /// flushes the aggregate as a broadcast on the flush tick and sweeps
    /// idle counters on the slower sweep tick.
    async fn run(
        &self,
        mut allocs: mpsc::Receiver<Allocation>,
        publisher: Arc<dyn UpdatePublisher>,
    ) {
        let flush_period = Duration::from_secs(self.config.flush_interval_secs);
        let sweep_period = Duration::from_secs(self.config.sweep_interval_secs);

        let mut flush = interval_at(Instant::now() + flush_period, flush_period);
        let mut sweep = interval_at(Instant::now() + sweep_period, sweep_period);

        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }

        // Pending aggregate, owned exclusively by this task.
        let mut pending: HashMap<String, Allocation> = HashMap::new();

        loop {
            tokio::select! {
                Some(alloc) = allocs.recv() => {
                    let k = key(&alloc.resource, &alloc.bucket);
                    match pending.get_mut(&k) {
                        Some(aggregate) => aggregate.total += alloc.total,
                        None => {
                            pending.insert(k, alloc);
                        }
                    }
                }
                _ = flush.tick() => {
                    self.flush(&mut pending, publisher.as_ref()).await;
                }
                _ = sweep.tick() => {
                    self.sweep_idle();
                }
                _ = shutdown.changed() => {
                    debug!("reconciliation task stopping");
                    break;
                }
            }
        }
    }

    /// Broadcast the pending aggregate, if any, and clear it.
    async fn flush(&self, pending: &mut HashMap<String, Allocation>, publisher: &dyn UpdatePublisher) {
        if pending.is_empty() {
            return;
        }

        let update = Update {
            origin_id: self.id.clone(),
            timestamp: unix_now(),
            allocations: pending.drain().map(|(_, alloc)| alloc).collect(),
        };

        debug!(allocations = update.allocations.len(), "publishing usage update");

        // Best effort. Publish failures are not retried, peers catch up
        // on the next flush.
        if let Err(e) = publisher.publish(&update).await {
            warn!(error = %e, "failed to publish usage update");
        }
    }

    /// Stop and remove counters idle longer than the idle TTL.
    fn sweep_idle(&self) {
        let mut counters = self.counters.lock();
        counters.retain(|k, counter| {
            let idle = counter.idle_secs();
            if idle > self.config.idle_ttl_secs {
                debug!(key = %k, idle_secs = idle, "removing idle counter");
                counter.stop();
                false
            } else {
                true
            }
        });
    }
}
