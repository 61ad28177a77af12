//! Sliding-window usage counter.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tracing::trace;

/// Width of a single usage bucket.
const BUCKET_WIDTH: Duration = Duration::from_secs(1);

/// Seconds since the unix epoch for a wall-clock timestamp.
fn unix_secs(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Elapsed wall-clock time since `t`, zero if the clock moved backwards.
fn age(t: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(t)
        .unwrap_or(Duration::ZERO)
}

/// A single time slice of accrued usage, roughly one second wide.
struct Bucket {
    count: i64,
    first_seen: SystemTime,
    last_updated: SystemTime,
}

impl Bucket {
    fn new() -> Self {
        let now = SystemTime::now();
        Self {
            count: 0,
            first_seen: now,
            last_updated: now,
        }
    }
}

struct Window {
    /// Time-ascending buckets, the last element is current. Never empty.
    buckets: Vec<Bucket>,
    /// Time of the most recent increment of any kind, for idle detection.
    last_activity: SystemTime,
}

/// A sliding window of usage buckets for one resource bucket key.
///
/// The counter owns a background task that periodically appends a fresh
/// bucket and evicts buckets older than the window. Reads and writes are
/// serialized by an internal read/write lock, so counters for different
/// keys operate independently.
pub struct Counter {
    /// Window width in seconds enforced by this counter.
    window_secs: i64,
    inner: RwLock<Window>,
    shutdown: watch::Sender<bool>,
}

impl Counter {
    /// Create a new counter and spawn its slide task.
    pub fn new(window_secs: i64, slide_interval: Duration) -> Arc<Self> {
        let (shutdown, mut stopped) = watch::channel(false);

        let counter = Arc::new(Self {
            window_secs,
            inner: RwLock::new(Window {
                buckets: vec![Bucket::new()],
                last_activity: SystemTime::now(),
            }),
            shutdown,
        });

        let task = Arc::clone(&counter);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + slide_interval, slide_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => task.slide(),
                    _ = stopped.changed() => break,
                }
            }
        });

        counter
    }

    /// Usage accrued within the last second.
    ///
    /// The current bucket is only rolled lazily by [`Counter::increment`],
    /// so a current bucket older than one second reads as empty rather
    /// than stale-but-nonzero. The structure is left untouched.
    pub fn current(&self) -> i64 {
        let inner = self.inner.read();

        let Some(bucket) = inner.buckets.last() else {
            return 0;
        };

        if age(bucket.first_seen) > BUCKET_WIDTH {
            return 0;
        }

        bucket.count
    }

    /// Total usage across all buckets still within the window.
    ///
    /// Stale buckets are skipped, not removed; eviction belongs to the
    /// slide task.
    pub fn window_total(&self) -> i64 {
        let inner = self.inner.read();

        inner
            .buckets
            .iter()
            .filter(|b| age(b.last_updated).as_secs() as i64 <= self.window_secs)
            .map(|b| b.count)
            .sum()
    }

    /// Record locally admitted usage.
    ///
    /// Rolls a fresh bucket when the current one is older than one second,
    /// then adds the delta to the current bucket.
    pub fn increment(&self, amount: i64) {
        let mut inner = self.inner.write();
        let now = SystemTime::now();

        let rollover = inner
            .buckets
            .last()
            .map_or(true, |b| age(b.first_seen) > BUCKET_WIDTH);
        if rollover {
            inner.buckets.push(Bucket::new());
        }

        if let Some(bucket) = inner.buckets.last_mut() {
            bucket.count += amount;
            bucket.last_updated = now;
        }
        inner.last_activity = now;
    }

    /// Record remote usage reported at `timestamp` (unix seconds).
    ///
    /// Scans newest to oldest and adds the delta to the first bucket
    /// created at or before the timestamp. Usage older than every
    /// retained bucket is unrecoverable and silently dropped.
    pub fn increment_at(&self, amount: i64, timestamp: i64) {
        let mut inner = self.inner.write();

        let mut applied = false;
        for bucket in inner.buckets.iter_mut().rev() {
            if timestamp >= unix_secs(bucket.first_seen) {
                bucket.count += amount;
                applied = true;
                break;
            }
        }

        if applied {
            inner.last_activity = SystemTime::now();
        } else {
            trace!(timestamp, amount, "dropping usage older than retained buckets");
        }
    }

    /// Seconds since the most recent increment of any kind.
    pub fn idle_secs(&self) -> i64 {
        age(self.inner.read().last_activity).as_secs() as i64
    }

    /// Number of retained buckets. Primarily useful for tests.
    pub fn bucket_count(&self) -> usize {
        self.inner.read().buckets.len()
    }

    /// Append a fresh bucket and evict buckets older than the window.
    ///
    /// The freshly appended bucket guarantees the window is never left
    /// empty by eviction.
    fn slide(&self) {
        let mut inner = self.inner.write();

        inner.buckets.push(Bucket::new());

        while inner.buckets.len() > 1
            && age(inner.buckets[0].last_updated).as_secs() as i64 > self.window_secs
        {
            inner.buckets.remove(0);
        }
    }

    /// Terminate the slide task. Idempotent and safe to call concurrently.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::unix_now;

    // A slide interval long enough that the background task never fires
    // during a test.
    const IDLE_SLIDE: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_increment_and_read() {
        let counter = Counter::new(60, IDLE_SLIDE);

        counter.increment(5);

        assert_eq!(counter.current(), 5);
        assert_eq!(counter.window_total(), 5);

        counter.stop();
    }

    #[tokio::test]
    async fn test_current_reads_zero_once_bucket_ages() {
        let counter = Counter::new(60, IDLE_SLIDE);

        counter.increment(5);
        tokio::time::sleep(Duration::from_millis(1100)).await;

        // The aged current bucket reads as empty, but its usage still
        // counts toward the window and the structure is unchanged.
        assert_eq!(counter.current(), 0);
        assert_eq!(counter.window_total(), 5);
        assert_eq!(counter.bucket_count(), 1);

        counter.stop();
    }

    #[tokio::test]
    async fn test_increment_rolls_aged_bucket() {
        let counter = Counter::new(60, IDLE_SLIDE);

        counter.increment(3);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        counter.increment(2);

        assert_eq!(counter.current(), 2);
        assert_eq!(counter.window_total(), 5);
        assert_eq!(counter.bucket_count(), 2);

        counter.stop();
    }

    #[tokio::test]
    async fn test_increment_at_targets_matching_bucket() {
        let counter = Counter::new(60, IDLE_SLIDE);

        counter.increment(3);
        counter.increment_at(4, unix_now());

        assert_eq!(counter.window_total(), 7);

        counter.stop();
    }

    #[tokio::test]
    async fn test_increment_at_older_than_retained_is_dropped() {
        let counter = Counter::new(60, IDLE_SLIDE);

        counter.increment(3);
        counter.increment_at(5, unix_now() - 100);

        assert_eq!(counter.window_total(), 3);

        counter.stop();
    }

    #[tokio::test]
    async fn test_window_total_skips_stale_buckets() {
        let counter = Counter::new(1, IDLE_SLIDE);

        counter.increment(4);
        tokio::time::sleep(Duration::from_millis(2100)).await;

        assert_eq!(counter.window_total(), 0);
        assert_eq!(counter.bucket_count(), 1);

        counter.stop();
    }

    #[tokio::test]
    async fn test_slide_evicts_stale_buckets_but_never_all() {
        let counter = Counter::new(1, IDLE_SLIDE);

        counter.increment(2);
        tokio::time::sleep(Duration::from_millis(2100)).await;
        counter.slide();

        // The stale bucket is gone, the freshly appended one remains.
        assert_eq!(counter.bucket_count(), 1);
        assert_eq!(counter.window_total(), 0);

        counter.stop();
    }

    #[tokio::test]
    async fn test_slide_keeps_live_buckets() {
        let counter = Counter::new(60, IDLE_SLIDE);

        counter.increment(2);
        counter.slide();

        assert_eq!(counter.bucket_count(), 2);
        assert_eq!(counter.window_total(), 2);

        counter.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let counter = Counter::new(60, Duration::from_millis(10));

        counter.stop();
        counter.stop();

        let a = Arc::clone(&counter);
        let b = Arc::clone(&counter);
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.stop() }),
            tokio::spawn(async move { b.stop() }),
        );
        ra.unwrap();
        rb.unwrap();
    }

    #[tokio::test]
    async fn test_idle_secs_tracks_remote_increments() {
        let counter = Counter::new(60, IDLE_SLIDE);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(counter.idle_secs() >= 1);

        counter.increment_at(1, unix_now());
        assert_eq!(counter.idle_secs(), 0);

        counter.stop();
    }
}
