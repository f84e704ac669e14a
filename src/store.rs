use async_trait::async_trait;
use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    error::{AdmissionError, Result},
    metrics::Metrics,
    utils::{window_start, SystemTimeSource, TimeSource, SWEEP_INTERVAL_SECONDS, WINDOW_SECONDS},
};

/// Independent rate limit scopes, evaluated in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Global,
    Client,
    Class,
}

impl Tier {
    /// All tiers in evaluation order
    pub const ALL: [Tier; 3] = [Tier::Global, Tier::Client, Tier::Class];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Global => "global",
            Tier::Client => "client",
            Tier::Class => "class",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "global" => Ok(Tier::Global),
            "client" => Ok(Tier::Client),
            "class" => Ok(Tier::Class),
            other => Err(AdmissionError::MalformedCounterKey(format!(
                "unknown tier '{}'",
                other
            ))),
        }
    }
}

/// Counter identity within one fixed window.
///
/// Rendered as `tier:identifier:window_start`. The identifier may itself
/// contain `:` (IPv6 peers, class keys), so parsing splits the tier off the
/// front and the window off the back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub tier: Tier,
    pub identifier: String,
    pub window_start: i64,
}

impl CounterKey {
    /// Key for the window containing `now`
    pub fn new(tier: Tier, identifier: &str, now: i64) -> Self {
        Self {
            tier,
            identifier: identifier.to_string(),
            window_start: window_start(now),
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let malformed = || AdmissionError::MalformedCounterKey(raw.to_string());

        let (tier, rest) = raw.split_once(':').ok_or_else(malformed)?;
        let (identifier, window) = rest.rsplit_once(':').ok_or_else(malformed)?;
        let window_start = window.parse::<i64>().map_err(|_| malformed())?;

        Ok(Self {
            tier: tier.parse()?,
            identifier: identifier.to_string(),
            window_start,
        })
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.tier, self.identifier, self.window_start)
    }
}

/// Result of a conditional increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementOutcome {
    /// Count after the increment when admitted. When refused, the count this
    /// request would have produced; the stored value is left untouched.
    pub count: u64,
    pub admitted: bool,
}

/// Capability interface for fixed-window counters.
///
/// The in-memory implementation is the only one shipped; a shared backend with
/// atomic increment-and-expire can implement the same trait without the
/// middleware changing.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the current-window counter and return the new count
    async fn increment(&self, tier: Tier, identifier: &str) -> Result<u64>;

    /// Read the current-window counter without mutating it (0 if absent)
    async fn get_count(&self, tier: Tier, identifier: &str) -> Result<u64>;

    /// Increment only if the current count is below `limit`, as one atomic step
    async fn increment_if_below(
        &self,
        tier: Tier,
        identifier: &str,
        limit: u64,
    ) -> Result<IncrementOutcome>;

    /// Drop every counter older than the previous window, returning how many were removed
    async fn sweep(&self) -> Result<usize>;
}

struct StoreState {
    counts: HashMap<String, u64>,
    last_sweep: i64,
}

/// Single-process counter store guarded by one mutex.
///
/// Every operation holds the lock for a purely CPU-bound critical section.
/// Expired windows are swept on the increment path at most once every
/// [`SWEEP_INTERVAL_SECONDS`].
pub struct InMemoryCounterStore {
    state: Mutex<StoreState>,
    time_source: Arc<dyn TimeSource>,
    metrics: Option<Arc<Metrics>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::with_time_source(Arc::new(SystemTimeSource::new()))
    }

    pub fn with_time_source(time_source: Arc<dyn TimeSource>) -> Self {
        let now = time_source.unix_now();
        Self {
            state: Mutex::new(StoreState {
                counts: HashMap::new(),
                last_sweep: now,
            }),
            time_source,
            metrics: None,
        }
    }

    /// Record sweep activity in the given metrics
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Number of live counter entries, across all windows
    pub async fn len(&self) -> usize {
        self.state.lock().await.counts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn key(&self, tier: Tier, identifier: &str, now: i64) -> String {
        CounterKey::new(tier, identifier, now).to_string()
    }

    fn maybe_sweep(&self, state: &mut StoreState, now: i64) {
        if now - state.last_sweep < SWEEP_INTERVAL_SECONDS {
            return;
        }
        self.sweep_locked(state, now);
    }

    fn sweep_locked(&self, state: &mut StoreState, now: i64) -> usize {
        state.last_sweep = now;
        let oldest_kept = window_start(now) - WINDOW_SECONDS;

        let before = state.counts.len();
        state.counts.retain(|raw, _| match CounterKey::parse(raw) {
            Ok(key) => key.window_start >= oldest_kept,
            Err(e) => {
                debug!(error = %e, "Purging unparsable rate limit key");
                false
            }
        });
        let expired_count = before - state.counts.len();

        if let Some(metrics) = &self.metrics {
            metrics.record_sweep(expired_count);
        }

        if expired_count > 0 {
            debug!(
                expired_count,
                current_entries = state.counts.len(),
                "Cleaned up expired rate limit entries"
            );
        }

        expired_count
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, tier: Tier, identifier: &str) -> Result<u64> {
        let now = self.time_source.unix_now();
        let key = self.key(tier, identifier, now);

        let mut state = self.state.lock().await;
        let count = state.counts.entry(key).or_insert(0);
        *count += 1;
        let count = *count;

        self.maybe_sweep(&mut state, now);
        Ok(count)
    }

    async fn get_count(&self, tier: Tier, identifier: &str) -> Result<u64> {
        let key = self.key(tier, identifier, self.time_source.unix_now());

        let state = self.state.lock().await;
        Ok(state.counts.get(&key).copied().unwrap_or(0))
    }

    async fn increment_if_below(
        &self,
        tier: Tier,
        identifier: &str,
        limit: u64,
    ) -> Result<IncrementOutcome> {
        let now = self.time_source.unix_now();
        let key = self.key(tier, identifier, now);

        let mut state = self.state.lock().await;
        let current = state.counts.get(&key).copied().unwrap_or(0);

        let outcome = if current >= limit {
            IncrementOutcome {
                count: current + 1,
                admitted: false,
            }
        } else {
            state.counts.insert(key, current + 1);
            IncrementOutcome {
                count: current + 1,
                admitted: true,
            }
        };

        self.maybe_sweep(&mut state, now);
        Ok(outcome)
    }

    async fn sweep(&self) -> Result<usize> {
        let now = self.time_source.unix_now();
        let mut state = self.state.lock().await;
        Ok(self.sweep_locked(&mut state, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualTimeSource;

    const T0: i64 = 1_700_000_100;

    fn store_at(now: i64) -> (InMemoryCounterStore, ManualTimeSource) {
        let clock = ManualTimeSource::new(now);
        let store = InMemoryCounterStore::with_time_source(Arc::new(clock.clone()));
        (store, clock)
    }

    #[test]
    fn test_counter_key_round_trip_with_colons() {
        let key = CounterKey::new(Tier::Class, "2001:db8::1:story_generation", T0 + 17);
        assert_eq!(key.window_start, T0);

        let rendered = key.to_string();
        assert_eq!(
            rendered,
            format!("class:2001:db8::1:story_generation:{}", T0)
        );
        assert_eq!(CounterKey::parse(&rendered).unwrap(), key);
    }

    #[test]
    fn test_counter_key_parse_rejects_garbage() {
        assert!(matches!(
            CounterKey::parse("global:server:not-a-number"),
            Err(AdmissionError::MalformedCounterKey(_))
        ));
        assert!(CounterKey::parse("nocolons").is_err());
        assert!(CounterKey::parse("bogus:server:60").is_err());
    }

    #[tokio::test]
    async fn test_increment_is_monotonic_within_window() {
        let (store, clock) = store_at(T0);

        let mut last = 0;
        for _ in 0..10 {
            let count = store.increment(Tier::Client, "10.0.0.1").await.unwrap();
            assert!(count > last);
            last = count;
            clock.advance(5);
        }
        assert_eq!(last, 10);
    }

    #[tokio::test]
    async fn test_count_resets_in_new_window() {
        let (store, clock) = store_at(T0);

        store.increment(Tier::Global, "server").await.unwrap();
        store.increment(Tier::Global, "server").await.unwrap();
        assert_eq!(store.get_count(Tier::Global, "server").await.unwrap(), 2);

        clock.set(T0 + WINDOW_SECONDS);
        assert_eq!(store.get_count(Tier::Global, "server").await.unwrap(), 0);
        assert_eq!(store.increment(Tier::Global, "server").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_count_is_idempotent() {
        let (store, _clock) = store_at(T0);
        assert_eq!(store.get_count(Tier::Client, "a").await.unwrap(), 0);

        store.increment(Tier::Client, "a").await.unwrap();
        for _ in 0..5 {
            assert_eq!(store.get_count(Tier::Client, "a").await.unwrap(), 1);
        }
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_tiers_and_identifiers_are_independent() {
        let (store, _clock) = store_at(T0);

        store.increment(Tier::Client, "a").await.unwrap();
        store.increment(Tier::Client, "b").await.unwrap();
        store.increment(Tier::Class, "a").await.unwrap();

        assert_eq!(store.get_count(Tier::Client, "a").await.unwrap(), 1);
        assert_eq!(store.get_count(Tier::Client, "b").await.unwrap(), 1);
        assert_eq!(store.get_count(Tier::Class, "a").await.unwrap(), 1);
        assert_eq!(store.get_count(Tier::Global, "a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_increment_if_below_stops_at_limit() {
        let (store, _clock) = store_at(T0);

        for expected in 1..=3 {
            let outcome = store.increment_if_below(Tier::Class, "k", 3).await.unwrap();
            assert!(outcome.admitted);
            assert_eq!(outcome.count, expected);
        }

        let refused = store.increment_if_below(Tier::Class, "k", 3).await.unwrap();
        assert!(!refused.admitted);
        assert_eq!(refused.count, 4);
        assert_eq!(store.get_count(Tier::Class, "k").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_zero_limit_refuses_everything() {
        let (store, _clock) = store_at(T0);
        let outcome = store
            .increment_if_below(Tier::Global, "server", 0)
            .await
            .unwrap();
        assert!(!outcome.admitted);
        assert!(store.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increment_if_below_admits_exactly_limit() {
        let (store, _clock) = store_at(T0);
        let store = Arc::new(store);
        let limit = 50;

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .increment_if_below(Tier::Client, "burst", limit)
                        .await
                        .unwrap()
                        .admitted
                })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, limit);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increment_loses_no_updates() {
        let (store, _clock) = store_at(T0);
        let store = Arc::new(store);

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.increment(Tier::Global, "server").await.unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get_count(Tier::Global, "server").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_sweep_keeps_current_and_previous_window() {
        let (store, clock) = store_at(T0);

        store.increment(Tier::Client, "old").await.unwrap();
        clock.advance(WINDOW_SECONDS);
        store.increment(Tier::Client, "previous").await.unwrap();
        clock.advance(WINDOW_SECONDS);
        store.increment(Tier::Client, "current").await.unwrap();

        let removed = store.sweep().await.unwrap();
        assert_eq!(removed, 1);

        let current_window = window_start(clock.unix_now());
        let state = store.state.lock().await;
        assert_eq!(state.counts.len(), 2);
        for raw in state.counts.keys() {
            let key = CounterKey::parse(raw).unwrap();
            assert!(key.window_start >= current_window - WINDOW_SECONDS);
        }
    }

    #[tokio::test]
    async fn test_sweep_purges_malformed_keys() {
        let (store, _clock) = store_at(T0);
        store.increment(Tier::Global, "server").await.unwrap();
        {
            let mut state = store.state.lock().await;
            state.counts.insert("global:server:garbage".to_string(), 7);
            state.counts.insert("unknown".to_string(), 1);
        }

        assert_eq!(store.sweep().await.unwrap(), 2);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get_count(Tier::Global, "server").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_opportunistic_sweep_waits_for_interval() {
        let (store, clock) = store_at(T0);
        store.increment(Tier::Client, "stale").await.unwrap();

        // Three windows later the entry is expired, but the interval has not elapsed.
        clock.advance(3 * WINDOW_SECONDS);
        store.increment(Tier::Client, "fresh").await.unwrap();
        assert_eq!(store.len().await, 2);

        clock.set(T0 + SWEEP_INTERVAL_SECONDS);
        store.increment(Tier::Client, "fresh").await.unwrap();
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get_count(Tier::Client, "stale").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_is_recorded_in_metrics() {
        let clock = ManualTimeSource::new(T0);
        let metrics = Arc::new(Metrics::new().unwrap());
        let store = InMemoryCounterStore::with_time_source(Arc::new(clock.clone()))
            .with_metrics(metrics.clone());

        store.increment(Tier::Client, "a").await.unwrap();
        clock.advance(10 * WINDOW_SECONDS);
        store.sweep().await.unwrap();

        assert_eq!(metrics.sweeps(), 1);
        assert_eq!(metrics.swept_entries(), 1);
    }
}
