//! Token price cache.
//!
//! Memoizes USD spot prices per token address with a fixed TTL. A refresh
//! only asks the upstream for addresses that are missing or expired, caps
//! each request at `max_batch_size` addresses, and lets concurrent callers
//! join a fetch that is already in flight instead of issuing a duplicate.
//!
//! Entry lifecycle is absent -> fresh -> expired -> fresh again. Entries are
//! never removed; expiry is checked lazily against the injected clock.

use crate::address::{parse_addresses, TokenAddress};
use crate::clients::geckoterminal::GeckoTerminalClient;
use crate::clients::price_source::PriceSource;
use crate::clock::{Clock, SystemClock};
use crate::config::PriceCacheConfig;
use crate::error::{PriceError, Result};
use chrono::{DateTime, Duration, Utc};
use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Last known price for one token.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub address: TokenAddress,
    pub price_usd: f64,
    pub fetched_at: DateTime<Utc>,
    /// Always `fetched_at + ttl`
    pub expires_at: DateTime<Utc>,
}

impl PriceEntry {
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// What the cache knows about one token right now.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PriceQuote {
    Fresh { price: f64 },
    /// Expired but still the best value available. `failures` counts refresh
    /// attempts since the last successful fetch.
    Stale { price: f64, failures: u32 },
    /// Never fetched successfully. `failures == 0` means nobody asked yet.
    Unknown { failures: u32 },
}

impl PriceQuote {
    pub fn price(&self) -> Option<f64> {
        match self {
            PriceQuote::Fresh { price } | PriceQuote::Stale { price, .. } => Some(*price),
            PriceQuote::Unknown { .. } => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, PriceQuote::Fresh { .. })
    }

    pub fn failures(&self) -> u32 {
        match self {
            PriceQuote::Fresh { .. } => 0,
            PriceQuote::Stale { failures, .. } | PriceQuote::Unknown { failures } => *failures,
        }
    }
}

/// Outcome of a single `refresh` call.
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    /// Distinct addresses requested
    pub requested: usize,
    /// Served from cache without touching the upstream
    pub fresh: Vec<TokenAddress>,
    /// Priced by a fetch this call issued or joined
    pub fetched: Vec<TokenAddress>,
    /// Fetch finished without a price for these
    pub missing: Vec<TokenAddress>,
    /// Over the batch cap; picked up by a later refresh
    pub deferred: Vec<TokenAddress>,
    /// First upstream failure seen, if any
    pub error: Option<String>,
    /// Full cache contents after the refresh, not just the requested subset
    pub prices: HashMap<TokenAddress, f64>,
}

impl RefreshReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.deferred.is_empty() && self.error.is_none()
    }
}

#[derive(Debug)]
enum BatchOutcome {
    Completed { priced: HashSet<TokenAddress> },
    Failed(String),
}

type PendingFetch = Shared<BoxFuture<'static, Arc<BatchOutcome>>>;

#[derive(Default)]
struct CacheState {
    entries: HashMap<TokenAddress, PriceEntry>,
    failures: HashMap<TokenAddress, u32>,
    /// address -> (batch id, fetch covering it)
    pending: HashMap<TokenAddress, (u64, PendingFetch)>,
}

struct Inner {
    config: PriceCacheConfig,
    ttl: Duration,
    source: Arc<dyn PriceSource>,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
    next_batch_id: AtomicU64,
}

impl CacheState {
    fn clear_pending(&mut self, batch_id: u64, batch: &[TokenAddress]) {
        for address in batch {
            if matches!(self.pending.get(address), Some((id, _)) if *id == batch_id) {
                self.pending.remove(address);
            }
        }
    }
}

/// Settles a batch whose fetch task ended without reaching `merge`
/// (panic or abort): clears its pending registrations and counts a failure
/// for every address in it.
struct PendingGuard {
    inner: Arc<Inner>,
    batch_id: u64,
    addresses: Vec<TokenAddress>,
    settled: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        warn!(
            "{} fetch task for batch {} ended without a result",
            self.inner.source.name(),
            self.batch_id
        );
        let mut state = self.inner.state.lock();
        state.clear_pending(self.batch_id, &self.addresses);
        for address in &self.addresses {
            *state.failures.entry(*address).or_insert(0) += 1;
        }
    }
}

impl Inner {
    /// Apply a fetch result and retire the batch's pending registrations in
    /// one critical section.
    fn merge(
        &self,
        batch_id: u64,
        batch: &[TokenAddress],
        result: Result<HashMap<TokenAddress, f64>>,
    ) -> BatchOutcome {
        let now = self.clock.now();
        let expires_at = now
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut state = self.state.lock();
        state.clear_pending(batch_id, batch);
        match result {
            Ok(prices) => {
                for (address, price_usd) in &prices {
                    state.entries.insert(
                        *address,
                        PriceEntry {
                            address: *address,
                            price_usd: *price_usd,
                            fetched_at: now,
                            expires_at,
                        },
                    );
                    state.failures.remove(address);
                }

                let mut priced = HashSet::with_capacity(batch.len());
                for address in batch {
                    if prices.contains_key(address) {
                        priced.insert(*address);
                    } else {
                        *state.failures.entry(*address).or_insert(0) += 1;
                    }
                }

                info!(
                    "Got {} prices from {}, {} of {} requested missing",
                    prices.len(),
                    self.source.name(),
                    batch.len() - priced.len(),
                    batch.len()
                );
                BatchOutcome::Completed { priced }
            }
            Err(e) => {
                warn!(
                    "{} batch fetch failed for {} tokens: {}",
                    self.source.name(),
                    batch.len(),
                    e
                );
                for address in batch {
                    *state.failures.entry(*address).or_insert(0) += 1;
                }
                BatchOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Shared, cheaply clonable price cache.
///
/// Clones share entries and in-flight fetches. `refresh` must run inside a
/// tokio runtime because fetches are spawned as tasks.
#[derive(Clone)]
pub struct PriceCache {
    inner: Arc<Inner>,
}

impl PriceCache {
    pub fn new(config: PriceCacheConfig, source: Arc<dyn PriceSource>) -> Result<Self> {
        Self::with_clock(config, source, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: PriceCacheConfig,
        source: Arc<dyn PriceSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let ttl = config.ttl();

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                ttl,
                source,
                clock,
                state: Mutex::new(CacheState::default()),
                next_batch_id: AtomicU64::new(1),
            }),
        })
    }

    /// Cache backed by the GeckoTerminal client described by `config`.
    pub fn geckoterminal(config: PriceCacheConfig) -> Result<Self> {
        let source = Arc::new(GeckoTerminalClient::from_config(&config)?);
        Self::new(config, source)
    }

    pub fn config(&self) -> &PriceCacheConfig {
        &self.inner.config
    }

    pub fn source_name(&self) -> &str {
        self.inner.source.name()
    }

    /// Last cached price, even if expired. `None` if never fetched.
    pub fn get_price(&self, address: &TokenAddress) -> Option<f64> {
        self.inner
            .state
            .lock()
            .entries
            .get(address)
            .map(|e| e.price_usd)
    }

    pub fn entry(&self, address: &TokenAddress) -> Option<PriceEntry> {
        self.inner.state.lock().entries.get(address).copied()
    }

    pub fn quote(&self, address: &TokenAddress) -> PriceQuote {
        let now = self.inner.clock.now();
        let state = self.inner.state.lock();
        let failures = state.failures.get(address).copied().unwrap_or(0);

        match state.entries.get(address) {
            Some(entry) if entry.is_fresh_at(now) => PriceQuote::Fresh {
                price: entry.price_usd,
            },
            Some(entry) => PriceQuote::Stale {
                price: entry.price_usd,
                failures,
            },
            None => PriceQuote::Unknown { failures },
        }
    }

    /// Every cached price, fresh or not.
    pub fn snapshot(&self) -> HashMap<TokenAddress, f64> {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .map(|(address, entry)| (*address, entry.price_usd))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refresh from raw address strings and return the whole cache.
    ///
    /// A malformed address fails the call before any request is made.
    /// Upstream failures never surface here; affected prices simply stay as
    /// they were.
    pub async fn refresh_prices<S: AsRef<str>>(
        &self,
        addresses: &[S],
    ) -> Result<HashMap<TokenAddress, f64>> {
        let addresses = parse_addresses(addresses)?;
        Ok(self.refresh(&addresses).await.prices)
    }

    /// Refresh the given addresses, fetching only what is missing or expired.
    pub async fn refresh(&self, addresses: &[TokenAddress]) -> RefreshReport {
        let mut seen = HashSet::with_capacity(addresses.len());
        let requested: Vec<TokenAddress> = addresses
            .iter()
            .copied()
            .filter(|address| seen.insert(*address))
            .collect();

        let mut report = RefreshReport {
            requested: requested.len(),
            ..Default::default()
        };

        // batch id -> (fetch, addresses this call cares about)
        let mut waits: HashMap<u64, (PendingFetch, Vec<TokenAddress>)> = HashMap::new();

        if !requested.is_empty() {
            let now = self.inner.clock.now();
            let mut state = self.inner.state.lock();
            let mut needed = Vec::new();

            for address in requested {
                if state
                    .entries
                    .get(&address)
                    .is_some_and(|entry| entry.is_fresh_at(now))
                {
                    report.fresh.push(address);
                } else if let Some((batch_id, fetch)) = state.pending.get(&address) {
                    waits
                        .entry(*batch_id)
                        .or_insert_with(|| (fetch.clone(), Vec::new()))
                        .1
                        .push(address);
                } else {
                    needed.push(address);
                }
            }

            if needed.len() > self.inner.config.max_batch_size {
                report.deferred = needed.split_off(self.inner.config.max_batch_size);
                debug!(
                    "Batch cap {} reached, deferring {} tokens",
                    self.inner.config.max_batch_size,
                    report.deferred.len()
                );
            }

            if !needed.is_empty() {
                let (batch_id, fetch) = self.start_fetch(&mut state, needed.clone());
                waits.insert(batch_id, (fetch, needed));
            }
        }

        if !waits.is_empty() {
            let (fetches, wanted): (Vec<_>, Vec<_>) = waits.into_values().unzip();
            let outcomes = join_all(fetches).await;

            for (outcome, addresses) in outcomes.iter().zip(wanted) {
                match &**outcome {
                    BatchOutcome::Completed { priced } => {
                        for address in addresses {
                            if priced.contains(&address) {
                                report.fetched.push(address);
                            } else {
                                report.missing.push(address);
                            }
                        }
                    }
                    BatchOutcome::Failed(message) => {
                        report.missing.extend(addresses);
                        if report.error.is_none() {
                            report.error = Some(message.clone());
                        }
                    }
                }
            }
        }

        report.prices = self.snapshot();
        debug!(
            "Refreshed {} tokens: {} fresh, {} fetched, {} missing, {} deferred",
            report.requested,
            report.fresh.len(),
            report.fetched.len(),
            report.missing.len(),
            report.deferred.len()
        );
        report
    }

    /// Register `batch` as in flight and spawn the upstream request.
    /// Caller holds the state lock, so registration and the stale check are atomic.
    fn start_fetch(&self, state: &mut CacheState, batch: Vec<TokenAddress>) -> (u64, PendingFetch) {
        let batch_id = self.inner.next_batch_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let task_batch = batch.clone();

        debug!(
            "Fetching {} tokens from {} (batch {})",
            batch.len(),
            inner.source.name(),
            batch_id
        );

        let handle = tokio::spawn(async move {
            let mut guard = PendingGuard {
                inner: Arc::clone(&inner),
                batch_id,
                addresses: task_batch.clone(),
                settled: false,
            };
            let result = inner.source.fetch_prices(&task_batch).await;
            let outcome = inner.merge(batch_id, &task_batch, result);
            guard.settled = true;
            Arc::new(outcome)
        });

        let fetch: PendingFetch = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Arc::new(BatchOutcome::Failed(
                    PriceError::TaskFailed(e.to_string()).to_string(),
                )),
            }
        }
        .boxed()
        .shared();

        for address in batch {
            state.pending.insert(address, (batch_id, fetch.clone()));
        }

        (batch_id, fetch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    fn addr(n: u64) -> TokenAddress {
        TokenAddress::parse(&format!("0x{:040x}", n)).unwrap()
    }

    /// Prices every address at `n / 100` where `n` is the address value,
    /// optionally failing or holding each request until released.
    struct TestSource {
        calls: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
        panic: std::sync::atomic::AtomicBool,
        gate: Option<Semaphore>,
        omit: HashSet<TokenAddress>,
    }

    impl TestSource {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
                panic: std::sync::atomic::AtomicBool::new(false),
                gate: None,
                omit: HashSet::new(),
            }
        }

        fn gated() -> Self {
            Self {
                gate: Some(Semaphore::new(0)),
                ..Self::new()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl PriceSource for TestSource {
        fn name(&self) -> &str {
            "Test"
        }

        async fn fetch_prices(&self, addresses: &[TokenAddress]) -> Result<HashMap<TokenAddress, f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire().await.expect("gate closed").forget();
            }
            if self.panic.load(Ordering::SeqCst) {
                panic!("upstream client bug");
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(PriceError::Status {
                    status: 429,
                    body: "rate limited".to_string(),
                });
            }
            Ok(addresses
                .iter()
                .filter(|a| !self.omit.contains(a))
                .map(|a| (*a, a.as_address().to_low_u64_be() as f64 / 100.0))
                .collect())
        }
    }

    fn cache_with(source: Arc<TestSource>, clock: Arc<ManualClock>) -> PriceCache {
        PriceCache::with_clock(PriceCacheConfig::default(), source, clock).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = PriceCache::new(
            PriceCacheConfig::default().with_max_batch_size(0),
            Arc::new(TestSource::new()),
        );
        assert!(matches!(result, Err(PriceError::Config(_))));
    }

    #[tokio::test]
    async fn test_entry_expiry_is_fetch_time_plus_ttl() {
        let source = Arc::new(TestSource::new());
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(source, clock.clone());

        let fetched_at = clock.now();
        cache.refresh(&[addr(150)]).await;

        let entry = cache.entry(&addr(150)).unwrap();
        assert_eq!(entry.price_usd, 1.5);
        assert_eq!(entry.fetched_at, fetched_at);
        assert_eq!(entry.expires_at, fetched_at + Duration::minutes(30));
    }

    #[tokio::test]
    async fn test_quote_lifecycle() {
        let source = Arc::new(TestSource::new());
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(source.clone(), clock.clone());
        let token = addr(250);

        assert_eq!(cache.quote(&token), PriceQuote::Unknown { failures: 0 });

        cache.refresh(&[token]).await;
        assert_eq!(cache.quote(&token), PriceQuote::Fresh { price: 2.5 });

        clock.advance(Duration::minutes(30));
        assert_eq!(
            cache.quote(&token),
            PriceQuote::Stale {
                price: 2.5,
                failures: 0
            }
        );
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_price_and_counts() {
        let source = Arc::new(TestSource::new());
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(source.clone(), clock.clone());
        let token = addr(300);

        cache.refresh(&[token]).await;
        clock.advance(Duration::minutes(31));
        source.set_failing(true);

        let report = cache.refresh(&[token]).await;
        assert_eq!(report.missing, vec![token]);
        assert!(report.error.as_deref().unwrap().contains("429"));
        assert_eq!(cache.get_price(&token), Some(3.0));

        cache.refresh(&[token]).await;
        assert_eq!(
            cache.quote(&token),
            PriceQuote::Stale {
                price: 3.0,
                failures: 2
            }
        );

        source.set_failing(false);
        cache.refresh(&[token]).await;
        assert_eq!(cache.quote(&token), PriceQuote::Fresh { price: 3.0 });
        assert_eq!(cache.quote(&token).failures(), 0);
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test]
    async fn test_omitted_address_counts_as_failure() {
        let mut source = TestSource::new();
        source.omit.insert(addr(2));
        let source = Arc::new(source);
        let cache = cache_with(source, Arc::new(ManualClock::default()));

        let report = cache.refresh(&[addr(1), addr(2)]).await;
        assert_eq!(report.fetched, vec![addr(1)]);
        assert_eq!(report.missing, vec![addr(2)]);
        assert!(report.error.is_none());
        assert!(!report.is_complete());
        assert_eq!(cache.quote(&addr(2)), PriceQuote::Unknown { failures: 1 });
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_fetch() {
        let source = Arc::new(TestSource::gated());
        let cache = cache_with(source.clone(), Arc::new(ManualClock::default()));
        let tokens = vec![addr(10), addr(20)];

        let first = {
            let cache = cache.clone();
            let tokens = tokens.clone();
            tokio::spawn(async move { cache.refresh(&tokens).await })
        };
        while source.calls() == 0 {
            tokio::task::yield_now().await;
        }

        let second = {
            let cache = cache.clone();
            let tokens = tokens.clone();
            tokio::spawn(async move { cache.refresh(&tokens).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        source.gate.as_ref().unwrap().add_permits(1);
        let first = first.await.unwrap();
        let second = second.await.unwrap();

        assert_eq!(source.calls(), 1);
        assert_eq!(first.fetched.len(), 2);
        assert_eq!(second.fresh.len() + second.fetched.len(), 2);
        assert_eq!(cache.get_price(&addr(20)), Some(0.2));
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_leak_pending() {
        let source = Arc::new(TestSource::gated());
        let cache = cache_with(source.clone(), Arc::new(ManualClock::default()));

        let abandoned = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refresh(&[addr(7)]).await })
        };
        while source.calls() == 0 {
            tokio::task::yield_now().await;
        }
        abandoned.abort();
        let _ = abandoned.await;

        source.gate.as_ref().unwrap().add_permits(1);
        loop {
            let in_flight = cache.inner.state.lock().pending.contains_key(&addr(7));
            if !in_flight {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(cache.get_price(&addr(7)), Some(0.07));
        let report = cache.refresh(&[addr(7)]).await;
        assert_eq!(report.fresh, vec![addr(7)]);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_panicking_fetch_counts_failure() {
        let source = Arc::new(TestSource::new());
        source.panic.store(true, Ordering::SeqCst);
        let cache = cache_with(source.clone(), Arc::new(ManualClock::default()));
        let token = addr(42);

        let report = cache.refresh(&[token]).await;
        assert_eq!(report.missing, vec![token]);
        assert!(report.error.as_deref().unwrap().contains("task failed"));
        assert_eq!(cache.quote(&token), PriceQuote::Unknown { failures: 1 });
        assert!(cache.inner.state.lock().pending.is_empty());

        // the next refresh starts a new fetch instead of reusing the dead one
        source.panic.store(false, Ordering::SeqCst);
        let report = cache.refresh(&[token]).await;
        assert_eq!(report.fetched, vec![token]);
        assert_eq!(cache.quote(&token), PriceQuote::Fresh { price: 0.42 });
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_merge_retires_pending_atomically() {
        let source = Arc::new(TestSource::gated());
        source.set_failing(true);
        let cache = cache_with(source.clone(), Arc::new(ManualClock::default()));
        let token = addr(9);

        let first = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refresh(&[token]).await })
        };
        while source.calls() == 0 {
            tokio::task::yield_now().await;
        }
        source.gate.as_ref().unwrap().add_permits(1);

        // once the failure is counted the batch must no longer be joinable
        loop {
            let state = cache.inner.state.lock();
            if state.failures.contains_key(&token) {
                assert!(!state.pending.contains_key(&token));
                break;
            }
            drop(state);
            tokio::task::yield_now().await;
        }
        first.await.unwrap();

        source.set_failing(false);
        source.gate.as_ref().unwrap().add_permits(1);
        let report = cache.refresh(&[token]).await;
        assert_eq!(report.fetched, vec![token]);
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn test_quote_serialization() {
        let json = serde_json::to_string(&PriceQuote::Stale {
            price: 1.25,
            failures: 3,
        })
        .unwrap();
        assert!(json.contains("\"status\":\"stale\""));
        assert!(json.contains("\"failures\":3"));
    }
}
