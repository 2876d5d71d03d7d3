//! Bounded, coalescing, multi-gateway resource loader.
//!
//! A load for a [`ResourceKey`] goes through:
//!
//! 1. **Cache** -- a hit (resolved URI or the unavailable sentinel) returns immediately.
//! 2. **Coalescing** -- if the key already has work in flight, the caller joins it.
//! 3. **Queue** -- otherwise the work waits for one of `N` [`RequestQueue`] slots.
//! 4. **Attempts** -- candidates are ranked once, then tried in order (cycling when
//!    the retry budget exceeds the candidate count) with a per-attempt timeout and
//!    a backoff delay between failures.
//! 5. **Completion** -- success caches the URI; exhaustion caches the sentinel and
//!    resolves to [`LoadOutcome::Unavailable`]. Endpoint failures never surface as errors.
//!
//! Cancellation is per caller. A cancelled caller resolves to
//! [`LoadOutcome::Cancelled`] at once. The shared work only stops (without further
//! cache or ranking writes) once *every* caller waiting on it has cancelled.

pub mod cache;
pub mod errors;
pub mod fetch;
pub mod key;
pub mod queue;
pub mod ranking;
pub mod retry;

use crate::utils::fmt_duration;
use bytes::Bytes;
use cache::{Resolution, ResolutionCache};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use errors::{FetchError, LoaderError};
use fetch::Fetcher;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use key::{Endpoint, ResourceKey};
use queue::RequestQueue;
use ranking::GatewayRanking;
use retry::RetryPolicy;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Instant;
use std::future::Future;
use tokio::sync::Notify;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, trace, warn};

/// Final result of a load as seen by one caller.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// `body` holds the payload when it was fetched for this load; cache hits carry none.
    Resolved { uri: String, body: Option<Bytes> },
    /// Every candidate failed, now or on an earlier load.
    Unavailable,
    /// The caller cancelled before a result was delivered.
    Cancelled,
}

impl LoadOutcome {
    pub fn uri(&self) -> Option<&str> {
        match self {
            LoadOutcome::Resolved { uri, .. } => Some(uri),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, LoadOutcome::Resolved { .. })
    }

    /// The resolved URI, or the caller's fallback for anything else.
    pub fn or_fallback(&self, fallback: &str) -> String {
        self.uri().unwrap_or(fallback).to_owned()
    }
}

impl From<Resolution> for LoadOutcome {
    fn from(value: Resolution) -> Self {
        match value {
            Resolution::Resolved(uri) => LoadOutcome::Resolved { uri, body: None },
            Resolution::Unavailable => LoadOutcome::Unavailable,
        }
    }
}

/// Where a key currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Queued,
    Attempting,
    Cached(Resolution),
}

const PHASE_QUEUED: u8 = 0;
const PHASE_ATTEMPTING: u8 = 1;

/// Cancellation tokens of every caller waiting on one in-flight request.
#[derive(Debug, Default)]
struct Waiters {
    tokens: std::sync::Mutex<Vec<CancellationToken>>,
    /// Signalled whenever a waiter gives up, so the work can re-check.
    left: Notify,
}

impl Waiters {
    fn register(&self, token: CancellationToken) {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(token);
    }

    fn all_cancelled(&self) -> bool {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .all(CancellationToken::is_cancelled)
    }

    fn notify_left(&self) {
        self.left.notify_one();
    }
}

#[derive(Clone)]
struct InFlight {
    id: u64,
    result: Shared<BoxFuture<'static, LoadOutcome>>,
    waiters: Arc<Waiters>,
    phase: Arc<AtomicU8>,
}

type InFlightMap = Arc<DashMap<ResourceKey, InFlight>>;

struct Inner {
    fetcher: Arc<dyn Fetcher>,
    policy: RetryPolicy,
    queue: RequestQueue,
    cache: ResolutionCache,
    ranking: GatewayRanking,
    in_flight: InFlightMap,
    next_id: AtomicU64,
}

/// Cheap to clone; clones share cache, ranking, queue and in-flight state.
#[derive(Clone)]
pub struct Loader {
    inner: Arc<Inner>,
}

impl Loader {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        policy: RetryPolicy,
        queue: RequestQueue,
        cache: ResolutionCache,
        ranking: GatewayRanking,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                policy,
                queue,
                cache,
                ranking,
                in_flight: Arc::new(DashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.inner.cache
    }

    pub fn ranking(&self) -> &GatewayRanking {
        &self.inner.ranking
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.inner.queue
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// Number of keys with network work queued or running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn state(&self, key: &ResourceKey) -> LoadState {
        if let Some(hit) = self.inner.cache.get(key) {
            return LoadState::Cached(hit);
        }
        match self.inner.in_flight.get(key) {
            Some(f) if f.phase.load(Ordering::Acquire) == PHASE_ATTEMPTING => LoadState::Attempting,
            Some(_) => LoadState::Queued,
            None => LoadState::Idle,
        }
    }

    /// Load `path` for `key` from the best available candidate.
    ///
    /// Only caller mistakes are errors: a blank key is rejected when the key is
    /// built, and an empty candidate list is rejected here.
    pub async fn load(
        &self,
        key: &ResourceKey,
        path: &str,
        candidates: &[Endpoint],
        cancel: &CancellationToken,
    ) -> Result<LoadOutcome, LoaderError> {
        if candidates.is_empty() {
            return Err(LoaderError::NoCandidates(key.to_string()));
        }
        if cancel.is_cancelled() {
            return Ok(LoadOutcome::Cancelled);
        }
        if let Some(hit) = self.inner.cache.get(key) {
            trace!(key = %key, "cache hit");
            return Ok(hit.into());
        }

        let InFlight { result, waiters, .. } = self.join_or_start(key, path, candidates, cancel);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(key = %key, "load cancelled by caller");
                waiters.notify_left();
                Ok(LoadOutcome::Cancelled)
            }
            outcome = result => Ok(outcome),
        }
    }

    /// [`Loader::load`] collapsed to a URI, substituting `fallback` for anything unresolved.
    pub async fn resolve_or(
        &self,
        key: &ResourceKey,
        path: &str,
        candidates: &[Endpoint],
        fallback: &str,
        cancel: &CancellationToken,
    ) -> Result<String, LoaderError> {
        Ok(self
            .load(key, path, candidates, cancel)
            .await?
            .or_fallback(fallback))
    }

    fn join_or_start(
        &self,
        key: &ResourceKey,
        path: &str,
        candidates: &[Endpoint],
        cancel: &CancellationToken,
    ) -> InFlight {
        match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(existing) => {
                let in_flight = existing.get().clone();
                in_flight.waiters.register(cancel.clone());
                debug!(key = %key, "joined in-flight load");
                in_flight
            }
            Entry::Vacant(slot) => {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let waiters = Arc::new(Waiters::default());
                waiters.register(cancel.clone());
                let phase = Arc::new(AtomicU8::new(PHASE_QUEUED));

                let span = tracing::debug_span!("load", key = %key);
                let handle = tokio::spawn(
                    self.inner
                        .clone()
                        .run(
                            key.clone(),
                            id,
                            path.to_owned(),
                            candidates.to_vec(),
                            waiters.clone(),
                            phase.clone(),
                        )
                        .instrument(span),
                );

                let map = self.inner.in_flight.clone();
                let task_key = key.clone();
                let result = async move {
                    match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(key = %task_key, error = ?e, "load task failed");
                            map.remove_if(&task_key, |_, f| f.id == id);
                            LoadOutcome::Unavailable
                        }
                    }
                }
                .boxed()
                .shared();

                let in_flight = InFlight {
                    id,
                    result,
                    waiters,
                    phase,
                };
                slot.insert(in_flight.clone());
                in_flight
            }
        }
    }
}

impl Inner {
    /// Remove this request's entry if every waiter has cancelled. Returns `true` if so.
    ///
    /// Runs under the map's shard lock, so no new waiter can join between the
    /// check and the removal.
    fn abandon_if_unwanted(&self, key: &ResourceKey, id: u64) -> bool {
        self.in_flight
            .remove_if(key, |_, f| f.id == id && f.waiters.all_cancelled())
            .is_some()
    }

    fn finish(&self, key: &ResourceKey, id: u64) {
        self.in_flight.remove_if(key, |_, f| f.id == id);
    }

    /// Drive `fut` to completion, or return `None` once every waiter has cancelled.
    async fn unless_abandoned<F: Future>(
        &self,
        key: &ResourceKey,
        id: u64,
        waiters: &Waiters,
        fut: F,
    ) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return Some(output),
                _ = waiters.left.notified() => {
                    if self.abandon_if_unwanted(key, id) {
                        return None;
                    }
                }
            }
        }
    }

    async fn run(
        self: Arc<Self>,
        key: ResourceKey,
        id: u64,
        path: String,
        candidates: Vec<Endpoint>,
        waiters: Arc<Waiters>,
        phase: Arc<AtomicU8>,
    ) -> LoadOutcome {
        let queued_at = Instant::now();
        if self.abandon_if_unwanted(&key, id) {
            return LoadOutcome::Cancelled;
        }

        let Some(_slot) = self
            .unless_abandoned(&key, id, &waiters, self.queue.admit())
            .await
        else {
            debug!("abandoned while queued");
            return LoadOutcome::Cancelled;
        };
        if self.abandon_if_unwanted(&key, id) {
            return LoadOutcome::Cancelled;
        }
        trace!(waited = fmt_duration(queued_at.elapsed()), "admitted");

        // A previous request for this key may have completed while we queued.
        if let Some(hit) = self.cache.get(&key) {
            self.finish(&key, id);
            return hit.into();
        }

        phase.store(PHASE_ATTEMPTING, Ordering::Release);
        let ordered = self.ranking.rank(&candidates);
        let limit = self.policy.attempt_limit(ordered.len());
        let started = Instant::now();
        let mut attempt: u32 = 0;

        while self.policy.should_retry(attempt, ordered.len()) {
            if attempt > 0 {
                let delay = self.policy.delay(attempt - 1);
                if !delay.is_zero()
                    && self
                        .unless_abandoned(&key, id, &waiters, time::sleep(delay))
                        .await
                        .is_none()
                {
                    debug!(attempt, "abandoned during backoff");
                    return LoadOutcome::Cancelled;
                }
            }
            if self.abandon_if_unwanted(&key, id) {
                debug!(attempt, "abandoned before attempt");
                return LoadOutcome::Cancelled;
            }

            let endpoint = &ordered[attempt as usize % ordered.len()];
            let uri = endpoint.uri_for(&path);
            let fetch = self.fetcher.fetch(&uri);
            let result = match time::timeout(self.policy.attempt_timeout, fetch).await {
                Ok(result) => result,
                Err(_elapsed) => Err(FetchError::TimedOut(self.policy.attempt_timeout)),
            };

            if self.abandon_if_unwanted(&key, id) {
                debug!(attempt, "abandoned after attempt");
                return LoadOutcome::Cancelled;
            }

            match result {
                Ok(body) => {
                    self.ranking.report_success(endpoint);
                    debug!(
                        uri = %uri,
                        attempt,
                        duration = fmt_duration(started.elapsed()),
                        "resource resolved"
                    );
                    if !self.cache.set(key.clone(), Resolution::Resolved(uri.clone())) {
                        trace!("cache already held a resolution");
                    }
                    self.finish(&key, id);
                    return LoadOutcome::Resolved {
                        uri,
                        body: Some(body),
                    };
                }
                Err(e) => {
                    self.ranking.report_failure(endpoint);
                    debug!(
                        uri = %uri,
                        attempt,
                        max_attempts = limit,
                        error = %e,
                        "attempt failed"
                    );
                    attempt += 1;
                }
            }
        }

        warn!(
            attempts = attempt,
            candidates = ordered.len(),
            duration = fmt_duration(started.elapsed()),
            "all candidates exhausted"
        );
        let outcome = if self.cache.set(key.clone(), Resolution::Unavailable) {
            LoadOutcome::Unavailable
        } else {
            // Something better landed meanwhile; never shadow it with the sentinel.
            self.cache
                .get(&key)
                .map(LoadOutcome::from)
                .unwrap_or(LoadOutcome::Unavailable)
        };
        self.finish(&key, id);
        outcome
    }
}
