//! Session-scoped endpoint ranking.
//!
//! Every endpoint starts at a neutral score. Successes lower the score by a
//! small step (floored), failures raise it by a larger one, so a gateway that
//! flaps is demoted faster than it can earn its way back. Endpoints are only
//! ever reordered, never dropped.

use crate::loader::key::Endpoint;
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use tracing::trace;

/// Scoring constants.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RankingConfig {
    /// Score assigned to an endpoint that has never reported.
    pub neutral_score: u32,
    /// Amount subtracted per success.
    pub success_step: u32,
    /// Amount added per failure. Should exceed `success_step`.
    pub failure_step: u32,
    /// Lowest score a run of successes can reach.
    pub min_score: u32,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            neutral_score: 1000,
            success_step: 50,
            failure_step: 200,
            min_score: 50,
        }
    }
}

/// Per-endpoint counters, exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointStats {
    pub score: u32,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Default)]
pub struct GatewayRanking {
    config: RankingConfig,
    stats: Arc<DashMap<Endpoint, EndpointStats>>,
}

impl GatewayRanking {
    pub fn new(config: RankingConfig) -> Self {
        Self {
            config,
            stats: Arc::new(DashMap::new()),
        }
    }

    pub fn score(&self, endpoint: &Endpoint) -> u32 {
        self.stats
            .get(endpoint)
            .map(|s| s.score)
            .unwrap_or(self.config.neutral_score)
    }

    pub fn stats(&self, endpoint: &Endpoint) -> Option<EndpointStats> {
        self.stats.get(endpoint).map(|s| *s)
    }

    /// Order candidates best-first. Ties keep the caller's order.
    pub fn rank(&self, candidates: &[Endpoint]) -> Vec<Endpoint> {
        let mut scored: Vec<(u32, &Endpoint)> =
            candidates.iter().map(|e| (self.score(e), e)).collect();
        scored.sort_by_key(|(score, _)| *score);
        scored.into_iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn report_success(&self, endpoint: &Endpoint) {
        let mut entry = self.entry(endpoint);
        entry.successes += 1;
        entry.score = entry
            .score
            .saturating_sub(self.config.success_step)
            .max(self.config.min_score);
        trace!(endpoint = %endpoint, score = entry.score, "endpoint success reported");
    }

    pub fn report_failure(&self, endpoint: &Endpoint) {
        let mut entry = self.entry(endpoint);
        entry.failures += 1;
        entry.score = entry.score.saturating_add(self.config.failure_step);
        trace!(endpoint = %endpoint, score = entry.score, "endpoint failure reported");
    }

    /// Snapshot of all endpoints that have reported at least once, best-first.
    pub fn snapshot(&self) -> Vec<(Endpoint, EndpointStats)> {
        let mut all: Vec<(Endpoint, EndpointStats)> = self
            .stats
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        all.sort_by(|a, b| {
            a.1.score
                .cmp(&b.1.score)
                .then_with(|| a.0.template().cmp(b.0.template()))
        });
        all
    }

    fn entry(
        &self,
        endpoint: &Endpoint,
    ) -> dashmap::mapref::one::RefMut<'_, Endpoint, EndpointStats> {
        self.stats
            .entry(endpoint.clone())
            .or_insert_with(|| EndpointStats {
                score: self.config.neutral_score,
                successes: 0,
                failures: 0,
            })
    }
}
