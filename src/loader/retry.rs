//! Attempt budget, backoff and per-attempt timeout for a single resource load.

use crate::config::duration;
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// Delay strategy between consecutive attempts.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed {
        #[serde(with = "duration")]
        base: Duration,
    },
    /// `base * (attempt + 1)`.
    Linear {
        #[serde(with = "duration")]
        base: Duration,
    },
    /// `base * factor^attempt`, capped at `max`, optionally jittered by +/- 50%.
    Exponential {
        #[serde(with = "duration")]
        base: Duration,
        factor: f64,
        #[serde(with = "duration")]
        max: Duration,
        #[serde(default)]
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Linear {
            base: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts across all candidates. `None` means one attempt per candidate.
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
    /// A hung attempt is abandoned after this long and counted as a failure.
    #[serde(with = "duration")]
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::default(),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy with no delay between attempts. Mostly useful for tests and one-shot probes.
    pub fn immediate(max_attempts: Option<u32>, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed {
                base: Duration::ZERO,
            },
            attempt_timeout,
        }
    }

    /// Attempt budget for a request with `candidates` endpoints. Always at least one.
    pub fn attempt_limit(&self, candidates: usize) -> u32 {
        let limit = self
            .max_attempts
            .unwrap_or_else(|| u32::try_from(candidates).unwrap_or(u32::MAX));
        limit.max(1)
    }

    /// Whether attempt number `attempt` (zero-based) may run.
    pub fn should_retry(&self, attempt: u32, candidates: usize) -> bool {
        attempt < self.attempt_limit(candidates)
    }

    /// Delay to wait after attempt `attempt` (zero-based) failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed { base } => base,
            Backoff::Linear { base } => base.saturating_mul(attempt.saturating_add(1)),
            Backoff::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exp = factor.max(1.0).powi(i32::try_from(attempt).unwrap_or(i32::MAX));
                let raw = base.as_secs_f64() * exp;
                let capped = raw.min(max.as_secs_f64());
                let secs = if jitter {
                    capped * rand::rng().random_range(0.5..1.5)
                } else {
                    capped
                };
                Duration::from_secs_f64(secs.clamp(0.0, max.as_secs_f64()))
            }
        }
    }
}
