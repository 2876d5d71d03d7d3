//! One-shot batch jobs over the collection's images.
//!
//! Both jobs work through their inputs in fixed-size batches, pause briefly
//! between batches, log progress after each one, and stop early when their
//! cancellation token fires.

pub mod thumbnails;
pub mod upscale;

use crate::utils::{fmt_duration, percent};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Result of processing a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Done,
    Skipped,
    Failed,
    /// Interrupted before finishing; not counted as processed.
    Cancelled,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub total: usize,
    pub processed: usize,
    pub successful: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchStats {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Done => self.successful += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Cancelled => return,
        }
        self.processed += 1;
    }

    pub fn is_complete(&self) -> bool {
        self.processed == self.total
    }
}

/// Drive `items` through `process` in batches of `batch_size`.
///
/// Items inside a batch run concurrently; batches run one after another with
/// `pause` in between. Returns early (with partial stats) once `cancel` fires.
pub async fn run_batches<T, F, Fut>(
    job: &'static str,
    items: Vec<T>,
    batch_size: usize,
    pause: Duration,
    cancel: &CancellationToken,
    process: F,
) -> BatchStats
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = ItemOutcome>,
{
    let started = Instant::now();
    let batch_size = batch_size.max(1);
    let mut stats = BatchStats::new(items.len());
    let batch_count = items.len().div_ceil(batch_size);

    info!(job, total = stats.total, batches = batch_count, batch_size, "starting batch job");

    let mut items = items.into_iter().peekable();
    let mut batch_index = 0;
    while items.peek().is_some() {
        if cancel.is_cancelled() {
            break;
        }
        batch_index += 1;

        let batch: Vec<T> = items.by_ref().take(batch_size).collect();
        let outcomes = futures::future::join_all(batch.into_iter().map(&process)).await;
        for outcome in outcomes {
            stats.record(outcome);
        }

        info!(
            job,
            batch = batch_index,
            batches = batch_count,
            processed = stats.processed,
            total = stats.total,
            progress_pct = percent(stats.processed, stats.total),
            successful = stats.successful,
            skipped = stats.skipped,
            failed = stats.failed,
            "batch finished"
        );

        if items.peek().is_some() && !pause.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    if stats.is_complete() {
        info!(
            job,
            duration = fmt_duration(started.elapsed()),
            successful = stats.successful,
            skipped = stats.skipped,
            failed = stats.failed,
            success_pct = percent(stats.successful + stats.skipped, stats.total),
            "batch job complete"
        );
    } else {
        info!(
            job,
            duration = fmt_duration(started.elapsed()),
            processed = stats.processed,
            total = stats.total,
            successful = stats.successful,
            failed = stats.failed,
            "batch job interrupted, re-run to continue"
        );
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn processes_every_item_and_tallies_outcomes() {
        let cancel = CancellationToken::new();
        let classify = |i: u32| async move {
            match i % 3 {
                0 => ItemOutcome::Done,
                1 => ItemOutcome::Skipped,
                _ => ItemOutcome::Failed,
            }
        };
        let pause = Duration::ZERO;
        let stats = run_batches("test", (0..10).collect(), 3, pause, &cancel, classify).await;

        assert_eq!(stats.total, 10);
        assert_eq!(stats.processed, 10);
        assert_eq!(stats.successful, 4);
        assert_eq!(stats.skipped, 3);
        assert_eq!(stats.failed, 3);
        assert!(stats.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_before_next_batch() {
        let cancel = CancellationToken::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let cancel_on_first = |_: u32| {
            let seen = seen.clone();
            let cancel = cancel.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    cancel.cancel();
                }
                ItemOutcome::Done
            }
        };
        let pause = Duration::from_secs(1);
        let stats = run_batches("test", (0..9).collect(), 3, pause, &cancel, cancel_on_first).await;

        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(stats.processed, 3);
        assert!(!stats.is_complete());
    }

    #[test]
    fn cancelled_items_are_not_counted() {
        let mut stats = BatchStats::new(2);
        stats.record(ItemOutcome::Cancelled);
        stats.record(ItemOutcome::Done);
        assert_eq!(stats.processed, 1);
        assert!(!stats.is_complete());
    }
}
