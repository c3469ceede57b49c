use std::future::Future;

use futures::{future, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{RewindError, RewindResult};

/// Result of a [`BatchSearch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOutcome<T> {
    /// Stream position and value of the winning candidate
    pub found: Option<(usize, T)>,
    /// Number of candidates that were tested
    pub tested: usize,
}

/// Tests a candidate stream in sequential fixed-size batches.
///
/// Candidates of a batch are tested concurrently, up to `concurrency` at a time. When a
/// batch holds several passing candidates the one with the lowest stream position wins,
/// so the outcome only depends on the candidate order.
#[derive(Debug, Clone, Copy)]
pub struct BatchSearch {
    batch_size: usize,
    concurrency: usize,
}

impl BatchSearch {
    pub fn new(batch_size: usize, concurrency: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run<T, I, F, Fut>(
        &self,
        label: &str,
        candidates: I,
        cancel: &CancellationToken,
        test: F,
    ) -> RewindResult<SearchOutcome<T>>
    where
        I: IntoIterator<Item = T>,
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut candidates = candidates.into_iter().enumerate().peekable();
        let mut tested = 0;
        let mut batch_index = 0;
        let test = &test;

        while candidates.peek().is_some() {
            if cancel.is_cancelled() {
                return Err(RewindError::Cancelled);
            }

            let batch: Vec<(usize, T)> = candidates.by_ref().take(self.batch_size).collect();
            let batch_len = batch.len();
            tracing::debug!(
                "{label}: testing batch #{batch_index} ({batch_len} candidates, {tested} tested so far)"
            );

            let hits = futures::stream::iter(batch)
                .map(|(position, candidate)| async move {
                    let passed = test(candidate.clone()).await;
                    (position, candidate, passed)
                })
                .buffer_unordered(self.concurrency)
                .filter_map(|(position, candidate, passed)| {
                    future::ready(passed.then_some((position, candidate)))
                })
                .collect::<Vec<_>>();

            let hits = tokio::select! {
                hits = hits => hits,
                _ = cancel.cancelled() => return Err(RewindError::Cancelled),
            };
            tested += batch_len;

            if let Some(hit) = hits.into_iter().min_by_key(|(position, _)| *position) {
                tracing::debug!("{label}: candidate #{} passed", hit.0);
                return Ok(SearchOutcome {
                    found: Some(hit),
                    tested,
                });
            }
            batch_index += 1;
        }

        Ok(SearchOutcome {
            found: None,
            tested,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn test_lowest_position_wins_within_batch() {
        let search = BatchSearch::new(10, 10);
        let outcome = search
            .run("test", 0..100u32, &CancellationToken::new(), |n| async move {
                // later candidates finish first
                tokio::time::sleep(Duration::from_millis(20 - (n % 10) as u64)).await;
                n == 13 || n == 17
            })
            .await
            .unwrap();

        assert_eq!(outcome.found, Some((13, 13)));
        assert_eq!(outcome.tested, 20);
    }

    #[tokio::test]
    async fn test_stops_after_winning_batch() {
        let calls = AtomicUsize::new(0);
        let search = BatchSearch::new(4, 2);
        let outcome = search
            .run("test", 0..100u32, &CancellationToken::new(), |n| {
                calls.fetch_add(1, Ordering::Relaxed);
                async move { n == 5 }
            })
            .await
            .unwrap();

        assert_eq!(outcome.found, Some((5, 5)));
        assert_eq!(calls.load(Ordering::Relaxed), 8);
    }

    #[tokio::test]
    async fn test_exhausted() {
        let search = BatchSearch::new(3, 3);
        let outcome = search
            .run("test", Vec::<u8>::new(), &CancellationToken::new(), |_| async {
                true
            })
            .await
            .unwrap();
        assert_eq!(outcome, SearchOutcome { found: None, tested: 0 });

        let outcome = search
            .run("test", 0..7u8, &CancellationToken::new(), |_| async { false })
            .await
            .unwrap();
        assert_eq!(outcome.found, None);
        assert_eq!(outcome.tested, 7);
    }

    #[tokio::test]
    async fn test_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = BatchSearch::new(3, 3)
            .run("test", 0..7u8, &cancel, |_| async { false })
            .await;
        assert!(matches!(result, Err(RewindError::Cancelled)));
    }
}
