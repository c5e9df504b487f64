//! Bounded fixed-delay retry of failed connection attempts.

use std::time::Duration;

use backoff::backoff::{Backoff as _, Constant};
use tokio_util::sync::CancellationToken;

use super::config::RetryPolicy;

/// A scheduled retry. Dropping it leaves the timer armed; call [`PendingRetry::cancel`].
#[derive(Debug)]
pub(crate) struct PendingRetry {
    pub(crate) attempt: u32,
    cancel: CancellationToken,
}

impl PendingRetry {
    pub(crate) fn cancel(self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    Exhausted,
}

#[derive(Debug)]
pub(crate) struct RetryScheduler {
    policy: RetryPolicy,
    backoff: Constant,
}

impl RetryScheduler {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            backoff: policy.into(),
        }
    }

    /// `retry_count` is the number of retries already made in this cycle.
    pub(crate) fn decide(&mut self, retry_count: u32) -> RetryDecision {
        let attempts_made = retry_count.saturating_add(1);
        if attempts_made >= self.policy.max_attempts {
            return RetryDecision::Exhausted;
        }

        RetryDecision::Retry {
            attempt: attempts_made,
            delay: self.backoff.next_backoff().unwrap_or(self.policy.delay),
        }
    }

    /// Runs `task` after `delay` unless the returned handle is cancelled first.
    pub(crate) fn schedule<F>(&self, attempt: u32, delay: Duration, task: F) -> PendingRetry
    where
        F: FnOnce() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let fired = cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = fired.cancelled() => {}
                () = tokio::time::sleep(delay) => task(),
            }
        });

        PendingRetry { attempt, cancel }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn three_attempts_mean_two_retries() {
        let mut scheduler = RetryScheduler::new(RetryPolicy::new(3, Duration::from_secs(1)));

        assert_eq!(
            scheduler.decide(0),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            scheduler.decide(1),
            RetryDecision::Retry {
                attempt: 2,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(scheduler.decide(2), RetryDecision::Exhausted);
    }

    #[test]
    fn single_attempt_never_retries() {
        let mut scheduler = RetryScheduler::new(RetryPolicy::new(1, Duration::from_secs(1)));

        assert_eq!(scheduler.decide(0), RetryDecision::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_task_fires_after_delay() {
        let scheduler = RetryScheduler::new(RetryPolicy::default());
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);

        let pending = scheduler.schedule(1, Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(pending.attempt, 1);

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_never_fires() {
        let scheduler = RetryScheduler::new(RetryPolicy::default());
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);

        let pending = scheduler.schedule(1, Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        pending.cancel();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
