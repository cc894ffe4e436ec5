use crate::error::ForkSyncError;
use anyhow::Result;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Exponential backoff policy shared by fork restarts (bounded) and
/// re-subscription to the remote endpoint (unbounded).
#[derive(Clone, Copy)]
pub(crate) struct RetryBackoff<'a> {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<usize>,
    pub cancellation: Option<&'a CancellationToken>,
}

impl<'a> RetryBackoff<'a> {
    pub(crate) fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: None,
            cancellation: None,
        }
    }

    pub(crate) fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub(crate) fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

pub(crate) enum RetryDisposition {
    Retry,
    Abort,
}

/// Runs `operation` until it succeeds, `classify_error` aborts, attempts run
/// out, or the cancellation token fires. Cancellation surfaces as
/// [`ForkSyncError::Cancelled`].
///
/// `on_retry` sees every failure; its last argument is `false` when no
/// further attempt will be made.
pub(crate) async fn retry_with_backoff<'a, T, F, Fut, L, C>(
    config: RetryBackoff<'a>,
    mut operation: F,
    mut on_retry: L,
    mut classify_error: C,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
    L: FnMut(usize, Duration, &anyhow::Error, bool),
    C: FnMut(usize, &anyhow::Error) -> RetryDisposition,
{
    let mut attempt = 0;
    let mut backoff = config.initial_delay;

    loop {
        attempt += 1;

        if config.cancellation.is_some_and(CancellationToken::is_cancelled) {
            return Err(ForkSyncError::Cancelled.into());
        }

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if let RetryDisposition::Abort = classify_error(attempt, &err) {
            return Err(err);
        }

        let exhausted = config.max_attempts.is_some_and(|max| attempt >= max);
        on_retry(attempt, backoff, &err, !exhausted);
        if exhausted {
            return Err(err);
        }

        sleep_with_cancellation(backoff, config.cancellation).await?;
        backoff = next_backoff(backoff, config.max_delay);
    }
}

pub(crate) async fn sleep_with_cancellation(
    delay: Duration,
    cancellation: Option<&CancellationToken>,
) -> Result<()> {
    if delay.is_zero() {
        yield_now().await;
        return Ok(());
    }

    match cancellation {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(ForkSyncError::Cancelled.into()),
            _ = sleep(delay) => Ok(()),
        },
        None => {
            sleep(delay).await;
            Ok(())
        }
    }
}

pub(crate) fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }

    current.saturating_mul(2).min(max_backoff)
}
