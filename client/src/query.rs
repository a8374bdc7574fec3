//! Retry and polling wrappers around single-attempt queries.

use crate::Error;
use sequencer_harness_backoff::{Backoff, Config};
use std::{fmt::Debug, future::Future, time::Duration};
use tracing::{debug, info, warn};

/// Interval between polls of a condition.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The value that satisfied a [poll_until] predicate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Poll<T> {
    /// Last observed value.
    pub value: T,

    /// Number of queries issued (including the one that satisfied the predicate).
    pub attempts: usize,

    /// Time spent polling.
    pub elapsed: Duration,

    /// Time left in the polling budget.
    pub remaining: Duration,
}

/// Executes a single attempt of `op` without retrying.
pub async fn try_query<T, F, Fut>(op: F) -> Result<T, Error>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let result = op().await;
    if let Err(err) = &result {
        debug!(?err, "query attempt failed");
    }
    result
}

/// Repeatedly calls `op` until it succeeds, waiting with exponential backoff between attempts.
///
/// Returns [Error::RetriesExhausted] (wrapping the last failure) once `timeout` cannot
/// accommodate another wait.
pub async fn query_with_retry<T, F, Fut>(
    participant: &str,
    operation: &str,
    timeout: Duration,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut backoff = Backoff::new(Config::exponential(timeout))?;
    loop {
        let err = match try_query(&mut op).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        warn!(
            participant,
            operation,
            %err,
            retry_in = ?backoff.delay(),
            "query failed"
        );
        if backoff.wait().await.is_err() {
            return Err(Error::RetriesExhausted {
                participant: participant.to_string(),
                operation: operation.to_string(),
                attempts: backoff.waits() + 1,
                last: Box::new(err),
            });
        }
    }
}

/// Repeatedly calls `op` until the returned value satisfies `done`, waiting [POLL_INTERVAL]
/// between attempts.
///
/// A failed query is logged and retried. Only exhausting `timeout` is fatal, in which case
/// [Error::Unsatisfied] reports the last value observed.
pub async fn poll_until<T, F, Fut, P>(
    participant: &str,
    operation: &str,
    timeout: Duration,
    mut op: F,
    mut done: P,
) -> Result<Poll<T>, Error>
where
    T: Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    P: FnMut(&T) -> bool,
{
    let mut backoff = Backoff::new(Config::fixed(timeout, POLL_INTERVAL))?;
    let mut attempts = 0;
    let mut last = None;
    loop {
        attempts += 1;
        match try_query(&mut op).await {
            Ok(value) if done(&value) => {
                info!(
                    participant,
                    operation,
                    observed = ?value,
                    elapsed = ?backoff.elapsed(),
                    "condition satisfied"
                );
                return Ok(Poll {
                    value,
                    attempts,
                    elapsed: backoff.elapsed(),
                    remaining: backoff.remaining(),
                });
            }
            Ok(value) => last = Some(value),
            Err(err) => warn!(participant, operation, %err, "query failed"),
        }
        if backoff.wait().await.is_err() {
            return Err(Error::Unsatisfied {
                participant: participant.to_string(),
                operation: operation.to_string(),
                timeout,
                last: format!("{last:?}"),
            });
        }
        info!(
            participant,
            operation,
            observed = ?last,
            remaining = ?backoff.remaining(),
            "awaiting condition"
        );
    }
}
