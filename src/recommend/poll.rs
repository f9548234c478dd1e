//! Fixed-interval, cancellable polling for a session's recommendation.

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{FetchOutcome, PollPolicy, Recommendation, RecommendationService, Session};
use crate::error::{Result, TuneError};

/// Fetch until the service returns a recommendation.
///
/// The first attempt is immediate; later attempts follow every
/// `policy.interval`, with one final attempt exactly at the deadline when
/// the interval does not divide `policy.max_wait`. Every attempt is raced
/// against the deadline and the token, so a hung request cannot hold the
/// loop past `max_wait`.
///
/// # Errors
/// - [`TuneError::RecommendationTimeout`] once `max_wait` has elapsed.
/// - [`TuneError::Cancelled`] as soon as `cancel` fires, mid-sleep or
///   mid-request.
/// - Any error from a fetch attempt itself (transport or parse failure).
///   Non-success statuses are logged and retried, never fatal.
pub async fn poll_until_ready<S>(
    service: &S,
    session: &Session,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> Result<Recommendation>
where
    S: RecommendationService + ?Sized,
{
    let started = Instant::now();
    let deadline = started + policy.max_wait;
    let mut attempts: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(TuneError::Cancelled);
        }

        attempts = attempts.saturating_add(1);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TuneError::Cancelled),
            fetched = service.fetch_recommendation(session) => fetched?,
            _ = tokio::time::sleep_until(deadline) => {
                warn!(session = %session, attempts, "recommendation fetch still in flight at deadline");
                return Err(TuneError::RecommendationTimeout {
                    waited: started.elapsed(),
                    attempts,
                });
            }
        };
        match outcome {
            FetchOutcome::Ready(rec) => {
                debug!(session = %session, attempts, "recommendation ready");
                return Ok(rec);
            }
            FetchOutcome::NotReady { status, body } => {
                warn!(
                    session = %session,
                    status,
                    attempts,
                    body = body.trim(),
                    "recommendation not ready, will retry"
                );
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(TuneError::RecommendationTimeout {
                waited: now - started,
                attempts,
            });
        }
        let wake = (now + policy.interval).min(deadline);

        tokio::select! {
            _ = cancel.cancelled() => return Err(TuneError::Cancelled),
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}
