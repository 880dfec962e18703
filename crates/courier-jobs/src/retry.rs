//! Classification and pacing for failed job requests.
//!
//! Pure helpers that look at an opaque error value and decide whether the
//! caller should wait and retry, give up quietly, or let the error travel
//! to the outer retry machinery.

use std::error::Error as StdError;
use std::time::Duration;

use courier_sync::{SleepOptions, Sleeper};

use crate::error::HttpError;

/// Wait applied when a rate-limited response carries no usable Retry-After.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Server-supplied waits shorter than this are rounded up to it.
pub const MINIMUM_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Cap on the exponential backoff between attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(86_400);

/// What a caller should do after [`handle_common_job_request_error`]
/// classified a failure.
#[derive(Debug)]
pub enum ErrorAction<E> {
    /// The rate-limit wait has been served; attempt the job again. Carries
    /// the original error so the caller can surface it if the next attempt
    /// never happens.
    Retry(E),
    /// The server has given up on this work (508); drop the job without
    /// surfacing a failure.
    Abandon,
}

/// Finds the HTTP status attached to `err`: on the error itself, or on a
/// nested HTTP error reached through its `source` chain. `None` when no
/// status is present or the value falls outside 100–999.
pub fn get_http_error_code(err: &(dyn StdError + 'static)) -> Option<u16> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(http) = e.downcast_ref::<HttpError>() {
            if (100..=999).contains(&http.code) {
                return Some(http.code);
            }
        }
        current = e.source();
    }
    None
}

/// Parses a Retry-After header value, given in seconds. Missing or
/// non-numeric input yields `default`; anything under one second is clamped
/// up to [`MINIMUM_RETRY_AFTER`].
pub fn parse_retry_after_with_default(value: Option<&str>, default: Duration) -> Duration {
    match value.and_then(|v| v.trim().parse::<u64>().ok()) {
        Some(seconds) => Duration::from_secs(seconds).max(MINIMUM_RETRY_AFTER),
        None => default,
    }
}

/// Pulls the Retry-After wait out of `err`'s response headers — its own, or
/// a nested HTTP error's, taking the first value when the header repeats —
/// falling back to `default` when absent or unparseable.
pub fn find_retry_after_time_from_error(
    err: &(dyn StdError + 'static),
    default: Duration,
) -> Duration {
    let mut header = None;
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(http) = e.downcast_ref::<HttpError>() {
            if let Some(value) = http.response_headers.get(http::header::RETRY_AFTER) {
                header = value.to_str().ok();
                break;
            }
        }
        current = e.source();
    }
    parse_retry_after_with_default(header, default)
}

/// Serves the server-directed rate-limit wait, bounded by the job's
/// remaining time budget. Does nothing when the budget is already spent.
pub async fn sleep_for_rate_limit_retry_after_time(
    err: &(dyn StdError + Send + Sync + 'static),
    sleeper: &Sleeper,
    time_remaining: Duration,
) {
    if time_remaining.is_zero() {
        return;
    }
    let retry_after = find_retry_after_time_from_error(err, DEFAULT_RETRY_AFTER).min(time_remaining);
    tracing::info!(
        retry_after_ms = retry_after.as_millis() as u64,
        "rate limited; sleeping before the next attempt"
    );
    sleeper
        .sleep(retry_after, "rate-limit retry-after", SleepOptions::default())
        .await;
}

/// Top-level classifier for a failed job request.
///
/// HTTP 413 and 429 are rate limits: the server-directed wait is served
/// here, and the caller is told to retry the same job. HTTP 508 means the
/// server has given up; the job is dropped quietly. Every other error is
/// handed back unchanged for the outer retry/terminal-failure path.
pub async fn handle_common_job_request_error<E>(
    err: E,
    sleeper: &Sleeper,
    time_remaining: Duration,
) -> Result<ErrorAction<E>, E>
where
    E: StdError + Send + Sync + 'static,
{
    match get_http_error_code(&err) {
        Some(413) | Some(429) => {
            sleep_for_rate_limit_retry_after_time(&err, sleeper, time_remaining).await;
            Ok(ErrorAction::Retry(err))
        }
        Some(508) => {
            tracing::info!("server responded with 508; giving up on this job");
            Ok(ErrorAction::Abandon)
        }
        _ => Err(err),
    }
}

/// Wait served before retry attempt `attempt` (1-based): nothing before the
/// first attempt, then powers of two seconds, capped at [`MAX_BACKOFF`].
pub fn exponential_backoff_sleep_time(attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let seconds = 2u64
        .saturating_pow(attempt - 1)
        .min(MAX_BACKOFF.as_secs());
    Duration::from_secs(seconds)
}

/// The attempt count whose cumulative backoff first reaches `max_time`:
/// used to derive a queue's attempt cap from its retry time budget.
pub fn exponential_backoff_max_attempts(max_time: Duration) -> u32 {
    let mut total = Duration::ZERO;
    let mut attempt = 1;
    loop {
        attempt += 1;
        total += exponential_backoff_sleep_time(attempt);
        if total >= max_time {
            return attempt;
        }
    }
}

/// Per-attempt gate run at the top of a job body. Reports `false` when the
/// job's time budget is spent; otherwise serves the exponential backoff for
/// this attempt (none on the first attempt, or when `skip_wait` is set) and
/// reports that the job may proceed.
pub async fn should_job_continue(
    attempt: u32,
    time_remaining: Duration,
    skip_wait: bool,
    sleeper: &Sleeper,
) -> bool {
    if time_remaining.is_zero() {
        tracing::warn!(attempt, "job ran out of time");
        return false;
    }
    if !skip_wait {
        let backoff = exponential_backoff_sleep_time(attempt).min(time_remaining);
        if !backoff.is_zero() {
            tracing::info!(
                attempt,
                sleep_ms = backoff.as_millis() as u64,
                "waiting before the next attempt"
            );
            sleeper
                .sleep(backoff, "job retry backoff", SleepOptions::default())
                .await;
        }
    }
    true
}
