//! Retry Controller (C9): retry eligibility and backoff delay computation
//! (spec §4.4).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;

use crate::models::{ExecutionStatus, RetryStrategy, TaskExecution};

/// `should_retry = (retry_strategy != NONE) && (retry_count < max_retries) && (status in {FAILED, TIMEOUT})`.
pub fn should_retry(exec: &TaskExecution) -> bool {
    exec.retry_strategy != RetryStrategy::None
        && exec.retry_count < exec.max_retries
        && matches!(exec.status, ExecutionStatus::Failed | ExecutionStatus::Timeout)
}

fn fibonacci(n: u32) -> u64 {
    if n == 0 {
        return 0;
    }
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 2..=n {
        let next = a + b;
        a = b;
        b = next;
    }
    b
}

/// Computes the delay (in seconds) before the next attempt, given the
/// execution's strategy and its retry count *after* incrementing.
pub fn backoff_delay_seconds(strategy: RetryStrategy, retry_delay: u64, retry_count: u32) -> f64 {
    match strategy {
        RetryStrategy::None => 0.0,
        RetryStrategy::Immediate => 0.0,
        RetryStrategy::FixedDelay => retry_delay as f64,
        RetryStrategy::ExponentialBackoff => {
            let base = retry_delay as f64 * 2f64.powi(retry_count as i32 - 1);
            let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
            base + jitter
        }
        RetryStrategy::FibonacciBackoff => retry_delay as f64 * fibonacci(retry_count) as f64,
    }
}

/// Applies §4.4: increments `retry_count`, computes `next_retry_at`, and
/// transitions the execution to RETRYING. Returns `false` (leaving the
/// execution in its terminal state) if not eligible.
pub fn prepare_retry(exec: &mut TaskExecution, now: DateTime<Utc>) -> bool {
    if !should_retry(exec) {
        return false;
    }

    exec.retry_count += 1;
    let delay = backoff_delay_seconds(exec.retry_strategy, exec.retry_delay_seconds, exec.retry_count);
    exec.next_retry_at = Some(now + ChronoDuration::milliseconds((delay * 1000.0) as i64));
    exec.apply_transition(
        ExecutionStatus::Retrying,
        Some(serde_json::json!({"reason": "scheduled_retry", "retry_count": exec.retry_count})),
    );
    true
}
