//! Delivery failure classification and backoff schedule.

use rand::Rng;
use std::time::Duration;

use checkout_types::webhook::RetryBackoff;

/// Base delay between attempts.
pub const BASE_DELAY: Duration = Duration::from_secs(30);
/// Upper bound on any computed delay.
pub const MAX_DELAY: Duration = Duration::from_secs(3600);
/// Jitter applied to every delay, as a fraction of the raw value.
pub const JITTER_FRACTION: f64 = 0.1;

/// Classification of a finished HTTP attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptClass {
    /// 2xx: recorded as delivered.
    Success,
    /// Worth retrying: 408, 429, 5xx, connect errors, timeouts.
    Transient,
    /// Not worth retrying: any other status.
    Terminal,
}

/// Classifies an HTTP status per the delivery policy.
pub fn classify_status(status: u16) -> AttemptClass {
    match status {
        200..=299 => AttemptClass::Success,
        408 | 429 => AttemptClass::Transient,
        500..=599 => AttemptClass::Transient,
        _ => AttemptClass::Terminal,
    }
}

/// Raw (unjittered) delay after the `attempt`-th failed attempt (1-based).
///
/// Exponential doubles from the base (30s, 60s, 120s, ...); linear grows by
/// the base each attempt (30s, 60s, 90s, ...). Both cap at [`MAX_DELAY`].
pub fn raw_delay(backoff: RetryBackoff, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let secs = match backoff {
        RetryBackoff::Exponential => {
            let exponent = (attempt - 1).min(30);
            BASE_DELAY.as_secs().saturating_mul(1u64 << exponent)
        }
        RetryBackoff::Linear => BASE_DELAY.as_secs().saturating_mul(u64::from(attempt)),
    };
    Duration::from_secs(secs).min(MAX_DELAY)
}

/// [`raw_delay`] with ±10% jitter applied.
pub fn retry_delay(backoff: RetryBackoff, attempt: u32) -> Duration {
    let raw = raw_delay(backoff, attempt).as_secs_f64();
    let factor = rand::rng().random_range((1.0 - JITTER_FRACTION)..=(1.0 + JITTER_FRACTION));
    Duration::from_secs_f64(raw * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_band() {
        assert_eq!(classify_status(200), AttemptClass::Success);
        assert_eq!(classify_status(204), AttemptClass::Success);
        assert_eq!(classify_status(299), AttemptClass::Success);
    }

    #[test]
    fn test_transient_statuses() {
        for status in [408, 429, 500, 502, 503, 599] {
            assert_eq!(classify_status(status), AttemptClass::Transient, "{status}");
        }
    }

    #[test]
    fn test_terminal_statuses() {
        for status in [301, 400, 401, 403, 404, 410, 422] {
            assert_eq!(classify_status(status), AttemptClass::Terminal, "{status}");
        }
    }

    #[test]
    fn test_exponential_schedule() {
        let delays: Vec<u64> = (1..=4)
            .map(|attempt| raw_delay(RetryBackoff::Exponential, attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![30, 60, 120, 240]);
    }

    #[test]
    fn test_linear_schedule() {
        let delays: Vec<u64> = (1..=4)
            .map(|attempt| raw_delay(RetryBackoff::Linear, attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![30, 60, 90, 120]);
    }

    #[test]
    fn test_delay_caps_at_one_hour() {
        assert_eq!(raw_delay(RetryBackoff::Exponential, 12), MAX_DELAY);
        assert_eq!(raw_delay(RetryBackoff::Exponential, 63), MAX_DELAY);
        assert_eq!(raw_delay(RetryBackoff::Linear, 500), MAX_DELAY);
    }

    #[test]
    fn test_jitter_stays_within_band() {
        for attempt in 1..=6 {
            let raw = raw_delay(RetryBackoff::Exponential, attempt).as_secs_f64();
            for _ in 0..50 {
                let jittered = retry_delay(RetryBackoff::Exponential, attempt).as_secs_f64();
                assert!(jittered >= raw * 0.9 - f64::EPSILON);
                assert!(jittered <= raw * 1.1 + f64::EPSILON);
            }
        }
    }
}
