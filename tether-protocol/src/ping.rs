//! Ping Estimation
//!
//! A ping round sends a batch of timed echo requests and reports
//! `mean + 0.7 × stddev` of their round-trip times, a deliberately
//! pessimistic figure that accounts for jitter.

use parking_lot::Mutex;
use std::time::Duration;

/// Weight of the standard deviation in the reported ping
pub const STDDEV_WEIGHT: f64 = 0.7;

/// Why a ping round failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingFailure {
    /// More echoes were lost than allowed
    LossTooHigh,
    /// The connection closed before the round could start
    ConnectionClosed,
}

/// Callback receiving `(ping_ms, failed_echoes)`
pub type PingSuccess = Box<dyn FnOnce(u32, u32) + Send>;

/// Callback receiving `(reason, failed_echoes)`
pub type PingFailed = Box<dyn FnOnce(PingFailure, u32) + Send>;

/// `round(mean + 0.7 × stddev)` of the samples in milliseconds
///
/// Uses the population standard deviation. Returns `None` for no samples.
pub fn estimate_ping(samples_ms: &[f64]) -> Option<u32> {
    if samples_ms.is_empty() {
        return None;
    }

    let n = samples_ms.len() as f64;
    let mean = samples_ms.iter().sum::<f64>() / n;
    let variance = samples_ms.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    let ping = mean + variance.sqrt() * STDDEV_WEIGHT;

    Some(ping.round().max(0.0) as u32)
}

struct RoundState {
    remaining: usize,
    samples: Vec<f64>,
    failures: u32,
    on_success: Option<PingSuccess>,
    on_failure: Option<PingFailed>,
}

/// Collects echo results until every echo of a round has finished
pub struct PingRound {
    allowed_failures: u32,
    state: Mutex<RoundState>,
}

impl PingRound {
    pub fn new(
        expected: usize,
        allowed_failures: u32,
        on_success: PingSuccess,
        on_failure: PingFailed,
    ) -> Self {
        PingRound {
            allowed_failures,
            state: Mutex::new(RoundState {
                remaining: expected,
                samples: Vec::with_capacity(expected),
                failures: 0,
                on_success: Some(on_success),
                on_failure: Some(on_failure),
            }),
        }
    }

    /// Record one echo; `None` means it was lost
    pub fn record(&self, round_trip: Option<Duration>) {
        let mut state = self.state.lock();
        if state.remaining == 0 {
            return;
        }

        match round_trip {
            Some(rtt) => state.samples.push(rtt.as_secs_f64() * 1000.0),
            None => state.failures += 1,
        }
        state.remaining -= 1;
        if state.remaining > 0 {
            return;
        }

        let failures = state.failures;
        let samples = std::mem::take(&mut state.samples);
        let on_success = state.on_success.take();
        let on_failure = state.on_failure.take();
        drop(state);

        let ping = if failures > self.allowed_failures {
            tracing::warn!(
                "Ping failed due to too many lost echoes, lost: {}",
                failures
            );
            None
        } else {
            estimate_ping(&samples)
        };

        match ping {
            Some(ping) => {
                tracing::info!("Ping completed: {} ms ({} lost)", ping, failures);
                if let Some(on_success) = on_success {
                    on_success(ping, failures);
                }
            }
            None => {
                if let Some(on_failure) = on_failure {
                    on_failure(PingFailure::LossTooHigh, failures);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_formula() {
        // mean 20, population stddev sqrt(200/3) ≈ 8.165 → 25.72
        assert_eq!(estimate_ping(&[10.0, 20.0, 30.0]), Some(26));
    }

    #[test]
    fn test_constant_samples() {
        assert_eq!(estimate_ping(&[42.0; 5]), Some(42));
    }

    #[test]
    fn test_empty() {
        assert_eq!(estimate_ping(&[]), None);
    }

    #[test]
    fn test_round_success() {
        let result = Arc::new(Mutex::new(None));
        let out = Arc::clone(&result);
        let round = PingRound::new(
            3,
            0,
            Box::new(move |ping, fails| *out.lock() = Some((ping, fails))),
            Box::new(|_, _| panic!("ping should succeed")),
        );

        round.record(Some(Duration::from_millis(10)));
        round.record(Some(Duration::from_millis(20)));
        assert!(result.lock().is_none());
        round.record(Some(Duration::from_millis(30)));

        assert_eq!(*result.lock(), Some((26, 0)));
    }

    #[test]
    fn test_round_loss_too_high() {
        let result = Arc::new(Mutex::new(None));
        let out = Arc::clone(&result);
        let round = PingRound::new(
            3,
            1,
            Box::new(|_, _| panic!("ping should fail")),
            Box::new(move |reason, fails| *out.lock() = Some((reason, fails))),
        );

        round.record(None);
        round.record(Some(Duration::from_millis(10)));
        round.record(None);

        assert_eq!(*result.lock(), Some((PingFailure::LossTooHigh, 2)));
    }

    #[test]
    fn test_round_tolerates_allowed_failures() {
        let result = Arc::new(Mutex::new(None));
        let out = Arc::clone(&result);
        let round = PingRound::new(
            2,
            1,
            Box::new(move |ping, fails| *out.lock() = Some((ping, fails))),
            Box::new(|_, _| panic!("ping should succeed")),
        );

        round.record(None);
        round.record(Some(Duration::from_millis(15)));
        assert_eq!(*result.lock(), Some((15, 1)));
    }
}
