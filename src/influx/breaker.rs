//! Write-side protection: a per-writer circuit breaker and a
//! per-measurement throttle against abnormal-restart write storms.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// What the writer should do with the next write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Circuit closed, write normally.
    Proceed,
    /// Circuit open and cooling down: skip without touching the network.
    Skip,
    /// Cooldown elapsed: run a health check before writing (half-open).
    Probe,
}

/// Consecutive-failure circuit breaker. Three failures open the circuit;
/// after the cooldown a health probe decides whether it closes again.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    open_since: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker {
            threshold: threshold.max(1),
            cooldown,
            consecutive_failures: 0,
            open_since: None,
        }
    }

    pub fn check(&mut self) -> BreakerDecision {
        if self.consecutive_failures < self.threshold {
            return BreakerDecision::Proceed;
        }
        let open_since = *self.open_since.get_or_insert_with(Instant::now);
        if open_since.elapsed() < self.cooldown {
            BreakerDecision::Skip
        } else {
            BreakerDecision::Probe
        }
    }

    /// Returns true when this success ends a failure streak ("restored").
    pub fn record_success(&mut self) -> bool {
        let was_failing = self.consecutive_failures > 0;
        self.consecutive_failures = 0;
        self.open_since = None;
        was_failing
    }

    /// Returns true when this failure opens the circuit.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures == self.threshold {
            self.open_since = Some(Instant::now());
            true
        } else {
            false
        }
    }

    /// Failed probe: restart the cooldown window.
    pub fn reopen(&mut self) {
        self.open_since = Some(Instant::now());
    }

    /// Passed probe: close the circuit. Returns the failure count that was
    /// cleared so the caller can report it.
    pub fn close(&mut self) -> u32 {
        let failures = self.consecutive_failures;
        self.consecutive_failures = 0;
        self.open_since = None;
        failures
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Minimum inter-write intervals per (measurement, entity). First write
/// after process start is always allowed.
#[derive(Debug, Default)]
pub struct WriteThrottle {
    last_writes: HashMap<(String, String), Instant>,
}

impl WriteThrottle {
    pub fn new() -> WriteThrottle {
        WriteThrottle::default()
    }

    /// Returns true (and records the write) if `min_interval` has elapsed
    /// since the last allowed write for this key.
    pub fn allow(&mut self, measurement: &str, entity_id: &str, min_interval: Duration) -> bool {
        let key = (measurement.to_string(), entity_id.to_string());
        if let Some(last) = self.last_writes.get(&key) {
            if last.elapsed() < min_interval {
                return false;
            }
        }
        self.last_writes.insert(key, Instant::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_closed_below_threshold() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert_eq!(breaker.check(), BreakerDecision::Proceed);
    }

    #[test]
    fn opens_on_third_failure_and_skips() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.record_failure(), "third failure opens the circuit");
        assert_eq!(breaker.check(), BreakerDecision::Skip);
    }

    #[test]
    fn probes_after_cooldown_then_closes_or_reopens() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_millis(0));
        for _ in 0..3 {
            breaker.record_failure();
        }
        // Zero cooldown: immediately in the probe state.
        assert_eq!(breaker.check(), BreakerDecision::Probe);

        breaker.reopen();
        assert_eq!(breaker.check(), BreakerDecision::Probe);

        let cleared = breaker.close();
        assert_eq!(cleared, 3);
        assert_eq!(breaker.check(), BreakerDecision::Proceed);
    }

    #[test]
    fn success_after_failures_reports_restored() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        assert!(breaker.record_success());
        assert!(!breaker.record_success());
    }

    #[test]
    fn throttle_allows_first_write_only() {
        let mut throttle = WriteThrottle::new();
        assert!(throttle.allow("k_calibration_history", "villa", Duration::from_secs(3600)));
        assert!(!throttle.allow("k_calibration_history", "villa", Duration::from_secs(3600)));
        // A different entity is unaffected.
        assert!(throttle.allow("k_calibration_history", "kontor", Duration::from_secs(3600)));
    }

    #[test]
    fn throttle_allows_after_interval() {
        let mut throttle = WriteThrottle::new();
        assert!(throttle.allow("m", "e", Duration::from_millis(0)));
        assert!(throttle.allow("m", "e", Duration::from_millis(0)));
    }
}
