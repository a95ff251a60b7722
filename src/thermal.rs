//! Thermal coefficient learning.
//!
//! The coefficient captures how fast the indoor temperature drifts toward
//! outdoor conditions when the heating is not actively adding energy,
//! in degC indoor per hour per degC of indoor-outdoor difference. Learned
//! from the rolling observation history and persisted to the entity record
//! so forecasting survives restarts.

use chrono::{DateTime, Duration, Utc};
use log::debug;

/// 7 days at 15-minute ticks.
const MAX_SAMPLES: usize = 672;
const MIN_PAIRS: usize = 5;
/// Coefficients beyond this are sensor glitches, not building physics.
const MAX_PLAUSIBLE_COEFFICIENT: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct ThermalSample {
    pub timestamp: DateTime<Utc>,
    pub room_temp: f64,
    pub outdoor_temp: f64,
    pub heating_active: bool,
}

#[derive(Debug, Clone)]
pub struct ThermalCoefficient {
    pub coefficient: f64,
    pub confidence: f64,
    pub pairs_used: usize,
    pub samples: usize,
}

#[derive(Debug, Default)]
pub struct ThermalAnalyzer {
    history: Vec<ThermalSample>,
}

impl ThermalAnalyzer {
    pub fn new() -> ThermalAnalyzer {
        ThermalAnalyzer::default()
    }

    /// Reseed from persisted history (oldest first) after a restart.
    pub fn seed(&mut self, samples: Vec<ThermalSample>) {
        self.history = samples;
        self.trim();
        debug!("Thermal analyzer seeded with {} sample(s)", self.history.len());
    }

    pub fn add_sample(&mut self, sample: ThermalSample) {
        self.history.push(sample);
        self.trim();
    }

    fn trim(&mut self) {
        if self.history.len() > MAX_SAMPLES {
            let drop = self.history.len() - MAX_SAMPLES;
            self.history.drain(..drop);
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Estimate the coefficient from passive-drift intervals: consecutive
    /// samples no more than two hours apart, heating off, and a meaningful
    /// indoor-outdoor difference.
    pub fn coefficient(&self) -> Option<ThermalCoefficient> {
        if self.history.len() < 2 {
            return None;
        }

        let avg_indoor =
            self.history.iter().map(|s| s.room_temp).sum::<f64>() / self.history.len() as f64;

        let mut coefficients = Vec::new();
        for pair in self.history.windows(2) {
            let elapsed = pair[1].timestamp - pair[0].timestamp;
            if elapsed <= Duration::zero() || elapsed > Duration::hours(2) {
                continue;
            }
            if pair[0].heating_active || pair[1].heating_active {
                continue;
            }

            let hours = elapsed.num_seconds() as f64 / 3600.0;
            let indoor_delta = pair[1].room_temp - pair[0].room_temp;
            let outdoor_diff = (pair[0].outdoor_temp + pair[1].outdoor_temp) / 2.0 - avg_indoor;
            if outdoor_diff.abs() <= 2.0 {
                continue;
            }

            let coefficient = indoor_delta / (hours * outdoor_diff);
            if coefficient.abs() < MAX_PLAUSIBLE_COEFFICIENT {
                coefficients.push(coefficient);
            }
        }

        if coefficients.len() < MIN_PAIRS {
            debug!("Thermal coefficient: only {} usable pair(s)", coefficients.len());
            return None;
        }

        let mean = coefficients.iter().sum::<f64>() / coefficients.len() as f64;
        let variance = coefficients.iter().map(|c| (c - mean).powi(2)).sum::<f64>()
            / coefficients.len() as f64;
        let stddev = variance.sqrt();

        // Sample-count term saturates at 50 pairs; spread term shrinks it
        // when the estimates disagree.
        let count_confidence = (coefficients.len() as f64 / 50.0).min(1.0);
        let spread_confidence = if mean.abs() > 1e-9 {
            (1.0 - (stddev / mean.abs()).min(1.0)).max(0.1)
        } else {
            0.1
        };

        Some(ThermalCoefficient {
            coefficient: mean,
            confidence: count_confidence * spread_confidence,
            pairs_used: coefficients.len(),
            samples: self.history.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(minute: i64, room: f64, outdoor: f64, heating: bool) -> ThermalSample {
        ThermalSample {
            timestamp: Utc.with_ymd_and_hms(2026, 1, 12, 0, 0, 0).unwrap() + Duration::minutes(minute),
            room_temp: room,
            outdoor_temp: outdoor,
            heating_active: heating,
        }
    }

    #[test]
    fn steady_cooling_yields_positive_coefficient() {
        // Heating off, outdoor -10, indoor dropping 0.05 per 15-min tick:
        // each pair gives indoor_delta / (0.25h * (outdoor - avg_indoor)).
        let mut analyzer = ThermalAnalyzer::new();
        for i in 0..12 {
            analyzer.add_sample(sample(i * 15, 21.0 - 0.05 * i as f64, -10.0, false));
        }

        let result = analyzer.coefficient().expect("enough pairs");
        // Cooling toward a colder outdoor: negative delta over negative
        // difference, so the coefficient comes out positive.
        assert!(result.coefficient > 0.0);
        assert!(result.coefficient < MAX_PLAUSIBLE_COEFFICIENT);
        assert_eq!(result.pairs_used, 11);
        assert!(result.confidence > 0.0 && result.confidence <= 1.0);
    }

    #[test]
    fn heating_intervals_are_excluded() {
        let mut analyzer = ThermalAnalyzer::new();
        for i in 0..12 {
            analyzer.add_sample(sample(i * 15, 21.0, -10.0, true));
        }
        assert!(analyzer.coefficient().is_none());
    }

    #[test]
    fn mild_weather_gives_no_signal() {
        // Indoor-outdoor difference under 2 degrees carries no information.
        let mut analyzer = ThermalAnalyzer::new();
        for i in 0..12 {
            analyzer.add_sample(sample(i * 15, 21.0, 20.0, false));
        }
        assert!(analyzer.coefficient().is_none());
    }

    #[test]
    fn long_gaps_between_samples_are_skipped() {
        let mut analyzer = ThermalAnalyzer::new();
        for i in 0..12 {
            // 3 hours apart: every pair exceeds the 2-hour window.
            analyzer.add_sample(sample(i * 180, 21.0 - 0.1 * i as f64, -10.0, false));
        }
        assert!(analyzer.coefficient().is_none());
    }

    #[test]
    fn history_is_bounded() {
        let mut analyzer = ThermalAnalyzer::new();
        for i in 0..(MAX_SAMPLES as i64 + 100) {
            analyzer.add_sample(sample(i * 15, 21.0, -5.0, false));
        }
        assert_eq!(analyzer.len(), MAX_SAMPLES);
    }

    #[test]
    fn seeding_replaces_history() {
        let mut analyzer = ThermalAnalyzer::new();
        analyzer.add_sample(sample(0, 21.0, -5.0, false));
        analyzer.seed(vec![sample(0, 20.0, -5.0, false), sample(15, 20.1, -5.0, false)]);
        assert_eq!(analyzer.len(), 2);
    }
}
