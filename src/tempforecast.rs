//! Indoor temperature forecaster: physics plus historical correction.
//!
//! The thermostat dominates indoor behavior, so the physics step predicts
//! how fast the temperature moves toward the setpoint while a learned
//! per-hour bias corrects the systematic errors the physics cannot see.
//! The bias only gets applied once enough samples have accumulated, and
//! is weighted by the thermal-coefficient confidence.

use chrono::{DateTime, Timelike, Utc};
use log::{debug, info};
use std::collections::BTreeMap;

use crate::entity::Learned;
use crate::weather::ForecastPoint;

/// Thermal response rates in degC/h for a typical villa.
const HEATING_RATE: f64 = 0.5;
const COOLING_RATE: f64 = 0.2;
/// Simplified heat-loss pressure per degree of indoor-outdoor difference.
const HEAT_LOSS_FACTOR: f64 = 0.02;

const MIN_ACCURACY_SAMPLES: usize = 10;
const MIN_SAMPLES_PER_HOUR: usize = 3;
const NEW_BIAS_WEIGHT: f64 = 0.8;
const BIAS_SIGNIFICANCE: f64 = 0.05;
const ACCURACY_BUFFER_CAP: usize = 1000;

#[derive(Debug, Clone)]
pub struct IndoorForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub lead_time_hours: f64,
}

#[derive(Debug, Clone)]
struct AccuracyRecord {
    hour: u32,
    error: f64,
}

#[derive(Debug, Default)]
pub struct IndoorForecaster {
    accuracy_buffer: Vec<AccuracyRecord>,
}

impl IndoorForecaster {
    pub fn new() -> IndoorForecaster {
        IndoorForecaster::default()
    }

    /// Chain hourly indoor predictions across the weather forecast; each
    /// hour starts from the previous prediction.
    pub fn generate(
        &self,
        learned: &Learned,
        current_indoor: f64,
        weather_forecast: &[ForecastPoint],
        target_temp: f64,
        acceptable_deviation: f64,
    ) -> Vec<IndoorForecastPoint> {
        let mut predicted = current_indoor;
        let mut points = Vec::with_capacity(weather_forecast.len());

        for wp in weather_forecast {
            predicted = self.predict_one(
                learned,
                predicted,
                wp.temperature,
                wp.time,
                target_temp,
                acceptable_deviation,
            );
            points.push(IndoorForecastPoint {
                timestamp: wp.time,
                value: (predicted * 100.0).round() / 100.0,
                lead_time_hours: wp.lead_time_hours,
            });
        }

        if let (Some(first), Some(last)) = (points.first(), points.last()) {
            debug!(
                "Indoor forecast: {:.1} -> {:.1} over {} hour(s)",
                first.value,
                last.value,
                points.len()
            );
        }

        points
    }

    fn predict_one(
        &self,
        learned: &Learned,
        current_indoor: f64,
        outdoor_temp: f64,
        forecast_time: DateTime<Utc>,
        target_temp: f64,
        acceptable_deviation: f64,
    ) -> f64 {
        let physics = physics_step(current_indoor, outdoor_temp, target_temp, acceptable_deviation);

        // Historical correction, weighted by confidence. No correction at
        // all during the initial learning window.
        let hour_key = format!("{:02}", forecast_time.hour());
        let hourly_bias = learned.hourly_bias.get(&hour_key).copied().unwrap_or(0.0);
        let confidence = learned.thermal_coefficient_confidence;
        let effective_confidence = if learned.total_samples < 24 {
            0.0
        } else if confidence < 0.5 {
            confidence * 0.5
        } else {
            confidence
        };

        let adjusted = physics + hourly_bias * effective_confidence;

        // The thermostat keeps reality inside a narrow band; so should the
        // prediction.
        let min_temp = target_temp - acceptable_deviation - 1.0;
        let max_temp = target_temp + acceptable_deviation + 0.5;
        adjusted.clamp(min_temp, max_temp)
    }

    /// Compare a resolved prediction against the measured value.
    pub fn record_accuracy(&mut self, predicted: f64, actual: f64, hour: u32) -> f64 {
        let error = actual - predicted;
        self.accuracy_buffer.push(AccuracyRecord { hour, error });
        if self.accuracy_buffer.len() > ACCURACY_BUFFER_CAP {
            let drop = self.accuracy_buffer.len() - ACCURACY_BUFFER_CAP / 2;
            self.accuracy_buffer.drain(..drop);
        }
        error
    }

    /// Fold buffered errors into the per-hour bias table. Hours need at
    /// least three samples; new estimates blend 80/20 with the old bias and
    /// insignificant corrections are dropped. Clears the buffer.
    pub fn update_hourly_bias(&mut self, learned: &mut Learned, now: DateTime<Utc>) -> usize {
        if self.accuracy_buffer.len() < MIN_ACCURACY_SAMPLES {
            debug!("Not enough accuracy data to update hourly bias");
            return 0;
        }

        let mut by_hour: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
        for record in &self.accuracy_buffer {
            by_hour.entry(record.hour).or_default().push(record.error);
        }

        let mut updated = 0;
        for (hour, errors) in by_hour {
            if errors.len() < MIN_SAMPLES_PER_HOUR {
                continue;
            }
            let mean_error = errors.iter().sum::<f64>() / errors.len() as f64;
            let hour_key = format!("{:02}", hour);
            let old_bias = learned.hourly_bias.get(&hour_key).copied().unwrap_or(0.0);
            let blended = NEW_BIAS_WEIGHT * mean_error + (1.0 - NEW_BIAS_WEIGHT) * old_bias;

            if blended.abs() > BIAS_SIGNIFICANCE {
                learned
                    .hourly_bias
                    .insert(hour_key, (blended * 1000.0).round() / 1000.0);
                updated += 1;
            } else {
                learned.hourly_bias.remove(&hour_key);
            }
        }

        learned.updated_at = Some(now.to_rfc3339());
        self.accuracy_buffer.clear();

        if updated > 0 {
            info!("Updated hourly bias for {} hour(s)", updated);
        }
        updated
    }

    pub fn buffered_samples(&self) -> usize {
        self.accuracy_buffer.len()
    }
}

/// Thermostat-aware physics step for one hour.
fn physics_step(
    current_indoor: f64,
    outdoor_temp: f64,
    target_temp: f64,
    acceptable_deviation: f64,
) -> f64 {
    let heat_loss_pressure = (current_indoor - outdoor_temp) * HEAT_LOSS_FACTOR;

    if current_indoor < target_temp - acceptable_deviation {
        // Well below target: heating strongly active, always some progress.
        let rise = (HEATING_RATE - heat_loss_pressure).max(0.1);
        (current_indoor + rise).min(target_temp)
    } else if current_indoor < target_temp {
        // Approaching target: heating modulating.
        let gap = target_temp - current_indoor;
        current_indoor + (HEATING_RATE * 0.5).min(gap)
    } else if current_indoor <= target_temp + acceptable_deviation {
        // At target: thermostat cycling; slight drift only in hard cold.
        let drift = if outdoor_temp < current_indoor - 10.0 { -0.1 } else { 0.0 };
        (current_indoor + drift).max(target_temp - acceptable_deviation * 0.5)
    } else {
        // Above target: heating off, cooling toward the setpoint.
        let cooling = COOLING_RATE + heat_loss_pressure * 0.5;
        (current_indoor - cooling).max(target_temp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn wp(hour_offset: i64, temp: f64) -> ForecastPoint {
        ForecastPoint {
            time: Utc.with_ymd_and_hms(2026, 1, 12, 6, 0, 0).unwrap()
                + chrono::Duration::hours(hour_offset),
            temperature: temp,
            lead_time_hours: hour_offset as f64,
            cloud_cover: None,
            wind_speed: None,
            humidity: None,
        }
    }

    #[test]
    fn cold_start_rises_toward_target_without_overshoot() {
        let forecaster = IndoorForecaster::new();
        let learned = Learned::default();
        let weather: Vec<ForecastPoint> = (0..8).map(|h| wp(h, -5.0)).collect();

        let points = forecaster.generate(&learned, 19.0, &weather, 22.0, 1.0);
        assert_eq!(points.len(), 8);
        // Monotonically rising, never past the setpoint.
        for pair in points.windows(2) {
            assert!(pair[1].value >= pair[0].value - 1e-9);
        }
        assert!(points.last().unwrap().value <= 22.0 + 1e-9);
    }

    #[test]
    fn overheated_room_cools_back_to_setpoint() {
        let forecaster = IndoorForecaster::new();
        let learned = Learned::default();
        let weather: Vec<ForecastPoint> = (0..8).map(|h| wp(h, 0.0)).collect();

        let points = forecaster.generate(&learned, 24.5, &weather, 22.0, 1.0);
        assert!(points.last().unwrap().value >= 22.0 - 1e-9);
        assert!(points.last().unwrap().value < 24.5);
    }

    #[test]
    fn bias_not_applied_during_learning_phase() {
        let forecaster = IndoorForecaster::new();
        let mut learned = Learned::default();
        learned.hourly_bias.insert("06".to_string(), 0.5);
        learned.thermal_coefficient_confidence = 0.9;
        learned.total_samples = 10; // Below the 24-sample floor.

        let with_bias = forecaster.generate(&learned, 22.0, &[wp(0, 0.0)], 22.0, 1.0);

        let mut no_bias = learned.clone();
        no_bias.hourly_bias.clear();
        let without = forecaster.generate(&no_bias, 22.0, &[wp(0, 0.0)], 22.0, 1.0);

        assert_eq!(with_bias[0].value, without[0].value);
    }

    #[test]
    fn confident_bias_shifts_prediction() {
        let forecaster = IndoorForecaster::new();
        let mut learned = Learned::default();
        learned.hourly_bias.insert("06".to_string(), 0.4);
        learned.thermal_coefficient_confidence = 1.0;
        learned.total_samples = 100;

        let points = forecaster.generate(&learned, 22.0, &[wp(0, 0.0)], 22.0, 1.0);
        let mut no_bias = learned.clone();
        no_bias.hourly_bias.clear();
        let baseline = forecaster.generate(&no_bias, 22.0, &[wp(0, 0.0)], 22.0, 1.0);

        assert!((points[0].value - baseline[0].value - 0.4).abs() < 1e-9);
    }

    #[test]
    fn hourly_bias_update_needs_three_samples_per_hour() {
        let mut forecaster = IndoorForecaster::new();
        let mut learned = Learned::default();

        // Hour 8 gets enough samples with a consistent +0.3 error; hour 9
        // only two.
        for _ in 0..8 {
            forecaster.record_accuracy(21.7, 22.0, 8);
        }
        forecaster.record_accuracy(22.0, 22.1, 9);
        forecaster.record_accuracy(22.0, 22.1, 9);

        let now = Utc.with_ymd_and_hms(2026, 1, 12, 12, 0, 0).unwrap();
        let updated = forecaster.update_hourly_bias(&mut learned, now);
        assert_eq!(updated, 1);
        // 0.8 * 0.3 + 0.2 * 0 = 0.24
        assert!((learned.hourly_bias["08"] - 0.24).abs() < 1e-6);
        assert!(!learned.hourly_bias.contains_key("09"));
        assert_eq!(forecaster.buffered_samples(), 0);
    }

    #[test]
    fn insignificant_bias_is_dropped() {
        let mut forecaster = IndoorForecaster::new();
        let mut learned = Learned::default();
        learned.hourly_bias.insert("08".to_string(), 0.05);

        for _ in 0..12 {
            forecaster.record_accuracy(22.0, 22.01, 8);
        }
        let now = Utc.with_ymd_and_hms(2026, 1, 12, 12, 0, 0).unwrap();
        forecaster.update_hourly_bias(&mut learned, now);
        assert!(!learned.hourly_bias.contains_key("08"));
    }

    #[test]
    fn sample_schedule_backs_off() {
        let mut learned = Learned::default();
        let mut updates = Vec::new();
        for i in 1..=200u32 {
            if learned.record_sample() {
                updates.push(i);
            }
        }
        // 24, then +48, then every +96.
        assert_eq!(updates, vec![24, 72, 168]);
        assert_eq!(learned.next_update_at_samples, 96);
    }
}
