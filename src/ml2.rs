//! Learned weather sensitivity ("ML2" track).
//!
//! Detects solar heating events (intervals where heating demand collapses
//! on cold days because of solar gain) and back-calculates the implied
//! per-entity solar coefficient. The supply-return delta is the detection
//! signal: normal heating runs a 2-3 °C delta, no heating under 0.5 °C.
//!
//! Also tracks an early-warning flag (sun hitting the outdoor sensor before
//! the indoor responds) and the building's thermal response lag.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use std::collections::VecDeque;

use crate::entity::{ThermalTiming, WeatherCoefficients};
use crate::sun;

// Detection thresholds.
const SUPPLY_RETURN_DELTA_THRESHOLD: f64 = 0.5;
const OUTDOOR_INDOOR_DIFF_THRESHOLD: f64 = 5.0;
const CLOUD_COVER_THRESHOLD: f64 = 3.0;
const SUN_ELEVATION_THRESHOLD: f64 = 10.0;
const MIN_EVENT_DURATION_MINUTES: f64 = 30.0;

// Sensor-based detection: the outdoor sensor in direct sun reads high.
const OUTDOOR_TEMP_RISE_THRESHOLD: f64 = 3.0;
const OUTDOOR_TEMP_ANOMALY_THRESHOLD: f64 = 4.0;

// Baseline: pre-sunrise readings, median over a short window.
const BASELINE_SUN_ELEVATION_MAX: f64 = 5.0;
const BASELINE_WINDOW: usize = 8;

// Learning schedule and blending.
const FIRST_UPDATE_EVENTS: u32 = 3;
const SECOND_UPDATE_EVENTS: u32 = 6;
const REGULAR_UPDATE_EVENTS: u32 = 12;
const NEW_COEFFICIENT_WEIGHT: f64 = 0.7;
const OLD_COEFFICIENT_WEIGHT: f64 = 0.3;

/// Effective cloud cover assumed when the sensor says sun but the forecast
/// grid says cloudy. Empirical; kept adjustable per deployment.
pub const SENSOR_OVERRIDE_CLOUD_OCTAS: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub supply_temp: f64,
    pub return_temp: f64,
    pub room_temp: f64,
    pub outdoor_temp: f64,
    pub cloud_cover: f64,
    pub wind_speed: f64,
    pub sun_elevation: f64,
}

impl Observation {
    fn supply_return_delta(&self) -> f64 {
        self.supply_temp - self.return_temp
    }
}

/// A finalized solar heating event.
#[derive(Debug, Clone)]
pub struct SolarEvent {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_minutes: f64,
    pub avg_supply_return_delta: f64,
    pub avg_outdoor_temp: f64,
    pub avg_indoor_temp: f64,
    pub avg_cloud_cover: f64,
    pub avg_sun_elevation: f64,
    pub avg_wind_speed: f64,
    pub implied_solar_coefficient: f64,
    pub observations_count: usize,
    pub peak_sun_elevation: f64,
    pub sensor_detected: bool,
}

#[derive(Debug, Clone)]
pub struct EarlyWarning {
    pub start: DateTime<Utc>,
    pub outdoor_rise: f64,
    pub estimated_lead_minutes: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct LagMeasurement {
    pub rising: bool,
    pub lag_minutes: f64,
    pub effective_temp_change: f64,
    pub indoor_temp_change: f64,
    pub confidence: f64,
}

/// Everything one tick can produce.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub solar_event: Option<SolarEvent>,
    pub early_warning: Option<EarlyWarning>,
    pub thermal_lag: Option<LagMeasurement>,
}

struct PendingTransition {
    rising: bool,
    start: DateTime<Utc>,
    indoor_at_start: f64,
    effective_change: f64,
}

pub struct WeatherLearner {
    latitude: f64,
    longitude: f64,
    pub coefficients: WeatherCoefficients,
    pub timing: ThermalTiming,

    buffer: VecDeque<Observation>,
    buffer_capacity: usize,

    baseline_samples: Vec<f64>,
    outdoor_baseline: Option<f64>,

    event_start: Option<DateTime<Utc>>,
    event_observations: Vec<Observation>,
    detected_events: Vec<SolarEvent>,

    // (timestamp, effective temp, indoor temp), 4 h at 15-min ticks.
    effective_history: Vec<(DateTime<Utc>, f64, f64)>,
    pending_transitions: Vec<PendingTransition>,

    early_warning_active: bool,
    early_warning_start: Option<DateTime<Utc>>,
}

impl WeatherLearner {
    pub fn new(
        latitude: f64,
        longitude: f64,
        coefficients: WeatherCoefficients,
        timing: ThermalTiming,
        buffer_hours: usize,
    ) -> WeatherLearner {
        let buffer_capacity = buffer_hours * 4;
        WeatherLearner {
            latitude,
            longitude,
            coefficients,
            timing,
            buffer: VecDeque::with_capacity(buffer_capacity),
            buffer_capacity,
            baseline_samples: Vec::new(),
            outdoor_baseline: None,
            event_start: None,
            event_observations: Vec::new(),
            detected_events: Vec::new(),
            effective_history: Vec::new(),
            pending_transitions: Vec::new(),
            early_warning_active: false,
            early_warning_start: None,
        }
    }

    /// Main entry: one observation per worker tick.
    pub fn process_observation(
        &mut self,
        timestamp: DateTime<Utc>,
        supply_temp: f64,
        return_temp: f64,
        room_temp: f64,
        outdoor_temp: f64,
        cloud_cover: f64,
        wind_speed: f64,
    ) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        let obs = Observation {
            timestamp,
            supply_temp,
            return_temp,
            room_temp,
            outdoor_temp,
            cloud_cover,
            wind_speed,
            sun_elevation: sun::solar_elevation(timestamp, self.latitude, self.longitude),
        };

        outcome.solar_event = self.add_observation(obs.clone());
        outcome.early_warning = self.check_early_warning(&obs);
        outcome.thermal_lag = self.track_thermal_lag(&obs);

        outcome
    }

    pub fn early_warning_active(&self) -> bool {
        self.early_warning_active
    }

    fn add_observation(&mut self, obs: Observation) -> Option<SolarEvent> {
        if self.buffer.len() == self.buffer_capacity && self.buffer_capacity > 0 {
            self.buffer.pop_front();
        }
        self.buffer.push_back(obs.clone());

        self.update_outdoor_baseline(&obs);

        if self.is_solar_condition(&obs) {
            if self.event_start.is_none() {
                self.event_start = Some(obs.timestamp);
                self.event_observations.clear();
            }
            self.event_observations.push(obs);
            None
        } else {
            let completed = self.finalize_event();
            if let Some(event) = &completed {
                self.detected_events.push(event.clone());
                self.coefficients.events_since_last_update += 1;
                self.coefficients.total_solar_events += 1;
            }
            completed
        }
    }

    /// Pre-sunrise readings form the "true" outdoor temperature without sun
    /// exposure: median of the last 8 low-sun samples.
    fn update_outdoor_baseline(&mut self, obs: &Observation) {
        if obs.sun_elevation >= BASELINE_SUN_ELEVATION_MAX {
            return;
        }
        self.baseline_samples.push(obs.outdoor_temp);
        if self.baseline_samples.len() > BASELINE_WINDOW {
            let drop = self.baseline_samples.len() - BASELINE_WINDOW;
            self.baseline_samples.drain(..drop);
        }
        if self.baseline_samples.len() >= 2 {
            let mut sorted = self.baseline_samples.clone();
            sorted.sort_by(|a, b| a.total_cmp(b));
            self.outdoor_baseline = Some(sorted[sorted.len() / 2]);
        }
    }

    fn sensor_solar_exposure(&self, obs: &Observation) -> bool {
        if let Some(baseline) = self.outdoor_baseline {
            if obs.outdoor_temp - baseline >= OUTDOOR_TEMP_ANOMALY_THRESHOLD {
                return true;
            }
        }

        // Rapid rise over the last 30 min: sun just hit the sensor.
        let recent: Vec<f64> = self
            .buffer
            .iter()
            .rev()
            .take(3)
            .skip(1)
            .map(|o| o.outdoor_temp)
            .collect();
        if let Some(min_prev) = recent.iter().copied().reduce(f64::min) {
            if obs.outdoor_temp - min_prev >= OUTDOOR_TEMP_RISE_THRESHOLD {
                return true;
            }
        }

        false
    }

    fn is_solar_condition(&self, obs: &Observation) -> bool {
        if obs.supply_return_delta() >= SUPPLY_RETURN_DELTA_THRESHOLD {
            return false;
        }

        // Cold enough that heating would normally run. Baseline beats the
        // possibly sun-heated sensor reading.
        let reference_outdoor = self.outdoor_baseline.unwrap_or(obs.outdoor_temp);
        if obs.room_temp - reference_outdoor < OUTDOOR_INDOOR_DIFF_THRESHOLD {
            return false;
        }

        if obs.sun_elevation <= SUN_ELEVATION_THRESHOLD {
            return false;
        }

        let clear_sky = obs.cloud_cover < CLOUD_COVER_THRESHOLD;
        clear_sky || self.sensor_solar_exposure(obs)
    }

    fn finalize_event(&mut self) -> Option<SolarEvent> {
        let started = self.event_start.take()?;
        let observations = std::mem::take(&mut self.event_observations);
        if observations.is_empty() {
            return None;
        }

        let duration_minutes = (observations.last().unwrap().timestamp
            - observations[0].timestamp)
            .num_seconds() as f64
            / 60.0;
        if duration_minutes < MIN_EVENT_DURATION_MINUTES {
            debug!("Solar candidate at {} too short ({:.0} min), discarded", started, duration_minutes);
            return None;
        }

        let n = observations.len() as f64;
        let avg_delta = observations.iter().map(|o| o.supply_return_delta()).sum::<f64>() / n;
        let avg_outdoor_sensor = observations.iter().map(|o| o.outdoor_temp).sum::<f64>() / n;
        let avg_indoor = observations.iter().map(|o| o.room_temp).sum::<f64>() / n;
        let avg_cloud = observations.iter().map(|o| o.cloud_cover).sum::<f64>() / n;
        let avg_sun = observations.iter().map(|o| o.sun_elevation).sum::<f64>() / n;
        let avg_wind = observations.iter().map(|o| o.wind_speed).sum::<f64>() / n;
        let peak_sun = observations
            .iter()
            .map(|o| o.sun_elevation)
            .fold(f64::MIN, f64::max);

        let avg_outdoor = self.outdoor_baseline.unwrap_or(avg_outdoor_sensor);

        let sensor_detected = self
            .outdoor_baseline
            .map(|b| avg_outdoor_sensor - b >= OUTDOOR_TEMP_ANOMALY_THRESHOLD)
            .unwrap_or(false);

        // Sensor saw sun while the grid said cloudy: trust the sensor.
        let effective_cloud = if sensor_detected && avg_cloud >= CLOUD_COVER_THRESHOLD {
            SENSOR_OVERRIDE_CLOUD_OCTAS
        } else {
            avg_cloud
        };

        let implied = self.implied_solar_coefficient(avg_indoor, avg_outdoor, effective_cloud, avg_sun, avg_wind);
        if implied <= 0.0 {
            debug!("Solar candidate at {} had unusable intensity, discarded", started);
            return None;
        }

        let event = SolarEvent {
            start: observations[0].timestamp,
            end: observations.last().unwrap().timestamp,
            duration_minutes,
            avg_supply_return_delta: avg_delta,
            avg_outdoor_temp: avg_outdoor,
            avg_indoor_temp: avg_indoor,
            avg_cloud_cover: avg_cloud,
            avg_sun_elevation: avg_sun,
            avg_wind_speed: avg_wind,
            implied_solar_coefficient: implied,
            observations_count: observations.len(),
            peak_sun_elevation: peak_sun,
            sensor_detected,
        };

        info!(
            "Solar event detected: {:.0} min, sun={:.1} deg, cloud={:.1}, implied_coeff={:.1}",
            duration_minutes, avg_sun, avg_cloud, implied
        );

        Some(event)
    }

    /// Back-calculate the solar coefficient. The sensor anomaly directly
    /// measures how much the sun warms that spot and is the reliable method
    /// at high latitudes; the physics fallback divides the full
    /// indoor-outdoor difference by the combined intensity.
    fn implied_solar_coefficient(
        &self,
        indoor: f64,
        outdoor: f64,
        cloud: f64,
        sun_elevation: f64,
        wind_speed: f64,
    ) -> f64 {
        if sun_elevation <= 0.0 {
            return 0.0;
        }
        let intensity = sun_elevation.to_radians().sin();
        let transmission = 1.0 - (cloud / 8.0) * 0.9;
        let combined = intensity * transmission;
        if combined < 0.1 {
            return 0.0;
        }

        if let Some(baseline) = self.outdoor_baseline {
            if let Some(latest) = self.buffer.back() {
                let anomaly = latest.outdoor_temp - baseline;
                if anomaly > 1.0 {
                    return (anomaly / combined).clamp(15.0, 80.0);
                }
            }
        }

        let wind_effect = self.coefficients.wind_coefficient_ml2 * wind_speed.max(0.0).sqrt();
        let solar_effect = indoor - outdoor + wind_effect;
        (solar_effect / combined).clamp(15.0, 60.0)
    }

    // ── Coefficient updates ──────────────────────────────────────────

    /// Update after 3 events, then 6 more, then every 12.
    pub fn should_update_coefficients(&self) -> bool {
        self.coefficients.events_since_last_update >= self.coefficients.next_update_at_events
    }

    /// Blend the median of recent implied values into the coefficient and
    /// recompute confidence. Returns the updated coefficients.
    pub fn update_coefficients(&mut self, now: DateTime<Utc>) -> WeatherCoefficients {
        let recent_count = self.coefficients.events_since_last_update as usize;
        if recent_count == 0 || self.detected_events.is_empty() {
            return self.coefficients.clone();
        }
        let start = self.detected_events.len().saturating_sub(recent_count);
        let mut implied: Vec<f64> = self.detected_events[start..]
            .iter()
            .map(|e| e.implied_solar_coefficient)
            .collect();
        implied.sort_by(|a, b| a.total_cmp(b));

        let new_coefficient = if implied.len() >= 3 {
            implied[implied.len() / 2]
        } else {
            implied.iter().sum::<f64>() / implied.len() as f64
        };

        let old_coefficient = self.coefficients.solar_coefficient_ml2;
        let blended = NEW_COEFFICIENT_WEIGHT * new_coefficient + OLD_COEFFICIENT_WEIGHT * old_coefficient;

        // Confidence: stability of the estimate blended with event-count
        // saturation (saturates by 20 events).
        let stability = 1.0 - ((new_coefficient - old_coefficient).abs() / 20.0).min(1.0);
        let event_confidence = (self.coefficients.total_solar_events as f64 / 20.0).min(1.0);
        let confidence = 0.5 * stability + 0.5 * event_confidence;

        self.coefficients.solar_coefficient_ml2 = (blended * 10.0).round() / 10.0;
        self.coefficients.solar_confidence_ml2 = (confidence * 100.0).round() / 100.0;
        self.coefficients.events_since_last_update = 0;
        self.coefficients.updated_at = Some(now.to_rfc3339());

        self.coefficients.next_update_at_events = match self.coefficients.next_update_at_events {
            FIRST_UPDATE_EVENTS => SECOND_UPDATE_EVENTS,
            SECOND_UPDATE_EVENTS => REGULAR_UPDATE_EVENTS,
            other => other,
        };

        info!(
            "Updated solar coefficient: {:.1} -> {:.1} (confidence {:.0}%)",
            old_coefficient,
            self.coefficients.solar_coefficient_ml2,
            self.coefficients.solar_confidence_ml2 * 100.0
        );

        self.coefficients.clone()
    }

    // ── Early warning ────────────────────────────────────────────────

    /// Sun hitting the outdoor sensor precedes the indoor response by the
    /// learned heat-up lag: flag it so the forecaster can reduce early.
    fn check_early_warning(&mut self, obs: &Observation) -> Option<EarlyWarning> {
        if obs.sun_elevation < BASELINE_SUN_ELEVATION_MAX {
            self.early_warning_active = false;
            self.early_warning_start = None;
            return None;
        }

        let baseline = self.outdoor_baseline?;
        let anomaly = obs.outdoor_temp - baseline;

        let rapid_rise = self
            .buffer
            .iter()
            .rev()
            .nth(1)
            .map(|prev| obs.outdoor_temp - prev.outdoor_temp >= 2.0)
            .unwrap_or(false);

        if anomaly >= 3.0 || rapid_rise {
            if !self.early_warning_active {
                self.early_warning_active = true;
                self.early_warning_start = Some(obs.timestamp);
                info!(
                    "Solar early warning: outdoor +{:.1} from baseline, ~{:.0} min before indoor effect",
                    anomaly, self.timing.heat_up_lag_minutes
                );
                return Some(EarlyWarning {
                    start: obs.timestamp,
                    outdoor_rise: anomaly,
                    estimated_lead_minutes: self.timing.heat_up_lag_minutes,
                    confidence: (anomaly / 5.0).min(1.0),
                });
            }
        } else if self.early_warning_active && anomaly < 2.0 {
            self.early_warning_active = false;
            self.early_warning_start = None;
        }

        None
    }

    // ── Thermal lag ──────────────────────────────────────────────────

    fn track_thermal_lag(&mut self, obs: &Observation) -> Option<LagMeasurement> {
        let effective = self.lag_effective_temp(obs);
        self.effective_history.push((obs.timestamp, effective, obs.room_temp));
        if self.effective_history.len() > 16 {
            let drop = self.effective_history.len() - 16;
            self.effective_history.drain(..drop);
        }
        if self.effective_history.len() < 8 {
            return None;
        }

        let two_hours_ago = self.effective_history[self.effective_history.len() - 8];
        let effective_change = effective - two_hours_ago.1;

        if effective_change.abs() >= 3.0 {
            let rising = effective_change > 0.0;
            let already_pending = self.pending_transitions.iter().any(|t| {
                t.rising == rising && (obs.timestamp - t.start) < Duration::hours(2)
            });
            if !already_pending {
                debug!(
                    "Thermal transition: {} ({:+.1} effective)",
                    if rising { "rising" } else { "falling" },
                    effective_change
                );
                self.pending_transitions.push(PendingTransition {
                    rising,
                    start: obs.timestamp,
                    indoor_at_start: two_hours_ago.2,
                    effective_change,
                });
            }
        }

        let mut completed = None;
        let mut remaining = Vec::new();
        let pending_transitions = std::mem::take(&mut self.pending_transitions);
        for transition in pending_transitions {
            let age_minutes = (obs.timestamp - transition.start).num_seconds() as f64 / 60.0;
            if age_minutes > 240.0 {
                continue;
            }

            let indoor_change = obs.room_temp - transition.indoor_at_start;
            let direction = if transition.rising { 1.0 } else { -1.0 };
            if indoor_change * direction >= 0.5 {
                let measurement = LagMeasurement {
                    rising: transition.rising,
                    lag_minutes: age_minutes,
                    effective_temp_change: transition.effective_change,
                    indoor_temp_change: indoor_change,
                    confidence: indoor_change.abs().min(1.0),
                };
                info!(
                    "Thermal lag measured: {} response in {:.0} min (indoor {:+.1})",
                    if transition.rising { "rising" } else { "falling" },
                    age_minutes,
                    indoor_change
                );
                self.apply_lag_measurement(&measurement, obs.timestamp);
                completed = Some(measurement);
            } else {
                remaining.push(transition);
            }
        }
        self.pending_transitions = remaining;

        completed
    }

    /// Simplified effective temperature for lag tracking. The learned solar
    /// coefficient is in sensor-anomaly units, an order of magnitude above
    /// the model coefficient, so it is scaled down here.
    fn lag_effective_temp(&self, obs: &Observation) -> f64 {
        let wind_effect = -self.coefficients.wind_coefficient_ml2 * obs.wind_speed.max(0.0).sqrt();
        let solar_effect = if obs.sun_elevation > 0.0 {
            let intensity = obs.sun_elevation.to_radians().sin();
            let transmission = 1.0 - (obs.cloud_cover / 8.0) * 0.9;
            self.coefficients.solar_coefficient_ml2 * intensity * transmission / 10.0
        } else {
            0.0
        };
        obs.outdoor_temp + wind_effect + solar_effect
    }

    fn apply_lag_measurement(&mut self, measurement: &LagMeasurement, now: DateTime<Utc>) {
        let weight = 0.3 * measurement.confidence;
        if measurement.rising {
            let blended = (1.0 - weight) * self.timing.heat_up_lag_minutes + weight * measurement.lag_minutes;
            self.timing.heat_up_lag_minutes = (blended * 10.0).round() / 10.0;
        } else {
            let blended =
                (1.0 - weight) * self.timing.cool_down_lag_minutes + weight * measurement.lag_minutes;
            self.timing.cool_down_lag_minutes = (blended * 10.0).round() / 10.0;
        }
        self.timing.total_transitions += 1;
        self.timing.confidence = (self.timing.total_transitions as f64 / 10.0).min(1.0);
        self.timing.updated_at = Some(now.to_rfc3339());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const LAT: f64 = 58.41;
    const LON: f64 = 15.62;

    fn learner() -> WeatherLearner {
        WeatherLearner::new(
            LAT,
            LON,
            WeatherCoefficients::default(),
            ThermalTiming::default(),
            24,
        )
    }

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        // Late March: sun well above 10 deg mid-morning at this latitude.
        Utc.with_ymd_and_hms(2026, 3, 25, hour, minute, 0).unwrap()
    }

    /// Pre-dawn observations to seed the outdoor baseline.
    fn seed_baseline(learner: &mut WeatherLearner, outdoor: f64) {
        for i in 0..8u32 {
            learner.process_observation(
                ts(2, (i % 4) * 15) + Duration::minutes((i / 4) as i64 * 60),
                35.0,
                32.5,
                22.0,
                outdoor,
                1.0,
                2.0,
            );
        }
    }

    #[test]
    fn clear_morning_event_lifecycle() {
        let mut learner = learner();
        seed_baseline(&mut learner, -5.0);

        // Four satisfying 15-min observations (09:00-09:45), then heating
        // resumes at 10:00 and closes the event.
        let mut events = Vec::new();
        for minute in [0u32, 15, 30, 45] {
            let outcome =
                learner.process_observation(ts(9, minute), 30.0, 29.7, 22.0, -5.0, 1.0, 2.0);
            if let Some(event) = outcome.solar_event {
                events.push(event);
            }
        }
        let closing = learner.process_observation(ts(10, 0), 33.0, 30.5, 22.0, -5.0, 1.0, 2.0);
        if let Some(event) = closing.solar_event {
            events.push(event);
        }

        assert_eq!(events.len(), 1, "exactly one event for one sunny stretch");
        let event = &events[0];
        assert!((event.duration_minutes - 45.0).abs() < 1e-9);
        assert_eq!(event.observations_count, 4);
        assert!(
            event.implied_solar_coefficient >= 15.0 && event.implied_solar_coefficient <= 80.0,
            "implied {} out of range",
            event.implied_solar_coefficient
        );
        assert_eq!(learner.coefficients.total_solar_events, 1);
        assert_eq!(learner.coefficients.events_since_last_update, 1);
    }

    #[test]
    fn short_event_is_discarded() {
        let mut learner = learner();
        seed_baseline(&mut learner, -5.0);

        // Two observations = 15 min, below the 30 min floor.
        learner.process_observation(ts(9, 0), 30.0, 29.7, 22.0, -5.0, 1.0, 2.0);
        learner.process_observation(ts(9, 15), 30.0, 29.7, 22.0, -5.0, 1.0, 2.0);
        let closing = learner.process_observation(ts(9, 30), 33.0, 30.5, 22.0, -5.0, 1.0, 2.0);

        assert!(closing.solar_event.is_none());
        assert_eq!(learner.coefficients.total_solar_events, 0);
    }

    #[test]
    fn warm_weather_never_opens_an_event() {
        let mut learner = learner();
        seed_baseline(&mut learner, 19.0);

        // Indoor-baseline difference of 3 deg is not heating weather.
        for minute in [0u32, 15, 30, 45] {
            learner.process_observation(ts(9, minute), 30.0, 29.7, 22.0, 19.0, 1.0, 2.0);
        }
        assert!(learner.event_start.is_none());
    }

    #[test]
    fn sensor_anomaly_overrides_cloudy_forecast() {
        let mut learner = learner();
        seed_baseline(&mut learner, -5.0);

        // Grid says overcast (6 octas), but the sensor reads 5 degrees above
        // baseline: sensor path keeps the event alive.
        for minute in [0u32, 15, 30, 45] {
            learner.process_observation(ts(9, minute), 30.0, 29.7, 22.0, 0.0, 6.0, 2.0);
        }
        let closing = learner.process_observation(ts(10, 0), 33.0, 30.5, 22.0, 0.0, 6.0, 2.0);

        let event = closing.solar_event.expect("sensor-detected event");
        assert!(event.sensor_detected);
        // Implied uses the anomaly/intensity path with the 1.5-octa override.
        assert!(event.implied_solar_coefficient >= 15.0 && event.implied_solar_coefficient <= 80.0);
    }

    #[test]
    fn update_schedule_walks_3_6_12() {
        let mut learner = learner();
        assert_eq!(learner.coefficients.next_update_at_events, 3);

        for i in 0..3 {
            learner.detected_events.push(fabricated_event(40.0 + i as f64 * 10.0));
            learner.coefficients.events_since_last_update += 1;
            learner.coefficients.total_solar_events += 1;
        }
        assert!(learner.should_update_coefficients());
        let updated = learner.update_coefficients(ts(12, 0));

        // Median of {40,50,60} blended 0.7/0.3 with the default 6.0.
        assert!((updated.solar_coefficient_ml2 - (0.7 * 50.0 + 0.3 * 6.0)).abs() < 0.11);
        assert_eq!(updated.events_since_last_update, 0);
        assert_eq!(updated.next_update_at_events, 6);
        assert!(updated.updated_at.is_some());

        learner.coefficients.events_since_last_update = 6;
        for _ in 0..6 {
            learner.detected_events.push(fabricated_event(45.0));
            learner.coefficients.total_solar_events += 1;
        }
        let updated = learner.update_coefficients(ts(13, 0));
        assert_eq!(updated.next_update_at_events, 12);

        learner.coefficients.events_since_last_update = 12;
        for _ in 0..12 {
            learner.detected_events.push(fabricated_event(45.0));
            learner.coefficients.total_solar_events += 1;
        }
        let updated = learner.update_coefficients(ts(14, 0));
        assert_eq!(updated.next_update_at_events, 12, "schedule stays at 12");
    }

    #[test]
    fn early_warning_sets_and_clears() {
        let mut learner = learner();
        seed_baseline(&mut learner, -5.0);

        // Outdoor jumps 4 degrees above baseline mid-morning. Heating still
        // running (delta 2.5) so no event interferes.
        let outcome = learner.process_observation(ts(9, 0), 35.0, 32.5, 22.0, -1.0, 1.0, 2.0);
        let warning = outcome.early_warning.expect("warning raised");
        assert!((warning.outdoor_rise - 4.0).abs() < 1e-9);
        assert!((warning.confidence - 0.8).abs() < 1e-9);
        assert!(learner.early_warning_active());

        // Anomaly subsides below 2: cleared.
        learner.process_observation(ts(9, 15), 35.0, 32.5, 22.0, -4.0, 1.0, 2.0);
        assert!(!learner.early_warning_active());
    }

    #[test]
    fn thermal_lag_measured_on_indoor_response() {
        let mut learner = learner();

        // Night ticks: effective temp == outdoor (no wind, no sun).
        let base = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        for i in 0..8 {
            learner.process_observation(
                base + Duration::minutes(15 * i),
                35.0,
                32.5,
                21.0,
                -5.0,
                8.0,
                0.0,
            );
        }
        // Effective temp jumps 3.5 degrees: rising transition pending.
        let t8 = base + Duration::minutes(120);
        let outcome = learner.process_observation(t8, 35.0, 32.5, 21.0, -1.5, 8.0, 0.0);
        assert!(outcome.thermal_lag.is_none());
        assert_eq!(learner.pending_transitions.len(), 1);

        // Indoor responds +0.6 one tick later: lag resolved at 15 min.
        let t9 = base + Duration::minutes(135);
        let outcome = learner.process_observation(t9, 35.0, 32.5, 21.6, -1.5, 8.0, 0.0);
        let lag = outcome.thermal_lag.expect("lag measured");
        assert!(lag.rising);
        assert!((lag.lag_minutes - 15.0).abs() < 1e-9);
        assert!((lag.confidence - 0.6).abs() < 1e-9);

        // Heat-up lag blended from the 60 min default with weight 0.18.
        let expected = 0.82 * 60.0 + 0.18 * 15.0;
        assert!((learner.timing.heat_up_lag_minutes - expected).abs() < 0.11);
        assert_eq!(learner.timing.total_transitions, 1);
    }

    fn fabricated_event(implied: f64) -> SolarEvent {
        SolarEvent {
            start: ts(9, 0),
            end: ts(10, 0),
            duration_minutes: 60.0,
            avg_supply_return_delta: 0.2,
            avg_outdoor_temp: -5.0,
            avg_indoor_temp: 22.0,
            avg_cloud_cover: 1.0,
            avg_sun_elevation: 25.0,
            avg_wind_speed: 2.0,
            implied_solar_coefficient: implied,
            observations_count: 4,
            peak_sun_elevation: 28.0,
            sensor_detected: false,
        }
    }
}
