//! Hourly heating-energy forecast from a calibrated heat-loss coefficient.
//!
//!     heating_power = k * (T_indoor - T_effective_outdoor)
//!     heating_energy = heating_power * 1 h
//!
//! Typical calibrated k for a single-family house is 0.05-0.15 kW/degC;
//! k = 0.0685 at indoor 22 and effective -5 gives 1.85 kW, ~44 kWh/day.

use chrono::{DateTime, Utc};

use crate::energy_model::{WeatherModel, WeatherSample};
use crate::entity::EntityConfig;
use crate::weather::ForecastPoint;

#[derive(Debug, Clone)]
pub struct EnergyForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub outdoor_temp: f64,
    pub effective_temp: f64,
    pub wind_effect: f64,
    pub solar_effect: f64,
    pub humidity_effect: f64,
    pub heating_power_kw: f64,
    pub heating_energy_kwh: f64,
    pub lead_time_hours: f64,
}

#[derive(Debug, Clone)]
pub struct ForecastSummary {
    pub total_energy_kwh: f64,
    pub avg_power_kw: f64,
    pub peak_power_kw: f64,
    pub avg_outdoor_temp: f64,
    pub min_outdoor_temp: f64,
    pub hours: usize,
}

pub struct EnergyForecaster {
    pub heat_loss_k: f64,
    pub target_indoor_temp: f64,
    latitude: f64,
    longitude: f64,
    model: WeatherModel,
}

impl EnergyForecaster {
    /// Build from an entity record. The learned ML2 coefficients replace the
    /// model defaults once their confidence reaches 0.3.
    pub fn from_entity(
        entity: &EntityConfig,
        latitude: f64,
        longitude: f64,
        target_indoor_temp: f64,
    ) -> Option<EnergyForecaster> {
        let heat_loss_k = entity.energy_separation.heat_loss_k?;
        let learned = &entity.learned.weather_coefficients;
        let model = if learned.solar_confidence_ml2 >= 0.3 {
            WeatherModel::with_learned(learned.solar_coefficient_ml2, learned.wind_coefficient_ml2)
        } else {
            WeatherModel::default()
        };

        Some(EnergyForecaster {
            heat_loss_k,
            target_indoor_temp,
            latitude,
            longitude,
            model,
        })
    }

    pub fn new(heat_loss_k: f64, target_indoor_temp: f64, latitude: f64, longitude: f64) -> EnergyForecaster {
        EnergyForecaster {
            heat_loss_k,
            target_indoor_temp,
            latitude,
            longitude,
            model: WeatherModel::default(),
        }
    }

    /// One energy point per weather-forecast hour. Missing weather details
    /// fall back to typical Nordic values (humidity 80%, half-covered sky).
    pub fn generate(
        &self,
        weather_forecast: &[ForecastPoint],
        current_indoor_temp: Option<f64>,
    ) -> Vec<EnergyForecastPoint> {
        let indoor = current_indoor_temp.unwrap_or(self.target_indoor_temp);
        let mut points = Vec::with_capacity(weather_forecast.len());

        for wp in weather_forecast {
            let sample = WeatherSample {
                timestamp: wp.time,
                temperature: wp.temperature,
                wind_speed: wp.wind_speed.unwrap_or(0.0),
                humidity: wp.humidity.unwrap_or(80.0),
                cloud_cover: wp.cloud_cover.unwrap_or(4.0),
                latitude: Some(self.latitude),
                longitude: Some(self.longitude),
            };
            let effective = self.model.effective_temperature(&sample);

            let temp_diff = indoor - effective.effective_temp;
            let heating_power = if temp_diff > 0.0 { self.heat_loss_k * temp_diff } else { 0.0 };

            points.push(EnergyForecastPoint {
                timestamp: wp.time,
                outdoor_temp: wp.temperature,
                effective_temp: effective.effective_temp,
                wind_effect: effective.wind_effect,
                solar_effect: effective.solar_effect,
                humidity_effect: effective.humidity_effect,
                heating_power_kw: heating_power,
                heating_energy_kwh: heating_power,
                lead_time_hours: wp.lead_time_hours,
            });
        }

        points
    }

    pub fn summary(&self, points: &[EnergyForecastPoint], hours: usize) -> Option<ForecastSummary> {
        let window = &points[..points.len().min(hours)];
        if window.is_empty() {
            return None;
        }

        let total_energy: f64 = window.iter().map(|p| p.heating_energy_kwh).sum();
        let peak_power = window.iter().map(|p| p.heating_power_kw).fold(f64::MIN, f64::max);
        let avg_power = window.iter().map(|p| p.heating_power_kw).sum::<f64>() / window.len() as f64;
        let avg_outdoor = window.iter().map(|p| p.outdoor_temp).sum::<f64>() / window.len() as f64;
        let min_outdoor = window.iter().map(|p| p.outdoor_temp).fold(f64::MAX, f64::min);

        Some(ForecastSummary {
            total_energy_kwh: total_energy,
            avg_power_kw: avg_power,
            peak_power_kw: peak_power,
            avg_outdoor_temp: avg_outdoor,
            min_outdoor_temp: min_outdoor,
            hours: window.len(),
        })
    }
}

// ── Forecast trend & heating recommendation ──────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Rising,
    Falling,
    Stable,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Rising => "rising",
            Trend::Falling => "falling",
            Trend::Stable => "stable",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForecastTrend {
    pub current_temp: f64,
    pub avg_temp: f64,
    pub max_temp: f64,
    pub min_temp: f64,
    pub trend: Trend,
    pub change: f64,
    pub forecast_hours: u32,
    pub avg_cloud_cover: Option<f64>,
    pub cloud_condition: &'static str,
}

/// Classify the forecast window: more than 1 degC end-to-end change counts
/// as a trend, cloud buckets follow the octas scale.
pub fn analyze_trend(points: &[ForecastPoint], forecast_hours: u32) -> Option<ForecastTrend> {
    let window: Vec<&ForecastPoint> = points
        .iter()
        .filter(|p| p.lead_time_hours <= forecast_hours as f64)
        .collect();
    if window.is_empty() {
        return None;
    }

    let temps: Vec<f64> = window.iter().map(|p| p.temperature).collect();
    let change = temps[temps.len() - 1] - temps[0];
    let trend = if change > 1.0 {
        Trend::Rising
    } else if change < -1.0 {
        Trend::Falling
    } else {
        Trend::Stable
    };

    let clouds: Vec<f64> = window.iter().filter_map(|p| p.cloud_cover).collect();
    let avg_cloud_cover = if clouds.is_empty() {
        None
    } else {
        Some(clouds.iter().sum::<f64>() / clouds.len() as f64)
    };
    let cloud_condition = match avg_cloud_cover {
        Some(c) if c < 2.0 => "clear",
        Some(c) if c < 5.0 => "partly cloudy",
        Some(c) if c < 7.0 => "cloudy",
        Some(_) => "overcast",
        None => "unknown",
    };

    Some(ForecastTrend {
        current_temp: temps[0],
        avg_temp: temps.iter().sum::<f64>() / temps.len() as f64,
        max_temp: temps.iter().copied().fold(f64::MIN, f64::max),
        min_temp: temps.iter().copied().fold(f64::MAX, f64::min),
        trend,
        change,
        forecast_hours,
        avg_cloud_cover,
        cloud_condition,
    })
}

#[derive(Debug, Clone)]
pub struct HeatingRecommendation {
    pub reduce_heating: bool,
    pub reason: String,
    pub confidence: f64,
    pub forecast_change: f64,
    pub current_indoor: f64,
    pub solar_factor: &'static str,
    pub cloud_condition: &'static str,
}

/// Reduce heating when the outdoor trend is rising and the indoor is near
/// target. The outdoor sensor reads high in direct sun, so the forecast
/// change is discounted by an estimated solar influence before deciding.
pub fn heating_recommendation(
    trend: &ForecastTrend,
    current_indoor: f64,
    target_temp: f64,
    temp_margin: f64,
    is_night: bool,
) -> HeatingRecommendation {
    let (solar_factor, solar_adjustment) = if is_night {
        ("none", 0.0)
    } else {
        match trend.avg_cloud_cover.unwrap_or(8.0) {
            c if c < 2.0 => ("high", 2.0),
            c if c < 5.0 => ("medium", 1.0),
            _ => ("low", 0.0),
        }
    };

    let indoor_above_target = current_indoor >= target_temp - temp_margin;
    let adjusted_change = trend.change - solar_adjustment;

    if indoor_above_target && trend.trend == Trend::Rising {
        HeatingRecommendation {
            reduce_heating: true,
            reason: format!(
                "Outdoor temp {} {:+.1}C, indoor at {:.1}C",
                trend.trend.as_str(),
                trend.change,
                current_indoor
            ),
            confidence: (adjusted_change.abs() / 5.0).min(1.0),
            forecast_change: trend.change,
            current_indoor,
            solar_factor,
            cloud_condition: trend.cloud_condition,
        }
    } else if indoor_above_target && adjusted_change > 2.0 {
        HeatingRecommendation {
            reduce_heating: true,
            reason: format!(
                "Significant outdoor warming expected ({:+.1}C after solar adjustment)",
                adjusted_change
            ),
            confidence: 0.8,
            forecast_change: trend.change,
            current_indoor,
            solar_factor,
            cloud_condition: trend.cloud_condition,
        }
    } else {
        HeatingRecommendation {
            reduce_heating: false,
            reason: format!(
                "Heating needed ({}, indoor {:.1}C, {})",
                trend.trend.as_str(),
                current_indoor,
                trend.cloud_condition
            ),
            confidence: 0.5,
            forecast_change: trend.change,
            current_indoor,
            solar_factor,
            cloud_condition: trend.cloud_condition,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn wp(hour_offset: i64, temp: f64, cloud: Option<f64>) -> ForecastPoint {
        ForecastPoint {
            time: Utc.with_ymd_and_hms(2026, 1, 12, 12, 0, 0).unwrap() + chrono::Duration::hours(hour_offset),
            temperature: temp,
            lead_time_hours: hour_offset as f64,
            cloud_cover: cloud,
            wind_speed: Some(0.0),
            humidity: Some(50.0),
        }
    }

    #[test]
    fn power_is_k_times_delta_t() {
        let forecaster = EnergyForecaster::new(0.0685, 22.0, 58.41, 15.62);
        // Night hours in January: no solar term, wind 0, humidity 50.
        let points = forecaster.generate(&[wp(10, -5.0, Some(8.0))], Some(22.0));
        assert_eq!(points.len(), 1);
        let p = &points[0];
        assert!((p.effective_temp - -5.0).abs() < 1e-9);
        assert!((p.heating_power_kw - 0.0685 * 27.0).abs() < 1e-9);
        assert_eq!(p.heating_power_kw, p.heating_energy_kwh);
    }

    #[test]
    fn warm_hours_clamp_to_zero_power() {
        let forecaster = EnergyForecaster::new(0.0685, 22.0, 58.41, 15.62);
        let points = forecaster.generate(&[wp(10, 25.0, Some(8.0))], Some(22.0));
        assert_eq!(points[0].heating_power_kw, 0.0);
    }

    #[test]
    fn summary_aggregates_window() {
        let forecaster = EnergyForecaster::new(0.1, 21.0, 58.41, 15.62);
        let weather: Vec<ForecastPoint> =
            (1..=48).map(|h| wp(h, if h % 2 == 0 { -10.0 } else { 0.0 }, Some(8.0))).collect();
        let points = forecaster.generate(&weather, None);

        let day = forecaster.summary(&points, 24).unwrap();
        assert_eq!(day.hours, 24);
        assert!((day.min_outdoor_temp - -10.0).abs() < 1e-9);
        assert!((day.avg_outdoor_temp - -5.0).abs() < 1e-9);
        assert!(day.peak_power_kw > day.avg_power_kw);
        assert!((day.total_energy_kwh - points[..24].iter().map(|p| p.heating_energy_kwh).sum::<f64>()).abs() < 1e-9);

        let long = forecaster.summary(&points, 72).unwrap();
        assert_eq!(long.hours, 48, "summary bounded by available points");
    }

    #[test]
    fn trend_classification() {
        let rising: Vec<ForecastPoint> = (0..12).map(|h| wp(h, h as f64 * 0.3, Some(1.0))).collect();
        let trend = analyze_trend(&rising, 12).unwrap();
        assert_eq!(trend.trend, Trend::Rising);
        assert_eq!(trend.cloud_condition, "clear");
        assert!((trend.change - 3.3).abs() < 1e-9);

        let stable: Vec<ForecastPoint> = (0..12).map(|h| wp(h, 1.0, Some(7.5))).collect();
        let trend = analyze_trend(&stable, 12).unwrap();
        assert_eq!(trend.trend, Trend::Stable);
        assert_eq!(trend.cloud_condition, "overcast");
    }

    #[test]
    fn recommendation_reduces_on_rising_outdoor_with_warm_indoor() {
        let rising: Vec<ForecastPoint> = (0..12).map(|h| wp(h, h as f64 * 0.5, Some(6.0))).collect();
        let trend = analyze_trend(&rising, 12).unwrap();

        let rec = heating_recommendation(&trend, 21.8, 22.0, 0.5, false);
        assert!(rec.reduce_heating);
        assert!(rec.confidence > 0.0 && rec.confidence <= 1.0);
        assert_eq!(rec.solar_factor, "low");

        let rec = heating_recommendation(&trend, 19.0, 22.0, 0.5, false);
        assert!(!rec.reduce_heating, "cold indoor keeps heating");
    }

    #[test]
    fn night_has_no_solar_factor() {
        let rising: Vec<ForecastPoint> = (0..12).map(|h| wp(h, h as f64 * 0.5, Some(0.5))).collect();
        let trend = analyze_trend(&rising, 12).unwrap();
        let rec = heating_recommendation(&trend, 22.0, 22.0, 0.5, true);
        assert_eq!(rec.solar_factor, "none");
    }
}
