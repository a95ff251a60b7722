//! Effective outdoor temperature: what the outdoor temperature would need
//! to be in calm, dry, overcast conditions to cause the same heat loss.
//!
//! Formula:
//!     effective = base - wind_effect - humidity_effect + solar_effect
//! with
//!     wind_effect     = k_wind * sqrt(wind_speed)
//!     humidity_effect = k_humidity * max(0, humidity - 50)
//!     solar_effect    = k_solar * sin(elevation) * (1 - 0.9 * cloud/8)

use chrono::{DateTime, Utc};

use crate::sun;

pub const DEFAULT_WIND_COEFFICIENT: f64 = 0.56;
pub const DEFAULT_HUMIDITY_COEFFICIENT: f64 = 0.01;
pub const DEFAULT_SOLAR_COEFFICIENT: f64 = 6.0;

/// Weather inputs for a single point in time.
#[derive(Debug, Clone)]
pub struct WeatherSample {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub wind_speed: f64,
    pub humidity: f64,
    /// Cloud cover in octas, 0-8 (8 = fully overcast).
    pub cloud_cover: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Result with the per-factor breakdown kept for downstream storage.
#[derive(Debug, Clone)]
pub struct EffectiveTemperature {
    pub effective_temp: f64,
    pub base_temp: f64,
    /// Negative: wind cools.
    pub wind_effect: f64,
    /// Negative: humid cold air cools.
    pub humidity_effect: f64,
    /// Positive: sun warms. Zero when the sun is below the horizon.
    pub solar_effect: f64,
    pub sun_elevation: Option<f64>,
    pub solar_intensity: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct WeatherModel {
    pub wind_coefficient: f64,
    pub humidity_coefficient: f64,
    pub solar_coefficient: f64,
}

impl Default for WeatherModel {
    fn default() -> Self {
        WeatherModel {
            wind_coefficient: DEFAULT_WIND_COEFFICIENT,
            humidity_coefficient: DEFAULT_HUMIDITY_COEFFICIENT,
            solar_coefficient: DEFAULT_SOLAR_COEFFICIENT,
        }
    }
}

impl WeatherModel {
    /// Model with per-entity learned coefficients swapped in.
    pub fn with_learned(solar_coefficient: f64, wind_coefficient: f64) -> Self {
        WeatherModel {
            wind_coefficient,
            humidity_coefficient: DEFAULT_HUMIDITY_COEFFICIENT,
            solar_coefficient,
        }
    }

    pub fn effective_temperature(&self, conditions: &WeatherSample) -> EffectiveTemperature {
        let base_temp = conditions.temperature;

        // Convective loss grows with the square root of wind speed.
        let wind_effect = self.wind_coefficient * conditions.wind_speed.max(0.0).sqrt();

        // Only humidity above ~50% matters for conduction.
        let humidity_effect = self.humidity_coefficient * (conditions.humidity - 50.0).max(0.0);

        let (solar_effect, sun_elevation, solar_intensity) = self.solar_effect(conditions);

        EffectiveTemperature {
            effective_temp: base_temp - wind_effect - humidity_effect + solar_effect,
            base_temp,
            wind_effect: -wind_effect,
            humidity_effect: -humidity_effect,
            solar_effect,
            sun_elevation,
            solar_intensity,
        }
    }

    fn solar_effect(&self, conditions: &WeatherSample) -> (f64, Option<f64>, Option<f64>) {
        let (Some(lat), Some(lon)) = (conditions.latitude, conditions.longitude) else {
            // No location: cloud-only estimate with a mid-day factor.
            let intensity = 1.0 - conditions.cloud_cover / 8.0;
            return (self.solar_coefficient * intensity * 0.5, None, Some(intensity));
        };

        let elevation = sun::solar_elevation(conditions.timestamp, lat, lon);
        if elevation <= 0.0 {
            return (0.0, Some(elevation), Some(0.0));
        }

        let raw_intensity = elevation.to_radians().sin();
        let cloud_transmission = cloud_transmission(conditions.cloud_cover);
        let intensity = raw_intensity * cloud_transmission;

        (self.solar_coefficient * intensity, Some(elevation), Some(intensity))
    }
}

/// Fraction of solar radiation passing the cloud deck; full overcast blocks 90%.
pub fn cloud_transmission(cloud_octas: f64) -> f64 {
    1.0 - (cloud_octas.clamp(0.0, 8.0) / 8.0) * 0.9
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(ts: DateTime<Utc>) -> WeatherSample {
        WeatherSample {
            timestamp: ts,
            temperature: -5.0,
            wind_speed: 4.0,
            humidity: 80.0,
            cloud_cover: 2.0,
            latitude: Some(58.41),
            longitude: Some(15.62),
        }
    }

    #[test]
    fn breakdown_sums_to_effective() {
        let ts = Utc.with_ymd_and_hms(2026, 2, 10, 11, 0, 0).unwrap();
        let result = WeatherModel::default().effective_temperature(&sample(ts));
        let rebuilt =
            result.base_temp + result.wind_effect + result.humidity_effect + result.solar_effect;
        assert!((rebuilt - result.effective_temp).abs() < 1e-9);
    }

    #[test]
    fn no_wind_no_wind_effect() {
        let ts = Utc.with_ymd_and_hms(2026, 2, 10, 11, 0, 0).unwrap();
        let mut conditions = sample(ts);
        conditions.wind_speed = 0.0;
        let result = WeatherModel::default().effective_temperature(&conditions);
        assert_eq!(result.wind_effect, 0.0);
    }

    #[test]
    fn dry_air_no_humidity_effect() {
        let ts = Utc.with_ymd_and_hms(2026, 2, 10, 11, 0, 0).unwrap();
        let mut conditions = sample(ts);
        conditions.humidity = 45.0;
        let result = WeatherModel::default().effective_temperature(&conditions);
        assert_eq!(result.humidity_effect, 0.0);
    }

    #[test]
    fn night_has_zero_solar_effect() {
        let ts = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();
        let result = WeatherModel::default().effective_temperature(&sample(ts));
        assert_eq!(result.solar_effect, 0.0);
        assert!(result.sun_elevation.unwrap() < 0.0);
    }

    #[test]
    fn clear_winter_noon_warms() {
        let ts = Utc.with_ymd_and_hms(2026, 2, 10, 11, 0, 0).unwrap();
        let mut conditions = sample(ts);
        conditions.cloud_cover = 0.0;
        let result = WeatherModel::default().effective_temperature(&conditions);
        assert!(result.solar_effect > 0.0);
        // sin(elevation) capped around 0.25 in February at this latitude.
        assert!(result.solar_effect < DEFAULT_SOLAR_COEFFICIENT * 0.5);
    }

    #[test]
    fn overcast_transmits_ten_percent() {
        assert!((cloud_transmission(8.0) - 0.1).abs() < 1e-9);
        assert!((cloud_transmission(0.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn missing_location_uses_cloud_fallback() {
        let ts = Utc.with_ymd_and_hms(2026, 2, 10, 11, 0, 0).unwrap();
        let mut conditions = sample(ts);
        conditions.latitude = None;
        conditions.longitude = None;
        conditions.cloud_cover = 4.0;
        let result = WeatherModel::default().effective_temperature(&conditions);
        assert!((result.solar_effect - DEFAULT_SOLAR_COEFFICIENT * 0.5 * 0.5).abs() < 1e-9);
        assert!(result.sun_elevation.is_none());
    }
}
