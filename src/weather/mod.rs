//! SMHI weather client: Metobs observations from the nearest station and
//! PMP3G point forecasts.

pub mod cache;

use chrono::{DateTime, TimeZone, Utc};
use log::{info, warn};
use serde::Deserialize;
use std::time::{Duration, Instant};

use crate::utils::haversine_km;

const METOBS_BASE: &str = "https://opendata-download-metobs.smhi.se/api";
const FORECAST_BASE: &str = "https://opendata-download-metfcst.smhi.se/api/category/pmp3g/version/2";

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const STATION_CACHE: Duration = Duration::from_secs(24 * 3600);

// Metobs parameter ids.
const PARAM_TEMP: u32 = 1;
const PARAM_WIND_SPEED: u32 = 4;
const PARAM_HUMIDITY: u32 = 6;

#[derive(Debug, Clone)]
pub struct WeatherStation {
    pub id: i64,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub distance_km: f64,
}

#[derive(Debug, Clone)]
pub struct Observation {
    pub station_id: i64,
    pub station_name: String,
    pub distance_km: f64,
    pub timestamp: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub wind_speed: Option<f64>,
    pub humidity: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ForecastPoint {
    pub time: DateTime<Utc>,
    pub temperature: f64,
    /// Hours between now and the target time at fetch.
    pub lead_time_hours: f64,
    pub cloud_cover: Option<f64>,
    pub wind_speed: Option<f64>,
    pub humidity: Option<f64>,
}

// ── Wire formats ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StationList {
    #[serde(default)]
    station: Vec<StationEntry>,
}

#[derive(Debug, Deserialize)]
struct StationEntry {
    id: i64,
    #[serde(default)]
    name: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    #[serde(default)]
    active: bool,
}

#[derive(Debug, Deserialize)]
struct ObservationData {
    #[serde(default)]
    value: Vec<ObservationValue>,
}

#[derive(Debug, Deserialize)]
struct ObservationValue {
    /// Epoch milliseconds.
    date: i64,
    /// Metobs delivers numeric values as strings.
    value: Option<String>,
    #[serde(default)]
    quality: String,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    #[serde(rename = "timeSeries", default)]
    time_series: Vec<ForecastEntry>,
}

#[derive(Debug, Deserialize)]
struct ForecastEntry {
    #[serde(rename = "validTime")]
    valid_time: String,
    #[serde(default)]
    parameters: Vec<ForecastParameter>,
}

#[derive(Debug, Deserialize)]
struct ForecastParameter {
    name: String,
    #[serde(default)]
    values: Vec<f64>,
}

// ── Client ───────────────────────────────────────────────────────────

pub struct SmhiClient {
    agent: ureq::Agent,
    latitude: f64,
    longitude: f64,
    nearest: Option<(WeatherStation, Instant)>,
}

fn get_json<T: serde::de::DeserializeOwned>(agent: &ureq::Agent, url: &str) -> Result<T, String> {
    let response = agent.get(url).call().map_err(|e| format!("request failed: {}", e))?;
    response
        .into_json()
        .map_err(|e| format!("response parse failed: {}", e))
}

impl SmhiClient {
    pub fn new(latitude: f64, longitude: f64) -> SmhiClient {
        SmhiClient {
            agent: ureq::AgentBuilder::new().timeout(FETCH_TIMEOUT).build(),
            latitude,
            longitude,
            nearest: None,
        }
    }

    /// Nearest active station for a parameter, cached for 24 h.
    fn nearest_station(&mut self, parameter: u32) -> Option<WeatherStation> {
        if let Some((station, cached_at)) = &self.nearest {
            if cached_at.elapsed() < STATION_CACHE {
                return Some(station.clone());
            }
        }

        let url = format!("{}/version/latest/parameter/{}/station.json", METOBS_BASE, parameter);
        let list: StationList = match get_json(&self.agent, &url) {
            Ok(list) => list,
            Err(e) => {
                warn!("SMHI station list fetch failed: {}", e);
                return None;
            }
        };

        let mut best: Option<WeatherStation> = None;
        for entry in list.station {
            if !entry.active {
                continue;
            }
            let (Some(lat), Some(lon)) = (entry.latitude, entry.longitude) else {
                continue;
            };
            let distance = haversine_km(self.latitude, self.longitude, lat, lon);
            if best.as_ref().map(|b| distance < b.distance_km).unwrap_or(true) {
                best = Some(WeatherStation {
                    id: entry.id,
                    name: entry.name.clone(),
                    latitude: lat,
                    longitude: lon,
                    distance_km: distance,
                });
            }
        }

        if let Some(station) = &best {
            info!(
                "Nearest weather station: {} ({:.1} km away)",
                station.name, station.distance_km
            );
            self.nearest = Some((station.clone(), Instant::now()));
        }
        best
    }

    /// Latest-hour value for one parameter, good/acceptable quality only.
    fn fetch_parameter(&self, station_id: i64, parameter: u32) -> Option<f64> {
        let url = format!(
            "{}/version/latest/parameter/{}/station/{}/period/latest-hour/data.json",
            METOBS_BASE, parameter, station_id
        );
        let data: ObservationData = match get_json(&self.agent, &url) {
            Ok(data) => data,
            Err(e) => {
                warn!("SMHI parameter {} fetch failed: {}", parameter, e);
                return None;
            }
        };

        let latest = data.value.last()?;
        parse_quality_value(latest)
    }

    /// Current observation from the nearest station.
    pub fn current_observation(&mut self) -> Option<Observation> {
        let station = self.nearest_station(PARAM_TEMP)?;
        let temperature = self.fetch_parameter(station.id, PARAM_TEMP);
        let wind_speed = self.fetch_parameter(station.id, PARAM_WIND_SPEED);
        let humidity = self.fetch_parameter(station.id, PARAM_HUMIDITY);

        temperature?;
        Some(Observation {
            station_id: station.id,
            station_name: station.name,
            distance_km: station.distance_km,
            timestamp: Utc::now(),
            temperature,
            wind_speed,
            humidity,
        })
    }

    /// Hourly forecast points for the next `hours_ahead` hours.
    pub fn forecast(&self, hours_ahead: u32) -> Result<Vec<ForecastPoint>, String> {
        let url = format!(
            "{}/geotype/point/lon/{:.6}/lat/{:.6}/data.json",
            FORECAST_BASE, self.longitude, self.latitude
        );
        let response: ForecastResponse =
            get_json(&self.agent, &url).map_err(|e| format!("SMHI forecast {}", e))?;

        let now = Utc::now();
        Ok(extract_forecast_points(&response, now, hours_ahead))
    }

    /// Historical observations (latest-day window) for gap filling.
    pub fn historical_observations(
        &mut self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Vec<Observation> {
        let Some(station) = self.nearest_station(PARAM_TEMP) else {
            return Vec::new();
        };

        let mut by_time: std::collections::BTreeMap<i64, (Option<f64>, Option<f64>, Option<f64>)> =
            std::collections::BTreeMap::new();

        for (parameter, slot) in [(PARAM_TEMP, 0usize), (PARAM_WIND_SPEED, 1), (PARAM_HUMIDITY, 2)] {
            let url = format!(
                "{}/version/latest/parameter/{}/station/{}/period/latest-day/data.json",
                METOBS_BASE, parameter, station.id
            );
            let data: ObservationData = match get_json(&self.agent, &url) {
                Ok(data) => data,
                Err(e) => {
                    warn!("SMHI history parameter {} fetch failed: {}", parameter, e);
                    continue;
                }
            };
            for value in &data.value {
                let Some(parsed) = parse_quality_value(value) else {
                    continue;
                };
                let entry = by_time.entry(value.date).or_default();
                match slot {
                    0 => entry.0 = Some(parsed),
                    1 => entry.1 = Some(parsed),
                    _ => entry.2 = Some(parsed),
                }
            }
        }

        by_time
            .into_iter()
            .filter_map(|(epoch_ms, (temperature, wind_speed, humidity))| {
                let ts = Utc.timestamp_millis_opt(epoch_ms).single()?;
                if ts < start || ts > stop || temperature.is_none() {
                    return None;
                }
                Some(Observation {
                    station_id: station.id,
                    station_name: station.name.clone(),
                    distance_km: station.distance_km,
                    timestamp: ts,
                    temperature,
                    wind_speed,
                    humidity,
                })
            })
            .collect()
    }
}

fn parse_quality_value(value: &ObservationValue) -> Option<f64> {
    if !matches!(value.quality.as_str(), "G" | "Y") {
        return None;
    }
    value.value.as_deref()?.parse::<f64>().ok()
}

fn extract_forecast_points(
    response: &ForecastResponse,
    now: DateTime<Utc>,
    hours_ahead: u32,
) -> Vec<ForecastPoint> {
    let cutoff = now + chrono::Duration::hours(hours_ahead as i64);
    let mut points = Vec::new();

    for entry in &response.time_series {
        let Ok(valid_time) = DateTime::parse_from_rfc3339(&entry.valid_time) else {
            continue;
        };
        let valid_time = valid_time.with_timezone(&Utc);
        if valid_time > cutoff {
            break;
        }
        if valid_time < now {
            continue;
        }

        let mut temperature = None;
        let mut cloud_cover = None;
        let mut wind_speed = None;
        let mut humidity = None;
        for parameter in &entry.parameters {
            let value = parameter.values.first().copied();
            match parameter.name.as_str() {
                "t" => temperature = value,
                "tcc_mean" => cloud_cover = value,
                "ws" => wind_speed = value,
                "r" => humidity = value,
                _ => {}
            }
        }

        let Some(temperature) = temperature else {
            continue;
        };
        let lead_time_hours = (valid_time - now).num_seconds() as f64 / 3600.0;
        points.push(ForecastPoint {
            time: valid_time,
            temperature,
            lead_time_hours: (lead_time_hours * 10.0).round() / 10.0,
            cloud_cover,
            wind_speed,
            humidity,
        });
    }

    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn quality_filtering() {
        let good = ObservationValue {
            date: 0,
            value: Some("12.3".to_string()),
            quality: "G".to_string(),
        };
        let suspect = ObservationValue {
            date: 0,
            value: Some("12.3".to_string()),
            quality: "R".to_string(),
        };
        assert_eq!(parse_quality_value(&good), Some(12.3));
        assert_eq!(parse_quality_value(&suspect), None);
    }

    #[test]
    fn forecast_extraction_windows_and_leads() {
        let now = Utc.with_ymd_and_hms(2026, 1, 12, 12, 0, 0).unwrap();
        let response = ForecastResponse {
            time_series: vec![
                entry("2026-01-12T11:00:00Z", 1.0, Some(3.0)),
                entry("2026-01-12T13:00:00Z", 2.0, Some(4.0)),
                entry("2026-01-12T14:00:00Z", 3.0, None),
                entry("2026-01-15T13:00:00Z", 9.0, None),
            ],
        };
        let points = extract_forecast_points(&response, now, 24);
        // Past hour and beyond-cutoff hour are dropped.
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].temperature, 2.0);
        assert_eq!(points[0].lead_time_hours, 1.0);
        assert_eq!(points[0].cloud_cover, Some(4.0));
        assert_eq!(points[1].lead_time_hours, 2.0);
    }

    fn entry(time: &str, temp: f64, cloud: Option<f64>) -> ForecastEntry {
        let mut parameters = vec![ForecastParameter {
            name: "t".to_string(),
            values: vec![temp],
        }];
        if let Some(cloud) = cloud {
            parameters.push(ForecastParameter {
                name: "tcc_mean".to_string(),
                values: vec![cloud],
            });
        }
        ForecastEntry {
            valid_time: time.to_string(),
            parameters,
        }
    }
}
