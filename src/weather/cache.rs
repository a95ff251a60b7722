//! Process-wide weather cache shared by all workers.
//!
//! Neighbors with the same coordinates (rounded to 2 decimals) reuse each
//! other's SMHI fetches instead of hammering the upstream API. Readers
//! accept stale-but-fresh-enough values; each key is written by whichever
//! worker fetched last.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{ForecastPoint, Observation};

/// Coordinates rounded to 2 decimals (~1 km) form the cache key.
fn cache_key(latitude: f64, longitude: f64) -> (i64, i64) {
    ((latitude * 100.0).round() as i64, (longitude * 100.0).round() as i64)
}

struct Entry<T> {
    value: T,
    stored_at: Instant,
}

#[derive(Default)]
pub struct SharedWeatherCache {
    observations: Mutex<HashMap<(i64, i64), Entry<Observation>>>,
    forecasts: Mutex<HashMap<(i64, i64), Entry<Vec<ForecastPoint>>>>,
}

impl SharedWeatherCache {
    pub fn new() -> SharedWeatherCache {
        SharedWeatherCache::default()
    }

    pub fn observation(&self, latitude: f64, longitude: f64, max_age: Duration) -> Option<Observation> {
        let map = self.observations.lock().expect("weather cache poisoned");
        let entry = map.get(&cache_key(latitude, longitude))?;
        if entry.stored_at.elapsed() <= max_age {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    pub fn store_observation(&self, latitude: f64, longitude: f64, observation: Observation) {
        let mut map = self.observations.lock().expect("weather cache poisoned");
        map.insert(
            cache_key(latitude, longitude),
            Entry {
                value: observation,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn forecast(
        &self,
        latitude: f64,
        longitude: f64,
        max_age: Duration,
    ) -> Option<Vec<ForecastPoint>> {
        let map = self.forecasts.lock().expect("weather cache poisoned");
        let entry = map.get(&cache_key(latitude, longitude))?;
        if entry.stored_at.elapsed() <= max_age {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    pub fn store_forecast(&self, latitude: f64, longitude: f64, forecast: Vec<ForecastPoint>) {
        let mut map = self.forecasts.lock().expect("weather cache poisoned");
        map.insert(
            cache_key(latitude, longitude),
            Entry {
                value: forecast,
                stored_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn observation(temp: f64) -> Observation {
        Observation {
            station_id: 85240,
            station_name: "Malmslätt".to_string(),
            distance_km: 6.0,
            timestamp: Utc::now(),
            temperature: Some(temp),
            wind_speed: Some(3.0),
            humidity: Some(80.0),
        }
    }

    #[test]
    fn neighbors_share_by_rounded_coordinate() {
        let cache = SharedWeatherCache::new();
        cache.store_observation(58.412, 15.618, observation(-4.0));

        // 58.408 rounds to the same 58.41 key.
        let hit = cache.observation(58.408, 15.622, Duration::from_secs(900));
        assert_eq!(hit.unwrap().temperature, Some(-4.0));

        // A different coordinate misses.
        assert!(cache.observation(58.59, 16.19, Duration::from_secs(900)).is_none());
    }

    #[test]
    fn expired_entries_are_not_served() {
        let cache = SharedWeatherCache::new();
        cache.store_observation(58.41, 15.62, observation(-4.0));
        assert!(cache.observation(58.41, 15.62, Duration::from_secs(0)).is_none());
    }

    #[test]
    fn latest_write_wins() {
        let cache = SharedWeatherCache::new();
        cache.store_observation(58.41, 15.62, observation(-4.0));
        cache.store_observation(58.41, 15.62, observation(-2.5));
        let hit = cache.observation(58.41, 15.62, Duration::from_secs(900));
        assert_eq!(hit.unwrap().temperature, Some(-2.5));
    }
}
