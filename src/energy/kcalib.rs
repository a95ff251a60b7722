//! Heat-loss coefficient (k) recalibration from separated heating energy.
//!
//! k = heating_kwh / (delta_T * 24) per day; the low percentile of the
//! daily values picks out days with minimal DHW contamination. Every run
//! appends to `k_calibration_history`; the accepted value is written back
//! to the entity record unless dry-run.

use chrono::{Duration, NaiveDate, Utc};
use log::{info, warn};
use std::collections::BTreeMap;

use crate::entity::{EntityConfig, EntityKind};
use crate::influx::{InfluxWriter, K_HISTORY_MIN_INTERVAL, Point, parse_time};
use crate::utils::{round_to, stockholm_date};

pub const MIN_DAYS_FOR_CALIBRATION: usize = 3;
const CALIBRATION_METHOD: &str = "heating_only_15pct";

#[derive(Debug, Clone)]
pub struct DaySample {
    pub date: NaiveDate,
    pub heating_kwh: f64,
    pub indoor: f64,
    pub outdoor: f64,
}

#[derive(Debug, Clone)]
pub struct CalibrationResult {
    pub k_value: f64,
    pub k_median: f64,
    pub k_stddev: f64,
    pub days_used: usize,
    pub total_days: usize,
    pub avg_outdoor_temp: f64,
    pub confidence: f64,
}

/// Pure calibration from daily samples. Days with `delta_T <= 0`, no
/// heating, or an implausible k are skipped; fewer than three usable days
/// yields nothing.
pub fn calibrate(samples: &[DaySample], percentile: u32, k_max: f64) -> Option<CalibrationResult> {
    let mut daily_k = Vec::new();
    let mut outdoor_temps = Vec::new();

    for sample in samples {
        if sample.heating_kwh <= 0.0 {
            log::debug!("{}: no heating energy, skipped", sample.date);
            continue;
        }
        let delta_t = sample.indoor - sample.outdoor;
        if delta_t <= 0.0 {
            log::debug!("{}: delta_T {:.1} <= 0, skipped", sample.date, delta_t);
            continue;
        }
        let k = sample.heating_kwh / (delta_t * 24.0);
        if k <= 0.0 || k >= k_max {
            log::debug!("{}: implausible k {:.3}, skipped", sample.date, k);
            continue;
        }
        daily_k.push(k);
        outdoor_temps.push(sample.outdoor);
    }

    if daily_k.len() < MIN_DAYS_FOR_CALIBRATION {
        return None;
    }

    let mut sorted = daily_k.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let percentile_index = (sorted.len() * percentile as usize) / 100;
    let k_value = sorted[percentile_index.min(sorted.len() - 1)];

    let k_median = median(&sorted);
    let k_stddev = sample_stddev(&daily_k);
    let avg_outdoor = outdoor_temps.iter().sum::<f64>() / outdoor_temps.len() as f64;

    let mut confidence = (daily_k.len() as f64 / 14.0).min(1.0);
    if k_stddev > 0.0 && k_median > 0.0 {
        let cv = k_stddev / k_median;
        confidence *= (1.0 - cv).max(0.5);
    }

    Some(CalibrationResult {
        k_value,
        k_median,
        k_stddev,
        days_used: daily_k.len(),
        total_days: samples.len(),
        avg_outdoor_temp: avg_outdoor,
        confidence,
    })
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

fn sample_stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Fetch inputs, calibrate, persist. Returns the result when enough data
/// existed, None otherwise.
pub fn recalibrate(
    influx: &InfluxWriter,
    entity: &mut EntityConfig,
    days: u32,
    dry_run: bool,
) -> Result<Option<CalibrationResult>, String> {
    if !entity.energy_separation.enabled {
        return Ok(None);
    }

    let samples = fetch_day_samples(influx, entity, days)?;
    let k_max = match entity.kind {
        EntityKind::Building => 50.0,
        EntityKind::House => 1.0,
    };

    let Some(result) = calibrate(&samples, entity.energy_separation.k_percentile, k_max) else {
        warn!(
            "{}: insufficient data for k calibration ({} candidate day(s))",
            entity.entity_id,
            samples.len()
        );
        return Ok(None);
    };

    info!(
        "{}: k calibrated to {:.4} kW/degC (median {:.4}, {} days, {:.0}% confidence)",
        entity.entity_id,
        result.k_value,
        result.k_median,
        result.days_used,
        result.confidence * 100.0
    );

    if dry_run {
        info!("{}: dry run, skipping history and record write", entity.entity_id);
        return Ok(Some(result));
    }

    let point = Point::new("k_calibration_history")
        .tag(entity.kind.tag_name(), &entity.entity_id)
        .tag("method", CALIBRATION_METHOD)
        .field("k_value", round_to(result.k_value, 5))
        .field("k_median", round_to(result.k_median, 5))
        .field("k_stddev", round_to(result.k_stddev, 5))
        .field("days_used", result.days_used as i64)
        .field("total_days", result.total_days as i64)
        .field("avg_outdoor_temp", round_to(result.avg_outdoor_temp, 1))
        .field("confidence", round_to(result.confidence, 3))
        .time(Utc::now());
    influx.write_throttled(&entity.entity_id, K_HISTORY_MIN_INTERVAL, point);

    entity.energy_separation.heat_loss_k = Some(round_to(result.k_value, 5));
    entity.energy_separation.calibration_date = Some(Utc::now().format("%Y-%m-%d").to_string());
    entity.energy_separation.calibration_days = result.days_used as u32;
    entity.save()?;

    Ok(Some(result))
}

/// Join separated daily heating energy with daily mean temperatures.
/// Buildings without an indoor sensor use the configured assumed indoor
/// temperature; sparse outdoor coverage falls back to the entity's weather
/// observation series.
fn fetch_day_samples(
    influx: &InfluxWriter,
    entity: &EntityConfig,
    days: u32,
) -> Result<Vec<DaySample>, String> {
    let tag_name = entity.kind.tag_name();
    let stop = Utc::now();
    let start = stop - Duration::days(days as i64);

    // Separated heating energy per day.
    let separated = influx.fields_by_time("energy_separated", tag_name, &entity.entity_id, start, stop)?;
    let mut heating_by_date: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for (ts, fields) in &separated {
        if let Some(heating) = fields.get("heating_energy_kwh") {
            heating_by_date.insert(stockholm_date(*ts), *heating);
        }
    }
    if heating_by_date.is_empty() {
        return Ok(Vec::new());
    }

    // Daily mean temperatures from the live measurement.
    let indoor_field = entity.mapped_field("room_temperature");
    let outdoor_field = entity.mapped_field("outdoor_temperature");
    let assumed_indoor = entity.energy_separation.assumed_indoor_temp;

    let flux = format!(
        "from(bucket: \"{bucket}\")\n\
         |> range(start: -{days}d)\n\
         |> filter(fn: (r) => r[\"_measurement\"] == \"{measurement}\")\n\
         |> filter(fn: (r) => r[\"{tag}\"] == \"{id}\")\n\
         |> filter(fn: (r) => r[\"_field\"] == \"{indoor}\" or r[\"_field\"] == \"{outdoor}\")\n\
         |> aggregateWindow(every: 1d, fn: mean, createEmpty: false)\n\
         |> pivot(rowKey: [\"_time\"], columnKey: [\"_field\"], valueColumn: \"_value\")",
        bucket = influx.bucket(),
        measurement = entity.kind.measurement(),
        tag = tag_name,
        id = entity.entity_id,
        indoor = indoor_field,
        outdoor = outdoor_field,
    );

    let mut temps_by_date: BTreeMap<NaiveDate, (Option<f64>, Option<f64>)> = BTreeMap::new();
    for row in influx.query(&flux)? {
        let Some(ts) = row.get("_time").and_then(|t| parse_time(t)) else {
            continue;
        };
        // aggregateWindow stamps the window end; the mean belongs to the
        // preceding day.
        let date = stockholm_date(ts - Duration::seconds(1));
        let indoor = row.get(indoor_field.as_str()).and_then(|v| v.parse::<f64>().ok());
        let outdoor = row.get(outdoor_field.as_str()).and_then(|v| v.parse::<f64>().ok());
        let entry = temps_by_date.entry(date).or_insert((None, None));
        if indoor.is_some() {
            entry.0 = indoor;
        }
        if outdoor.is_some() {
            entry.1 = outdoor;
        }
    }

    // SMHI fallback when a building's own outdoor signal is too sparse.
    if assumed_indoor.is_some() && temps_by_date.len() < days as usize / 2 {
        info!(
            "{}: sparse outdoor temps ({} day(s)), supplementing from weather observations",
            entity.entity_id,
            temps_by_date.len()
        );
        let weather_flux = format!(
            "from(bucket: \"{bucket}\")\n\
             |> range(start: -{days}d)\n\
             |> filter(fn: (r) => r[\"_measurement\"] == \"weather_observation\")\n\
             |> filter(fn: (r) => r[\"{tag}\"] == \"{id}\")\n\
             |> filter(fn: (r) => r[\"_field\"] == \"temperature\")\n\
             |> aggregateWindow(every: 1d, fn: mean, createEmpty: false)",
            bucket = influx.bucket(),
            tag = tag_name,
            id = entity.entity_id,
        );
        for row in influx.query(&weather_flux)? {
            let Some(ts) = row.get("_time").and_then(|t| parse_time(t)) else {
                continue;
            };
            let date = stockholm_date(ts - Duration::seconds(1));
            if let Some(outdoor) = row.get("_value").and_then(|v| v.parse::<f64>().ok()) {
                temps_by_date.entry(date).or_insert((None, None)).1.get_or_insert(outdoor);
            }
        }
    }

    let samples = heating_by_date
        .into_iter()
        .filter_map(|(date, heating_kwh)| {
            let (indoor, outdoor) = temps_by_date.get(&date).copied().unwrap_or((None, None));
            let indoor = assumed_indoor.or(indoor)?;
            let outdoor = outdoor?;
            Some(DaySample {
                date,
                heating_kwh,
                indoor,
                outdoor,
            })
        })
        .collect();

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_samples(count: usize, k_low: f64, k_high: f64) -> Vec<DaySample> {
        // delta_T fixed at 25: heating chosen so per-day k spans the range.
        (0..count)
            .map(|i| {
                let k = k_low + (k_high - k_low) * i as f64 / (count - 1) as f64;
                DaySample {
                    date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap() + Duration::days(i as i64),
                    heating_kwh: k * 25.0 * 24.0,
                    indoor: 21.0,
                    outdoor: -4.0,
                }
            })
            .collect()
    }

    #[test]
    fn fifteen_uniform_days_pick_the_third_sorted_value() {
        let samples = uniform_samples(15, 0.040, 0.090);
        let result = calibrate(&samples, 15, 1.0).unwrap();

        // floor(15 * 15 / 100) = 2 -> sorted[2].
        let expected_k = 0.040 + (0.090 - 0.040) * 2.0 / 14.0;
        assert!((result.k_value - expected_k).abs() < 1e-9);
        assert_eq!(result.days_used, 15);
        assert_eq!(result.total_days, 15);
        assert!((result.avg_outdoor_temp - -4.0).abs() < 1e-9);

        // confidence = min(1, 15/14) * (1 - stddev/median), within 1e-3.
        let ks: Vec<f64> = (0..15)
            .map(|i| 0.040 + (0.090 - 0.040) * i as f64 / 14.0)
            .collect();
        let stddev = sample_stddev(&ks);
        let expected_confidence = 1.0 * (1.0 - stddev / 0.065);
        assert!((result.confidence - expected_confidence).abs() < 1e-3);
    }

    #[test]
    fn repeated_runs_are_deterministic() {
        let samples = uniform_samples(20, 0.050, 0.080);
        let first = calibrate(&samples, 15, 1.0).unwrap();
        let second = calibrate(&samples, 15, 1.0).unwrap();
        assert!((first.k_value - second.k_value).abs() < 1e-6);
        assert!((first.confidence - second.confidence).abs() < 1e-6);
    }

    #[test]
    fn non_heating_days_are_excluded() {
        let mut samples = uniform_samples(4, 0.050, 0.080);
        // A summer day: outdoor above indoor.
        samples.push(DaySample {
            date: NaiveDate::from_ymd_opt(2026, 6, 1).unwrap(),
            heating_kwh: 5.0,
            indoor: 21.0,
            outdoor: 25.0,
        });
        // A day with no heating at all.
        samples.push(DaySample {
            date: NaiveDate::from_ymd_opt(2026, 6, 2).unwrap(),
            heating_kwh: 0.0,
            indoor: 21.0,
            outdoor: 10.0,
        });

        let result = calibrate(&samples, 15, 1.0).unwrap();
        assert_eq!(result.days_used, 4);
        assert_eq!(result.total_days, 6);
    }

    #[test]
    fn fewer_than_three_days_yields_nothing() {
        let samples = uniform_samples(2, 0.050, 0.080);
        assert!(calibrate(&samples, 15, 1.0).is_none());
    }

    #[test]
    fn implausible_k_is_rejected_by_sanity_cap() {
        let samples = vec![
            DaySample {
                date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                heating_kwh: 5000.0,
                indoor: 21.0,
                outdoor: 20.0,
            };
            5
        ];
        // k = 5000 / 24 per day, far beyond a house's 1.0 cap.
        assert!(calibrate(&samples, 15, 1.0).is_none());
    }

    #[test]
    fn single_value_days_have_full_stability() {
        let samples = vec![
            DaySample {
                date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                heating_kwh: 0.06 * 25.0 * 24.0,
                indoor: 21.0,
                outdoor: -4.0,
            };
            5
        ];
        let result = calibrate(&samples, 15, 1.0).unwrap();
        assert!((result.k_value - 0.06).abs() < 1e-9);
        // Zero spread: confidence is purely the day-count term.
        assert!((result.confidence - 5.0 / 14.0).abs() < 1e-9);
    }
}
