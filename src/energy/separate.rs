//! Daily separation of measured whole-building energy into heating and
//! domestic hot water.
//!
//! The default method predicts heating from the calibrated heat-loss
//! coefficient and the day's mean indoor/outdoor temperatures; what the
//! meter saw beyond that is DHW. The alternative heuristic counts
//! on-demand DHW draws from hot-water temperature spikes.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Europe::Stockholm;
use log::{debug, info, warn};
use std::collections::BTreeMap;

use crate::entity::EntityConfig;
use crate::influx::{InfluxWriter, Point};
use crate::utils::{round_to, stockholm_date};

/// Minimum share of expected hourly meter samples for a day to get a
/// breakdown. Below it the day is written with the no_breakdown flag.
const MIN_DATA_COVERAGE: f64 = 0.8;
const EXPECTED_SAMPLES_PER_DAY: f64 = 24.0;

/// Assumed duration of one on-demand DHW draw.
const DHW_EVENT_HOURS: f64 = 0.25;

#[derive(Debug, Default)]
pub struct SeparationReport {
    pub days_written: usize,
    pub records: usize,
}

#[derive(Debug, Clone)]
struct DayAccumulator {
    total_kwh: f64,
    samples: usize,
    indoor_sum: f64,
    indoor_count: usize,
    outdoor_sum: f64,
    outdoor_count: usize,
    dhw_events: usize,
}

impl Default for DayAccumulator {
    fn default() -> Self {
        DayAccumulator {
            total_kwh: 0.0,
            samples: 0,
            indoor_sum: 0.0,
            indoor_count: 0,
            outdoor_sum: 0.0,
            outdoor_count: 0,
            dhw_events: 0,
        }
    }
}

/// Split one day's total with the k-calibration method. Heating never
/// exceeds the measured total; DHW is the remainder, floored at zero.
pub fn separate_day_k(total_kwh: f64, mean_indoor: f64, mean_outdoor: f64, k: f64) -> (f64, f64) {
    let delta_t = (mean_indoor - mean_outdoor).max(0.0);
    let predicted_heating = k * delta_t * 24.0;
    let heating = predicted_heating.min(total_kwh).max(0.0);
    let dhw = (total_kwh - heating).max(0.0);
    (heating, dhw)
}

/// Split via the on-demand-DHW heuristic: each detected draw contributes a
/// fixed power over a short interval.
pub fn separate_day_ondemand(total_kwh: f64, dhw_events: usize, avg_dhw_power_kw: f64) -> (f64, f64) {
    let dhw = (dhw_events as f64 * avg_dhw_power_kw * DHW_EVENT_HOURS).min(total_kwh);
    (total_kwh - dhw, dhw)
}

/// Separate the last `hours` of energy for one entity and write one daily
/// point per complete Swedish calendar day.
pub fn run_separation(
    influx: &InfluxWriter,
    entity: &EntityConfig,
    hours: i64,
) -> Result<SeparationReport, String> {
    let mut report = SeparationReport::default();
    if !entity.energy_separation.enabled {
        return Ok(report);
    }

    let tag_name = entity.kind.tag_name();
    let stop = Utc::now();
    let start = stop - Duration::hours(hours);

    let meter_rows = influx.fields_by_time("energy_meter", tag_name, &entity.entity_id, start, stop)?;
    if meter_rows.is_empty() {
        debug!("{}: no meter data in the last {}h", entity.entity_id, hours);
        return Ok(report);
    }

    let temp_rows = influx.fields_by_time(
        entity.kind.measurement(),
        tag_name,
        &entity.entity_id,
        start,
        stop,
    )?;

    let indoor_field = entity.mapped_field("room_temperature");
    let outdoor_field = entity.mapped_field("outdoor_temperature");
    let hot_water_field = entity.mapped_field("hot_water_temp");

    let mut days: BTreeMap<NaiveDate, DayAccumulator> = BTreeMap::new();

    for (ts, fields) in &meter_rows {
        let entry = days.entry(stockholm_date(*ts)).or_default();
        if let Some(consumption) = fields.get("consumption") {
            entry.total_kwh += consumption;
            entry.samples += 1;
        }
    }

    let mut previous_hot_water: Option<f64> = None;
    for (ts, fields) in &temp_rows {
        let entry = days.entry(stockholm_date(*ts)).or_default();
        if let Some(indoor) = fields.get(indoor_field.as_str()) {
            entry.indoor_sum += indoor;
            entry.indoor_count += 1;
        }
        if let Some(outdoor) = fields.get(outdoor_field.as_str()) {
            entry.outdoor_sum += outdoor;
            entry.outdoor_count += 1;
        }
        if let Some(hot_water) = fields.get(hot_water_field.as_str()) {
            if let Some(previous) = previous_hot_water {
                if *hot_water >= entity.energy_separation.dhw_temp_threshold
                    && hot_water - previous >= entity.energy_separation.dhw_temp_rise_threshold
                {
                    entry.dhw_events += 1;
                }
            }
            previous_hot_water = Some(*hot_water);
        }
    }

    let today = stockholm_date(stop);
    let mut points = Vec::new();

    for (date, day) in &days {
        // Today is still accumulating; only complete days get a point.
        if *date >= today || day.samples == 0 {
            continue;
        }

        let coverage = (day.samples as f64 / EXPECTED_SAMPLES_PER_DAY).min(1.0);
        let ts = day_point_timestamp(*date);

        if coverage < MIN_DATA_COVERAGE {
            points.push(
                Point::new("energy_separated")
                    .tag(tag_name, &entity.entity_id)
                    .tag("no_breakdown", "true")
                    .field("total_energy_kwh", round_to(day.total_kwh, 3))
                    .field("no_breakdown", true)
                    .field("data_coverage", round_to(coverage, 3))
                    .field("confidence", 0.0)
                    .time(ts),
            );
            report.days_written += 1;
            continue;
        }

        let mean_indoor = if day.indoor_count > 0 {
            Some(day.indoor_sum / day.indoor_count as f64)
        } else {
            entity.energy_separation.assumed_indoor_temp
        };
        let mean_outdoor = if day.outdoor_count > 0 {
            Some(day.outdoor_sum / day.outdoor_count as f64)
        } else {
            None
        };

        let split = match entity.energy_separation.method.as_str() {
            "ondemand_dhw" => Some(separate_day_ondemand(
                day.total_kwh,
                day.dhw_events,
                entity.energy_separation.avg_dhw_power_kw,
            )),
            _ => match (mean_indoor, mean_outdoor, entity.energy_separation.heat_loss_k) {
                (Some(indoor), Some(outdoor), Some(k)) => {
                    Some(separate_day_k(day.total_kwh, indoor, outdoor, k))
                }
                _ => {
                    warn!(
                        "{}: cannot separate {} (missing temps or uncalibrated k)",
                        entity.entity_id, date
                    );
                    None
                }
            },
        };

        let Some((heating, dhw)) = split else {
            continue;
        };

        let mut point = Point::new("energy_separated")
            .tag(tag_name, &entity.entity_id)
            .field("total_energy_kwh", round_to(day.total_kwh, 3))
            .field("heating_energy_kwh", round_to(heating, 3))
            .field("dhw_energy_kwh", round_to(dhw, 3))
            .field("data_coverage", round_to(coverage, 3))
            .field("confidence", round_to(coverage, 3))
            .time(ts);
        if let Some(outdoor) = mean_outdoor {
            point = point.field("avg_outdoor_temp", round_to(outdoor, 2));
        }
        points.push(point);
        report.days_written += 1;
        report.records += day.samples;
    }

    if !points.is_empty() {
        if !influx.write_points(&points) {
            return Err(format!("{}: energy_separated write failed", entity.entity_id));
        }
        info!(
            "{}: separated energy for {} day(s)",
            entity.entity_id, report.days_written
        );
    }

    Ok(report)
}

/// Daily points sit at Swedish noon so the calendar date is stable in any
/// nearby timezone.
fn day_point_timestamp(date: NaiveDate) -> DateTime<Utc> {
    Stockholm
        .from_local_datetime(&date.and_hms_opt(12, 0, 0).expect("valid time"))
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&date.and_hms_opt(12, 0, 0).expect("valid time")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn k_split_floors_dhw_at_zero() {
        // Cold day where the k-model explains everything: no DHW residual.
        let (heating, dhw) = separate_day_k(30.0, 21.0, -5.0, 0.06);
        // predicted = 0.06 * 26 * 24 = 37.4 > total -> all heating.
        assert!((heating - 30.0).abs() < 1e-9);
        assert_eq!(dhw, 0.0);
    }

    #[test]
    fn k_split_assigns_residual_to_dhw() {
        let (heating, dhw) = separate_day_k(50.0, 21.0, 1.0, 0.06);
        let predicted = 0.06 * 20.0 * 24.0;
        assert!((heating - predicted).abs() < 1e-9);
        assert!((dhw - (50.0 - predicted)).abs() < 1e-9);
    }

    #[test]
    fn warm_day_is_all_dhw() {
        let (heating, dhw) = separate_day_k(8.0, 21.0, 24.0, 0.06);
        assert_eq!(heating, 0.0);
        assert!((dhw - 8.0).abs() < 1e-9);
    }

    #[test]
    fn ondemand_split_scales_with_events() {
        let (heating, dhw) = separate_day_ondemand(40.0, 4, 25.0);
        // 4 draws * 25 kW * 0.25 h = 25 kWh.
        assert!((dhw - 25.0).abs() < 1e-9);
        assert!((heating - 15.0).abs() < 1e-9);
    }

    #[test]
    fn ondemand_split_never_exceeds_total() {
        let (heating, dhw) = separate_day_ondemand(10.0, 40, 25.0);
        assert_eq!(heating, 0.0);
        assert!((dhw - 10.0).abs() < 1e-9);
    }
}
