//! Startup gap repair for the time-series.
//!
//! Looks at the last 24 h of an entity's live measurement and weather
//! observations, finds holes longer than twice the poll interval, and
//! backfills them from the upstream BMS history API and the weather
//! station's recent archive. Idempotent: timestamps that already carry a
//! non-zero record are skipped, so a crashed fill can simply run again.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use std::collections::BTreeMap;

use crate::bms::BmsClient;
use crate::entity::{EntityConfig, EntityKind};
use crate::influx::{InfluxWriter, Point};
use crate::utils::round_to;
use crate::weather::SmhiClient;

#[derive(Debug, Default, Clone, Copy)]
pub struct GapFillReport {
    pub written: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl GapFillReport {
    fn merge(&mut self, other: GapFillReport) {
        self.written += other.written;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

/// Holes in a sorted timestamp series: any spacing beyond twice the
/// expected interval, including leading and trailing holes. An empty
/// series is one gap spanning the whole window.
pub fn detect_gaps(
    timestamps: &[DateTime<Utc>],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    expected_interval_minutes: u32,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    if timestamps.is_empty() {
        return vec![(start, end)];
    }

    let threshold = Duration::minutes(expected_interval_minutes as i64 * 2);
    let mut gaps = Vec::new();

    if timestamps[0] - start > threshold {
        gaps.push((start, timestamps[0]));
    }
    for pair in timestamps.windows(2) {
        if pair[1] - pair[0] > threshold {
            gaps.push((pair[0], pair[1]));
        }
    }
    if end - *timestamps.last().unwrap() > threshold {
        gaps.push((*timestamps.last().unwrap(), end));
    }

    gaps
}

/// Fill both heating and weather gaps for one entity. Best-effort: every
/// failure is counted, none is fatal.
pub fn fill_gaps_on_startup(
    influx: &InfluxWriter,
    entity: &EntityConfig,
    bms: &mut BmsClient,
    smhi: Option<&mut SmhiClient>,
) -> GapFillReport {
    let mut report = GapFillReport::default();
    let end = Utc::now();
    let start = end - Duration::hours(24);
    let interval = entity.poll_interval_minutes();

    match fill_heating_gaps(influx, entity, bms, start, end, interval) {
        Ok(heating) => report.merge(heating),
        Err(e) => {
            warn!("{}: heating gap fill failed: {}", entity.entity_id, e);
            report.errors += 1;
        }
    }

    if let Some(smhi) = smhi {
        match fill_weather_gaps(influx, entity, smhi, start, end, interval) {
            Ok(weather) => report.merge(weather),
            Err(e) => {
                warn!("{}: weather gap fill failed: {}", entity.entity_id, e);
                report.errors += 1;
            }
        }
    }

    if report.written > 0 || report.errors > 0 {
        info!(
            "{}: gap fill done (written={}, skipped={}, errors={})",
            entity.entity_id, report.written, report.skipped, report.errors
        );
    } else {
        debug!("{}: no gaps in the last 24h", entity.entity_id);
    }

    report
}

fn fill_heating_gaps(
    influx: &InfluxWriter,
    entity: &EntityConfig,
    bms: &mut BmsClient,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    interval: u32,
) -> Result<GapFillReport, String> {
    let mut report = GapFillReport::default();
    if !bms.supports_history() {
        debug!("{}: upstream has no history API, skipping heating fill", entity.entity_id);
        return Ok(report);
    }

    let tag_name = entity.kind.tag_name();
    let measurement = entity.kind.measurement();
    let outdoor_field = entity.mapped_field("outdoor_temperature");
    let indoor_field = entity.mapped_field("room_temperature");

    let timestamps = influx.field_timestamps(
        measurement,
        tag_name,
        &entity.entity_id,
        &[indoor_field.as_str(), outdoor_field.as_str()],
        start,
        end,
    )?;
    let gaps = detect_gaps(&timestamps, start, end, interval);
    if gaps.is_empty() {
        return Ok(report);
    }

    let total_minutes: i64 = gaps.iter().map(|(s, e)| (*e - *s).num_minutes()).sum();
    info!(
        "{}: {} heating gap(s) totaling {} minutes",
        entity.entity_id,
        gaps.len(),
        total_minutes
    );

    // signal id -> canonical field, for mapping history rows back.
    let fetch = entity.fetch_signals();
    let field_by_signal: BTreeMap<String, String> = fetch
        .values()
        .map(|(signal_id, field)| (signal_id.clone(), field.clone()))
        .collect();
    let signal_ids: Vec<String> = field_by_signal.keys().cloned().collect();
    if signal_ids.is_empty() {
        return Ok(report);
    }

    let existing = influx.fields_by_time(measurement, tag_name, &entity.entity_id, start, end)?;

    for (gap_start, gap_end) in gaps {
        // Upstream archives hourly.
        let history = bms
            .read_history(&signal_ids, gap_start, gap_end, 3600)
            .map_err(|e| format!("history fetch failed: {}", e))?;

        let mut by_time: BTreeMap<DateTime<Utc>, BTreeMap<String, f64>> = BTreeMap::new();
        for point in history {
            let Some(field) = field_by_signal.get(&point.signal_id) else {
                continue;
            };
            by_time
                .entry(point.time)
                .or_default()
                .insert(field.clone(), point.value);
        }

        for (ts, fields) in by_time {
            if ts < gap_start || ts > gap_end {
                continue;
            }

            if let Some(existing_fields) = existing.get(&ts) {
                let has_real_data = [&indoor_field, &outdoor_field, &"supply_temp".to_string()]
                    .iter()
                    .any(|f| existing_fields.get(f.as_str()).map(|v| *v != 0.0).unwrap_or(false));
                if has_real_data {
                    report.skipped += 1;
                    continue;
                }
            }

            // Core fields are required: a reading without them is noise.
            let has_core = match entity.kind {
                EntityKind::House => {
                    fields.contains_key(indoor_field.as_str()) && fields.contains_key(outdoor_field.as_str())
                }
                EntityKind::Building => fields.contains_key(outdoor_field.as_str()),
            };
            if !has_core {
                report.skipped += 1;
                continue;
            }

            let mut heating_point = Point::new(measurement)
                .tag(tag_name, &entity.entity_id)
                .time(ts);
            for (field, value) in &fields {
                heating_point = heating_point.field(field.as_str(), round_to(*value, 2));
            }

            // Mirror to thermal_history so restarted learners can reseed.
            let thermal_point = Point::new("thermal_history")
                .tag(tag_name, &entity.entity_id)
                .field_opt("room_temperature", fields.get(indoor_field.as_str()).copied())
                .field_opt("outdoor_temperature", fields.get(outdoor_field.as_str()).copied())
                .field_opt("supply_temp", fields.get("supply_temp").copied())
                .field_opt("return_temp", fields.get("return_temp").copied())
                .time(ts);

            if influx.write_point(heating_point) {
                influx.write_point(thermal_point);
                report.written += 1;
            } else {
                report.errors += 1;
            }
        }
    }

    Ok(report)
}

fn fill_weather_gaps(
    influx: &InfluxWriter,
    entity: &EntityConfig,
    smhi: &mut SmhiClient,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    interval: u32,
) -> Result<GapFillReport, String> {
    let mut report = GapFillReport::default();
    let tag_name = entity.kind.tag_name();

    let timestamps = influx.field_timestamps(
        "weather_observation",
        tag_name,
        &entity.entity_id,
        &["temperature"],
        start,
        end,
    )?;
    let gaps = detect_gaps(&timestamps, start, end, interval);
    if gaps.is_empty() {
        return Ok(report);
    }

    let observations = smhi.historical_observations(start, end);
    if observations.is_empty() {
        debug!("{}: no archived weather observations available", entity.entity_id);
        return Ok(report);
    }

    for observation in observations {
        let in_gap = gaps
            .iter()
            .any(|(gap_start, gap_end)| observation.timestamp >= *gap_start && observation.timestamp <= *gap_end);
        if !in_gap {
            report.skipped += 1;
            continue;
        }
        let Some(temperature) = observation.temperature else {
            report.skipped += 1;
            continue;
        };

        let point = Point::new("weather_observation")
            .tag(tag_name, &entity.entity_id)
            .tag("station_name", &observation.station_name)
            .tag("station_id", &observation.station_id.to_string())
            .tag("source", "gap_fill")
            .field("temperature", round_to(temperature, 2))
            .field("distance_km", round_to(observation.distance_km, 2))
            .field_opt("wind_speed", observation.wind_speed.map(|v| round_to(v, 2)))
            .field_opt("humidity", observation.humidity.map(|v| round_to(v, 2)))
            .time(observation.timestamp);

        if influx.write_point(point) {
            report.written += 1;
        } else {
            report.errors += 1;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(minute_offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 12, 0, 0, 0).unwrap() + Duration::minutes(minute_offset)
    }

    #[test]
    fn empty_series_is_one_full_gap() {
        let gaps = detect_gaps(&[], t(0), t(120), 15);
        assert_eq!(gaps, vec![(t(0), t(120))]);
    }

    #[test]
    fn steady_series_has_no_gaps() {
        let timestamps: Vec<_> = (0..8).map(|i| t(i * 15)).collect();
        let gaps = detect_gaps(&timestamps, t(0), t(105), 15);
        assert!(gaps.is_empty());
    }

    #[test]
    fn hole_longer_than_twice_interval_is_flagged() {
        // Points at 0 and 15, then nothing until 75: a 60-minute hole.
        let timestamps = vec![t(0), t(15), t(75), t(90)];
        let gaps = detect_gaps(&timestamps, t(0), t(90), 15);
        assert_eq!(gaps, vec![(t(15), t(75))]);
    }

    #[test]
    fn exactly_twice_interval_is_tolerated() {
        let timestamps = vec![t(0), t(30), t(60)];
        let gaps = detect_gaps(&timestamps, t(0), t(60), 15);
        assert!(gaps.is_empty());
    }

    #[test]
    fn leading_and_trailing_holes_count() {
        let timestamps = vec![t(60), t(75)];
        let gaps = detect_gaps(&timestamps, t(0), t(150), 15);
        assert_eq!(gaps, vec![(t(0), t(60)), (t(75), t(150))]);
    }
}
