//! Time-series writer for the InfluxDB v2 HTTP API.
//!
//! One instance per process, shared by every worker. Writes go through a
//! circuit breaker (3 consecutive failures open it, 60 s cooldown, health
//! probe to close) and an optional per-measurement throttle. Reads are
//! plain Flux queries and are never affected by breaker state.

pub mod breaker;
pub mod point;

pub use self::point::{FieldValue, Point};

use self::breaker::{BreakerDecision, CircuitBreaker, WriteThrottle};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::seq::SeqLogger;

pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const BREAKER_THRESHOLD: u32 = 3;
pub const BREAKER_COOLDOWN: Duration = Duration::from_secs(60);
/// k_calibration_history is written at most once per hour per entity.
pub const K_HISTORY_MIN_INTERVAL: Duration = Duration::from_secs(3600);

struct WriterState {
    breaker: CircuitBreaker,
    throttle: WriteThrottle,
}

pub struct InfluxWriter {
    write_agent: ureq::Agent,
    query_agent: ureq::Agent,
    url: String,
    token: String,
    org: String,
    bucket: String,
    state: Mutex<WriterState>,
    seq: Option<Arc<SeqLogger>>,
}

impl InfluxWriter {
    pub fn new(
        url: &str,
        token: &str,
        org: &str,
        bucket: &str,
        seq: Option<Arc<SeqLogger>>,
    ) -> InfluxWriter {
        let write_agent = ureq::AgentBuilder::new().timeout(WRITE_TIMEOUT).build();
        let query_agent = ureq::AgentBuilder::new().timeout(QUERY_TIMEOUT).build();

        let writer = InfluxWriter {
            write_agent,
            query_agent,
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            org: org.to_string(),
            bucket: bucket.to_string(),
            state: Mutex::new(WriterState {
                breaker: CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_COOLDOWN),
                throttle: WriteThrottle::new(),
            }),
            seq,
        };

        if writer.health() {
            info!("InfluxDB connected: {}", writer.url);
        } else {
            warn!("InfluxDB health check failed at startup: {}", writer.url);
        }

        writer
    }

    pub fn health(&self) -> bool {
        self.write_agent
            .get(&format!("{}/health", self.url))
            .set("Authorization", &format!("Token {}", self.token))
            .call()
            .is_ok()
    }

    /// Write a batch of points as one request. Returns false when the write
    /// failed or was skipped by the open circuit; callers treat both as a
    /// failed stage, never as an error to propagate.
    pub fn write_points(&self, points: &[Point]) -> bool {
        let now = Utc::now();
        let lines: Vec<String> = points.iter().filter_map(|p| p.to_line(now)).collect();
        if lines.is_empty() {
            return false;
        }

        let mut state = self.state.lock().expect("influx writer state poisoned");
        match state.breaker.check() {
            BreakerDecision::Proceed => {}
            BreakerDecision::Skip => {
                debug!("InfluxDB circuit open, skipping {} point(s)", lines.len());
                return false;
            }
            BreakerDecision::Probe => {
                if self.health() {
                    let cleared = state.breaker.close();
                    info!("InfluxDB write restored after {} failure(s)", cleared);
                    self.seq_event("InfluxDBRestored", "Information", "InfluxDB write restored");
                } else {
                    state.breaker.reopen();
                    warn!("InfluxDB health probe failed, circuit stays open");
                    return false;
                }
            }
        }

        let url = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=s",
            self.url, self.org, self.bucket
        );
        let body = lines.join("\n");
        let result = self
            .write_agent
            .post(&url)
            .set("Authorization", &format!("Token {}", self.token))
            .set("Content-Type", "text/plain; charset=utf-8")
            .send_string(&body);

        match result {
            Ok(_) => {
                if state.breaker.record_success() {
                    info!("InfluxDB write restored");
                    self.seq_event("InfluxDBRestored", "Information", "InfluxDB write restored");
                }
                true
            }
            Err(e) => {
                error!("InfluxDB write failed: {}", e);
                if state.breaker.record_failure() {
                    warn!(
                        "InfluxDB circuit breaker open after {} failures, skipping writes for {}s",
                        state.breaker.failures(),
                        BREAKER_COOLDOWN.as_secs()
                    );
                    self.seq_event(
                        "InfluxDBCircuitOpen",
                        "Warning",
                        "InfluxDB circuit breaker opened",
                    );
                }
                false
            }
        }
    }

    pub fn write_point(&self, point: Point) -> bool {
        self.write_points(std::slice::from_ref(&point))
    }

    /// Throttled write for measurements prone to restart storms.
    pub fn write_throttled(
        &self,
        entity_id: &str,
        min_interval: Duration,
        point: Point,
    ) -> bool {
        {
            let mut state = self.state.lock().expect("influx writer state poisoned");
            if !state
                .throttle
                .allow(point.measurement(), entity_id, min_interval)
            {
                info!(
                    "Throttled {} write for {}",
                    point.measurement(),
                    entity_id
                );
                return true;
            }
        }
        self.write_point(point)
    }

    // ── Deletes ──────────────────────────────────────────────────────

    /// Delete future points (now .. +7 d) for an entity's measurement so a
    /// fresh forecast replaces only what has not happened yet. Past points
    /// stay as the prediction-accuracy record.
    pub fn delete_future(&self, measurement: &str, tag_name: &str, entity_id: &str) -> bool {
        let start = Utc::now();
        let stop = start + ChronoDuration::days(7);
        self.delete_range(measurement, tag_name, entity_id, start, stop)
    }

    /// Delete already-resolved points for measurements where only the future
    /// horizon matters (temperature_forecast keeps a bounded past window).
    pub fn delete_past(
        &self,
        measurement: &str,
        tag_name: &str,
        entity_id: &str,
        hours_back: i64,
    ) -> bool {
        let stop = Utc::now();
        let start = stop - ChronoDuration::hours(hours_back);
        self.delete_range(measurement, tag_name, entity_id, start, stop)
    }

    fn delete_range(
        &self,
        measurement: &str,
        tag_name: &str,
        entity_id: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> bool {
        let url = format!("{}/api/v2/delete?org={}&bucket={}", self.url, self.org, self.bucket);
        let predicate = format!("_measurement=\"{}\" AND {}=\"{}\"", measurement, tag_name, entity_id);
        let body = serde_json::json!({
            "start": start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "stop": stop.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "predicate": predicate,
        });

        match self
            .query_agent
            .post(&url)
            .set("Authorization", &format!("Token {}", self.token))
            .send_json(body)
        {
            Ok(_) => true,
            Err(e) => {
                error!("InfluxDB delete for {} failed: {}", measurement, e);
                false
            }
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Run a Flux query and return the rows as column -> value maps.
    /// Unaffected by breaker state.
    pub fn query(&self, flux: &str) -> Result<Vec<BTreeMap<String, String>>, String> {
        let url = format!("{}/api/v2/query?org={}", self.url, self.org);
        let body = serde_json::json!({
            "query": flux,
            "dialect": {"header": true, "annotations": []},
        });

        let response = self
            .query_agent
            .post(&url)
            .set("Authorization", &format!("Token {}", self.token))
            .set("Accept", "application/csv")
            .send_json(body)
            .map_err(|e| format!("flux query failed: {}", e))?;

        let text = response
            .into_string()
            .map_err(|e| format!("flux response read failed: {}", e))?;
        Ok(parse_query_csv(&text))
    }

    /// Most recent timestamp carrying one of `fields`, within `range_days`.
    pub fn last_timestamp(
        &self,
        measurement: &str,
        tag_name: &str,
        entity_id: &str,
        fields: &[&str],
        range_days: u32,
    ) -> Option<DateTime<Utc>> {
        let field_filter = field_filter(fields);
        let flux = format!(
            "from(bucket: \"{bucket}\")\n\
             |> range(start: -{range_days}d)\n\
             |> filter(fn: (r) => r[\"_measurement\"] == \"{measurement}\")\n\
             |> filter(fn: (r) => r[\"{tag_name}\"] == \"{entity_id}\")\n\
             |> filter(fn: (r) => {field_filter})\n\
             |> keep(columns: [\"_time\"])\n\
             |> sort(columns: [\"_time\"], desc: true)\n\
             |> limit(n: 1)",
            bucket = self.bucket,
        );

        let rows = self.query(&flux).ok()?;
        rows.iter().filter_map(|row| parse_time(row.get("_time")?)).max()
    }

    /// All timestamps carrying one of `fields` in a window, sorted ascending
    /// and deduplicated. The gap filler runs on this.
    pub fn field_timestamps(
        &self,
        measurement: &str,
        tag_name: &str,
        entity_id: &str,
        fields: &[&str],
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, String> {
        let field_filter = field_filter(fields);
        let flux = format!(
            "from(bucket: \"{bucket}\")\n\
             |> range(start: {start}, stop: {stop})\n\
             |> filter(fn: (r) => r[\"_measurement\"] == \"{measurement}\")\n\
             |> filter(fn: (r) => r[\"{tag_name}\"] == \"{entity_id}\")\n\
             |> filter(fn: (r) => {field_filter})\n\
             |> keep(columns: [\"_time\"])",
            bucket = self.bucket,
            start = start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            stop = stop.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        );

        let rows = self.query(&flux)?;
        let mut timestamps: Vec<DateTime<Utc>> = rows
            .iter()
            .filter_map(|row| parse_time(row.get("_time")?))
            .collect();
        timestamps.sort();
        timestamps.dedup();
        Ok(timestamps)
    }

    /// Field values pivoted per timestamp for a window. Used by the gap
    /// filler for skip-existing checks.
    pub fn fields_by_time(
        &self,
        measurement: &str,
        tag_name: &str,
        entity_id: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<BTreeMap<DateTime<Utc>, BTreeMap<String, f64>>, String> {
        let flux = format!(
            "from(bucket: \"{bucket}\")\n\
             |> range(start: {start}, stop: {stop})\n\
             |> filter(fn: (r) => r[\"_measurement\"] == \"{measurement}\")\n\
             |> filter(fn: (r) => r[\"{tag_name}\"] == \"{entity_id}\")\n\
             |> pivot(rowKey: [\"_time\"], columnKey: [\"_field\"], valueColumn: \"_value\")",
            bucket = self.bucket,
            start = start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            stop = stop.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        );

        let rows = self.query(&flux)?;
        let mut by_time: BTreeMap<DateTime<Utc>, BTreeMap<String, f64>> = BTreeMap::new();
        for row in rows {
            let Some(ts) = row.get("_time").and_then(|t| parse_time(t)) else {
                continue;
            };
            let entry = by_time.entry(ts).or_default();
            for (column, value) in &row {
                if column.starts_with('_') || matches!(column.as_str(), "result" | "table") {
                    continue;
                }
                if let Ok(v) = value.parse::<f64>() {
                    entry.insert(column.clone(), v);
                }
            }
        }
        Ok(by_time)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn seq_event(&self, event_type: &str, level: &str, message: &str) {
        if let Some(seq) = &self.seq {
            seq.log(
                level,
                message,
                vec![
                    ("EventType".to_string(), serde_json::json!(event_type)),
                    ("Component".to_string(), serde_json::json!("InfluxWriter")),
                ],
            );
        }
    }
}

fn field_filter(fields: &[&str]) -> String {
    fields
        .iter()
        .map(|f| format!("r[\"_field\"] == \"{}\"", f))
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Parse the CSV a Flux query returns (header enabled, annotations off).
/// Each table chunk starts with its own header after a blank line.
pub fn parse_query_csv(text: &str) -> Vec<BTreeMap<String, String>> {
    let mut rows = Vec::new();
    let mut header: Option<Vec<String>> = None;

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            header = None;
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        let cells: Vec<&str> = line.split(',').collect();
        match &header {
            None => header = Some(cells.iter().map(|c| c.to_string()).collect()),
            Some(columns) => {
                let mut row = BTreeMap::new();
                for (column, cell) in columns.iter().zip(cells.iter()) {
                    if !column.is_empty() {
                        row.insert(column.clone(), cell.to_string());
                    }
                }
                rows.push(row);
            }
        }
    }

    rows
}

pub fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_table_csv() {
        let csv = ",result,table,_time,_value,_field,house_id\n\
                   ,_result,0,2026-01-12T12:00:00Z,21.5,room_temperature,villa\n\
                   ,_result,0,2026-01-12T12:15:00Z,21.6,room_temperature,villa\n";
        let rows = parse_query_csv(csv);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["_value"], "21.5");
        assert_eq!(rows[1]["_time"], "2026-01-12T12:15:00Z");
        assert_eq!(rows[0]["house_id"], "villa");
    }

    #[test]
    fn parses_multi_table_csv_with_new_headers() {
        let csv = ",result,table,_time,_value\n\
                   ,_result,0,2026-01-12T12:00:00Z,1.0\n\
                   \n\
                   ,result,table,_time,outdoor_temperature,room_temperature\n\
                   ,_result,1,2026-01-12T12:15:00Z,-4.2,21.4\n";
        let rows = parse_query_csv(csv);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["outdoor_temperature"], "-4.2");
        assert!(!rows[1].contains_key("_value"));
    }

    #[test]
    fn skips_annotation_lines() {
        let csv = "#datatype,string,long,dateTime:RFC3339,double\n\
                   #group,false,false,false,false\n\
                   #default,_result,,,\n\
                   ,result,table,_time,_value\n\
                   ,_result,0,2026-01-12T12:00:00Z,3.14\n";
        let rows = parse_query_csv(csv);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["_value"], "3.14");
    }

    #[test]
    fn time_parsing() {
        let ts = parse_time("2026-01-12T12:00:00Z").unwrap();
        assert_eq!(ts.timestamp(), 1768219200);
        assert!(parse_time("not a time").is_none());
    }

    #[test]
    fn field_filter_joins_with_or() {
        assert_eq!(
            field_filter(&["a", "b"]),
            "r[\"_field\"] == \"a\" or r[\"_field\"] == \"b\""
        );
    }
}
