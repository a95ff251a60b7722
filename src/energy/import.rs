//! Energy meter file ingestion.
//!
//! Meter exports land in `<import_dir>/incoming` as semicolon-separated
//! text with a header row. Rows are mapped through a column synonym table,
//! written as `energy_meter` points tagged by the owning entity, and the
//! file moves to `processed/` (or `failed/` for unknown meters and rowless
//! files). Moving files out of the inbox is what makes a rerun a no-op.

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Europe::Stockholm;
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::entity::MeterTarget;
use crate::influx::{InfluxWriter, Point};

/// Built-in header synonyms (lowercased header -> canonical field). The
/// table is data: `column_synonyms.json` in the import dir extends it
/// without recompilation.
const COLUMN_SYNONYMS: &[(&str, &str)] = &[
    ("id", "meter_id"),
    ("meter_id", "meter_id"),
    ("meterid", "meter_id"),
    ("timestamp", "timestamp"),
    ("time", "timestamp"),
    ("datetime", "timestamp"),
    ("datum", "timestamp"),
    ("tidpunkt", "timestamp"),
    ("meterstand", "meter_reading"),
    ("meter_reading", "meter_reading"),
    ("meterreading", "meter_reading"),
    ("cumulative", "meter_reading"),
    ("total", "meter_reading"),
    ("consumption", "consumption"),
    ("energy", "consumption"),
    ("kwh", "consumption"),
    ("forbrukning", "consumption"),
    ("flow", "flow"),
    ("flode", "flow"),
    ("volume_flow", "flow"),
    ("m3h", "flow"),
    ("tempin", "temp_in"),
    ("temp_in", "temp_in"),
    ("supply_temp", "temp_in"),
    ("framledning", "temp_in"),
    ("t_in", "temp_in"),
    ("tempout", "temp_out"),
    ("temp_out", "temp_out"),
    ("return_temp", "temp_out"),
    ("returledning", "temp_out"),
    ("t_out", "temp_out"),
    ("power", "power"),
    ("effect", "power"),
    ("kw", "power"),
];

/// Accepted timestamp formats. Anything else is a rejected row, never a
/// guess.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%Y%m%d%H%M%S",
    "%Y%m%d%H%M",
];

#[derive(Debug, Clone)]
pub struct MeterRecord {
    pub timestamp: DateTime<Utc>,
    pub meter_id: Option<String>,
    pub values: BTreeMap<String, f64>,
}

#[derive(Debug, Default)]
pub struct ImportReport {
    pub files: usize,
    pub records: usize,
    pub errors: Vec<String>,
}

pub struct EnergyImporter<'a> {
    influx: &'a InfluxWriter,
    mapping: &'a BTreeMap<String, MeterTarget>,
    import_dir: PathBuf,
    synonyms: BTreeMap<String, String>,
}

impl<'a> EnergyImporter<'a> {
    pub fn new(
        influx: &'a InfluxWriter,
        mapping: &'a BTreeMap<String, MeterTarget>,
        import_dir: &Path,
    ) -> EnergyImporter<'a> {
        EnergyImporter {
            influx,
            mapping,
            import_dir: import_dir.to_path_buf(),
            synonyms: load_synonyms(import_dir),
        }
    }

    /// Process every file in the inbox. Creates the folder layout on first
    /// use.
    pub fn run(&self) -> ImportReport {
        let incoming = self.import_dir.join("incoming");
        for sub in ["incoming", "processed", "failed"] {
            let _ = std::fs::create_dir_all(self.import_dir.join(sub));
        }

        let mut report = ImportReport::default();
        let entries = match std::fs::read_dir(&incoming) {
            Ok(entries) => entries,
            Err(e) => {
                report.errors.push(format!("list {} failed: {}", incoming.display(), e));
                return report;
            }
        };

        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map(|ext| ext == "txt" || ext == "csv").unwrap_or(false))
            .collect();
        files.sort();

        if files.is_empty() {
            return report;
        }
        info!("Energy import: {} file(s) in inbox", files.len());

        for path in files {
            report.files += 1;
            match self.process_file(&path) {
                Ok((count, mut errors)) => {
                    report.records += count;
                    report.errors.append(&mut errors);
                }
                Err(e) => report.errors.push(e),
            }
        }

        report
    }

    fn process_file(&self, path: &Path) -> Result<(usize, Vec<String>), String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("read {} failed: {}", path.display(), e))?;
        let filename = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let (records, mut errors) = parse_meter_file(&content, &filename, &self.synonyms);

        if records.is_empty() {
            warn!("No valid records in {}", path.display());
            self.move_file(path, "failed");
            return Ok((0, errors));
        }

        // Meter id from the first record, else the filename.
        let meter_id = records[0].meter_id.clone().unwrap_or(filename);

        let Some(target) = self.mapping.get(meter_id.trim()) else {
            let message = format!(
                "Unknown meter_id '{}' in {} - configure meter_ids on the owning entity",
                meter_id,
                path.display()
            );
            warn!("{}", message);
            errors.push(message);
            self.move_file(path, "failed");
            return Ok((0, errors));
        };

        let points: Vec<Point> = records
            .iter()
            .map(|record| {
                let mut point = Point::new("energy_meter")
                    .tag(target.kind.tag_name(), &target.entity_id)
                    .tag("meter_id", &meter_id)
                    .time(record.timestamp);
                for (field, value) in &record.values {
                    point = point.field(field.as_str(), *value);
                }
                point
            })
            .collect();

        if !self.influx.write_points(&points) {
            // Leave the file in the inbox so the next run retries it.
            return Err(format!("write of {} records from {} failed", points.len(), path.display()));
        }

        info!(
            "Imported {} records for meter {} -> {}",
            points.len(),
            meter_id,
            target.entity_id
        );
        self.move_file(path, "processed");
        Ok((points.len(), errors))
    }

    fn move_file(&self, path: &Path, folder: &str) {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("txt");
        let destination = self
            .import_dir
            .join(folder)
            .join(format!("{}_{}.{}", name, stamp, extension));
        if let Err(e) = std::fs::rename(path, &destination) {
            warn!("Failed to move {} to {}: {}", path.display(), destination.display(), e);
        }
    }
}

fn load_synonyms(import_dir: &Path) -> BTreeMap<String, String> {
    let mut synonyms: BTreeMap<String, String> = COLUMN_SYNONYMS
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let extra_path = import_dir.join("column_synonyms.json");
    if let Ok(raw) = std::fs::read_to_string(&extra_path) {
        match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
            Ok(extra) => {
                info!("Loaded {} extra column synonym(s)", extra.len());
                synonyms.extend(extra);
            }
            Err(e) => warn!("Ignoring {}: {}", extra_path.display(), e),
        }
    }

    synonyms
}

/// Parse one delimited file. Bad rows are dropped with a message, never a
/// failed file.
pub fn parse_meter_file(
    content: &str,
    filename: &str,
    synonyms: &BTreeMap<String, String>,
) -> (Vec<MeterRecord>, Vec<String>) {
    let mut records = Vec::new();
    let mut errors = Vec::new();

    // Strip a UTF-8 BOM if the exporter added one.
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut lines = content.lines();

    let Some(header) = lines.next() else {
        errors.push(format!("{}: empty file", filename));
        return (records, errors);
    };

    let columns: Vec<Option<String>> = header
        .split(';')
        .map(|h| synonyms.get(h.trim().to_lowercase().as_str()).cloned())
        .collect();

    if !columns.iter().flatten().any(|c| c == "timestamp") {
        errors.push(format!("{}: no timestamp column found", filename));
        return (records, errors);
    }

    for (line_number, line) in lines.enumerate() {
        let line_number = line_number + 2;
        if line.trim().is_empty() {
            continue;
        }

        let mut timestamp = None;
        let mut meter_id = None;
        let mut values = BTreeMap::new();

        for (cell, column) in line.split(';').zip(columns.iter()) {
            let Some(field) = column else { continue };
            let cell = cell.trim();
            match field.as_str() {
                "timestamp" => match parse_timestamp(cell) {
                    Ok(ts) => timestamp = Some(ts),
                    Err(e) => errors.push(format!("{} line {}: {}", filename, line_number, e)),
                },
                "meter_id" => meter_id = Some(cell.to_string()),
                _ => {
                    // Decimal comma is accepted.
                    match cell.replace(',', ".").parse::<f64>() {
                        Ok(value) => {
                            values.insert(field.clone(), value);
                        }
                        Err(_) => errors.push(format!(
                            "{} line {}: cannot parse '{}' as number for {}",
                            filename, line_number, cell, field
                        )),
                    }
                }
            }
        }

        match timestamp {
            Some(timestamp) => records.push(MeterRecord {
                timestamp,
                meter_id,
                values,
            }),
            None => errors.push(format!("{} line {}: missing timestamp", filename, line_number)),
        }
    }

    (records, errors)
}

/// Naive timestamps are Swedish wall-clock time; DST-ambiguous instants
/// resolve to the earlier offset.
fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    for format in TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return naive
                .and_local_timezone(Stockholm)
                .earliest()
                .map(|t| t.with_timezone(&Utc))
                .ok_or_else(|| format!("nonexistent local time: {}", value));
        }
    }
    Err(format!("cannot parse timestamp: {}", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn synonyms() -> BTreeMap<String, String> {
        COLUMN_SYNONYMS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_swedish_export_with_decimal_commas() {
        let content = "ID;Tidpunkt;Forbrukning;Framledning;Returledning\n\
                       735999;2026-01-28 14:00;12,5;85,2;45,1\n\
                       735999;2026-01-28 15:00;11,0;84,9;44,8\n";
        let (records, errors) = parse_meter_file(content, "export", &synonyms());

        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].meter_id.as_deref(), Some("735999"));
        assert_eq!(records[0].values["consumption"], 12.5);
        assert_eq!(records[0].values["temp_in"], 85.2);
        assert_eq!(records[0].values["temp_out"], 45.1);
        // 14:00 CET is 13:00 UTC.
        assert_eq!(
            records[0].timestamp,
            Utc.with_ymd_and_hms(2026, 1, 28, 13, 0, 0).unwrap()
        );
    }

    #[test]
    fn bad_rows_are_dropped_not_fatal() {
        let content = "meter_id;timestamp;consumption\n\
                       735999;2026-01-28 14:00;12.5\n\
                       735999;not-a-time;9.9\n\
                       735999;2026-01-28 16:00;abc\n";
        let (records, errors) = parse_meter_file(content, "export", &synonyms());

        // Row 3 loses its timestamp, row 4 loses one value but keeps the row.
        assert_eq!(records.len(), 2);
        assert_eq!(errors.len(), 3);
        assert!(records[1].values.is_empty());
    }

    #[test]
    fn unknown_columns_are_ignored() {
        let content = "meter_id;timestamp;consumption;internal_code\n\
                       735999;2026-01-28 14:00;12.5;XYZ\n";
        let (records, errors) = parse_meter_file(content, "export", &synonyms());
        assert!(errors.is_empty());
        assert_eq!(records[0].values.len(), 1);
    }

    #[test]
    fn missing_timestamp_column_rejects_file() {
        let content = "meter_id;consumption\n735999;12.5\n";
        let (records, errors) = parse_meter_file(content, "export", &synonyms());
        assert!(records.is_empty());
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn accepts_compact_and_iso_formats() {
        assert!(parse_timestamp("2026-01-28T14:00:00").is_ok());
        assert!(parse_timestamp("202601281400").is_ok());
        assert!(parse_timestamp("28/01/2026 14:00").is_ok());
        assert!(parse_timestamp("Jan 28 2026").is_err());
    }

    #[test]
    fn bom_is_stripped() {
        let content = "\u{feff}meter_id;timestamp;consumption\n735999;2026-01-28 14:00;1.0\n";
        let (records, _) = parse_meter_file(content, "export", &synonyms());
        assert_eq!(records.len(), 1);
    }
}
