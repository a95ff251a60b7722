//! Daily energy pipeline: import meter files, separate heating from DHW,
//! recalibrate the heat-loss coefficient.
//!
//! Each worker triggers the pipeline for its own entity on the first
//! iteration past 08:00 Swedish time. The import step drains a shared
//! inbox, so it runs under a process-wide lock and whichever worker gets
//! there first does the day's file work; the other steps are per-entity.

pub mod import;
pub mod kcalib;
pub mod separate;

use log::{info, warn};
use serde_json::json;
use std::path::Path;
use std::sync::Mutex;

use crate::entity::{EntityConfig, build_meter_mapping};
use crate::influx::InfluxWriter;
use crate::seq::EntitySeq;

pub use self::kcalib::CalibrationResult;

/// Shared pipeline state: serializes the inbox drain across workers.
pub struct EnergyPipeline {
    import_lock: Mutex<()>,
}

impl EnergyPipeline {
    pub fn new() -> EnergyPipeline {
        EnergyPipeline {
            import_lock: Mutex::new(()),
        }
    }
}

impl Default for EnergyPipeline {
    fn default() -> Self {
        EnergyPipeline::new()
    }
}

#[derive(Debug, Default)]
pub struct PipelineReport {
    pub imported_files: usize,
    pub imported_records: usize,
    pub separated_days: usize,
    pub calibration: Option<CalibrationResult>,
}

/// Run the three pipeline steps for one entity. A successful separation is
/// the precondition for recalibration here; the 72-h fallback calls
/// `kcalib::recalibrate` directly.
pub fn run_for_entity(
    pipeline: &EnergyPipeline,
    influx: &InfluxWriter,
    entity: &mut EntityConfig,
    profiles_dir: &Path,
    buildings_dir: &Path,
    import_dir: &Path,
    calibration_days: u32,
    seq: &EntitySeq,
) -> PipelineReport {
    let mut report = PipelineReport::default();

    // Step 1: drain the meter-file inbox (first worker of the day does the
    // actual work; for the rest this is an empty scan).
    {
        let _guard = pipeline.import_lock.lock().expect("import lock poisoned");
        let mapping = build_meter_mapping(profiles_dir, buildings_dir);
        let importer = import::EnergyImporter::new(influx, &mapping, import_dir);
        let imported = importer.run();
        report.imported_files = imported.files;
        report.imported_records = imported.records;

        for error in &imported.errors {
            warn!("Energy import: {}", error);
        }
        if imported.records > 0 {
            info!(
                "Energy import: {} record(s) from {} file(s)",
                imported.records, imported.files
            );
            seq.info(
                "EnergyImport",
                "Energy import completed",
                vec![
                    ("Records".to_string(), json!(imported.records)),
                    ("Files".to_string(), json!(imported.files)),
                ],
            );
        }
    }

    // Step 2: separate the last 48 h to catch late-arriving data.
    match separate::run_separation(influx, entity, 48) {
        Ok(separated) => {
            report.separated_days = separated.days_written;
            if separated.days_written > 0 {
                seq.info(
                    "EnergySeparation",
                    "Energy separated",
                    vec![("Days".to_string(), json!(separated.days_written))],
                );
            }
        }
        Err(e) => {
            warn!("Energy separation failed: {}", e);
            seq.error("EnergySeparationFailed", &e, Vec::new());
            return report;
        }
    }

    // Step 3: recalibrate k, only on fresh separation output.
    if report.separated_days == 0 {
        info!("{}: no new separation data, skipping k calibration", entity.entity_id);
        return report;
    }

    match kcalib::recalibrate(influx, entity, calibration_days, false) {
        Ok(Some(result)) => {
            seq.info(
                "KRecalibration",
                "k-value recalibrated",
                vec![
                    ("KValue".to_string(), json!((result.k_value * 1e5).round() / 1e5)),
                    ("DaysUsed".to_string(), json!(result.days_used)),
                    ("Confidence".to_string(), json!((result.confidence * 100.0).round() / 100.0)),
                ],
            );
            report.calibration = Some(result);
        }
        Ok(None) => {}
        Err(e) => {
            warn!("k recalibration failed: {}", e);
            seq.error("KRecalibrationFailed", &e, Vec::new());
        }
    }

    report
}
