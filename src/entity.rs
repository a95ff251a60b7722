//! Entity configuration records.
//!
//! One JSON file per entity: `profiles/<id>.json` for houses reached through
//! the upstream portal, `buildings/<id>.json` for commercial buildings with a
//! direct BMS connection. The supervisor scans both directories, each worker
//! re-reads its own record every iteration to pick up live edits, and the
//! k-calibrator writes `energy_separation.heat_loss_k` back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    House,
    Building,
}

impl EntityKind {
    /// Measurement the live readings are written to.
    pub fn measurement(&self) -> &'static str {
        match self {
            EntityKind::House => "heating_system",
            EntityKind::Building => "building_system",
        }
    }

    /// Kind-specific tag name kept for backward compatibility with the
    /// existing series.
    pub fn tag_name(&self) -> &'static str {
        match self {
            EntityKind::House => "house_id",
            EntityKind::Building => "building_id",
        }
    }

    pub fn default_poll_interval_minutes(&self) -> u32 {
        match self {
            EntityKind::House => 15,
            EntityKind::Building => 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// How to reach the entity's BMS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Connection {
    /// "portal" (house via upstream portal), "arrigo" (direct GraphQL),
    /// or "ebo" (EcoStruxure WebStation).
    #[serde(default)]
    pub system: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// One entry in the signal map: upstream signal to canonical field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSpec {
    pub signal_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    #[serde(default)]
    pub fetch: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_on_change: Option<bool>,
}

/// Weather coefficients learned from solar events. The `_ml2` suffix marks
/// the second-generation learned track in the stored series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherCoefficients {
    #[serde(default = "default_solar_coefficient")]
    pub solar_coefficient_ml2: f64,
    #[serde(default = "default_wind_coefficient")]
    pub wind_coefficient_ml2: f64,
    #[serde(default)]
    pub solar_confidence_ml2: f64,
    #[serde(default)]
    pub total_solar_events: u32,
    #[serde(default)]
    pub events_since_last_update: u32,
    #[serde(default = "default_first_update")]
    pub next_update_at_events: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

fn default_solar_coefficient() -> f64 {
    6.0
}
fn default_wind_coefficient() -> f64 {
    0.15
}
fn default_first_update() -> u32 {
    3
}

impl Default for WeatherCoefficients {
    fn default() -> Self {
        WeatherCoefficients {
            solar_coefficient_ml2: default_solar_coefficient(),
            wind_coefficient_ml2: default_wind_coefficient(),
            solar_confidence_ml2: 0.0,
            total_solar_events: 0,
            events_since_last_update: 0,
            next_update_at_events: default_first_update(),
            updated_at: None,
        }
    }
}

/// How quickly the building responds to effective-temperature changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalTiming {
    #[serde(default = "default_heat_up_lag")]
    pub heat_up_lag_minutes: f64,
    #[serde(default = "default_cool_down_lag")]
    pub cool_down_lag_minutes: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub total_transitions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

fn default_heat_up_lag() -> f64 {
    60.0
}
fn default_cool_down_lag() -> f64 {
    90.0
}

impl Default for ThermalTiming {
    fn default() -> Self {
        ThermalTiming {
            heat_up_lag_minutes: default_heat_up_lag(),
            cool_down_lag_minutes: default_cool_down_lag(),
            confidence: 0.0,
            total_transitions: 0,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learned {
    #[serde(default)]
    pub weather_coefficients: WeatherCoefficients,
    #[serde(default)]
    pub thermal_timing: ThermalTiming,
    #[serde(default)]
    pub hourly_bias: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thermal_coefficient: Option<f64>,
    #[serde(default)]
    pub thermal_coefficient_confidence: f64,
    #[serde(default)]
    pub total_samples: u32,
    #[serde(default)]
    pub samples_since_last_update: u32,
    #[serde(default = "default_sample_update")]
    pub next_update_at_samples: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

fn default_sample_update() -> u32 {
    24
}

impl Default for Learned {
    fn default() -> Self {
        Learned {
            weather_coefficients: WeatherCoefficients::default(),
            thermal_timing: ThermalTiming::default(),
            hourly_bias: BTreeMap::new(),
            thermal_coefficient: None,
            thermal_coefficient_confidence: 0.0,
            total_samples: 0,
            samples_since_last_update: 0,
            next_update_at_samples: default_sample_update(),
            updated_at: None,
        }
    }
}

impl Learned {
    /// Count one collected sample. Returns true when the hourly-bias update
    /// is due; the schedule backs off 24 -> 48 -> 96 samples.
    pub fn record_sample(&mut self) -> bool {
        self.samples_since_last_update += 1;
        self.total_samples += 1;

        if self.samples_since_last_update < self.next_update_at_samples {
            return false;
        }

        self.next_update_at_samples = match self.next_update_at_samples {
            24 => 48,
            48 => 96,
            other => other,
        };
        self.samples_since_last_update = 0;
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergySeparation {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_separation_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heat_loss_k: Option<f64>,
    #[serde(default = "default_k_percentile")]
    pub k_percentile: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_date: Option<String>,
    #[serde(default)]
    pub calibration_days: u32,
    /// Buildings without an indoor sensor assume a fixed indoor temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assumed_indoor_temp: Option<f64>,
    /// Canonical field name -> stored field name, for entities whose signal
    /// map uses site-specific names (e.g. outdoor_temp_fvc).
    #[serde(default)]
    pub field_mapping: BTreeMap<String, String>,
    // On-demand-DHW heuristic settings.
    #[serde(default = "default_dhw_temp_threshold")]
    pub dhw_temp_threshold: f64,
    #[serde(default = "default_dhw_rise_threshold")]
    pub dhw_temp_rise_threshold: f64,
    #[serde(default = "default_dhw_power")]
    pub avg_dhw_power_kw: f64,
}

fn default_separation_method() -> String {
    "k_calibration".to_string()
}
fn default_k_percentile() -> u32 {
    15
}
fn default_dhw_temp_threshold() -> f64 {
    45.0
}
fn default_dhw_rise_threshold() -> f64 {
    2.0
}
fn default_dhw_power() -> f64 {
    25.0
}

impl Default for EnergySeparation {
    fn default() -> Self {
        EnergySeparation {
            enabled: false,
            method: default_separation_method(),
            heat_loss_k: None,
            k_percentile: default_k_percentile(),
            calibration_date: None,
            calibration_days: 0,
            assumed_indoor_temp: None,
            field_mapping: BTreeMap::new(),
            dhw_temp_threshold: default_dhw_temp_threshold(),
            dhw_temp_rise_threshold: default_dhw_rise_threshold(),
            avg_dhw_power_kw: default_dhw_power(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlarmMonitoring {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(alias = "building_id", alias = "customer_id")]
    pub entity_id: String,
    #[serde(default)]
    pub friendly_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default)]
    pub connection: Connection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_minutes: Option<u32>,
    #[serde(default)]
    pub signal_map: BTreeMap<String, SignalSpec>,
    #[serde(default)]
    pub energy_separation: EnergySeparation,
    #[serde(default)]
    pub learned: Learned,
    #[serde(default)]
    pub meter_ids: Vec<String>,
    #[serde(default)]
    pub alarm_monitoring: AlarmMonitoring,

    #[serde(skip)]
    pub kind: EntityKind,
    #[serde(skip)]
    pub path: PathBuf,
}

fn default_schema_version() -> u32 {
    1
}

impl Default for EntityKind {
    fn default() -> Self {
        EntityKind::House
    }
}

impl EntityConfig {
    /// Load a record, tagging it with its kind and source path. Parse errors
    /// report the offending JSON field.
    pub fn load(path: &Path, kind: EntityKind) -> Result<EntityConfig, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("read {} failed: {}", path.display(), e))?;
        let de = &mut serde_json::Deserializer::from_str(&raw);
        let mut config: EntityConfig = serde_path_to_error::deserialize(de)
            .map_err(|e| format!("parse {} failed at {}: {}", path.display(), e.path(), e))?;
        config.kind = kind;
        config.path = path.to_path_buf();
        if config.friendly_name.is_empty() {
            config.friendly_name = config.entity_id.clone();
        }
        Ok(config)
    }

    /// Atomic rewrite: serialize to a sibling temp file, then rename over the
    /// record so a killed process never leaves a half-written file.
    pub fn save(&self) -> Result<(), String> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("serialize {} failed: {}", self.entity_id, e))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| format!("write {} failed: {}", tmp.display(), e))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| format!("rename {} failed: {}", self.path.display(), e))
    }

    pub fn poll_interval_minutes(&self) -> u32 {
        self.poll_interval_minutes
            .unwrap_or_else(|| self.kind.default_poll_interval_minutes())
            .max(1)
    }

    /// Signals to read every tick: name -> (signal id, canonical field name).
    pub fn fetch_signals(&self) -> BTreeMap<String, (String, String)> {
        self.signal_map
            .iter()
            .filter(|(_, spec)| spec.fetch)
            .map(|(name, spec)| {
                let field = spec.field_name.clone().unwrap_or_else(|| name.clone());
                (name.clone(), (spec.signal_id.clone(), field))
            })
            .collect()
    }

    /// Stored field name for a canonical field, honoring the entity's
    /// energy-separation field mapping.
    pub fn mapped_field(&self, canonical: &str) -> String {
        self.energy_separation
            .field_mapping
            .get(canonical)
            .cloned()
            .unwrap_or_else(|| canonical.to_string())
    }

    /// Identity the supervisor uses to decide restart-vs-live-edit: a worker
    /// is restarted when the kind, connection target, or credentials change.
    pub fn worker_identity(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.kind.tag_name(),
            self.connection.system,
            self.connection.host.as_deref().unwrap_or(""),
            self.connection.base_url.as_deref().unwrap_or(""),
            self.connection.credential_ref.as_deref().unwrap_or("")
        )
    }

}

/// Scan one config directory. Unreadable or invalid files are logged and
/// skipped so one broken record never takes down the rest.
pub fn scan_dir(dir: &Path, kind: EntityKind) -> Vec<EntityConfig> {
    let mut entities = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return entities,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if !name.ends_with(".json") || name.ends_with("_signals.json") || name.ends_with(".json.tmp") {
            continue;
        }
        match EntityConfig::load(&path, kind) {
            Ok(config) => entities.push(config),
            Err(e) => log::warn!("Skipping entity config {}: {}", path.display(), e),
        }
    }

    entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    entities
}

// ── Credentials ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub domain: String,
}

/// Resolve BMS credentials for an entity, in order:
/// `BMS_USERNAME`/`BMS_PASSWORD` -> `<credential_ref>_USERNAME`/`_PASSWORD`
/// (+ `_DOMAIN`) -> legacy `BUILDING_<id>_USERNAME`/`_PASSWORD` -> legacy
/// `ARRIGO_USERNAME`/`ARRIGO_PASSWORD`. Missing credentials are fatal for
/// this entity only.
pub fn resolve_credentials(entity: &EntityConfig) -> Result<Credentials, String> {
    let mut username = env_nonempty("BMS_USERNAME");
    let mut password = env_nonempty("BMS_PASSWORD");
    let mut domain = entity.connection.domain.clone();

    if let Some(credential_ref) = entity.connection.credential_ref.as_deref() {
        if username.is_none() {
            username = env_nonempty(&format!("{}_USERNAME", credential_ref));
        }
        if password.is_none() {
            password = env_nonempty(&format!("{}_PASSWORD", credential_ref));
        }
        if domain.is_none() {
            domain = env_nonempty(&format!("{}_DOMAIN", credential_ref));
        }
    }

    if username.is_none() {
        username = env_nonempty(&format!("BUILDING_{}_USERNAME", entity.entity_id));
    }
    if password.is_none() {
        password = env_nonempty(&format!("BUILDING_{}_PASSWORD", entity.entity_id));
    }

    if username.is_none() {
        username = env_nonempty("ARRIGO_USERNAME");
    }
    if password.is_none() {
        password = env_nonempty("ARRIGO_PASSWORD");
    }

    match (username, password) {
        (Some(username), Some(password)) => Ok(Credentials {
            username,
            password,
            domain: domain.unwrap_or_default(),
        }),
        _ => Err(format!(
            "no credentials for {}: set BMS_USERNAME/BMS_PASSWORD or a credential_ref",
            entity.entity_id
        )),
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

// ── Meter mapping ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MeterTarget {
    pub entity_id: String,
    pub kind: EntityKind,
    pub friendly_name: String,
}

/// meter_id -> owning entity, built from all records in both directories.
/// Env vars `HOUSE_<id>_METER_IDS` / `BUILDING_<id>_METER_IDS` take
/// precedence over the record's own `meter_ids` list. Duplicate meter ids
/// keep the first mapping and log the conflict.
pub fn build_meter_mapping(profiles_dir: &Path, buildings_dir: &Path) -> BTreeMap<String, MeterTarget> {
    let mut mapping: BTreeMap<String, MeterTarget> = BTreeMap::new();

    let mut add = |meter_id: &str, target: MeterTarget| {
        let meter_id = meter_id.trim();
        if meter_id.is_empty() {
            return;
        }
        if let Some(existing) = mapping.get(meter_id) {
            log::warn!(
                "Duplicate meter_id {}: already mapped to {}, ignoring mapping to {}",
                meter_id,
                existing.entity_id,
                target.entity_id
            );
        } else {
            mapping.insert(meter_id.to_string(), target);
        }
    };

    for (dir, kind, env_prefix) in [
        (profiles_dir, EntityKind::House, "HOUSE"),
        (buildings_dir, EntityKind::Building, "BUILDING"),
    ] {
        for entity in scan_dir(dir, kind) {
            let env_key = format!("{}_{}_METER_IDS", env_prefix, entity.entity_id);
            let meter_ids: Vec<String> = match env_nonempty(&env_key) {
                Some(value) => value.split(',').map(|m| m.trim().to_string()).collect(),
                None => entity.meter_ids.clone(),
            };
            for meter_id in meter_ids {
                add(
                    &meter_id,
                    MeterTarget {
                        entity_id: entity.entity_id.clone(),
                        kind,
                        friendly_name: entity.friendly_name.clone(),
                    },
                );
            }
        }
    }

    mapping
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_entity(dir: &Path, name: &str, json: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, json).unwrap();
        path
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bms-influx-entity-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    const HOUSE_JSON: &str = r#"{
        "schema_version": 1,
        "entity_id": "HEM_FJV_Villa_149",
        "friendly_name": "Daggis8",
        "location": {"latitude": 58.41, "longitude": 15.62},
        "connection": {"system": "portal", "host": "portal.example.se"},
        "poll_interval_minutes": 15,
        "signal_map": {
            "GT_UTE": {"signal_id": "c2lnMQ==", "field_name": "outdoor_temperature", "fetch": true},
            "GT_RUM": {"signal_id": "c2lnMg==", "field_name": "room_temperature", "fetch": true},
            "GT_EXTRA": {"signal_id": "c2lnMw==", "fetch": false}
        },
        "energy_separation": {"enabled": true, "heat_loss_k": 0.0685},
        "meter_ids": ["735999"]
    }"#;

    #[test]
    fn load_fills_defaults_and_identity() {
        let dir = temp_dir("load");
        let path = write_entity(&dir, "HEM_FJV_Villa_149.json", HOUSE_JSON);
        let entity = EntityConfig::load(&path, EntityKind::House).unwrap();

        assert_eq!(entity.entity_id, "HEM_FJV_Villa_149");
        assert_eq!(entity.kind.measurement(), "heating_system");
        assert_eq!(entity.kind.tag_name(), "house_id");
        assert_eq!(entity.poll_interval_minutes(), 15);
        assert_eq!(entity.learned.weather_coefficients.solar_coefficient_ml2, 6.0);
        assert_eq!(entity.learned.weather_coefficients.next_update_at_events, 3);
        assert_eq!(entity.energy_separation.k_percentile, 15);
        assert_eq!(entity.energy_separation.heat_loss_k, Some(0.0685));
    }

    #[test]
    fn building_id_alias_is_accepted() {
        let dir = temp_dir("alias");
        let json = r#"{"building_id": "TE236_HEM_Kontor", "connection": {"system": "arrigo", "host": "x"}}"#;
        let path = write_entity(&dir, "TE236_HEM_Kontor.json", json);
        let entity = EntityConfig::load(&path, EntityKind::Building).unwrap();
        assert_eq!(entity.entity_id, "TE236_HEM_Kontor");
        assert_eq!(entity.poll_interval_minutes(), 5);
        assert_eq!(entity.kind.tag_name(), "building_id");
    }

    #[test]
    fn fetch_signals_filters_and_maps() {
        let dir = temp_dir("fetch");
        let path = write_entity(&dir, "HEM_FJV_Villa_149.json", HOUSE_JSON);
        let entity = EntityConfig::load(&path, EntityKind::House).unwrap();
        let fetch = entity.fetch_signals();
        assert_eq!(fetch.len(), 2);
        assert_eq!(fetch["GT_UTE"].1, "outdoor_temperature");
        // A signal without a field_name falls back to its own name.
        assert!(!fetch.contains_key("GT_EXTRA"));
    }

    #[test]
    fn save_round_trips_heat_loss_k() {
        let dir = temp_dir("save");
        let path = write_entity(&dir, "HEM_FJV_Villa_149.json", HOUSE_JSON);
        let mut entity = EntityConfig::load(&path, EntityKind::House).unwrap();
        entity.energy_separation.heat_loss_k = Some(0.07123);
        entity.energy_separation.calibration_date = Some("2026-02-01".to_string());
        entity.save().unwrap();

        let reloaded = EntityConfig::load(&path, EntityKind::House).unwrap();
        assert_eq!(reloaded.energy_separation.heat_loss_k, Some(0.07123));
        assert_eq!(reloaded.energy_separation.calibration_date.as_deref(), Some("2026-02-01"));
        // Signal map survives the write-back untouched.
        assert_eq!(reloaded.signal_map.len(), 3);
    }

    #[test]
    fn scan_skips_broken_and_helper_files() {
        let dir = temp_dir("scan");
        write_entity(&dir, "ok.json", HOUSE_JSON);
        write_entity(&dir, "broken.json", "{not json");
        write_entity(&dir, "ok_signals.json", "{}");
        let entities = scan_dir(&dir, EntityKind::House);
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].entity_id, "HEM_FJV_Villa_149");
    }

    #[test]
    fn credential_ref_env_vars_resolve() {
        let dir = temp_dir("creds");
        let json = r#"{
            "building_id": "CRED_TEST_B1",
            "connection": {"system": "ebo", "base_url": "https://ebo.example.se", "credential_ref": "CRED_TEST_REF"}
        }"#;
        let path = write_entity(&dir, "CRED_TEST_B1.json", json);
        let entity = EntityConfig::load(&path, EntityKind::Building).unwrap();

        // SAFETY: test-local env names, not read by other tests.
        unsafe {
            std::env::set_var("CRED_TEST_REF_USERNAME", "ref-user");
            std::env::set_var("CRED_TEST_REF_PASSWORD", "ref-pass");
            std::env::set_var("CRED_TEST_REF_DOMAIN", "hbg");
        }
        let creds = resolve_credentials(&entity).unwrap();
        assert_eq!(creds.username, "ref-user");
        assert_eq!(creds.password, "ref-pass");
        assert_eq!(creds.domain, "hbg");
        unsafe {
            std::env::remove_var("CRED_TEST_REF_USERNAME");
            std::env::remove_var("CRED_TEST_REF_PASSWORD");
            std::env::remove_var("CRED_TEST_REF_DOMAIN");
        }
    }

    #[test]
    fn missing_credentials_are_an_error() {
        let dir = temp_dir("nocreds");
        let json = r#"{"building_id": "NOCRED_B1", "connection": {"system": "arrigo", "host": "x"}}"#;
        let path = write_entity(&dir, "NOCRED_B1.json", json);
        let entity = EntityConfig::load(&path, EntityKind::Building).unwrap();
        assert!(resolve_credentials(&entity).is_err());
    }

    #[test]
    fn meter_mapping_from_record_and_env() {
        let profiles = temp_dir("meters-p");
        let buildings = temp_dir("meters-b");
        write_entity(&profiles, "HEM_FJV_Villa_149.json", HOUSE_JSON);
        write_entity(
            &buildings,
            "METER_TEST_B1.json",
            r#"{"building_id": "METER_TEST_B1", "connection": {"system": "arrigo", "host": "x"}}"#,
        );
        unsafe {
            std::env::set_var("BUILDING_METER_TEST_B1_METER_IDS", "4401, 4402");
        }

        let mapping = build_meter_mapping(&profiles, &buildings);
        assert_eq!(mapping["735999"].entity_id, "HEM_FJV_Villa_149");
        assert_eq!(mapping["4401"].entity_id, "METER_TEST_B1");
        assert_eq!(mapping["4402"].kind.tag_name(), "building_id");

        unsafe {
            std::env::remove_var("BUILDING_METER_TEST_B1_METER_IDS");
        }
    }
}
