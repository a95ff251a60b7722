//! Per-entity worker: the boundary-aligned collection loop.
//!
//! One worker per configured entity, running on its own thread. Every
//! iteration authenticates as needed, reads the live signals, normalizes
//! and writes them, enriches with weather and the ML2 learners, and on the
//! right cadences refreshes forecasts and runs the daily energy pipeline.
//! Transient failures are tracked by wall-clock duration and escalate to
//! error level after the configured threshold; recovery is reported
//! explicitly.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use log::{debug, error, info, warn};
use rand::Rng;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::bms::BmsClient;
use crate::config::Config;
use crate::energy::{self, EnergyPipeline};
use crate::energy_model::{WeatherModel, WeatherSample};
use crate::entity::{EntityConfig, EntityKind, resolve_credentials};
use crate::forecast::{self, EnergyForecaster};
use crate::gapfill;
use crate::influx::{InfluxWriter, Point};
use crate::ml2::WeatherLearner;
use crate::seq::{EntitySeq, SeqLogger};
use crate::sun;
use crate::tempforecast::IndoorForecaster;
use crate::thermal::{ThermalAnalyzer, ThermalSample};
use crate::utils::{aligned_boundary, round_to, seconds_to_next_boundary, stockholm_date, stockholm_hour};
use crate::weather::{SmhiClient, cache::SharedWeatherCache};

const FORECAST_INTERVAL_MINUTES: i64 = 120;
const FORECAST_HOURS: u32 = 72;
const FAILURE_ERROR_THRESHOLD_MINUTES: i64 = 120;
const RECALIBRATION_FALLBACK_HOURS: i64 = 72;
const CALIBRATION_DAYS: u32 = 30;
const MAX_START_JITTER_SECONDS: u32 = 30;
const TARGET_INDOOR_TEMP: f64 = 22.0;
const TEMP_MARGIN: f64 = 0.5;
const OBSERVATION_BUFFER_HOURS: usize = 24;

/// Shared services and control flags handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Config,
    pub influx: Arc<InfluxWriter>,
    pub weather_cache: Arc<SharedWeatherCache>,
    pub seq: Arc<SeqLogger>,
    pub pipeline: Arc<EnergyPipeline>,
    /// Process-wide shutdown.
    pub shutdown: Arc<AtomicBool>,
    /// Per-worker retirement, owned by the supervisor.
    pub stop: Arc<AtomicBool>,
}

impl WorkerContext {
    fn should_stop(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed) || self.stop.load(Ordering::Relaxed)
    }
}

struct Worker {
    ctx: WorkerContext,
    path: PathBuf,
    kind: EntityKind,
    entity: EntityConfig,
    bms: BmsClient,
    seq: EntitySeq,
    learner: WeatherLearner,
    smhi: Option<SmhiClient>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    jitter_seconds: u32,

    thermal: ThermalAnalyzer,
    indoor_forecaster: IndoorForecaster,
    /// (target time, predicted indoor) of the nearest unresolved prediction.
    last_indoor_prediction: Option<(DateTime<Utc>, f64)>,

    cached_forecast: Vec<crate::weather::ForecastPoint>,
    last_forecast_at: Option<DateTime<Utc>>,
    first_failure_at: Option<DateTime<Utc>>,
    last_pipeline_date: Option<NaiveDate>,
    last_recalibration_at: DateTime<Utc>,
    iteration: u64,
}

/// Thread entry point. Returns when the worker is retired or the process
/// shuts down; a fatal per-entity setup problem (bad config, missing
/// credentials) also ends the worker without touching its siblings.
pub fn run_worker(ctx: WorkerContext, path: PathBuf, kind: EntityKind) {
    let entity = match EntityConfig::load(&path, kind) {
        Ok(entity) => entity,
        Err(e) => {
            error!("Worker not started: {}", e);
            return;
        }
    };
    let entity_id = entity.entity_id.clone();

    let mut worker = match Worker::new(ctx, path, kind, entity) {
        Ok(worker) => worker,
        Err(e) => {
            error!("Worker {} not started: {}", entity_id, e);
            return;
        }
    };

    worker.startup();
    worker.run();
    worker.bms.close();
    info!("Worker {} stopped", entity_id);
}

impl Worker {
    fn new(ctx: WorkerContext, path: PathBuf, kind: EntityKind, entity: EntityConfig) -> Result<Worker, String> {
        let credentials = resolve_credentials(&entity)?;
        let bms = BmsClient::from_entity(&entity, &credentials)?;

        let latitude = entity
            .location
            .as_ref()
            .map(|l| l.latitude)
            .or(ctx.config.default_latitude);
        let longitude = entity
            .location
            .as_ref()
            .map(|l| l.longitude)
            .or(ctx.config.default_longitude);
        let smhi = match (latitude, longitude) {
            (Some(lat), Some(lon)) => Some(SmhiClient::new(lat, lon)),
            _ => None,
        };

        let learner = WeatherLearner::new(
            latitude.unwrap_or(0.0),
            longitude.unwrap_or(0.0),
            entity.learned.weather_coefficients.clone(),
            entity.learned.thermal_timing.clone(),
            OBSERVATION_BUFFER_HOURS,
        );

        let seq = EntitySeq::new(
            ctx.seq.clone(),
            "Worker",
            &entity.entity_id,
            &entity.friendly_name,
        );

        let jitter_seconds = rand::thread_rng().gen_range(0..=MAX_START_JITTER_SECONDS);

        Ok(Worker {
            ctx,
            path,
            kind,
            entity,
            bms,
            seq,
            learner,
            smhi,
            latitude,
            longitude,
            jitter_seconds,
            thermal: ThermalAnalyzer::new(),
            indoor_forecaster: IndoorForecaster::new(),
            last_indoor_prediction: None,
            cached_forecast: Vec::new(),
            last_forecast_at: None,
            first_failure_at: None,
            last_pipeline_date: None,
            last_recalibration_at: Utc::now(),
            iteration: 0,
        })
    }

    /// One-time startup work before the first aligned tick: session, data
    /// freshness report, gap repair.
    fn startup(&mut self) {
        info!(
            "Worker {} starting ({}, every {} min, jitter {}s)",
            self.entity.entity_id,
            self.entity.connection.system,
            self.entity.poll_interval_minutes(),
            self.jitter_seconds + self.ctx.config.poll_offset_seconds
        );

        if let Err(e) = self.bms.authenticate() {
            warn!("{}: initial authentication failed: {}", self.entity.entity_id, e);
        }

        self.report_staleness();
        self.seed_thermal_history();

        // checking -> filling -> normal; best-effort and resumable, the
        // first boundary tick is never blocked for long.
        let report = gapfill::fill_gaps_on_startup(
            &self.ctx.influx,
            &self.entity,
            &mut self.bms,
            self.smhi.as_mut(),
        );
        if report.written > 0 {
            self.seq.info(
                "GapFillCompleted",
                "Gap fill completed",
                vec![
                    ("Written".to_string(), json!(report.written)),
                    ("Skipped".to_string(), json!(report.skipped)),
                    ("Errors".to_string(), json!(report.errors)),
                ],
            );
        }
    }

    /// Reseed the thermal analyzer from the persisted mirror so the
    /// coefficient survives restarts.
    fn seed_thermal_history(&mut self) {
        let stop = Utc::now();
        let start = stop - ChronoDuration::days(7);
        match self.ctx.influx.fields_by_time(
            "thermal_history",
            self.kind.tag_name(),
            &self.entity.entity_id,
            start,
            stop,
        ) {
            Ok(rows) => {
                let samples: Vec<ThermalSample> = rows
                    .into_iter()
                    .filter_map(|(ts, fields)| {
                        Some(ThermalSample {
                            timestamp: ts,
                            room_temp: *fields.get("room_temperature")?,
                            outdoor_temp: *fields.get("outdoor_temperature")?,
                            heating_active: fields
                                .get("electric_heater")
                                .map(|v| *v != 0.0)
                                .unwrap_or(false),
                        })
                    })
                    .collect();
                if !samples.is_empty() {
                    info!(
                        "{}: thermal analyzer seeded with {} historical point(s)",
                        self.entity.entity_id,
                        samples.len()
                    );
                    self.thermal.seed(samples);
                }
            }
            Err(e) => debug!("{}: thermal history read failed: {}", self.entity.entity_id, e),
        }
    }

    fn report_staleness(&self) {
        let indoor = self.entity.mapped_field("room_temperature");
        let outdoor = self.entity.mapped_field("outdoor_temperature");
        let checks: [(&str, Vec<&str>, i64); 3] = [
            (
                self.kind.measurement(),
                vec![indoor.as_str(), outdoor.as_str()],
                self.entity.poll_interval_minutes() as i64,
            ),
            ("weather_forecast", vec!["current_temp"], FORECAST_INTERVAL_MINUTES),
            ("temperature_forecast", vec!["value"], FORECAST_INTERVAL_MINUTES),
        ];

        for (measurement, fields, expected_minutes) in checks {
            let last = self.ctx.influx.last_timestamp(
                measurement,
                self.kind.tag_name(),
                &self.entity.entity_id,
                &fields,
                30,
            );
            match last {
                None => info!("[staleness] {}: no historical data for {}", measurement, self.entity.entity_id),
                Some(last) => {
                    let age_minutes = (Utc::now() - last).num_minutes();
                    if age_minutes > expected_minutes * 2 {
                        info!(
                            "[staleness] {}: last data {}m ago (expected every {}m)",
                            measurement, age_minutes, expected_minutes
                        );
                    }
                }
            }
        }
    }

    fn run(&mut self) {
        loop {
            // Sleep to the next aligned boundary, waking for shutdown.
            let sleep_seconds = seconds_to_next_boundary(
                Utc::now(),
                self.entity.poll_interval_minutes(),
                self.ctx.config.poll_offset_seconds + self.jitter_seconds,
            );
            if !self.interruptible_sleep(sleep_seconds) {
                return;
            }

            // Pick up live config edits; a deleted record retires the worker.
            match EntityConfig::load(&self.path, self.kind) {
                Ok(mut fresh) => {
                    let old_interval = self.entity.poll_interval_minutes();
                    // The learned block is worker-owned in-memory state and
                    // only reaches disk at save points; keep it across the
                    // reload so counters are not rolled back.
                    fresh.learned = self.entity.learned.clone();
                    self.entity = fresh;
                    if self.entity.poll_interval_minutes() != old_interval {
                        info!(
                            "{}: poll interval changed {} -> {} min",
                            self.entity.entity_id,
                            old_interval,
                            self.entity.poll_interval_minutes()
                        );
                    }
                }
                Err(e) => {
                    info!("{}: config no longer readable ({}), retiring", self.entity.entity_id, e);
                    return;
                }
            }

            self.iteration += 1;
            let t0 = aligned_boundary(Utc::now(), self.entity.poll_interval_minutes());
            debug!("{}: iteration {} at {}", self.entity.entity_id, self.iteration, t0);

            let succeeded = match self.iterate(t0) {
                Ok(()) => true,
                Err(e) => {
                    warn!("{}: iteration failed: {}", self.entity.entity_id, e);
                    false
                }
            };
            self.track_failures(succeeded, t0);

            if self.ctx.should_stop() {
                return;
            }

            // Daily bookkeeping runs even when the iteration failed, except
            // the pipeline which wants a healthy entity first.
            if succeeded {
                self.maybe_run_daily_pipeline(t0);
            }
            self.maybe_run_fallback_recalibration(t0);

            if self.ctx.should_stop() {
                return;
            }
        }
    }

    /// One full iteration at boundary `t0`.
    fn iterate(&mut self, t0: DateTime<Utc>) -> Result<(), String> {
        // 1-2. Authenticated read of all fetch-enabled signals.
        let raw = self.collect_values()?;

        // 3. Normalize: canonical names are applied by the adapter, values
        // round to 4 decimals.
        let mut values: BTreeMap<String, f64> =
            raw.into_iter().map(|(field, value)| (field, round_to(value, 4))).collect();

        // 4. The live record for this boundary.
        self.write_measurement(&values, t0)?;

        // 5. Weather observation, shared cache first.
        let observation = self.acquire_weather_observation();

        // 6. Effective temperature, derived from the entity's own outdoor
        // sensor plus observed wind/humidity.
        self.write_effective_temperature(&mut values, observation.as_ref(), t0);

        // 7. Solar event detection and the other ML2 learners.
        self.run_learners(&values, observation.as_ref(), t0);
        self.run_thermal_learning(&values, t0);

        // 8. Forecast cadence.
        let due = self
            .last_forecast_at
            .map(|at| t0 - at >= ChronoDuration::minutes(FORECAST_INTERVAL_MINUTES))
            .unwrap_or(true);
        if due && self.smhi.is_some() {
            match self.run_forecast_cycle(&values, t0) {
                Ok(()) => self.last_forecast_at = Some(t0),
                Err(e) => warn!("{}: forecast cycle failed: {}", self.entity.entity_id, e),
            }
        }

        self.seq.info(
            "DataCollected",
            "Data collected",
            vec![
                ("Iteration".to_string(), json!(self.iteration)),
                ("VariableCount".to_string(), json!(values.len())),
            ],
        );
        Ok(())
    }

    /// Read current values with the retry ladder: one token refresh on 401
    /// or an empty variable set, one plain retry on transient errors, no
    /// retry on permanent auth failures.
    fn collect_values(&mut self) -> Result<BTreeMap<String, f64>, String> {
        let signals = self.entity.fetch_signals();
        if signals.is_empty() {
            return Err("no signals configured for fetching".to_string());
        }

        match self.bms.read_current_values(&signals) {
            Ok(values) if !values.is_empty() => Ok(values),
            Ok(_) => {
                // Zero variables with a 200: consistent with a stale token.
                info!("{}: zero variables returned, refreshing session", self.entity.entity_id);
                self.refresh_session()?;
                let values = self
                    .bms
                    .read_current_values(&signals)
                    .map_err(|e| format!("read after refresh failed: {}", e))?;
                if values.is_empty() {
                    Err("no variables matched after session refresh".to_string())
                } else {
                    Ok(values)
                }
            }
            Err(e) if e.is_auth() => {
                info!("{}: authorization failure, refreshing session", self.entity.entity_id);
                self.refresh_session()?;
                self.bms
                    .read_current_values(&signals)
                    .map_err(|e| format!("read after refresh failed: {}", e))
            }
            Err(e) if e.is_permanent_auth() => {
                error!("{}: {}", self.entity.entity_id, e);
                self.seq.error("AuthFailed", &e.to_string(), Vec::new());
                Err(e.to_string())
            }
            Err(first) => {
                // Transient: retry once within the iteration.
                debug!("{}: read failed ({}), retrying once", self.entity.entity_id, first);
                self.bms
                    .read_current_values(&signals)
                    .map_err(|retry| format!("read failed twice: {} / {}", first, retry))
            }
        }
    }

    fn refresh_session(&mut self) -> Result<(), String> {
        match self.bms.authenticate() {
            Ok(()) => {
                self.seq.info("TokenRefreshed", "Session token refreshed", Vec::new());
                Ok(())
            }
            Err(e) => {
                self.seq.error("TokenRefreshFailed", &e.to_string(), Vec::new());
                Err(format!("token refresh failed: {}", e))
            }
        }
    }

    fn write_measurement(&self, values: &BTreeMap<String, f64>, t0: DateTime<Utc>) -> Result<(), String> {
        let mut point = Point::new(self.kind.measurement())
            .tag(self.kind.tag_name(), &self.entity.entity_id)
            .time(t0);
        for (field, value) in values {
            point = point.field(field.as_str(), *value);
        }
        if !self.ctx.influx.write_point(point) {
            return Err("time-series write failed or skipped".to_string());
        }

        // Mirror the thermal core so restarted learners can reseed.
        let indoor = values.get(self.entity.mapped_field("room_temperature").as_str());
        let outdoor = values.get(self.entity.mapped_field("outdoor_temperature").as_str());
        if let (Some(indoor), Some(outdoor)) = (indoor, outdoor) {
            let thermal = Point::new("thermal_history")
                .tag(self.kind.tag_name(), &self.entity.entity_id)
                .field("room_temperature", round_to(*indoor, 2))
                .field("outdoor_temperature", round_to(*outdoor, 2))
                .field_opt(
                    "supply_temp",
                    values.get(self.entity.mapped_field("supply_temp").as_str()).copied(),
                )
                .field_opt(
                    "return_temp",
                    values.get(self.entity.mapped_field("return_temp").as_str()).copied(),
                )
                .time(t0);
            self.ctx.influx.write_point(thermal);
        }

        Ok(())
    }

    /// Shared cache first, SMHI otherwise. Fresh fetches go to the entity
    /// series first and then refresh the cache, so the cache ends the
    /// iteration holding the newest value for this coordinate.
    fn acquire_weather_observation(&mut self) -> Option<crate::weather::Observation> {
        let (lat, lon) = (self.latitude?, self.longitude?);
        let max_age = Duration::from_secs(self.entity.poll_interval_minutes() as u64 * 60);

        if let Some(cached) = self.ctx.weather_cache.observation(lat, lon, max_age) {
            debug!("{}: weather from shared cache", self.entity.entity_id);
            return Some(cached);
        }

        let observation = self.smhi.as_mut()?.current_observation()?;
        let point = Point::new("weather_observation")
            .tag(self.kind.tag_name(), &self.entity.entity_id)
            .tag("station_name", &observation.station_name)
            .tag("station_id", &observation.station_id.to_string())
            .field_opt("temperature", observation.temperature.map(|v| round_to(v, 2)))
            .field("distance_km", round_to(observation.distance_km, 2))
            .field_opt("wind_speed", observation.wind_speed.map(|v| round_to(v, 2)))
            .field_opt("humidity", observation.humidity.map(|v| round_to(v, 2)))
            .time(observation.timestamp);
        self.ctx.influx.write_point(point);

        self.ctx.weather_cache.store_observation(lat, lon, observation.clone());
        Some(observation)
    }

    fn cloud_cover_estimate(&self) -> f64 {
        // The nearest forecast hour is the best cloud estimate between
        // forecast refreshes; half-covered sky otherwise.
        self.cached_forecast
            .first()
            .and_then(|p| p.cloud_cover)
            .unwrap_or(4.0)
    }

    fn weather_model(&self) -> WeatherModel {
        let learned = &self.learner.coefficients;
        if learned.solar_confidence_ml2 >= 0.3 {
            WeatherModel::with_learned(learned.solar_coefficient_ml2, learned.wind_coefficient_ml2)
        } else {
            WeatherModel::default()
        }
    }

    fn write_effective_temperature(
        &self,
        values: &mut BTreeMap<String, f64>,
        observation: Option<&crate::weather::Observation>,
        t0: DateTime<Utc>,
    ) {
        let outdoor_field = self.entity.mapped_field("outdoor_temperature");
        let Some(outdoor) = values.get(outdoor_field.as_str()).copied() else {
            return;
        };

        let sample = WeatherSample {
            timestamp: t0,
            temperature: outdoor,
            wind_speed: observation.and_then(|o| o.wind_speed).unwrap_or(3.0),
            humidity: observation.and_then(|o| o.humidity).unwrap_or(60.0),
            cloud_cover: self.cloud_cover_estimate(),
            latitude: self.latitude,
            longitude: self.longitude,
        };
        let result = self.weather_model().effective_temperature(&sample);

        let point = Point::new(self.kind.measurement())
            .tag(self.kind.tag_name(), &self.entity.entity_id)
            .field("effective_temp", round_to(result.effective_temp, 2))
            .field("effective_temp_wind_effect", round_to(result.wind_effect, 2))
            .field("effective_temp_solar_effect", round_to(result.solar_effect, 2))
            .time(t0);
        self.ctx.influx.write_point(point);

        values.insert("effective_temp".to_string(), round_to(result.effective_temp, 2));
    }

    fn run_learners(
        &mut self,
        values: &BTreeMap<String, f64>,
        observation: Option<&crate::weather::Observation>,
        t0: DateTime<Utc>,
    ) {
        let supply = values.get(self.entity.mapped_field("supply_temp").as_str());
        let return_temp = values.get(self.entity.mapped_field("return_temp").as_str());
        let room = values.get(self.entity.mapped_field("room_temperature").as_str());
        let outdoor = values.get(self.entity.mapped_field("outdoor_temperature").as_str());

        let (Some(supply), Some(return_temp), Some(room), Some(outdoor)) =
            (supply, return_temp, room, outdoor)
        else {
            debug!("{}: learner inputs incomplete this tick", self.entity.entity_id);
            return;
        };

        let wind = observation.and_then(|o| o.wind_speed).unwrap_or(3.0);
        let outcome = self.learner.process_observation(
            t0,
            *supply,
            *return_temp,
            *room,
            *outdoor,
            self.cloud_cover_estimate(),
            wind,
        );

        let mut learned_changed = false;

        if let Some(event) = &outcome.solar_event {
            let point = Point::new("solar_event_ml2")
                .tag(self.kind.tag_name(), &self.entity.entity_id)
                .field("duration_minutes", round_to(event.duration_minutes, 1))
                .field("avg_supply_return_delta", round_to(event.avg_supply_return_delta, 2))
                .field("avg_outdoor_temp", round_to(event.avg_outdoor_temp, 1))
                .field("avg_indoor_temp", round_to(event.avg_indoor_temp, 1))
                .field("avg_cloud_cover", round_to(event.avg_cloud_cover, 1))
                .field("avg_sun_elevation", round_to(event.avg_sun_elevation, 1))
                .field("avg_wind_speed", round_to(event.avg_wind_speed, 1))
                .field("implied_solar_coefficient_ml2", round_to(event.implied_solar_coefficient, 1))
                .field("observations_count", event.observations_count as i64)
                .field("peak_sun_elevation", round_to(event.peak_sun_elevation, 1))
                .field("sensor_detected", event.sensor_detected)
                .time(event.start);
            self.ctx.influx.write_point(point);
            self.seq.info(
                "SolarEventDetected",
                "Solar event detected",
                vec![
                    ("DurationMinutes".to_string(), json!(round_to(event.duration_minutes, 1))),
                    ("ImpliedCoefficient".to_string(), json!(round_to(event.implied_solar_coefficient, 1))),
                ],
            );
            learned_changed = true;
        }

        if self.learner.should_update_coefficients() {
            let updated = self.learner.update_coefficients(t0);
            let point = Point::new("weather_coefficients_ml2")
                .tag(self.kind.tag_name(), &self.entity.entity_id)
                .field("solar_coefficient_ml2", updated.solar_coefficient_ml2)
                .field("wind_coefficient_ml2", updated.wind_coefficient_ml2)
                .field("solar_confidence_ml2", updated.solar_confidence_ml2)
                .field("total_solar_events", updated.total_solar_events as i64)
                .time(t0);
            self.ctx.influx.write_point(point);
            learned_changed = true;
        }

        if let Some(warning) = &outcome.early_warning {
            info!(
                "{}: solar early warning (+{:.1} from baseline, ~{:.0} min lead)",
                self.entity.entity_id, warning.outdoor_rise, warning.estimated_lead_minutes
            );
            self.seq.info(
                "SolarEarlyWarning",
                "Solar heating detected on outdoor sensor",
                vec![("OutdoorRise".to_string(), json!(round_to(warning.outdoor_rise, 1)))],
            );
        }

        if outcome.thermal_lag.is_some() {
            learned_changed = true;
        }

        // Learned state lives in the entity record; write back on change so
        // a restart resumes where learning left off.
        if learned_changed {
            self.entity.learned.weather_coefficients = self.learner.coefficients.clone();
            self.entity.learned.thermal_timing = self.learner.timing.clone();
            if let Err(e) = self.entity.save() {
                warn!("{}: could not persist learned state: {}", self.entity.entity_id, e);
            }
        }

        // Alarms, where the entity asks for them and the protocol has them.
        if self.entity.alarm_monitoring.enabled {
            match self.bms.alarms() {
                Ok(alarms) if !alarms.is_empty() => {
                    let mut by_status: BTreeMap<String, i64> = BTreeMap::new();
                    for alarm in &alarms {
                        *by_status.entry(alarm.status.to_lowercase()).or_insert(0) += 1;
                    }
                    let mut point = Point::new("building_alarms")
                        .tag(self.kind.tag_name(), &self.entity.entity_id)
                        .field("total_count", alarms.len() as i64)
                        .time(t0);
                    for (status, count) in by_status {
                        point = point.field(&format!("count_{}", status), count);
                    }
                    self.ctx.influx.write_point(point);
                }
                Ok(_) => {}
                Err(e) => debug!("{}: alarm fetch failed: {}", self.entity.entity_id, e),
            }
        }
    }

    /// Thermal coefficient learning and indoor-forecast accuracy tracking.
    fn run_thermal_learning(&mut self, values: &BTreeMap<String, f64>, t0: DateTime<Utc>) {
        let room = values.get(self.entity.mapped_field("room_temperature").as_str()).copied();
        let outdoor = values
            .get(self.entity.mapped_field("outdoor_temperature").as_str())
            .copied();
        let (Some(room), Some(outdoor)) = (room, outdoor) else {
            return;
        };

        self.thermal.add_sample(ThermalSample {
            timestamp: t0,
            room_temp: room,
            outdoor_temp: outdoor,
            heating_active: values
                .get(self.entity.mapped_field("electric_heater").as_str())
                .map(|v| *v != 0.0)
                .unwrap_or(false),
        });

        if let Some(result) = self.thermal.coefficient() {
            self.entity.learned.thermal_coefficient = Some(round_to(result.coefficient, 5));
            self.entity.learned.thermal_coefficient_confidence = round_to(result.confidence, 2);
        }

        // Resolve the pending indoor prediction once its target time has
        // passed.
        if let Some((target_time, predicted)) = self.last_indoor_prediction {
            if t0 >= target_time {
                self.last_indoor_prediction = None;
                let error = self
                    .indoor_forecaster
                    .record_accuracy(predicted, room, chrono::Timelike::hour(&t0));
                let point = Point::new("forecast_accuracy")
                    .tag(self.kind.tag_name(), &self.entity.entity_id)
                    .tag("hour", &format!("{:02}", chrono::Timelike::hour(&t0)))
                    .field("predicted", round_to(predicted, 2))
                    .field("actual", round_to(room, 2))
                    .field("error", round_to(error, 3))
                    .field("outdoor", round_to(outdoor, 1))
                    .time(t0);
                self.ctx.influx.write_point(point);
            }
        }

        // Sample schedule: 24 -> 48 -> 96 samples between bias updates.
        if self.entity.learned.record_sample() {
            let updated = self.indoor_forecaster.update_hourly_bias(&mut self.entity.learned, t0);
            if let Err(e) = self.entity.save() {
                warn!("{}: could not persist learned parameters: {}", self.entity.entity_id, e);
            }
            if updated > 0 {
                let mut point = Point::new("learned_parameters")
                    .tag(self.kind.tag_name(), &self.entity.entity_id)
                    .field(
                        "thermal_coefficient",
                        self.entity.learned.thermal_coefficient.unwrap_or(0.0),
                    )
                    .field("confidence", self.entity.learned.thermal_coefficient_confidence)
                    .field("total_samples", self.entity.learned.total_samples as i64)
                    .time(t0);
                for (hour, bias) in &self.entity.learned.hourly_bias {
                    point = point.field(&format!("bias_{}", hour), *bias);
                }
                self.ctx.influx.write_point(point);
            }
        }
    }

    /// Forecast cadence work: weather forecast, energy forecast, heating
    /// recommendation. Future points are replaced, past points kept.
    fn run_forecast_cycle(&mut self, values: &BTreeMap<String, f64>, t0: DateTime<Utc>) -> Result<(), String> {
        let (lat, lon) = match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => return Ok(()),
        };
        let tag_name = self.kind.tag_name();

        // Shared cache first; a fresh fetch feeds it for the neighbors.
        let max_age = Duration::from_secs(FORECAST_INTERVAL_MINUTES as u64 * 60);
        let points = match self.ctx.weather_cache.forecast(lat, lon, max_age) {
            Some(points) => {
                debug!("{}: forecast from shared cache", self.entity.entity_id);
                points
            }
            None => {
                let Some(smhi) = self.smhi.as_ref() else {
                    return Ok(());
                };
                let points = smhi.forecast(FORECAST_HOURS)?;
                self.ctx.weather_cache.store_forecast(lat, lon, points.clone());
                points
            }
        };
        if points.is_empty() {
            return Err("no forecast points returned".to_string());
        }
        self.cached_forecast = points.clone();

        // Trend summary point.
        let trend = forecast::analyze_trend(&points, 24);
        if let Some(trend) = &trend {
            let mut point = Point::new("weather_forecast")
                .tag(tag_name, &self.entity.entity_id)
                .tag("trend", trend.trend.as_str())
                .tag("cloud_condition", trend.cloud_condition)
                .field("current_temp", round_to(trend.current_temp, 2))
                .field("avg_temp", round_to(trend.avg_temp, 2))
                .field("max_temp", round_to(trend.max_temp, 2))
                .field("min_temp", round_to(trend.min_temp, 2))
                .field("temp_change", round_to(trend.change, 2))
                .field("forecast_hours", trend.forecast_hours as i64)
                .time(t0);
            if let Some(cloud) = trend.avg_cloud_cover {
                point = point.field("avg_cloud_cover", round_to(cloud, 2));
            }
            self.ctx.influx.write_point(point);
        }

        // Hourly forecast series: replace the future, keep the past for
        // lead-time accuracy analysis.
        self.ctx.influx.delete_future("weather_forecast_hourly", tag_name, &self.entity.entity_id);
        let hourly: Vec<Point> = points
            .iter()
            .map(|p| {
                Point::new("weather_forecast_hourly")
                    .tag(tag_name, &self.entity.entity_id)
                    .field("temperature", round_to(p.temperature, 2))
                    .field("lead_time_hours", p.lead_time_hours)
                    .field_opt("cloud_cover", p.cloud_cover.map(|v| round_to(v, 1)))
                    .field_opt("wind_speed", p.wind_speed.map(|v| round_to(v, 1)))
                    .field_opt("humidity", p.humidity.map(|v| round_to(v, 0)))
                    .time(p.time)
            })
            .collect();
        self.ctx.influx.write_points(&hourly);

        // Temperature forecast tracks; resolved points age out after two
        // days while the future horizon is rewritten below.
        self.ctx.influx.delete_past("temperature_forecast", tag_name, &self.entity.entity_id, 48);
        let mut temperature_track: Vec<Point> = points
            .iter()
            .map(|p| {
                Point::new("temperature_forecast")
                    .tag(tag_name, &self.entity.entity_id)
                    .tag("forecast_type", "outdoor_temp")
                    .field("value", round_to(p.temperature, 2))
                    .field("lead_time_hours", p.lead_time_hours)
                    .time(p.time)
            })
            .collect();

        // Chained indoor prediction; the first hour feeds accuracy learning
        // once it resolves.
        let indoor = values
            .get(self.entity.mapped_field("room_temperature").as_str())
            .copied();
        if let Some(indoor_now) = indoor {
            let indoor_points = self.indoor_forecaster.generate(
                &self.entity.learned,
                indoor_now,
                &points,
                TARGET_INDOOR_TEMP,
                1.0,
            );
            if let Some(first) = indoor_points.first() {
                self.last_indoor_prediction = Some((first.timestamp, first.value));
            }
            temperature_track.extend(indoor_points.iter().map(|p| {
                Point::new("temperature_forecast")
                    .tag(tag_name, &self.entity.entity_id)
                    .tag("forecast_type", "indoor_temp")
                    .field("value", round_to(p.value, 2))
                    .field("lead_time_hours", p.lead_time_hours)
                    .time(p.timestamp)
            }));
        }
        self.ctx.influx.write_points(&temperature_track);

        // Energy forecast, once k is calibrated.
        let indoor = values
            .get(self.entity.mapped_field("room_temperature").as_str())
            .copied();
        if let Some(forecaster) = EnergyForecaster::from_entity(
            &self.entity,
            lat,
            lon,
            self.entity.energy_separation.assumed_indoor_temp.unwrap_or(TARGET_INDOOR_TEMP),
        ) {
            let energy_points = forecaster.generate(&points, indoor);
            if !energy_points.is_empty() {
                self.ctx.influx.delete_future("energy_forecast", tag_name, &self.entity.entity_id);
                let influx_points: Vec<Point> = energy_points
                    .iter()
                    .map(|p| {
                        Point::new("energy_forecast")
                            .tag(tag_name, &self.entity.entity_id)
                            .field("heating_power_kw", round_to(p.heating_power_kw, 3))
                            .field("heating_energy_kwh", round_to(p.heating_energy_kwh, 3))
                            .field("outdoor_temp", round_to(p.outdoor_temp, 1))
                            .field("effective_temp", round_to(p.effective_temp, 1))
                            .field("wind_effect", round_to(p.wind_effect, 2))
                            .field("solar_effect", round_to(p.solar_effect, 2))
                            .field("lead_time_hours", p.lead_time_hours)
                            .time(p.timestamp)
                    })
                    .collect();
                self.ctx.influx.write_points(&influx_points);

                if let Some(day) = forecaster.summary(&energy_points, 24) {
                    info!(
                        "{}: energy forecast 24h: {:.1} kWh (avg {:.2} kW, peak {:.2} kW)",
                        self.entity.entity_id, day.total_energy_kwh, day.avg_power_kw, day.peak_power_kw
                    );
                }
            }
        }

        // Demand-response recommendation.
        if let (Some(trend), Some(indoor)) = (&trend, indoor) {
            let is_night = sun::solar_elevation(t0, lat, lon) < 0.0;
            let recommendation =
                forecast::heating_recommendation(trend, indoor, TARGET_INDOOR_TEMP, TEMP_MARGIN, is_night);
            let point = Point::new("heating_control")
                .tag(tag_name, &self.entity.entity_id)
                .tag("action", if recommendation.reduce_heating { "reduce" } else { "maintain" })
                .tag("solar_factor", recommendation.solar_factor)
                .tag("cloud_condition", recommendation.cloud_condition)
                .field("reduce_heating", recommendation.reduce_heating)
                .field("confidence", round_to(recommendation.confidence, 2))
                .field("forecast_change", round_to(recommendation.forecast_change, 2))
                .field("current_indoor", round_to(recommendation.current_indoor, 2))
                .time(t0);
            self.ctx.influx.write_point(point);
        }

        Ok(())
    }

    /// Daily energy pipeline at the first iteration past 08:00 local.
    fn maybe_run_daily_pipeline(&mut self, t0: DateTime<Utc>) {
        if !self.entity.energy_separation.enabled {
            return;
        }
        let today = stockholm_date(t0);
        if stockholm_hour(t0) < 8 || self.last_pipeline_date == Some(today) {
            return;
        }
        self.last_pipeline_date = Some(today);

        info!("{}: running daily energy pipeline", self.entity.entity_id);
        let report = energy::run_for_entity(
            &self.ctx.pipeline,
            &self.ctx.influx,
            &mut self.entity,
            std::path::Path::new(&self.ctx.config.profiles_dir),
            std::path::Path::new(&self.ctx.config.buildings_dir),
            std::path::Path::new(&self.ctx.config.energy_import_dir),
            CALIBRATION_DAYS,
            &self.seq,
        );
        if report.calibration.is_some() {
            self.last_recalibration_at = t0;
        }
    }

    /// 72-hour fallback recalibration, independent of time of day and of
    /// the separation step.
    fn maybe_run_fallback_recalibration(&mut self, t0: DateTime<Utc>) {
        if !self.entity.energy_separation.enabled {
            return;
        }
        if t0 - self.last_recalibration_at < ChronoDuration::hours(RECALIBRATION_FALLBACK_HOURS) {
            return;
        }
        // Mark the attempt either way; a data shortage should not retry
        // every tick.
        self.last_recalibration_at = t0;

        info!("{}: running 72h fallback k recalibration", self.entity.entity_id);
        match energy::kcalib::recalibrate(&self.ctx.influx, &mut self.entity, CALIBRATION_DAYS, false) {
            Ok(Some(result)) => {
                info!(
                    "{}: k recalibrated to {:.4} ({} days, {:.0}%)",
                    self.entity.entity_id,
                    result.k_value,
                    result.days_used,
                    result.confidence * 100.0
                );
            }
            Ok(None) => info!("{}: recalibration skipped (insufficient data)", self.entity.entity_id),
            Err(e) => warn!("{}: recalibration failed: {}", self.entity.entity_id, e),
        }
    }

    /// Wall-clock failure accumulation with escalation and an explicit
    /// recovery event.
    fn track_failures(&mut self, succeeded: bool, now: DateTime<Utc>) {
        if succeeded {
            if let Some(since) = self.first_failure_at.take() {
                let minutes = (now - since).num_minutes();
                info!("{}: recovered after {}m of failures", self.entity.entity_id, minutes);
                self.seq.info(
                    "Recovered",
                    "Data collection recovered",
                    vec![("FailureMinutes".to_string(), json!(minutes))],
                );
            }
            return;
        }

        match self.first_failure_at {
            None => {
                self.first_failure_at = Some(now);
                warn!("{}: data collection failed, tracking started", self.entity.entity_id);
                self.seq.warning("FetchFailed", "Data collection failed");
            }
            Some(since) => {
                let minutes = (now - since).num_minutes();
                if minutes >= FAILURE_ERROR_THRESHOLD_MINUTES {
                    error!(
                        "{}: data collection failing for {}m (threshold {}m)",
                        self.entity.entity_id, minutes, FAILURE_ERROR_THRESHOLD_MINUTES
                    );
                    self.seq.error(
                        "PersistentFailure",
                        "Data collection persistently failing",
                        vec![("FailureMinutes".to_string(), json!(minutes))],
                    );
                } else {
                    warn!("{}: data collection failing for {}m", self.entity.entity_id, minutes);
                }
            }
        }
    }

    /// Sleep in short slices so shutdown and retirement stay prompt.
    /// Returns false when the worker should exit.
    fn interruptible_sleep(&self, seconds: f64) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
        loop {
            if self.ctx.should_stop() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return true;
            }
            std::thread::sleep(remaining.min(Duration::from_secs(1)));
        }
    }
}
