pub mod bms;
pub mod config;
pub mod energy;
pub mod energy_model;
pub mod entity;
pub mod forecast;
pub mod gapfill;
pub mod influx;
pub mod ml2;
pub mod seq;
pub mod sun;
pub mod supervisor;
pub mod tempforecast;
pub mod thermal;
pub mod utils;
pub mod weather;
pub mod worker;

use log::{error, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::Config;
use crate::energy::EnergyPipeline;
use crate::influx::InfluxWriter;
use crate::seq::SeqLogger;
use crate::supervisor::Supervisor;
use crate::weather::cache::SharedWeatherCache;
use crate::worker::WorkerContext;

fn main() {
    env_logger::init();
    info!("bms-influx starting (build {})", env!("BUILD_TIME_GIT_HASH"));

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Shared services, initialized before any worker and closed after the
    // supervisor returns.
    let seq = Arc::new(SeqLogger::new(config.seq_url.clone(), config.seq_api_key.clone()));
    if seq.enabled() {
        info!("Seq logging enabled");
    }
    let influx = Arc::new(InfluxWriter::new(
        &config.influx_url,
        &config.influx_token,
        &config.influx_org,
        &config.influx_bucket,
        Some(seq.clone()),
    ));
    let weather_cache = Arc::new(SharedWeatherCache::new());
    let pipeline = Arc::new(EnergyPipeline::new());

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::Relaxed);
        }) {
            error!("Could not install signal handler: {}", e);
            std::process::exit(1);
        }
    }

    let base = WorkerContext {
        config,
        influx,
        weather_cache,
        seq,
        pipeline,
        shutdown,
        // The supervisor hands each worker its own stop flag; this one is
        // a placeholder for the template context.
        stop: Arc::new(AtomicBool::new(false)),
    };

    Supervisor::new(base).run();
    info!("bms-influx stopped");
}
