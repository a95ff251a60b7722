//! Process-wide runtime configuration from environment variables.

#[derive(Debug, Clone)]
pub struct Config {
    pub influx_url: String,
    pub influx_token: String,
    pub influx_org: String,
    pub influx_bucket: String,
    pub seq_url: Option<String>,
    pub seq_api_key: Option<String>,
    /// Fixed per-process stagger added to every aligned boundary.
    pub poll_offset_seconds: u32,
    /// Fallback coordinates for entities without a configured location.
    pub default_latitude: Option<f64>,
    pub default_longitude: Option<f64>,
    pub profiles_dir: String,
    pub buildings_dir: String,
    /// Staging area (file-share) the energy meter exports land in.
    pub energy_import_dir: String,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingVar(&'static str),
    Invalid(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVar(name) => write!(f, "required environment variable {} not set", name),
            ConfigError::Invalid(name, value) => write!(f, "invalid value for {}: {}", name, value),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_f64(name: &'static str) -> Result<Option<f64>, ConfigError> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse::<f64>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(name, v)),
        _ => Ok(None),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let influx_url =
            std::env::var("INFLUXDB_URL").map_err(|_| ConfigError::MissingVar("INFLUXDB_URL"))?;
        let influx_token =
            std::env::var("INFLUXDB_TOKEN").map_err(|_| ConfigError::MissingVar("INFLUXDB_TOKEN"))?;
        let influx_org = std::env::var("INFLUXDB_ORG").unwrap_or_else(|_| "homeside".to_string());
        let influx_bucket = std::env::var("INFLUXDB_BUCKET").unwrap_or_else(|_| "heating".to_string());

        let poll_offset_seconds = match std::env::var("POLL_OFFSET_SECONDS") {
            Ok(v) if !v.is_empty() => v
                .parse::<u32>()
                .map_err(|_| ConfigError::Invalid("POLL_OFFSET_SECONDS", v))?,
            _ => 0,
        };

        Ok(Config {
            influx_url,
            influx_token,
            influx_org,
            influx_bucket,
            seq_url: std::env::var("SEQ_URL").ok().filter(|s| !s.is_empty()),
            seq_api_key: std::env::var("SEQ_API_KEY").ok().filter(|s| !s.is_empty()),
            poll_offset_seconds,
            default_latitude: parse_f64("LATITUDE")?,
            default_longitude: parse_f64("LONGITUDE")?,
            profiles_dir: std::env::var("PROFILES_DIR").unwrap_or_else(|_| "profiles".to_string()),
            buildings_dir: std::env::var("BUILDINGS_DIR").unwrap_or_else(|_| "buildings".to_string()),
            energy_import_dir: std::env::var("ENERGY_IMPORT_DIR")
                .unwrap_or_else(|_| "energy_import".to_string()),
        })
    }
}
