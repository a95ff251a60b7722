//! BMS protocol adapters.
//!
//! Three upstreams behind one capability set: `authenticate`,
//! `read_current_values`, `read_history`, and (where the protocol has them)
//! `alarms`. Houses reach their BMS through the residential portal; commercial
//! buildings connect to an Arrigo server directly or to an EBO WebStation.
//! No state is shared across variants.

pub mod arrigo;
pub mod ebo;
pub mod portal;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::entity::{Credentials, EntityConfig};

pub const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const HISTORY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub enum BmsError {
    Transport(String),
    Http { status: u16, message: String },
    /// Expired or missing session; a re-auth may fix it.
    Auth(String),
    /// Wrong credentials, locked account: operator action required.
    AuthPermanent(String),
    Protocol(String),
    Json(serde_json::Error),
}

impl std::fmt::Display for BmsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BmsError::Transport(s) => write!(f, "transport error: {}", s),
            BmsError::Http { status, message } => write!(f, "http {}: {}", status, message),
            BmsError::Auth(s) => write!(f, "auth error: {}", s),
            BmsError::AuthPermanent(s) => write!(f, "permanent auth error: {}", s),
            BmsError::Protocol(s) => write!(f, "protocol error: {}", s),
            BmsError::Json(e) => write!(f, "json error: {}", e),
        }
    }
}

impl std::error::Error for BmsError {}

impl From<serde_json::Error> for BmsError {
    fn from(value: serde_json::Error) -> Self {
        BmsError::Json(value)
    }
}

impl BmsError {
    pub fn is_auth(&self) -> bool {
        matches!(self, BmsError::Auth(_))
    }

    pub fn is_permanent_auth(&self) -> bool {
        matches!(self, BmsError::AuthPermanent(_))
    }
}

/// One historical sample as delivered by the upstream.
#[derive(Debug, Clone)]
pub struct HistoryPoint {
    pub signal_id: String,
    pub time: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct Alarm {
    pub status: String,
    pub priority: String,
    pub text: String,
    pub event_time: Option<String>,
}

/// A signal as reported by upstream discovery, used at onboarding time.
#[derive(Debug, Clone)]
pub struct DiscoveredSignal {
    pub signal_id: String,
    pub name: String,
    pub unit: String,
    pub current_value: Option<f64>,
}

pub enum BmsClient {
    Portal(portal::PortalClient),
    Arrigo(arrigo::ArrigoClient),
    Ebo(ebo::EboClient),
}

impl BmsClient {
    /// Build the right adapter for an entity's connection block.
    pub fn from_entity(entity: &EntityConfig, credentials: &Credentials) -> Result<BmsClient, String> {
        match entity.connection.system.as_str() {
            "portal" | "homeside" | "" => Ok(BmsClient::Portal(portal::PortalClient::new(
                entity.connection.base_url.as_deref(),
                entity.connection.host.as_deref(),
                credentials,
            ))),
            "arrigo" => {
                let host = entity
                    .connection
                    .host
                    .as_deref()
                    .ok_or_else(|| format!("{}: arrigo connection needs a host", entity.entity_id))?;
                Ok(BmsClient::Arrigo(arrigo::ArrigoClient::new(host, credentials)))
            }
            "ebo" => {
                let base_url = entity.connection.base_url.as_deref().ok_or_else(|| {
                    format!("{}: ebo connection needs a base_url", entity.entity_id)
                })?;
                Ok(BmsClient::Ebo(ebo::EboClient::new(base_url, credentials)))
            }
            other => Err(format!("{}: unknown BMS system '{}'", entity.entity_id, other)),
        }
    }

    pub fn authenticate(&mut self) -> Result<(), BmsError> {
        match self {
            BmsClient::Portal(client) => client.authenticate(),
            BmsClient::Arrigo(client) => client.authenticate(),
            BmsClient::Ebo(client) => client.authenticate(),
        }
    }

    /// Current values for the requested signals, keyed by canonical field
    /// name. `signals` maps signal name -> (signal id, field name).
    pub fn read_current_values(
        &mut self,
        signals: &BTreeMap<String, (String, String)>,
    ) -> Result<BTreeMap<String, f64>, BmsError> {
        match self {
            BmsClient::Portal(client) => client.read_current_values(signals),
            BmsClient::Arrigo(client) => client.read_current_values(signals),
            BmsClient::Ebo(client) => client.read_current_values(signals),
        }
    }

    pub fn supports_history(&self) -> bool {
        !matches!(self, BmsClient::Ebo(_))
    }

    pub fn read_history(
        &mut self,
        signal_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        resolution_seconds: u32,
    ) -> Result<Vec<HistoryPoint>, BmsError> {
        match self {
            BmsClient::Portal(client) => client.read_history(signal_ids, from, to, resolution_seconds),
            BmsClient::Arrigo(client) => client.read_history(signal_ids, from, to, resolution_seconds),
            BmsClient::Ebo(_) => Err(BmsError::Protocol(
                "history reads are not available over the EBO subscription API".to_string(),
            )),
        }
    }

    pub fn alarms(&mut self) -> Result<Vec<Alarm>, BmsError> {
        match self {
            BmsClient::Portal(_) => Ok(Vec::new()),
            BmsClient::Arrigo(client) => client.alarms(),
            BmsClient::Ebo(_) => Ok(Vec::new()),
        }
    }

    /// Drop live upstream state (sessions, subscription handles) ahead of a
    /// graceful shutdown.
    pub fn close(&mut self) {
        match self {
            BmsClient::Portal(client) => client.close(),
            BmsClient::Arrigo(client) => client.close(),
            BmsClient::Ebo(client) => client.close(),
        }
    }
}

// ── Shared GraphQL plumbing (portal + arrigo speak the same dialect) ──

/// POST a GraphQL query with a bearer token. 401 surfaces as
/// `BmsError::Auth` so callers can run their refresh path once.
pub(crate) fn graphql_post(
    agent: &ureq::Agent,
    url: &str,
    bearer: &str,
    query: &str,
    variables: Option<Value>,
    timeout: Duration,
) -> Result<Value, BmsError> {
    let mut payload = json!({ "query": query });
    if let Some(variables) = variables {
        payload["variables"] = variables;
    }

    let response = agent
        .post(url)
        .timeout(timeout)
        .set("Authorization", &format!("Bearer {}", bearer))
        .set("Content-Type", "application/json")
        .send_json(payload);

    let response = match response {
        Ok(response) => response,
        Err(ureq::Error::Status(401, _)) => {
            return Err(BmsError::Auth("graphql returned 401".to_string()));
        }
        Err(ureq::Error::Status(status, response)) => {
            let body = response.into_string().unwrap_or_else(|_| String::from("<no body>"));
            return Err(BmsError::Http { status, message: body });
        }
        Err(ureq::Error::Transport(t)) => return Err(BmsError::Transport(t.to_string())),
    };

    let body: Value = response
        .into_json()
        .map_err(|e| BmsError::Protocol(format!("graphql response parse failed: {}", e)))?;

    if let Some(errors) = body.get("errors") {
        return Err(BmsError::Protocol(format!("graphql errors: {}", errors)));
    }

    body.get("data")
        .cloned()
        .ok_or_else(|| BmsError::Protocol("graphql response missing data".to_string()))
}

/// Extract `analogs { items { id name value unit } }` into a signal map.
pub(crate) fn parse_analog_items(data: &Value) -> BTreeMap<String, DiscoveredSignal> {
    let mut signals = BTreeMap::new();
    let items = data
        .pointer("/analogs/items")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    for item in items {
        let Some(id) = item.get("id").and_then(|v| v.as_str()) else {
            continue;
        };
        signals.insert(
            id.to_string(),
            DiscoveredSignal {
                signal_id: id.to_string(),
                name: item.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                unit: item.get("unit").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                current_value: item.get("value").and_then(|v| v.as_f64()),
            },
        );
    }

    signals
}

/// Map requested signals onto discovered current values. Missing signals
/// are simply absent from the result; the caller decides whether an empty
/// map means a stale session.
pub(crate) fn match_requested_signals(
    discovered: &BTreeMap<String, DiscoveredSignal>,
    requested: &BTreeMap<String, (String, String)>,
) -> BTreeMap<String, f64> {
    let mut values = BTreeMap::new();
    for (signal_id, field_name) in requested.values() {
        if let Some(signal) = discovered.get(signal_id) {
            if let Some(value) = signal.current_value {
                values.insert(field_name.clone(), value);
            }
        }
    }
    values
}

/// Parse `analogsHistory { items { signalId time value } }`.
pub(crate) fn parse_history_items(data: &Value) -> Vec<HistoryPoint> {
    let items = data
        .pointer("/analogsHistory/items")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    items
        .iter()
        .filter_map(|item| {
            let signal_id = item.get("signalId")?.as_str()?.to_string();
            let time = item.get("time")?.as_str()?;
            let time = DateTime::parse_from_rfc3339(time).ok()?.with_timezone(&Utc);
            let value = item.get("value")?.as_f64()?;
            Some(HistoryPoint { signal_id, time, value })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analog_items_parse_to_signal_map() {
        let data = json!({
            "analogs": {
                "totalCount": 2,
                "items": [
                    {"id": "c2ln1", "name": "Villa.GT_UTE", "value": -4.2, "unit": "°C"},
                    {"id": "c2ln2", "name": "Villa.GT_RUM", "value": 21.4, "unit": "°C"},
                    {"id": "c2ln3", "name": "Villa.Broken", "value": null, "unit": ""}
                ]
            }
        });
        let signals = parse_analog_items(&data);
        assert_eq!(signals.len(), 3);
        assert_eq!(signals["c2ln1"].current_value, Some(-4.2));
        assert_eq!(signals["c2ln3"].current_value, None);
    }

    #[test]
    fn requested_signals_map_to_field_names() {
        let data = json!({
            "analogs": {"items": [
                {"id": "c2ln1", "name": "Villa.GT_UTE", "value": -4.2, "unit": "°C"}
            ]}
        });
        let discovered = parse_analog_items(&data);

        let mut requested = BTreeMap::new();
        requested.insert(
            "GT_UTE".to_string(),
            ("c2ln1".to_string(), "outdoor_temperature".to_string()),
        );
        requested.insert(
            "GT_MISSING".to_string(),
            ("nope".to_string(), "supply_temp".to_string()),
        );

        let values = match_requested_signals(&discovered, &requested);
        assert_eq!(values.len(), 1);
        assert_eq!(values["outdoor_temperature"], -4.2);
    }

    #[test]
    fn history_items_parse_and_skip_malformed() {
        let data = json!({
            "analogsHistory": {"items": [
                {"signalId": "c2ln1", "time": "2026-01-12T11:00:00Z", "value": -3.9},
                {"signalId": "c2ln1", "time": "broken", "value": 1.0},
                {"signalId": "c2ln1", "time": "2026-01-12T12:00:00Z", "value": null}
            ]}
        });
        let points = parse_history_items(&data);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, -3.9);
    }
}
