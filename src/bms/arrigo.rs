//! Direct Arrigo adapter for commercial buildings: username/password login
//! against the building's own server, JWT bearer for GraphQL.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;

use super::{
    AUTH_TIMEOUT, Alarm, BmsError, DiscoveredSignal, HISTORY_TIMEOUT, HistoryPoint, READ_TIMEOUT,
    graphql_post, match_requested_signals, parse_analog_items, parse_history_items,
};
use crate::entity::Credentials;

const TOKEN_SAFETY_MARGIN_MINUTES: i64 = 5;
const DEFAULT_EXPIRES_IN_SECONDS: i64 = 10800;

pub struct ArrigoClient {
    agent: ureq::Agent,
    login_url: String,
    graphql_url: String,
    username: String,
    password: String,
    auth_token: Option<String>,
    token_expires_at: Option<DateTime<Utc>>,
    account: Option<String>,
}

impl ArrigoClient {
    pub fn new(host: &str, credentials: &Credentials) -> ArrigoClient {
        let base = format!("https://{}", host.trim_end_matches('/'));
        ArrigoClient {
            agent: ureq::AgentBuilder::new().timeout(Duration::from_secs(60)).build(),
            login_url: format!("{}/Arrigo/api/login", base),
            graphql_url: format!("{}/Arrigo/api/graphql", base),
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            auth_token: None,
            token_expires_at: None,
            account: None,
        }
    }

    pub fn authenticate(&mut self) -> Result<(), BmsError> {
        debug!("Arrigo login as '{}'", self.username);

        let payload = json!({
            "account": "",
            "username": self.username,
            "password": self.password,
            "newPassword": "",
            "remember": true,
            "currentPhase": "LoginIn",
            "configAccount": false,
            "passwordExpirePanel": false,
            "passwordRequirementsNotMet": false,
            "requestPassword": false,
            "passwordLoading": false,
        });

        let response = self
            .agent
            .post(&self.login_url)
            .timeout(AUTH_TIMEOUT)
            .set("Content-Type", "application/json")
            .send_json(payload);

        let body: Value = match response {
            Ok(response) => response
                .into_json()
                .map_err(|e| BmsError::Protocol(format!("login response parse failed: {}", e)))?,
            Err(ureq::Error::Status(status @ (401 | 403), response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(BmsError::AuthPermanent(format!("login rejected (http {}): {}", status, body)));
            }
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_else(|_| String::from("<no body>"));
                return Err(BmsError::Http { status, message: body });
            }
            Err(ureq::Error::Transport(t)) => return Err(BmsError::Transport(t.to_string())),
        };

        let auth_token = body
            .get("authToken")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BmsError::AuthPermanent("login returned no authToken".to_string()))?
            .to_string();
        let expires_in = body
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .unwrap_or(DEFAULT_EXPIRES_IN_SECONDS);
        self.account = body.get("account").and_then(|v| v.as_str()).map(|s| s.to_string());

        self.auth_token = Some(auth_token);
        self.token_expires_at = Some(Utc::now() + ChronoDuration::seconds(expires_in));

        info!(
            "Arrigo login ok (account: {}, expires in {}s)",
            self.account.as_deref().unwrap_or("?"),
            expires_in
        );
        Ok(())
    }

    fn token_valid(&self) -> bool {
        match (&self.auth_token, self.token_expires_at) {
            (Some(_), Some(expires_at)) => {
                Utc::now() + ChronoDuration::minutes(TOKEN_SAFETY_MARGIN_MINUTES) < expires_at
            }
            _ => false,
        }
    }

    fn graphql(&mut self, query: &str, variables: Option<Value>, timeout: Duration) -> Result<Value, BmsError> {
        if !self.token_valid() {
            self.authenticate()?;
        }
        let bearer = self.auth_token.clone().expect("token after authenticate");

        match graphql_post(&self.agent, &self.graphql_url, &bearer, query, variables.clone(), timeout) {
            Err(e) if e.is_auth() => {
                self.authenticate()?;
                let bearer = self.auth_token.clone().expect("token after authenticate");
                graphql_post(&self.agent, &self.graphql_url, &bearer, query, variables, timeout)
            }
            other => other,
        }
    }

    /// Enumerate the server's analog signals with current values. Serves
    /// both onboarding discovery and the per-tick bulk read.
    pub fn discover_signals(&mut self) -> Result<BTreeMap<String, DiscoveredSignal>, BmsError> {
        let query = "{ analogs(first: 500) { totalCount items { id name value unit } } }";
        let data = self.graphql(query, None, READ_TIMEOUT)?;
        Ok(parse_analog_items(&data))
    }

    pub fn read_current_values(
        &mut self,
        signals: &BTreeMap<String, (String, String)>,
    ) -> Result<BTreeMap<String, f64>, BmsError> {
        let discovered = self.discover_signals()?;
        Ok(match_requested_signals(&discovered, signals))
    }

    pub fn read_history(
        &mut self,
        signal_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        resolution_seconds: u32,
    ) -> Result<Vec<HistoryPoint>, BmsError> {
        let query = "query GetHistory($filter: AnalogEventFilter) {\n\
                     analogsHistory(first: 50000, filter: $filter) {\n\
                     totalCount items { signalId time value reliability timeLength } } }";
        let variables = json!({
            "filter": {
                "signalId": signal_ids,
                "ranges": [{
                    "from": from.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    "to": to.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                }],
                "timeLength": resolution_seconds,
            }
        });

        let data = self.graphql(query, Some(variables), HISTORY_TIMEOUT)?;
        Ok(parse_history_items(&data))
    }

    pub fn alarms(&mut self) -> Result<Vec<Alarm>, BmsError> {
        let query = "query AlarmsQuery($first: Int, $orderBy: [AlarmOrderBy]) {\n\
                     alarms(first: $first, orderBy: $orderBy) {\n\
                     edges { node { id alarmText status name alarmTime eventTime priority } } } }";
        let variables = json!({
            "first": 100,
            "orderBy": [{"fieldName": "eventTime", "sortDirection": "descending"}],
        });

        let data = self.graphql(query, Some(variables), READ_TIMEOUT)?;
        let edges = data
            .pointer("/alarms/edges")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(edges
            .iter()
            .filter_map(|edge| {
                let node = edge.get("node")?;
                Some(Alarm {
                    status: node.get("status")?.as_str().unwrap_or("UNKNOWN").to_string(),
                    priority: node
                        .get("priority")
                        .and_then(|v| v.as_str())
                        .unwrap_or("?")
                        .to_string(),
                    text: node
                        .get("alarmText")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    event_time: node.get("eventTime").and_then(|v| v.as_str()).map(|s| s.to_string()),
                })
            })
            .collect())
    }

    pub fn close(&mut self) {
        self.auth_token = None;
        self.token_expires_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_built_from_host() {
        let credentials = Credentials {
            username: "Driftansvarig".to_string(),
            password: "x".to_string(),
            domain: String::new(),
        };
        let client = ArrigoClient::new("exodrift05.systeminstallation.se", &credentials);
        assert_eq!(client.login_url, "https://exodrift05.systeminstallation.se/Arrigo/api/login");
        assert_eq!(client.graphql_url, "https://exodrift05.systeminstallation.se/Arrigo/api/graphql");
    }

    #[test]
    fn token_expiry_with_margin() {
        let credentials = Credentials {
            username: "u".to_string(),
            password: "p".to_string(),
            domain: String::new(),
        };
        let mut client = ArrigoClient::new("example.se", &credentials);
        assert!(!client.token_valid());
        client.auth_token = Some("jwt".to_string());
        client.token_expires_at = Some(Utc::now() + ChronoDuration::seconds(DEFAULT_EXPIRES_IN_SECONDS));
        assert!(client.token_valid());
        client.token_expires_at = Some(Utc::now() + ChronoDuration::minutes(4));
        assert!(!client.token_valid());
    }
}
