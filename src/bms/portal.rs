//! Portal-relayed BMS adapter for houses.
//!
//! Three-stage authentication: portal credentials buy an opaque session
//! token, the session token buys a short-lived bearer token scoped to the
//! upstream BMS, and the bearer token signs the GraphQL calls. Bearer
//! tokens live ~3 h; re-auth happens proactively 5 minutes early.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;

use super::{
    AUTH_TIMEOUT, Alarm, BmsError, HISTORY_TIMEOUT, HistoryPoint, READ_TIMEOUT, graphql_post,
    match_requested_signals, parse_analog_items, parse_history_items,
};
use crate::entity::Credentials;

const DEFAULT_PORTAL_URL: &str = "https://homeside.systeminstallation.se";
const DEFAULT_ARRIGO_HOST: &str = "exodrift10.systeminstallation.se";
const TOKEN_LIFETIME_HOURS: i64 = 3;
const TOKEN_SAFETY_MARGIN_MINUTES: i64 = 5;

pub struct PortalClient {
    agent: ureq::Agent,
    portal_url: String,
    graphql_url: String,
    username: String,
    password: String,
    session_token: Option<String>,
    bms_token: Option<String>,
    token_expires_at: Option<DateTime<Utc>>,
    client_id: Option<String>,
}

impl PortalClient {
    pub fn new(portal_url: Option<&str>, arrigo_host: Option<&str>, credentials: &Credentials) -> PortalClient {
        let portal_url = portal_url.unwrap_or(DEFAULT_PORTAL_URL).trim_end_matches('/').to_string();
        let arrigo_host = arrigo_host.unwrap_or(DEFAULT_ARRIGO_HOST);
        PortalClient {
            agent: ureq::AgentBuilder::new().timeout(Duration::from_secs(60)).build(),
            portal_url,
            graphql_url: format!("https://{}/arrigo/api/graphql", arrigo_host),
            // Portal usernames are entered with spaces; the API wants none.
            username: credentials.username.replace(' ', ""),
            password: credentials.password.clone(),
            session_token: None,
            bms_token: None,
            token_expires_at: None,
            client_id: None,
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Full three-stage flow: session token, house discovery, BMS token.
    pub fn authenticate(&mut self) -> Result<(), BmsError> {
        debug!("Portal auth for {}", self.username);

        // Stage 1: portal session token.
        let payload = json!({
            "user": {
                "Account": "homeside",
                "UserName": self.username,
                "Password": self.password,
            },
            "lang": "sv",
        });
        let body = self.portal_post("/api/v2/authorize/account", payload, None)?;
        let session_token = body
            .get("querykey")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BmsError::AuthPermanent("portal login returned no session token".to_string()))?
            .to_string();

        // Stage 2: discover the houses this account can reach.
        let houses = self.portal_post("/api/v2/housefidlist", json!({}), Some(&session_token))?;
        let houses = houses
            .as_array()
            .cloned()
            .unwrap_or_default();
        if houses.is_empty() {
            return Err(BmsError::AuthPermanent("portal account has no houses".to_string()));
        }
        if self.client_id.is_none() {
            self.client_id = houses[0]
                .get("restapiurl")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            if let Some(client_id) = &self.client_id {
                info!("Portal client id discovered: {}", client_id);
            }
        }
        let client_id = self
            .client_id
            .clone()
            .ok_or_else(|| BmsError::Protocol("house list carried no client id".to_string()))?;

        // Stage 3: exchange for the BMS bearer token.
        let body = self.portal_post(
            "/api/v2/housearrigobmsapi/getarrigobmstoken",
            json!({ "clientid": client_id }),
            Some(&session_token),
        )?;
        let bms_token = body
            .get("token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BmsError::Auth("portal returned no BMS token".to_string()))?
            .to_string();

        self.session_token = Some(session_token);
        self.bms_token = Some(bms_token);
        self.token_expires_at = Some(Utc::now() + ChronoDuration::hours(TOKEN_LIFETIME_HOURS));
        debug!("Portal auth complete, BMS token valid ~{}h", TOKEN_LIFETIME_HOURS);
        Ok(())
    }

    fn portal_post(&self, path: &str, payload: Value, session_token: Option<&str>) -> Result<Value, BmsError> {
        let url = format!("{}{}", self.portal_url, path);
        let mut request = self
            .agent
            .post(&url)
            .timeout(AUTH_TIMEOUT)
            .set("Content-Type", "application/json");
        if let Some(token) = session_token {
            request = request.set("Authorization", token);
        }

        match request.send_json(payload) {
            Ok(response) => response
                .into_json()
                .map_err(|e| BmsError::Protocol(format!("portal response parse failed: {}", e))),
            Err(ureq::Error::Status(status @ (401 | 403), response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(BmsError::AuthPermanent(format!("portal rejected login (http {}): {}", status, body)))
            }
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_else(|_| String::from("<no body>"));
                Err(BmsError::Http { status, message: body })
            }
            Err(ureq::Error::Transport(t)) => Err(BmsError::Transport(t.to_string())),
        }
    }

    fn token_valid(&self) -> bool {
        match (&self.bms_token, self.token_expires_at) {
            (Some(_), Some(expires_at)) => {
                Utc::now() + ChronoDuration::minutes(TOKEN_SAFETY_MARGIN_MINUTES) < expires_at
            }
            _ => false,
        }
    }

    fn ensure_authenticated(&mut self) -> Result<(), BmsError> {
        if self.token_valid() {
            return Ok(());
        }
        debug!("BMS token missing or near expiry, re-authenticating");
        self.authenticate()
    }

    /// GraphQL with the bearer token; one full refresh on 401.
    fn graphql(&mut self, query: &str, variables: Option<Value>, timeout: Duration) -> Result<Value, BmsError> {
        self.ensure_authenticated()?;
        let bearer = self.bms_token.clone().expect("token after ensure_authenticated");

        match graphql_post(&self.agent, &self.graphql_url, &bearer, query, variables.clone(), timeout) {
            Err(e) if e.is_auth() => {
                self.authenticate()?;
                let bearer = self.bms_token.clone().expect("token after authenticate");
                graphql_post(&self.agent, &self.graphql_url, &bearer, query, variables, timeout)
            }
            other => other,
        }
    }

    /// Enumerate the upstream's analog signals with current values. The
    /// onboarding tools use the full list; the poll loop matches it against
    /// the entity's fetch set.
    pub fn discover_signals(
        &mut self,
    ) -> Result<BTreeMap<String, super::DiscoveredSignal>, BmsError> {
        let query = "{ analogs(first: 500) { totalCount items { id name value unit } } }";
        let data = self.graphql(query, None, READ_TIMEOUT)?;
        Ok(parse_analog_items(&data))
    }

    /// All analog signals in one bulk query, matched against the request.
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
        Ok(Vec::new())
    }

    pub fn close(&mut self) {
        self.session_token = None;
        self.bms_token = None;
        self.token_expires_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Credentials;

    fn credentials() -> Credentials {
        Credentials {
            username: "FC 2000 232581".to_string(),
            password: "secret".to_string(),
            domain: String::new(),
        }
    }

    #[test]
    fn username_spaces_are_stripped() {
        let client = PortalClient::new(None, None, &credentials());
        assert_eq!(client.username, "FC2000232581");
    }

    #[test]
    fn defaults_point_at_the_portal_and_upstream() {
        let client = PortalClient::new(None, None, &credentials());
        assert_eq!(client.portal_url, DEFAULT_PORTAL_URL);
        assert!(client.graphql_url.contains(DEFAULT_ARRIGO_HOST));

        let client = PortalClient::new(Some("https://portal.example.se/"), Some("bms.example.se"), &credentials());
        assert_eq!(client.portal_url, "https://portal.example.se");
        assert_eq!(client.graphql_url, "https://bms.example.se/arrigo/api/graphql");
    }

    #[test]
    fn token_validity_honors_safety_margin() {
        let mut client = PortalClient::new(None, None, &credentials());
        assert!(!client.token_valid());

        client.bms_token = Some("token".to_string());
        client.token_expires_at = Some(Utc::now() + ChronoDuration::hours(1));
        assert!(client.token_valid());

        // Inside the 5-minute margin counts as expired.
        client.token_expires_at = Some(Utc::now() + ChronoDuration::minutes(3));
        assert!(!client.token_valid());

        client.close();
        assert!(!client.token_valid());
    }
}
