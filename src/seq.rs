//! Structured event logging to a Seq server.
//!
//! The sink is optional: with no SEQ_URL configured every call is a cheap
//! no-op, and delivery failures never disturb the pipeline.

use chrono::Utc;
use serde_json::{Value, json};
use std::time::Duration;

const SEQ_TIMEOUT: Duration = Duration::from_secs(5);
const APPLICATION: &str = "HeatingPipeline";

pub struct SeqLogger {
    agent: ureq::Agent,
    url: Option<String>,
    api_key: Option<String>,
}

impl SeqLogger {
    pub fn new(url: Option<String>, api_key: Option<String>) -> SeqLogger {
        let url = url.map(|u| {
            let trimmed = u.trim_end_matches('/');
            format!("{}/api/events/raw", trimmed.trim_end_matches("/api"))
        });
        SeqLogger {
            agent: ureq::AgentBuilder::new().timeout(SEQ_TIMEOUT).build(),
            url,
            api_key,
        }
    }

    pub fn enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Send one event. Levels follow Seq conventions: Debug, Information,
    /// Warning, Error. Returns whether delivery succeeded; callers are free
    /// to ignore it.
    pub fn log(&self, level: &str, message: &str, properties: Vec<(String, Value)>) -> bool {
        let Some(url) = &self.url else {
            return false;
        };

        let mut props = serde_json::Map::new();
        props.insert("Application".to_string(), json!(APPLICATION));
        for (key, value) in properties {
            props.insert(key, value);
        }

        let payload = json!({
            "Events": [{
                "Timestamp": Utc::now().to_rfc3339(),
                "Level": level,
                "MessageTemplate": message,
                "Properties": Value::Object(props),
            }]
        });

        let mut request = self
            .agent
            .post(url)
            .set("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.set("X-Seq-ApiKey", key);
        }

        request.send_json(payload).is_ok()
    }
}

/// Per-entity view over the shared sink: stamps every event with the
/// entity's identity so multi-site deployments can filter.
pub struct EntitySeq {
    inner: std::sync::Arc<SeqLogger>,
    component: &'static str,
    entity_id: String,
    display_name: String,
}

impl EntitySeq {
    pub fn new(
        inner: std::sync::Arc<SeqLogger>,
        component: &'static str,
        entity_id: &str,
        display_name: &str,
    ) -> EntitySeq {
        EntitySeq {
            inner,
            component,
            entity_id: entity_id.to_string(),
            display_name: display_name.to_string(),
        }
    }

    pub fn log(&self, level: &str, event_type: &str, message: &str, extra: Vec<(String, Value)>) {
        let mut props = vec![
            ("Component".to_string(), json!(self.component)),
            ("EntityId".to_string(), json!(self.entity_id)),
            ("DisplayName".to_string(), json!(self.display_name)),
            ("EventType".to_string(), json!(event_type)),
        ];
        props.extend(extra);
        self.inner
            .log(level, &format!("[{}] {}", self.display_name, message), props);
    }

    pub fn info(&self, event_type: &str, message: &str, extra: Vec<(String, Value)>) {
        self.log("Information", event_type, message, extra);
    }

    pub fn warning(&self, event_type: &str, message: &str) {
        self.log("Warning", event_type, message, Vec::new());
    }

    pub fn error(&self, event_type: &str, message: &str, extra: Vec<(String, Value)>) {
        self.log("Error", event_type, message, extra);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_without_url() {
        let seq = SeqLogger::new(None, None);
        assert!(!seq.enabled());
        assert!(!seq.log("Information", "dropped", Vec::new()));
    }

    #[test]
    fn normalizes_url_with_api_suffix() {
        let seq = SeqLogger::new(Some("http://seq.local:5341/api/".to_string()), None);
        assert_eq!(seq.url.as_deref(), Some("http://seq.local:5341/api/events/raw"));
        let seq = SeqLogger::new(Some("http://seq.local:5341".to_string()), None);
        assert_eq!(seq.url.as_deref(), Some("http://seq.local:5341/api/events/raw"));
    }
}
