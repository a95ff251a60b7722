//! Line-protocol encoding for InfluxDB v2 writes.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    Str(String),
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    // Booleans are stored as 0/1 for easier graphing.
    fn from(value: bool) -> Self {
        FieldValue::Int(if value { 1 } else { 0 })
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

/// A single measurement point: tag set + field set + timestamp.
#[derive(Debug, Clone)]
pub struct Point {
    measurement: String,
    tags: Vec<(String, String)>,
    fields: Vec<(String, FieldValue)>,
    timestamp: Option<DateTime<Utc>>,
}

impl Point {
    pub fn new(measurement: &str) -> Point {
        Point {
            measurement: measurement.to_string(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp: None,
        }
    }

    pub fn tag(mut self, key: &str, value: &str) -> Point {
        self.tags.push((key.to_string(), value.to_string()));
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<FieldValue>) -> Point {
        self.fields.push((key.to_string(), value.into()));
        self
    }

    /// Add a float field only when the value is present.
    pub fn field_opt(self, key: &str, value: Option<f64>) -> Point {
        match value {
            Some(v) => self.field(key, v),
            None => self,
        }
    }

    pub fn time(mut self, ts: DateTime<Utc>) -> Point {
        self.timestamp = Some(ts);
        self
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn has_fields(&self) -> bool {
        !self.fields.is_empty()
    }

    /// Encode to one line of line protocol with second-precision timestamp.
    /// `fallback_now` stamps points built without an explicit time.
    pub fn to_line(&self, fallback_now: DateTime<Utc>) -> Option<String> {
        if self.fields.is_empty() {
            return None;
        }

        let mut line = escape_measurement(&self.measurement);
        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&escape_key(value));
        }

        line.push(' ');
        let mut first = true;
        for (key, value) in &self.fields {
            if !first {
                line.push(',');
            }
            first = false;
            line.push_str(&escape_key(key));
            line.push('=');
            match value {
                FieldValue::Float(v) => line.push_str(&format!("{}", v)),
                FieldValue::Int(v) => line.push_str(&format!("{}i", v)),
                FieldValue::Str(v) => {
                    line.push('"');
                    line.push_str(&v.replace('\\', "\\\\").replace('"', "\\\""));
                    line.push('"');
                }
            }
        }

        let ts = self.timestamp.unwrap_or(fallback_now);
        line.push(' ');
        line.push_str(&ts.timestamp().to_string());
        Some(line)
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_key(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn encodes_tags_fields_and_seconds() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 12, 12, 15, 0).unwrap();
        let line = Point::new("heating_system")
            .tag("house_id", "HEM_FJV_Villa_149")
            .field("room_temperature", 21.53)
            .field("electric_heater", false)
            .time(ts)
            .to_line(ts)
            .unwrap();
        assert_eq!(
            line,
            format!(
                "heating_system,house_id=HEM_FJV_Villa_149 room_temperature=21.53,electric_heater=0i {}",
                ts.timestamp()
            )
        );
    }

    #[test]
    fn escapes_separators() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 12, 12, 0, 0).unwrap();
        let line = Point::new("weather_observation")
            .tag("station_name", "Malmslätt, Flygplats")
            .field("temperature", -3.1)
            .to_line(ts)
            .unwrap();
        assert!(line.starts_with("weather_observation,station_name=Malmslätt\\,\\ Flygplats "));
    }

    #[test]
    fn string_fields_are_quoted() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 12, 12, 0, 0).unwrap();
        let line = Point::new("heating_control")
            .field("reason", "outdoor \"rising\"")
            .to_line(ts)
            .unwrap();
        assert!(line.contains(r#"reason="outdoor \"rising\"""#));
    }

    #[test]
    fn fieldless_point_encodes_to_nothing() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 12, 12, 0, 0).unwrap();
        assert!(Point::new("empty").tag("a", "b").to_line(ts).is_none());
    }
}
