//! Decoded RDS group from one redsea output line

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{ReceiverError, Result};

/// RDS programme type names (European table)
const PTY_NAMES: [&str; 32] = [
    "None",
    "News",
    "Current Affairs",
    "Information",
    "Sport",
    "Education",
    "Drama",
    "Culture",
    "Science",
    "Varied",
    "Pop Music",
    "Rock Music",
    "Easy Listening",
    "Light Classical",
    "Serious Classical",
    "Other Music",
    "Weather",
    "Finance",
    "Children's",
    "Social Affairs",
    "Religion",
    "Phone In",
    "Travel",
    "Leisure",
    "Jazz",
    "Country",
    "National Music",
    "Oldies",
    "Folk",
    "Documentary",
    "Alarm Test",
    "Alarm",
];

/// Display name of a programme type code
pub fn pty_name(code: u64) -> String {
    PTY_NAMES
        .get(code as usize)
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("Type {}", code))
}

/// Keys owned by [`DecodedMessage`] itself; decoder fields with these names are dropped
const RESERVED_KEYS: &[&str] = &["frequency_mhz", "received_at"];

/// One decoder record, stamped with the frequency it was received on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedMessage {
    pub frequency_mhz: f64,
    pub received_at: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DecodedMessage {
    /// Parse one JSON line. Anything other than a JSON object is malformed.
    pub fn from_line(line: &str, frequency_mhz: f64) -> Result<Self> {
        let value: Value = serde_json::from_str(line.trim())
            .map_err(|e| ReceiverError::MalformedOutput(format!("{}: {}", e, truncate(line))))?;

        let Value::Object(mut fields) = value else {
            return Err(ReceiverError::MalformedOutput(format!(
                "not a JSON object: {}",
                truncate(line)
            )));
        };

        for key in RESERVED_KEYS {
            fields.remove(*key);
        }
        fields.insert("frequency".to_string(), Value::from(frequency_mhz));
        Ok(Self {
            frequency_mhz,
            received_at: Utc::now(),
            fields,
        })
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Programme identification code
    pub fn pi(&self) -> Option<&str> {
        self.text("pi")
    }

    /// Programme service name
    pub fn ps(&self) -> Option<&str> {
        self.text("ps")
    }

    pub fn radiotext(&self) -> Option<&str> {
        self.text("radiotext").or_else(|| self.text("rt"))
    }

    /// Programme type code, from either the numeric or the `prog_type` form
    pub fn pty(&self) -> Option<u64> {
        self.fields
            .get("pty")
            .and_then(Value::as_u64)
            .or_else(|| {
                let name = self.text("prog_type")?;
                PTY_NAMES
                    .iter()
                    .position(|n| n.eq_ignore_ascii_case(name))
                    .map(|i| i as u64)
            })
    }

    /// Whether this message identifies a station (non-empty PI or PS)
    pub fn is_identifying(&self) -> bool {
        self.pi().is_some() || self.ps().is_some()
    }
}

fn truncate(line: &str) -> &str {
    match line.char_indices().nth(80) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
