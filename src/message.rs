//! Message type returned by the message store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A notification as delivered by the message store.
///
/// `relative_id` orders messages per device and is what acknowledgments
/// refer to. `unique_id` is the stable identity to de-duplicate on, since
/// delivery is at-least-once.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(rename = "id")]
    pub relative_id: u64,
    #[serde(rename = "umid")]
    pub unique_id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "message", default)]
    pub text: String,
    #[serde(rename = "app", default)]
    pub app_name: String,
    #[serde(rename = "aid", default)]
    pub app_id: u64,
    #[serde(rename = "icon", default)]
    pub icon_id: String,
    /// Unix timestamp in seconds, as sent by the service.
    #[serde(rename = "date")]
    pub timestamp: i64,
    /// Wall-clock instant derived from `timestamp` at fetch time.
    #[serde(skip)]
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub sound: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_title: Option<String>,
    #[serde(rename = "acked", default, deserialize_with = "deserialize_flag")]
    pub acknowledged: bool,
    #[serde(rename = "receipt", default, skip_serializing_if = "Option::is_none")]
    pub receipt_code: Option<String>,
    #[serde(rename = "html", default, deserialize_with = "deserialize_flag")]
    pub contains_html: bool,
}

impl Message {
    /// Fills in `date` from `timestamp`.
    ///
    /// Timestamps outside the representable range resolve to the epoch.
    pub fn resolve_date(&mut self) {
        self.date = timestamp_to_date(self.timestamp);
    }
}

pub fn timestamp_to_date(timestamp: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp, 0).unwrap_or_default()
}

/// Highest relative id in a batch, `0` for an empty batch.
pub fn high_water_mark(messages: &[Message]) -> u64 {
    messages
        .iter()
        .map(|message| message.relative_id)
        .max()
        .unwrap_or(0)
}

/// Parses the service's loose boolean encoding.
///
/// Accepts exactly the raw JSON tokens `1`, `true`, `0` and `false`.
pub fn parse_flag(token: &str) -> Option<bool> {
    match token {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let token = value.to_string();
    parse_flag(&token).ok_or_else(|| {
        serde::de::Error::custom(format!("invalid boolean token {token}"))
    })
}
