//! # State Snapshot
//!
//! One immutable, fully-formed view of the aggregated device state. A new
//! `Snapshot` is built on every successful merge; an existing one is never
//! mutated after it has been published through the aggregator.
//!
//! Extension keys are namespaced by their source (`opc.` for the device proxy).
//! Merging is last-writer-wins per key and carries unrelated keys forward.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Extension key holding the human-readable device name.
pub const DEVICE_NAME_KEY: &str = "deviceName";
/// Extension key holding the `"Online"` / `"Offline"` device status.
pub const DEVICE_STATUS_KEY: &str = "deviceStatus";
/// Status reported before the first successful poll.
pub const STATUS_UNKNOWN: &str = "Unknown";

/// The open, namespaced bag of extra attribute values.
pub type ExtensionMap = BTreeMap<String, ExtensionValue>;

/// # Extension Value
///
/// Tagged variant for every value that can sit in the extension bag. It is
/// serialized untagged, so JSON consumers see a plain bool, number, string or
/// object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtensionValue {
    /// A boolean flag such as `opc.connected`.
    Bool(bool),
    /// Any numeric reading. Integers are widened to `f64`.
    Number(f64),
    /// Free text, including opaque command payloads.
    Text(String),
    /// Structured data (arrays and objects) kept as raw JSON.
    Object(Value),
}

impl ExtensionValue {
    /// Interprets the value as a flag. Numbers are true when non-zero; text
    /// must spell `true` or `false` in any case.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ExtensionValue::Bool(b) => Some(*b),
            ExtensionValue::Number(n) => Some(*n != 0.0),
            ExtensionValue::Text(s) => {
                let s = s.trim();
                if s.eq_ignore_ascii_case("true") {
                    Some(true)
                } else if s.eq_ignore_ascii_case("false") {
                    Some(false)
                } else {
                    None
                }
            }
            ExtensionValue::Object(_) => None,
        }
    }

    /// Interprets the value as a number. Flags map to `1.0` / `0.0`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ExtensionValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            ExtensionValue::Number(n) => Some(*n),
            ExtensionValue::Text(s) => s.trim().parse::<f64>().ok(),
            ExtensionValue::Object(_) => None,
        }
    }
}

impl fmt::Display for ExtensionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionValue::Bool(b) => write!(f, "{}", b),
            ExtensionValue::Number(n) => write!(f, "{}", n),
            ExtensionValue::Text(s) => f.write_str(s),
            ExtensionValue::Object(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for ExtensionValue {
    fn from(value: bool) -> Self {
        ExtensionValue::Bool(value)
    }
}

impl From<f64> for ExtensionValue {
    fn from(value: f64) -> Self {
        ExtensionValue::Number(value)
    }
}

impl From<&str> for ExtensionValue {
    fn from(value: &str) -> Self {
        ExtensionValue::Text(value.to_string())
    }
}

impl From<String> for ExtensionValue {
    fn from(value: String) -> Self {
        ExtensionValue::Text(value)
    }
}

impl From<Value> for ExtensionValue {
    /// Scalars land in their matching variant; `null`, arrays and objects stay raw.
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(b) => ExtensionValue::Bool(b),
            Value::Number(n) => match n.as_f64() {
                Some(f) => ExtensionValue::Number(f),
                None => ExtensionValue::Object(Value::Number(n)),
            },
            Value::String(s) => ExtensionValue::Text(s),
            other => ExtensionValue::Object(other),
        }
    }
}

/// # Snapshot
///
/// The canonical gateway state. Serializing it yields the externally-visible
/// projection `{timestamp, deviceName, deviceStatus, extensions}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// When this snapshot was produced.
    pub timestamp: DateTime<Utc>,
    /// Name of the device behind the proxy.
    pub device_name: String,
    /// `"Online"`, `"Offline"` or `"Unknown"` before the first poll.
    pub device_status: String,
    /// Namespaced attribute values merged from every source.
    pub extensions: ExtensionMap,
    /// Publish counter, assigned by the aggregator when the snapshot wins its swap.
    #[serde(skip)]
    pub(crate) sequence: u64,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            device_name: String::new(),
            device_status: STATUS_UNKNOWN.to_string(),
            extensions: ExtensionMap::new(),
            sequence: 0,
        }
    }
}

impl Snapshot {
    /// Position of this snapshot in the aggregator's publish order. The
    /// process-start default is `0`.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Builds the successor of `self` after merging `incoming` into the
    /// extension bag.
    ///
    /// `deviceName` / `deviceStatus` are re-derived from the merged bag; when a
    /// key is absent the previous value is kept.
    pub fn merged(&self, incoming: &ExtensionMap, now: DateTime<Utc>) -> Snapshot {
        let extensions = merge_extensions(&self.extensions, incoming);

        let device_name = extensions
            .get(DEVICE_NAME_KEY)
            .map(|v| v.to_string())
            .unwrap_or_else(|| self.device_name.clone());
        let device_status = extensions
            .get(DEVICE_STATUS_KEY)
            .map(|v| v.to_string())
            .unwrap_or_else(|| self.device_status.clone());

        Snapshot {
            timestamp: now,
            device_name,
            device_status,
            extensions,
            sequence: self.sequence,
        }
    }

    /// The JSON payload pushed to subscribers and served over HTTP.
    pub fn projection(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Last-writer-wins merge of two extension bags. Keys only present in
/// `current` are carried forward untouched.
pub fn merge_extensions(current: &ExtensionMap, incoming: &ExtensionMap) -> ExtensionMap {
    let mut merged = current.clone();
    for (key, value) in incoming {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag(pairs: &[(&str, ExtensionValue)]) -> ExtensionMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn merge_overwrites_collisions_and_keeps_unrelated_keys() {
        let current = bag(&[
            ("ros.tick", ExtensionValue::Number(4.0)),
            ("opc.conveyor.speed", ExtensionValue::Number(0.2)),
        ]);
        let incoming = bag(&[("opc.conveyor.speed", ExtensionValue::Number(0.8))]);

        let merged = merge_extensions(&current, &incoming);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged["ros.tick"], ExtensionValue::Number(4.0));
        assert_eq!(merged["opc.conveyor.speed"], ExtensionValue::Number(0.8));
    }

    #[test]
    fn merged_derives_name_and_status_from_the_bag() {
        let start = Snapshot::default();
        let incoming = bag(&[
            (DEVICE_NAME_KEY, "Kepware_Channel1_Device1".into()),
            (DEVICE_STATUS_KEY, "Online".into()),
            ("opc.connected", true.into()),
        ]);

        let next = start.merged(&incoming, Utc::now());

        assert_eq!(next.device_name, "Kepware_Channel1_Device1");
        assert_eq!(next.device_status, "Online");
        // The receiver is left untouched.
        assert_eq!(start.device_status, STATUS_UNKNOWN);
        assert!(start.extensions.is_empty());
    }

    #[test]
    fn merged_keeps_previous_name_when_the_key_is_missing() {
        let mut start = Snapshot::default();
        start.device_name = "press-2".to_string();

        let next = start.merged(&bag(&[("opc.connected", false.into())]), Utc::now());

        assert_eq!(next.device_name, "press-2");
        assert_eq!(next.device_status, STATUS_UNKNOWN);
    }

    #[test]
    fn projection_uses_camel_case_and_plain_values() {
        let mut snap = Snapshot::default();
        snap.device_name = "d".into();
        snap.device_status = "Online".into();
        snap.extensions.insert("opc.connected".into(), true.into());
        snap.extensions.insert("opc.conveyor.speed".into(), 0.5.into());
        snap.extensions
            .insert("ros.robot.pose".into(), ExtensionValue::Object(json!({"x": 1.0})));

        let value = snap.projection().unwrap();

        assert_eq!(value["deviceName"], "d");
        assert_eq!(value["deviceStatus"], "Online");
        assert_eq!(value["extensions"]["opc.connected"], true);
        assert_eq!(value["extensions"]["opc.conveyor.speed"], 0.5);
        assert_eq!(value["extensions"]["ros.robot.pose"]["x"], 1.0);
        assert!(value.get("sequence").is_none());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn value_coercions() {
        assert_eq!(ExtensionValue::Number(2.0).as_bool(), Some(true));
        assert_eq!(ExtensionValue::Text("TRUE".into()).as_bool(), Some(true));
        assert_eq!(ExtensionValue::Text("nope".into()).as_bool(), None);
        assert_eq!(ExtensionValue::Text("False".into()).as_bool(), Some(false));
        assert_eq!(ExtensionValue::Text(" FALSE ".into()).as_bool(), Some(false));
        assert_eq!(ExtensionValue::Text("false".into()).as_bool(), Some(false));
        assert_eq!(ExtensionValue::Bool(true).as_f64(), Some(1.0));
        assert_eq!(ExtensionValue::Text(" 3.5 ".into()).as_f64(), Some(3.5));
        assert_eq!(ExtensionValue::from(json!(7)), ExtensionValue::Number(7.0));
        assert_eq!(
            ExtensionValue::from(json!([1, 2])),
            ExtensionValue::Object(json!([1, 2]))
        );
    }
}
