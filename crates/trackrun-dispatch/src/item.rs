// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Records travelling through the dispatch queues.
//!
//! A [`QueueItem`] is an opaque JSON object describing one metric point, one
//! event or one control update. Items are immutable once built: the dispatcher
//! only moves them from a queue into a buffer and hands the buffer to the
//! delivery callback.

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Wall-clock format shared by every timestamp the service accepts.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Extra arguments handed to the delivery callback alongside every buffer.
pub type Attributes = Map<String, Value>;

/// Returns the current UTC time in the service timestamp format
/// (`YYYY-MM-DD HH:MM:SS.ffffff`).
pub fn timestamp_now() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Checks that a user supplied timestamp matches `YYYY-MM-DD HH:MM:SS.ffffff`.
///
/// ```
/// use trackrun_dispatch::item::validate_timestamp;
///
/// assert!(validate_timestamp("2024-03-01 12:00:00.000001"));
/// assert!(!validate_timestamp("2024-03-01T12:00:00"));
/// ```
pub fn validate_timestamp(timestamp: &str) -> bool {
    NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%d %H:%M:%S%.f").is_ok()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueItem(Map<String, Value>);

impl QueueItem {
    /// Builds a metrics point: `values`, `time` since run start, `timestamp`
    /// and the run `step`.
    pub fn metrics(values: Map<String, Value>, time: f64, timestamp: String, step: u64) -> Self {
        let mut payload = Map::new();
        payload.insert("values".to_string(), Value::Object(values));
        payload.insert("time".to_string(), Value::from(time));
        payload.insert("timestamp".to_string(), Value::String(timestamp));
        payload.insert("step".to_string(), Value::from(step));
        Self(payload)
    }

    pub fn event(message: impl Into<String>, timestamp: String) -> Self {
        let mut payload = Map::new();
        payload.insert("message".to_string(), Value::String(message.into()));
        payload.insert("timestamp".to_string(), Value::String(timestamp));
        Self(payload)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}
