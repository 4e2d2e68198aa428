// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::{json, Map, Value};

/// Condition evaluated over a metric window
#[derive(Debug, Clone, PartialEq)]
pub enum AlertRule {
    Above { threshold: f64 },
    Below { threshold: f64 },
    InsideRange { low: f64, high: f64 },
    OutsideRange { low: f64, high: f64 },
}

impl AlertRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertRule::Above { .. } => "is above",
            AlertRule::Below { .. } => "is below",
            AlertRule::InsideRange { .. } => "is inside range",
            AlertRule::OutsideRange { .. } => "is outside range",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertSource {
    Metrics {
        metric: String,
        /// Number of points the rule is evaluated over
        window: u32,
        rule: AlertRule,
    },
    Events {
        pattern: String,
    },
    /// Raised and cleared explicitly through `log_alert`
    User,
}

impl AlertSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSource::Metrics { .. } => "metrics",
            AlertSource::Events { .. } => "events",
            AlertSource::User => "user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Notification {
    #[default]
    None,
    Email,
}

impl Notification {
    pub fn as_str(self) -> &'static str {
        match self {
            Notification::None => "none",
            Notification::Email => "email",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertDefinition {
    pub name: String,
    pub description: Option<String>,
    pub source: AlertSource,
    /// Minutes between evaluations
    pub frequency: Option<u32>,
    pub notification: Notification,
}

impl AlertDefinition {
    pub fn new(name: impl Into<String>, source: AlertSource) -> Self {
        Self {
            name: name.into(),
            description: None,
            source,
            frequency: None,
            notification: Notification::None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("alert name cannot be empty".to_string());
        }
        match &self.source {
            AlertSource::Metrics { metric, window, rule } => {
                if metric.is_empty() {
                    return Err("metric must be defined for metrics alerts".to_string());
                }
                if *window == 0 {
                    return Err("window must be greater than 0".to_string());
                }
                if let AlertRule::InsideRange { low, high } | AlertRule::OutsideRange { low, high } =
                    rule
                {
                    if low > high {
                        return Err("range_low must not exceed range_high".to_string());
                    }
                }
                Ok(())
            }
            AlertSource::Events { pattern } if pattern.is_empty() => {
                Err("pattern must be defined for events alerts".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Request body creating this alert.
    pub fn to_value(&self) -> Value {
        let alert = match &self.source {
            AlertSource::Metrics {
                metric,
                window,
                rule,
            } => {
                let mut alert = Map::new();
                alert.insert("metric".to_string(), json!(metric));
                alert.insert("window".to_string(), json!(window));
                alert.insert("rule".to_string(), json!(rule.as_str()));
                match rule {
                    AlertRule::Above { threshold } | AlertRule::Below { threshold } => {
                        alert.insert("threshold".to_string(), json!(threshold));
                    }
                    AlertRule::InsideRange { low, high } | AlertRule::OutsideRange { low, high } => {
                        alert.insert("range_low".to_string(), json!(low));
                        alert.insert("range_high".to_string(), json!(high));
                    }
                }
                Value::Object(alert)
            }
            AlertSource::Events { pattern } => json!({ "pattern": pattern }),
            AlertSource::User => Value::Null,
        };

        let mut body = json!({
            "name": self.name,
            "frequency": self.frequency,
            "notification": self.notification.as_str(),
            "source": self.source.as_str(),
            "alert": alert,
        });
        if let Some(description) = &self.description {
            body["description"] = json!(description);
        }
        body
    }

    /// Whether an alert returned by the server can stand in for this one.
    ///
    /// Only the fields the existing alert actually sets are compared.
    pub fn matches(&self, existing: &Value) -> bool {
        let wanted = self.to_value();
        ["name", "description", "source", "frequency", "notification"]
            .iter()
            .filter_map(|key| existing.get(*key).map(|value| (*key, value)))
            .filter(|(_, value)| is_set(value))
            .all(|(key, value)| wanted.get(key) == Some(value))
    }
}

fn is_set(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(set) => *set,
        Value::String(text) => !text.is_empty(),
        Value::Number(number) => number.as_f64() != Some(0.0),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}
