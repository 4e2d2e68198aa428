// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::TransportError;
use crate::transport::{Payload, RecordKind, Transport};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error};
use trackrun_dispatch::{Attributes, Delivery, QueueItem};

pub const METRICS: &str = "metrics";
pub const EVENTS: &str = "events";

/// Dispatcher categories of a run, in visiting order.
pub const CATEGORIES: [&str; 2] = [METRICS, EVENTS];

/// Hands dispatcher buffers to a [`Transport`] as msgpack batches.
pub struct TransportDelivery {
    transport: Arc<dyn Transport>,
}

impl TransportDelivery {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Encodes `buffer` as `{"run": <run>, <category>: [items]}`.
    pub fn encode(
        buffer: Vec<QueueItem>,
        category: &str,
        attributes: &Attributes,
    ) -> Result<(RecordKind, Payload), TransportError> {
        let kind = match category {
            METRICS => RecordKind::Metrics,
            EVENTS => RecordKind::Event,
            other => {
                return Err(TransportError::Serialization(format!(
                    "no record kind for category '{other}'"
                )))
            }
        };

        let mut body = Map::new();
        body.insert(
            "run".to_string(),
            attributes.get("run").cloned().unwrap_or(Value::Null),
        );
        body.insert(
            category.to_string(),
            Value::Array(buffer.into_iter().map(QueueItem::into_value).collect()),
        );
        let bytes = rmp_serde::to_vec_named(&Value::Object(body))?;
        Ok((kind, Payload::Binary(bytes)))
    }
}

#[async_trait]
impl Delivery for TransportDelivery {
    async fn deliver(&self, buffer: Vec<QueueItem>, category: &str, attributes: &Attributes) {
        let count = buffer.len();
        debug!("Executing '{category}' callback on buffer of {count} items");
        let (kind, payload) = match Self::encode(buffer, category, attributes) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Unable to encode {count} {category} items: {e}");
                return;
            }
        };
        if let Err(e) = self.transport.send(kind, &payload).await {
            error!("Failed to send {count} {category} items, dropping them: {e}");
        }
    }
}
