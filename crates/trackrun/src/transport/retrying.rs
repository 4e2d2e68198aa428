// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::TransportError;
use crate::retry::RetryStrategy;
use crate::transport::{AlertState, CreatedRun, Payload, RecordKind, Transport};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Applies a [`RetryStrategy`] to every call of the wrapped transport.
#[derive(Clone)]
pub struct RetryingTransport {
    inner: Arc<dyn Transport>,
    strategy: RetryStrategy,
}

impl RetryingTransport {
    pub fn new(inner: Arc<dyn Transport>, strategy: RetryStrategy) -> Self {
        Self { inner, strategy }
    }
}

#[async_trait]
impl Transport for RetryingTransport {
    async fn create_run(&self, data: &Value) -> Result<CreatedRun, TransportError> {
        self.strategy
            .run("create run", || self.inner.create_run(data))
            .await
    }

    async fn heartbeat(&self, run: &str) -> Result<(), TransportError> {
        self.strategy
            .run("send heartbeat", || self.inner.heartbeat(run))
            .await
    }

    async fn send(
        &self,
        kind: RecordKind,
        payload: &Payload,
    ) -> Result<Option<Value>, TransportError> {
        let what = format!("send {}", kind.prefix());
        self.strategy
            .run(&what, || self.inner.send(kind, payload))
            .await
    }

    async fn list_alerts(&self) -> Result<Vec<Value>, TransportError> {
        self.strategy
            .run("list alerts", || self.inner.list_alerts())
            .await
    }

    async fn set_alert_state(
        &self,
        run: &str,
        alert: &str,
        state: AlertState,
    ) -> Result<(), TransportError> {
        self.strategy
            .run("set alert state", || {
                self.inner.set_alert_state(run, alert, state)
            })
            .await
    }
}
