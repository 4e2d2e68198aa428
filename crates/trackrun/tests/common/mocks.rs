// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transport double recording every call

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;
use trackrun::transport::CreatedRun;
use trackrun::{AlertState, Payload, RecordKind, Transport, TransportError};

#[derive(Debug, Clone, PartialEq)]
#[allow(dead_code)]
pub enum Call {
    CreateRun(Value),
    Heartbeat(String),
    Send(RecordKind, Payload),
    ListAlerts,
    SetAlertState(String, String, AlertState),
}

#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<Call>>,
    /// Returned by `create_run`
    pub created: Mutex<CreatedRun>,
    /// Returned by `list_alerts`
    pub alerts: Mutex<Vec<Value>>,
    /// Id returned when an alert record is sent
    pub alert_id: Mutex<Option<String>>,
    /// Successful `send` calls allowed before every later one fails
    pub sends_before_failure: Mutex<Option<usize>>,
    /// Makes `create_run` fail
    pub reject_create: Mutex<bool>,
}

#[allow(dead_code)]
impl RecordingTransport {
    pub fn named(name: &str) -> Self {
        let transport = Self::default();
        *transport.created.lock().unwrap() = CreatedRun {
            name: Some(name.to_string()),
            id: Some(format!("id-{name}")),
        };
        transport
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<(RecordKind, Payload)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Send(kind, payload) => Some((kind, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn sent_kinds(&self) -> Vec<RecordKind> {
        self.sent().into_iter().map(|(kind, _)| kind).collect()
    }

    /// JSON bodies of every update sent
    pub fn updates(&self) -> Vec<Value> {
        self.json_of(RecordKind::Update)
    }

    pub fn json_of(&self, wanted: RecordKind) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter_map(|(kind, payload)| match payload {
                Payload::Json(value) if kind == wanted => Some(value),
                _ => None,
            })
            .collect()
    }

    /// Decoded msgpack batches of `wanted`
    pub fn batches(&self, wanted: RecordKind) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter_map(|(kind, payload)| match payload {
                Payload::Binary(bytes) if kind == wanted => {
                    Some(rmp_serde::from_slice(&bytes).expect("msgpack batch"))
                }
                _ => None,
            })
            .collect()
    }

    pub fn heartbeats(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Heartbeat(_)))
            .count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn create_run(&self, data: &Value) -> Result<CreatedRun, TransportError> {
        self.record(Call::CreateRun(data.clone()));
        if *self.reject_create.lock().unwrap() {
            return Err(TransportError::Status {
                status: 401,
                body: "unauthorized".into(),
            });
        }
        Ok(self.created.lock().unwrap().clone())
    }

    async fn heartbeat(&self, run: &str) -> Result<(), TransportError> {
        self.record(Call::Heartbeat(run.to_string()));
        Ok(())
    }

    async fn send(
        &self,
        kind: RecordKind,
        payload: &Payload,
    ) -> Result<Option<Value>, TransportError> {
        {
            let mut allowed = self.sends_before_failure.lock().unwrap();
            match allowed.as_mut() {
                Some(0) => return Err(TransportError::Network("connection refused".into())),
                Some(remaining) => *remaining -= 1,
                None => {}
            }
        }
        self.record(Call::Send(kind, payload.clone()));
        if kind == RecordKind::Alert {
            if let Some(id) = self.alert_id.lock().unwrap().clone() {
                return Ok(Some(serde_json::json!({ "id": id })));
            }
        }
        Ok(None)
    }

    async fn list_alerts(&self) -> Result<Vec<Value>, TransportError> {
        self.record(Call::ListAlerts);
        Ok(self.alerts.lock().unwrap().clone())
    }

    async fn set_alert_state(
        &self,
        run: &str,
        alert: &str,
        state: AlertState,
    ) -> Result<(), TransportError> {
        self.record(Call::SetAlertState(
            run.to_string(),
            alert.to_string(),
            state,
        ));
        Ok(())
    }
}
