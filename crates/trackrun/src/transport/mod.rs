// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Everything that leaves the process goes through a [`Transport`]: the
//! HTTP client for online runs, the journal writer for offline ones, and the
//! retrying decorator wrapped around either.

use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::Value;

pub mod offline;
pub mod remote;
pub mod retrying;

pub use offline::OfflineTransport;
pub use remote::RemoteTransport;
pub use retrying::RetryingTransport;

/// Record categories, each with a fixed journal prefix and server endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Metrics,
    Event,
    Update,
    Folder,
    Alert,
    File,
}

impl RecordKind {
    pub const ALL: [RecordKind; 6] = [
        RecordKind::Metrics,
        RecordKind::Event,
        RecordKind::Update,
        RecordKind::Folder,
        RecordKind::Alert,
        RecordKind::File,
    ];

    /// Journal file name prefix
    pub fn prefix(self) -> &'static str {
        match self {
            RecordKind::Metrics => "metrics",
            RecordKind::Event => "event",
            RecordKind::Update => "update",
            RecordKind::Folder => "folder",
            RecordKind::Alert => "alert",
            RecordKind::File => "file",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        RecordKind::ALL
            .into_iter()
            .find(|kind| kind.prefix() == prefix)
    }
}

/// Serialized body of one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// msgpack encoded batch
    Binary(Vec<u8>),
    Json(Value),
}

/// Server side identity of a freshly created run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreatedRun {
    pub name: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertState {
    Ok,
    Critical,
}

impl AlertState {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertState::Ok => "ok",
            AlertState::Critical => "critical",
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Registers a run from its creation payload.
    async fn create_run(&self, data: &Value) -> Result<CreatedRun, TransportError>;

    /// Liveness signal for `run`.
    async fn heartbeat(&self, run: &str) -> Result<(), TransportError>;

    /// Delivers one record; returns the server's response body when it has
    /// one worth reading (created alert, registered file).
    async fn send(&self, kind: RecordKind, payload: &Payload)
        -> Result<Option<Value>, TransportError>;

    /// Alerts already defined for the current user.
    async fn list_alerts(&self) -> Result<Vec<Value>, TransportError>;

    async fn set_alert_state(
        &self,
        run: &str,
        alert: &str,
        state: AlertState,
    ) -> Result<(), TransportError>;
}
