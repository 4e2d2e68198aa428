// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::TransportError;
use crate::journal::{Marker, RunJournal};
use crate::transport::{AlertState, CreatedRun, Payload, RecordKind, Transport};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Writes every call into the journal directory of a single run, for a
/// later sweep to replay.
#[derive(Debug, Clone)]
pub struct OfflineTransport {
    journal: RunJournal,
}

impl OfflineTransport {
    pub fn new(journal: RunJournal) -> Self {
        Self { journal }
    }

    pub fn journal(&self) -> &RunJournal {
        &self.journal
    }

    /// Mirrors a status change onto the markers. `created` is left alone,
    /// that marker records the server side creation done by a sweep.
    fn mark_status(&self, status: &str) -> Result<(), TransportError> {
        let Some(marker) = Marker::from_status(status) else {
            return Ok(());
        };
        if marker == Marker::Created {
            return Ok(());
        }
        self.journal.touch(marker)?;
        if marker.is_terminal() {
            self.journal.remove(Marker::Running)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for OfflineTransport {
    async fn create_run(&self, data: &Value) -> Result<CreatedRun, TransportError> {
        self.journal.write_run(data)?;
        if let Some(status) = data.get("status").and_then(Value::as_str) {
            self.mark_status(status)?;
        }
        debug!("Journaled run {} in {:?}", self.journal.uid(), self.journal.dir());
        Ok(CreatedRun {
            name: data.get("name").and_then(Value::as_str).map(str::to_string),
            id: None,
        })
    }

    async fn heartbeat(&self, _run: &str) -> Result<(), TransportError> {
        self.journal.touch(Marker::Heartbeat)?;
        Ok(())
    }

    async fn send(
        &self,
        kind: RecordKind,
        payload: &Payload,
    ) -> Result<Option<Value>, TransportError> {
        let path = self.journal.write_record(kind, payload)?;
        debug!("Journaled {} record {:?}", kind.prefix(), path);
        if let (RecordKind::Update, Payload::Json(update)) = (kind, payload) {
            if let Some(status) = update.get("status").and_then(Value::as_str) {
                self.mark_status(status)?;
            }
        }
        Ok(None)
    }

    async fn list_alerts(&self) -> Result<Vec<Value>, TransportError> {
        Ok(Vec::new())
    }

    async fn set_alert_state(
        &self,
        _run: &str,
        _alert: &str,
        _state: AlertState,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("Setting alert state"))
    }
}
