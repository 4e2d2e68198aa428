// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reconciles the offline journal with a real transport.
//!
//! A sweep visits every run directory marked running or finished, creates
//! the run remotely if that never happened, promotes runs without a recent
//! heartbeat to lost, replays pending records in modification-time order and
//! finally marks fully drained finished runs as sent. Two sweeps over the
//! same run directory at once may deliver a record twice.

use crate::error::{JournalError, TransportError};
use crate::journal::{runs_to_sweep, Marker, RecordFile, RunJournal};
use crate::transport::{Payload, RecordKind, Transport};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// Heartbeat age after which a running run is considered lost
pub const STALE_AFTER: Duration = Duration::from_secs(180);

/// Outcome of sweeping one run directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSweep {
    pub uid: String,
    pub name: String,
    /// Status marker found at the start of the sweep
    pub status: Marker,
    /// The run was created remotely during this sweep
    pub created: bool,
    pub went_lost: bool,
    pub replayed: usize,
    /// A record failed to replay; it and every later record stay pending
    pub interrupted: bool,
    pub sent: bool,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub runs: Vec<RunSweep>,
    /// Runs skipped because of an error, keyed by uid
    pub failures: Vec<(String, String)>,
}

impl SweepReport {
    pub fn replayed(&self) -> usize {
        self.runs.iter().map(|run| run.replayed).sum()
    }
}

pub struct Sender {
    root: PathBuf,
    transport: Arc<dyn Transport>,
    stale_after: Duration,
}

impl Sender {
    pub fn new(root: impl Into<PathBuf>, transport: Arc<dyn Transport>) -> Self {
        Self {
            root: root.into(),
            transport,
            stale_after: STALE_AFTER,
        }
    }

    #[must_use]
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Sweeps every run below the journal root once.
    ///
    /// Only failing to list the root is an error; a run that cannot be
    /// swept is logged, reported in [`SweepReport::failures`] and left for
    /// the next sweep.
    pub async fn sweep(&self) -> Result<SweepReport, JournalError> {
        let mut report = SweepReport::default();
        for (journal, status) in runs_to_sweep(&self.root)? {
            let uid = journal.uid();
            match self.sweep_run(&journal, status).await {
                Ok(run) => report.runs.push(run),
                Err(e) => {
                    error!("Unable to sweep run {uid}: {e}");
                    report.failures.push((uid, e.to_string()));
                }
            }
        }
        debug!(
            "Swept {} runs, replayed {} records",
            report.runs.len(),
            report.replayed()
        );
        Ok(report)
    }

    async fn sweep_run(
        &self,
        journal: &RunJournal,
        status: Marker,
    ) -> Result<RunSweep, TransportError> {
        let uid = journal.uid();
        let mut data = journal.read_run()?;
        // read before run.json is possibly rewritten below
        let last_seen = journal
            .modified(Marker::Heartbeat)
            .map_or_else(|| journal.run_modified(), Ok)?;

        let mut run = RunSweep {
            uid: uid.clone(),
            name: data
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(uid.as_str())
                .to_string(),
            status,
            created: false,
            went_lost: false,
            replayed: 0,
            interrupted: false,
            sent: false,
        };
        info!("Considering run with name {} and id {uid}", run.name);

        if !journal.has(Marker::Created) {
            info!("Creating run with name {}", run.name);
            let created = self.transport.create_run(&data).await?;
            let unnamed = data.get("name").is_none();
            if let Some(name) = created.name.filter(|_| unnamed) {
                if let Some(fields) = data.as_object_mut() {
                    fields.insert("name".to_string(), Value::String(name.clone()));
                }
                journal.write_run(&data)?;
                run.name = name;
            }
            journal.touch(Marker::Created)?;
            run.created = true;
        }

        if status == Marker::Running {
            let age = SystemTime::now()
                .duration_since(last_seen)
                .unwrap_or(Duration::ZERO);
            if age > self.stale_after {
                info!(
                    "Changing status to lost, name {} and id {uid}",
                    run.name
                );
                journal.touch(Marker::Lost)?;
                journal.remove(Marker::Running)?;
                run.went_lost = true;
                let update = json!({"name": run.name, "status": Marker::Lost.file_name()});
                if let Err(e) = self
                    .transport
                    .send(RecordKind::Update, &Payload::Json(update))
                    .await
                {
                    warn!("Unable to report run {} as lost: {e}", run.name);
                }
            } else {
                debug!("Sending heartbeat for run with name {}", run.name);
                if let Err(e) = self.transport.heartbeat(&run.name).await {
                    warn!("Unable to send heartbeat for run {}: {e}", run.name);
                }
            }
        }

        let pending = journal.pending_records()?;
        for record in &pending {
            match self.replay(journal, record, &run.name).await {
                Ok(()) => run.replayed += 1,
                Err(e) => {
                    error!(
                        "Unable to replay {} for run {}, stopping: {e}",
                        record.file_name(),
                        run.name
                    );
                    run.interrupted = true;
                    break;
                }
            }
        }

        if status.is_finished() && pending.is_empty() {
            let update = json!({"name": run.name, "status": status.file_name()});
            self.transport
                .send(RecordKind::Update, &Payload::Json(update))
                .await?;
            journal.touch(Marker::Sent)?;
            journal.remove(status)?;
            run.sent = true;
            info!("Finished sending run {}", run.name);
        }

        Ok(run)
    }

    /// Sends one record, renaming it only once delivery succeeded.
    async fn replay(
        &self,
        journal: &RunJournal,
        record: &RecordFile,
        run: &str,
    ) -> Result<(), TransportError> {
        let payload = journal.read_record(record)?;
        debug!("Sending {} for run {run}", record.file_name());
        let response = self.transport.send(record.kind, &payload).await?;

        if record.kind == RecordKind::Alert {
            if let Some(id) = response.as_ref().and_then(|body| body.get("id")) {
                let update = json!({"name": run, "alerts": [id]});
                if let Err(e) = self
                    .transport
                    .send(RecordKind::Update, &Payload::Json(update))
                    .await
                {
                    warn!("Unable to attach alert {id} to run {run}: {e}");
                }
            }
        }

        journal.mark_processed(record)?;
        Ok(())
    }
}
