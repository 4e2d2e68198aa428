// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Run lifecycle controller.
//!
//! A [`Run`] moves through `created -> running -> {completed, failed,
//! terminated}`. While running it owns a dispatcher for metrics and events
//! and a worker for heartbeats and resource metrics; every other record is
//! sent straight through the transport. Call errors are logged and reported
//! as `Ok(false)` when `suppress_errors` is set, and returned otherwise.

use crate::alert::AlertDefinition;
use crate::config::{token_expired, ClientConfig, Mode, RunOptions};
use crate::delivery::{TransportDelivery, CATEGORIES, EVENTS, METRICS};
use crate::error::RunError;
use crate::files::{describe_file, FileCategory};
use crate::journal::RunJournal;
use crate::resources::{ResourceProbe, SysinfoProbe};
use crate::retry::RetryStrategy;
use crate::transport::{
    AlertState, OfflineTransport, Payload, RecordKind, RemoteTransport, RetryingTransport,
    Transport,
};
use crate::worker::{Worker, WorkerConfig};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trackrun_dispatch::item::{timestamp_now, validate_timestamp};
use trackrun_dispatch::{build_dispatcher, Attributes, Dispatcher, QueueItem};

const NAME_PATTERN: &str = r"^[a-zA-Z0-9\-_\s/.:]+$";
/// Time given to in-flight sends after a failed child process
pub const PROCESS_FAILURE_GRACE: Duration = Duration::from_secs(1);
const STD_OUT_TAIL: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
    Terminated,
    Lost,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Terminated => "terminated",
            RunStatus::Lost => "lost",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Created | RunStatus::Running)
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub name: Option<String>,
    pub metadata: Map<String, Value>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub folder: String,
    /// Start in `running`; otherwise the run stays `created` until
    /// [`Run::reconnect`].
    pub running: bool,
    /// Retention period in seconds
    pub ttl: Option<u64>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            name: None,
            metadata: Map::new(),
            tags: Vec::new(),
            description: None,
            folder: "/".to_string(),
            running: true,
            ttl: None,
        }
    }
}

/// Completion report of an external process attached to the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub status_code: i32,
    pub std_out: String,
    pub std_err: String,
}

/// How the code tracked by the run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Interrupted,
    Failed(String),
}

impl RunOutcome {
    fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Success => RunStatus::Completed,
            RunOutcome::Interrupted => RunStatus::Terminated,
            RunOutcome::Failed(_) => RunStatus::Failed,
        }
    }

    fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::Interrupted => 130,
            RunOutcome::Failed(_) => 1,
        }
    }
}

pub struct Run {
    mode: Mode,
    config: ClientConfig,
    options: RunOptions,
    uid: String,
    name: Option<String>,
    id: Option<String>,
    status: Option<RunStatus>,
    transport: Option<Arc<dyn Transport>>,
    probe: Option<Box<dyn ResourceProbe>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    worker: Option<Worker>,
    termination: CancellationToken,
    // worker tasks shut down once the last strong reference is gone
    owner: Arc<()>,
    started: Instant,
    step: u64,
    aborted: bool,
    closed: bool,
    exits: Vec<(String, ProcessExit)>,
}

impl Run {
    pub fn new(mode: Mode, config: ClientConfig) -> Self {
        Self {
            mode,
            config,
            options: RunOptions::default(),
            uid: uuid::Uuid::new_v4().to_string(),
            name: None,
            id: None,
            status: None,
            transport: None,
            probe: None,
            dispatcher: None,
            worker: None,
            termination: CancellationToken::new(),
            owner: Arc::new(()),
            started: Instant::now(),
            step: 0,
            aborted: false,
            closed: false,
            exits: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Uses `transport` instead of the one derived from the mode.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Box<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn status(&self) -> Option<RunStatus> {
        self.status
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Worst exit code reported through [`Run::process_completed`].
    pub fn exit_status(&self) -> i32 {
        self.exits
            .iter()
            .map(|(_, exit)| exit.status_code)
            .find(|code| *code != 0)
            .unwrap_or(0)
    }

    /// Reports `err` according to the error mode.
    fn fail(&self, err: RunError) -> Result<bool, RunError> {
        if self.options.suppress_errors {
            error!("{err}");
            Ok(false)
        } else {
            Err(err)
        }
    }

    fn reject(&self, err: RunError) -> Result<bool, RunError> {
        match err {
            RunError::Aborted if self.options.suppress_errors => Ok(false),
            err => self.fail(err),
        }
    }

    /// Checks shared by every operation on an initialised run.
    fn ready(&self, action: &'static str, need_running: bool) -> Result<Arc<dyn Transport>, RunError> {
        if self.aborted {
            return Err(RunError::Aborted);
        }
        if self.mode == Mode::Disabled {
            return Err(RunError::Disabled(action));
        }
        let Some(transport) = self.transport.clone().filter(|_| self.name.is_some()) else {
            return Err(RunError::NotInitialised);
        };
        if self.closed {
            return Err(RunError::InvalidState(format!(
                "Cannot {action}, run has been closed"
            )));
        }
        if need_running && self.status != Some(RunStatus::Running) {
            return Err(RunError::InvalidState(format!(
                "Cannot {action}, run is not running"
            )));
        }
        Ok(transport)
    }

    /// Moves the run into the aborted condition after a fatal error.
    async fn abort(&mut self, err: RunError) -> Result<bool, RunError> {
        self.termination.cancel();
        if let (Some(transport), Some(name)) = (self.transport.clone(), self.name.clone()) {
            if self.status.is_some() {
                let update = json!({"name": name, "status": RunStatus::Lost.as_str()});
                if let Err(e) = transport
                    .send(RecordKind::Update, &Payload::Json(update))
                    .await
                {
                    debug!("Unable to mark aborted run {name} as lost: {e}");
                }
            }
        }
        self.aborted = true;
        self.fail(err)
    }

    fn build_transport(&self) -> Result<Arc<dyn Transport>, RunError> {
        if let Some(transport) = &self.transport {
            return Ok(transport.clone());
        }
        match self.mode {
            Mode::Online => {
                let (Some(url), Some(token)) = (&self.config.url, &self.config.token) else {
                    return Err(RunError::InvalidConfig(
                        "Unable to get URL and token from the environment".to_string(),
                    ));
                };
                let remote = RemoteTransport::new(url, token, self.config.https_proxy.as_deref())?;
                Ok(Arc::new(RetryingTransport::new(
                    Arc::new(remote),
                    RetryStrategy::default(),
                )))
            }
            Mode::Offline => {
                let journal = RunJournal::create(&self.config.offline_directory, &self.uid)?;
                Ok(Arc::new(OfflineTransport::new(journal)))
            }
            Mode::Disabled => Err(RunError::Disabled("create a transport")),
        }
    }

    /// Checks that must pass before anything is sent; failures abort the run.
    fn check_credentials(&self) -> Result<(), RunError> {
        self.config.validate(self.mode)?;
        if self.mode == Mode::Online {
            let token = self.config.token.as_deref().unwrap_or_default();
            if token_expired(token, chrono::Utc::now().timestamp()) {
                return Err(RunError::TokenExpired);
            }
        }
        Ok(())
    }

    /// Creates the run and, unless `options.running` is unset, starts it.
    pub async fn init(&mut self, options: InitOptions) -> Result<bool, RunError> {
        if self.aborted {
            return self.reject(RunError::Aborted);
        }
        if self.mode == Mode::Disabled {
            return self.fail(RunError::Disabled("initialise run"));
        }
        if self.status.is_some() {
            return self.fail(RunError::InvalidState(
                "Run has already been initialised".to_string(),
            ));
        }
        if let Err(e) = self.options.validate() {
            return self.fail(e);
        }
        if let Some(name) = options.name.as_deref().filter(|name| !valid_name(name)) {
            return self.fail(RunError::InvalidArgument(format!(
                "Specified name '{name}' is invalid"
            )));
        }
        if !options.folder.starts_with('/') {
            return self.fail(RunError::InvalidArgument(
                "Folder must begin with a '/'".to_string(),
            ));
        }

        if let Err(e) = self.check_credentials() {
            return self.abort(e).await;
        }
        let transport = match self.build_transport() {
            Ok(transport) => transport,
            Err(e) => return self.abort(e).await,
        };
        self.transport = Some(transport.clone());

        let name = match (&options.name, self.mode) {
            (Some(name), _) => Some(name.clone()),
            (None, Mode::Offline) => Some(default_name(&self.uid)),
            (None, _) => None,
        };
        let status = if options.running {
            RunStatus::Running
        } else {
            RunStatus::Created
        };

        let mut data = json!({
            "metadata": options.metadata,
            "tags": options.tags,
            "status": status.as_str(),
            "ttl": options.ttl,
            "folder": options.folder,
        });
        if let Some(name) = &name {
            data["name"] = json!(name);
        }
        if let Some(description) = &options.description {
            data["description"] = json!(description);
        }
        if status == RunStatus::Running {
            data["system"] = system_info();
        }

        let created = match transport.create_run(&data).await {
            Ok(created) => created,
            Err(e) => return self.abort(e.into()).await,
        };
        self.name = created.name.or(name);
        self.id = created.id;
        if self.name.is_none() {
            return self
                .abort(RunError::InvalidState(
                    "Server did not return a run name".to_string(),
                ))
                .await;
        }
        self.status = Some(status);
        info!(
            "Run {} created with status {}",
            self.name.as_deref().unwrap_or_default(),
            status.as_str()
        );

        if status == RunStatus::Running {
            self.start();
        }
        Ok(true)
    }

    /// Starts the dispatcher and the worker.
    fn start(&mut self) {
        let (Some(transport), Some(name)) = (self.transport.clone(), self.name.clone()) else {
            return;
        };
        self.started = Instant::now();

        let mut attributes = Attributes::new();
        attributes.insert("run".to_string(), Value::String(name.clone()));
        let dispatcher = build_dispatcher(
            self.options.dispatch_mode,
            Arc::new(TransportDelivery::new(transport.clone())),
            &CATEGORIES,
            self.termination.clone(),
            attributes,
            self.options.dispatcher_config(),
        );
        dispatcher.start();

        let probe = if self.options.disable_resources_metrics {
            None
        } else {
            let pid = self.options.pid.unwrap_or_else(std::process::id);
            let probe: Box<dyn ResourceProbe> = match self.probe.take() {
                Some(probe) => probe,
                None => Box::new(SysinfoProbe::new(pid)),
            };
            Some(probe)
        };
        let worker = Worker::spawn(
            name,
            transport,
            dispatcher.clone(),
            probe,
            Arc::downgrade(&self.owner),
            self.termination.clone(),
            WorkerConfig {
                heartbeat_interval: self.options.heartbeat_interval,
                resources_interval: (!self.options.disable_resources_metrics)
                    .then_some(self.options.resources_metrics_interval),
                queue_blocking: self.options.queue_blocking,
                ..Default::default()
            },
        );

        self.dispatcher = Some(dispatcher);
        self.worker = Some(worker);
    }

    /// Resumes a run left in `created`, by this process or another one.
    ///
    /// `uid` selects the journal directory of an offline run.
    pub async fn reconnect(&mut self, run: &str, uid: Option<&str>) -> Result<bool, RunError> {
        if self.aborted {
            return self.reject(RunError::Aborted);
        }
        if self.mode == Mode::Disabled {
            return self.fail(RunError::Disabled("reconnect"));
        }
        if matches!(self.status, Some(status) if status != RunStatus::Created) || self.closed {
            return self.fail(RunError::InvalidState(
                "Only runs in the created state can be reconnected".to_string(),
            ));
        }

        if let Err(e) = self.check_credentials() {
            return self.abort(e).await;
        }
        if let Some(uid) = uid {
            self.uid = uid.to_string();
        }
        let transport = match self.build_transport() {
            Ok(transport) => transport,
            Err(e) => return self.abort(e).await,
        };
        self.transport = Some(transport.clone());
        self.name = Some(run.to_string());

        let update = json!({"name": run, "status": RunStatus::Running.as_str()});
        if let Err(e) = transport
            .send(RecordKind::Update, &Payload::Json(update))
            .await
        {
            return self.abort(e.into()).await;
        }
        self.status = Some(RunStatus::Running);
        info!("Reconnected to run {run}");
        self.start();
        Ok(true)
    }

    pub async fn log_event(&mut self, message: &str, timestamp: Option<&str>) -> Result<bool, RunError> {
        if let Err(e) = self.ready("log event", true) {
            return self.reject(e);
        }
        if let Some(timestamp) = timestamp.filter(|timestamp| !validate_timestamp(timestamp)) {
            return self.fail(RunError::InvalidArgument(format!(
                "Invalid timestamp format '{timestamp}'"
            )));
        }
        let item = QueueItem::event(
            message,
            timestamp.map_or_else(timestamp_now, str::to_string),
        );
        self.enqueue(item, EVENTS).await
    }

    /// Queues one metrics point.
    ///
    /// `step` defaults to an internal counter, incremented on every call;
    /// `time` defaults to the seconds elapsed since the run started.
    pub async fn log_metrics(
        &mut self,
        values: Map<String, Value>,
        step: Option<u64>,
        time: Option<f64>,
        timestamp: Option<&str>,
    ) -> Result<bool, RunError> {
        if let Err(e) = self.ready("log metrics", true) {
            return self.reject(e);
        }
        if let Some((name, _)) = values.iter().find(|(_, value)| !value.is_number()) {
            return self.fail(RunError::InvalidArgument(format!(
                "Metric '{name}' is not a number"
            )));
        }
        if let Some(timestamp) = timestamp.filter(|timestamp| !validate_timestamp(timestamp)) {
            return self.fail(RunError::InvalidArgument(format!(
                "Invalid timestamp format '{timestamp}'"
            )));
        }

        let item = QueueItem::metrics(
            values,
            time.unwrap_or_else(|| self.started.elapsed().as_secs_f64()),
            timestamp.map_or_else(timestamp_now, str::to_string),
            step.unwrap_or(self.step),
        );
        self.step += 1;
        self.enqueue(item, METRICS).await
    }

    async fn enqueue(&self, item: QueueItem, category: &str) -> Result<bool, RunError> {
        let Some(dispatcher) = &self.dispatcher else {
            return self.fail(RunError::InvalidState(
                "Run has no active dispatcher".to_string(),
            ));
        };
        match dispatcher
            .add_item(item, category, self.options.queue_blocking)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) => self.fail(e.into()),
        }
    }

    async fn send_update(
        &self,
        transport: &Arc<dyn Transport>,
        mut update: Map<String, Value>,
    ) -> Result<bool, RunError> {
        update.insert(
            "name".to_string(),
            json!(self.name.as_deref().unwrap_or_default()),
        );
        match transport
            .send(RecordKind::Update, &Payload::Json(Value::Object(update)))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => self.fail(e.into()),
        }
    }

    pub async fn update_metadata(&mut self, metadata: Map<String, Value>) -> Result<bool, RunError> {
        let transport = match self.ready("update metadata", false) {
            Ok(transport) => transport,
            Err(e) => return self.reject(e),
        };
        let mut update = Map::new();
        update.insert("metadata".to_string(), Value::Object(metadata));
        self.send_update(&transport, update).await
    }

    pub async fn update_tags(&mut self, tags: Vec<String>) -> Result<bool, RunError> {
        let transport = match self.ready("update tags", false) {
            Ok(transport) => transport,
            Err(e) => return self.reject(e),
        };
        let mut update = Map::new();
        update.insert("tags".to_string(), json!(tags));
        self.send_update(&transport, update).await
    }

    /// Sets a final status; only `completed`, `failed` and `terminated` may
    /// be set explicitly.
    pub async fn set_status(&mut self, status: RunStatus) -> Result<bool, RunError> {
        let transport = match self.ready("set status", false) {
            Ok(transport) => transport,
            Err(e) => return self.reject(e),
        };
        if !matches!(
            status,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Terminated
        ) {
            return self.fail(RunError::InvalidArgument(format!(
                "Invalid status '{}'",
                status.as_str()
            )));
        }
        let mut update = Map::new();
        update.insert("status".to_string(), json!(status.as_str()));
        let sent = self.send_update(&transport, update).await?;
        if sent {
            self.status = Some(status);
        }
        Ok(sent)
    }

    pub async fn set_folder_details(
        &mut self,
        path: &str,
        metadata: Option<Map<String, Value>>,
        tags: Option<Vec<String>>,
        description: Option<&str>,
    ) -> Result<bool, RunError> {
        let transport = match self.ready("set folder details", false) {
            Ok(transport) => transport,
            Err(e) => return self.reject(e),
        };
        if !path.starts_with('/') {
            return self.fail(RunError::InvalidArgument(
                "Folder must begin with a '/'".to_string(),
            ));
        }

        let mut folder = Map::new();
        folder.insert("path".to_string(), json!(path));
        if let Some(metadata) = metadata {
            folder.insert("metadata".to_string(), Value::Object(metadata));
        }
        if let Some(tags) = tags {
            folder.insert("tags".to_string(), json!(tags));
        }
        if let Some(description) = description {
            folder.insert("description".to_string(), json!(description));
        }
        match transport
            .send(RecordKind::Folder, &Payload::Json(Value::Object(folder)))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => self.fail(e.into()),
        }
    }

    /// Creates `alert` unless an identical one exists, then attaches it to
    /// the run.
    ///
    /// Offline, the alert is journaled and attached by the sweep once the
    /// server has assigned it an id.
    pub async fn add_alert(&mut self, alert: AlertDefinition) -> Result<bool, RunError> {
        let transport = match self.ready("add alert", false) {
            Ok(transport) => transport,
            Err(e) => return self.reject(e),
        };
        if let Err(message) = alert.validate() {
            return self.fail(RunError::InvalidArgument(message));
        }

        let existing = match transport.list_alerts().await {
            Ok(existing) => existing,
            Err(e) => return self.fail(e.into()),
        };
        let mut alert_id = existing
            .iter()
            .filter(|candidate| candidate.get("name") == Some(&json!(alert.name)))
            .find(|candidate| alert.matches(candidate))
            .and_then(|candidate| candidate.get("id").cloned());
        if let Some(id) = &alert_id {
            info!("Existing alert found with id: {id}");
        }

        if alert_id.is_none() {
            let response = match transport
                .send(RecordKind::Alert, &Payload::Json(alert.to_value()))
                .await
            {
                Ok(response) => response,
                Err(e) => return self.fail(e.into()),
            };
            alert_id = response.and_then(|body| body.get("id").cloned());
        }

        match alert_id {
            Some(id) => {
                let mut update = Map::new();
                update.insert("alerts".to_string(), json!([id]));
                self.send_update(&transport, update).await
            }
            None if self.mode == Mode::Offline => Ok(true),
            None => self.fail(RunError::InvalidState(format!(
                "Unable to create alert '{}'",
                alert.name
            ))),
        }
    }

    pub async fn log_alert(&mut self, name: &str, state: AlertState) -> Result<bool, RunError> {
        let transport = match self.ready("log alert", false) {
            Ok(transport) => transport,
            Err(e) => return self.reject(e),
        };
        let run = self.name.clone().unwrap_or_default();
        match transport.set_alert_state(&run, name, state).await {
            Ok(()) => Ok(true),
            Err(e) => self.fail(e.into()),
        }
    }

    /// Registers a file with the run. Output files cannot be registered
    /// while the run is still `created`.
    pub async fn save_file(
        &mut self,
        path: &Path,
        category: FileCategory,
        mime: Option<&str>,
        name: Option<&str>,
    ) -> Result<bool, RunError> {
        let transport = match self.ready("save file", false) {
            Ok(transport) => transport,
            Err(e) => return self.reject(e),
        };
        if self.status == Some(RunStatus::Created) && category == FileCategory::Output {
            return self.fail(RunError::InvalidState(
                "Cannot upload output files for runs in the created state".to_string(),
            ));
        }

        let body = match describe_file(
            path,
            category,
            mime,
            name,
            self.name.as_deref().unwrap_or_default(),
            self.options.storage_id.as_deref(),
        ) {
            Ok(body) => body,
            Err(message) => return self.fail(RunError::InvalidArgument(message)),
        };
        match transport.send(RecordKind::File, &Payload::Json(body)).await {
            Ok(_) => Ok(true),
            Err(e) => self.fail(e.into()),
        }
    }

    /// Records the exit of an attached process. A non-zero exit discards
    /// pending items, logs the process output as an event and fails the run.
    pub async fn process_completed(
        &mut self,
        identifier: &str,
        exit: ProcessExit,
    ) -> Result<bool, RunError> {
        let code = exit.status_code;
        let message = if exit.std_err.trim().is_empty() {
            let lines: Vec<&str> = exit.std_out.lines().collect();
            lines[lines.len().saturating_sub(STD_OUT_TAIL)..].join("\n")
        } else {
            exit.std_err.clone()
        };
        self.exits.push((identifier.to_string(), exit));
        if code == 0 {
            debug!("Process {identifier} completed");
            return Ok(true);
        }

        warn!("Process {identifier} exited with status {code}");
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.purge();
        }
        // The run is failed even when the event cannot be logged
        if let Err(e) = self
            .log_event(
                &format!("Process {identifier} returned non-zero exit status {code}:\n{message}"),
                None,
            )
            .await
        {
            warn!("Unable to log failure of process {identifier}: {e}");
        }
        let failed = self.set_status(RunStatus::Failed).await?;
        tokio::time::sleep(PROCESS_FAILURE_GRACE).await;
        Ok(failed)
    }

    async fn shutdown(&mut self) {
        self.termination.cancel();
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.join().await;
        }
        if let Some(worker) = &self.worker {
            worker.join().await;
        }
    }

    /// Stops the dispatcher and worker, after they flushed what is queued,
    /// then completes a still running run.
    pub async fn close(&mut self) -> Result<bool, RunError> {
        self.close_with(RunStatus::Completed).await
    }

    async fn close_with(&mut self, status: RunStatus) -> Result<bool, RunError> {
        let transport = match self.ready("close run", false) {
            Ok(transport) => transport,
            Err(e) => return self.reject(e),
        };
        self.shutdown().await;
        self.closed = true;

        if self.status == Some(RunStatus::Running) {
            let mut update = Map::new();
            update.insert("status".to_string(), json!(status.as_str()));
            let sent = self.send_update(&transport, update).await?;
            if sent {
                self.status = Some(status);
            }
            return Ok(sent);
        }
        Ok(true)
    }

    /// Ends the run for `outcome` and returns the exit code the process
    /// should use: a failing attached process wins over the outcome.
    pub async fn finish(&mut self, outcome: RunOutcome) -> i32 {
        if let RunOutcome::Failed(message) = &outcome {
            if let Err(e) = self.log_event(message, None).await {
                debug!("Unable to log failure: {e}");
            }
        }
        let status = if self.exit_status() != 0 {
            RunStatus::Failed
        } else {
            outcome.status()
        };
        if let Err(e) = self.close_with(status).await {
            error!("Unable to close run: {e}");
        }

        match self.exit_status() {
            0 => outcome.exit_code(),
            code => code,
        }
    }
}

fn valid_name(name: &str) -> bool {
    Regex::new(NAME_PATTERN)
        .map(|pattern| pattern.is_match(name))
        .unwrap_or(false)
}

fn default_name(uid: &str) -> String {
    format!("run-{}", uid.split('-').next().unwrap_or(uid))
}

fn system_info() -> Value {
    json!({
        "cwd": std::env::current_dir()
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_default(),
        "hostname": sysinfo::System::host_name(),
        "platform": {
            "system": sysinfo::System::name(),
            "release": sysinfo::System::kernel_version(),
            "version": sysinfo::System::os_version(),
        },
        "cpu": {"arch": std::env::consts::ARCH},
        "client": format!("trackrun {}", env!("CARGO_PKG_VERSION")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_name() {
        assert!(valid_name("my-run_1"));
        assert!(valid_name("sweep/lr 0.01:seed.3"));
        assert!(!valid_name("bad*name"));
        assert!(!valid_name(""));
    }

    #[test]
    fn test_default_name_uses_uid_prefix() {
        assert_eq!(
            default_name("0b7c6d2e-93a4-4c1e-8f0b-5d2f6e7a8b9c"),
            "run-0b7c6d2e"
        );
    }

    #[test]
    fn test_outcome_exit_codes() {
        assert_eq!(RunOutcome::Success.exit_code(), 0);
        assert_eq!(RunOutcome::Interrupted.exit_code(), 130);
        assert_eq!(RunOutcome::Failed("boom".into()).exit_code(), 1);
        assert_eq!(RunOutcome::Interrupted.status(), RunStatus::Terminated);
    }

    #[tokio::test]
    async fn test_disabled_run_rejects_calls() {
        let mut run = Run::new(Mode::Disabled, ClientConfig::default());
        assert!(!run.init(InitOptions::default()).await.unwrap());
        assert!(!run.log_event("hello", None).await.unwrap());

        let mut strict = Run::new(Mode::Disabled, ClientConfig::default()).with_options(RunOptions {
            suppress_errors: false,
            ..Default::default()
        });
        let err = strict.init(InitOptions::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "Cannot initialise run, tracking is disabled");
    }

    #[tokio::test]
    async fn test_calls_before_init_fail() {
        let mut run = Run::new(Mode::Offline, ClientConfig::default()).with_options(RunOptions {
            suppress_errors: false,
            ..Default::default()
        });
        let err = run.log_event("hello", None).await.unwrap_err();
        assert!(matches!(err, RunError::NotInitialised));
        assert_eq!(run.exit_status(), 0);
    }

    #[tokio::test]
    async fn test_online_without_credentials_aborts() {
        let mut run = Run::new(Mode::Online, ClientConfig::default());
        assert!(!run.init(InitOptions::default()).await.unwrap());
        assert!(run.is_aborted());
        assert!(!run.log_event("ignored", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_token_aborts() {
        let config = ClientConfig {
            url: Some("https://tracking.example.com".into()),
            token: Some("not-a-jwt".into()),
            ..Default::default()
        };
        let mut run = Run::new(Mode::Online, config).with_options(RunOptions {
            suppress_errors: false,
            ..Default::default()
        });
        let err = run.init(InitOptions::default()).await.unwrap_err();
        assert!(matches!(err, RunError::TokenExpired));
        let err = run.log_event("ignored", None).await.unwrap_err();
        assert!(matches!(err, RunError::Aborted));
    }
}
