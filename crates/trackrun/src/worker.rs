// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic activities of a live run: the heartbeat, sent straight to the
//! transport, and the resource sampler, which feeds the metrics queue.

use crate::delivery::METRICS;
use crate::resources::ResourceProbe;
use crate::transport::Transport;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use trackrun_dispatch::item::timestamp_now;
use trackrun_dispatch::{DispatchError, Dispatcher, QueueItem};

pub const OWNER_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub const CPU_USAGE_METRIC: &str = "resources/cpu_usage";
pub const MEMORY_USAGE_METRIC: &str = "resources/memory_usage";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub heartbeat_interval: Duration,
    /// `None` disables the resource sampler
    pub resources_interval: Option<Duration>,
    /// How often the owner's liveness is checked
    pub owner_poll_interval: Duration,
    /// Upper bound on the wait for the dispatcher queues to empty on exit
    pub drain_timeout: Duration,
    pub queue_blocking: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: crate::config::HEARTBEAT_INTERVAL,
            resources_interval: Some(crate::config::RESOURCES_METRICS_INTERVAL),
            owner_poll_interval: OWNER_POLL_INTERVAL,
            drain_timeout: DRAIN_TIMEOUT,
            queue_blocking: false,
        }
    }
}

/// Everything the worker tasks share
#[derive(Clone)]
struct Context {
    run: String,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<dyn Dispatcher>,
    owner: Weak<()>,
    termination: CancellationToken,
    config: WorkerConfig,
}

impl Context {
    /// True once the loops should stop. A vanished owner cancels the run.
    fn owner_gone(&self) -> bool {
        if self.owner.upgrade().is_some() {
            return false;
        }
        if !self.termination.is_cancelled() {
            warn!("Run owner for '{}' is gone, shutting down", self.run);
            self.termination.cancel();
        }
        true
    }
}

/// Owns the heartbeat and resource sampler tasks of one run.
pub struct Worker {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Spawns the worker tasks; they run until `termination` is cancelled or
    /// every strong reference to `owner` has been dropped.
    pub fn spawn(
        run: String,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<dyn Dispatcher>,
        probe: Option<Box<dyn ResourceProbe>>,
        owner: Weak<()>,
        termination: CancellationToken,
        config: WorkerConfig,
    ) -> Self {
        let context = Context {
            run,
            transport,
            dispatcher,
            owner,
            termination,
            config,
        };

        let mut handles = vec![tokio::spawn(heartbeat_loop(context.clone()))];
        match (probe, context.config.resources_interval) {
            (Some(probe), Some(period)) => {
                handles.push(tokio::spawn(sampler_loop(context, probe, period)));
            }
            _ => debug!("Resource metrics disabled for '{}'", context.run),
        }

        Self {
            handles: Mutex::new(handles),
        }
    }

    /// Waits for every worker task to exit.
    pub async fn join(&self) {
        let handles = {
            #[allow(clippy::expect_used)]
            let mut handles = self.handles.lock().expect("lock poisoned");
            std::mem::take(&mut *handles)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {e}");
            }
        }
    }
}

async fn heartbeat_loop(context: Context) {
    let mut heartbeat = interval(context.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut owner = interval(context.config.owner_poll_interval);

    loop {
        tokio::select! {
            biased;
            _ = context.termination.cancelled() => break,
            _ = owner.tick() => {
                if context.owner_gone() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                debug!("Sending heartbeat for '{}'", context.run);
                // a retried heartbeat must not hold up termination
                tokio::select! {
                    biased;
                    _ = context.termination.cancelled() => break,
                    result = context.transport.heartbeat(&context.run) => {
                        if let Err(e) = result {
                            error!("Failed to send heartbeat for '{}': {e}", context.run);
                        }
                    }
                }
            }
        }
    }

    wait_for_drain(&context).await;
    debug!("Heartbeat loop for '{}' exited", context.run);
}

async fn sampler_loop(context: Context, mut probe: Box<dyn ResourceProbe>, period: Duration) {
    let started = Instant::now();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut owner = interval(context.config.owner_poll_interval);
    // first sample only sets the CPU baseline
    let mut baseline = true;

    loop {
        tokio::select! {
            biased;
            _ = context.termination.cancelled() => break,
            _ = owner.tick() => {
                if context.owner_gone() {
                    break;
                }
            }
            _ = ticker.tick() => {
                // refreshing process statistics blocks
                let sampled = tokio::task::spawn_blocking(move || {
                    let sample = probe.sample();
                    (probe, sample)
                })
                .await;
                let sample = match sampled {
                    Ok((returned, sample)) => {
                        probe = returned;
                        sample
                    }
                    Err(e) => {
                        error!("Resource sampler for '{}' failed: {e}", context.run);
                        break;
                    }
                };
                let Some(sample) = sample else {
                    debug!("Sampled process for '{}' is gone", context.run);
                    continue;
                };
                if std::mem::take(&mut baseline) {
                    continue;
                }

                let mut values = Map::new();
                values.insert(CPU_USAGE_METRIC.to_string(), Value::from(sample.cpu_percent));
                values.insert(MEMORY_USAGE_METRIC.to_string(), Value::from(sample.memory_mb));
                let item = QueueItem::metrics(
                    values,
                    started.elapsed().as_secs_f64(),
                    timestamp_now(),
                    0,
                );
                match context
                    .dispatcher
                    .add_item(item, METRICS, context.config.queue_blocking)
                    .await
                {
                    Ok(()) => {}
                    Err(DispatchError::Terminated(_)) => break,
                    Err(e) => warn!("Dropping resource metrics for '{}': {e}", context.run),
                }
            }
        }
    }
    debug!("Resource sampler for '{}' exited", context.run);
}

/// Gives the dispatcher a bounded amount of time to empty its queues.
async fn wait_for_drain(context: &Context) {
    let deadline = Instant::now() + context.config.drain_timeout;
    while !context.dispatcher.is_empty() {
        if Instant::now() >= deadline {
            warn!(
                "Dispatcher for '{}' still holds items after {}s",
                context.run,
                context.config.drain_timeout.as_secs()
            );
            return;
        }
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::resources::ResourceSample;
    use crate::transport::{AlertState, CreatedRun, Payload, RecordKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Beats(AtomicUsize);

    #[async_trait]
    impl Transport for Beats {
        async fn create_run(&self, _: &Value) -> Result<CreatedRun, TransportError> {
            Ok(CreatedRun::default())
        }

        async fn heartbeat(&self, _: &str) -> Result<(), TransportError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, _: RecordKind, _: &Payload) -> Result<Option<Value>, TransportError> {
            Ok(None)
        }

        async fn list_alerts(&self) -> Result<Vec<Value>, TransportError> {
            Ok(Vec::new())
        }

        async fn set_alert_state(&self, _: &str, _: &str, _: AlertState) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Heartbeat that never completes, like one stuck in its retries
    struct Stalled;

    #[async_trait]
    impl Transport for Stalled {
        async fn create_run(&self, _: &Value) -> Result<CreatedRun, TransportError> {
            Ok(CreatedRun::default())
        }

        async fn heartbeat(&self, _: &str) -> Result<(), TransportError> {
            std::future::pending().await
        }

        async fn send(&self, _: RecordKind, _: &Payload) -> Result<Option<Value>, TransportError> {
            Ok(None)
        }

        async fn list_alerts(&self) -> Result<Vec<Value>, TransportError> {
            Ok(Vec::new())
        }

        async fn set_alert_state(&self, _: &str, _: &str, _: AlertState) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Collector {
        items: Mutex<Vec<(QueueItem, String)>>,
    }

    #[async_trait]
    impl Dispatcher for Collector {
        async fn add_item(
            &self,
            item: QueueItem,
            category: &str,
            _: bool,
        ) -> Result<(), DispatchError> {
            self.items
                .lock()
                .unwrap()
                .push((item, category.to_string()));
            Ok(())
        }

        fn is_empty(&self) -> bool {
            true
        }

        fn purge(&self) {}

        fn start(&self) {}

        async fn join(&self) {}
    }

    struct FixedProbe;

    impl ResourceProbe for FixedProbe {
        fn sample(&mut self) -> Option<ResourceSample> {
            Some(ResourceSample {
                cpu_percent: 12.5,
                memory_mb: 64.0,
            })
        }
    }

    /// Records the thread every sample is taken on
    struct ThreadProbe(Arc<Mutex<Vec<std::thread::ThreadId>>>);

    impl ResourceProbe for ThreadProbe {
        fn sample(&mut self) -> Option<ResourceSample> {
            self.0.lock().unwrap().push(std::thread::current().id());
            None
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            heartbeat_interval: Duration::from_secs(60),
            resources_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sent_every_interval() {
        let beats = Arc::new(Beats::default());
        let owner = Arc::new(());
        let termination = CancellationToken::new();
        let worker = Worker::spawn(
            "r".into(),
            beats.clone(),
            Arc::new(Collector::default()),
            None,
            Arc::downgrade(&owner),
            termination.clone(),
            config(),
        );

        tokio::time::sleep(Duration::from_secs(150)).await;
        // at 0s, 60s and 120s
        assert_eq!(beats.0.load(Ordering::SeqCst), 3);

        termination.cancel();
        worker.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_skips_first_tick() {
        let collector = Arc::new(Collector::default());
        let owner = Arc::new(());
        let termination = CancellationToken::new();
        let worker = Worker::spawn(
            "r".into(),
            Arc::new(Beats::default()),
            collector.clone(),
            Some(Box::new(FixedProbe)),
            Arc::downgrade(&owner),
            termination.clone(),
            config(),
        );

        tokio::time::sleep(Duration::from_secs(75)).await;
        termination.cancel();
        worker.join().await;

        let items = collector.items.lock().unwrap();
        // ticks at 0s (baseline), 30s and 60s
        assert_eq!(items.len(), 2);
        let (item, category) = &items[0];
        assert_eq!(category, METRICS);
        assert_eq!(
            item.get("values"),
            Some(&serde_json::json!({
                "resources/cpu_usage": 12.5,
                "resources/memory_usage": 64.0
            }))
        );
        assert_eq!(item.get("step"), Some(&serde_json::json!(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_termination_interrupts_stalled_heartbeat() {
        let owner = Arc::new(());
        let termination = CancellationToken::new();
        let worker = Worker::spawn(
            "r".into(),
            Arc::new(Stalled),
            Arc::new(Collector::default()),
            None,
            Arc::downgrade(&owner),
            termination.clone(),
            config(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        termination.cancel();
        assert!(
            tokio::time::timeout(Duration::from_secs(1), worker.join())
                .await
                .is_ok()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_runs_off_the_runtime_thread() {
        let threads = Arc::new(Mutex::new(Vec::new()));
        let owner = Arc::new(());
        let termination = CancellationToken::new();
        let worker = Worker::spawn(
            "r".into(),
            Arc::new(Beats::default()),
            Arc::new(Collector::default()),
            Some(Box::new(ThreadProbe(threads.clone()))),
            Arc::downgrade(&owner),
            termination.clone(),
            config(),
        );

        tokio::time::sleep(Duration::from_secs(45)).await;
        termination.cancel();
        worker.join().await;

        let threads = threads.lock().unwrap();
        assert_eq!(threads.len(), 2);
        let runtime_thread = std::thread::current().id();
        assert!(threads.iter().all(|thread| *thread != runtime_thread));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_owner_cancels_run() {
        let owner = Arc::new(());
        let termination = CancellationToken::new();
        let worker = Worker::spawn(
            "r".into(),
            Arc::new(Beats::default()),
            Arc::new(Collector::default()),
            Some(Box::new(FixedProbe)),
            Arc::downgrade(&owner),
            termination.clone(),
            config(),
        );

        drop(owner);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(termination.is_cancelled());
        worker.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_sampler_spawns_heartbeat_only() {
        let owner = Arc::new(());
        let termination = CancellationToken::new();
        let worker = Worker::spawn(
            "r".into(),
            Arc::new(Beats::default()),
            Arc::new(Collector::default()),
            Some(Box::new(FixedProbe)),
            Arc::downgrade(&owner),
            termination.clone(),
            WorkerConfig {
                resources_interval: None,
                ..config()
            },
        );
        assert_eq!(worker.handles.lock().unwrap().len(), 1);
        termination.cancel();
        worker.join().await;
    }
}
