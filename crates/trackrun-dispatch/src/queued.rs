// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::delivery::Delivery;
use crate::dispatcher::{Dispatcher, DispatcherConfig, TerminationPolicy};
use crate::errors::DispatchError;
use crate::item::{Attributes, QueueItem};
use crate::queue::CategoryQueue;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Rate-limited batching dispatcher.
///
/// One queue per registered category, drained by a single background task at
/// most `max_read_rate` times per second.
pub struct QueuedDispatcher {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    queues: Vec<CategoryQueue>,
    delivery: Arc<dyn Delivery>,
    attributes: Arc<Attributes>,
    termination: CancellationToken,
    config: DispatcherConfig,
}

struct RateLimiter {
    min_interval: Duration,
    last_send: Option<Instant>,
}

impl RateLimiter {
    fn new(max_read_rate: f64) -> Self {
        let min_interval = if max_read_rate > 0.0 {
            Duration::try_from_secs_f64(1.0 / max_read_rate).unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        };
        Self {
            min_interval,
            last_send: None,
        }
    }

    /// Returns true and records the send when enough time has elapsed.
    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        match self.last_send {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_send = Some(now);
                true
            }
        }
    }
}

impl QueuedDispatcher {
    pub fn new(
        delivery: Arc<dyn Delivery>,
        categories: &[&str],
        termination: CancellationToken,
        attributes: Attributes,
        config: DispatcherConfig,
    ) -> Self {
        let queues = categories
            .iter()
            .map(|label| CategoryQueue::new(label, config.queue_capacity))
            .collect();
        Self {
            shared: Arc::new(Shared {
                queues,
                delivery,
                attributes: Arc::new(attributes),
                termination,
                config,
            }),
            handle: Mutex::new(None),
        }
    }
}

impl Shared {
    fn queue(&self, category: &str) -> Option<&CategoryQueue> {
        self.queues.iter().find(|queue| queue.label() == category)
    }

    async fn run(self: Arc<Self>) {
        let mut limiter = RateLimiter::new(self.config.max_read_rate);
        loop {
            tokio::select! {
                biased;
                _ = self.termination.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            if !limiter.try_acquire() {
                continue;
            }
            for queue in &self.queues {
                let buffer = queue.drain(self.config.max_buffer_size);
                self.deliver(buffer, queue.label()).await;
            }
        }

        // nothing is accepted past this point, so the final pass sees it all
        for queue in &self.queues {
            queue.close();
        }
        match self.config.termination {
            TerminationPolicy::Drain => self.drain_remaining().await,
            TerminationPolicy::Abort => {
                let discarded: usize = self.queues.iter().map(CategoryQueue::purge).sum();
                if discarded > 0 {
                    warn!("Dispatcher aborted, discarding {discarded} pending items");
                }
            }
        }
        debug!("Dispatcher loop exited");
    }

    /// Final pass over the closed queues: everything still queued is handed
    /// over in buffers no larger than `max_buffer_size`.
    async fn drain_remaining(&self) {
        for queue in &self.queues {
            loop {
                let buffer = queue.drain(self.config.max_buffer_size);
                if buffer.is_empty() {
                    break;
                }
                self.deliver(buffer, queue.label()).await;
            }
        }
    }

    async fn deliver(&self, buffer: Vec<QueueItem>, category: &str) {
        if buffer.is_empty() {
            return;
        }
        debug!(
            "Executing '{}' callback on buffer of {} items",
            category,
            buffer.len()
        );
        let delivery = Arc::clone(&self.delivery);
        let attributes = Arc::clone(&self.attributes);
        let label = category.to_string();
        let task =
            tokio::spawn(async move { delivery.deliver(buffer, &label, &attributes).await });
        if let Err(e) = task.await {
            error!("Delivery callback for '{category}' failed: {e}");
        }
    }
}

#[async_trait]
impl Dispatcher for QueuedDispatcher {
    async fn add_item(
        &self,
        item: QueueItem,
        category: &str,
        blocking: bool,
    ) -> Result<(), DispatchError> {
        let queue = self
            .shared
            .queue(category)
            .ok_or_else(|| DispatchError::UnknownCategory(category.to_string()))?;
        if self.shared.termination.is_cancelled() {
            return Err(DispatchError::Terminated(category.to_string()));
        }
        queue.push(item, blocking).await
    }

    fn is_empty(&self) -> bool {
        self.shared.queues.iter().all(CategoryQueue::is_empty)
    }

    fn purge(&self) {
        let discarded: usize = self.shared.queues.iter().map(CategoryQueue::purge).sum();
        debug!("Purged {discarded} pending items");
    }

    fn start(&self) {
        #[allow(clippy::expect_used)]
        let mut handle = self.handle.lock().expect("lock poisoned");
        if handle.is_none() {
            *handle = Some(tokio::spawn(Arc::clone(&self.shared).run()));
        }
    }

    async fn join(&self) {
        let handle = {
            #[allow(clippy::expect_used)]
            self.handle.lock().expect("lock poisoned").take()
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Dispatcher loop failed: {e}");
            }
        }
    }
}
