// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Common dispatcher contract and the factory selecting a delivery-timing
//! policy.

use crate::delivery::Delivery;
use crate::errors::DispatchError;
use crate::item::{Attributes, QueueItem};
use crate::prompt::PromptDispatcher;
use crate::queued::QueuedDispatcher;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const MAX_REQUESTS_PER_SECOND: f64 = 1.0;
pub const MAX_BUFFER_SIZE: usize = 16000;
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What the queued loop does with pending items once termination is signalled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminationPolicy {
    /// Offer everything still queued to the delivery callback before exiting.
    #[default]
    Drain,
    /// Exit straight away, discarding whatever is still queued.
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Rate-limited batching on a background task.
    #[default]
    Queued,
    /// Every item is delivered on its own, inline with `add_item`.
    Prompt,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Largest buffer handed to a single delivery call
    pub max_buffer_size: usize,
    /// Maximum delivery passes per second
    pub max_read_rate: f64,
    /// How often the background loop wakes up
    pub poll_interval: Duration,
    /// Per-category bound, `None` for unbounded queues
    pub queue_capacity: Option<usize>,
    pub termination: TerminationPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: MAX_BUFFER_SIZE,
            max_read_rate: MAX_REQUESTS_PER_SECOND,
            poll_interval: POLL_INTERVAL,
            queue_capacity: None,
            termination: TerminationPolicy::Drain,
        }
    }
}

/// Decouples producers from a slow, rate-constrained delivery path.
///
/// Both delivery-timing policies implement this trait so callers never need
/// to know which one is in effect.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Hands `item` to the queue registered for `category`.
    ///
    /// With `blocking` set, a full bounded queue suspends the caller until
    /// space frees; otherwise the call fails with [`DispatchError::QueueFull`].
    async fn add_item(
        &self,
        item: QueueItem,
        category: &str,
        blocking: bool,
    ) -> Result<(), DispatchError>;

    /// Best-effort check that every category queue is currently empty.
    fn is_empty(&self) -> bool;

    /// Discards every pending item.
    fn purge(&self);

    /// Starts the background loop, if the policy has one.
    fn start(&self);

    /// Waits for the background loop to exit after termination.
    async fn join(&self);
}

/// Builds the dispatcher for `mode`.
///
/// `categories` fixes both the set of accepted labels and the order in which
/// queues are visited on every pass. `termination` is the shared signal that
/// stops the loop; it is never reset.
pub fn build_dispatcher(
    mode: DispatchMode,
    delivery: Arc<dyn Delivery>,
    categories: &[&str],
    termination: CancellationToken,
    attributes: Attributes,
    config: DispatcherConfig,
) -> Arc<dyn Dispatcher> {
    match mode {
        DispatchMode::Prompt => Arc::new(PromptDispatcher::new(
            delivery,
            categories,
            termination,
            attributes,
        )),
        DispatchMode::Queued => Arc::new(QueuedDispatcher::new(
            delivery,
            categories,
            termination,
            attributes,
            config,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl Delivery for Recorder {
        async fn deliver(&self, buffer: Vec<QueueItem>, category: &str, _: &Attributes) {
            self.calls
                .lock()
                .unwrap()
                .push((category.to_string(), buffer.len()));
        }
    }

    fn item() -> QueueItem {
        QueueItem::event("hello", "2024-01-01 00:00:00.000000".into())
    }

    #[tokio::test]
    async fn test_prompt_mode_delivers_inline() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = build_dispatcher(
            DispatchMode::Prompt,
            recorder.clone(),
            &["events"],
            CancellationToken::new(),
            Attributes::new(),
            DispatcherConfig::default(),
        );

        dispatcher
            .add_item(item(), "events", false)
            .await
            .expect("add_item failed");

        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec![("events".to_string(), 1)]
        );
        assert!(dispatcher.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_mode_defers_delivery() {
        let recorder = Arc::new(Recorder::default());
        let termination = CancellationToken::new();
        let dispatcher = build_dispatcher(
            DispatchMode::Queued,
            recorder.clone(),
            &["events"],
            termination.clone(),
            Attributes::new(),
            DispatcherConfig::default(),
        );

        dispatcher
            .add_item(item(), "events", false)
            .await
            .expect("add_item failed");
        assert!(recorder.calls.lock().unwrap().is_empty());
        assert!(!dispatcher.is_empty());

        dispatcher.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec![("events".to_string(), 1)]
        );

        termination.cancel();
        dispatcher.join().await;
    }

    #[tokio::test]
    async fn test_unknown_category_in_both_modes() {
        for mode in [DispatchMode::Queued, DispatchMode::Prompt] {
            let dispatcher = build_dispatcher(
                mode,
                Arc::new(Recorder::default()),
                &["metrics"],
                CancellationToken::new(),
                Attributes::new(),
                DispatcherConfig::default(),
            );
            let err = dispatcher.add_item(item(), "alerts", false).await;
            assert_eq!(err, Err(DispatchError::UnknownCategory("alerts".into())));
            assert!(dispatcher.is_empty());
        }
    }
}
