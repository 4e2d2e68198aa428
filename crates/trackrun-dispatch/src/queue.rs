// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::DispatchError;
use crate::item::QueueItem;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::{Semaphore, TryAcquireError};

/// FIFO queue for a single category.
///
/// Producers push from any task, the dispatcher loop is the only consumer.
/// When a capacity is configured every queued item holds one semaphore
/// permit, released again when the item is drained or purged, so blocking
/// producers wake up as soon as space frees.
///
/// Once closed the queue accepts nothing more, so a drain that runs after
/// [`CategoryQueue::close`] sees every item that was ever accepted.
pub(crate) struct CategoryQueue {
    label: String,
    state: Mutex<State>,
    capacity: Option<Semaphore>,
}

#[derive(Default)]
struct State {
    items: VecDeque<QueueItem>,
    closed: bool,
}

impl CategoryQueue {
    pub(crate) fn new(label: &str, capacity: Option<usize>) -> Self {
        Self {
            label: label.to_string(),
            state: Mutex::new(State::default()),
            capacity: capacity.map(|size| Semaphore::new(size.min(Semaphore::MAX_PERMITS))),
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) async fn push(&self, item: QueueItem, blocking: bool) -> Result<(), DispatchError> {
        if let Some(capacity) = &self.capacity {
            let permit = if blocking {
                capacity
                    .acquire()
                    .await
                    .map_err(|_| DispatchError::Terminated(self.label.clone()))?
            } else {
                capacity.try_acquire().map_err(|e| match e {
                    TryAcquireError::NoPermits => DispatchError::QueueFull(self.label.clone()),
                    TryAcquireError::Closed => DispatchError::Terminated(self.label.clone()),
                })?
            };
            return self.enqueue(item).map(|()| {
                // the permit now belongs to the queued item
                permit.forget();
            });
        }
        self.enqueue(item)
    }

    fn enqueue(&self, item: QueueItem) -> Result<(), DispatchError> {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        if state.closed {
            return Err(DispatchError::Terminated(self.label.clone()));
        }
        state.items.push_back(item);
        Ok(())
    }

    /// Pulls up to `max` items from the front of the queue without waiting.
    pub(crate) fn drain(&self, max: usize) -> Vec<QueueItem> {
        let buffer: Vec<QueueItem> = {
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            let count = max.min(state.items.len());
            state.items.drain(..count).collect()
        };
        self.release(buffer.len());
        buffer
    }

    /// Drops every queued item, returning how many were discarded.
    pub(crate) fn purge(&self) -> usize {
        let count = {
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            let count = state.items.len();
            state.items.clear();
            count
        };
        self.release(count);
        count
    }

    /// Rejects every later push and wakes any producer still waiting for
    /// capacity; they all get `Terminated`.
    pub(crate) fn close(&self) {
        {
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            state.closed = true;
        }
        if let Some(capacity) = &self.capacity {
            capacity.close();
        }
    }

    pub(crate) fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned").items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, count: usize) {
        if let Some(capacity) = &self.capacity {
            if count > 0 {
                capacity.add_permits(count);
            }
        }
    }
}
