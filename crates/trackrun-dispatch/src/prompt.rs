// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::delivery::Delivery;
use crate::dispatcher::Dispatcher;
use crate::errors::DispatchError;
use crate::item::{Attributes, QueueItem};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Delivers each item as soon as it is added, on the caller's task.
///
/// There is no queue, so `is_empty` always holds and `purge` has nothing to
/// discard.
pub struct PromptDispatcher {
    categories: Vec<String>,
    delivery: Arc<dyn Delivery>,
    attributes: Attributes,
    termination: CancellationToken,
}

impl PromptDispatcher {
    pub fn new(
        delivery: Arc<dyn Delivery>,
        categories: &[&str],
        termination: CancellationToken,
        attributes: Attributes,
    ) -> Self {
        Self {
            categories: categories.iter().map(|c| c.to_string()).collect(),
            delivery,
            attributes,
            termination,
        }
    }
}

#[async_trait]
impl Dispatcher for PromptDispatcher {
    async fn add_item(
        &self,
        item: QueueItem,
        category: &str,
        _blocking: bool,
    ) -> Result<(), DispatchError> {
        if !self.categories.iter().any(|c| c == category) {
            return Err(DispatchError::UnknownCategory(category.to_string()));
        }
        if self.termination.is_cancelled() {
            return Err(DispatchError::Terminated(category.to_string()));
        }
        debug!("Executing '{category}' callback on buffer of 1 items");
        self.delivery
            .deliver(vec![item], category, &self.attributes)
            .await;
        Ok(())
    }

    fn is_empty(&self) -> bool {
        true
    }

    fn purge(&self) {}

    fn start(&self) {}

    async fn join(&self) {}
}
