// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::item::{Attributes, QueueItem};
use async_trait::async_trait;

/// Receives every buffer drained from a dispatcher queue.
///
/// Implementations perform the actual I/O (an HTTP call or a journal write).
/// The dispatcher never retries: an implementation is expected to handle and
/// log its own expected failures, the buffer is dropped once `deliver`
/// returns.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, buffer: Vec<QueueItem>, category: &str, attributes: &Attributes);
}
