// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors returned to producers when handing an item to a dispatcher
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("No queue '{0}' found")]
    UnknownCategory(String),

    #[error("Queue '{0}' is full")]
    QueueFull(String),

    #[error("Dispatcher has been terminated, '{0}' item rejected")]
    Terminated(String),
}
