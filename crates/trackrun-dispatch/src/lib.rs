// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer/consumer pipeline decoupling run logging calls from a slow,
//! rate-constrained delivery path.
//!
//! Items are added to per-category queues and handed, in batches, to a
//! [`Delivery`] implementation by a background task. A prompt variant with
//! the same interface delivers each item inline instead.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod delivery;
pub mod dispatcher;
pub mod errors;
pub mod item;
pub mod prompt;
pub mod queued;

mod queue;

pub use delivery::Delivery;
pub use dispatcher::{
    build_dispatcher, DispatchMode, Dispatcher, DispatcherConfig, TerminationPolicy,
};
pub use errors::DispatchError;
pub use item::{Attributes, QueueItem};
pub use prompt::PromptDispatcher;
pub use queued::QueuedDispatcher;
