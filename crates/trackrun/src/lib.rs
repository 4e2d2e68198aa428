// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client for an experiment tracking service.
//!
//! A [`Run`] streams metrics and events through a rate-limited dispatcher,
//! keeps the run alive with heartbeats and resource metrics, and sends
//! metadata, folders, alerts and file registrations directly. Offline runs
//! write everything to a local journal that a [`Sender`] sweep later replays
//! against the server.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod alert;
pub mod config;
pub mod delivery;
pub mod error;
pub mod files;
pub mod journal;
pub mod resources;
pub mod retry;
pub mod run;
pub mod sender;
pub mod transport;
pub mod worker;

pub use alert::{AlertDefinition, AlertRule, AlertSource, Notification};
pub use config::{ClientConfig, Mode, RunOptions};
pub use error::{JournalError, RunError, TransportError};
pub use files::FileCategory;
pub use retry::RetryStrategy;
pub use run::{InitOptions, ProcessExit, Run, RunOutcome, RunStatus};
pub use sender::{RunSweep, Sender, SweepReport};
pub use transport::{AlertState, Payload, RecordKind, Transport};
