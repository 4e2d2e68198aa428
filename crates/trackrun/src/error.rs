// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use trackrun_dispatch::DispatchError;

/// Failures reading or writing the offline journal
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("Unable to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed journal file {path}: {message}")]
    Malformed { path: PathBuf, message: String },
}

impl JournalError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        JournalError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures talking to the tracking service, or to its offline stand-in
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("{status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unable to serialize payload: {0}")]
    Serialization(String),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("{0} is not supported in this mode")]
    Unsupported(&'static str),
}

impl TransportError {
    /// Network failures, 5xx and 429 may succeed on a later attempt; every
    /// other status is final.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for TransportError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        TransportError::Serialization(err.to_string())
    }
}

/// Errors surfaced by the run lifecycle controller
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("Token has expired or is invalid")]
    TokenExpired,

    #[error("Cannot {0}, tracking is disabled")]
    Disabled(&'static str),

    #[error("Run has been aborted")]
    Aborted,

    #[error("Initialize a run using init() first")]
    NotInitialised,
}
