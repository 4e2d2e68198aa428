// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::TransportError;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Retry straight away, `attempts` tries in total
    Immediate(u32),
    /// Wait `initial`, doubling after every failure up to `max`
    ExponentialBackoff {
        initial: Duration,
        max: Duration,
        attempts: u32,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::ExponentialBackoff {
            initial: Duration::from_secs(4),
            max: Duration::from_secs(10),
            attempts: 5,
        }
    }
}

impl RetryStrategy {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryStrategy::Immediate(attempts) => (*attempts).max(1),
            RetryStrategy::ExponentialBackoff { attempts, .. } => (*attempts).max(1),
        }
    }

    /// Delay before attempt number `attempt + 1`, counting from zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Immediate(_) => Duration::ZERO,
            RetryStrategy::ExponentialBackoff { initial, max, .. } => initial
                .checked_mul(2u32.saturating_pow(attempt))
                .map_or(*max, |delay| delay.min(*max)),
        }
    }

    /// Runs `operation` until it succeeds, fails permanently or attempts
    /// run out. The last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let attempts = self.attempts();
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let delay = self.delay(attempt);
                    debug!(
                        "Attempt {} of {what} failed: {e}, retrying in {}ms",
                        attempt + 1,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Failed to {what} after {} attempts: {e}", attempt + 1);
                    return Err(e);
                }
            }
        }
    }
}
