// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use chrono::Utc;
use std::{env, process, sync::Arc};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use trackrun::{
    config::token_expired,
    transport::{RemoteTransport, RetryingTransport},
    ClientConfig, Mode, RetryStrategy, Sender, SweepReport,
};

const SENDER_INTERVAL_ENV: &str = "TRACKRUN_SENDER_INTERVAL_SECS";

#[tokio::main]
pub async fn main() {
    let config = ClientConfig::from_env();

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    if let Err(e) = config.validate(Mode::Online) {
        error!("{e}. Shutting down sender.");
        process::exit(1);
    }
    let (Some(url), Some(token)) = (config.url.as_deref(), config.token.as_deref()) else {
        error!("Unable to get URL and token from the environment. Shutting down sender.");
        process::exit(1);
    };
    if expired(token) {
        error!("Token has expired. Shutting down sender.");
        process::exit(1);
    }

    let remote = match RemoteTransport::new(url, token, config.https_proxy.as_deref()) {
        Ok(remote) => remote,
        Err(e) => {
            error!("Unable to build transport: {e}. Shutting down sender.");
            process::exit(1);
        }
    };
    let transport = Arc::new(RetryingTransport::new(
        Arc::new(remote),
        RetryStrategy::default(),
    ));
    let sender = Sender::new(config.offline_directory.clone(), transport);

    let period = env::var(SENDER_INTERVAL_ENV)
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);

    let Some(period) = period else {
        info!(
            "Sweeping offline journal in {}",
            config.offline_directory.display()
        );
        if !sweep(&sender).await {
            process::exit(1);
        }
        return;
    };

    info!(
        "Sweeping offline journal in {} every {}s",
        config.offline_directory.display(),
        period.as_secs()
    );
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, stopping sender");
                break;
            }
            _ = ticker.tick() => {
                sweep(&sender).await;
            }
        }
    }
}

fn expired(token: &str) -> bool {
    token_expired(token, Utc::now().timestamp())
}

/// Runs one sweep and logs its outcome. Returns whether every run was
/// swept without error.
async fn sweep(sender: &Sender) -> bool {
    match sender.sweep().await {
        Ok(report) => {
            log_report(&report);
            report.failures.is_empty()
        }
        Err(e) => {
            error!("Unable to sweep offline journal: {e}");
            false
        }
    }
}

fn log_report(report: &SweepReport) {
    for run in &report.runs {
        debug!(
            "Run {} ({}): replayed {} records, lost: {}, sent: {}",
            run.name, run.uid, run.replayed, run.went_lost, run.sent
        );
        if run.interrupted {
            warn!("Replay of run {} interrupted, remaining records kept", run.name);
        }
    }
    for (uid, reason) in &report.failures {
        error!("Unable to sweep run {uid}: {reason}");
    }
    info!(
        "Swept {} runs, replayed {} records",
        report.runs.len(),
        report.replayed()
    );
}
