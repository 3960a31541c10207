// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable that runs the roll farm: watches the roll tree and
//! executes rolling updates until signalled.
//!
//! A lost session is re-established and the farm restarted; only
//! configuration problems (exit 1) and unrecoverable loop failures
//! (exit 2) end the process without a signal.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use slog::{Logger, error, info, warn};
use slog_error_chain::InlineErrorChain;
use stevedore_common::logging;
use stevedore_kv::client::{KvClient, KvConfig};
use stevedore_kv::health::HealthStore;
use stevedore_kv::rc_store::ConsulRcStore;
use stevedore_kv::roll_store::ConsulRollStore;
use stevedore_kv::session::{SessionConfig, start_session};
use stevedore_roll::config::FarmConfig;
use stevedore_roll::farm::{Farm, FarmError};
use stevedore_roll::RollConfig;
use tokio::sync::watch;

#[derive(Parser, Debug)]
struct Args {
    #[clap(long)]
    config_file: Option<Utf8PathBuf>,

    /// Address of the KV server.
    #[clap(long)]
    consul: Option<String>,

    /// File holding the KV ACL token.
    #[clap(long)]
    token: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let config = match build_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return ExitCode::from(1);
        }
    };
    let level = match logging::parse_level(&config.log_level) {
        Ok(level) => level,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(1);
        }
    };
    let log = logging::root_logger("stevedore-roll", level);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::from(2);
        }
    };
    match runtime.block_on(run(config, log.clone())) {
        Ok(()) => {
            info!(log, "shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(
                log,
                "roll farm failed";
                "error" => InlineErrorChain::new(err.as_ref()),
            );
            ExitCode::from(2)
        }
    }
}

fn build_config(args: &Args) -> anyhow::Result<FarmConfig> {
    let mut config = FarmConfig::load(args.config_file.as_deref())
        .context("loading config file")?;
    if let Some(consul) = &args.consul {
        config.consul_address = consul.clone();
    }
    if let Some(token) = &args.token {
        config.consul_token_path = Some(token.clone());
    }
    Ok(config)
}

async fn run(config: FarmConfig, log: Logger) -> anyhow::Result<()> {
    let token = config.read_token().context("reading token file")?;
    let kv = KvClient::new(&KvConfig {
        address: config.consul_address.clone(),
        token,
    });

    let farm = Farm::new(
        ConsulRcStore::new(kv.clone(), &log),
        ConsulRollStore::new(kv.clone(), &log),
        HealthStore::new(kv.clone(), &log),
        RollConfig::default(),
        &log,
    );

    let (quit_tx, quit_rx) = watch::channel(false);
    let mut signal = Box::pin(wait_for_signal(&log));

    loop {
        let session_config = SessionConfig {
            name: "stevedore-roll".to_string(),
            ttl: Duration::from_secs(config.session_ttl_secs),
            lock_delay: Duration::from_secs(15),
        };
        let session =
            start_session(&kv, session_config, quit_rx.clone(), &log)
                .await
                .context("establishing session")?;

        tokio::select! {
            result = farm.run(session, quit_rx.clone()) => {
                match result {
                    Ok(()) => return Ok(()),
                    Err(FarmError::SessionLost) => {
                        warn!(log, "re-establishing session");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            _ = &mut signal => {
                info!(log, "signal received; shutting down");
                let _ = quit_tx.send(true);
                return Ok(());
            }
        }
    }
}

async fn wait_for_signal(log: &Logger) {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!(log, "cannot listen for SIGTERM: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
