// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable that runs the per-node preparer and its health watcher.
//!
//! Exit codes: 0 after a clean signal-driven shutdown, 1 for
//! configuration problems, 2 when the reconcile loop dies.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use anyhow::anyhow;
use camino::Utf8PathBuf;
use clap::Parser;
use slog::{Logger, error, info};
use slog_error_chain::InlineErrorChain;
use stevedore_common::logging;
use stevedore_kv::client::{KvClient, KvConfig};
use stevedore_kv::health::HealthUpdater;
use stevedore_kv::pod_store::{PodStore, PodTree};
use stevedore_kv::session::{SessionConfig, start_session};
use stevedore_preparer::config::PreparerConfig;
use stevedore_preparer::health::HealthWatcher;
use stevedore_preparer::preparer::Preparer;
use stevedore_pod::digest::InsecurePolicy;
use stevedore_pod::fetch::ArtifactFetcher;
use stevedore_pod::hooks::Hooks;
use stevedore_pod::pod::PodDeps;
use stevedore_pod::supervisor::{ServiceBuilder, Sv};
use stevedore_preparer::worker::KvRealityPublisher;
use tokio::sync::watch;

#[derive(Parser, Debug)]
struct Args {
    #[clap(long)]
    config_file: Option<Utf8PathBuf>,

    /// Name of this node in the intent and reality trees.
    #[clap(long)]
    node: Option<String>,

    /// Address of the KV server.
    #[clap(long)]
    consul: Option<String>,

    /// File holding the KV ACL token.
    #[clap(long)]
    token: Option<Utf8PathBuf>,

    #[clap(long)]
    hooks_dir: Option<Utf8PathBuf>,

    #[clap(long)]
    pod_root: Option<Utf8PathBuf>,
}

fn build_config(args: &Args) -> anyhow::Result<PreparerConfig> {
    let mut config = PreparerConfig::load(args.config_file.as_deref())
        .context("loading config file")?;
    if let Some(node) = &args.node {
        config.node = Some(node.clone());
    }
    if let Some(consul) = &args.consul {
        config.consul_address = consul.clone();
    }
    if let Some(token) = &args.token {
        config.consul_token_path = Some(token.clone());
    }
    if let Some(hooks_dir) = &args.hooks_dir {
        config.hooks_dir = hooks_dir.clone();
    }
    if let Some(pod_root) = &args.pod_root {
        config.pod_root = pod_root.clone();
    }
    if config.node.is_none() {
        return Err(anyhow!("no node name given (pass --node or set `node`)"));
    }
    Ok(config)
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
    let log = logging::root_logger("stevedore-preparer", level);

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
                "preparer loop failed";
                "error" => InlineErrorChain::new(err.as_ref()),
            );
            ExitCode::from(2)
        }
    }
}

async fn run(config: PreparerConfig, log: Logger) -> anyhow::Result<()> {
    let node = config.node.clone().expect("validated in build_config");
    let token = config
        .read_token()
        .map_err(|err| anyhow!("reading token file: {err}"))?;

    let kv = KvClient::new(&KvConfig {
        address: config.consul_address.clone(),
        token,
    });

    let (quit_tx, quit_rx) = watch::channel(false);

    // The session backing this node's health entries; if we crash, the
    // entries expire with it.
    let session_config = SessionConfig {
        name: format!("stevedore-preparer:{node}"),
        ttl: std::time::Duration::from_secs(config.session_ttl_secs),
        lock_delay: std::time::Duration::from_secs(15),
    };
    let session = start_session(&kv, session_config, quit_rx.clone(), &log)
        .await
        .context("establishing health session")?;

    let intent = PodStore::new(kv.clone(), PodTree::Intent, &log);
    let reality_store = PodStore::new(kv.clone(), PodTree::Reality, &log);
    let reality = KvRealityPublisher::new(reality_store.clone(), &node);
    let hooks = Hooks::new(config.hooks_dir.clone(), &log);

    let pod_deps = PodDeps {
        service_builder: ServiceBuilder::new(&config.supervisor, &log),
        sv: Sv::new(&config.supervisor),
        fetcher: ArtifactFetcher::new(&log),
        flags: config.launchables.clone(),
        // Real signature policies come from the deployment's trust
        // tooling; the built-in policy accepts everything and says so
        // in the log on every check.
        policy: Arc::new(InsecurePolicy::new(&log)),
        log: log.clone(),
    };

    let preparer = Preparer::new(
        &node,
        intent,
        reality,
        hooks,
        config.pod_root.clone(),
        pod_deps,
        &log,
    );

    let updater = HealthUpdater::new(kv.clone(), session, &log);
    let health_watcher =
        HealthWatcher::new(&node, reality_store, updater, &log);

    let health_task = tokio::spawn(health_watcher.run(quit_rx.clone()));
    let mut preparer_task = tokio::spawn({
        let quit_rx = quit_rx.clone();
        async move { preparer.run(quit_rx).await }
    });

    let result = tokio::select! {
        result = &mut preparer_task => flatten_join(result),
        _ = wait_for_signal(&log) => {
            info!(log, "signal received; shutting down");
            let _ = quit_tx.send(true);
            flatten_join(preparer_task.await)
        }
    };

    let _ = quit_tx.send(true);
    let _ = health_task.await;
    result
}

fn flatten_join(
    result: Result<
        Result<(), stevedore_preparer::preparer::PreparerError>,
        tokio::task::JoinError,
    >,
) -> anyhow::Result<()> {
    match result {
        Ok(inner) => inner.map_err(|err| anyhow!(err)),
        Err(join_err) => Err(anyhow!("preparer task panicked: {join_err}")),
    }
}

async fn wait_for_signal(log: &Logger) {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!(log, "cannot listen for SIGTERM: {err}");
            // Fall back to SIGINT alone.
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
