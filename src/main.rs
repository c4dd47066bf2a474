// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! firefly-karmada-manager - runs the firefly controllers against a karmada
//! control plane and its host cluster.

#![warn(clippy::all)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use firefly_karmada_manager::config::{ControllerManagerConfig, LeaderMigrationConfiguration};
use firefly_karmada_manager::{ControllerManager, ControllerRegistry};

/// The firefly karmada manager is a daemon that embeds the firefly control
/// loops. It watches the karmada control plane and the host cluster and
/// drives both towards the desired state.
#[derive(Parser, Debug)]
#[command(name = "firefly-karmada-manager")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, help_heading = "Generic")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[arg(long, default_value = "info", help_heading = "Generic")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, help_heading = "Generic")]
    log_json: bool,

    /// Comma-separated list of controllers to enable
    ///
    /// '*' enables all on-by-default controllers, 'foo' enables the controller
    /// named 'foo', '-foo' disables the controller named 'foo'
    #[arg(long, value_delimiter = ',', help_heading = "Generic")]
    controllers: Option<Vec<String>>,

    /// Minimum resync period for informers
    #[arg(long, value_parser = humantime::parse_duration, help_heading = "Generic")]
    min_resync_period: Option<Duration>,

    /// Base interval slept before starting each controller
    #[arg(long, value_parser = humantime::parse_duration, help_heading = "Generic")]
    controller_start_interval: Option<Duration>,

    /// Start a leader election client and gain leadership before running
    #[arg(long, help_heading = "Leader election")]
    leader_elect: Option<bool>,

    /// Type of resource object used for locking
    #[arg(long, help_heading = "Leader election")]
    leader_elect_resource_lock: Option<String>,

    /// Namespace of the lock object
    #[arg(long, help_heading = "Leader election")]
    leader_elect_resource_namespace: Option<String>,

    /// Name of the lock object
    #[arg(long, help_heading = "Leader election")]
    leader_elect_resource_name: Option<String>,

    /// How long non-leaders wait before forcing leadership
    #[arg(long, value_parser = humantime::parse_duration, help_heading = "Leader election")]
    leader_elect_lease_duration: Option<Duration>,

    /// How long the leader retries refreshing leadership before giving up
    #[arg(long, value_parser = humantime::parse_duration, help_heading = "Leader election")]
    leader_elect_renew_deadline: Option<Duration>,

    /// Wait between acquire and renew attempts
    #[arg(long, value_parser = humantime::parse_duration, help_heading = "Leader election")]
    leader_elect_retry_period: Option<Duration>,

    /// Enable leader migration
    #[arg(long, help_heading = "Leader migration")]
    enable_leader_migration: bool,

    /// Path to the leader migration configuration file
    #[arg(long, requires = "enable_leader_migration", help_heading = "Leader migration")]
    leader_migration_config: Option<PathBuf>,

    /// Kubeconfig of the karmada control plane
    #[arg(long, help_heading = "Clusters")]
    karmada_kubeconfig: Option<PathBuf>,

    /// Kubeconfig of the host cluster
    #[arg(long, help_heading = "Clusters")]
    host_kubeconfig: Option<PathBuf>,

    /// Namespace of the scheduler-estimator on the host cluster
    #[arg(long, help_heading = "Clusters")]
    estimator_namespace: Option<String>,

    /// Name of the firefly karmada object served by this manager
    #[arg(long, help_heading = "Clusters")]
    karmada_name: Option<String>,

    /// Address to serve health and debug endpoints on
    #[arg(long, help_heading = "Serving")]
    bind_address: Option<String>,

    /// Port to serve health and debug endpoints on, 0 disables serving
    #[arg(long, help_heading = "Serving")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_json);

    match run(args).await {
        Ok(()) => {
            info!("firefly-karmada-manager exited successfully");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(args).await?;
    let registry = new_controller_registry();
    let completed = config
        .complete(&registry)
        .await
        .context("failed to complete configuration")?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_shutdown().await;
            shutdown.cancel();
        }
    });

    ControllerManager::new(completed, registry)
        .run(shutdown)
        .await
        .context("controller manager failed")
}

/// Controllers compiled into this binary.
fn new_controller_registry() -> ControllerRegistry {
    ControllerRegistry::new()
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .unwrap_or_else(|_| LevelFilter::INFO.into()),
        )
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
}

/// Loads the configuration file, if any, and applies flag overrides.
async fn load_config(args: Args) -> anyhow::Result<ControllerManagerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            serde_yaml::from_str::<ControllerManagerConfig>(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        }
        None => ControllerManagerConfig::default(),
    };

    let generic = &mut config.generic;
    if let Some(controllers) = args.controllers {
        generic.controllers = controllers.into_iter().map(|c| c.trim().to_string()).collect();
    }
    if let Some(period) = args.min_resync_period {
        generic.min_resync_period = period;
    }
    if let Some(interval) = args.controller_start_interval {
        generic.controller_start_interval = interval;
    }

    let election = &mut generic.leader_election;
    if let Some(elect) = args.leader_elect {
        election.leader_elect = elect;
    }
    if let Some(lock) = args.leader_elect_resource_lock {
        election.resource_lock = lock;
    }
    if let Some(namespace) = args.leader_elect_resource_namespace {
        election.resource_namespace = namespace;
    }
    if let Some(name) = args.leader_elect_resource_name {
        election.resource_name = name;
    }
    if let Some(duration) = args.leader_elect_lease_duration {
        election.lease_duration = duration;
    }
    if let Some(deadline) = args.leader_elect_renew_deadline {
        election.renew_deadline = deadline;
    }
    if let Some(period) = args.leader_elect_retry_period {
        election.retry_period = period;
    }

    if args.enable_leader_migration {
        generic.leader_migration_enabled = true;
    }
    if let Some(path) = args.leader_migration_config {
        generic.leader_migration = LeaderMigrationConfiguration::from_file(&path)?;
    }

    if let Some(path) = args.karmada_kubeconfig {
        config.clusters.karmada_kubeconfig = Some(path);
    }
    if let Some(path) = args.host_kubeconfig {
        config.clusters.host_kubeconfig = Some(path);
    }
    if let Some(namespace) = args.estimator_namespace {
        config.estimator_namespace = namespace;
    }
    if let Some(name) = args.karmada_name {
        config.karmada_name = name;
    }
    if let Some(address) = args.bind_address {
        config.serving.bind_address = address;
    }
    if let Some(port) = args.port {
        config.serving.port = port;
    }

    Ok(config)
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                let _ = signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            _ = signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("received Ctrl+C, shutting down");
    }
}
