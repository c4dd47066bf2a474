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

//! Controller manager - the main orchestrator.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::client_builder::{create_client_builders, ControllerClientBuilder};
use crate::config::CompletedConfig;
use crate::controller::InitOutcome;
use crate::controller_context::{create_controller_context, ControllerContext};
use crate::controller_descriptor::ControllerRegistry;
use crate::error::{Error, Result};
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::gate::Gate;
use crate::health::{HealthChecker, HealthzHandler, LeaderHealthzAdaptor, NamedHealthChecker, PingChecker};
use crate::leader_election::{create_identity, new_resource_lock, LeaderCallbacks, LeaderElector};
use crate::leader_migration::{self, FilterResult, LeaderMigrator};
use crate::server::{serve, strip_prefix, BaseHandler, Configz, DebugMux};
use crate::wait;

/// Section under which the component config is served on `/configz`.
pub const CONFIGZ_NAME: &str = "fireflycontrollermanager.config.firefly.io";

/// Component name matched against migration controller leaders.
pub const MIGRATION_COMPONENT: &str = "firefly-controller-manager";

const DEBUG_CONTROLLERS_PATH: &str = "/debug/controllers";

/// Starts every enabled controller of `registry`, one after another.
///
/// Disabled and skipped controllers are logged and passed over. The first
/// initializer error aborts the remaining starts. Each started controller
/// gets one health check, either its own checker or a ping, and all checks
/// are registered together once every controller is up.
pub async fn start_controllers(
    token: &CancellationToken,
    ctx: &ControllerContext,
    registry: &ControllerRegistry,
    debug: &DebugMux,
    healthz: &HealthzHandler,
) -> Result<()> {
    let start_interval = ctx.component_config.generic.controller_start_interval;
    let mut checks: Vec<Arc<dyn HealthChecker>> = Vec::new();

    for descriptor in registry.controllers() {
        let name = descriptor.name();
        if !ctx.is_controller_enabled(name) {
            tracing::warn!("{name:?} is disabled");
            continue;
        }

        tokio::time::sleep(wait::jitter(start_interval, 1.0)).await;

        tracing::info!("starting {name:?}");
        let outcome = (descriptor.init())(token.clone(), ctx.clone())
            .await
            .map_err(|source| Error::ControllerInit {
                name: name.to_string(),
                source,
            })?;

        let controller = match outcome {
            InitOutcome::Skipped => {
                tracing::warn!("skipping {name:?}");
                continue;
            }
            InitOutcome::Started(controller) => controller,
        };

        let mut check: Arc<dyn HealthChecker> = Arc::new(PingChecker::new(name));
        if let Some(controller) = controller {
            if let Some(handler) = controller.debugging_handler() {
                let base = format!("{DEBUG_CONTROLLERS_PATH}/{name}");
                debug
                    .unlisted_handle(base.clone(), strip_prefix(base.clone(), handler.clone()))
                    .await;
                debug
                    .unlisted_handle_prefix(format!("{base}/"), strip_prefix(base, handler))
                    .await;
            }
            if let Some(checker) = controller.health_checker() {
                check = Arc::new(NamedHealthChecker::new(name, checker));
            }
        }
        checks.push(check);

        tracing::info!("started {name:?}");
    }

    healthz.add_health_checkers(checks).await;
    Ok(())
}

/// Starts every informer factory of `ctx` and then closes
/// `ctx.informers_started`.
pub fn start_informers(ctx: &ControllerContext, token: &CancellationToken) {
    for factory in ctx.informers.all() {
        tracing::debug!(factory = factory.name(), "starting informer factory");
        factory.start(token.clone());
    }
    ctx.informers_started.close();
}

/// Runs one leadership epoch.
#[async_trait]
pub trait LeaderRunner: Send + Sync + 'static {
    /// Starts the controllers of `registry`, closes `started` once they and
    /// the informers are up, then blocks until `token` is cancelled.
    async fn run(&self, token: CancellationToken, registry: ControllerRegistry, started: Gate) -> Result<()>;
}

/// Builds a fresh controller context for every epoch.
pub struct ContextRunner {
    config: CompletedConfig,
    karmada: Arc<dyn ControllerClientBuilder>,
    host: Arc<dyn ControllerClientBuilder>,
    debug: DebugMux,
    healthz: HealthzHandler,
    events: Arc<dyn EventPublisher>,
}

impl ContextRunner {
    pub fn new(
        config: CompletedConfig,
        karmada: Arc<dyn ControllerClientBuilder>,
        host: Arc<dyn ControllerClientBuilder>,
        debug: DebugMux,
        healthz: HealthzHandler,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            config,
            karmada,
            host,
            debug,
            healthz,
            events,
        }
    }
}

#[async_trait]
impl LeaderRunner for ContextRunner {
    async fn run(&self, token: CancellationToken, registry: ControllerRegistry, started: Gate) -> Result<()> {
        let ctx = create_controller_context(&self.config, self.karmada.clone(), self.host.clone(), token.clone())
            .await?
            .with_event_recorder(self.events.clone());

        start_controllers(&token, &ctx, &registry, &self.debug, &self.healthz).await?;
        start_informers(&ctx, &token);
        started.close();

        token.cancelled().await;
        Ok(())
    }
}

struct EpochCallbacks {
    lock: &'static str,
    runner: Arc<dyn LeaderRunner>,
    registry: ControllerRegistry,
    started: Gate,
}

#[async_trait]
impl LeaderCallbacks for EpochCallbacks {
    async fn on_started_leading(&self, token: CancellationToken) -> Result<()> {
        tracing::info!(lock = self.lock, controllers = self.registry.len(), "starting controllers");
        self.runner
            .run(token, self.registry.clone(), self.started.clone())
            .await
    }

    async fn on_stopped_leading(&self) {
        tracing::error!(lock = self.lock, "leaderelection lost");
    }
}

/// Runs the main election and, with migration, the migration election.
///
/// The main lock runs the non-migrated controllers. The migration lock is
/// not attempted before the main epoch closed
/// [`LeaderMigrator::migration_ready`], and then runs the migrated ones.
/// Without migration the main lock runs all of `registry`.
pub async fn run_leader_elections(
    main: LeaderElector,
    migration: Option<(LeaderElector, LeaderMigrator)>,
    runner: Arc<dyn LeaderRunner>,
    registry: &ControllerRegistry,
    shutdown: CancellationToken,
) -> Result<()> {
    let Some((migration, migrator)) = migration else {
        let callbacks = EpochCallbacks {
            lock: "main",
            runner,
            registry: registry.clone(),
            started: Gate::new(),
        };
        return main.run(Arc::new(callbacks), shutdown).await;
    };

    let stop = shutdown.child_token();
    let main_callbacks = EpochCallbacks {
        lock: "main",
        runner: runner.clone(),
        registry: migrator.filter_registry(registry, FilterResult::NonMigrated),
        started: migrator.migration_ready.clone(),
    };
    let migration_callbacks = EpochCallbacks {
        lock: "migration",
        runner,
        registry: migrator.filter_registry(registry, FilterResult::Migrated),
        started: Gate::new(),
    };

    let main_election = main.run(Arc::new(main_callbacks), stop.clone());
    let migration_election = async {
        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            _ = migrator.migration_ready.wait() => {}
        }
        tracing::info!("leader migration: attempting migration lock");
        migration.run(Arc::new(migration_callbacks), stop.clone()).await
    };

    let result = tokio::try_join!(main_election, migration_election).map(|_| ());
    if result.is_err() {
        stop.cancel();
    }
    result
}

/// The controller manager.
pub struct ControllerManager {
    config: CompletedConfig,
    registry: ControllerRegistry,
}

impl ControllerManager {
    /// Creates a manager for `registry`. The config must have been completed
    /// against the same registry.
    pub fn new(config: CompletedConfig, registry: ControllerRegistry) -> Self {
        Self { config, registry }
    }

    /// Returns the controller registry.
    pub fn registry(&self) -> &ControllerRegistry {
        &self.registry
    }

    /// Runs until `shutdown` fires or a fatal error occurs.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(version = crate::VERSION, "starting {}", crate::CONTROLLER_MANAGER_NAME);
        for key in ["RUST_LOG", "RUST_BACKTRACE", "TOKIO_WORKER_THREADS"] {
            tracing::info!(key, value = %std::env::var(key).unwrap_or_default(), "runtime settings");
        }

        let component_config = self.config.component_config.clone();
        let generic = &component_config.generic;

        let configz = Configz::new();
        if let Err(err) = configz.register(CONFIGZ_NAME, component_config.as_ref()).await {
            tracing::error!(error = %err, "unable to register configz");
        }

        let healthz = HealthzHandler::new();
        let watchdog = generic
            .leader_election
            .leader_elect
            .then(LeaderHealthzAdaptor::default);
        if let Some(watchdog) = &watchdog {
            let check: Arc<dyn HealthChecker> = Arc::new(watchdog.clone());
            healthz.add_health_checkers(vec![check]).await;
        }

        let debug = DebugMux::new();
        if let Some(addr) = component_config.serving.address() {
            let addr: SocketAddr = addr
                .parse()
                .map_err(|err| Error::InvalidConfig(format!("invalid serving address {addr:?}: {err}")))?;
            let handler = BaseHandler::new(healthz.clone(), configz, debug.clone());
            serve(addr, Arc::new(handler), shutdown.clone()).await?;
        }

        let (karmada, host) = create_client_builders(
            self.config.karmada_kubeconfig.clone(),
            self.config.host_kubeconfig.clone(),
        );
        let identity = watchdog.as_ref().map(|_| create_identity()).transpose()?;
        let events: Arc<dyn EventPublisher> = Arc::new(KubeEventPublisher::new(
            karmada.client("event-broadcaster")?,
            crate::CONTROLLER_MANAGER_NAME,
            identity.clone(),
        ));
        let runner: Arc<dyn LeaderRunner> = Arc::new(ContextRunner::new(
            self.config.clone(),
            karmada.clone(),
            host,
            debug,
            healthz,
            events.clone(),
        ));

        let (Some(watchdog), Some(identity)) = (watchdog, identity) else {
            return runner.run(shutdown, self.registry.clone(), Gate::new()).await;
        };

        let election = &generic.leader_election;
        let client = karmada.client("leader-election")?;

        let main_lock = new_resource_lock(
            &election.resource_lock,
            &election.resource_namespace,
            &election.resource_name,
            &identity,
            client.clone(),
        )?;
        let main = LeaderElector::new("main", main_lock, election.timing())
            .with_watchdog(watchdog.clone())
            .with_event_recorder(events.clone());

        let migration = if leader_migration::enabled(generic) {
            tracing::info!("starting leader migration");
            let config = &generic.leader_migration;
            let lock = new_resource_lock(
                &config.resource_lock,
                &election.resource_namespace,
                &config.leader_name,
                &identity,
                client,
            )?;
            Some((
                LeaderElector::new("migration", lock, election.timing())
                    .with_watchdog(watchdog)
                    .with_event_recorder(events),
                LeaderMigrator::new(config, MIGRATION_COMPONENT),
            ))
        } else {
            None
        };

        run_leader_elections(main, migration, runner, &self.registry, shutdown).await
    }
}
