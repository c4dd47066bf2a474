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

//! Configuration structures for the controller manager.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use serde::{Deserialize, Serialize};

use crate::controller_descriptor::{ControllerEnablement, ControllerRegistry};
use crate::error::{Error, Result};
use crate::leader_election::{LeaderElectionTiming, LEASES_RESOURCE_LOCK};

/// Main configuration for the firefly-karmada-manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerManagerConfig {
    /// Generic configuration applicable to all controllers.
    #[serde(default)]
    pub generic: GenericControllerManagerConfig,

    /// Where the two clusters are reached.
    #[serde(default)]
    pub clusters: ClustersConfig,

    /// Namespace of the scheduler-estimator on the host cluster.
    ///
    /// Host side firefly informers only watch this namespace.
    #[serde(default = "default_estimator_namespace")]
    pub estimator_namespace: String,

    /// Name of the firefly karmada object this manager serves.
    #[serde(default)]
    pub karmada_name: String,

    /// HTTP serving of health and debug endpoints.
    #[serde(default)]
    pub serving: ServingConfig,
}

impl Default for ControllerManagerConfig {
    fn default() -> Self {
        Self {
            generic: GenericControllerManagerConfig::default(),
            clusters: ClustersConfig::default(),
            estimator_namespace: default_estimator_namespace(),
            karmada_name: String::new(),
            serving: ServingConfig::default(),
        }
    }
}

fn default_estimator_namespace() -> String {
    "firefly-system".to_string()
}

/// Generic configuration applicable to all controllers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericControllerManagerConfig {
    /// Controllers to enable.
    ///
    /// '*' enables all controllers that are on by default, 'foo' enables the
    /// controller named 'foo', '-foo' disables the controller named 'foo'.
    #[serde(default = "default_controllers")]
    pub controllers: Vec<String>,

    /// Minimum resync period for informers. Each factory uses a random
    /// period between this value and twice this value.
    #[serde(default = "default_min_resync_period", with = "humantime_serde")]
    pub min_resync_period: Duration,

    /// Base interval slept before each controller is started.
    #[serde(
        default = "default_controller_start_interval",
        with = "humantime_serde"
    )]
    pub controller_start_interval: Duration,

    /// Leader election configuration.
    #[serde(default)]
    pub leader_election: LeaderElectionConfig,

    /// Whether leader migration is enabled.
    #[serde(default)]
    pub leader_migration_enabled: bool,

    /// Leader migration configuration, used when migration is enabled.
    #[serde(default)]
    pub leader_migration: LeaderMigrationConfiguration,
}

impl Default for GenericControllerManagerConfig {
    fn default() -> Self {
        Self {
            controllers: default_controllers(),
            min_resync_period: default_min_resync_period(),
            controller_start_interval: default_controller_start_interval(),
            leader_election: LeaderElectionConfig::default(),
            leader_migration_enabled: false,
            leader_migration: LeaderMigrationConfiguration::default(),
        }
    }
}

fn default_controllers() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_min_resync_period() -> Duration {
    Duration::from_secs(12 * 60 * 60) // 12 hours
}

fn default_controller_start_interval() -> Duration {
    Duration::from_millis(100)
}

/// Kubeconfig locations for both clusters.
///
/// A missing path falls back to the inferred configuration (in-cluster
/// service account, then `$KUBECONFIG` / `~/.kube/config`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClustersConfig {
    /// Kubeconfig of the karmada control plane.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub karmada_kubeconfig: Option<PathBuf>,

    /// Kubeconfig of the host cluster running firefly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_kubeconfig: Option<PathBuf>,
}

/// HTTP serving configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServingConfig {
    /// The address to serve health and debug endpoints on.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// The port to serve on. 0 disables serving entirely.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl ServingConfig {
    /// Returns the listen address, or `None` when serving is disabled.
    pub fn address(&self) -> Option<String> {
        (self.port != 0).then(|| format!("{}:{}", self.bind_address, self.port))
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    10357
}

/// Leader election configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElectionConfig {
    /// Enable leader election.
    #[serde(default = "default_leader_elect")]
    pub leader_elect: bool,

    /// Resource lock type.
    #[serde(default = "default_resource_lock")]
    pub resource_lock: String,

    /// Resource namespace.
    #[serde(default = "default_resource_namespace")]
    pub resource_namespace: String,

    /// Resource name.
    #[serde(default = "default_resource_name")]
    pub resource_name: String,

    /// Lease duration.
    #[serde(default = "default_lease_duration", with = "humantime_serde")]
    pub lease_duration: Duration,

    /// Renew deadline.
    #[serde(default = "default_renew_deadline", with = "humantime_serde")]
    pub renew_deadline: Duration,

    /// Retry period.
    #[serde(default = "default_retry_period", with = "humantime_serde")]
    pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            leader_elect: default_leader_elect(),
            resource_lock: default_resource_lock(),
            resource_namespace: default_resource_namespace(),
            resource_name: default_resource_name(),
            lease_duration: default_lease_duration(),
            renew_deadline: default_renew_deadline(),
            retry_period: default_retry_period(),
        }
    }
}

impl LeaderElectionConfig {
    /// Returns the election timings.
    pub fn timing(&self) -> LeaderElectionTiming {
        LeaderElectionTiming {
            lease_duration: self.lease_duration,
            renew_deadline: self.renew_deadline,
            retry_period: self.retry_period,
        }
    }
}

fn default_leader_elect() -> bool {
    true
}

fn default_resource_lock() -> String {
    "leases".to_string()
}

fn default_resource_namespace() -> String {
    "firefly-system".to_string()
}

fn default_resource_name() -> String {
    crate::CONTROLLER_MANAGER_NAME.to_string()
}

fn default_lease_duration() -> Duration {
    Duration::from_secs(15)
}

fn default_renew_deadline() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_period() -> Duration {
    Duration::from_secs(2)
}

/// Leader migration configuration.
///
/// Lists the controllers that move to the migration lock and which
/// component is expected to run them afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderMigrationConfiguration {
    /// Name of the migration lease.
    #[serde(default = "default_migration_leader_name")]
    pub leader_name: String,

    /// Resource lock type of the migration lease.
    #[serde(default = "default_resource_lock")]
    pub resource_lock: String,

    /// Controllers subject to migration.
    #[serde(default)]
    pub controller_leaders: Vec<ControllerLeaderConfiguration>,
}

impl Default for LeaderMigrationConfiguration {
    fn default() -> Self {
        Self {
            leader_name: default_migration_leader_name(),
            resource_lock: default_resource_lock(),
            controller_leaders: Vec::new(),
        }
    }
}

impl LeaderMigrationConfiguration {
    /// Reads a migration configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!(
                "failed to read leader migration config {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_yaml::from_str(&content).map_err(|e| {
            Error::InvalidConfig(format!(
                "failed to parse leader migration config {}: {}",
                path.display(),
                e
            ))
        })
    }
}

fn default_migration_leader_name() -> String {
    format!("{}-migration", crate::CONTROLLER_MANAGER_NAME)
}

/// A controller and the component that should run it under migration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerLeaderConfiguration {
    /// Controller name.
    pub name: String,

    /// Component name, or "*" for any component.
    pub component: String,
}

impl ControllerManagerConfig {
    /// Validates the configuration against the set of compiled-in controllers.
    pub fn validate(&self, known_controllers: &[String]) -> Result<()> {
        let generic = &self.generic;

        ControllerEnablement::new(generic.controllers.clone(), Default::default())
            .validate(known_controllers)?;

        if generic.leader_election.leader_elect {
            generic.leader_election.timing().validate()?;
            check_resource_lock(&generic.leader_election.resource_lock)?;
            if generic.leader_election.resource_name.is_empty() {
                return Err(Error::InvalidConfig(
                    "leader election resource name must not be empty".into(),
                ));
            }
        }

        if generic.leader_migration_enabled {
            if !generic.leader_election.leader_elect {
                return Err(Error::InvalidConfig(
                    "leader migration requires leader election".into(),
                ));
            }
            check_resource_lock(&generic.leader_migration.resource_lock)?;
            if generic.leader_migration.leader_name.is_empty() {
                return Err(Error::InvalidConfig(
                    "leader migration leader name must not be empty".into(),
                ));
            }
            if generic.leader_migration.leader_name == generic.leader_election.resource_name {
                return Err(Error::InvalidConfig(
                    "leader migration lock must differ from the main lock".into(),
                ));
            }
        }

        Ok(())
    }

    /// Validates the configuration and loads both cluster connections.
    pub async fn complete(self, registry: &ControllerRegistry) -> Result<CompletedConfig> {
        self.validate(&registry.known_controllers())?;

        let karmada_kubeconfig = load_kube_config(self.clusters.karmada_kubeconfig.as_deref()).await?;
        let host_kubeconfig = load_kube_config(self.clusters.host_kubeconfig.as_deref()).await?;
        let enablement = ControllerEnablement::new(
            self.generic.controllers.clone(),
            registry.disabled_by_default(),
        );

        Ok(CompletedConfig {
            component_config: Arc::new(self),
            karmada_kubeconfig,
            host_kubeconfig,
            enablement,
        })
    }
}

fn check_resource_lock(kind: &str) -> Result<()> {
    if kind != LEASES_RESOURCE_LOCK {
        return Err(Error::InvalidConfig(format!(
            "unsupported resource lock {kind:?}, expected {LEASES_RESOURCE_LOCK:?}"
        )));
    }
    Ok(())
}

/// A validated configuration with live cluster connection settings.
#[derive(Clone)]
pub struct CompletedConfig {
    /// Immutable configuration snapshot handed to every controller.
    pub component_config: Arc<ControllerManagerConfig>,

    /// Connection to the karmada control plane.
    pub karmada_kubeconfig: kube::Config,

    /// Connection to the host cluster.
    pub host_kubeconfig: kube::Config,

    /// Which controllers may run.
    pub enablement: ControllerEnablement,
}

/// Loads a kubeconfig file, or infers the configuration when no path is given.
pub async fn load_kube_config(path: Option<&Path>) -> Result<kube::Config> {
    match path {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|source| Error::Kubeconfig {
                path: path.display().to_string(),
                source,
            })?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|source| Error::Kubeconfig {
                    path: path.display().to_string(),
                    source,
                })
        }
        None => kube::Config::infer().await.map_err(Error::InferConfig),
    }
}

/// Module for duration serialization/deserialization with human-readable format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> Vec<String> {
        ["estimator", "node", "foo", "kubean"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = ControllerManagerConfig::default();
        assert_eq!(config.generic.controllers, vec!["*"]);
        assert!(config.generic.leader_election.leader_elect);
        assert!(!config.generic.leader_migration_enabled);
        assert_eq!(config.serving.address().as_deref(), Some("0.0.0.0:10357"));
        config.validate(&known()).unwrap();
    }

    #[test]
    fn test_deserialize_basic_config() {
        let yaml = r#"
generic:
  controllers: ["*", "-kubean"]
  minResyncPeriod: 10m
  controllerStartInterval: 2s
  leaderElection:
    leaderElect: false
estimatorNamespace: estimators
karmadaName: demo
serving:
  port: 0
"#;

        let config: ControllerManagerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.generic.controllers, vec!["*", "-kubean"]);
        assert_eq!(config.generic.min_resync_period, Duration::from_secs(600));
        assert_eq!(config.generic.controller_start_interval, Duration::from_secs(2));
        assert!(!config.generic.leader_election.leader_elect);
        assert_eq!(config.generic.leader_election.lease_duration, Duration::from_secs(15));
        assert_eq!(config.estimator_namespace, "estimators");
        assert_eq!(config.karmada_name, "demo");
        assert!(config.serving.address().is_none());
    }

    #[test]
    fn test_validate_rejects_unknown_controller() {
        let mut config = ControllerManagerConfig::default();
        config.generic.controllers = vec!["*".into(), "-bogus".into()];
        assert!(matches!(
            config.validate(&known()),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_migration_requires_distinct_lock() {
        let mut config = ControllerManagerConfig::default();
        config.generic.leader_migration_enabled = true;
        config.generic.leader_migration.leader_name =
            config.generic.leader_election.resource_name.clone();
        assert!(config.validate(&known()).is_err());

        config.generic.leader_migration.leader_name = "other".into();
        config.validate(&known()).unwrap();

        config.generic.leader_election.leader_elect = false;
        assert!(config.validate(&known()).is_err());
    }

    #[test]
    fn test_validate_leader_election_timing() {
        let mut config = ControllerManagerConfig::default();
        config.generic.leader_election.renew_deadline = Duration::from_secs(20);
        assert!(config.validate(&known()).is_err());

        config.generic.leader_election.renew_deadline = Duration::from_secs(10);
        config.generic.leader_election.resource_lock = "endpoints".into();
        assert!(config.validate(&known()).is_err());

        // Neither matters without leader election.
        config.generic.leader_election.leader_elect = false;
        config.validate(&known()).unwrap();
    }

    #[test]
    fn test_migration_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migration.yaml");
        std::fs::write(
            &path,
            r#"
leaderName: firefly-migration
controllerLeaders:
  - name: node
    component: firefly-controller-manager
  - name: kubean
    component: "*"
"#,
        )
        .unwrap();

        let config = LeaderMigrationConfiguration::from_file(&path).unwrap();
        assert_eq!(config.leader_name, "firefly-migration");
        assert_eq!(config.resource_lock, "leases");
        assert_eq!(config.controller_leaders.len(), 2);
        assert_eq!(
            config.controller_leaders[0].component,
            crate::controller_manager::MIGRATION_COMPONENT
        );
        assert_eq!(config.controller_leaders[1].component, "*");
    }
}
