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

//! Health check support.
//!
//! Every started controller contributes exactly one check: its own probe
//! when it has one, a ping otherwise. When leader election is enabled the
//! election watchdog is registered next to them.

use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::controller::BoxFuture;

/// How long past lease expiry a leader may go unrenewed before the
/// watchdog reports it unhealthy.
pub const LEADER_ELECTION_HEALTHZ_TIMEOUT: Duration = Duration::from_secs(20);

/// Health checker trait.
///
/// Components implement this trait to provide custom health checks.
pub trait HealthChecker: Send + Sync + 'static {
    /// Returns the name the check is registered under.
    fn name(&self) -> &str;

    /// Performs a health check. An error carries the reason.
    fn check(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Adapter for implementing [`HealthChecker`] with a function.
pub struct FunctionHealthChecker<F> {
    name: String,
    check_fn: F,
}

impl<F, Fut> FunctionHealthChecker<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    /// Creates a new function-based health checker.
    pub fn new(name: impl Into<String>, check_fn: F) -> Self {
        Self {
            name: name.into(),
            check_fn,
        }
    }
}

impl<F, Fut> HealthChecker for FunctionHealthChecker<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin((self.check_fn)())
    }
}

/// Always healthy. Stands in for controllers without a probe of their own.
#[derive(Debug, Clone)]
pub struct PingChecker {
    name: String,
}

impl PingChecker {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl HealthChecker for PingChecker {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Registers a controller's own probe under the controller's name.
pub struct NamedHealthChecker {
    name: String,
    inner: Arc<dyn HealthChecker>,
}

impl NamedHealthChecker {
    pub fn new(name: impl Into<String>, inner: Arc<dyn HealthChecker>) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }
}

impl HealthChecker for NamedHealthChecker {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        self.inner.check()
    }
}

#[derive(Debug, Default)]
struct WatchdogState {
    leading: Option<Leading>,
}

#[derive(Debug, Clone)]
struct Leading {
    lock: String,
    renewed_at: Instant,
    lease_duration: Duration,
}

/// Leader election watchdog.
///
/// Reports unhealthy when this process believes it leads but has not renewed
/// its lease for longer than the lease duration plus the tolerance. Healthy
/// while not leading.
#[derive(Debug, Clone)]
pub struct LeaderHealthzAdaptor {
    timeout: Duration,
    state: Arc<RwLock<WatchdogState>>,
}

impl LeaderHealthzAdaptor {
    /// Creates a watchdog with the given tolerance past lease expiry.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Arc::default(),
        }
    }

    /// Records a successful acquire or renew.
    pub async fn record_renewal(&self, lock: &str, lease_duration: Duration) {
        self.state.write().await.leading = Some(Leading {
            lock: lock.to_string(),
            renewed_at: Instant::now(),
            lease_duration,
        });
    }

    /// Records that leadership ended.
    pub async fn record_stopped(&self) {
        self.state.write().await.leading = None;
    }
}

impl Default for LeaderHealthzAdaptor {
    fn default() -> Self {
        Self::new(LEADER_ELECTION_HEALTHZ_TIMEOUT)
    }
}

impl HealthChecker for LeaderHealthzAdaptor {
    fn name(&self) -> &str {
        "leaderElection"
    }

    fn check(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let Some(leading) = &state.leading else {
                return Ok(());
            };
            let since = leading.renewed_at.elapsed();
            if since > leading.lease_duration + self.timeout {
                anyhow::bail!(
                    "failed election to renew leadership on lease {} ({:?} since last renewal)",
                    leading.lock,
                    since
                );
            }
            Ok(())
        })
    }
}

/// Health check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Outcome of one check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Aggregate of every registered check, in registration order.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<CheckResult>,
}

impl HealthReport {
    /// Returns true when every check passed.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Renders the `[+]name ok` listing served on `/healthz?verbose`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for check in &self.checks {
            match &check.reason {
                None => {
                    let _ = writeln!(out, "[+]{} ok", check.name);
                }
                Some(reason) => {
                    let _ = writeln!(out, "[-]{} failed: {}", check.name, reason);
                }
            }
        }
        if self.is_healthy() {
            out.push_str("healthz check passed\n");
        } else {
            out.push_str("healthz check failed\n");
        }
        out
    }
}

/// Shared health handler.
///
/// Checks are only ever added in batches so a reader never observes half of
/// a controller set.
#[derive(Clone, Default)]
pub struct HealthzHandler {
    checkers: Arc<RwLock<Vec<Arc<dyn HealthChecker>>>>,
}

impl HealthzHandler {
    /// Creates a new empty handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers all `checkers` under a single write lock.
    pub async fn add_health_checkers(&self, checkers: Vec<Arc<dyn HealthChecker>>) {
        if checkers.is_empty() {
            return;
        }
        let mut registered = self.checkers.write().await;
        for checker in &checkers {
            tracing::debug!(check = checker.name(), "registering health check");
        }
        registered.extend(checkers);
    }

    /// Runs all checks and returns the results.
    pub async fn check_all(&self) -> HealthReport {
        let checkers = self.checkers.read().await.clone();
        let mut checks = Vec::with_capacity(checkers.len());
        let mut healthy = true;

        for checker in checkers {
            let result = checker.check().await;
            if result.is_err() {
                healthy = false;
            }
            checks.push(CheckResult {
                name: checker.name().to_string(),
                status: if result.is_ok() {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Unhealthy
                },
                reason: result.err().map(|err| err.to_string()),
            });
        }

        HealthReport {
            status: if healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            checks,
        }
    }

    /// Runs the check registered under `name`, if any.
    pub async fn check(&self, name: &str) -> Option<anyhow::Result<()>> {
        let checker = self
            .checkers
            .read()
            .await
            .iter()
            .find(|c| c.name() == name)
            .cloned()?;
        Some(checker.check().await)
    }

    /// Returns the registered check names.
    pub async fn names(&self) -> Vec<String> {
        self.checkers
            .read()
            .await
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Returns the number of registered checkers.
    pub async fn len(&self) -> usize {
        self.checkers.read().await.len()
    }

    /// Returns true if there are no registered checkers.
    pub async fn is_empty(&self) -> bool {
        self.checkers.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthz_handler() {
        let handler = HealthzHandler::new();
        handler
            .add_health_checkers(vec![
                Arc::new(PingChecker::new("node")) as Arc<dyn HealthChecker>,
                Arc::new(FunctionHealthChecker::new("estimator", || async { Ok(()) })),
            ])
            .await;

        assert_eq!(handler.len().await, 2);
        assert_eq!(handler.names().await, vec!["node", "estimator"]);

        let report = handler.check_all().await;
        assert!(report.is_healthy());
        assert!(report.render().contains("[+]estimator ok"));
        assert!(handler.check("node").await.unwrap().is_ok());
        assert!(handler.check("foo").await.is_none());
    }

    #[tokio::test]
    async fn test_unhealthy_checker() {
        let handler = HealthzHandler::new();
        let inner: Arc<dyn HealthChecker> = Arc::new(FunctionHealthChecker::new("probe", || async {
            Err::<(), _>(anyhow::anyhow!("queue stuck"))
        }));
        handler
            .add_health_checkers(vec![Arc::new(NamedHealthChecker::new("kubean", inner)) as Arc<dyn HealthChecker>])
            .await;

        let report = handler.check_all().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.checks[0].name, "kubean");
        assert_eq!(report.checks[0].reason.as_deref(), Some("queue stuck"));
        assert!(report.render().contains("[-]kubean failed: queue stuck"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_watchdog() {
        let watchdog = LeaderHealthzAdaptor::default();
        assert!(watchdog.check().await.is_ok());

        watchdog.record_renewal("main", Duration::from_secs(15)).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(watchdog.check().await.is_ok());

        tokio::time::advance(Duration::from_secs(10)).await;
        let err = watchdog.check().await.unwrap_err();
        assert!(err.to_string().contains("main"));

        watchdog.record_stopped().await;
        assert!(watchdog.check().await.is_ok());
    }
}
