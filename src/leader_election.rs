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

//! Leader election support.
//!
//! This module ensures only one instance of the controller manager acts on a
//! given lock at a time. Leadership is never re-acquired by the same elector:
//! once the lease cannot be renewed the elector returns
//! [`Error::LeadershipLost`] and the process is expected to exit.
//!
//! Only locally observed timestamps are trusted. Another holder's lease is
//! considered expired once its record has not changed for a full lease
//! duration as measured by this process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use k8s_openapi::chrono::Utc;
use kube::api::{Api, PostParams};
use kube::runtime::events::EventType;
use kube::Client;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{actions, reasons, EventPublisher};
use crate::health::LeaderHealthzAdaptor;
use crate::wait;

/// The jitter factor to use while attempting to acquire the lease.
pub const JITTER_FACTOR: f64 = 1.2;

/// The only supported resource lock kind.
pub const LEASES_RESOURCE_LOCK: &str = "leases";

/// Timing of one elector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderElectionTiming {
    /// How long non-leaders wait after the last observed change before
    /// taking over.
    pub lease_duration: Duration,

    /// How long the leader keeps retrying a renewal before giving up.
    pub renew_deadline: Duration,

    /// Wait between attempts.
    pub retry_period: Duration,
}

impl Default for LeaderElectionTiming {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

impl LeaderElectionTiming {
    /// Checks the ordering `lease_duration > renew_deadline > 1.2 * retry_period`.
    pub fn validate(&self) -> Result<()> {
        if self.lease_duration.is_zero() || self.renew_deadline.is_zero() || self.retry_period.is_zero() {
            return Err(Error::InvalidConfig(
                "leader election durations must be positive".into(),
            ));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::InvalidConfig(
                "leaseDuration must be greater than renewDeadline".into(),
            ));
        }
        if self.renew_deadline <= self.retry_period.mul_f64(JITTER_FACTOR) {
            return Err(Error::InvalidConfig(format!(
                "renewDeadline must be greater than retryPeriod*{JITTER_FACTOR}"
            )));
        }
        Ok(())
    }
}

/// A distributed lock record.
#[async_trait]
pub trait ResourceLock: Send + Sync + 'static {
    /// Identity this lock acquires under.
    fn identity(&self) -> &str;

    /// Human readable `namespace/name`.
    fn describe(&self) -> String;

    /// The lock object, as the subject of leader election events.
    fn object_reference(&self) -> ObjectReference {
        let describe = self.describe();
        let (namespace, name) = match describe.split_once('/') {
            Some((namespace, name)) => (Some(namespace.to_string()), name.to_string()),
            None => (None, describe),
        };
        ObjectReference {
            api_version: Some("coordination.k8s.io/v1".into()),
            kind: Some("Lease".into()),
            namespace,
            name: Some(name),
            ..Default::default()
        }
    }

    /// Takes or renews the lock. Returns whether this identity holds it
    /// afterwards.
    async fn try_acquire_or_renew(&self, lease_duration: Duration) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq)]
struct ObservedRecord {
    holder: String,
    renew_time: Option<MicroTime>,
    lease_duration: Duration,
}

/// Lock backed by a `coordination.k8s.io/v1` Lease.
pub struct LeaseLock {
    api: Api<Lease>,
    namespace: String,
    name: String,
    identity: String,
    observed: Mutex<Option<(ObservedRecord, Instant)>>,
}

impl LeaseLock {
    pub fn new(client: Client, namespace: &str, name: &str, identity: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
            identity: identity.to_string(),
            observed: Mutex::new(None),
        }
    }

    fn record_of(spec: &LeaseSpec) -> ObservedRecord {
        ObservedRecord {
            holder: spec.holder_identity.clone().unwrap_or_default(),
            renew_time: spec.renew_time.clone(),
            lease_duration: Duration::from_secs(spec.lease_duration_seconds.unwrap_or(0).max(0) as u64),
        }
    }

    /// Notes `spec`, restarting the expiry clock when the record changed.
    async fn observe(&self, spec: &LeaseSpec) -> (ObservedRecord, Instant) {
        let record = Self::record_of(spec);
        let mut observed = self.observed.lock().await;
        match observed.as_ref() {
            Some((previous, at)) if *previous == record => (record, *at),
            _ => {
                let at = Instant::now();
                *observed = Some((record.clone(), at));
                (record, at)
            }
        }
    }

    async fn create(&self, lease_duration: Duration) -> Result<bool> {
        let now = MicroTime(Utc::now());
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(lease_duration.as_secs() as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match self.api.create(&PostParams::default(), &lease).await {
            Ok(created) => {
                self.observe(&created.spec.unwrap_or_default()).await;
                Ok(true)
            }
            // Someone else created it first.
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ResourceLock for LeaseLock {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    async fn try_acquire_or_renew(&self, lease_duration: Duration) -> Result<bool> {
        let Some(mut lease) = self.api.get_opt(&self.name).await? else {
            return self.create(lease_duration).await;
        };

        let spec = lease.spec.take().unwrap_or_default();
        let (record, observed_at) = self.observe(&spec).await;
        let held_by_us = record.holder == self.identity;

        if !record.holder.is_empty() && !held_by_us && observed_at.elapsed() < record.lease_duration {
            tracing::debug!(lock = %self.describe(), holder = %record.holder, "lock is held by another candidate");
            return Ok(false);
        }

        let now = MicroTime(Utc::now());
        let transitions = spec.lease_transitions.unwrap_or(0);
        lease.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(lease_duration.as_secs() as i32),
            acquire_time: if held_by_us { spec.acquire_time.clone() } else { Some(now.clone()) },
            renew_time: Some(now),
            lease_transitions: Some(if held_by_us { transitions } else { transitions + 1 }),
            ..spec
        });
        lease.metadata.managed_fields = None;

        // The resourceVersion from the read makes this a compare-and-swap.
        match self.api.replace(&self.name, &PostParams::default(), &lease).await {
            Ok(updated) => {
                self.observe(&updated.spec.unwrap_or_default()).await;
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// Creates the lock of the given kind.
pub fn new_resource_lock(
    kind: &str,
    namespace: &str,
    name: &str,
    identity: &str,
    client: Client,
) -> Result<Arc<dyn ResourceLock>> {
    match kind {
        LEASES_RESOURCE_LOCK => Ok(Arc::new(LeaseLock::new(client, namespace, name, identity))),
        other => Err(Error::LockCreation(format!(
            "unsupported resource lock type {other:?}, only {LEASES_RESOURCE_LOCK:?} is supported"
        ))),
    }
}

/// Callbacks for leader election events.
#[async_trait]
pub trait LeaderCallbacks: Send + Sync + 'static {
    /// Runs the leadership epoch until `token` is cancelled. An error ends
    /// the elector with that error.
    async fn on_started_leading(&self, token: CancellationToken) -> Result<()>;

    /// Called once after the lease could not be renewed.
    async fn on_stopped_leading(&self) {}
}

/// Acquires one lock and keeps it for as long as possible.
pub struct LeaderElector {
    name: String,
    lock: Arc<dyn ResourceLock>,
    timing: LeaderElectionTiming,
    watchdog: Option<LeaderHealthzAdaptor>,
    events: Option<Arc<dyn EventPublisher>>,
}

enum Outcome {
    Shutdown,
    Lost,
    Failed(Error),
}

impl LeaderElector {
    /// Creates an elector. `name` labels logs, e.g. `main` or `migration`.
    pub fn new(name: impl Into<String>, lock: Arc<dyn ResourceLock>, timing: LeaderElectionTiming) -> Self {
        Self {
            name: name.into(),
            lock,
            timing,
            watchdog: None,
            events: None,
        }
    }

    /// Reports renewals to `watchdog`.
    pub fn with_watchdog(mut self, watchdog: LeaderHealthzAdaptor) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Publishes leadership changes as events on the lock object.
    pub fn with_event_recorder(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Runs the election until shutdown or until leadership is lost.
    ///
    /// Returns `Ok` only when `shutdown` fires.
    pub async fn run(&self, callbacks: Arc<dyn LeaderCallbacks>, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            elector = %self.name,
            lock = %self.lock.describe(),
            identity = %self.lock.identity(),
            "attempting to acquire leader lease"
        );

        if !self.acquire(&shutdown).await {
            return Ok(());
        }
        tracing::info!(elector = %self.name, lock = %self.lock.describe(), "successfully acquired lease");
        self.record_event(actions::ACQUIRE, "became leader").await;
        self.record_renewal().await;

        let epoch = shutdown.child_token();
        let mut leading = tokio::spawn({
            let callbacks = callbacks.clone();
            let epoch = epoch.clone();
            async move { callbacks.on_started_leading(epoch).await }
        });
        let mut epoch_done = false;

        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Outcome::Shutdown,
                joined = &mut leading, if !epoch_done => {
                    epoch_done = true;
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => break Outcome::Failed(err),
                        Err(err) => break Outcome::Failed(Error::Task(err.to_string())),
                    }
                }
                _ = tokio::time::sleep(self.timing.retry_period) => {
                    if !self.renew().await {
                        break Outcome::Lost;
                    }
                    self.record_renewal().await;
                }
            }
        };

        epoch.cancel();
        if let Some(watchdog) = &self.watchdog {
            watchdog.record_stopped().await;
        }

        match outcome {
            Outcome::Shutdown => {
                if !epoch_done {
                    if let Err(err) = leading.await {
                        tracing::warn!(elector = %self.name, error = %err, "leadership epoch panicked");
                    }
                }
                tracing::info!(elector = %self.name, "leader election stopped");
                Ok(())
            }
            Outcome::Failed(err) => Err(err),
            Outcome::Lost => {
                tracing::error!(elector = %self.name, lock = %self.lock.describe(), "leaderelection lost");
                self.record_event(actions::RELEASE, "stopped leading").await;
                callbacks.on_stopped_leading().await;
                Err(Error::LeadershipLost(self.lock.describe()))
            }
        }
    }

    /// Retries with jitter until the lock is held. Returns false on shutdown.
    async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        loop {
            match self.lock.try_acquire_or_renew(self.timing.lease_duration).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(elector = %self.name, error = %err, "error retrieving resource lock");
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(wait::jitter(self.timing.retry_period, JITTER_FACTOR)) => {}
            }
        }
    }

    /// Keeps trying to renew for at most the renew deadline.
    async fn renew(&self) -> bool {
        let attempts = async {
            loop {
                match self.lock.try_acquire_or_renew(self.timing.lease_duration).await {
                    Ok(true) => return,
                    Ok(false) => {
                        tracing::debug!(elector = %self.name, "lease renewal refused");
                    }
                    Err(err) => {
                        tracing::warn!(elector = %self.name, error = %err, "failed to renew lease");
                    }
                }
                tokio::time::sleep(self.timing.retry_period).await;
            }
        };
        tokio::time::timeout(self.timing.renew_deadline, attempts).await.is_ok()
    }

    async fn record_event(&self, action: &str, what: &str) {
        if let Some(events) = &self.events {
            let note = format!("{} {what}", self.lock.identity());
            events
                .publish(
                    &self.lock.object_reference(),
                    EventType::Normal,
                    reasons::LEADER_ELECTION,
                    action,
                    Some(note),
                )
                .await;
        }
    }

    async fn record_renewal(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.record_renewal(&self.lock.describe(), self.timing.lease_duration).await;
        }
    }
}

/// Creates a unique identity: the hostname plus a random UUID.
pub fn create_identity() -> Result<String> {
    let hostname = gethostname::gethostname()
        .into_string()
        .map_err(|raw| Error::Hostname(format!("{raw:?} is not valid UTF-8")))?;
    if hostname.is_empty() {
        return Err(Error::Hostname("hostname is empty".into()));
    }

    Ok(format!("{hostname}_{}", Uuid::new_v4()))
}
