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

//! Resource discovery and REST mapping.
//!
//! Discovery answers are memoized and the kind/resource table built from
//! them is created on first use. Both are dropped every
//! [`REST_MAPPER_RESET_PERIOD`] so that newly installed CRDs resolve without
//! a restart.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kube::api::ApiResource;
use kube::core::{GroupVersion, GroupVersionKind, GroupVersionResource};
use kube::Client;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::wait;

/// How often the REST mapper forgets what it learned.
pub const REST_MAPPER_RESET_PERIOD: Duration = Duration::from_secs(30);

/// Resources served by one cluster.
pub type AvailableResources = HashSet<GroupVersionResource>;

/// Result of a discovery sweep.
///
/// Group versions that could not be listed are recorded in `failed` next to
/// whatever the server did return.
#[derive(Debug, Clone, Default)]
pub struct ServerResources {
    pub resources: Vec<APIResourceList>,
    /// Group version to the error listing it.
    pub failed: BTreeMap<String, String>,
}

/// Source of discovery information.
#[async_trait]
pub trait DiscoveryInterface: Send + Sync + 'static {
    /// Lists every group version and its resources.
    ///
    /// Returns an error only when nothing at all could be listed.
    async fn server_groups_and_resources(&self) -> Result<ServerResources>;
}

/// Discovery against a live API server.
#[derive(Clone)]
pub struct KubeDiscovery {
    client: Client,
}

impl KubeDiscovery {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DiscoveryInterface for KubeDiscovery {
    async fn server_groups_and_resources(&self) -> Result<ServerResources> {
        let mut out = ServerResources::default();

        let core = self
            .client
            .list_core_api_versions()
            .await
            .map_err(|err| Error::Discovery(format!("listing core versions: {err}")))?;
        let groups = self
            .client
            .list_api_groups()
            .await
            .map_err(|err| Error::Discovery(format!("listing api groups: {err}")))?;

        for version in &core.versions {
            match self.client.list_core_api_resources(version).await {
                Ok(list) => out.resources.push(list),
                Err(err) => {
                    out.failed.insert(version.clone(), err.to_string());
                }
            }
        }

        for group in &groups.groups {
            for version in &group.versions {
                match self.client.list_api_group_resources(&version.group_version).await {
                    Ok(list) => out.resources.push(list),
                    Err(err) => {
                        out.failed.insert(version.group_version.clone(), err.to_string());
                    }
                }
            }
        }

        Ok(out)
    }
}

/// Returns every resource the cluster serves.
///
/// Partial failures are logged; an empty result is an error.
pub async fn get_available_resources(discovery: &dyn DiscoveryInterface) -> Result<AvailableResources> {
    let ServerResources { resources, failed } = discovery.server_groups_and_resources().await?;

    if !failed.is_empty() {
        tracing::warn!(
            failed = ?failed,
            "unable to get all supported resources from server"
        );
    }

    let mut available = AvailableResources::new();
    for list in &resources {
        let gv: GroupVersion = list
            .group_version
            .parse()
            .map_err(|_| Error::GroupVersion(list.group_version.clone()))?;
        for resource in &list.resources {
            available.insert(GroupVersionResource::gvr(&gv.group, &gv.version, &resource.name));
        }
    }

    if available.is_empty() {
        return Err(Error::NoResources);
    }
    Ok(available)
}

/// Memoizes the last successful discovery answer until invalidated.
pub struct MemCacheDiscovery {
    inner: Arc<dyn DiscoveryInterface>,
    cached: RwLock<Option<ServerResources>>,
}

impl MemCacheDiscovery {
    pub fn new(inner: Arc<dyn DiscoveryInterface>) -> Self {
        Self {
            inner,
            cached: RwLock::new(None),
        }
    }

    /// Forgets the cached answer.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    /// Returns true when the next call will hit the server.
    pub async fn is_empty(&self) -> bool {
        self.cached.read().await.is_none()
    }
}

#[async_trait]
impl DiscoveryInterface for MemCacheDiscovery {
    async fn server_groups_and_resources(&self) -> Result<ServerResources> {
        if let Some(cached) = self.cached.read().await.as_ref() {
            return Ok(cached.clone());
        }

        let mut cached = self.cached.write().await;
        if let Some(cached) = cached.as_ref() {
            return Ok(cached.clone());
        }
        let fresh = self.inner.server_groups_and_resources().await?;
        *cached = Some(fresh.clone());
        Ok(fresh)
    }
}

/// How one kind is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestMapping {
    pub kind: GroupVersionKind,
    pub resource: GroupVersionResource,
    pub namespaced: bool,
}

impl RestMapping {
    /// Returns the dynamic resource description for this mapping.
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(&self.kind, &self.resource.resource)
    }
}

#[derive(Debug, Default)]
struct MappingTable {
    // Discovery order, so the first match for a partial resource is the
    // server's preferred version.
    entries: Vec<RestMapping>,
}

impl MappingTable {
    fn build(server: &ServerResources) -> Result<Self> {
        let mut entries = Vec::new();
        for list in &server.resources {
            let gv: GroupVersion = list
                .group_version
                .parse()
                .map_err(|_| Error::GroupVersion(list.group_version.clone()))?;
            // Subresources such as pods/status have no kind of their own.
            for resource in list.resources.iter().filter(|r| !r.name.contains('/')) {
                entries.push(RestMapping {
                    kind: GroupVersionKind::gvk(&gv.group, &gv.version, &resource.kind),
                    resource: GroupVersionResource::gvr(&gv.group, &gv.version, &resource.name),
                    namespaced: resource.namespaced,
                });
            }
        }
        Ok(Self { entries })
    }
}

/// REST mapper that only consults discovery when first asked.
pub struct DeferredDiscoveryRestMapper {
    discovery: Arc<MemCacheDiscovery>,
    table: RwLock<Option<Arc<MappingTable>>>,
}

impl DeferredDiscoveryRestMapper {
    pub fn new(discovery: Arc<MemCacheDiscovery>) -> Self {
        Self {
            discovery,
            table: RwLock::new(None),
        }
    }

    /// Drops both the discovery cache and the mapping table.
    pub async fn reset(&self) {
        let mut table = self.table.write().await;
        self.discovery.invalidate().await;
        *table = None;
    }

    /// Returns the table and whether it was built by this call.
    async fn table(&self) -> Result<(Arc<MappingTable>, bool)> {
        if let Some(table) = self.table.read().await.as_ref() {
            return Ok((table.clone(), false));
        }

        let mut slot = self.table.write().await;
        if let Some(table) = slot.as_ref() {
            return Ok((table.clone(), false));
        }
        let server = self.discovery.server_groups_and_resources().await?;
        let table = Arc::new(MappingTable::build(&server)?);
        *slot = Some(table.clone());
        Ok((table, true))
    }

    /// Looks up with a stale table first; a miss on a table that was not
    /// built just now triggers one reset and retry.
    async fn lookup<T>(
        &self,
        what: impl Fn() -> String,
        find: impl Fn(&MappingTable) -> Option<T>,
    ) -> Result<T> {
        let (table, fresh) = self.table().await?;
        if let Some(found) = find(&*table) {
            return Ok(found);
        }
        if !fresh {
            self.reset().await;
            let (table, _) = self.table().await?;
            if let Some(found) = find(&*table) {
                return Ok(found);
            }
        }
        Err(Error::NoMapping(what()))
    }

    /// Returns how `gvk` is addressed.
    pub async fn rest_mapping(&self, gvk: &GroupVersionKind) -> Result<RestMapping> {
        self.lookup(
            || format!("{}, Kind={}", gvk.api_version(), gvk.kind),
            |table| table.entries.iter().find(|m| m.kind == *gvk).cloned(),
        )
        .await
    }

    /// Completes a resource whose version may be empty with the preferred
    /// served version.
    pub async fn resource_for(&self, partial: &GroupVersionResource) -> Result<GroupVersionResource> {
        self.lookup(
            || format!("{}/{} {}", partial.group, partial.version, partial.resource),
            |table| {
                table
                    .entries
                    .iter()
                    .find(|m| {
                        m.resource.group == partial.group
                            && m.resource.resource == partial.resource
                            && (partial.version.is_empty() || m.resource.version == partial.version)
                    })
                    .map(|m| m.resource.clone())
            },
        )
        .await
    }

    /// Returns the kind served at `resource`.
    pub async fn kind_for(&self, resource: &GroupVersionResource) -> Result<GroupVersionKind> {
        let resource = self.resource_for(resource).await?;
        self.lookup(
            || format!("{}/{} {}", resource.group, resource.version, resource.resource),
            |table| {
                table
                    .entries
                    .iter()
                    .find(|m| m.resource == resource)
                    .map(|m| m.kind.clone())
            },
        )
        .await
    }
}

/// Resets `mapper` every `period` until `token` is cancelled.
pub fn spawn_reset_loop(
    mapper: Arc<DeferredDiscoveryRestMapper>,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(wait::until(period, token, move || {
        let mapper = mapper.clone();
        async move { mapper.reset().await }
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource;

    use super::*;

    fn resource(name: &str, kind: &str, namespaced: bool) -> APIResource {
        APIResource {
            name: name.to_string(),
            kind: kind.to_string(),
            namespaced,
            ..Default::default()
        }
    }

    fn list(group_version: &str, resources: Vec<APIResource>) -> APIResourceList {
        APIResourceList {
            group_version: group_version.to_string(),
            resources,
        }
    }

    /// Discovery double answering from a fixed list and counting calls.
    #[derive(Default)]
    pub(crate) struct FakeDiscovery {
        pub(crate) server: ServerResources,
        pub(crate) calls: AtomicUsize,
    }

    impl FakeDiscovery {
        pub(crate) fn standard() -> Self {
            Self {
                server: ServerResources {
                    resources: vec![
                        list(
                            "v1",
                            vec![
                                resource("pods", "Pod", true),
                                resource("pods/status", "Pod", true),
                                resource("nodes", "Node", false),
                            ],
                        ),
                        list("apps/v1", vec![resource("deployments", "Deployment", true)]),
                        list("apps/v1beta1", vec![resource("deployments", "Deployment", true)]),
                    ],
                    failed: BTreeMap::new(),
                },
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DiscoveryInterface for FakeDiscovery {
        async fn server_groups_and_resources(&self) -> Result<ServerResources> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.server.clone())
        }
    }

    #[tokio::test]
    async fn test_available_resources() {
        let fake = FakeDiscovery::standard();
        let available = get_available_resources(&fake).await.unwrap();

        assert!(available.contains(&GroupVersionResource::gvr("", "v1", "pods")));
        assert!(available.contains(&GroupVersionResource::gvr("", "v1", "pods/status")));
        assert!(available.contains(&GroupVersionResource::gvr("apps", "v1", "deployments")));
        assert!(!available.contains(&GroupVersionResource::gvr("batch", "v1", "jobs")));
    }

    #[tokio::test]
    async fn test_partial_failure_is_tolerated() {
        let mut fake = FakeDiscovery::standard();
        fake.server
            .failed
            .insert("metrics.k8s.io/v1beta1".into(), "service unavailable".into());

        let available = get_available_resources(&fake).await.unwrap();
        assert_eq!(available.len(), 5);
    }

    #[tokio::test]
    async fn test_empty_discovery_is_an_error() {
        let fake = FakeDiscovery {
            server: ServerResources {
                resources: vec![list("v1", vec![]), list("apps/v1", vec![])],
                failed: BTreeMap::from([("batch/v1".into(), "timeout".into())]),
            },
            ..Default::default()
        };
        assert!(matches!(
            get_available_resources(&fake).await,
            Err(Error::NoResources)
        ));
    }

    #[tokio::test]
    async fn test_bad_group_version() {
        let fake = FakeDiscovery {
            server: ServerResources {
                resources: vec![list("a/b/c", vec![resource("x", "X", true)])],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            get_available_resources(&fake).await,
            Err(Error::GroupVersion(_))
        ));
    }

    #[tokio::test]
    async fn test_rest_mapper_is_lazy_and_cached() {
        let fake = Arc::new(FakeDiscovery::standard());
        let mapper =
            DeferredDiscoveryRestMapper::new(Arc::new(MemCacheDiscovery::new(fake.clone())));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);

        let mapping = mapper
            .rest_mapping(&GroupVersionKind::gvk("apps", "v1", "Deployment"))
            .await
            .unwrap();
        assert_eq!(mapping.resource, GroupVersionResource::gvr("apps", "v1", "deployments"));
        assert!(mapping.namespaced);
        assert_eq!(mapping.api_resource().plural, "deployments");

        let node = mapper
            .kind_for(&GroupVersionResource::gvr("", "v1", "nodes"))
            .await
            .unwrap();
        assert_eq!(node.kind, "Node");
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);

        mapper.reset().await;
        let preferred = mapper
            .resource_for(&GroupVersionResource::gvr("apps", "", "deployments"))
            .await
            .unwrap();
        assert_eq!(preferred.version, "v1");
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rest_mapper_miss_retries_once() {
        let fake = Arc::new(FakeDiscovery::standard());
        let mapper =
            DeferredDiscoveryRestMapper::new(Arc::new(MemCacheDiscovery::new(fake.clone())));

        mapper
            .rest_mapping(&GroupVersionKind::gvk("", "v1", "Pod"))
            .await
            .unwrap();
        let missing = mapper
            .rest_mapping(&GroupVersionKind::gvk("firefly.io", "v1", "Estimator"))
            .await;
        assert!(matches!(missing, Err(Error::NoMapping(_))));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_loop() {
        let fake = Arc::new(FakeDiscovery::standard());
        let mapper = Arc::new(DeferredDiscoveryRestMapper::new(Arc::new(
            MemCacheDiscovery::new(fake.clone()),
        )));
        let token = CancellationToken::new();
        let task = spawn_reset_loop(mapper.clone(), REST_MAPPER_RESET_PERIOD, token.clone());

        let pod = GroupVersionKind::gvk("", "v1", "Pod");
        mapper.rest_mapping(&pod).await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        mapper.rest_mapping(&pod).await.unwrap();
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);

        token.cancel();
        task.await.unwrap();
    }
}
