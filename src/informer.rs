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

//! Shared informer factories.
//!
//! A factory hands out reflector stores. Asking for the same resource twice
//! returns the same store, and nothing is watched until the factory is
//! started. Controllers register what they need during initialization and
//! the orchestrator starts every factory once all controllers exist.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{Api, ApiResource, DynamicObject, PartialObjectMeta};
use kube::runtime::reflector::{self, reflector, store::Writer, Store};
use kube::runtime::{metadata_watcher, watcher, WatchStreamExt};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

/// Uniform handle the orchestrator uses to start factories.
pub trait InformerFactory: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Starts every registered informer. Informers registered later start
    /// right away. Starting twice is a no-op.
    fn start(&self, token: CancellationToken);

    /// Returns true once [`InformerFactory::start`] has been called.
    fn started(&self) -> bool;
}

#[derive(Default)]
struct CoreState {
    running: Option<CancellationToken>,
    stores: HashMap<String, Box<dyn Any + Send + Sync>>,
    pending: Vec<(String, BoxFuture<'static, ()>)>,
}

/// Bookkeeping shared by all factory shapes.
struct FactoryCore {
    name: String,
    resync_period: Duration,
    state: Mutex<CoreState>,
}

impl FactoryCore {
    fn new(name: impl Into<String>, resync_period: Duration) -> Self {
        Self {
            name: name.into(),
            resync_period,
            state: Mutex::new(CoreState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_or_register<S>(&self, key: String, make: impl FnOnce() -> (S, BoxFuture<'static, ()>)) -> S
    where
        S: Clone + Send + Sync + 'static,
    {
        let mut state = self.lock();
        if let Some(existing) = state.stores.get(&key).and_then(|s| s.downcast_ref::<S>()) {
            return existing.clone();
        }

        let (store, run) = make();
        state.stores.insert(key.clone(), Box::new(store.clone()));
        match &state.running {
            Some(token) => spawn_informer(&self.name, key, run, token.clone()),
            None => state.pending.push((key, run)),
        }
        store
    }

    fn start(&self, token: CancellationToken) {
        let mut state = self.lock();
        if state.running.is_some() {
            return;
        }
        state.running = Some(token.clone());
        let pending = std::mem::take(&mut state.pending);
        tracing::debug!(factory = %self.name, informers = pending.len(), "starting informers");
        for (key, run) in pending {
            spawn_informer(&self.name, key, run, token.clone());
        }
    }

    fn started(&self) -> bool {
        self.lock().running.is_some()
    }

    fn informer_count(&self) -> usize {
        self.lock().stores.len()
    }
}

fn spawn_informer(factory: &str, key: String, run: BoxFuture<'static, ()>, token: CancellationToken) {
    let factory = factory.to_string();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = run => {}
        }
        tracing::debug!(%factory, informer = %key, "informer stopped");
    });
}

/// Drives a reflector stream, logging watch errors. The backoff keeps it
/// alive across failures.
async fn drive<S, T, E>(factory: String, key: String, stream: S)
where
    S: futures::Stream<Item = Result<T, E>> + Send,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    while let Some(event) = stream.next().await {
        if let Err(err) = event {
            tracing::warn!(%factory, informer = %key, error = %err, "watch failed");
        }
    }
}

/// Picks the endpoint a typed informer lists and watches.
///
/// Namespaced kinds are read from the factory's namespace when it has one.
/// Cluster-scoped kinds are always read cluster wide.
pub trait FactoryScope: Sized {
    fn api<K>(client: Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>;
}

impl FactoryScope for NamespaceResourceScope {
    fn api<K>(client: Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>,
    {
        match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        }
    }
}

impl FactoryScope for ClusterResourceScope {
    fn api<K>(client: Client, _: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>,
    {
        Api::all(client)
    }
}

/// Factory for typed resources of one cluster.
pub struct SharedInformerFactory {
    core: FactoryCore,
    client: Client,
    namespace: Option<String>,
}

impl SharedInformerFactory {
    pub fn new(name: impl Into<String>, client: Client, resync_period: Duration) -> Self {
        Self {
            core: FactoryCore::new(name, resync_period),
            client,
            namespace: None,
        }
    }

    /// Creates a factory whose informers only see objects in `namespace`.
    pub fn new_filtered(
        name: impl Into<String>,
        client: Client,
        resync_period: Duration,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::new(name, client, resync_period)
        }
    }

    /// Namespace the informers are restricted to, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Resync period this factory was created with.
    pub fn resync_period(&self) -> Duration {
        self.core.resync_period
    }

    /// Number of distinct informers registered so far.
    pub fn informer_count(&self) -> usize {
        self.core.informer_count()
    }

    /// Returns the shared store for `K`, registering its informer on first use.
    pub fn informer<K>(&self) -> Store<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::Scope: FactoryScope,
    {
        let key = format!(
            "{}/{} ({})",
            K::api_version(&()),
            K::plural(&()),
            std::any::type_name::<K>()
        );
        self.core.get_or_register(key.clone(), || {
            let (store, writer) = reflector::store::<K>();
            let api = <K::Scope as FactoryScope>::api::<K>(self.client.clone(), self.namespace.as_deref());
            let stream = reflector(writer, watcher(api, watcher::Config::default())).default_backoff();
            (store, drive(self.core.name.clone(), key, stream).boxed())
        })
    }
}

impl InformerFactory for SharedInformerFactory {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn start(&self, token: CancellationToken) {
        self.core.start(token)
    }

    fn started(&self) -> bool {
        self.core.started()
    }
}

/// Factory for unstructured objects addressed by [`ApiResource`].
pub struct DynamicSharedInformerFactory {
    core: FactoryCore,
    client: Client,
}

impl DynamicSharedInformerFactory {
    pub fn new(name: impl Into<String>, client: Client, resync_period: Duration) -> Self {
        Self {
            core: FactoryCore::new(name, resync_period),
            client,
        }
    }

    pub fn resync_period(&self) -> Duration {
        self.core.resync_period
    }

    pub fn informer_count(&self) -> usize {
        self.core.informer_count()
    }

    /// Returns the shared store for `resource`.
    pub fn informer(&self, resource: &ApiResource) -> Store<DynamicObject> {
        let key = format!("{}/{}", resource.api_version, resource.plural);
        self.core.get_or_register(key.clone(), || {
            let writer = Writer::<DynamicObject>::new(resource.clone());
            let store = writer.as_reader();
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), resource);
            let stream = reflector(writer, watcher(api, watcher::Config::default())).default_backoff();
            (store, drive(self.core.name.clone(), key, stream).boxed())
        })
    }
}

impl InformerFactory for DynamicSharedInformerFactory {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn start(&self, token: CancellationToken) {
        self.core.start(token)
    }

    fn started(&self) -> bool {
        self.core.started()
    }
}

/// Factory for object metadata only.
pub struct MetadataSharedInformerFactory {
    core: FactoryCore,
    client: Client,
}

impl MetadataSharedInformerFactory {
    pub fn new(name: impl Into<String>, client: Client, resync_period: Duration) -> Self {
        Self {
            core: FactoryCore::new(name, resync_period),
            client,
        }
    }

    pub fn resync_period(&self) -> Duration {
        self.core.resync_period
    }

    pub fn informer_count(&self) -> usize {
        self.core.informer_count()
    }

    /// Returns the shared metadata store for `resource`.
    pub fn informer(&self, resource: &ApiResource) -> Store<PartialObjectMeta<DynamicObject>> {
        let key = format!("{}/{}", resource.api_version, resource.plural);
        self.core.get_or_register(key.clone(), || {
            let writer = Writer::<PartialObjectMeta<DynamicObject>>::new(resource.clone());
            let store = writer.as_reader();
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), resource);
            let stream =
                reflector(writer, metadata_watcher(api, watcher::Config::default())).default_backoff();
            (store, drive(self.core.name.clone(), key, stream).boxed())
        })
    }
}

impl InformerFactory for MetadataSharedInformerFactory {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn start(&self, token: CancellationToken) {
        self.core.start(token)
    }

    fn started(&self) -> bool {
        self.core.started()
    }
}

/// Store handed out by [`ObjectOrMetadataInformerFactory`].
#[derive(Clone)]
pub enum ObjectOrMetadataStore {
    Object(Store<DynamicObject>),
    Metadata(Store<PartialObjectMeta<DynamicObject>>),
}

/// Returns true for API groups served by every Kubernetes API server.
pub fn is_builtin_group(group: &str) -> bool {
    group.is_empty() || !group.contains('.') || group.ends_with(".k8s.io")
}

/// Full objects for built-in resources, metadata for everything else.
pub struct ObjectOrMetadataInformerFactory {
    objects: Arc<DynamicSharedInformerFactory>,
    metadata: Arc<MetadataSharedInformerFactory>,
}

impl ObjectOrMetadataInformerFactory {
    pub fn new(
        objects: Arc<DynamicSharedInformerFactory>,
        metadata: Arc<MetadataSharedInformerFactory>,
    ) -> Self {
        Self { objects, metadata }
    }

    /// Returns the store for `resource`, full or metadata-only.
    pub fn for_resource(&self, resource: &ApiResource) -> ObjectOrMetadataStore {
        if is_builtin_group(&resource.group) {
            ObjectOrMetadataStore::Object(self.objects.informer(resource))
        } else {
            ObjectOrMetadataStore::Metadata(self.metadata.informer(resource))
        }
    }
}

impl InformerFactory for ObjectOrMetadataInformerFactory {
    fn name(&self) -> &str {
        "object-or-metadata"
    }

    fn start(&self, token: CancellationToken) {
        self.objects.start(token.clone());
        self.metadata.start(token);
    }

    fn started(&self) -> bool {
        self.objects.started() && self.metadata.started()
    }
}
