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

//! Controller context - shared resources for all controllers.
//!
//! A context is built from scratch for every leadership epoch and is never
//! reused across epochs.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client_builder::{wait_for_apiserver, ControllerClientBuilder, APISERVER_HEALTH_TIMEOUT};
use crate::config::{CompletedConfig, ControllerManagerConfig};
use crate::controller_descriptor::ControllerEnablement;
use crate::discovery::{
    get_available_resources, spawn_reset_loop, AvailableResources, DeferredDiscoveryRestMapper,
    DiscoveryInterface, MemCacheDiscovery, REST_MAPPER_RESET_PERIOD,
};
use crate::error::Result;
use crate::events::{EventPublisher, NoopEventPublisher};
use crate::gate::Gate;
use crate::informer::{
    DynamicSharedInformerFactory, InformerFactory, MetadataSharedInformerFactory,
    ObjectOrMetadataInformerFactory, SharedInformerFactory,
};
use crate::wait;

/// Produces a fresh resync period on every call.
pub type ResyncPeriodFn = Arc<dyn Fn() -> Duration + Send + Sync>;

/// Returns a generator of periods in `[min, 2 * min)`.
///
/// Call it once per factory so independently built factories do not resync
/// in lockstep.
pub fn resync_period(min: Duration) -> ResyncPeriodFn {
    Arc::new(move || wait::jitter(min, 1.0))
}

/// Every informer factory of one context.
#[derive(Clone)]
pub struct InformerFactories {
    /// Built-in resources on the karmada control plane.
    pub karmada_kube: Arc<SharedInformerFactory>,
    /// Unstructured resources on the karmada control plane.
    pub karmada_dynamic: Arc<DynamicSharedInformerFactory>,
    /// Firefly resources stored in the karmada control plane.
    pub karmada_firefly: Arc<SharedInformerFactory>,
    /// Karmada's own resources.
    pub karmada: Arc<SharedInformerFactory>,
    /// Metadata-only informers on the karmada control plane.
    pub karmada_metadata: Arc<MetadataSharedInformerFactory>,
    /// Built-in resources on the host cluster.
    pub firefly_kube: Arc<SharedInformerFactory>,
    /// Unstructured resources on the host cluster.
    pub firefly_dynamic: Arc<DynamicSharedInformerFactory>,
    /// Firefly resources on the host cluster, limited to the estimator namespace.
    pub firefly: Arc<SharedInformerFactory>,
    /// Full objects for built-in kinds, metadata for the rest.
    pub object_or_metadata: Arc<ObjectOrMetadataInformerFactory>,
}

impl InformerFactories {
    /// Creates every factory. No request is made to either cluster.
    pub fn new(
        config: &ControllerManagerConfig,
        karmada: &dyn ControllerClientBuilder,
        host: &dyn ControllerClientBuilder,
        resync: &ResyncPeriodFn,
    ) -> Result<Self> {
        let karmada_kube = Arc::new(SharedInformerFactory::new(
            "karmada-kube",
            karmada.client("karmada-kube-shared-informers")?,
            resync(),
        ));
        let karmada_dynamic = Arc::new(DynamicSharedInformerFactory::new(
            "karmada-dynamic",
            karmada.dynamic_client("karmada-dynamic-shared-informers")?,
            resync(),
        ));
        let karmada_firefly = Arc::new(SharedInformerFactory::new(
            "karmada-firefly",
            karmada.client("karmada-firefly-shared-informers")?,
            resync(),
        ));
        let karmada_informers = Arc::new(SharedInformerFactory::new(
            "karmada",
            karmada.client("karmada-shared-informers")?,
            resync(),
        ));
        let karmada_metadata = Arc::new(MetadataSharedInformerFactory::new(
            "karmada-metadata",
            karmada.metadata_client("firefly-metadata-informers")?,
            resync(),
        ));

        let firefly_kube = Arc::new(SharedInformerFactory::new(
            "firefly-kube",
            host.client("firefly-kube-shared-informers")?,
            resync(),
        ));
        let firefly_dynamic = Arc::new(DynamicSharedInformerFactory::new(
            "firefly-dynamic",
            host.dynamic_client("firefly-dynamic-shared-informers")?,
            resync(),
        ));
        let firefly = Arc::new(SharedInformerFactory::new_filtered(
            "firefly",
            host.client("firefly-shared-informers")?,
            resync(),
            config.estimator_namespace.clone(),
        ));

        let object_or_metadata = Arc::new(ObjectOrMetadataInformerFactory::new(
            karmada_dynamic.clone(),
            karmada_metadata.clone(),
        ));

        Ok(Self {
            karmada_kube,
            karmada_dynamic,
            karmada_firefly,
            karmada: karmada_informers,
            karmada_metadata,
            firefly_kube,
            firefly_dynamic,
            firefly,
            object_or_metadata,
        })
    }

    /// Returns every factory in start order.
    pub fn all(&self) -> Vec<Arc<dyn InformerFactory>> {
        vec![
            self.karmada_dynamic.clone(),
            self.karmada_kube.clone(),
            self.karmada.clone(),
            self.karmada_firefly.clone(),
            self.firefly_dynamic.clone(),
            self.firefly_kube.clone(),
            self.firefly.clone(),
            self.object_or_metadata.clone(),
        ]
    }
}

/// Shared context for all controllers.
///
/// Cloning is cheap. Controllers copy out the builders, factories and stores
/// they need during initialization and drop the context afterwards.
#[derive(Clone)]
pub struct ControllerContext {
    /// Clients for the karmada control plane.
    pub karmada_client_builder: Arc<dyn ControllerClientBuilder>,

    /// Clients for the host cluster.
    pub host_client_builder: Arc<dyn ControllerClientBuilder>,

    /// Informer factories over both clusters.
    pub informers: InformerFactories,

    /// Configuration snapshot for this epoch.
    pub component_config: Arc<ControllerManagerConfig>,

    /// Namespace of the scheduler-estimator on the host cluster.
    pub estimator_namespace: String,

    /// Name of the firefly karmada object this manager serves.
    pub karmada_name: String,

    /// Kind to resource mapping over the karmada control plane.
    pub rest_mapper: Arc<DeferredDiscoveryRestMapper>,

    /// Resources served by the karmada control plane.
    pub available_resources: Arc<AvailableResources>,

    /// Resources served by the host cluster.
    pub host_available_resources: Arc<AvailableResources>,

    /// Closed once every controller is initialized and the factories are
    /// started.
    pub informers_started: Gate,

    /// Which controllers may run.
    pub enablement: ControllerEnablement,

    /// Resync period generator shared by the factories of this context.
    pub resync_period: ResyncPeriodFn,

    /// Events recorded on the karmada control plane.
    pub event_recorder: Arc<dyn EventPublisher>,
}

impl ControllerContext {
    /// Assembles a context from already discovered cluster state.
    pub fn new(
        config: &CompletedConfig,
        karmada_client_builder: Arc<dyn ControllerClientBuilder>,
        host_client_builder: Arc<dyn ControllerClientBuilder>,
        informers: InformerFactories,
        rest_mapper: Arc<DeferredDiscoveryRestMapper>,
        available_resources: AvailableResources,
        host_available_resources: AvailableResources,
    ) -> Self {
        let component_config = config.component_config.clone();
        Self {
            karmada_client_builder,
            host_client_builder,
            informers,
            estimator_namespace: component_config.estimator_namespace.clone(),
            karmada_name: component_config.karmada_name.clone(),
            resync_period: resync_period(component_config.generic.min_resync_period),
            component_config,
            rest_mapper,
            available_resources: Arc::new(available_resources),
            host_available_resources: Arc::new(host_available_resources),
            informers_started: Gate::new(),
            enablement: config.enablement.clone(),
            event_recorder: Arc::new(NoopEventPublisher),
        }
    }

    /// Replaces the event recorder, which drops events by default.
    pub fn with_event_recorder(mut self, event_recorder: Arc<dyn EventPublisher>) -> Self {
        self.event_recorder = event_recorder;
        self
    }

    /// Returns whether the named controller may run.
    pub fn is_controller_enabled(&self, name: &str) -> bool {
        self.enablement.is_enabled(name)
    }

    /// Draws a resync period.
    pub fn resync(&self) -> Duration {
        (self.resync_period)()
    }
}

/// Builds the context for one leadership epoch.
///
/// Factories are created first, each API server must answer healthy within
/// [`APISERVER_HEALTH_TIMEOUT`], then discovery runs. Any failure means no
/// context at all.
pub async fn create_controller_context(
    config: &CompletedConfig,
    karmada: Arc<dyn ControllerClientBuilder>,
    host: Arc<dyn ControllerClientBuilder>,
    stop: CancellationToken,
) -> Result<ControllerContext> {
    let resync = resync_period(config.component_config.generic.min_resync_period);
    let informers =
        InformerFactories::new(&config.component_config, karmada.as_ref(), host.as_ref(), &resync)?;

    wait_for_apiserver(
        &karmada.client("karmada-kube-shared-informers")?,
        APISERVER_HEALTH_TIMEOUT,
    )
    .await?;
    wait_for_apiserver(
        &host.client("firefly-kube-shared-informers")?,
        APISERVER_HEALTH_TIMEOUT,
    )
    .await?;

    let discovery: Arc<dyn DiscoveryInterface> =
        Arc::new(karmada.discovery_client("firefly-controller-discovery")?);
    let rest_mapper = Arc::new(DeferredDiscoveryRestMapper::new(Arc::new(
        MemCacheDiscovery::new(discovery),
    )));
    spawn_reset_loop(rest_mapper.clone(), REST_MAPPER_RESET_PERIOD, stop);

    let available = get_available_resources(&karmada.discovery_client("controller-discovery")?).await?;
    let host_available = get_available_resources(&host.discovery_client("controller-discovery")?).await?;

    tracing::debug!(
        karmada_resources = available.len(),
        host_resources = host_available.len(),
        "controller context ready"
    );

    Ok(ControllerContext::new(
        config,
        karmada,
        host,
        informers,
        rest_mapper,
        available,
        host_available,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resync_period_bounds() {
        let min = Duration::from_secs(60);
        let resync = resync_period(min);

        let mut periods = std::collections::HashSet::new();
        for _ in 0..100 {
            let period = resync();
            assert!(period >= min && period < min * 2);
            periods.insert(period);
        }

        // Should have gotten different values due to jitter
        assert!(periods.len() > 1);
    }
}
