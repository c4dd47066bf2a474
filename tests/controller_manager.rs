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

//! End-to-end tests of the controller manager core through its public API.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::{Request, StatusCode};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIResource, APIResourceList};
use kube::core::{GroupVersionKind, GroupVersionResource};

use firefly_karmada_manager::client_builder::{ControllerClientBuilder, SimpleClientBuilder};
use firefly_karmada_manager::controller_context::{resync_period, InformerFactories};
use firefly_karmada_manager::controller_manager::{start_controllers, CONFIGZ_NAME};
use firefly_karmada_manager::discovery::{
    get_available_resources, DeferredDiscoveryRestMapper, DiscoveryInterface, MemCacheDiscovery,
    ServerResources,
};
use firefly_karmada_manager::health::{FunctionHealthChecker, HealthChecker, HealthzHandler};
use firefly_karmada_manager::server::{BaseHandler, Configz, DebugMux, HttpHandler, HttpResponse};
use firefly_karmada_manager::{
    init_fn, CompletedConfig, ControllerContext, ControllerDescriptor, ControllerManagerConfig,
    ControllerRegistry, Error, InitOutcome,
};

const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: local
  cluster:
    server: http://127.0.0.1:1
contexts:
- name: local
  context:
    cluster: local
    user: admin
current-context: local
users:
- name: admin
  user:
    token: test-token
"#;

fn registry(names: &[(&'static str, bool)]) -> ControllerRegistry {
    let mut registry = ControllerRegistry::new();
    for &(name, disabled_by_default) in names {
        let mut builder = ControllerDescriptor::builder(name);
        if disabled_by_default {
            builder = builder.disabled_by_default();
        }
        registry.register(builder.build(init_fn(|_, _| async { Ok(InitOutcome::Started(None)) })));
    }
    registry
}

async fn completed(controllers: &[&str], registry: &ControllerRegistry) -> Result<CompletedConfig, Error> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kubeconfig");
    std::fs::write(&path, KUBECONFIG).unwrap();

    let mut config = ControllerManagerConfig::default();
    config.generic.controllers = controllers.iter().map(|s| s.to_string()).collect();
    config.generic.controller_start_interval = Duration::from_millis(1);
    config.clusters.karmada_kubeconfig = Some(path.clone());
    config.clusters.host_kubeconfig = Some(path);
    config.complete(registry).await
}

fn context(config: &CompletedConfig, discovery: Arc<dyn DiscoveryInterface>) -> ControllerContext {
    let karmada: Arc<dyn ControllerClientBuilder> =
        Arc::new(SimpleClientBuilder::new(config.karmada_kubeconfig.clone()));
    let host: Arc<dyn ControllerClientBuilder> =
        Arc::new(SimpleClientBuilder::new(config.host_kubeconfig.clone()));
    let resync = resync_period(config.component_config.generic.min_resync_period);
    let informers =
        InformerFactories::new(&config.component_config, karmada.as_ref(), host.as_ref(), &resync).unwrap();
    let mapper = Arc::new(DeferredDiscoveryRestMapper::new(Arc::new(MemCacheDiscovery::new(discovery))));
    ControllerContext::new(
        config,
        karmada,
        host,
        informers,
        mapper,
        Default::default(),
        Default::default(),
    )
}

fn resource_list(group_version: &str, resources: &[(&str, &str)]) -> APIResourceList {
    APIResourceList {
        group_version: group_version.to_string(),
        resources: resources
            .iter()
            .map(|(name, kind)| APIResource {
                name: name.to_string(),
                kind: kind.to_string(),
                namespaced: true,
                ..Default::default()
            })
            .collect(),
    }
}

/// Discovery whose answer can change between calls, like a server on which
/// a CRD gets installed.
#[derive(Default)]
struct MutableDiscovery {
    server: Mutex<ServerResources>,
}

impl MutableDiscovery {
    fn set(&self, lists: Vec<APIResourceList>) {
        self.server.lock().unwrap().resources = lists;
    }
}

#[async_trait]
impl DiscoveryInterface for MutableDiscovery {
    async fn server_groups_and_resources(&self) -> firefly_karmada_manager::Result<ServerResources> {
        Ok(self.server.lock().unwrap().clone())
    }
}

async fn body(response: HttpResponse) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn get(path: &str) -> Request<Bytes> {
    Request::get(path).body(Bytes::new()).unwrap()
}

#[tokio::test]
async fn test_complete_config_applies_default_disabled() {
    let registry = registry(&[("estimator", false), ("kubean", true), ("node", false)]);

    let config = completed(&["*", "-node"], &registry).await.unwrap();
    assert!(config.enablement.is_enabled("estimator"));
    assert!(!config.enablement.is_enabled("kubean"));
    assert!(!config.enablement.is_enabled("node"));

    let config = completed(&["*", "kubean"], &registry).await.unwrap();
    assert!(config.enablement.is_enabled("kubean"));
}

#[tokio::test]
async fn test_complete_config_rejects_unknown_controller() {
    let registry = registry(&[("estimator", false)]);
    let err = completed(&["*", "-bogus"], &registry).await.err().unwrap();
    assert!(matches!(err, Error::InvalidConfig(_)));
    assert!(!err.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn test_only_enabled_controllers_get_health_checks() {
    let registry = registry(&[("a", false), ("b", false)]);
    let config = completed(&["*", "-b"], &registry).await.unwrap();
    let ctx = context(&config, Arc::new(MutableDiscovery::default()));

    let healthz = HealthzHandler::new();
    start_controllers(&Default::default(), &ctx, &registry, &DebugMux::new(), &healthz)
        .await
        .unwrap();

    assert_eq!(healthz.names().await, vec!["a".to_string()]);
}

#[tokio::test]
async fn test_rest_mapper_picks_up_new_resources() {
    let discovery = Arc::new(MutableDiscovery::default());
    discovery.set(vec![resource_list("v1", &[("pods", "Pod")])]);
    let mapper = DeferredDiscoveryRestMapper::new(Arc::new(MemCacheDiscovery::new(discovery.clone())));

    let pods = mapper
        .rest_mapping(&GroupVersionKind::gvk("", "v1", "Pod"))
        .await
        .unwrap();
    assert_eq!(pods.resource, GroupVersionResource::gvr("", "v1", "pods"));

    discovery.set(vec![
        resource_list("v1", &[("pods", "Pod")]),
        resource_list("cluster.karmada.io/v1alpha1", &[("clusters", "Cluster")]),
    ]);
    let cluster = mapper
        .rest_mapping(&GroupVersionKind::gvk("cluster.karmada.io", "v1alpha1", "Cluster"))
        .await
        .unwrap();
    assert_eq!(cluster.api_resource().plural, "clusters");

    let missing = mapper
        .rest_mapping(&GroupVersionKind::gvk("batch", "v1", "Job"))
        .await;
    assert!(matches!(missing, Err(Error::NoMapping(_))));
}

#[tokio::test]
async fn test_available_resources_tolerates_partial_failure() {
    let discovery = MutableDiscovery::default();
    {
        let mut server = discovery.server.lock().unwrap();
        server.resources = vec![resource_list("apps/v1", &[("deployments", "Deployment")])];
        server.failed = BTreeMap::from([("metrics.k8s.io/v1beta1".to_string(), "503".to_string())]);
    }

    let available = get_available_resources(&discovery).await.unwrap();
    assert_eq!(available.len(), 1);

    discovery.set(Vec::new());
    assert!(matches!(
        get_available_resources(&discovery).await,
        Err(Error::NoResources)
    ));
}

#[tokio::test]
async fn test_base_handler_endpoints() {
    let healthz = HealthzHandler::new();
    let configz = Configz::new();
    configz
        .register(CONFIGZ_NAME, &ControllerManagerConfig::default())
        .await
        .unwrap();
    assert!(configz
        .register(CONFIGZ_NAME, &ControllerManagerConfig::default())
        .await
        .is_err());

    let handler = BaseHandler::new(healthz.clone(), configz, DebugMux::new());

    let resp = handler.handle(get("/healthz")).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let node: Arc<dyn HealthChecker> = Arc::new(FunctionHealthChecker::new("node", || async {
        Err::<(), _>(anyhow::anyhow!("informer not synced"))
    }));
    healthz.add_health_checkers(vec![node]).await;

    let resp = handler.handle(get("/healthz")).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body(resp).await.contains("[-]node failed"));

    let resp = handler.handle(get("/healthz/node")).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let resp = handler.handle(get("/configz")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body(resp).await).unwrap();
    assert_eq!(
        json["fireflycontrollermanager.config.firefly.io"]["estimatorNamespace"],
        "firefly-system"
    );

    let resp = handler.handle(get("/debug/controllers/unknown")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
