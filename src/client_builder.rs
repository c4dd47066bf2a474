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

//! Client builders.
//!
//! Each controller talks to the API servers under its own user agent. A
//! builder is scoped to one cluster and hands out clients per user agent,
//! building each at most once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use http::header::USER_AGENT;
use http::HeaderValue;
use kube::Client;

use crate::discovery::KubeDiscovery;
use crate::error::{Error, Result};

/// How long to wait for an API server to report healthy at startup.
pub const APISERVER_HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

const APISERVER_HEALTH_POLL: Duration = Duration::from_secs(1);

/// Produces clients for one cluster.
///
/// A single `kube::Client` speaks typed, dynamic and metadata-only requests,
/// so the client-shaped accessors differ only in intent. They are kept apart
/// to record which API shape a controller consumes.
pub trait ControllerClientBuilder: Send + Sync + 'static {
    /// Connection settings stamped with `user_agent`.
    fn config(&self, user_agent: &str) -> Result<kube::Config>;

    /// Client for typed resources.
    fn client(&self, user_agent: &str) -> Result<Client>;

    /// Client for `DynamicObject` access.
    fn dynamic_client(&self, user_agent: &str) -> Result<Client> {
        self.client(user_agent)
    }

    /// Client for `PartialObjectMeta` access.
    fn metadata_client(&self, user_agent: &str) -> Result<Client> {
        self.client(user_agent)
    }

    /// Discovery over this cluster.
    fn discovery_client(&self, user_agent: &str) -> Result<KubeDiscovery> {
        Ok(KubeDiscovery::new(self.client(user_agent)?))
    }
}

/// Builds clients from one shared connection config.
pub struct SimpleClientBuilder {
    config: kube::Config,
    clients: Mutex<HashMap<String, Client>>,
}

impl SimpleClientBuilder {
    pub fn new(config: kube::Config) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl ControllerClientBuilder for SimpleClientBuilder {
    fn config(&self, user_agent: &str) -> Result<kube::Config> {
        let value = HeaderValue::from_str(&format!(
            "{}/{} ({})",
            crate::CONTROLLER_MANAGER_NAME,
            crate::VERSION,
            user_agent
        ))
        .map_err(|err| Error::ClientBuild {
            user_agent: user_agent.to_string(),
            reason: err.to_string(),
        })?;

        let mut config = self.config.clone();
        config.headers.retain(|(name, _)| *name != USER_AGENT);
        config.headers.push((USER_AGENT, value));
        Ok(config)
    }

    fn client(&self, user_agent: &str) -> Result<Client> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(user_agent) {
            return Ok(client.clone());
        }

        let client = Client::try_from(self.config(user_agent)?).map_err(|err| Error::ClientBuild {
            user_agent: user_agent.to_string(),
            reason: err.to_string(),
        })?;
        tracing::debug!(user_agent, "built client");
        clients.insert(user_agent.to_string(), client.clone());
        Ok(client)
    }
}

/// Creates the karmada and host cluster builders.
pub fn create_client_builders(
    karmada: kube::Config,
    host: kube::Config,
) -> (Arc<dyn ControllerClientBuilder>, Arc<dyn ControllerClientBuilder>) {
    (
        Arc::new(SimpleClientBuilder::new(karmada)),
        Arc::new(SimpleClientBuilder::new(host)),
    )
}

/// Polls `/healthz` until the server answers `ok` or `timeout` elapses.
pub async fn wait_for_apiserver(client: &Client, timeout: Duration) -> Result<()> {
    let mut last_error = String::from("no response");

    let poll = async {
        loop {
            match probe(client).await {
                Ok(()) => return,
                Err(err) => {
                    tracing::debug!(error = %err, "apiserver not healthy yet");
                    last_error = err;
                }
            }
            tokio::time::sleep(APISERVER_HEALTH_POLL).await;
        }
    };

    if tokio::time::timeout(timeout, poll).await.is_err() {
        return Err(Error::ApiServerNotHealthy { timeout, last_error });
    }
    Ok(())
}

async fn probe(client: &Client) -> std::result::Result<(), String> {
    let request = http::Request::get("/healthz")
        .body(Vec::new())
        .map_err(|err| err.to_string())?;
    let body = client.request_text(request).await.map_err(|err| err.to_string())?;
    if body.trim() == "ok" {
        Ok(())
    } else {
        Err(format!("healthz returned {body:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> kube::Config {
        kube::Config::new("http://127.0.0.1:1".parse().unwrap())
    }

    #[test]
    fn test_config_sets_user_agent() {
        let builder = SimpleClientBuilder::new(local_config());
        let config = builder.config("node-controller").unwrap();

        let agents: Vec<_> = config
            .headers
            .iter()
            .filter(|(name, _)| *name == USER_AGENT)
            .map(|(_, value)| value.to_str().unwrap().to_string())
            .collect();
        assert_eq!(agents.len(), 1);
        assert!(agents[0].ends_with("(node-controller)"));
    }

    #[test]
    fn test_config_rejects_invalid_user_agent() {
        let builder = SimpleClientBuilder::new(local_config());
        assert!(matches!(
            builder.config("bad\nagent"),
            Err(Error::ClientBuild { .. })
        ));
    }

    #[tokio::test]
    async fn test_clients_are_cached_per_user_agent() {
        let builder = SimpleClientBuilder::new(local_config());
        builder.client("a").unwrap();
        builder.client("a").unwrap();
        builder.client("b").unwrap();
        assert_eq!(builder.clients.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_wait_for_apiserver_times_out() {
        let builder = SimpleClientBuilder::new(local_config());
        let client = builder.client("probe").unwrap();

        let err = wait_for_apiserver(&client, Duration::from_millis(1500))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ApiServerNotHealthy { .. }));
    }
}
