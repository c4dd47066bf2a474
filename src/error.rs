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

//! Error types for the controller manager core.

use std::time::Duration;

use thiserror::Error;

use crate::controller::ControllerError;

/// Errors produced by the controller manager core.
///
/// Anything that escapes [`crate::ControllerManager::run`] terminates the
/// process; [`Error::is_fatal`] tells apart the conditions that can only show
/// up once the manager is running from plain configuration mistakes.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to load kubeconfig {path}: {source}")]
    Kubeconfig {
        path: String,
        #[source]
        source: kube::config::KubeconfigError,
    },

    #[error("failed to infer cluster configuration: {0}")]
    InferConfig(#[source] kube::config::InferConfigError),

    #[error("failed to build client for {user_agent:?}: {reason}")]
    ClientBuild { user_agent: String, reason: String },

    #[error("failed to wait for apiserver being healthy after {timeout:?}: {last_error}")]
    ApiServerNotHealthy { timeout: Duration, last_error: String },

    #[error("unable to get any supported resources from server")]
    NoResources,

    #[error("unable to discover server resources: {0}")]
    Discovery(String),

    #[error("unable to parse group version {0:?}")]
    GroupVersion(String),

    #[error("no resource mapping for {0}")]
    NoMapping(String),

    #[error("error starting {name:?}: {source}")]
    ControllerInit {
        name: String,
        #[source]
        source: ControllerError,
    },

    #[error("error creating lock: {0}")]
    LockCreation(String),

    #[error("unable to resolve hostname: {0}")]
    Hostname(String),

    #[error("leaderelection lost for lock {0}")]
    LeadershipLost(String),

    #[error("failed to serve on {addr}: {source}")]
    Serve {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

impl Error {
    /// Returns true for errors that only arise at runtime and must terminate
    /// the process rather than be reported as a usage problem.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::InvalidConfig(_))
    }
}

/// Result type for controller manager operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
