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

//! Core controller traits and types.
//!
//! A controller is started by its [`InitFunc`]. The initializer spawns the
//! controller's own workers and hands back an optional [`Controller`] handle
//! through which the manager discovers what the controller can expose.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

// Re-export cancellation token for use in controller initializers
pub use tokio_util::sync::CancellationToken;

use crate::controller_context::ControllerContext;
use crate::health::HealthChecker;
use crate::server::DebugHandler;

/// Errors that can occur when initializing a controller.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("controller {name} failed to start: {source}")]
    StartFailed {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("controller {0} is disabled")]
    Disabled(String),

    #[error("resource {resource} required by controller {name} is not served")]
    MissingResource { name: String, resource: String },

    #[error("invalid configuration for controller {name}: {reason}")]
    InvalidConfig { name: String, reason: String },
}

impl From<anyhow::Error> for ControllerError {
    fn from(err: anyhow::Error) -> Self {
        ControllerError::StartFailed {
            name: "unknown".to_string(),
            source: err.into(),
        }
    }
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Boxed future returned by controller initializers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A handle to a running controller.
///
/// Both capabilities are optional. A controller without a health checker is
/// covered by a ping check registered under its name.
pub trait Controller: Send + Sync + 'static {
    /// Returns the canonical name of this controller.
    fn name(&self) -> &str;

    /// Handler mounted under `/debug/controllers/<name>`.
    fn debugging_handler(&self) -> Option<DebugHandler> {
        None
    }

    /// Liveness probe registered under the controller's name.
    fn health_checker(&self) -> Option<Arc<dyn HealthChecker>> {
        None
    }
}

/// What an initializer reports back to the supervisor.
pub enum InitOutcome {
    /// The controller is running. The handle may be absent for controllers
    /// that expose nothing beyond their work.
    Started(Option<Arc<dyn Controller>>),

    /// The controller chose not to run, e.g. because an optional API is not
    /// served. This is not a failure.
    Skipped,
}

impl fmt::Debug for InitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitOutcome::Started(Some(ctrl)) => {
                f.debug_tuple("Started").field(&ctrl.name()).finish()
            }
            InitOutcome::Started(None) => f.write_str("Started(anonymous)"),
            InitOutcome::Skipped => f.write_str("Skipped"),
        }
    }
}

/// Launches a particular controller.
///
/// The initializer receives the leadership epoch's cancellation token and a
/// context it must not retain: controllers copy out the builders, factories
/// and stores they need. Any error is fatal to the whole process.
pub type InitFunc = Arc<
    dyn Fn(CancellationToken, ControllerContext) -> BoxFuture<'static, Result<InitOutcome>>
        + Send
        + Sync,
>;

/// Wraps an async function into an [`InitFunc`].
pub fn init_fn<F, Fut>(f: F) -> InitFunc
where
    F: Fn(CancellationToken, ControllerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<InitOutcome>> + Send + 'static,
{
    Arc::new(move |token, ctx| Box::pin(f(token, ctx)))
}

/// A controller handle that only carries a name.
#[derive(Debug, Clone)]
pub struct NamedController {
    name: String,
}

impl NamedController {
    /// Creates a new named handle.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Controller for NamedController {
    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_controller_has_no_capabilities() {
        let controller = NamedController::new("test");
        assert_eq!(controller.name(), "test");
        assert!(controller.debugging_handler().is_none());
        assert!(controller.health_checker().is_none());
    }

    #[test]
    fn test_init_outcome_debug() {
        let started = InitOutcome::Started(Some(Arc::new(NamedController::new("node"))));
        assert_eq!(format!("{:?}", started), "Started(\"node\")");
        assert_eq!(format!("{:?}", InitOutcome::Started(None)), "Started(anonymous)");
        assert_eq!(format!("{:?}", InitOutcome::Skipped), "Skipped");
    }
}
