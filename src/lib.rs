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

//! firefly-karmada-manager - controller manager core for firefly on karmada.
//!
//! This library provides the plumbing that runs a set of controllers against
//! a karmada control plane and the host cluster beneath it:
//! - Client builders and API server readiness checks for both clusters
//! - Resource discovery and a lazily built REST mapper
//! - Shared informer factories
//! - The controller registry and the sequential start supervisor
//! - Health, configz and debug endpoints
//! - Event recording on the karmada control plane
//! - Leader election, including two-lock leader migration

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

pub mod client_builder;
pub mod config;
pub mod controller;
pub mod controller_context;
pub mod controller_descriptor;
pub mod controller_manager;
pub mod discovery;
pub mod error;
pub mod events;
pub mod gate;
pub mod health;
pub mod informer;
pub mod leader_election;
pub mod leader_migration;
pub mod server;
pub mod wait;

// Re-export commonly used types
pub use config::{CompletedConfig, ControllerManagerConfig};
pub use controller::{init_fn, Controller, ControllerError, InitFunc, InitOutcome};
pub use controller_context::ControllerContext;
pub use controller_descriptor::{ControllerDescriptor, ControllerRegistry};
pub use controller_manager::ControllerManager;
pub use error::{Error, Result};
pub use gate::Gate;

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the controller manager, used in user agents and lock names.
pub const CONTROLLER_MANAGER_NAME: &str = "firefly-karmada-manager";
