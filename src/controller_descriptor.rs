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

//! Controller descriptor and registry.
//!
//! The registry is fixed by the controllers compiled into the binary;
//! whether a registered controller runs is decided separately by
//! [`ControllerEnablement`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::controller::InitFunc;
use crate::error::{Error, Result};

/// Descriptor for a controller.
///
/// # Example
///
/// ```ignore
/// let descriptor = ControllerDescriptor::builder("kubean")
///     .disabled_by_default()
///     .build(init_fn(start_kubean_controller));
/// ```
#[derive(Clone)]
pub struct ControllerDescriptor {
    /// Canonical name of the controller.
    name: String,

    /// Whether this controller only runs when named explicitly.
    disabled_by_default: bool,

    /// Initializer that starts the controller.
    init: InitFunc,
}

impl ControllerDescriptor {
    /// Creates a new builder for a controller descriptor.
    pub fn builder(name: impl Into<String>) -> Builder {
        Builder::new(name)
    }

    /// Returns the canonical name of this controller.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether this controller is disabled by default.
    pub fn is_disabled_by_default(&self) -> bool {
        self.disabled_by_default
    }

    /// Returns the initializer.
    pub fn init(&self) -> &InitFunc {
        &self.init
    }
}

impl fmt::Debug for ControllerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerDescriptor")
            .field("name", &self.name)
            .field("disabled_by_default", &self.disabled_by_default)
            .finish()
    }
}

/// Builder for creating [`ControllerDescriptor`] instances.
pub struct Builder {
    name: String,
    disabled_by_default: bool,
}

impl Builder {
    /// Creates a new builder with the given controller name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            disabled_by_default: false,
        }
    }

    /// Marks this controller as disabled by default.
    pub fn disabled_by_default(mut self) -> Self {
        self.disabled_by_default = true;
        self
    }

    /// Builds the descriptor with the given initializer.
    pub fn build(self, init: InitFunc) -> ControllerDescriptor {
        ControllerDescriptor {
            name: self.name,
            disabled_by_default: self.disabled_by_default,
            init,
        }
    }
}

/// Registry of all known controllers.
///
/// Iteration follows registration order. Controllers must still not depend
/// on each other's start order.
#[derive(Debug, Clone, Default)]
pub struct ControllerRegistry {
    controllers: Vec<ControllerDescriptor>,
    index: HashMap<String, usize>,
}

impl ControllerRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a controller descriptor.
    ///
    /// # Panics
    ///
    /// Panics if the name is empty or already registered.
    pub fn register(&mut self, descriptor: ControllerDescriptor) -> &mut Self {
        let name = descriptor.name();

        if name.is_empty() {
            panic!("controller name cannot be empty");
        }

        if self.index.contains_key(name) {
            panic!("controller {:?} is already registered", name);
        }

        self.index.insert(name.to_string(), self.controllers.len());
        self.controllers.push(descriptor);
        self
    }

    /// Returns the descriptor with the given name.
    pub fn get(&self, name: &str) -> Option<&ControllerDescriptor> {
        self.index.get(name).map(|&i| &self.controllers[i])
    }

    /// Returns all controller descriptors in registration order.
    pub fn controllers(&self) -> impl Iterator<Item = &ControllerDescriptor> {
        self.controllers.iter()
    }

    /// Returns all known controller names, sorted.
    pub fn known_controllers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.index.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns controllers that are disabled by default.
    pub fn disabled_by_default(&self) -> HashSet<String> {
        self.controllers
            .iter()
            .filter(|d| d.is_disabled_by_default())
            .map(|d| d.name().to_string())
            .collect()
    }

    /// Returns a registry holding only the controllers accepted by `keep`.
    pub fn filter(&self, mut keep: impl FnMut(&str) -> bool) -> ControllerRegistry {
        let mut filtered = ControllerRegistry::new();
        for descriptor in self.controllers.iter().filter(|d| keep(d.name())) {
            filtered.register(descriptor.clone());
        }
        filtered
    }

    /// Returns the number of registered controllers.
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    /// Returns true if no controller is registered.
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}

/// Decides which controllers run, from the user's list and the set of
/// controllers that are off unless named.
#[derive(Debug, Clone)]
pub struct ControllerEnablement {
    controllers: Vec<String>,
    disabled_by_default: Arc<HashSet<String>>,
}

impl ControllerEnablement {
    /// Creates a policy from the configured list and the default-disabled set.
    pub fn new(controllers: Vec<String>, disabled_by_default: HashSet<String>) -> Self {
        Self {
            controllers,
            disabled_by_default: Arc::new(disabled_by_default),
        }
    }

    /// Returns whether `name` should run.
    ///
    /// An explicit `name` or `-name` wins, scanning in order. Otherwise the
    /// controller runs only if `*` is present and it is not disabled by default.
    pub fn is_enabled(&self, name: &str) -> bool {
        let mut has_star = false;
        for ctrl in &self.controllers {
            if ctrl == name {
                return true;
            }
            if ctrl.strip_prefix('-') == Some(name) {
                return false;
            }
            if ctrl == "*" {
                has_star = true;
            }
        }
        has_star && !self.disabled_by_default.contains(name)
    }

    /// Returns the configured controller list.
    pub fn controllers(&self) -> &[String] {
        &self.controllers
    }

    /// Rejects entries that name a controller not in `known`.
    pub fn validate(&self, known: &[String]) -> Result<()> {
        for controller in &self.controllers {
            if controller == "*" {
                continue;
            }
            let name = controller.strip_prefix('-').unwrap_or(controller);
            if !known.iter().any(|k| k == name) {
                return Err(Error::InvalidConfig(format!(
                    "{:?} is not in the list of known controllers",
                    controller
                )));
            }
        }
        Ok(())
    }
}

impl Default for ControllerEnablement {
    fn default() -> Self {
        Self::new(vec!["*".to_string()], HashSet::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{init_fn, InitOutcome};

    fn descriptor(name: &str) -> ControllerDescriptor {
        ControllerDescriptor::builder(name)
            .build(init_fn(|_, _| async { Ok(InitOutcome::Skipped) }))
    }

    #[test]
    fn test_registry_basic() {
        let mut registry = ControllerRegistry::new();
        registry.register(descriptor("node"));
        registry.register(
            ControllerDescriptor::builder("kubean")
                .disabled_by_default()
                .build(init_fn(|_, _| async { Ok(InitOutcome::Skipped) })),
        );

        assert!(registry.get("node").is_some());
        assert!(registry.get("estimator").is_none());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.known_controllers(), vec!["kubean", "node"]);
        assert_eq!(
            registry.disabled_by_default(),
            HashSet::from(["kubean".to_string()])
        );
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_registry_duplicate_panics() {
        let mut registry = ControllerRegistry::new();
        registry.register(descriptor("node"));
        registry.register(descriptor("node"));
    }

    #[test]
    fn test_registry_keeps_registration_order() {
        let mut registry = ControllerRegistry::new();
        for name in ["foo", "estimator", "node", "kubean"] {
            registry.register(descriptor(name));
        }
        let names: Vec<&str> = registry.controllers().map(|d| d.name()).collect();
        assert_eq!(names, vec!["foo", "estimator", "node", "kubean"]);
    }

    #[test]
    fn test_registry_filter() {
        let mut registry = ControllerRegistry::new();
        for name in ["foo", "estimator", "node"] {
            registry.register(descriptor(name));
        }
        let filtered = registry.filter(|name| name != "estimator");
        let names: Vec<&str> = filtered.controllers().map(|d| d.name()).collect();
        assert_eq!(names, vec!["foo", "node"]);
        assert!(filtered.get("estimator").is_none());
    }

    #[test]
    fn test_enablement_patterns() {
        let disabled = HashSet::from(["kubean".to_string()]);
        let policy = |list: &[&str]| {
            ControllerEnablement::new(list.iter().map(|s| s.to_string()).collect(), disabled.clone())
        };

        let all = policy(&["*"]);
        assert!(all.is_enabled("node"));
        assert!(!all.is_enabled("kubean"));

        let explicit = policy(&["*", "kubean"]);
        assert!(explicit.is_enabled("kubean"));

        let negated = policy(&["*", "-node"]);
        assert!(!negated.is_enabled("node"));
        assert!(negated.is_enabled("foo"));

        let only = policy(&["node"]);
        assert!(only.is_enabled("node"));
        assert!(!only.is_enabled("foo"));

        // First match wins.
        let conflicting = policy(&["-node", "node"]);
        assert!(!conflicting.is_enabled("node"));

        assert!(!policy(&[]).is_enabled("node"));
    }

    #[test]
    fn test_enablement_validate() {
        let known = vec!["foo".to_string(), "node".to_string()];
        let policy = |list: &[&str]| {
            ControllerEnablement::new(list.iter().map(|s| s.to_string()).collect(), HashSet::new())
        };

        policy(&["*", "-foo", "node"]).validate(&known).unwrap();
        assert!(matches!(
            policy(&["*", "-bogus"]).validate(&known),
            Err(Error::InvalidConfig(_))
        ));
        assert!(policy(&["bogus"]).validate(&known).is_err());
    }
}
