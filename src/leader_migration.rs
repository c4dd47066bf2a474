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

//! Leader migration.
//!
//! While controllers move between components, two locks are held. The main
//! lock runs every controller that is not migrating. The migration lock runs
//! the migrating ones and is only attempted once the main lock's controllers
//! are up, signalled through [`LeaderMigrator::migration_ready`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::{GenericControllerManagerConfig, LeaderMigrationConfiguration};
use crate::controller_descriptor::ControllerRegistry;
use crate::gate::Gate;

/// Where a controller runs during migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterResult {
    /// Runs under the migration lock.
    Migrated,
    /// Runs under the main lock.
    NonMigrated,
    /// Owned by another component; runs under neither lock here.
    Unowned,
}

/// Classifies a controller by name.
pub type FilterFunc = Arc<dyn Fn(&str) -> FilterResult + Send + Sync>;

/// Migration state of one controller manager process.
#[derive(Clone)]
pub struct LeaderMigrator {
    /// Controller classification.
    pub filter: FilterFunc,

    /// Closed once the main lock's controllers and informers are started.
    pub migration_ready: Gate,
}

impl fmt::Debug for LeaderMigrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderMigrator")
            .field("migration_ready", &self.migration_ready)
            .finish_non_exhaustive()
    }
}

impl LeaderMigrator {
    /// Creates a migrator for `component` using the configured controller leaders.
    pub fn new(config: &LeaderMigrationConfiguration, component: &str) -> Self {
        Self::with_filter(default_filter(config, component))
    }

    /// Creates a migrator with a caller supplied classification.
    pub fn with_filter(filter: FilterFunc) -> Self {
        Self {
            filter,
            migration_ready: Gate::new(),
        }
    }

    /// Classifies `name`.
    pub fn classify(&self, name: &str) -> FilterResult {
        (self.filter)(name)
    }

    /// Returns the controllers of `registry` classified as `result`.
    pub fn filter_registry(&self, registry: &ControllerRegistry, result: FilterResult) -> ControllerRegistry {
        registry.filter(|name| self.classify(name) == result)
    }
}

/// Listed for this component or `*`: migrated. Listed for another
/// component: unowned. Not listed: non-migrated.
pub fn default_filter(config: &LeaderMigrationConfiguration, component: &str) -> FilterFunc {
    let leaders: HashMap<String, FilterResult> = config
        .controller_leaders
        .iter()
        .map(|leader| {
            let result = if leader.component == "*" || leader.component == component {
                FilterResult::Migrated
            } else {
                FilterResult::Unowned
            };
            (leader.name.clone(), result)
        })
        .collect();

    Arc::new(move |name| leaders.get(name).copied().unwrap_or(FilterResult::NonMigrated))
}

/// Whether leader migration is in effect. It requires leader election.
pub fn enabled(generic: &GenericControllerManagerConfig) -> bool {
    generic.leader_election.leader_elect && generic.leader_migration_enabled
}
