//! JSON inventory fixtures for `quarryd load`.
//!
//! ```json
//! {
//!   "traits": ["CUSTOM_GOLD"],
//!   "aggregates": [{"id": "agg-az1", "availability_zone": "az1"}],
//!   "providers": [
//!     {"id": "cn1", "name": "compute-1",
//!      "inventories": {"VCPU": {"total": 16}},
//!      "traits": ["CUSTOM_GOLD"], "aggregates": ["agg-az1"]}
//!   ]
//! }
//! ```
//!
//! Providers are created in file order, so parents must precede children.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Context;
use quarry_placement::{AllocationItem, AllocationWrite, ConsumerOwner, Engine, NewProvider};
use quarry_state::{Aggregate, InventoryRecord, ServerGroup};
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub traits: Vec<String>,
    pub resource_classes: Vec<String>,
    pub aggregates: Vec<Aggregate>,
    pub providers: Vec<ProviderFixture>,
    pub server_groups: Vec<ServerGroup>,
    pub consumers: Vec<ConsumerFixture>,
}

#[derive(Debug, Deserialize)]
pub struct ProviderFixture {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub inventories: BTreeMap<String, InventoryRecord>,
    #[serde(default)]
    pub traits: BTreeSet<String>,
    #[serde(default)]
    pub aggregates: BTreeSet<String>,
    /// Classes lent to aggregate peers.
    #[serde(default)]
    pub shares: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConsumerFixture {
    pub id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub server_group: Option<String>,
    pub allocations: Vec<AllocationItem>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub providers: usize,
    pub consumers: usize,
}

impl Fixture {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing fixture {}", path.display()))
    }

    /// Apply the fixture through the engine's regular write paths.
    pub fn apply(&self, engine: &Engine) -> anyhow::Result<LoadReport> {
        for name in &self.traits {
            engine
                .create_trait(name)
                .with_context(|| format!("creating trait {name}"))?;
        }
        for name in &self.resource_classes {
            engine
                .create_resource_class(name)
                .with_context(|| format!("creating resource class {name}"))?;
        }
        for aggregate in &self.aggregates {
            engine
                .put_aggregate(aggregate.clone())
                .with_context(|| format!("storing aggregate {}", aggregate.id))?;
        }

        for provider in &self.providers {
            let created = engine
                .create_provider(NewProvider {
                    id: Some(provider.id.clone()),
                    name: provider.name.clone().unwrap_or_else(|| provider.id.clone()),
                    parent_id: provider.parent_id.clone(),
                })
                .with_context(|| format!("creating provider {}", provider.id))?;
            let mut generation = created.generation;
            if !provider.inventories.is_empty() {
                generation = engine
                    .set_inventory(&provider.id, generation, provider.inventories.clone())
                    .with_context(|| format!("setting inventory of {}", provider.id))?;
            }
            if !provider.traits.is_empty() {
                generation = engine
                    .set_traits(&provider.id, generation, provider.traits.clone())
                    .with_context(|| format!("setting traits of {}", provider.id))?;
            }
            if !provider.aggregates.is_empty() {
                generation = engine
                    .set_aggregates(&provider.id, generation, provider.aggregates.clone())
                    .with_context(|| format!("setting aggregates of {}", provider.id))?;
            }
            if !provider.shares.is_empty() {
                engine
                    .set_sharing(&provider.id, generation, provider.shares.clone())
                    .with_context(|| format!("setting shared classes of {}", provider.id))?;
            }
            debug!(provider = %provider.id, "provider loaded");
        }

        for group in &self.server_groups {
            engine
                .create_server_group(group.clone())
                .with_context(|| format!("creating server group {}", group.id))?;
        }

        for consumer in &self.consumers {
            let owner = (consumer.project_id.is_some() || consumer.user_id.is_some()).then(|| {
                ConsumerOwner {
                    project_id: consumer.project_id.clone(),
                    user_id: consumer.user_id.clone(),
                }
            });
            let expected = engine.get_allocations(&consumer.id)?.generation;
            engine
                .replace_allocations(
                    &consumer.id,
                    expected,
                    AllocationWrite {
                        allocations: consumer.allocations.clone(),
                        owner,
                        provider_expectations: BTreeMap::new(),
                    },
                )
                .with_context(|| format!("allocating consumer {}", consumer.id))?;
            if let Some(group_id) = &consumer.server_group {
                engine
                    .add_group_member(group_id, &consumer.id)
                    .with_context(|| format!("adding {} to server group {group_id}", consumer.id))?;
            }
        }

        let report = LoadReport {
            providers: self.providers.len(),
            consumers: self.consumers.len(),
        };
        info!(
            providers = report.providers,
            consumers = report.consumers,
            "fixture loaded"
        );
        Ok(report)
    }
}
