//! Committed usage summaries per provider or per project.

use std::collections::{BTreeMap, BTreeSet};

use quarry_state::Graph;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum UsageScope {
    Provider {
        provider_id: String,
    },
    /// Every consumer owned by the project, optionally narrowed to one user.
    Project {
        project_id: String,
        #[serde(default)]
        user_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub scope: UsageScope,
    /// Set for provider scope only.
    pub provider_generation: Option<u64>,
    /// Used amount per resource class. Classes with no usage are omitted.
    pub usages: BTreeMap<String, u64>,
    pub consumer_count: usize,
}

pub fn compute_usage(graph: &Graph<'_>, scope: &UsageScope) -> EngineResult<UsageSummary> {
    let mut usages: BTreeMap<String, u64> = BTreeMap::new();
    let (provider_generation, consumer_count) = match scope {
        UsageScope::Provider { provider_id } => {
            let provider = graph.require_provider(provider_id)?;
            let mut consumers = BTreeSet::new();
            for alloc in graph.provider_allocations(provider_id)? {
                *usages.entry(alloc.resource_class).or_insert(0) += alloc.used;
                consumers.insert(alloc.consumer_id);
            }
            (Some(provider.generation), consumers.len())
        }
        UsageScope::Project {
            project_id,
            user_id,
        } => {
            let mut count = 0;
            for consumer_id in graph.project_consumers(project_id)? {
                let Some(consumer) = graph.consumer(&consumer_id)? else {
                    continue;
                };
                if user_id
                    .as_ref()
                    .is_some_and(|user| consumer.user_id.as_ref() != Some(user))
                {
                    continue;
                }
                count += 1;
                for alloc in graph.consumer_allocations(&consumer_id)? {
                    *usages.entry(alloc.resource_class).or_insert(0) += alloc.used;
                }
            }
            (None, count)
        }
    };
    usages.retain(|_, used| *used > 0);
    Ok(UsageSummary {
        scope: scope.clone(),
        provider_generation,
        usages,
        consumer_count,
    })
}
