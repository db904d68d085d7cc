//! Soft-preference scoring of feasible candidates.
//!
//! Each [`Weigher`] produces a raw score per candidate. Raw scores are
//! min-max normalized per weigher across the candidate set (all-equal
//! becomes 0), multiplied by the weigher's multiplier and summed. Ranking
//! is by descending total with ties broken by ascending root id.

use std::collections::BTreeMap;

use quarry_core::config::WeigherConfig;
use quarry_core::naming::is_device_class;
use quarry_state::{Graph, GroupPolicy};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capacity::{UsageOverlay, effective_usage, headroom};
use crate::error::{EngineError, EngineResult};
use crate::request::AllocationRequest;
use crate::resolver::Candidate;

/// Caller-supplied signals that are not part of the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionContext {
    /// Recent placement failures per root provider.
    #[serde(default)]
    pub recent_failures: BTreeMap<String, u32>,
}

pub struct ScoringContext<'a> {
    pub graph: Graph<'a>,
    pub request: &'a AllocationRequest,
    pub overlay: &'a UsageOverlay,
    pub selection: &'a SelectionContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedCandidate {
    pub candidate: Candidate,
    pub score: f64,
    /// Weighted, normalized contribution of each weigher.
    pub breakdown: BTreeMap<String, f64>,
}

pub trait Weigher: Send + Sync {
    fn name(&self) -> &'static str;

    fn allows_negative_multiplier(&self) -> bool {
        true
    }

    fn raw_score(&self, candidate: &Candidate, ctx: &ScoringContext<'_>) -> EngineResult<f64>;
}

// ── Built-in weighers ──────────────────────────────────────────────

/// Prefers candidates that leave more of each touched inventory free.
pub struct ResourceBalance;

impl Weigher for ResourceBalance {
    fn name(&self) -> &'static str {
        "resource_balance"
    }

    fn raw_score(&self, candidate: &Candidate, ctx: &ScoringContext<'_>) -> EngineResult<f64> {
        let items = candidate.allocation_items();
        if items.is_empty() {
            return Ok(0.0);
        }
        let mut total = 0.0;
        for item in &items {
            let Some(inventory) = ctx.graph.inventory(&item.provider_id, &item.resource_class)?
            else {
                continue;
            };
            let capacity = inventory.capacity();
            if capacity == 0 {
                continue;
            }
            let used = effective_usage(
                ctx.graph.usage(&item.provider_id, &item.resource_class)?,
                ctx.overlay.get(&item.provider_id, &item.resource_class),
            );
            let after = capacity.saturating_sub(used.saturating_add(item.amount));
            total += after as f64 / capacity as f64;
        }
        Ok(total / items.len() as f64)
    }
}

/// Signed per-trait weights over the root and every picked provider.
pub struct TraitPreference {
    weights: BTreeMap<String, f64>,
}

impl TraitPreference {
    pub fn new(weights: BTreeMap<String, f64>) -> Self {
        Self { weights }
    }
}

impl Weigher for TraitPreference {
    fn name(&self) -> &'static str {
        "trait_preference"
    }

    fn raw_score(&self, candidate: &Candidate, ctx: &ScoringContext<'_>) -> EngineResult<f64> {
        let mut present = ctx.graph.traits(&candidate.root_id)?;
        for provider_id in candidate.providers() {
            present.extend(ctx.graph.traits(provider_id)?);
        }
        Ok(self
            .weights
            .iter()
            .filter(|(name, _)| present.contains(*name))
            .map(|(_, weight)| weight)
            .sum())
    }
}

/// Member count of the request's soft-policy server group on the host,
/// positive for soft affinity and negative for soft anti-affinity.
pub struct ServerGroupSoftAffinity;

impl Weigher for ServerGroupSoftAffinity {
    fn name(&self) -> &'static str {
        "server_group_soft_affinity"
    }

    fn raw_score(&self, candidate: &Candidate, ctx: &ScoringContext<'_>) -> EngineResult<f64> {
        let Some(placement) = &ctx.request.server_group else {
            return Ok(0.0);
        };
        let Some(group) = ctx.graph.server_group(&placement.group_id)? else {
            return Ok(0.0);
        };
        let sign = match group.policy {
            GroupPolicy::SoftAffinity => 1.0,
            GroupPolicy::SoftAntiAffinity => -1.0,
            GroupPolicy::Affinity | GroupPolicy::AntiAffinity => return Ok(0.0),
        };
        let members = ctx
            .graph
            .group_members(&group.id)?
            .into_iter()
            .filter(|m| m.consumer_id != placement.consumer_id)
            .filter(|m| m.host.as_deref() == Some(candidate.root_id.as_str()))
            .count();
        Ok(sign * members as f64)
    }
}

/// Penalizes roots with recent placement failures.
pub struct FailureRecency;

impl Weigher for FailureRecency {
    fn name(&self) -> &'static str {
        "failure_recency"
    }

    fn raw_score(&self, candidate: &Candidate, ctx: &ScoringContext<'_>) -> EngineResult<f64> {
        let failures = ctx
            .selection
            .recent_failures
            .get(&candidate.root_id)
            .copied()
            .unwrap_or(0);
        Ok(-f64::from(failures))
    }
}

/// Keeps device-bearing hosts for workloads that ask for devices: free
/// device capacity in the tree counts for such requests and against all
/// others.
pub struct DeviceAffinity;

impl Weigher for DeviceAffinity {
    fn name(&self) -> &'static str {
        "device_affinity"
    }

    fn allows_negative_multiplier(&self) -> bool {
        false
    }

    fn raw_score(&self, candidate: &Candidate, ctx: &ScoringContext<'_>) -> EngineResult<f64> {
        let wants_devices = ctx
            .request
            .resource_classes()
            .into_iter()
            .any(|class| is_device_class(class));
        let mut free = 0u64;
        for provider_id in ctx.graph.descendants(&candidate.root_id)? {
            for (class, inventory) in ctx.graph.inventories(&provider_id)? {
                if !is_device_class(&class) {
                    continue;
                }
                let used = ctx.graph.usage(&provider_id, &class)?;
                free += headroom(&inventory, used, ctx.overlay.get(&provider_id, &class));
            }
        }
        let free = free as f64;
        Ok(if wants_devices { free } else { -free })
    }
}

// ── Scorer ─────────────────────────────────────────────────────────

pub const WEIGHER_NAMES: &[&str] = &[
    "resource_balance",
    "trait_preference",
    "server_group_soft_affinity",
    "failure_recency",
    "device_affinity",
];

/// Ordered list of weighers with their multipliers.
pub struct Scorer {
    weighers: Vec<(Box<dyn Weigher>, f64)>,
}

impl Default for Scorer {
    fn default() -> Self {
        Self {
            weighers: vec![
                (Box::new(ResourceBalance), 1.0),
                (Box::new(ServerGroupSoftAffinity), 1.0),
                (Box::new(FailureRecency), 1.0),
            ],
        }
    }
}

impl Scorer {
    pub fn empty() -> Self {
        Self {
            weighers: Vec::new(),
        }
    }

    /// Build from `[[scoring]]` entries. An empty list gives the default
    /// weigher set.
    pub fn from_config(entries: &[WeigherConfig]) -> EngineResult<Self> {
        if entries.is_empty() {
            return Ok(Self::default());
        }
        let mut scorer = Self::empty();
        for entry in entries {
            let weigher: Box<dyn Weigher> = match entry.name.as_str() {
                "resource_balance" => Box::new(ResourceBalance),
                "trait_preference" => Box::new(TraitPreference::new(entry.weights.clone())),
                "server_group_soft_affinity" => Box::new(ServerGroupSoftAffinity),
                "failure_recency" => Box::new(FailureRecency),
                "device_affinity" => Box::new(DeviceAffinity),
                other => {
                    return Err(EngineError::Validation(format!(
                        "unknown weigher '{other}', expected one of {}",
                        WEIGHER_NAMES.join(", ")
                    )));
                }
            };
            scorer = scorer.with(weigher, entry.multiplier)?;
        }
        Ok(scorer)
    }

    pub fn with(mut self, weigher: Box<dyn Weigher>, multiplier: f64) -> EngineResult<Self> {
        if !multiplier.is_finite() {
            return Err(EngineError::Validation(format!(
                "multiplier for {} must be finite",
                weigher.name()
            )));
        }
        if multiplier < 0.0 && !weigher.allows_negative_multiplier() {
            return Err(EngineError::Validation(format!(
                "{} does not accept a negative multiplier",
                weigher.name()
            )));
        }
        self.weighers.push((weigher, multiplier));
        Ok(self)
    }

    pub fn weigher_names(&self) -> Vec<&'static str> {
        self.weighers.iter().map(|(w, _)| w.name()).collect()
    }

    pub fn rank(
        &self,
        candidates: Vec<Candidate>,
        ctx: &ScoringContext<'_>,
    ) -> EngineResult<Vec<RankedCandidate>> {
        let mut ranked: Vec<RankedCandidate> = candidates
            .into_iter()
            .map(|candidate| RankedCandidate {
                candidate,
                score: 0.0,
                breakdown: BTreeMap::new(),
            })
            .collect();

        for (weigher, multiplier) in &self.weighers {
            let raw = ranked
                .iter()
                .map(|r| weigher.raw_score(&r.candidate, ctx))
                .collect::<EngineResult<Vec<f64>>>()?;
            for (entry, value) in ranked.iter_mut().zip(normalize(&raw)) {
                let weighted = value * multiplier;
                entry.score += weighted;
                entry.breakdown.insert(weigher.name().to_string(), weighted);
            }
        }

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.candidate.root_id.cmp(&b.candidate.root_id))
        });
        if let Some(best) = ranked.first() {
            debug!(root = %best.candidate.root_id, score = best.score, "best candidate");
        }
        Ok(ranked)
    }
}

/// Min-max normalization into `[0, 1]`; a constant series maps to zeros.
pub fn normalize(raw: &[f64]) -> Vec<f64> {
    let min = raw.iter().copied().fold(f64::INFINITY, f64::min);
    let max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    if !span.is_finite() || span <= 0.0 {
        return vec![0.0; raw.len()];
    }
    raw.iter().map(|v| (v - min) / span).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use quarry_state::{GraphWriter, Inventory, InventoryRecord, ResourceProvider, StateStore, Trait};

    use crate::request::RequestGroup;
    use crate::resolver::Resolver;

    fn weigher(name: &str, multiplier: f64) -> WeigherConfig {
        WeigherConfig {
            name: name.into(),
            multiplier,
            weights: BTreeMap::new(),
        }
    }

    fn store_with_hosts(hosts: &[(&str, u64, u64)]) -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        store
            .write(|batch| {
                let w = GraphWriter::new(batch);
                w.put_trait(&Trait {
                    name: "CUSTOM_FAST".into(),
                    is_custom: true,
                })?;
                for (id, vcpu, gpus) in hosts {
                    w.put_provider(&ResourceProvider::new(*id, *id))?;
                    w.put_inventory(&Inventory::from_record(
                        id,
                        "VCPU",
                        &InventoryRecord::new(*vcpu),
                    ))?;
                    if *gpus > 0 {
                        w.put_inventory(&Inventory::from_record(
                            id,
                            "VGPU",
                            &InventoryRecord::new(*gpus),
                        ))?;
                    }
                }
                Ok::<_, quarry_state::StateError>(())
            })
            .unwrap();
        store
    }

    fn rank(
        store: &StateStore,
        scorer: &Scorer,
        request: &AllocationRequest,
        selection: &SelectionContext,
    ) -> Vec<RankedCandidate> {
        store
            .read(|graph| {
                let overlay = UsageOverlay::new();
                let found = Resolver::default().resolve(&graph, request, 10, &overlay)?;
                let ctx = ScoringContext {
                    graph,
                    request,
                    overlay: &overlay,
                    selection,
                };
                scorer.rank(found, &ctx)
            })
            .unwrap()
    }

    fn order(ranked: &[RankedCandidate]) -> Vec<&str> {
        ranked.iter().map(|r| r.candidate.root_id.as_str()).collect()
    }

    fn vcpu(amount: u64) -> AllocationRequest {
        AllocationRequest::new().group(RequestGroup::new("").resource("VCPU", amount))
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize(&[2.0, 4.0, 3.0]), vec![0.0, 1.0, 0.5]);
        assert_eq!(normalize(&[7.0, 7.0]), vec![0.0, 0.0]);
        assert!(normalize(&[]).is_empty());
    }

    #[test]
    fn resource_balance_prefers_emptier_hosts() {
        let store = store_with_hosts(&[("cn1", 8, 0), ("cn2", 32, 0)]);
        let ranked = rank(&store, &Scorer::default(), &vcpu(4), &SelectionContext::default());
        assert_eq!(order(&ranked), vec!["cn2", "cn1"]);
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn ties_break_by_root_id() {
        let store = store_with_hosts(&[("cn2", 8, 0), ("cn1", 8, 0)]);
        let ranked = rank(&store, &Scorer::default(), &vcpu(1), &SelectionContext::default());
        assert_eq!(order(&ranked), vec!["cn1", "cn2"]);
        assert_eq!(ranked[0].score, 0.0);
    }

    #[test]
    fn failure_recency_demotes_hosts() {
        let store = store_with_hosts(&[("cn1", 8, 0), ("cn2", 8, 0)]);
        let scorer = Scorer::from_config(&[weigher("failure_recency", 2.0)]).unwrap();
        let selection = SelectionContext {
            recent_failures: BTreeMap::from([("cn1".to_string(), 3)]),
        };
        let ranked = rank(&store, &scorer, &vcpu(1), &selection);
        assert_eq!(order(&ranked), vec!["cn2", "cn1"]);
        assert_eq!(ranked[0].breakdown["failure_recency"], 2.0);
    }

    #[test]
    fn trait_preference_uses_weights() {
        let store = store_with_hosts(&[("cn1", 8, 0), ("cn2", 8, 0)]);
        store
            .write(|batch| {
                GraphWriter::new(batch)
                    .set_traits("cn2", &BTreeSet::from(["CUSTOM_FAST".to_string()]))
            })
            .unwrap();
        let mut entry = weigher("trait_preference", 1.0);
        entry.weights.insert("CUSTOM_FAST".into(), 5.0);
        let scorer = Scorer::from_config(&[entry]).unwrap();
        let ranked = rank(&store, &scorer, &vcpu(1), &SelectionContext::default());
        assert_eq!(order(&ranked), vec!["cn2", "cn1"]);
    }

    #[test]
    fn device_affinity_keeps_gpu_hosts_free() {
        let store = store_with_hosts(&[("cn1", 8, 4), ("cn2", 8, 0)]);
        let scorer = Scorer::from_config(&[weigher("device_affinity", 1.0)]).unwrap();
        let ranked = rank(&store, &scorer, &vcpu(1), &SelectionContext::default());
        assert_eq!(order(&ranked), vec!["cn2", "cn1"]);

        let gpu = AllocationRequest::new().group(
            RequestGroup::new("")
                .resource("VCPU", 1)
                .resource("VGPU", 1),
        );
        let ranked = rank(&store, &scorer, &gpu, &SelectionContext::default());
        assert_eq!(order(&ranked), vec!["cn1"]);
    }

    #[test]
    fn device_affinity_rejects_negative_multiplier() {
        let err = Scorer::from_config(&[weigher("device_affinity", -1.0)]).err();
        assert!(matches!(err, Some(EngineError::Validation(_))));
        assert!(Scorer::from_config(&[weigher("failure_recency", -1.0)]).is_ok());
    }

    #[test]
    fn unknown_weigher_is_rejected() {
        let err = Scorer::from_config(&[weigher("cosmic_rays", 1.0)]).err();
        assert!(matches!(err, Some(EngineError::Validation(_))));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let scorer = Scorer::from_config(&[]).unwrap();
        assert_eq!(
            scorer.weigher_names(),
            vec!["resource_balance", "server_group_soft_affinity", "failure_recency"]
        );
    }
}
