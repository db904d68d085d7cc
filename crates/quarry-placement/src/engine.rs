//! The [`Engine`] facade.
//!
//! Reads run against a fresh redb snapshot and never block the writer.
//! Every write goes through the [`ConcurrencyController`], either as a
//! generation-checked [`Batch`] or, for catalogs without per-entity
//! generations, through [`ConcurrencyController::write_catalog`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use quarry_core::config::{ConfigError, QuarryConfig, WeigherConfig};
use quarry_core::naming::{is_custom, validate_custom_name, validate_name};
use quarry_state::{
    Aggregate, Allocation, EntityRef, GroupMember, InventoryRecord, ResourceClass,
    ResourceProvider, ServerGroup, StateStore, Trait,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::capacity::UsageOverlay;
use crate::concurrency::{
    AllocationItem, Batch, ConcurrencyController, ConsumerOwner, Expectation, Mutation,
    ProviderUpdate, placement_host, validate_id,
};
use crate::error::{EngineError, EngineResult};
use crate::reaper::SessionReaper;
use crate::request::{AllocationRequest, SearchBounds};
use crate::resolver::{Candidate, Resolver};
use crate::scorer::{RankedCandidate, Scorer, ScoringContext, SelectionContext};
use crate::session::{
    Delta, EffectiveStateView, ReapReport, SessionHandle, SessionInfo, SessionManager,
    SessionSettings, StateScope,
};
use crate::usage::{UsageScope, UsageSummary, compute_usage};

/// Engine tuning, usually derived from [`QuarryConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub bounds: SearchBounds,
    pub max_limit: usize,
    pub max_server_per_host: u32,
    pub sessions: SessionSettings,
    pub scoring: Vec<WeigherConfig>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            bounds: SearchBounds {
                max_roots: 10_000,
                max_combinations: 100_000,
            },
            max_limit: 1000,
            max_server_per_host: 1,
            sessions: SessionSettings::default(),
            scoring: Vec::new(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &QuarryConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            bounds: SearchBounds {
                max_roots: config.search.max_roots,
                max_combinations: config.search.max_combinations,
            },
            max_limit: config.search.max_limit,
            max_server_per_host: config.affinity.max_server_per_host,
            sessions: SessionSettings::from_config(&config.sessions)?,
            scoring: config.scoring.clone(),
        })
    }
}

/// Input for [`Engine::create_provider`]. A missing id is generated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProvider {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
}

/// A full-set allocation write for one consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationWrite {
    pub allocations: Vec<AllocationItem>,
    #[serde(default)]
    pub owner: Option<ConsumerOwner>,
    /// Generations the caller read the involved providers at.
    #[serde(default)]
    pub provider_expectations: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerAllocations {
    pub consumer_id: String,
    /// `None` when the consumer does not exist.
    pub generation: Option<u64>,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub allocations: Vec<AllocationItem>,
}

/// Allocation engine over one state store. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    store: StateStore,
    controller: ConcurrencyController,
    sessions: SessionManager,
    resolver: Arc<Resolver>,
    scorer: Arc<Scorer>,
    max_limit: usize,
}

impl Engine {
    pub fn new(store: StateStore, settings: EngineSettings) -> EngineResult<Self> {
        let scorer = Scorer::from_config(&settings.scoring)?;
        let controller = ConcurrencyController::new(store.clone());
        let sessions = SessionManager::new(controller.clone(), settings.sessions);
        debug!(weighers = ?scorer.weigher_names(), "engine ready");
        Ok(Self {
            store,
            controller,
            sessions,
            resolver: Arc::new(Resolver::new(settings.bounds, settings.max_server_per_host)),
            scorer: Arc::new(scorer),
            max_limit: settings.max_limit,
        })
    }

    /// Open the store named by the configuration (in memory when no path is
    /// set) and build an engine over it.
    pub fn from_config(config: &QuarryConfig) -> EngineResult<Self> {
        let settings = EngineSettings::from_config(config)
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        let store = match &config.store.path {
            Some(path) => StateStore::open(path)?,
            None => StateStore::open_in_memory()?,
        };
        Self::new(store, settings)
    }

    /// Replace the resolver, e.g. to run custom filter chains.
    pub fn with_resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn with_scorer(mut self, scorer: Scorer) -> Self {
        self.scorer = Arc::new(scorer);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// A reaper bound to this engine's session table.
    pub fn reaper(&self, interval: Duration) -> SessionReaper {
        SessionReaper::new(self.sessions.clone(), interval)
    }

    // ── Providers ──────────────────────────────────────────────────

    pub fn create_provider(&self, new: NewProvider) -> EngineResult<ResourceProvider> {
        let id = new.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.controller.apply(&Batch::new().mutate(Mutation::CreateProvider {
            provider_id: id.clone(),
            name: new.name,
            parent_id: new.parent_id,
        }))?;
        info!(provider = %id, "resource provider created");
        self.get_provider(&id)
    }

    pub fn get_provider(&self, id: &str) -> EngineResult<ResourceProvider> {
        Ok(self.store.read(|graph| graph.require_provider(id))?)
    }

    /// Rename, enable/disable or re-parent a provider.
    pub fn update_provider(
        &self,
        id: &str,
        expected_generation: u64,
        update: ProviderUpdate,
    ) -> EngineResult<u64> {
        self.provider_write(
            id,
            expected_generation,
            Mutation::UpdateProvider {
                provider_id: id.to_string(),
                update,
            },
        )
    }

    pub fn delete_provider(&self, id: &str, expected_generation: u64) -> EngineResult<()> {
        self.controller.apply(
            &Batch::new()
                .expect(Expectation::provider(id, expected_generation))
                .mutate(Mutation::DeleteProvider {
                    provider_id: id.to_string(),
                }),
        )?;
        info!(provider = %id, "resource provider deleted");
        Ok(())
    }

    /// Replace the provider's whole inventory.
    pub fn set_inventory(
        &self,
        id: &str,
        expected_generation: u64,
        inventories: BTreeMap<String, InventoryRecord>,
    ) -> EngineResult<u64> {
        self.provider_write(
            id,
            expected_generation,
            Mutation::SetInventory {
                provider_id: id.to_string(),
                inventories,
            },
        )
    }

    pub fn set_traits(
        &self,
        id: &str,
        expected_generation: u64,
        traits: BTreeSet<String>,
    ) -> EngineResult<u64> {
        self.provider_write(
            id,
            expected_generation,
            Mutation::SetTraits {
                provider_id: id.to_string(),
                traits,
            },
        )
    }

    pub fn set_aggregates(
        &self,
        id: &str,
        expected_generation: u64,
        aggregates: BTreeSet<String>,
    ) -> EngineResult<u64> {
        self.provider_write(
            id,
            expected_generation,
            Mutation::SetAggregates {
                provider_id: id.to_string(),
                aggregates,
            },
        )
    }

    /// Declare which classes the provider lends to its aggregate peers.
    pub fn set_sharing(
        &self,
        id: &str,
        expected_generation: u64,
        classes: BTreeSet<String>,
    ) -> EngineResult<u64> {
        self.provider_write(
            id,
            expected_generation,
            Mutation::SetSharing {
                provider_id: id.to_string(),
                classes,
            },
        )
    }

    fn provider_write(
        &self,
        id: &str,
        expected_generation: u64,
        mutation: Mutation,
    ) -> EngineResult<u64> {
        let entity = EntityRef::provider(id);
        let outcome = self.controller.apply(
            &Batch::new()
                .expect(Expectation::provider(id, expected_generation))
                .mutate(mutation),
        )?;
        outcome
            .generation_of(&entity)
            .ok_or_else(|| EngineError::Internal(format!("provider {id} vanished during write")))
    }

    // ── Catalogs ───────────────────────────────────────────────────

    /// Create a trait. Returns `false` when it already existed.
    pub fn create_trait(&self, name: &str) -> EngineResult<bool> {
        validate_name(name).map_err(|e| EngineError::Validation(e.to_string()))?;
        self.controller.write_catalog(|writer| {
            if writer.reader().trait_def(name)?.is_some() {
                return Ok(false);
            }
            writer.put_trait(&Trait {
                name: name.to_string(),
                is_custom: is_custom(name),
            })?;
            info!(name, "trait created");
            Ok(true)
        })
    }

    pub fn list_traits(&self) -> EngineResult<Vec<Trait>> {
        Ok(self.store.read(|graph| graph.trait_defs())?)
    }

    /// Delete a custom trait no provider carries.
    pub fn delete_trait(&self, name: &str) -> EngineResult<()> {
        self.controller.write_catalog(|writer| {
            let graph = writer.reader();
            let def = graph
                .trait_def(name)?
                .ok_or_else(|| EngineError::NotFound(format!("trait {name}")))?;
            if !def.is_custom {
                return Err(EngineError::Validation(format!(
                    "standard trait {name} cannot be deleted"
                )));
            }
            if graph.trait_in_use(name)? {
                return Err(EngineError::InUse(format!("trait {name}")));
            }
            writer.delete_trait(name)?;
            info!(name, "trait deleted");
            Ok(())
        })
    }

    pub fn create_resource_class(&self, name: &str) -> EngineResult<ResourceClass> {
        validate_custom_name(name).map_err(|e| EngineError::Validation(e.to_string()))?;
        self.controller.write_catalog(|writer| {
            if writer.reader().resource_class(name)?.is_some() {
                return Err(EngineError::AlreadyExists(format!("resource class {name}")));
            }
            let class = ResourceClass {
                name: name.to_string(),
                is_custom: true,
            };
            writer.put_resource_class(&class)?;
            info!(name, "resource class created");
            Ok(class)
        })
    }

    pub fn list_resource_classes(&self) -> EngineResult<Vec<ResourceClass>> {
        Ok(self.store.read(|graph| graph.resource_classes())?)
    }

    /// Delete a custom class no provider has inventory of.
    pub fn delete_resource_class(&self, name: &str) -> EngineResult<()> {
        self.controller.write_catalog(|writer| {
            let graph = writer.reader();
            let class = graph
                .resource_class(name)?
                .ok_or_else(|| EngineError::NotFound(format!("resource class {name}")))?;
            if !class.is_custom {
                return Err(EngineError::Validation(format!(
                    "standard resource class {name} cannot be deleted"
                )));
            }
            if !graph.class_providers(name)?.is_empty() {
                return Err(EngineError::InUse(format!("resource class {name}")));
            }
            writer.delete_resource_class(name)?;
            info!(name, "resource class deleted");
            Ok(())
        })
    }

    /// Create or replace an aggregate's metadata.
    pub fn put_aggregate(&self, aggregate: Aggregate) -> EngineResult<()> {
        validate_id("aggregate", &aggregate.id)?;
        self.controller.write_catalog(|writer| {
            writer.put_aggregate(&aggregate)?;
            debug!(aggregate = %aggregate.id, "aggregate stored");
            Ok(())
        })
    }

    pub fn create_server_group(&self, group: ServerGroup) -> EngineResult<()> {
        validate_id("server group", &group.id)?;
        if group.max_server_per_host == Some(0) {
            return Err(EngineError::Validation(
                "max_server_per_host must be at least 1".to_string(),
            ));
        }
        self.controller.write_catalog(|writer| {
            if writer.reader().server_group(&group.id)?.is_some() {
                return Err(EngineError::AlreadyExists(format!(
                    "server group {}",
                    group.id
                )));
            }
            writer.put_server_group(&group)?;
            info!(group = %group.id, policy = ?group.policy, "server group created");
            Ok(())
        })
    }

    /// Add a consumer to a server group. Its host is derived from whatever
    /// it is already allocated on.
    pub fn add_group_member(&self, group_id: &str, consumer_id: &str) -> EngineResult<()> {
        validate_id("consumer", consumer_id)?;
        self.controller.write_catalog(|writer| {
            let graph = writer.reader();
            if graph.server_group(group_id)?.is_none() {
                return Err(EngineError::NotFound(format!("server group {group_id}")));
            }
            if let Some(current) = graph.consumer_group(consumer_id)?
                && current != group_id
            {
                return Err(EngineError::AlreadyExists(format!(
                    "consumer {consumer_id} in server group {current}"
                )));
            }
            let allocations = graph.consumer_allocations(consumer_id)?;
            let host = placement_host(&graph, &allocations)?;
            writer.put_group_member(&GroupMember {
                group_id: group_id.to_string(),
                consumer_id: consumer_id.to_string(),
                host,
            })?;
            Ok(())
        })
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Replace the consumer's allocations wholesale. Returns the consumer's
    /// new generation, or `None` when the empty set removed it.
    pub fn replace_allocations(
        &self,
        consumer_id: &str,
        expected_generation: Option<u64>,
        write: AllocationWrite,
    ) -> EngineResult<Option<u64>> {
        let entity = EntityRef::consumer(consumer_id);
        let mut batch = Batch::new().expect(Expectation {
            entity: entity.clone(),
            generation: expected_generation,
        });
        for (provider_id, generation) in &write.provider_expectations {
            batch = batch.expect(Expectation::provider(provider_id.as_str(), *generation));
        }
        let batch = batch.mutate(Mutation::ReplaceAllocations {
            consumer_id: consumer_id.to_string(),
            owner: write.owner,
            allocations: write.allocations,
        });
        let outcome = self.controller.apply(&batch)?;
        Ok(outcome.generation_of(&entity))
    }

    pub fn get_allocations(&self, consumer_id: &str) -> EngineResult<ConsumerAllocations> {
        self.store.read(|graph| {
            let consumer = graph.consumer(consumer_id)?;
            let allocations = graph
                .consumer_allocations(consumer_id)?
                .into_iter()
                .map(|a| AllocationItem::new(a.provider_id, a.resource_class, a.used))
                .collect();
            Ok(ConsumerAllocations {
                consumer_id: consumer_id.to_string(),
                generation: consumer.as_ref().map(|c| c.generation),
                project_id: consumer.as_ref().and_then(|c| c.project_id.clone()),
                user_id: consumer.and_then(|c| c.user_id),
                allocations,
            })
        })
    }

    pub fn provider_allocations(&self, provider_id: &str) -> EngineResult<Vec<Allocation>> {
        self.store.read(|graph| {
            graph.require_provider(provider_id)?;
            Ok(graph.provider_allocations(provider_id)?)
        })
    }

    pub fn compute_usage(&self, scope: &UsageScope) -> EngineResult<UsageSummary> {
        self.store.read(|graph| compute_usage(&graph, scope))
    }

    // ── Candidates ─────────────────────────────────────────────────

    fn check_limit(&self, limit: usize) -> EngineResult<usize> {
        if limit == 0 {
            return Err(EngineError::Validation("limit must be at least 1".to_string()));
        }
        Ok(limit.min(self.max_limit))
    }

    /// Viable placements over committed state, one per root.
    pub fn get_allocation_candidates(
        &self,
        request: &AllocationRequest,
        limit: usize,
    ) -> EngineResult<Vec<Candidate>> {
        let limit = self.check_limit(limit)?;
        let overlay = UsageOverlay::new();
        self.store
            .read(|graph| self.resolver.resolve(&graph, request, limit, &overlay))
    }

    /// Resolve, then rank with the configured weighers.
    pub fn select_candidates(
        &self,
        request: &AllocationRequest,
        limit: usize,
        selection: &SelectionContext,
    ) -> EngineResult<Vec<RankedCandidate>> {
        let limit = self.check_limit(limit)?;
        let overlay = UsageOverlay::new();
        self.store.read(|graph| {
            let candidates = self.resolver.resolve(&graph, request, limit, &overlay)?;
            let ctx = ScoringContext {
                graph,
                request,
                overlay: &overlay,
                selection,
            };
            self.scorer.rank(candidates, &ctx)
        })
    }

    // ── Simulation sessions ────────────────────────────────────────

    pub fn create_simulation_session(&self, ttl: Option<Duration>) -> EngineResult<SessionHandle> {
        self.sessions.create(ttl)
    }

    pub fn record_delta(&self, session_id: &str, delta: Delta) -> EngineResult<u64> {
        self.sessions.record(session_id, delta)
    }

    pub fn query_virtual_state(
        &self,
        session_id: &str,
        scope: &StateScope,
    ) -> EngineResult<EffectiveStateView> {
        self.sessions.virtual_state(session_id, scope)
    }

    /// Candidate search over committed state plus the session's deltas.
    pub fn session_candidates(
        &self,
        session_id: &str,
        request: &AllocationRequest,
        limit: usize,
    ) -> EngineResult<Vec<Candidate>> {
        let limit = self.check_limit(limit)?;
        let overlay = self.sessions.overlay(session_id)?;
        self.store
            .read(|graph| self.resolver.resolve(&graph, request, limit, &overlay))
    }

    /// Returns the global generation the session's batch committed at.
    pub fn commit_session(&self, session_id: &str) -> EngineResult<u64> {
        self.sessions.commit(session_id)
    }

    pub fn rollback_session(&self, session_id: &str) -> EngineResult<()> {
        self.sessions.rollback(session_id)
    }

    pub fn session_info(&self, session_id: &str) -> EngineResult<SessionInfo> {
        self.sessions.info(session_id)
    }

    pub fn reap_sessions(&self, now: Instant) -> ReapReport {
        self.sessions.reap(now)
    }
}
