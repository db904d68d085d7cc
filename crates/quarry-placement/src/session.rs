//! Simulation sessions.
//!
//! A session records hypothetical allocation changes against the graph as
//! it stood at the session's base generation. Deltas are folded into a
//! per-session virtual placement and a signed [`UsageOverlay`]; nothing
//! touches the store until [`SessionManager::commit`], which turns the
//! session into one atomic [`Batch`] guarded by the generation of every
//! entity the session touched.
//!
//! Lifecycle: `active → committed | rolled_back | expired`. Terminal
//! sessions stay queryable for the retention period and are then purged by
//! the reaper.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use quarry_core::config::{ConfigError, SessionConfig};
use quarry_state::{EntityRef, Graph, StateStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capacity::{UsageOverlay, check_units, effective_usage, headroom};
use crate::concurrency::{
    AllocationItem, Batch, ConcurrencyController, ConsumerOwner, Expectation, Mutation,
    validate_id,
};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Committed,
    RolledBack,
    Expired,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self != SessionState::Active
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Active => "active",
            SessionState::Committed => "committed",
            SessionState::RolledBack => "rolled_back",
            SessionState::Expired => "expired",
        })
    }
}

/// A hypothetical change to one consumer's allocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Delta {
    /// Add a new `(provider, class)` allocation to the consumer.
    Allocate {
        consumer_id: String,
        provider_id: String,
        resource_class: String,
        amount: u64,
        #[serde(default)]
        project_id: Option<String>,
        #[serde(default)]
        user_id: Option<String>,
    },
    /// Drop the consumer's allocations on one provider, or all of them.
    Deallocate {
        consumer_id: String,
        #[serde(default)]
        provider_id: Option<String>,
    },
    /// Change the amount of an existing allocation.
    Resize {
        consumer_id: String,
        provider_id: String,
        resource_class: String,
        amount: u64,
    },
    /// Move every allocation on one provider to another.
    Move {
        consumer_id: String,
        from_provider: String,
        to_provider: String,
    },
}

impl Delta {
    pub fn consumer_id(&self) -> &str {
        match self {
            Delta::Allocate { consumer_id, .. }
            | Delta::Deallocate { consumer_id, .. }
            | Delta::Resize { consumer_id, .. }
            | Delta::Move { consumer_id, .. } => consumer_id,
        }
    }

    /// Providers the delta names explicitly.
    fn providers(&self) -> Vec<&str> {
        match self {
            Delta::Allocate { provider_id, .. } | Delta::Resize { provider_id, .. } => {
                vec![provider_id]
            }
            Delta::Deallocate { provider_id, .. } => provider_id.iter().map(String::as_str).collect(),
            Delta::Move {
                from_provider,
                to_provider,
                ..
            } => vec![from_provider, to_provider],
        }
    }

    /// Apply to a consumer's allocations keyed by `(provider, class)`.
    fn apply(&self, allocations: &mut BTreeMap<(String, String), u64>) -> EngineResult<()> {
        let consumer = self.consumer_id();
        match self {
            Delta::Allocate {
                provider_id,
                resource_class,
                amount,
                ..
            } => {
                let key = (provider_id.clone(), resource_class.clone());
                if allocations.contains_key(&key) {
                    return Err(EngineError::Validation(format!(
                        "{consumer} already holds {resource_class} on {provider_id}; use resize"
                    )));
                }
                allocations.insert(key, *amount);
            }
            Delta::Deallocate { provider_id, .. } => {
                let before = allocations.len();
                match provider_id {
                    Some(provider_id) => allocations.retain(|(p, _), _| p != provider_id),
                    None => allocations.clear(),
                }
                if allocations.len() == before {
                    return Err(EngineError::Validation(format!(
                        "{consumer} has nothing to deallocate"
                    )));
                }
            }
            Delta::Resize {
                provider_id,
                resource_class,
                amount,
                ..
            } => {
                let key = (provider_id.clone(), resource_class.clone());
                let Some(current) = allocations.get_mut(&key) else {
                    return Err(EngineError::Validation(format!(
                        "{consumer} holds no {resource_class} on {provider_id}"
                    )));
                };
                *current = *amount;
            }
            Delta::Move {
                from_provider,
                to_provider,
                ..
            } => {
                if from_provider == to_provider {
                    return Err(EngineError::Validation(format!(
                        "{consumer} cannot move onto the provider it is leaving"
                    )));
                }
                let moving: Vec<(String, u64)> = allocations
                    .iter()
                    .filter(|((p, _), _)| p == from_provider)
                    .map(|((_, class), used)| (class.clone(), *used))
                    .collect();
                if moving.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "{consumer} holds nothing on {from_provider}"
                    )));
                }
                for (class, used) in moving {
                    allocations.remove(&(from_provider.clone(), class.clone()));
                    let merged = allocations
                        .entry((to_provider.clone(), class))
                        .or_insert(0);
                    *merged = merged.checked_add(used).ok_or_else(|| {
                        EngineError::Validation(format!(
                            "moving {consumer} onto {to_provider} overflows its allocation"
                        ))
                    })?;
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> EngineResult<()> {
        validate_id("consumer", self.consumer_id())?;
        match self {
            Delta::Allocate { amount: 0, .. } | Delta::Resize { amount: 0, .. } => Err(
                EngineError::Validation("delta amount must be at least 1".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedDelta {
    pub sequence: u64,
    pub delta: Delta,
}

/// Which part of the virtual state to report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum StateScope {
    Provider(String),
    Consumer(String),
    /// Every provider under a root, and the consumers using them.
    Tree(String),
    /// Everything the session has touched.
    Touched,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerPlacement {
    pub consumer_id: String,
    pub allocations: Vec<AllocationItem>,
    /// Sequence of the last delta that changed this consumer.
    pub last_sequence: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualUsage {
    pub capacity: u64,
    pub committed: u64,
    pub adjustment: i64,
    pub effective: u64,
    pub available: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderUsageView {
    pub provider_id: String,
    pub resources: BTreeMap<String, VirtualUsage>,
}

/// Committed state plus this session's own deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveStateView {
    pub session_id: String,
    pub base_generation: u64,
    pub placements: Vec<ConsumerPlacement>,
    pub usages: Vec<ProviderUsageView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHandle {
    pub session_id: String,
    pub base_generation: u64,
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub state: SessionState,
    pub base_generation: u64,
    pub deltas: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub expired: usize,
    pub purged: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub default_ttl: Duration,
    pub max_ttl: Duration,
    pub max_deltas: usize,
    pub retention: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_ttl: Duration::from_secs(3600),
            max_deltas: 256,
            retention: Duration::from_secs(600),
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &SessionConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            default_ttl: config.default_ttl()?,
            max_ttl: config.max_ttl()?,
            max_deltas: config.max_deltas,
            retention: config.retention()?,
        })
    }
}

type Allocations = BTreeMap<(String, String), u64>;

struct Session {
    id: String,
    state: SessionState,
    base_generation: u64,
    expires_at: Instant,
    finished_at: Option<Instant>,
    deltas: Vec<RecordedDelta>,
    /// Generation of every touched entity at first touch.
    bases: BTreeMap<EntityRef, Option<u64>>,
    /// Virtual allocations of every touched consumer.
    placements: BTreeMap<String, Allocations>,
    last_sequence: BTreeMap<String, u64>,
    owners: BTreeMap<String, ConsumerOwner>,
    overlay: UsageOverlay,
}

impl Session {
    /// Expire lazily, then require the session to be active.
    fn ensure_active(&mut self, now: Instant) -> EngineResult<()> {
        if self.state == SessionState::Active && now >= self.expires_at {
            self.finish(SessionState::Expired, now);
            info!(session = %self.id, "session expired");
        }
        if self.state != SessionState::Active {
            return Err(EngineError::SessionNotActive {
                session_id: self.id.clone(),
                state: self.state,
            });
        }
        Ok(())
    }

    /// Move to a terminal state and discard the log.
    fn finish(&mut self, state: SessionState, now: Instant) {
        self.state = state;
        self.finished_at = Some(now);
        self.deltas.clear();
        self.placements.clear();
        self.last_sequence.clear();
        self.owners.clear();
        self.overlay = UsageOverlay::new();
    }

    fn providers_touched(&self) -> BTreeSet<&str> {
        self.bases
            .keys()
            .filter_map(|e| match e {
                EntityRef::Provider(id) => Some(id.as_str()),
                EntityRef::Consumer(_) => None,
            })
            .collect()
    }
}

fn to_items(allocations: &Allocations) -> Vec<AllocationItem> {
    allocations
        .iter()
        .map(|((provider_id, class), used)| AllocationItem::new(provider_id.as_str(), class.as_str(), *used))
        .collect()
}

fn committed_allocations(graph: &Graph<'_>, consumer_id: &str) -> EngineResult<Allocations> {
    Ok(graph
        .consumer_allocations(consumer_id)?
        .into_iter()
        .map(|a| ((a.provider_id, a.resource_class), a.used))
        .collect())
}

/// Owns every live session. Cheap to clone; clones share the table.
#[derive(Clone)]
pub struct SessionManager {
    store: StateStore,
    controller: ConcurrencyController,
    sessions: Arc<RwLock<HashMap<String, Arc<Mutex<Session>>>>>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(controller: ConcurrencyController, settings: SessionSettings) -> Self {
        Self {
            store: controller.store().clone(),
            controller,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            settings,
        }
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    fn session(&self, id: &str) -> EngineResult<Arc<Mutex<Session>>> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("session {id}")))
    }

    /// Open a session based on the current global generation.
    pub fn create(&self, ttl: Option<Duration>) -> EngineResult<SessionHandle> {
        let ttl = ttl.unwrap_or(self.settings.default_ttl);
        if ttl.is_zero() || ttl > self.settings.max_ttl {
            return Err(EngineError::Validation(format!(
                "session ttl must be between 0 and {:?}, got {ttl:?}",
                self.settings.max_ttl
            )));
        }
        let base_generation = self.store.read(|graph| graph.global_generation())?;
        let id = Uuid::new_v4().to_string();
        let session = Session {
            id: id.clone(),
            state: SessionState::Active,
            base_generation,
            expires_at: Instant::now() + ttl,
            finished_at: None,
            deltas: Vec::new(),
            bases: BTreeMap::new(),
            placements: BTreeMap::new(),
            last_sequence: BTreeMap::new(),
            owners: BTreeMap::new(),
            overlay: UsageOverlay::new(),
        };
        self.sessions
            .write()
            .insert(id.clone(), Arc::new(Mutex::new(session)));
        info!(session = %id, base_generation, ?ttl, "session created");
        Ok(SessionHandle {
            session_id: id,
            base_generation,
            ttl,
        })
    }

    /// Validate `delta` against the session's virtual state and append it.
    /// Returns the delta's sequence number.
    pub fn record(&self, session_id: &str, delta: Delta) -> EngineResult<u64> {
        delta.validate()?;
        let handle = self.session(session_id)?;
        let mut session = handle.lock();
        session.ensure_active(Instant::now())?;
        if session.deltas.len() >= self.settings.max_deltas {
            return Err(EngineError::ResourceExhausted(format!(
                "session {session_id} already holds {} deltas",
                self.settings.max_deltas
            )));
        }

        let snapshot = self.store.snapshot()?;
        let graph = Graph::new(&snapshot);
        let consumer_id = delta.consumer_id().to_string();

        let before = match session.placements.get(&consumer_id) {
            Some(current) => current.clone(),
            None => committed_allocations(&graph, &consumer_id)?,
        };
        let mut after = before.clone();
        delta.apply(&mut after)?;

        let changed: BTreeSet<&(String, String)> = before
            .keys()
            .chain(after.keys())
            .filter(|key| before.get(*key) != after.get(*key))
            .collect();

        // Entities this delta touches for the first time.
        let mut entities = vec![EntityRef::consumer(consumer_id.as_str())];
        let mut providers: BTreeSet<&str> = delta.providers().into_iter().collect();
        providers.extend(changed.iter().map(|(p, _)| p.as_str()));
        for provider_id in &providers {
            if graph.provider(provider_id)?.is_none() {
                return Err(EngineError::NotFound(format!(
                    "resource provider {provider_id}"
                )));
            }
            entities.push(EntityRef::provider(*provider_id));
        }
        let mut first_touch = BTreeMap::new();
        let mut stale = Vec::new();
        for entity in entities {
            if session.bases.contains_key(&entity) {
                continue;
            }
            let version = graph.version(&entity)?;
            if let Some(version) = version
                && version.modified_at > session.base_generation
            {
                stale.push(entity);
                continue;
            }
            first_touch.insert(entity, version.map(|v| v.generation));
        }
        if !stale.is_empty() {
            warn!(session = %session_id, stale = stale.len(), "delta touches entities modified after base");
            return Err(EngineError::StaleSession {
                session_id: session_id.to_string(),
                base_generation: session.base_generation,
                entities: stale,
            });
        }

        let mut overlay = session.overlay.clone();
        for key in &changed {
            let old = before.get(*key).copied().unwrap_or(0);
            let new = after.get(*key).copied().unwrap_or(0);
            overlay.adjust_between(&key.0, &key.1, old, new)?;
        }
        // Units and capacity for every allocation that grew.
        for key in &changed {
            let (provider_id, class) = *key;
            let Some(amount) = after.get(*key) else {
                continue;
            };
            if before.get(*key) >= Some(amount) {
                continue;
            }
            let inventory = graph.inventory(provider_id, class)?.ok_or_else(|| {
                EngineError::Validation(format!(
                    "provider {provider_id} has no inventory of {class}"
                ))
            })?;
            check_units(&inventory, *amount)?;
            let capacity = inventory.capacity();
            let effective = effective_usage(
                graph.usage(provider_id, class)?,
                overlay.get(provider_id, class),
            );
            if effective > capacity {
                return Err(EngineError::CapacityExceeded {
                    provider_id: provider_id.clone(),
                    resource_class: class.clone(),
                    requested: *amount,
                    used: effective.saturating_sub(*amount),
                    capacity,
                    shortfall: effective - capacity,
                });
            }
        }

        let sequence = session.deltas.len() as u64 + 1;
        session.bases.extend(first_touch);
        session.overlay = overlay;
        session.placements.insert(consumer_id.clone(), after);
        session.last_sequence.insert(consumer_id.clone(), sequence);
        if let Delta::Allocate {
            project_id,
            user_id,
            ..
        } = &delta
            && (project_id.is_some() || user_id.is_some())
        {
            session.owners.insert(
                consumer_id.clone(),
                ConsumerOwner {
                    project_id: project_id.clone(),
                    user_id: user_id.clone(),
                },
            );
        }
        session.deltas.push(RecordedDelta { sequence, delta });
        debug!(session = %session_id, consumer = %consumer_id, sequence, "delta recorded");
        Ok(sequence)
    }

    /// The signed usage adjustments of an active session.
    pub fn overlay(&self, session_id: &str) -> EngineResult<UsageOverlay> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock();
        session.ensure_active(Instant::now())?;
        Ok(session.overlay.clone())
    }

    pub fn virtual_state(&self, session_id: &str, scope: &StateScope) -> EngineResult<EffectiveStateView> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock();
        session.ensure_active(Instant::now())?;
        let snapshot = self.store.snapshot()?;
        let graph = Graph::new(&snapshot);

        let (consumers, providers): (BTreeSet<String>, BTreeSet<String>) = match scope {
            StateScope::Provider(id) => {
                graph.require_provider(id)?;
                let providers = BTreeSet::from([id.clone()]);
                (self.consumers_on(&graph, &session, &providers)?, providers)
            }
            StateScope::Consumer(id) => {
                let allocations = match session.placements.get(id) {
                    Some(placement) => placement.clone(),
                    None => committed_allocations(&graph, id)?,
                };
                let providers = allocations.keys().map(|(p, _)| p.clone()).collect();
                (BTreeSet::from([id.clone()]), providers)
            }
            StateScope::Tree(root) => {
                graph.require_provider(root)?;
                let providers: BTreeSet<String> = graph.descendants(root)?.into_iter().collect();
                (self.consumers_on(&graph, &session, &providers)?, providers)
            }
            StateScope::Touched => (
                session.placements.keys().cloned().collect(),
                session
                    .providers_touched()
                    .into_iter()
                    .map(String::from)
                    .chain(session.overlay.iter().map(|(p, _, _)| p.to_string()))
                    .collect(),
            ),
        };

        let mut placements = Vec::new();
        for consumer_id in consumers {
            let allocations = match session.placements.get(&consumer_id) {
                Some(placement) => placement.clone(),
                None => committed_allocations(&graph, &consumer_id)?,
            };
            placements.push(ConsumerPlacement {
                allocations: to_items(&allocations),
                last_sequence: session.last_sequence.get(&consumer_id).copied(),
                consumer_id,
            });
        }

        let mut usages = Vec::new();
        for provider_id in providers {
            let mut resources = BTreeMap::new();
            for (class, inventory) in graph.inventories(&provider_id)? {
                let committed = graph.usage(&provider_id, &class)?;
                let adjustment = session.overlay.get(&provider_id, &class);
                let effective = effective_usage(committed, adjustment);
                resources.insert(
                    class,
                    VirtualUsage {
                        capacity: inventory.capacity(),
                        committed,
                        adjustment,
                        effective,
                        available: headroom(&inventory, committed, adjustment),
                    },
                );
            }
            usages.push(ProviderUsageView {
                provider_id,
                resources,
            });
        }

        Ok(EffectiveStateView {
            session_id: session.id.clone(),
            base_generation: session.base_generation,
            placements,
            usages,
        })
    }

    /// Consumers with virtual allocations on any of `providers`.
    fn consumers_on(
        &self,
        graph: &Graph<'_>,
        session: &Session,
        providers: &BTreeSet<String>,
    ) -> EngineResult<BTreeSet<String>> {
        let mut consumers: BTreeSet<String> = BTreeSet::new();
        for provider_id in providers {
            for alloc in graph.provider_allocations(provider_id)? {
                if !session.placements.contains_key(&alloc.consumer_id) {
                    consumers.insert(alloc.consumer_id);
                }
            }
        }
        for (consumer_id, allocations) in &session.placements {
            if allocations.keys().any(|(p, _)| providers.contains(p)) {
                consumers.insert(consumer_id.clone());
            }
        }
        Ok(consumers)
    }

    /// Apply the session as one atomic batch. A stale session fails with
    /// `Conflict` and stays active so the caller can inspect or roll back.
    pub fn commit(&self, session_id: &str) -> EngineResult<u64> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock();
        let now = Instant::now();
        session.ensure_active(now)?;

        let mut batch = Batch::new();
        for (entity, generation) in &session.bases {
            batch = batch.expect(Expectation {
                entity: entity.clone(),
                generation: *generation,
            });
        }
        for (consumer_id, allocations) in &session.placements {
            batch = batch.mutate(Mutation::ReplaceAllocations {
                consumer_id: consumer_id.clone(),
                owner: session.owners.get(consumer_id).cloned(),
                allocations: to_items(allocations),
            });
        }

        let global_generation = if batch.mutations.is_empty() {
            self.store.read(|graph| graph.global_generation())?
        } else {
            match self.controller.apply(&batch) {
                Ok(outcome) => outcome.global_generation,
                Err(err) => {
                    warn!(session = %session_id, error = %err, "session commit rejected");
                    return Err(err);
                }
            }
        };
        session.finish(SessionState::Committed, now);
        info!(session = %session_id, global_generation, "session committed");
        Ok(global_generation)
    }

    pub fn rollback(&self, session_id: &str) -> EngineResult<()> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock();
        let now = Instant::now();
        session.ensure_active(now)?;
        session.finish(SessionState::RolledBack, now);
        info!(session = %session_id, "session rolled back");
        Ok(())
    }

    pub fn info(&self, session_id: &str) -> EngineResult<SessionInfo> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock();
        // Surface expiry without failing the lookup.
        let _ = session.ensure_active(Instant::now());
        Ok(SessionInfo {
            session_id: session.id.clone(),
            state: session.state,
            base_generation: session.base_generation,
            deltas: session.deltas.len(),
        })
    }

    /// Expire overdue sessions and purge terminal ones past retention.
    pub fn reap(&self, now: Instant) -> ReapReport {
        let mut report = ReapReport::default();
        let mut purge = Vec::new();
        for (id, handle) in self.sessions.read().iter() {
            let mut session = handle.lock();
            if session.state == SessionState::Active && now >= session.expires_at {
                session.finish(SessionState::Expired, now);
                report.expired += 1;
                info!(session = %id, "session expired");
            }
            if let Some(finished) = session.finished_at
                && now.saturating_duration_since(finished) >= self.settings.retention
            {
                purge.push(id.clone());
            }
        }
        if !purge.is_empty() {
            let mut sessions = self.sessions.write();
            for id in &purge {
                sessions.remove(id);
            }
            report.purged = purge.len();
        }
        report
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
