//! Generation-checked atomic mutation batches.
//!
//! Every change to the graph goes through [`ConcurrencyController`]. A
//! [`Batch`] carries the caller's expected generations and a list of
//! [`Mutation`]s; applying it runs in one redb write transaction that
//!
//! 1. compares every expectation with the stored generation,
//! 2. validates and applies the mutations,
//! 3. re-checks capacity on every inventory the batch touched,
//! 4. bumps each touched entity's generation exactly once and stamps it
//!    with the new global generation.
//!
//! Any error aborts the transaction, so a failed batch leaves no trace.
//! Nothing is retried here.

use std::collections::{BTreeMap, BTreeSet};

use quarry_core::naming::{is_custom, validate_name};
use quarry_state::{
    Aggregate, Allocation, Consumer, EntityRef, Graph, GraphWriter, GroupMember, Inventory,
    InventoryRecord, ResourceClass, ResourceProvider, StateStore, WriteBatch,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capacity::check_units;
use crate::error::{EngineError, EngineResult, StaleEntity};

/// The generation a caller believes an entity is at. `None` asserts the
/// entity does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expectation {
    pub entity: EntityRef,
    pub generation: Option<u64>,
}

impl Expectation {
    pub fn provider(id: impl Into<String>, generation: u64) -> Self {
        Self {
            entity: EntityRef::provider(id),
            generation: Some(generation),
        }
    }

    pub fn consumer(id: impl Into<String>, generation: Option<u64>) -> Self {
        Self {
            entity: EntityRef::consumer(id),
            generation,
        }
    }
}

/// One `(provider, class, used)` triple of a consumer's allocation set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationItem {
    pub provider_id: String,
    pub resource_class: String,
    pub used: u64,
}

impl AllocationItem {
    pub fn new(provider_id: impl Into<String>, resource_class: impl Into<String>, used: u64) -> Self {
        Self {
            provider_id: provider_id.into(),
            resource_class: resource_class.into(),
            used,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerOwner {
    pub project_id: Option<String>,
    pub user_id: Option<String>,
}

/// Partial update of a provider record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderUpdate {
    pub name: Option<String>,
    pub disabled: Option<bool>,
    /// `Some(None)` makes the provider a root.
    pub parent: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    CreateProvider {
        provider_id: String,
        name: String,
        parent_id: Option<String>,
    },
    UpdateProvider {
        provider_id: String,
        update: ProviderUpdate,
    },
    DeleteProvider {
        provider_id: String,
    },
    /// Full replacement of a provider's inventory set.
    SetInventory {
        provider_id: String,
        inventories: BTreeMap<String, InventoryRecord>,
    },
    SetTraits {
        provider_id: String,
        traits: BTreeSet<String>,
    },
    SetAggregates {
        provider_id: String,
        aggregates: BTreeSet<String>,
    },
    SetSharing {
        provider_id: String,
        classes: BTreeSet<String>,
    },
    /// Full replacement of a consumer's allocations; empty deletes it.
    ReplaceAllocations {
        consumer_id: String,
        owner: Option<ConsumerOwner>,
        allocations: Vec<AllocationItem>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub expectations: Vec<Expectation>,
    pub mutations: Vec<Mutation>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(mut self, expectation: Expectation) -> Self {
        self.expectations.push(expectation);
        self
    }

    pub fn mutate(mut self, mutation: Mutation) -> Self {
        self.mutations.push(mutation);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub global_generation: u64,
    /// New generation of every touched entity; `None` when it was deleted.
    pub generations: BTreeMap<EntityRef, Option<u64>>,
}

impl BatchOutcome {
    pub fn generation_of(&self, entity: &EntityRef) -> Option<u64> {
        self.generations.get(entity).copied().flatten()
    }
}

/// Identifiers become redb key segments, so `/` is reserved.
pub(crate) fn validate_id(kind: &str, id: &str) -> EngineResult<()> {
    if id.is_empty() || id.len() > 255 || id.contains('/') || id.trim() != id {
        return Err(EngineError::Validation(format!(
            "{kind} id '{id}' must be 1-255 characters without '/' or surrounding whitespace"
        )));
    }
    Ok(())
}

type Writer<'a> = GraphWriter<'a, WriteBatch>;

/// Running bookkeeping for one batch.
#[derive(Default)]
struct Touched {
    entities: BTreeSet<EntityRef>,
    /// Inventories to re-check, with the amount this batch asked of each.
    inventories: BTreeMap<(String, String), u64>,
}

impl Touched {
    fn provider(&mut self, id: &str) {
        self.entities.insert(EntityRef::provider(id));
    }

    fn inventory(&mut self, provider_id: &str, class: &str, requested: u64) {
        *self
            .inventories
            .entry((provider_id.to_string(), class.to_string()))
            .or_insert(0) += requested;
    }
}

#[derive(Clone)]
pub struct ConcurrencyController {
    store: StateStore,
}

impl ConcurrencyController {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Apply `batch` atomically.
    pub fn apply(&self, batch: &Batch) -> EngineResult<BatchOutcome> {
        self.store.write(|txn| {
            let writer = GraphWriter::new(txn);
            let graph = writer.reader();

            let mut stale = Vec::new();
            for expectation in &batch.expectations {
                let actual = graph.version(&expectation.entity)?.map(|v| v.generation);
                if actual != expectation.generation {
                    stale.push(StaleEntity {
                        entity: expectation.entity.clone(),
                        expected: expectation.generation,
                        actual,
                    });
                }
            }
            if !stale.is_empty() {
                warn!(stale = stale.len(), "generation conflict");
                return Err(EngineError::Conflict { stale });
            }

            let next = graph.global_generation()? + 1;
            let mut touched = Touched::default();
            for mutation in &batch.mutations {
                apply_mutation(&writer, mutation, next, &mut touched)?;
            }
            check_capacity(&writer, &touched)?;

            let mut generations = BTreeMap::new();
            for entity in &touched.entities {
                let generation = match entity {
                    EntityRef::Provider(id) => match graph.provider(id)? {
                        Some(mut provider) => {
                            provider.generation += 1;
                            provider.modified_at = next;
                            writer.put_provider(&provider)?;
                            Some(provider.generation)
                        }
                        None => None,
                    },
                    EntityRef::Consumer(id) => match graph.consumer(id)? {
                        Some(mut consumer) => {
                            consumer.generation += 1;
                            consumer.modified_at = next;
                            writer.put_consumer(&consumer)?;
                            Some(consumer.generation)
                        }
                        None => None,
                    },
                };
                generations.insert(entity.clone(), generation);
            }
            writer.set_global_generation(next)?;
            info!(
                global_generation = next,
                touched = generations.len(),
                "batch committed"
            );
            Ok(BatchOutcome {
                global_generation: next,
                generations,
            })
        })
    }

    /// Run a catalog change (traits, classes, aggregates, server groups)
    /// that has no per-entity generation, bumping only the global one.
    pub fn write_catalog<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&Writer<'_>) -> EngineResult<T>,
    {
        self.store.write(|txn| {
            let writer = GraphWriter::new(txn);
            let value = f(&writer)?;
            let next = writer.reader().global_generation()? + 1;
            writer.set_global_generation(next)?;
            debug!(global_generation = next, "catalog change committed");
            Ok(value)
        })
    }
}

fn apply_mutation(
    writer: &Writer<'_>,
    mutation: &Mutation,
    next: u64,
    touched: &mut Touched,
) -> EngineResult<()> {
    let graph = writer.reader();
    match mutation {
        Mutation::CreateProvider {
            provider_id,
            name,
            parent_id,
        } => {
            validate_id("provider", provider_id)?;
            check_provider_name(name)?;
            if graph.provider(provider_id)?.is_some() {
                return Err(EngineError::AlreadyExists(format!(
                    "resource provider {provider_id}"
                )));
            }
            if graph.provider_by_name(name)?.is_some() {
                return Err(EngineError::AlreadyExists(format!(
                    "resource provider named {name}"
                )));
            }
            let mut provider = ResourceProvider::new(provider_id.as_str(), name.as_str());
            if let Some(parent) = parent_id {
                graph.require_provider(parent)?;
                provider.parent_id = Some(parent.clone());
            }
            provider.modified_at = next;
            writer.put_provider(&provider)?;
        }
        Mutation::UpdateProvider {
            provider_id,
            update,
        } => {
            let mut provider = graph.require_provider(provider_id)?;
            if let Some(name) = &update.name {
                check_provider_name(name)?;
                if let Some(other) = graph.provider_by_name(name)?
                    && other.id != provider.id
                {
                    return Err(EngineError::AlreadyExists(format!(
                        "resource provider named {name}"
                    )));
                }
                provider.name = name.clone();
            }
            if let Some(disabled) = update.disabled {
                provider.disabled = disabled;
            }
            if let Some(parent) = &update.parent {
                if let Some(parent_id) = parent {
                    graph.require_provider(parent_id)?;
                    if graph.is_ancestor_or_self(&provider.id, parent_id)? {
                        return Err(EngineError::Validation(format!(
                            "moving {} under {parent_id} would create a loop",
                            provider.id
                        )));
                    }
                }
                provider.parent_id = parent.clone();
            }
            writer.put_provider(&provider)?;
            touched.provider(provider_id);
        }
        Mutation::DeleteProvider { provider_id } => {
            let provider = graph.require_provider(provider_id)?;
            if !graph.children(provider_id)?.is_empty() {
                return Err(EngineError::InUse(format!(
                    "resource provider {provider_id} has children"
                )));
            }
            if graph.has_allocations(provider_id)? {
                return Err(EngineError::InUse(format!(
                    "resource provider {provider_id} has allocations"
                )));
            }
            writer.delete_provider(&provider)?;
            touched.entities.remove(&EntityRef::provider(provider_id));
        }
        Mutation::SetInventory {
            provider_id,
            inventories,
        } => {
            graph.require_provider(provider_id)?;
            let current = graph.inventories(provider_id)?;
            for class in current.keys().filter(|c| !inventories.contains_key(*c)) {
                writer.delete_inventory(provider_id, class)?;
                touched.inventory(provider_id, class, 0);
            }
            for (class, record) in inventories {
                ensure_class(writer, class)?;
                let inventory = Inventory::from_record(provider_id, class, record);
                inventory.check().map_err(|reason| {
                    EngineError::Validation(format!(
                        "inventory {class} on provider {provider_id}: {reason}"
                    ))
                })?;
                writer.put_inventory(&inventory)?;
                touched.inventory(provider_id, class, 0);
            }
            touched.provider(provider_id);
        }
        Mutation::SetTraits {
            provider_id,
            traits,
        } => {
            graph.require_provider(provider_id)?;
            for name in traits {
                if graph.trait_def(name)?.is_none() {
                    return Err(EngineError::NotFound(format!("trait {name}")));
                }
            }
            writer.set_traits(provider_id, traits)?;
            touched.provider(provider_id);
        }
        Mutation::SetAggregates {
            provider_id,
            aggregates,
        } => {
            graph.require_provider(provider_id)?;
            for id in aggregates {
                validate_id("aggregate", id)?;
                if graph.aggregate(id)?.is_none() {
                    writer.put_aggregate(&Aggregate::new(id.as_str()))?;
                }
            }
            writer.set_aggregates(provider_id, aggregates)?;
            touched.provider(provider_id);
        }
        Mutation::SetSharing {
            provider_id,
            classes,
        } => {
            graph.require_provider(provider_id)?;
            for class in classes {
                if graph.resource_class(class)?.is_none() {
                    return Err(EngineError::Validation(format!(
                        "unknown resource class {class}"
                    )));
                }
            }
            writer.set_shared_classes(provider_id, classes)?;
            touched.provider(provider_id);
        }
        Mutation::ReplaceAllocations {
            consumer_id,
            owner,
            allocations,
        } => replace_allocations(writer, consumer_id, owner.as_ref(), allocations, touched)?,
    }
    Ok(())
}

fn replace_allocations(
    writer: &Writer<'_>,
    consumer_id: &str,
    owner: Option<&ConsumerOwner>,
    items: &[AllocationItem],
    touched: &mut Touched,
) -> EngineResult<()> {
    validate_id("consumer", consumer_id)?;
    let graph = writer.reader();

    let mut wanted: BTreeMap<(String, String), u64> = BTreeMap::new();
    for item in items {
        if item.used == 0 {
            return Err(EngineError::Validation(format!(
                "allocation of {} on {} must be at least 1",
                item.resource_class, item.provider_id
            )));
        }
        let key = (item.provider_id.clone(), item.resource_class.clone());
        if wanted.insert(key, item.used).is_some() {
            return Err(EngineError::Validation(format!(
                "duplicate allocation of {} on {}",
                item.resource_class, item.provider_id
            )));
        }
        if graph.provider(&item.provider_id)?.is_none() {
            return Err(EngineError::Validation(format!(
                "allocation references unknown provider {}",
                item.provider_id
            )));
        }
        let inventory = graph
            .inventory(&item.provider_id, &item.resource_class)?
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "provider {} has no inventory of {}",
                    item.provider_id, item.resource_class
                ))
            })?;
        check_units(&inventory, item.used)?;
    }

    let previous: BTreeMap<(String, String), u64> = graph
        .consumer_allocations(consumer_id)?
        .into_iter()
        .map(|a| ((a.provider_id, a.resource_class), a.used))
        .collect();
    let changed: BTreeSet<&String> = previous
        .iter()
        .filter(|(key, used)| wanted.get(*key) != Some(*used))
        .chain(
            wanted
                .iter()
                .filter(|(key, used)| previous.get(*key) != Some(*used)),
        )
        .map(|((provider_id, _), _)| provider_id)
        .collect();
    for provider_id in changed {
        touched.provider(provider_id);
    }
    for ((provider_id, class), used) in &wanted {
        touched.inventory(provider_id, class, *used);
    }

    let allocations: Vec<Allocation> = wanted
        .iter()
        .map(|((provider_id, class), used)| Allocation {
            consumer_id: consumer_id.to_string(),
            provider_id: provider_id.clone(),
            resource_class: class.clone(),
            used: *used,
        })
        .collect();
    writer.replace_allocations(consumer_id, &allocations)?;

    let existing = graph.consumer(consumer_id)?;
    if allocations.is_empty() {
        if let Some(consumer) = &existing {
            writer.delete_consumer(consumer)?;
            debug!(consumer = consumer_id, "consumer removed with its last allocation");
        }
    } else {
        let mut consumer = existing.unwrap_or_else(|| Consumer {
            id: consumer_id.to_string(),
            generation: 0,
            project_id: None,
            user_id: None,
            modified_at: 0,
        });
        if let Some(owner) = owner {
            consumer.project_id = owner.project_id.clone();
            consumer.user_id = owner.user_id.clone();
        }
        writer.put_consumer(&consumer)?;
        touched.entities.insert(EntityRef::consumer(consumer_id));
    }

    if let Some(group_id) = graph.consumer_group(consumer_id)? {
        let host = placement_host(&graph, &allocations)?;
        writer.put_group_member(&GroupMember {
            group_id,
            consumer_id: consumer_id.to_string(),
            host,
        })?;
    }
    Ok(())
}

/// The host a consumer runs on: the smallest root among the providers it
/// draws non-shared resources from.
pub(crate) fn placement_host(
    graph: &Graph<'_>,
    allocations: &[Allocation],
) -> EngineResult<Option<String>> {
    let mut hosts = BTreeSet::new();
    for alloc in allocations {
        if graph
            .shared_classes(&alloc.provider_id)?
            .contains(&alloc.resource_class)
        {
            continue;
        }
        hosts.insert(graph.root_of(&alloc.provider_id)?);
    }
    Ok(hosts.into_iter().next())
}

fn check_capacity(writer: &Writer<'_>, touched: &Touched) -> EngineResult<()> {
    let graph = writer.reader();
    for ((provider_id, class), requested) in &touched.inventories {
        let used = graph.usage(provider_id, class)?;
        match graph.inventory(provider_id, class)? {
            None if used > 0 => {
                return Err(EngineError::InUse(format!(
                    "inventory {class} on provider {provider_id} has {used} allocated"
                )));
            }
            None => {}
            Some(inventory) => {
                let capacity = inventory.capacity();
                if used > capacity {
                    warn!(provider = %provider_id, class = %class, used, capacity, "capacity exceeded");
                    return Err(EngineError::CapacityExceeded {
                        provider_id: provider_id.clone(),
                        resource_class: class.clone(),
                        requested: *requested,
                        used: used.saturating_sub(*requested),
                        capacity,
                        shortfall: used - capacity,
                    });
                }
            }
        }
    }
    Ok(())
}

fn check_provider_name(name: &str) -> EngineResult<()> {
    if name.trim().is_empty() || name.len() > 200 {
        return Err(EngineError::Validation(format!(
            "provider name '{name}' must be 1-200 characters"
        )));
    }
    Ok(())
}

/// Custom classes come into existence on first use; anything else must
/// already be in the catalog.
fn ensure_class(writer: &Writer<'_>, class: &str) -> EngineResult<()> {
    validate_name(class).map_err(|e| EngineError::Validation(e.to_string()))?;
    if writer.reader().resource_class(class)?.is_some() {
        return Ok(());
    }
    if !is_custom(class) {
        return Err(EngineError::Validation(format!(
            "unknown resource class {class}"
        )));
    }
    writer.put_resource_class(&ResourceClass {
        name: class.to_string(),
        is_custom: true,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn controller() -> ConcurrencyController {
        let controller = ConcurrencyController::new(StateStore::open_in_memory().unwrap());
        controller
            .apply(
                &Batch::new()
                    .mutate(Mutation::CreateProvider {
                        provider_id: "cn1".into(),
                        name: "compute-1".into(),
                        parent_id: None,
                    })
                    .mutate(Mutation::SetInventory {
                        provider_id: "cn1".into(),
                        inventories: BTreeMap::from([("VCPU".to_string(), InventoryRecord::new(8))]),
                    }),
            )
            .unwrap();
        controller
    }

    fn generation(controller: &ConcurrencyController, entity: &EntityRef) -> Option<u64> {
        controller
            .store()
            .read(|graph| graph.version(entity))
            .unwrap()
            .map(|v| v.generation)
    }

    fn allocate(consumer: &str, used: u64) -> Mutation {
        Mutation::ReplaceAllocations {
            consumer_id: consumer.into(),
            owner: None,
            allocations: vec![AllocationItem::new("cn1", "VCPU", used)],
        }
    }

    #[test]
    fn new_provider_with_inventory_starts_at_one() {
        let controller = controller();
        assert_eq!(generation(&controller, &EntityRef::provider("cn1")), Some(1));
        let global = controller
            .store()
            .read(|graph| graph.global_generation())
            .unwrap();
        assert_eq!(global, 1);
    }

    #[test]
    fn stale_expectation_is_reported_and_nothing_changes() {
        let controller = controller();
        let err = controller
            .apply(
                &Batch::new()
                    .expect(Expectation::provider("cn1", 0))
                    .mutate(allocate("vm-1", 2)),
            )
            .unwrap_err();
        match &err {
            EngineError::Conflict { stale } => {
                assert_eq!(stale[0].expected, Some(0));
                assert_eq!(stale[0].actual, Some(1));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(generation(&controller, &EntityRef::consumer("vm-1")), None);
    }

    #[test]
    fn allocation_bumps_consumer_and_changed_providers_once() {
        let controller = controller();
        let outcome = controller
            .apply(
                &Batch::new()
                    .expect(Expectation::consumer("vm-1", None))
                    .mutate(allocate("vm-1", 2))
                    .mutate(Mutation::SetTraits {
                        provider_id: "cn1".into(),
                        traits: BTreeSet::new(),
                    }),
            )
            .unwrap();
        assert_eq!(outcome.generation_of(&EntityRef::consumer("vm-1")), Some(1));
        // Touched twice in one batch, bumped once.
        assert_eq!(outcome.generation_of(&EntityRef::provider("cn1")), Some(2));
        assert_eq!(outcome.global_generation, 2);
    }

    #[test]
    fn over_capacity_allocation_fails_atomically() {
        let controller = controller();
        controller.apply(&Batch::new().mutate(allocate("vm-1", 5))).unwrap();
        let err = controller
            .apply(&Batch::new().mutate(allocate("vm-2", 4)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
        match err {
            EngineError::CapacityExceeded {
                requested,
                used,
                capacity,
                shortfall,
                ..
            } => assert_eq!((requested, used, capacity, shortfall), (4, 5, 8, 1)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(generation(&controller, &EntityRef::consumer("vm-2")), None);
        let usage = controller
            .store()
            .read(|graph| graph.usage("cn1", "VCPU"))
            .unwrap();
        assert_eq!(usage, 5);
    }

    #[test]
    fn empty_allocation_set_deletes_consumer() {
        let controller = controller();
        controller.apply(&Batch::new().mutate(allocate("vm-1", 1))).unwrap();
        let outcome = controller
            .apply(&Batch::new().mutate(Mutation::ReplaceAllocations {
                consumer_id: "vm-1".into(),
                owner: None,
                allocations: Vec::new(),
            }))
            .unwrap();
        assert_eq!(outcome.generation_of(&EntityRef::consumer("vm-1")), None);
        assert_eq!(generation(&controller, &EntityRef::consumer("vm-1")), None);
    }

    #[test]
    fn allocation_validation() {
        let controller = controller();
        for items in [
            vec![AllocationItem::new("cn1", "VCPU", 0)],
            vec![AllocationItem::new("cn1", "MEMORY_MB", 1)],
            vec![AllocationItem::new("ghost", "VCPU", 1)],
            vec![
                AllocationItem::new("cn1", "VCPU", 1),
                AllocationItem::new("cn1", "VCPU", 1),
            ],
        ] {
            let err = controller
                .apply(&Batch::new().mutate(Mutation::ReplaceAllocations {
                    consumer_id: "vm-1".into(),
                    owner: None,
                    allocations: items,
                }))
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
    }

    #[test]
    fn removing_used_inventory_is_in_use() {
        let controller = controller();
        controller.apply(&Batch::new().mutate(allocate("vm-1", 1))).unwrap();
        let err = controller
            .apply(&Batch::new().mutate(Mutation::SetInventory {
                provider_id: "cn1".into(),
                inventories: BTreeMap::new(),
            }))
            .unwrap_err();
        assert!(matches!(err, EngineError::InUse(_)));
    }

    #[test]
    fn shrinking_inventory_below_usage_is_capacity_exceeded() {
        let controller = controller();
        controller.apply(&Batch::new().mutate(allocate("vm-1", 6))).unwrap();
        let err = controller
            .apply(&Batch::new().mutate(Mutation::SetInventory {
                provider_id: "cn1".into(),
                inventories: BTreeMap::from([("VCPU".to_string(), InventoryRecord::new(4))]),
            }))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
    }

    #[test]
    fn custom_class_is_created_on_first_use() {
        let controller = controller();
        controller
            .apply(&Batch::new().mutate(Mutation::SetInventory {
                provider_id: "cn1".into(),
                inventories: BTreeMap::from([(
                    "CUSTOM_BAREMETAL_GOLD".to_string(),
                    InventoryRecord::new(1),
                )]),
            }))
            .unwrap();
        let class = controller
            .store()
            .read(|graph| graph.resource_class("CUSTOM_BAREMETAL_GOLD"))
            .unwrap();
        assert_eq!(class.map(|c| c.is_custom), Some(true));
    }

    #[test]
    fn reparent_rejects_loops() {
        let controller = controller();
        controller
            .apply(&Batch::new().mutate(Mutation::CreateProvider {
                provider_id: "numa0".into(),
                name: "cn1-numa0".into(),
                parent_id: Some("cn1".into()),
            }))
            .unwrap();
        let err = controller
            .apply(&Batch::new().mutate(Mutation::UpdateProvider {
                provider_id: "cn1".into(),
                update: ProviderUpdate {
                    parent: Some(Some("numa0".into())),
                    ..ProviderUpdate::default()
                },
            }))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn duplicate_provider_name_is_rejected() {
        let controller = controller();
        let err = controller
            .apply(&Batch::new().mutate(Mutation::CreateProvider {
                provider_id: "cn2".into(),
                name: "compute-1".into(),
                parent_id: None,
            }))
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists(_)));
    }

    #[test]
    fn ids_with_slashes_are_rejected() {
        assert!(validate_id("consumer", "a/b").is_err());
        assert!(validate_id("consumer", "").is_err());
        assert!(validate_id("consumer", " vm").is_err());
        assert!(validate_id("consumer", "vm-1").is_ok());
    }
}
