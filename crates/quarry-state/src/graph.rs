//! Resource graph traversal over a [`StorageRead`] handle.
//!
//! Every relationship is an edge table keyed so that the edges leaving a
//! node form one prefix scan. Traversals follow edges only; nothing here
//! walks a whole entity table except [`Graph::root_ids`], which reads the
//! dedicated root index.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{StateError, StateResult};
use crate::storage::{StorageRead, StorageWrite};
use crate::tables::*;
use crate::types::*;

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn edge_key(from: &str, to: &str) -> String {
    format!("{from}/{to}")
}

fn edge_prefix(from: &str) -> String {
    format!("{from}/")
}

/// Providers that lend some of their inventory to another provider through
/// a common aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharingPartner {
    pub provider_id: ProviderId,
    pub classes: BTreeSet<String>,
}

/// Read-only view of the resource graph.
#[derive(Clone, Copy)]
pub struct Graph<'a> {
    storage: &'a dyn StorageRead,
}

impl<'a> Graph<'a> {
    pub fn new(storage: &'a dyn StorageRead) -> Self {
        Self { storage }
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        match self.storage.get(table, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        self.storage
            .scan_prefix(table, prefix)?
            .iter()
            .map(|(_, bytes)| decode(bytes))
            .collect()
    }

    /// Targets of the edges leaving `from`, in ascending order.
    fn edge_targets(&self, table: Table, from: &str) -> StateResult<Vec<String>> {
        let prefix = edge_prefix(from);
        Ok(self
            .storage
            .scan_prefix(table, &prefix)?
            .into_iter()
            .map(|(key, _)| key[prefix.len()..].to_string())
            .collect())
    }

    fn has_edges(&self, table: Table, from: &str) -> StateResult<bool> {
        Ok(!self.storage.scan_prefix(table, &edge_prefix(from))?.is_empty())
    }

    // ── Generations ────────────────────────────────────────────────

    /// Number of write transactions committed so far.
    pub fn global_generation(&self) -> StateResult<u64> {
        Ok(self.get(META, GLOBAL_GENERATION_KEY)?.unwrap_or(0))
    }

    /// Current version of a provider or consumer, `None` if absent.
    pub fn version(&self, entity: &EntityRef) -> StateResult<Option<Version>> {
        Ok(match entity {
            EntityRef::Provider(id) => self.provider(id)?.map(|p| Version {
                generation: p.generation,
                modified_at: p.modified_at,
            }),
            EntityRef::Consumer(id) => self.consumer(id)?.map(|c| Version {
                generation: c.generation,
                modified_at: c.modified_at,
            }),
        })
    }

    // ── Providers & tree ───────────────────────────────────────────

    pub fn provider(&self, id: &str) -> StateResult<Option<ResourceProvider>> {
        self.get(PROVIDERS, id)
    }

    /// Like [`Graph::provider`], failing with `NotFound` when absent.
    pub fn require_provider(&self, id: &str) -> StateResult<ResourceProvider> {
        self.provider(id)?
            .ok_or_else(|| StateError::NotFound(format!("resource provider {id}")))
    }

    pub fn provider_by_name(&self, name: &str) -> StateResult<Option<ResourceProvider>> {
        match self.get::<String>(PROVIDER_NAMES, name)? {
            Some(id) => self.provider(&id),
            None => Ok(None),
        }
    }

    pub fn children(&self, id: &str) -> StateResult<Vec<ProviderId>> {
        self.edge_targets(PROVIDER_CHILDREN, id)
    }

    /// Every root provider id, ascending.
    pub fn root_ids(&self) -> StateResult<Vec<ProviderId>> {
        Ok(self
            .storage
            .scan_prefix(ROOTS, "")?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    /// Ancestors of `id`, nearest first, excluding `id` itself.
    ///
    /// Fails with [`StateError::Inconsistent`] if the parent chain revisits
    /// a provider or points at a provider that does not exist.
    pub fn ancestors(&self, id: &str) -> StateResult<Vec<ProviderId>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        seen.insert(id.to_string());
        let mut current = self.require_provider(id)?;
        while let Some(parent_id) = current.parent_id.take() {
            if !seen.insert(parent_id.clone()) {
                return Err(StateError::Inconsistent(format!(
                    "ancestry of provider {id} loops at {parent_id}"
                )));
            }
            current = self.provider(&parent_id)?.ok_or_else(|| {
                StateError::Inconsistent(format!(
                    "provider {} references missing parent {parent_id}",
                    current.id
                ))
            })?;
            chain.push(parent_id);
        }
        Ok(chain)
    }

    /// Root of the tree containing `id`.
    pub fn root_of(&self, id: &str) -> StateResult<ProviderId> {
        Ok(self
            .ancestors(id)?
            .pop()
            .unwrap_or_else(|| id.to_string()))
    }

    /// `id` and every provider below it, breadth-first.
    pub fn descendants(&self, id: &str) -> StateResult<Vec<ProviderId>> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(next) = queue.pop_front() {
            if !visited.insert(next.clone()) {
                return Err(StateError::Inconsistent(format!(
                    "provider {next} reached twice below {id}"
                )));
            }
            queue.extend(self.children(&next)?);
            order.push(next);
        }
        Ok(order)
    }

    /// True if `ancestor` is `id` or lies on its parent chain.
    pub fn is_ancestor_or_self(&self, ancestor: &str, id: &str) -> StateResult<bool> {
        Ok(ancestor == id || self.ancestors(id)?.iter().any(|a| a == ancestor))
    }

    // ── Inventory & usage ──────────────────────────────────────────

    pub fn inventories(&self, provider_id: &str) -> StateResult<BTreeMap<String, Inventory>> {
        Ok(self
            .scan::<Inventory>(INVENTORIES, &edge_prefix(provider_id))?
            .into_iter()
            .map(|inv| (inv.resource_class.clone(), inv))
            .collect())
    }

    pub fn inventory(&self, provider_id: &str, class: &str) -> StateResult<Option<Inventory>> {
        self.get(INVENTORIES, &edge_key(provider_id, class))
    }

    /// Providers holding inventory of `class`, ascending.
    pub fn class_providers(&self, class: &str) -> StateResult<Vec<ProviderId>> {
        self.edge_targets(CLASS_PROVIDERS, class)
    }

    /// Allocations drawn from one inventory, by consumer.
    pub fn inventory_allocations(
        &self,
        provider_id: &str,
        class: &str,
    ) -> StateResult<BTreeMap<ConsumerId, u64>> {
        let prefix = format!("{provider_id}/{class}/");
        self.storage
            .scan_prefix(INVENTORY_ALLOCATIONS, &prefix)?
            .into_iter()
            .map(|(key, bytes)| Ok((key[prefix.len()..].to_string(), decode(&bytes)?)))
            .collect()
    }

    /// Committed usage of one inventory.
    pub fn usage(&self, provider_id: &str, class: &str) -> StateResult<u64> {
        Ok(self
            .inventory_allocations(provider_id, class)?
            .values()
            .sum())
    }

    /// Committed usage per class for every allocation against a provider.
    pub fn usages(&self, provider_id: &str) -> StateResult<BTreeMap<String, u64>> {
        let mut totals = BTreeMap::new();
        for alloc in self.provider_allocations(provider_id)? {
            *totals.entry(alloc.resource_class).or_insert(0) += alloc.used;
        }
        Ok(totals)
    }

    pub fn provider_allocations(&self, provider_id: &str) -> StateResult<Vec<Allocation>> {
        let prefix = edge_prefix(provider_id);
        self.storage
            .scan_prefix(INVENTORY_ALLOCATIONS, &prefix)?
            .into_iter()
            .map(|(key, bytes)| {
                let rest = &key[prefix.len()..];
                let (class, consumer) = rest.split_once('/').ok_or_else(|| {
                    StateError::Inconsistent(format!("malformed usage key {key}"))
                })?;
                Ok(Allocation {
                    consumer_id: consumer.to_string(),
                    provider_id: provider_id.to_string(),
                    resource_class: class.to_string(),
                    used: decode(&bytes)?,
                })
            })
            .collect()
    }

    pub fn has_allocations(&self, provider_id: &str) -> StateResult<bool> {
        self.has_edges(INVENTORY_ALLOCATIONS, provider_id)
    }

    // ── Catalogs ───────────────────────────────────────────────────

    pub fn resource_class(&self, name: &str) -> StateResult<Option<ResourceClass>> {
        self.get(RESOURCE_CLASSES, name)
    }

    pub fn resource_classes(&self) -> StateResult<Vec<ResourceClass>> {
        self.scan(RESOURCE_CLASSES, "")
    }

    pub fn trait_def(&self, name: &str) -> StateResult<Option<Trait>> {
        self.get(TRAITS, name)
    }

    pub fn trait_defs(&self) -> StateResult<Vec<Trait>> {
        self.scan(TRAITS, "")
    }

    pub fn trait_in_use(&self, name: &str) -> StateResult<bool> {
        self.has_edges(TRAIT_PROVIDERS, name)
    }

    // ── Traits, aggregates, sharing ────────────────────────────────

    pub fn traits(&self, provider_id: &str) -> StateResult<BTreeSet<String>> {
        Ok(self
            .edge_targets(PROVIDER_TRAITS, provider_id)?
            .into_iter()
            .collect())
    }

    pub fn trait_providers(&self, name: &str) -> StateResult<Vec<ProviderId>> {
        self.edge_targets(TRAIT_PROVIDERS, name)
    }

    pub fn aggregate(&self, id: &str) -> StateResult<Option<Aggregate>> {
        self.get(AGGREGATES, id)
    }

    /// Aggregate ids the provider belongs to.
    pub fn aggregates(&self, provider_id: &str) -> StateResult<BTreeSet<String>> {
        Ok(self
            .edge_targets(PROVIDER_AGGREGATES, provider_id)?
            .into_iter()
            .collect())
    }

    /// Aggregate records for the provider's memberships. Memberships of
    /// aggregates without a record are returned with empty attributes.
    pub fn aggregate_records(&self, provider_id: &str) -> StateResult<Vec<Aggregate>> {
        self.aggregates(provider_id)?
            .into_iter()
            .map(|id| Ok(self.aggregate(&id)?.unwrap_or_else(|| Aggregate::new(id))))
            .collect()
    }

    pub fn aggregate_members(&self, aggregate_id: &str) -> StateResult<Vec<ProviderId>> {
        self.edge_targets(AGGREGATE_MEMBERS, aggregate_id)
    }

    /// Resource classes this provider lends to its aggregate peers.
    pub fn shared_classes(&self, provider_id: &str) -> StateResult<BTreeSet<String>> {
        Ok(self.get(SHARED_CLASSES, provider_id)?.unwrap_or_default())
    }

    /// Sharing providers reachable from `provider_id` through a common
    /// aggregate, ascending by id. The provider itself is never included.
    pub fn sharing_partners(&self, provider_id: &str) -> StateResult<Vec<SharingPartner>> {
        let mut partners = BTreeMap::new();
        for aggregate_id in self.aggregates(provider_id)? {
            for member in self.aggregate_members(&aggregate_id)? {
                if member == provider_id || partners.contains_key(&member) {
                    continue;
                }
                let classes = self.shared_classes(&member)?;
                if !classes.is_empty() {
                    partners.insert(member, classes);
                }
            }
        }
        Ok(partners
            .into_iter()
            .map(|(provider_id, classes)| SharingPartner {
                provider_id,
                classes,
            })
            .collect())
    }

    // ── Consumers ──────────────────────────────────────────────────

    pub fn consumer(&self, id: &str) -> StateResult<Option<Consumer>> {
        self.get(CONSUMERS, id)
    }

    pub fn consumer_allocations(&self, consumer_id: &str) -> StateResult<Vec<Allocation>> {
        self.scan(ALLOCATIONS, &edge_prefix(consumer_id))
    }

    pub fn project_consumers(&self, project_id: &str) -> StateResult<Vec<ConsumerId>> {
        self.edge_targets(PROJECT_CONSUMERS, project_id)
    }

    // ── Server groups ──────────────────────────────────────────────

    pub fn server_group(&self, id: &str) -> StateResult<Option<ServerGroup>> {
        self.get(SERVER_GROUPS, id)
    }

    pub fn group_members(&self, group_id: &str) -> StateResult<Vec<GroupMember>> {
        self.scan(GROUP_MEMBERS, &edge_prefix(group_id))
    }

    pub fn consumer_group(&self, consumer_id: &str) -> StateResult<Option<String>> {
        self.get(CONSUMER_GROUPS, consumer_id)
    }
}

/// Mutating counterpart of [`Graph`]. Keeps every edge index consistent
/// with the entity records it writes.
pub struct GraphWriter<'a, W: StorageWrite> {
    storage: &'a W,
}

impl<'a, W: StorageWrite> GraphWriter<'a, W> {
    pub fn new(storage: &'a W) -> Self {
        Self { storage }
    }

    /// Read view that observes this writer's uncommitted changes.
    pub fn reader(&self) -> Graph<'_> {
        Graph::new(self.storage)
    }

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        self.storage.put(table, key, &encode(value)?)
    }

    fn put_edge(&self, table: Table, from: &str, to: &str) -> StateResult<()> {
        self.storage.put(table, &edge_key(from, to), &[])
    }

    fn delete_edge(&self, table: Table, from: &str, to: &str) -> StateResult<bool> {
        self.storage.delete(table, &edge_key(from, to))
    }

    pub fn set_global_generation(&self, generation: u64) -> StateResult<()> {
        self.put(META, GLOBAL_GENERATION_KEY, &generation)
    }

    // ── Providers ──────────────────────────────────────────────────

    /// Write a provider record and reconcile its name and tree indexes with
    /// whatever was stored before.
    pub fn put_provider(&self, provider: &ResourceProvider) -> StateResult<()> {
        let previous = self.reader().provider(&provider.id)?;
        if let Some(old) = &previous {
            if old.name != provider.name {
                self.storage.delete(PROVIDER_NAMES, &old.name)?;
            }
            if old.parent_id != provider.parent_id {
                match &old.parent_id {
                    Some(parent) => {
                        self.delete_edge(PROVIDER_CHILDREN, parent, &old.id)?;
                    }
                    None => {
                        self.storage.delete(ROOTS, &old.id)?;
                    }
                }
            }
        }
        self.put(PROVIDER_NAMES, &provider.name, &provider.id)?;
        match &provider.parent_id {
            Some(parent) => self.put_edge(PROVIDER_CHILDREN, parent, &provider.id)?,
            None => self.storage.put(ROOTS, &provider.id, &[])?,
        }
        self.put(PROVIDERS, &provider.id, provider)
    }

    /// Remove a provider with every edge that leaves it. The caller ensures
    /// it has no children and no allocations.
    pub fn delete_provider(&self, provider: &ResourceProvider) -> StateResult<()> {
        let reader = self.reader();
        for class in reader.inventories(&provider.id)?.into_keys() {
            self.delete_inventory(&provider.id, &class)?;
        }
        self.set_traits(&provider.id, &BTreeSet::new())?;
        self.set_aggregates(&provider.id, &BTreeSet::new())?;
        self.storage.delete(SHARED_CLASSES, &provider.id)?;
        match &provider.parent_id {
            Some(parent) => {
                self.delete_edge(PROVIDER_CHILDREN, parent, &provider.id)?;
            }
            None => {
                self.storage.delete(ROOTS, &provider.id)?;
            }
        }
        self.storage.delete(PROVIDER_NAMES, &provider.name)?;
        self.storage.delete(PROVIDERS, &provider.id)?;
        Ok(())
    }

    // ── Inventory ──────────────────────────────────────────────────

    pub fn put_inventory(&self, inventory: &Inventory) -> StateResult<()> {
        self.put_edge(
            CLASS_PROVIDERS,
            &inventory.resource_class,
            &inventory.provider_id,
        )?;
        self.put(INVENTORIES, &inventory.table_key(), inventory)
    }

    pub fn delete_inventory(&self, provider_id: &str, class: &str) -> StateResult<bool> {
        self.delete_edge(CLASS_PROVIDERS, class, provider_id)?;
        self.storage.delete(INVENTORIES, &edge_key(provider_id, class))
    }

    // ── Catalogs ───────────────────────────────────────────────────

    pub fn put_resource_class(&self, class: &ResourceClass) -> StateResult<()> {
        self.put(RESOURCE_CLASSES, &class.name, class)
    }

    pub fn delete_resource_class(&self, name: &str) -> StateResult<bool> {
        self.storage.delete(RESOURCE_CLASSES, name)
    }

    pub fn put_trait(&self, def: &Trait) -> StateResult<()> {
        self.put(TRAITS, &def.name, def)
    }

    pub fn delete_trait(&self, name: &str) -> StateResult<bool> {
        self.storage.delete(TRAITS, name)
    }

    // ── Memberships ────────────────────────────────────────────────

    /// Replace the provider's trait set.
    pub fn set_traits(&self, provider_id: &str, traits: &BTreeSet<String>) -> StateResult<()> {
        let current = self.reader().traits(provider_id)?;
        for removed in current.difference(traits) {
            self.delete_edge(PROVIDER_TRAITS, provider_id, removed)?;
            self.delete_edge(TRAIT_PROVIDERS, removed, provider_id)?;
        }
        for added in traits.difference(&current) {
            self.put_edge(PROVIDER_TRAITS, provider_id, added)?;
            self.put_edge(TRAIT_PROVIDERS, added, provider_id)?;
        }
        Ok(())
    }

    pub fn put_aggregate(&self, aggregate: &Aggregate) -> StateResult<()> {
        self.put(AGGREGATES, &aggregate.id, aggregate)
    }

    /// Replace the provider's aggregate memberships.
    pub fn set_aggregates(
        &self,
        provider_id: &str,
        aggregates: &BTreeSet<String>,
    ) -> StateResult<()> {
        let current = self.reader().aggregates(provider_id)?;
        for removed in current.difference(aggregates) {
            self.delete_edge(PROVIDER_AGGREGATES, provider_id, removed)?;
            self.delete_edge(AGGREGATE_MEMBERS, removed, provider_id)?;
        }
        for added in aggregates.difference(&current) {
            self.put_edge(PROVIDER_AGGREGATES, provider_id, added)?;
            self.put_edge(AGGREGATE_MEMBERS, added, provider_id)?;
        }
        Ok(())
    }

    pub fn set_shared_classes(
        &self,
        provider_id: &str,
        classes: &BTreeSet<String>,
    ) -> StateResult<()> {
        if classes.is_empty() {
            self.storage.delete(SHARED_CLASSES, provider_id)?;
            Ok(())
        } else {
            self.put(SHARED_CLASSES, provider_id, classes)
        }
    }

    // ── Consumers & allocations ────────────────────────────────────

    pub fn put_consumer(&self, consumer: &Consumer) -> StateResult<()> {
        let previous = self.reader().consumer(&consumer.id)?;
        if let Some(old_project) = previous.and_then(|c| c.project_id)
            && consumer.project_id.as_deref() != Some(old_project.as_str())
        {
            self.delete_edge(PROJECT_CONSUMERS, &old_project, &consumer.id)?;
        }
        if let Some(project) = &consumer.project_id {
            self.put_edge(PROJECT_CONSUMERS, project, &consumer.id)?;
        }
        self.put(CONSUMERS, &consumer.id, consumer)
    }

    pub fn delete_consumer(&self, consumer: &Consumer) -> StateResult<()> {
        if let Some(project) = &consumer.project_id {
            self.delete_edge(PROJECT_CONSUMERS, project, &consumer.id)?;
        }
        self.storage.delete(CONSUMERS, &consumer.id)?;
        Ok(())
    }

    /// Replace every allocation held by `consumer_id`, keeping the usage
    /// index in step.
    pub fn replace_allocations(
        &self,
        consumer_id: &str,
        allocations: &[Allocation],
    ) -> StateResult<()> {
        for old in self.reader().consumer_allocations(consumer_id)? {
            self.storage.delete(
                ALLOCATIONS,
                &format!("{consumer_id}/{}/{}", old.provider_id, old.resource_class),
            )?;
            self.storage.delete(
                INVENTORY_ALLOCATIONS,
                &format!("{}/{}/{consumer_id}", old.provider_id, old.resource_class),
            )?;
        }
        for alloc in allocations {
            self.put(
                ALLOCATIONS,
                &format!("{consumer_id}/{}/{}", alloc.provider_id, alloc.resource_class),
                alloc,
            )?;
            self.put(
                INVENTORY_ALLOCATIONS,
                &format!("{}/{}/{consumer_id}", alloc.provider_id, alloc.resource_class),
                &alloc.used,
            )?;
        }
        Ok(())
    }

    // ── Server groups ──────────────────────────────────────────────

    pub fn put_server_group(&self, group: &ServerGroup) -> StateResult<()> {
        self.put(SERVER_GROUPS, &group.id, group)
    }

    pub fn put_group_member(&self, member: &GroupMember) -> StateResult<()> {
        self.put(CONSUMER_GROUPS, &member.consumer_id, &member.group_id)?;
        self.put(
            GROUP_MEMBERS,
            &edge_key(&member.group_id, &member.consumer_id),
            member,
        )
    }

    pub fn delete_group_member(&self, group_id: &str, consumer_id: &str) -> StateResult<()> {
        self.storage.delete(CONSUMER_GROUPS, consumer_id)?;
        self.delete_edge(GROUP_MEMBERS, group_id, consumer_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateStore;

    fn seed(store: &StateStore) {
        store
            .write(|batch| {
                let writer = GraphWriter::new(batch);
                writer.put_provider(&ResourceProvider::new("cn1", "compute-1"))?;
                writer.put_provider(&ResourceProvider::new("numa0", "compute-1-numa0").with_parent("cn1"))?;
                writer.put_provider(&ResourceProvider::new("numa1", "compute-1-numa1").with_parent("cn1"))?;
                writer.put_provider(&ResourceProvider::new("pf0", "compute-1-numa0-pf0").with_parent("numa0"))?;
                writer.put_provider(&ResourceProvider::new("cn2", "compute-2"))?;
                writer.put_provider(&ResourceProvider::new("nfs", "shared-storage"))?;
                writer.put_inventory(&Inventory::from_record("cn1", "VCPU", &InventoryRecord::new(16)))?;
                writer.put_inventory(&Inventory::from_record("nfs", "DISK_GB", &InventoryRecord::new(2000)))?;
                writer.set_aggregates("cn1", &BTreeSet::from(["agg-a".to_string()]))?;
                writer.set_aggregates("nfs", &BTreeSet::from(["agg-a".to_string()]))?;
                writer.set_shared_classes("nfs", &BTreeSet::from(["DISK_GB".to_string()]))?;
                writer.put_trait(&Trait { name: "HW_CPU_X86_AVX2".into(), is_custom: false })?;
                writer.set_traits("cn1", &BTreeSet::from(["HW_CPU_X86_AVX2".to_string()]))?;
                Ok::<_, StateError>(())
            })
            .unwrap();
    }

    // ── Tree traversal ─────────────────────────────────────────────

    #[test]
    fn roots_are_sorted_and_exclude_children() {
        let store = StateStore::open_in_memory().unwrap();
        seed(&store);
        let snapshot = store.snapshot().unwrap();
        let graph = Graph::new(&snapshot);
        assert_eq!(graph.root_ids().unwrap(), vec!["cn1", "cn2", "nfs"]);
        assert_eq!(graph.children("cn1").unwrap(), vec!["numa0", "numa1"]);
    }

    #[test]
    fn root_and_ancestors_follow_parent_chain() {
        let store = StateStore::open_in_memory().unwrap();
        seed(&store);
        let snapshot = store.snapshot().unwrap();
        let graph = Graph::new(&snapshot);
        assert_eq!(graph.ancestors("pf0").unwrap(), vec!["numa0", "cn1"]);
        assert_eq!(graph.root_of("pf0").unwrap(), "cn1");
        assert_eq!(graph.root_of("cn2").unwrap(), "cn2");
        assert!(graph.is_ancestor_or_self("numa0", "pf0").unwrap());
        assert!(!graph.is_ancestor_or_self("numa1", "pf0").unwrap());
    }

    #[test]
    fn descendants_are_breadth_first() {
        let store = StateStore::open_in_memory().unwrap();
        seed(&store);
        let snapshot = store.snapshot().unwrap();
        let graph = Graph::new(&snapshot);
        assert_eq!(
            graph.descendants("cn1").unwrap(),
            vec!["cn1", "numa0", "numa1", "pf0"]
        );
    }

    #[test]
    fn ancestry_loop_is_reported() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .write(|batch| {
                let writer = GraphWriter::new(batch);
                writer.put_provider(&ResourceProvider::new("a", "a").with_parent("b"))?;
                writer.put_provider(&ResourceProvider::new("b", "b").with_parent("a"))?;
                Ok::<_, StateError>(())
            })
            .unwrap();
        let snapshot = store.snapshot().unwrap();
        let err = Graph::new(&snapshot).root_of("a").unwrap_err();
        assert!(matches!(err, StateError::Inconsistent(_)));
    }

    #[test]
    fn reparent_moves_tree_edges() {
        let store = StateStore::open_in_memory().unwrap();
        seed(&store);
        store
            .write(|batch| {
                let writer = GraphWriter::new(batch);
                let moved = writer.reader().require_provider("cn2")?.with_parent("cn1");
                writer.put_provider(&moved)
            })
            .unwrap();
        let snapshot = store.snapshot().unwrap();
        let graph = Graph::new(&snapshot);
        assert_eq!(graph.root_ids().unwrap(), vec!["cn1", "nfs"]);
        assert_eq!(graph.children("cn1").unwrap(), vec!["cn2", "numa0", "numa1"]);
    }

    // ── Memberships & sharing ──────────────────────────────────────

    #[test]
    fn sharing_partners_through_common_aggregate() {
        let store = StateStore::open_in_memory().unwrap();
        seed(&store);
        let snapshot = store.snapshot().unwrap();
        let graph = Graph::new(&snapshot);
        let partners = graph.sharing_partners("cn1").unwrap();
        assert_eq!(partners.len(), 1);
        assert_eq!(partners[0].provider_id, "nfs");
        assert!(partners[0].classes.contains("DISK_GB"));
        assert!(graph.sharing_partners("cn2").unwrap().is_empty());
    }

    #[test]
    fn trait_edges_are_bidirectional() {
        let store = StateStore::open_in_memory().unwrap();
        seed(&store);
        let snapshot = store.snapshot().unwrap();
        let graph = Graph::new(&snapshot);
        assert!(graph.traits("cn1").unwrap().contains("HW_CPU_X86_AVX2"));
        assert_eq!(graph.trait_providers("HW_CPU_X86_AVX2").unwrap(), vec!["cn1"]);
        assert!(graph.trait_in_use("HW_CPU_X86_AVX2").unwrap());
    }

    // ── Allocations ────────────────────────────────────────────────

    #[test]
    fn allocation_replace_updates_usage_index() {
        let store = StateStore::open_in_memory().unwrap();
        seed(&store);
        let alloc = |used| Allocation {
            consumer_id: "vm-1".into(),
            provider_id: "cn1".into(),
            resource_class: "VCPU".into(),
            used,
        };
        store
            .write(|batch| GraphWriter::new(batch).replace_allocations("vm-1", &[alloc(4)]))
            .unwrap();
        store
            .write(|batch| GraphWriter::new(batch).replace_allocations("vm-1", &[alloc(6)]))
            .unwrap();

        let snapshot = store.snapshot().unwrap();
        let graph = Graph::new(&snapshot);
        assert_eq!(graph.usage("cn1", "VCPU").unwrap(), 6);
        assert_eq!(graph.consumer_allocations("vm-1").unwrap(), vec![alloc(6)]);
        assert_eq!(graph.provider_allocations("cn1").unwrap(), vec![alloc(6)]);
        assert_eq!(graph.usages("cn1").unwrap()["VCPU"], 6);

        store
            .write(|batch| GraphWriter::new(batch).replace_allocations("vm-1", &[]))
            .unwrap();
        let snapshot = store.snapshot().unwrap();
        assert!(!Graph::new(&snapshot).has_allocations("cn1").unwrap());
    }

    #[test]
    fn project_index_follows_consumer_owner() {
        let store = StateStore::open_in_memory().unwrap();
        let mut consumer = Consumer {
            id: "vm-1".into(),
            generation: 1,
            project_id: Some("p1".into()),
            user_id: None,
            modified_at: 1,
        };
        store
            .write(|batch| GraphWriter::new(batch).put_consumer(&consumer))
            .unwrap();
        consumer.project_id = Some("p2".into());
        store
            .write(|batch| GraphWriter::new(batch).put_consumer(&consumer))
            .unwrap();

        let snapshot = store.snapshot().unwrap();
        let graph = Graph::new(&snapshot);
        assert!(graph.project_consumers("p1").unwrap().is_empty());
        assert_eq!(graph.project_consumers("p2").unwrap(), vec!["vm-1"]);
    }
}
