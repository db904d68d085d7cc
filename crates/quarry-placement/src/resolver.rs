//! Candidate search.
//!
//! Roots are visited in ascending id order. Each root first runs the root
//! filter chain; survivors get a [`TreeView`] (their subtree plus any
//! sharing providers) and a depth-first search over the request's
//! `(group, class, amount)` slots. The first complete assignment that
//! passes every assignment filter becomes that root's candidate.
//!
//! Work is bounded two ways: roots admitted by the filters count against
//! `max_roots`, and every provider tried at any depth counts against
//! `max_combinations`. Exceeding either aborts the whole search.

use std::collections::{BTreeMap, BTreeSet};

use quarry_state::{Graph, Inventory, ResourceProvider};
use serde::Serialize;
use tracing::{debug, warn};

use crate::capacity::{UsageOverlay, amount_fits_units, effective_usage, headroom};
use crate::constraints::{
    Assignment, AssignmentFilter, GroupState, RootContext, RootFilter, SearchScope,
    default_assignment_filters, default_root_filters, has_all, has_any_each, has_none,
    image_allowed, membership_allowed, tenant_allowed,
};
use crate::error::{EngineError, EngineResult};
use crate::request::{AllocationRequest, IsolationPolicy, RequestGroup, SearchBounds};

// ── Output ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct CandidateAllocation {
    pub provider_id: String,
    pub resource_class: String,
    pub amount: u64,
}

/// The providers chosen for one request group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupAssignment {
    pub label: String,
    pub providers: BTreeSet<String>,
    pub allocations: Vec<CandidateAllocation>,
}

/// One feasible placement, anchored at a root provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub root_id: String,
    pub groups: Vec<GroupAssignment>,
}

impl Candidate {
    /// Allocation items summed per (provider, class), ready to hand to
    /// `replace_allocations`.
    pub fn allocation_items(&self) -> Vec<CandidateAllocation> {
        let mut totals: BTreeMap<(&str, &str), u64> = BTreeMap::new();
        for alloc in self.groups.iter().flat_map(|g| &g.allocations) {
            *totals
                .entry((alloc.provider_id.as_str(), alloc.resource_class.as_str()))
                .or_insert(0) += alloc.amount;
        }
        totals
            .into_iter()
            .map(|((provider_id, class), amount)| CandidateAllocation {
                provider_id: provider_id.to_string(),
                resource_class: class.to_string(),
                amount,
            })
            .collect()
    }

    /// Every provider used by any group.
    pub fn providers(&self) -> BTreeSet<&str> {
        self.groups
            .iter()
            .flat_map(|g| g.providers.iter().map(String::as_str))
            .collect()
    }
}

// ── Tree view ──────────────────────────────────────────────────────

/// Everything the search needs to know about one reachable provider.
#[derive(Debug, Clone)]
pub struct ProviderNode {
    pub provider: ResourceProvider,
    pub traits: BTreeSet<String>,
    pub aggregates: BTreeSet<String>,
    pub inventories: BTreeMap<String, Inventory>,
    /// Committed usage with the overlay applied, per class.
    pub used: BTreeMap<String, u64>,
    /// Self first, root last. Empty for sharing providers.
    pub lineage: Vec<String>,
    /// Classes lent to the tree, for sharing providers only.
    pub shared: Option<BTreeSet<String>>,
    /// Whether the provider may take allocations in this search.
    pub eligible: bool,
}

impl ProviderNode {
    fn load(
        graph: &Graph<'_>,
        provider: ResourceProvider,
        lineage: Vec<String>,
        shared: Option<BTreeSet<String>>,
        eligible: bool,
        overlay: &UsageOverlay,
    ) -> EngineResult<Self> {
        let id = provider.id.clone();
        let inventories = graph.inventories(&id)?;
        let mut used = BTreeMap::new();
        for class in inventories.keys() {
            let committed = graph.usage(&id, class)?;
            used.insert(
                class.clone(),
                effective_usage(committed, overlay.get(&id, class)),
            );
        }
        Ok(Self {
            traits: graph.traits(&id)?,
            aggregates: graph.aggregates(&id)?,
            provider,
            inventories,
            used,
            lineage,
            shared,
            eligible,
        })
    }

    pub fn id(&self) -> &str {
        &self.provider.id
    }

    pub fn is_sharing(&self) -> bool {
        self.shared.is_some()
    }

    /// Free capacity of `class`, zero when there is no such inventory.
    pub fn free(&self, class: &str) -> u64 {
        self.inventories.get(class).map_or(0, |inv| {
            headroom(inv, self.used.get(class).copied().unwrap_or(0), 0)
        })
    }

    /// Whether this provider alone could serve `amount` of `class`.
    fn offers(&self, class: &str, amount: u64) -> bool {
        if let Some(shared) = &self.shared
            && !shared.contains(class)
        {
            return false;
        }
        self.inventories
            .get(class)
            .is_some_and(|inv| amount_fits_units(inv, amount))
            && self.free(class) >= amount
    }

    fn satisfies(&self, group: &RequestGroup) -> bool {
        has_all(&self.traits, &group.required_traits)
            && has_none(&self.traits, &group.forbidden_traits)
            && has_any_each(&self.traits, &group.any_of_traits)
            && membership_allowed(
                &self.aggregates,
                &group.member_of,
                &group.forbidden_aggregates,
            )
    }
}

/// The providers reachable from one root: its whole subtree plus the
/// sharing providers lending to it.
#[derive(Debug, Clone)]
pub struct TreeView {
    pub root_id: String,
    pub nodes: BTreeMap<String, ProviderNode>,
}

impl TreeView {
    pub fn load(
        graph: &Graph<'_>,
        root: &ResourceProvider,
        scope: &SearchScope<'_>,
        overlay: &UsageOverlay,
    ) -> EngineResult<Self> {
        let request = scope.request;
        let in_tree = request.in_tree.as_deref();
        let mut nodes: BTreeMap<String, ProviderNode> = BTreeMap::new();

        // Breadth-first, so every parent is loaded before its children.
        for id in graph.descendants(&root.id)? {
            let provider = graph.require_provider(&id)?;
            let mut lineage = vec![id.clone()];
            if let Some(parent) = &provider.parent_id
                && id != root.id
            {
                let above = nodes.get(parent).ok_or_else(|| {
                    EngineError::Internal(format!(
                        "provider {id} reached before its parent {parent}"
                    ))
                })?;
                lineage.extend(above.lineage.iter().cloned());
            }
            let eligible = !provider.disabled
                && in_tree.is_none_or(|scope_id| lineage.iter().any(|a| a == scope_id));
            let node = ProviderNode::load(graph, provider, lineage, None, eligible, overlay)?;
            nodes.insert(id, node);
        }

        if in_tree.is_none() {
            let mut partners: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            for id in nodes.keys() {
                for partner in graph.sharing_partners(id)? {
                    if !nodes.contains_key(&partner.provider_id) {
                        partners
                            .entry(partner.provider_id)
                            .or_insert(partner.classes);
                    }
                }
            }
            for (id, classes) in partners {
                let provider = graph.require_provider(&id)?;
                if provider.disabled {
                    continue;
                }
                let records = graph.aggregate_records(&id)?;
                let ids: BTreeSet<String> = records.iter().map(|a| a.id.clone()).collect();
                if !membership_allowed(&ids, &request.member_of, &request.forbidden_aggregates)
                    || !tenant_allowed(&records, &request.identity)
                    || !image_allowed(&records, &request.identity)
                {
                    debug!(root = %root.id, partner = %id, "sharing provider excluded");
                    continue;
                }
                let node =
                    ProviderNode::load(graph, provider, Vec::new(), Some(classes), true, overlay)?;
                nodes.insert(id, node);
            }
        }

        Ok(Self {
            root_id: root.id.clone(),
            nodes,
        })
    }

    pub fn node(&self, id: &str) -> Option<&ProviderNode> {
        self.nodes.get(id)
    }

    /// Ancestors-or-self of a tree member, nearest first. `None` for
    /// sharing providers.
    pub fn lineage(&self, id: &str) -> Option<&Vec<String>> {
        self.nodes
            .get(id)
            .filter(|n| !n.is_sharing())
            .map(|n| &n.lineage)
    }

    pub fn has_trait(&self, id: &str, name: &str) -> bool {
        self.nodes.get(id).is_some_and(|n| n.traits.contains(name))
    }

    /// Eligible providers for one slot, ascending by id.
    fn options(&self, slot: &Slot<'_>) -> Vec<&ProviderNode> {
        self.nodes
            .values()
            .filter(|node| node.eligible && node.satisfies(slot.group))
            .filter(|node| match slot.class {
                Some(class) => node.offers(class, slot.amount),
                None => !node.is_sharing(),
            })
            .collect()
    }
}

// ── Search ─────────────────────────────────────────────────────────

/// One provider choice within a tentative assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pick {
    pub label: String,
    /// `None` for the single pick of a resourceless group.
    pub resource_class: Option<String>,
    pub provider_id: String,
    pub amount: u64,
}

struct Slot<'r> {
    group: &'r RequestGroup,
    class: Option<&'r str>,
    amount: u64,
}

fn slots(request: &AllocationRequest) -> Vec<Slot<'_>> {
    let mut out = Vec::new();
    for group in &request.groups {
        if group.is_resourceless() {
            out.push(Slot {
                group,
                class: None,
                amount: 0,
            });
        }
        for (class, amount) in &group.resources {
            out.push(Slot {
                group,
                class: Some(class.as_str()),
                amount: *amount,
            });
        }
    }
    out
}

/// The partial assignment on the search stack, with the tentative
/// consumption it implies.
#[derive(Default)]
struct Tentative {
    picks: Vec<Pick>,
    consumed: BTreeMap<(String, String), u64>,
    /// Numbered group labels served by each provider.
    owners: BTreeMap<String, Vec<String>>,
}

impl Tentative {
    fn admits(&self, slot: &Slot<'_>, node: &ProviderNode, isolate: bool) -> bool {
        if isolate
            && slot.group.is_numbered()
            && let Some(labels) = self.owners.get(node.id())
            && labels.iter().any(|label| *label != slot.group.label)
        {
            return false;
        }
        match slot.class {
            Some(class) => {
                let taken = self
                    .consumed
                    .get(&(node.id().to_string(), class.to_string()))
                    .copied()
                    .unwrap_or(0);
                taken + slot.amount <= node.free(class)
            }
            None => true,
        }
    }

    fn push(&mut self, slot: &Slot<'_>, node: &ProviderNode) {
        let provider_id = node.id().to_string();
        if let Some(class) = slot.class {
            *self
                .consumed
                .entry((provider_id.clone(), class.to_string()))
                .or_insert(0) += slot.amount;
        }
        if slot.group.is_numbered() {
            self.owners
                .entry(provider_id.clone())
                .or_default()
                .push(slot.group.label.clone());
        }
        self.picks.push(Pick {
            label: slot.group.label.clone(),
            resource_class: slot.class.map(String::from),
            provider_id,
            amount: slot.amount,
        });
    }

    fn pop(&mut self) {
        let Some(pick) = self.picks.pop() else {
            return;
        };
        if let Some(class) = &pick.resource_class {
            let key = (pick.provider_id.clone(), class.clone());
            if let Some(taken) = self.consumed.get_mut(&key) {
                *taken -= pick.amount;
                if *taken == 0 {
                    self.consumed.remove(&key);
                }
            }
        }
        if !pick.label.is_empty()
            && let Some(labels) = self.owners.get_mut(&pick.provider_id)
        {
            labels.pop();
            if labels.is_empty() {
                self.owners.remove(&pick.provider_id);
            }
        }
    }
}

enum Verdict {
    Accept,
    Reject,
    RejectRoot,
}

/// Step accounting shared by every root of one search.
struct Budget {
    steps: usize,
    max_steps: usize,
}

impl Budget {
    fn spend(&mut self) -> EngineResult<()> {
        self.steps += 1;
        if self.steps > self.max_steps {
            warn!(max_combinations = self.max_steps, "candidate search exhausted");
            return Err(EngineError::ResourceExhausted(format!(
                "explored more than {} combinations",
                self.max_steps
            )));
        }
        Ok(())
    }
}

/// Runs the root and assignment filter chains and the depth-first search.
pub struct Resolver {
    root_filters: Vec<Box<dyn RootFilter>>,
    assignment_filters: Vec<Box<dyn AssignmentFilter>>,
    bounds: SearchBounds,
    max_server_per_host: u32,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(
            SearchBounds {
                max_roots: 10_000,
                max_combinations: 100_000,
            },
            1,
        )
    }
}

impl Resolver {
    pub fn new(bounds: SearchBounds, max_server_per_host: u32) -> Self {
        Self {
            root_filters: default_root_filters(),
            assignment_filters: default_assignment_filters(),
            bounds,
            max_server_per_host,
        }
    }

    /// Replace both filter chains. Filters run in the order given.
    pub fn with_filters(
        mut self,
        root_filters: Vec<Box<dyn RootFilter>>,
        assignment_filters: Vec<Box<dyn AssignmentFilter>>,
    ) -> Self {
        self.root_filters = root_filters;
        self.assignment_filters = assignment_filters;
        self
    }

    pub fn bounds(&self) -> SearchBounds {
        self.bounds
    }

    /// Check the request against the catalogs and build the search scope.
    pub fn scope<'r>(
        &self,
        graph: &Graph<'_>,
        request: &'r AllocationRequest,
    ) -> EngineResult<SearchScope<'r>> {
        request.validate()?;
        for class in request.resource_classes() {
            if graph.resource_class(class)?.is_none() {
                return Err(EngineError::Validation(format!(
                    "unknown resource class {class}"
                )));
            }
        }
        for name in request.trait_names() {
            if graph.trait_def(name)?.is_none() {
                return Err(EngineError::Validation(format!("unknown trait {name}")));
            }
        }
        let tree_root = match &request.in_tree {
            Some(id) => {
                graph.require_provider(id)?;
                Some(graph.root_of(id)?)
            }
            None => None,
        };
        let group = match &request.server_group {
            Some(placement) => Some(GroupState::load(
                graph,
                placement,
                self.max_server_per_host,
            )?),
            None => None,
        };
        Ok(SearchScope {
            request,
            tree_root,
            group,
        })
    }

    /// Find up to `limit` candidates, one per root, in ascending root order.
    /// An empty result means no root can satisfy the request.
    pub fn resolve(
        &self,
        graph: &Graph<'_>,
        request: &AllocationRequest,
        limit: usize,
        overlay: &UsageOverlay,
    ) -> EngineResult<Vec<Candidate>> {
        let scope = self.scope(graph, request)?;
        let bounds = match request.bounds {
            Some(asked) => SearchBounds {
                max_roots: asked.max_roots.min(self.bounds.max_roots),
                max_combinations: asked.max_combinations.min(self.bounds.max_combinations),
            },
            None => self.bounds,
        };
        let roots = match &scope.tree_root {
            Some(root) => vec![root.clone()],
            None => graph.root_ids()?,
        };

        let mut budget = Budget {
            steps: 0,
            max_steps: bounds.max_combinations,
        };
        let mut explored = 0;
        let mut candidates = Vec::new();
        for root_id in roots {
            if candidates.len() >= limit {
                break;
            }
            let provider = graph.require_provider(&root_id)?;
            let traits = graph.traits(&root_id)?;
            let aggregates = graph.aggregate_records(&root_id)?;
            let context = RootContext {
                provider: &provider,
                traits: &traits,
                aggregates: &aggregates,
            };
            if let Some(filter) = self
                .root_filters
                .iter()
                .find(|f| !f.admit(&context, &scope))
            {
                debug!(root = %root_id, filter = filter.name(), "root rejected");
                continue;
            }
            explored += 1;
            if explored > bounds.max_roots {
                warn!(max_roots = bounds.max_roots, "candidate search exhausted");
                return Err(EngineError::ResourceExhausted(format!(
                    "explored more than {} roots",
                    bounds.max_roots
                )));
            }

            let view = TreeView::load(graph, &provider, &scope, overlay)?;
            match self.search(&view, &scope, &mut budget)? {
                Some(picks) => {
                    debug!(root = %root_id, "candidate found");
                    candidates.push(candidate(&root_id, request, &picks));
                }
                None => debug!(root = %root_id, "no feasible assignment"),
            }
        }
        Ok(candidates)
    }

    fn verdict(&self, assignment: &Assignment<'_>, scope: &SearchScope<'_>) -> Verdict {
        for filter in &self.assignment_filters {
            if !filter.admit(assignment, scope) {
                debug!(
                    root = %assignment.root_id(),
                    filter = filter.name(),
                    "assignment rejected"
                );
                return if filter.root_scoped() {
                    Verdict::RejectRoot
                } else {
                    Verdict::Reject
                };
            }
        }
        Verdict::Accept
    }

    /// Depth-first search over the slots of one tree, in deterministic
    /// order: slots as the request lists them, providers ascending by id.
    fn search(
        &self,
        view: &TreeView,
        scope: &SearchScope<'_>,
        budget: &mut Budget,
    ) -> EngineResult<Option<Vec<Pick>>> {
        let slots = slots(scope.request);
        let options: Vec<Vec<&ProviderNode>> = slots.iter().map(|s| view.options(s)).collect();
        if options.iter().any(Vec::is_empty) {
            return Ok(None);
        }
        let isolate = scope.request.group_policy == IsolationPolicy::Isolate;
        let mut cursor = vec![0usize; slots.len()];
        let mut tentative = Tentative::default();
        let mut depth = 0;

        loop {
            if depth == slots.len() {
                let assignment = Assignment {
                    view,
                    picks: &tentative.picks,
                };
                match self.verdict(&assignment, scope) {
                    Verdict::Accept => return Ok(Some(tentative.picks)),
                    Verdict::RejectRoot => return Ok(None),
                    Verdict::Reject => {}
                }
                depth -= 1;
                tentative.pop();
                cursor[depth] += 1;
                continue;
            }
            if cursor[depth] == options[depth].len() {
                if depth == 0 {
                    return Ok(None);
                }
                cursor[depth] = 0;
                depth -= 1;
                tentative.pop();
                cursor[depth] += 1;
                continue;
            }
            budget.spend()?;
            let node = options[depth][cursor[depth]];
            if tentative.admits(&slots[depth], node, isolate) {
                tentative.push(&slots[depth], node);
                depth += 1;
            } else {
                cursor[depth] += 1;
            }
        }
    }
}

fn candidate(root_id: &str, request: &AllocationRequest, picks: &[Pick]) -> Candidate {
    let groups = request
        .groups
        .iter()
        .map(|group| {
            let mine: Vec<&Pick> = picks.iter().filter(|p| p.label == group.label).collect();
            GroupAssignment {
                label: group.label.clone(),
                providers: mine.iter().map(|p| p.provider_id.clone()).collect(),
                allocations: mine
                    .iter()
                    .filter_map(|p| {
                        p.resource_class.as_ref().map(|class| CandidateAllocation {
                            provider_id: p.provider_id.clone(),
                            resource_class: class.clone(),
                            amount: p.amount,
                        })
                    })
                    .collect(),
            }
        })
        .collect();
    Candidate {
        root_id: root_id.to_string(),
        groups,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_state::{
        Aggregate, Allocation, Consumer, GraphWriter, InventoryRecord, StateResult, StateStore,
        Trait, WriteBatch,
    };

    type Writer<'a> = GraphWriter<'a, WriteBatch>;

    fn build(f: impl FnOnce(&Writer<'_>) -> StateResult<()>) -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        store
            .write(|batch| f(&GraphWriter::new(batch)))
            .unwrap();
        store
    }

    fn provider(w: &Writer<'_>, id: &str, parent: Option<&str>) -> StateResult<()> {
        let rp = ResourceProvider::new(id, id);
        match parent {
            Some(parent) => w.put_provider(&rp.with_parent(parent)),
            None => w.put_provider(&rp),
        }
    }

    fn inventory(w: &Writer<'_>, id: &str, class: &str, total: u64) -> StateResult<()> {
        w.put_inventory(&Inventory::from_record(id, class, &InventoryRecord::new(total)))
    }

    fn traits(w: &Writer<'_>, id: &str, names: &[&str]) -> StateResult<()> {
        for name in names {
            w.put_trait(&Trait {
                name: name.to_string(),
                is_custom: name.starts_with("CUSTOM_"),
            })?;
        }
        w.set_traits(id, &names.iter().map(|s| s.to_string()).collect())
    }

    fn allocate(w: &Writer<'_>, consumer: &str, id: &str, class: &str, used: u64) -> StateResult<()> {
        w.put_consumer(&Consumer {
            id: consumer.into(),
            generation: 1,
            project_id: None,
            user_id: None,
            modified_at: 1,
        })?;
        w.replace_allocations(
            consumer,
            &[Allocation {
                consumer_id: consumer.into(),
                provider_id: id.into(),
                resource_class: class.into(),
                used,
            }],
        )
    }

    fn resolve(store: &StateStore, request: &AllocationRequest) -> EngineResult<Vec<Candidate>> {
        store.read(|graph| Resolver::default().resolve(&graph, request, 10, &UsageOverlay::new()))
    }

    fn roots(candidates: &[Candidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.root_id.as_str()).collect()
    }

    fn vcpu(amount: u64) -> AllocationRequest {
        AllocationRequest::new().group(RequestGroup::new("").resource("VCPU", amount))
    }

    // ── Basic placement ────────────────────────────────────────────

    #[test]
    fn candidates_are_ordered_by_root_and_respect_capacity() {
        let store = build(|w| {
            for id in ["cn3", "cn1", "cn2"] {
                provider(w, id, None)?;
                inventory(w, id, "VCPU", 8)?;
            }
            allocate(w, "vm-1", "cn2", "VCPU", 6)
        });
        let found = resolve(&store, &vcpu(4)).unwrap();
        assert_eq!(roots(&found), vec!["cn1", "cn3"]);
        assert_eq!(
            found[0].allocation_items(),
            vec![CandidateAllocation {
                provider_id: "cn1".into(),
                resource_class: "VCPU".into(),
                amount: 4,
            }]
        );
    }

    #[test]
    fn overlay_consumes_capacity() {
        let store = build(|w| {
            provider(w, "cn1", None)?;
            inventory(w, "cn1", "VCPU", 8)
        });
        let mut overlay = UsageOverlay::new();
        overlay.adjust("cn1", "VCPU", 5).unwrap();
        let found = store
            .read(|graph| Resolver::default().resolve(&graph, &vcpu(4), 10, &overlay))
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn limit_truncates() {
        let store = build(|w| {
            for id in ["cn1", "cn2", "cn3"] {
                provider(w, id, None)?;
                inventory(w, id, "VCPU", 8)?;
            }
            Ok(())
        });
        let found = store
            .read(|graph| Resolver::default().resolve(&graph, &vcpu(1), 2, &UsageOverlay::new()))
            .unwrap();
        assert_eq!(roots(&found), vec!["cn1", "cn2"]);
    }

    #[test]
    fn unknown_class_and_trait_are_validation_errors() {
        let store = build(|w| provider(w, "cn1", None));
        let err = resolve(
            &store,
            &AllocationRequest::new().group(RequestGroup::new("").resource("CUSTOM_NOPE", 1)),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = resolve(
            &store,
            &AllocationRequest::new().group(
                RequestGroup::new("")
                    .resource("VCPU", 1)
                    .required("CUSTOM_MISSING"),
            ),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn unknown_in_tree_is_not_found() {
        let store = build(|w| provider(w, "cn1", None));
        let err = resolve(&store, &vcpu(1).in_tree("ghost")).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    // ── Nested trees ───────────────────────────────────────────────

    fn numa_host(w: &Writer<'_>, id: &str) -> StateResult<()> {
        provider(w, id, None)?;
        inventory(w, id, "DISK_GB", 100)?;
        for numa in 0..2 {
            let numa_id = format!("{id}-numa{numa}");
            provider(w, &numa_id, Some(id))?;
            inventory(w, &numa_id, "VCPU", 4)?;
            traits(w, &numa_id, &["CUSTOM_NUMA"])?;
            let pf_id = format!("{numa_id}-pf");
            provider(w, &pf_id, Some(&numa_id))?;
            inventory(w, &pf_id, "SRIOV_NET_VF", 2)?;
        }
        Ok(())
    }

    #[test]
    fn resources_come_from_different_tree_members() {
        let store = build(|w| numa_host(w, "cn1"));
        let request = AllocationRequest::new().group(
            RequestGroup::new("")
                .resource("VCPU", 2)
                .resource("DISK_GB", 10),
        );
        let found = resolve(&store, &request).unwrap();
        assert_eq!(found.len(), 1);
        let items = found[0].allocation_items();
        assert!(items.contains(&CandidateAllocation {
            provider_id: "cn1".into(),
            resource_class: "DISK_GB".into(),
            amount: 10,
        }));
        assert!(items.contains(&CandidateAllocation {
            provider_id: "cn1-numa0".into(),
            resource_class: "VCPU".into(),
            amount: 2,
        }));
    }

    #[test]
    fn single_class_amount_is_never_split() {
        let store = build(|w| numa_host(w, "cn1"));
        // 6 VCPU fits the host in total but no single NUMA node.
        assert!(resolve(&store, &vcpu(6)).unwrap().is_empty());
    }

    #[test]
    fn groups_sharing_an_inventory_must_fit_together() {
        let store = build(|w| {
            provider(w, "cn1", None)?;
            inventory(w, "cn1", "VCPU", 4)
        });
        let request = AllocationRequest::new()
            .group(RequestGroup::new("1").resource("VCPU", 3))
            .group(RequestGroup::new("2").resource("VCPU", 2));
        assert!(resolve(&store, &request).unwrap().is_empty());
    }

    #[test]
    fn isolate_forces_distinct_providers() {
        let store = build(|w| numa_host(w, "cn1"));
        let request = AllocationRequest::new()
            .group(RequestGroup::new("1").resource("VCPU", 1))
            .group(RequestGroup::new("2").resource("VCPU", 1))
            .policy(IsolationPolicy::Isolate);
        let found = resolve(&store, &request).unwrap();
        assert_eq!(found.len(), 1);
        let g1 = &found[0].groups[0].providers;
        let g2 = &found[0].groups[1].providers;
        assert!(g1.is_disjoint(g2));

        let shared = AllocationRequest {
            group_policy: IsolationPolicy::None,
            ..request
        };
        let found = resolve(&store, &shared).unwrap();
        assert_eq!(found[0].groups[0].providers, found[0].groups[1].providers);
    }

    #[test]
    fn same_subtree_keeps_groups_under_one_provider() {
        let store = build(|w| numa_host(w, "cn1"));
        let request = AllocationRequest::new()
            .group(RequestGroup::new("_CPU").resource("VCPU", 3))
            .group(RequestGroup::new("_NET").resource("SRIOV_NET_VF", 2))
            .group(RequestGroup::new("_NET2").resource("SRIOV_NET_VF", 1))
            .policy(IsolationPolicy::None)
            .same_subtree(["_CPU", "_NET"]);
        let found = resolve(&store, &request).unwrap();
        assert_eq!(found.len(), 1);
        let cpu = found[0].groups[0].providers.iter().next().unwrap().clone();
        let net = found[0].groups[1].providers.iter().next().unwrap().clone();
        assert!(net.starts_with(&cpu));
        // The second VF group is unconstrained and lands on the other PF.
        let net2 = found[0].groups[2].providers.iter().next().unwrap();
        assert_ne!(net2, &net);
    }

    #[test]
    fn topology_trait_requires_common_tier() {
        let store = build(|w| {
            numa_host(w, "cn1")?;
            allocate(w, "vm-1", "cn1-numa0", "VCPU", 2)
        });
        let request = AllocationRequest::new().group(
            RequestGroup::new("_A")
                .resource("VCPU", 4)
                .resource("SRIOV_NET_VF", 2)
                .topology("CUSTOM_NUMA"),
        );
        let found = resolve(&store, &request).unwrap();
        let providers = &found[0].groups[0].providers;
        // Only numa1 has 4 VCPU left, so the VFs must come from its PF.
        assert!(providers.contains("cn1-numa1"));
        assert!(providers.contains("cn1-numa1-pf"));
    }

    #[test]
    fn in_tree_restricts_to_subtree() {
        let store = build(|w| {
            numa_host(w, "cn1")?;
            numa_host(w, "cn2")
        });
        let found = resolve(&store, &vcpu(1).in_tree("cn2-numa1")).unwrap();
        assert_eq!(roots(&found), vec!["cn2"]);
        assert_eq!(
            found[0].groups[0].providers,
            BTreeSet::from(["cn2-numa1".to_string()])
        );
    }

    #[test]
    fn disabled_child_is_skipped() {
        let store = build(|w| {
            numa_host(w, "cn1")?;
            let mut numa0 = w.reader().require_provider("cn1-numa0")?;
            numa0.disabled = true;
            w.put_provider(&numa0)
        });
        let found = resolve(&store, &vcpu(1)).unwrap();
        assert!(found[0].providers().contains("cn1-numa1"));
    }

    // ── Sharing ────────────────────────────────────────────────────

    #[test]
    fn sharing_provider_lends_shared_classes_only() {
        let store = build(|w| {
            provider(w, "cn1", None)?;
            inventory(w, "cn1", "VCPU", 8)?;
            provider(w, "nfs", None)?;
            inventory(w, "nfs", "DISK_GB", 1000)?;
            inventory(w, "nfs", "IPV4_ADDRESS", 10)?;
            w.put_aggregate(&Aggregate::new("agg-storage"))?;
            let agg = BTreeSet::from(["agg-storage".to_string()]);
            w.set_aggregates("cn1", &agg)?;
            w.set_aggregates("nfs", &agg)?;
            w.set_shared_classes("nfs", &BTreeSet::from(["DISK_GB".to_string()]))
        });
        let request = AllocationRequest::new().group(
            RequestGroup::new("")
                .resource("VCPU", 2)
                .resource("DISK_GB", 50),
        );
        let found = resolve(&store, &request).unwrap();
        assert_eq!(roots(&found), vec!["cn1"]);
        assert!(found[0].providers().contains("nfs"));

        let request = AllocationRequest::new().group(
            RequestGroup::new("")
                .resource("VCPU", 2)
                .resource("IPV4_ADDRESS", 1),
        );
        assert!(resolve(&store, &request).unwrap().is_empty());
    }

    // ── Bounds ─────────────────────────────────────────────────────

    #[test]
    fn exceeding_root_bound_is_resource_exhausted() {
        let store = build(|w| {
            for i in 0..5 {
                provider(w, &format!("cn{i}"), None)?;
            }
            Ok(())
        });
        let request = vcpu(1).bounds(SearchBounds {
            max_roots: 3,
            max_combinations: 1000,
        });
        let err = resolve(&store, &request).unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted(_)));
    }

    #[test]
    fn exceeding_combination_bound_is_resource_exhausted() {
        let store = build(|w| numa_host(w, "cn1"));
        let request = AllocationRequest::new()
            .group(RequestGroup::new("1").resource("VCPU", 4))
            .group(RequestGroup::new("2").resource("VCPU", 4))
            .group(RequestGroup::new("3").resource("VCPU", 4))
            .policy(IsolationPolicy::None)
            .bounds(SearchBounds {
                max_roots: 10,
                max_combinations: 4,
            });
        let err = resolve(&store, &request).unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted(_)));
    }

    #[test]
    fn repeated_searches_are_identical() {
        let store = build(|w| {
            numa_host(w, "cn1")?;
            numa_host(w, "cn2")
        });
        let request = AllocationRequest::new()
            .group(RequestGroup::new("1").resource("VCPU", 1))
            .group(RequestGroup::new("2").resource("SRIOV_NET_VF", 1))
            .policy(IsolationPolicy::Isolate);
        let first = resolve(&store, &request).unwrap();
        for _ in 0..5 {
            assert_eq!(resolve(&store, &request).unwrap(), first);
        }
    }
}
