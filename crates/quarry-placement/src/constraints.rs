//! Hard-constraint predicates and the filter chains built from them.
//!
//! Everything here is pure: predicates look only at the values handed to
//! them. The resolver runs an ordered list of [`RootFilter`]s against each
//! root before touching its subtree, then an ordered list of
//! [`AssignmentFilter`]s against every complete tentative assignment.

use std::collections::{BTreeMap, BTreeSet};

use quarry_state::{Aggregate, Graph, GroupPolicy, ResourceProvider};

use crate::error::{EngineError, EngineResult};
use crate::request::{AllocationRequest, GroupPlacement, Identity, IsolationPolicy};
use crate::resolver::{Pick, TreeView};

// ── Predicates ─────────────────────────────────────────────────────

pub fn has_all(traits: &BTreeSet<String>, required: &BTreeSet<String>) -> bool {
    required.is_subset(traits)
}

pub fn has_none(traits: &BTreeSet<String>, forbidden: &BTreeSet<String>) -> bool {
    traits.is_disjoint(forbidden)
}

/// Every clause has at least one of its names present.
pub fn has_any_each(present: &BTreeSet<String>, clauses: &[BTreeSet<String>]) -> bool {
    clauses.iter().all(|clause| !present.is_disjoint(clause))
}

/// Aggregate membership: every any-of clause matched, nothing forbidden.
pub fn membership_allowed(
    aggregates: &BTreeSet<String>,
    member_of: &[BTreeSet<String>],
    forbidden: &BTreeSet<String>,
) -> bool {
    has_any_each(aggregates, member_of) && has_none(aggregates, forbidden)
}

/// Disjunctive isolation check shared by tenant and image isolation. A
/// provider outside every isolating aggregate is open to all callers.
fn isolation_allows<'a, F>(aggregates: &'a [Aggregate], allow_list: F, caller: Option<&str>) -> bool
where
    F: Fn(&'a Aggregate) -> &'a [String],
{
    let mut isolating = aggregates
        .iter()
        .map(allow_list)
        .filter(|allowed| !allowed.is_empty())
        .peekable();
    if isolating.peek().is_none() {
        return true;
    }
    let Some(caller) = caller else {
        return false;
    };
    isolating.any(|allowed| allowed.iter().any(|a| a == caller))
}

pub fn tenant_allowed(aggregates: &[Aggregate], identity: &Identity) -> bool {
    isolation_allows(
        aggregates,
        |a| a.tenant_allow.as_slice(),
        identity.project_id.as_deref(),
    )
}

pub fn image_allowed(aggregates: &[Aggregate], identity: &Identity) -> bool {
    isolation_allows(
        aggregates,
        |a| a.image_allow.as_slice(),
        identity.image_id.as_deref(),
    )
}

pub fn in_availability_zone(aggregates: &[Aggregate], zone: Option<&str>) -> bool {
    match zone {
        None => true,
        Some(zone) => aggregates
            .iter()
            .any(|a| a.availability_zone.as_deref() == Some(zone)),
    }
}

// ── Server groups ──────────────────────────────────────────────────

/// Where the other members of a server group currently run.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupState {
    pub group_id: String,
    pub policy: GroupPolicy,
    /// Members allowed per host under anti-affinity.
    pub cap: u32,
    /// Host root id to number of members placed on it.
    pub hosts: BTreeMap<String, u32>,
}

impl GroupState {
    /// Load the placement state of `placement.group_id`, ignoring the
    /// consumer being placed.
    pub fn load(graph: &Graph<'_>, placement: &GroupPlacement, default_cap: u32) -> EngineResult<Self> {
        let group = graph.server_group(&placement.group_id)?.ok_or_else(|| {
            EngineError::NotFound(format!("server group {}", placement.group_id))
        })?;
        let mut hosts = BTreeMap::new();
        for member in graph.group_members(&group.id)? {
            if member.consumer_id == placement.consumer_id {
                continue;
            }
            if let Some(host) = member.host {
                *hosts.entry(host).or_insert(0) += 1;
            }
        }
        Ok(Self {
            group_id: group.id,
            policy: group.policy,
            cap: group.max_server_per_host.unwrap_or(default_cap).max(1),
            hosts,
        })
    }

    pub fn members_on(&self, root_id: &str) -> u32 {
        self.hosts.get(root_id).copied().unwrap_or(0)
    }

    /// Whether a new member may land on `root_id`. Soft policies never
    /// exclude a host.
    pub fn admits(&self, root_id: &str) -> bool {
        match self.policy {
            GroupPolicy::Affinity => match self.hosts.len() {
                0 => true,
                1 => self.hosts.contains_key(root_id),
                _ => false,
            },
            GroupPolicy::AntiAffinity => self.members_on(root_id) < self.cap,
            GroupPolicy::SoftAffinity | GroupPolicy::SoftAntiAffinity => true,
        }
    }
}

// ── Filter contexts ────────────────────────────────────────────────

/// Request-wide inputs every filter may consult.
pub struct SearchScope<'a> {
    pub request: &'a AllocationRequest,
    /// Root of the `in_tree` provider, when the request is tree scoped.
    pub tree_root: Option<String>,
    pub group: Option<GroupState>,
}

/// What root filters see of a root provider.
pub struct RootContext<'a> {
    pub provider: &'a ResourceProvider,
    pub traits: &'a BTreeSet<String>,
    pub aggregates: &'a [Aggregate],
}

/// A complete tentative assignment within one root's tree.
pub struct Assignment<'a> {
    pub view: &'a TreeView,
    pub picks: &'a [Pick],
}

impl Assignment<'_> {
    pub fn root_id(&self) -> &str {
        &self.view.root_id
    }

    /// Providers picked for the group with `label`.
    pub fn providers_for(&self, label: &str) -> BTreeSet<&str> {
        self.picks
            .iter()
            .filter(|p| p.label == label)
            .map(|p| p.provider_id.as_str())
            .collect()
    }
}

// ── Root filters ───────────────────────────────────────────────────

pub trait RootFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn admit(&self, root: &RootContext<'_>, scope: &SearchScope<'_>) -> bool;
}

pub struct DisabledFilter;

impl RootFilter for DisabledFilter {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn admit(&self, root: &RootContext<'_>, _: &SearchScope<'_>) -> bool {
        !root.provider.disabled
    }
}

pub struct TreeScopeFilter;

impl RootFilter for TreeScopeFilter {
    fn name(&self) -> &'static str {
        "tree_scope"
    }

    fn admit(&self, root: &RootContext<'_>, scope: &SearchScope<'_>) -> bool {
        scope
            .tree_root
            .as_deref()
            .is_none_or(|tree_root| tree_root == root.provider.id)
    }
}

pub struct AvailabilityZoneFilter;

impl RootFilter for AvailabilityZoneFilter {
    fn name(&self) -> &'static str {
        "availability_zone"
    }

    fn admit(&self, root: &RootContext<'_>, scope: &SearchScope<'_>) -> bool {
        in_availability_zone(root.aggregates, scope.request.availability_zone.as_deref())
    }
}

pub struct AggregateMembershipFilter;

impl RootFilter for AggregateMembershipFilter {
    fn name(&self) -> &'static str {
        "aggregate_membership"
    }

    /// Sharing providers are held to the same clauses when the tree is
    /// assembled.
    fn admit(&self, root: &RootContext<'_>, scope: &SearchScope<'_>) -> bool {
        let ids: BTreeSet<String> = root.aggregates.iter().map(|a| a.id.clone()).collect();
        membership_allowed(
            &ids,
            &scope.request.member_of,
            &scope.request.forbidden_aggregates,
        )
    }
}

pub struct TenantIsolationFilter;

impl RootFilter for TenantIsolationFilter {
    fn name(&self) -> &'static str {
        "tenant_isolation"
    }

    fn admit(&self, root: &RootContext<'_>, scope: &SearchScope<'_>) -> bool {
        tenant_allowed(root.aggregates, &scope.request.identity)
    }
}

pub struct ImageIsolationFilter;

impl RootFilter for ImageIsolationFilter {
    fn name(&self) -> &'static str {
        "image_isolation"
    }

    fn admit(&self, root: &RootContext<'_>, scope: &SearchScope<'_>) -> bool {
        image_allowed(root.aggregates, &scope.request.identity)
    }
}

pub struct RootTraitsFilter;

impl RootFilter for RootTraitsFilter {
    fn name(&self) -> &'static str {
        "root_traits"
    }

    fn admit(&self, root: &RootContext<'_>, scope: &SearchScope<'_>) -> bool {
        has_all(root.traits, &scope.request.root_required_traits)
            && has_none(root.traits, &scope.request.root_forbidden_traits)
    }
}

/// Root filters in evaluation order, cheapest first.
pub fn default_root_filters() -> Vec<Box<dyn RootFilter>> {
    vec![
        Box::new(DisabledFilter),
        Box::new(TreeScopeFilter),
        Box::new(AvailabilityZoneFilter),
        Box::new(AggregateMembershipFilter),
        Box::new(TenantIsolationFilter),
        Box::new(ImageIsolationFilter),
        Box::new(RootTraitsFilter),
    ]
}

// ── Assignment filters ─────────────────────────────────────────────

pub trait AssignmentFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// A root-scoped filter depends only on the root, so one rejection
    /// rules out every other assignment under the same root.
    fn root_scoped(&self) -> bool {
        false
    }

    fn admit(&self, assignment: &Assignment<'_>, scope: &SearchScope<'_>) -> bool;
}

/// `group_policy=isolate`: no provider serves two numbered groups.
pub struct GroupIsolationFilter;

impl AssignmentFilter for GroupIsolationFilter {
    fn name(&self) -> &'static str {
        "group_isolation"
    }

    fn admit(&self, assignment: &Assignment<'_>, scope: &SearchScope<'_>) -> bool {
        if scope.request.group_policy != IsolationPolicy::Isolate {
            return true;
        }
        let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
        for pick in assignment.picks.iter().filter(|p| !p.label.is_empty()) {
            match owners.insert(pick.provider_id.as_str(), pick.label.as_str()) {
                Some(previous) if previous != pick.label => return false,
                _ => {}
            }
        }
        true
    }
}

/// Every `same_subtree` set resolves below one picked provider.
pub struct SameSubtreeFilter;

impl AssignmentFilter for SameSubtreeFilter {
    fn name(&self) -> &'static str {
        "same_subtree"
    }

    fn admit(&self, assignment: &Assignment<'_>, scope: &SearchScope<'_>) -> bool {
        scope.request.same_subtree.iter().all(|labels| {
            let providers: BTreeSet<&str> = labels
                .iter()
                .flat_map(|label| assignment.providers_for(label))
                .collect();
            let lineages: Option<Vec<&Vec<String>>> = providers
                .iter()
                .map(|id| assignment.view.lineage(id))
                .collect();
            let Some(lineages) = lineages else {
                // Sharing providers sit outside the tree.
                return false;
            };
            providers.iter().any(|anchor| {
                lineages
                    .iter()
                    .all(|lineage| lineage.iter().any(|id| id.as_str() == *anchor))
            })
        })
    }
}

/// Providers within a group share their nearest ancestor carrying the
/// group's topology trait.
pub struct TopologyFilter;

impl AssignmentFilter for TopologyFilter {
    fn name(&self) -> &'static str {
        "topology"
    }

    fn admit(&self, assignment: &Assignment<'_>, scope: &SearchScope<'_>) -> bool {
        scope.request.groups.iter().all(|group| {
            let Some(tier) = &group.topology_trait else {
                return true;
            };
            let mut anchor: Option<&str> = None;
            for provider_id in assignment.providers_for(&group.label) {
                let Some(lineage) = assignment.view.lineage(provider_id) else {
                    continue;
                };
                let Some(nearest) = lineage
                    .iter()
                    .map(String::as_str)
                    .find(|id| assignment.view.has_trait(id, tier))
                else {
                    return false;
                };
                match anchor {
                    Some(existing) if existing != nearest => return false,
                    _ => anchor = Some(nearest),
                }
            }
            true
        })
    }
}

/// Hard affinity and anti-affinity against the request's server group.
pub struct ServerGroupFilter;

impl AssignmentFilter for ServerGroupFilter {
    fn name(&self) -> &'static str {
        "server_group"
    }

    fn root_scoped(&self) -> bool {
        true
    }

    fn admit(&self, assignment: &Assignment<'_>, scope: &SearchScope<'_>) -> bool {
        scope
            .group
            .as_ref()
            .is_none_or(|group| group.admits(assignment.root_id()))
    }
}

pub fn default_assignment_filters() -> Vec<Box<dyn AssignmentFilter>> {
    vec![
        Box::new(GroupIsolationFilter),
        Box::new(SameSubtreeFilter),
        Box::new(TopologyFilter),
        Box::new(ServerGroupFilter),
    ]
}
