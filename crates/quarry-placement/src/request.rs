//! Allocation requests and the typed constraint language.
//!
//! Callers either build an [`AllocationRequest`] directly or hand the
//! engine a Placement-style query string, which is parsed here into
//! [`Constraint`] values before anything else sees it:
//!
//! ```text
//! resources=VCPU:2,MEMORY_MB:2048&required=HW_CPU_X86_AVX2,!CUSTOM_SLOW
//! &resources_NET=SRIOV_NET_VF:1&required_NET=in:CUSTOM_PHYSNET_A,CUSTOM_PHYSNET_B
//! &member_of=in:agg-1,agg-2&group_policy=isolate&limit=10
//! ```
//!
//! Keys may carry a group suffix (`resources1`, `required_NET`); the
//! unsuffixed group has the empty label.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use quarry_core::naming::validate_name;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

static SUFFIX_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("^([1-9][0-9]*|_[A-Z0-9_]{1,64})$").expect("group suffix pattern is valid")
});

/// How providers may be shared between numbered groups of one candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationPolicy {
    /// No provider may serve two different numbered groups.
    Isolate,
    /// Providers may be reused freely.
    #[default]
    None,
}

/// Caller-supplied limits on how much work one search may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchBounds {
    pub max_roots: usize,
    pub max_combinations: usize,
}

/// Identity of the caller, supplied by the surrounding auth layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub image_id: Option<String>,
}

/// The server group the workload being placed belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPlacement {
    pub group_id: String,
    /// The consumer being placed; its own current host is ignored.
    pub consumer_id: String,
}

/// One parsed constraint. Group-scoped kinds apply to the group they are
/// attached to; the rest constrain the whole request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    ResourceAmount { class: String, amount: u64 },
    RequiredTrait { name: String },
    ForbiddenTrait { name: String },
    AnyOfTraits { names: BTreeSet<String> },
    AggregateMemberOf { ids: BTreeSet<String> },
    ForbiddenAggregates { ids: BTreeSet<String> },
    TopologyTrait { name: String },
    RootRequiredTrait { name: String },
    RootForbiddenTrait { name: String },
    InTree { provider_id: String },
    SameSubtree { labels: BTreeSet<String> },
    GroupPolicy { policy: IsolationPolicy },
    AvailabilityZone { name: String },
}

impl Constraint {
    fn is_group_scoped(&self) -> bool {
        matches!(
            self,
            Constraint::ResourceAmount { .. }
                | Constraint::RequiredTrait { .. }
                | Constraint::ForbiddenTrait { .. }
                | Constraint::AnyOfTraits { .. }
                | Constraint::AggregateMemberOf { .. }
                | Constraint::ForbiddenAggregates { .. }
                | Constraint::TopologyTrait { .. }
        )
    }
}

/// A set of resources that must be satisfied together, one provider per
/// resource class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestGroup {
    /// Empty for the unnumbered group.
    pub label: String,
    pub resources: BTreeMap<String, u64>,
    pub required_traits: BTreeSet<String>,
    pub forbidden_traits: BTreeSet<String>,
    /// Each set needs at least one of its traits present.
    pub any_of_traits: Vec<BTreeSet<String>>,
    /// Each set needs membership in at least one of its aggregates.
    pub member_of: Vec<BTreeSet<String>>,
    pub forbidden_aggregates: BTreeSet<String>,
    /// Providers in this group must share their nearest ancestor carrying
    /// this trait.
    pub topology_trait: Option<String>,
}

impl RequestGroup {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn resource(mut self, class: impl Into<String>, amount: u64) -> Self {
        self.resources.insert(class.into(), amount);
        self
    }

    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.required_traits.insert(name.into());
        self
    }

    pub fn forbidden(mut self, name: impl Into<String>) -> Self {
        self.forbidden_traits.insert(name.into());
        self
    }

    pub fn any_of<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.any_of_traits
            .push(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn member_of<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.member_of.push(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn topology(mut self, name: impl Into<String>) -> Self {
        self.topology_trait = Some(name.into());
        self
    }

    pub fn is_numbered(&self) -> bool {
        !self.label.is_empty()
    }

    pub fn is_resourceless(&self) -> bool {
        self.resources.is_empty()
    }

    fn apply(&mut self, constraint: Constraint) -> EngineResult<()> {
        match constraint {
            Constraint::ResourceAmount { class, amount } => {
                if self.resources.contains_key(&class) {
                    return Err(EngineError::Validation(format!(
                        "resource class {class} is requested more than once in group '{}'",
                        self.label
                    )));
                }
                self.resources.insert(class, amount);
            }
            Constraint::RequiredTrait { name } => {
                self.required_traits.insert(name);
            }
            Constraint::ForbiddenTrait { name } => {
                self.forbidden_traits.insert(name);
            }
            Constraint::AnyOfTraits { names } => self.any_of_traits.push(names),
            Constraint::AggregateMemberOf { ids } => self.member_of.push(ids),
            Constraint::ForbiddenAggregates { ids } => self.forbidden_aggregates.extend(ids),
            Constraint::TopologyTrait { name } => self.topology_trait = Some(name),
            _ => {}
        }
        Ok(())
    }

    fn trait_names(&self) -> impl Iterator<Item = &String> {
        self.required_traits
            .iter()
            .chain(&self.forbidden_traits)
            .chain(self.any_of_traits.iter().flatten())
            .chain(&self.topology_trait)
    }
}

/// A structured workload request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub groups: Vec<RequestGroup>,
    pub root_required_traits: BTreeSet<String>,
    pub root_forbidden_traits: BTreeSet<String>,
    /// Aggregate clauses for the root and any sharing provider.
    pub member_of: Vec<BTreeSet<String>>,
    pub forbidden_aggregates: BTreeSet<String>,
    pub in_tree: Option<String>,
    /// Each set of group labels must resolve below one common provider.
    pub same_subtree: Vec<BTreeSet<String>>,
    pub group_policy: IsolationPolicy,
    pub availability_zone: Option<String>,
    pub identity: Identity,
    pub server_group: Option<GroupPlacement>,
    pub bounds: Option<SearchBounds>,
}

impl AllocationRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(mut self, group: RequestGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn in_tree(mut self, provider_id: impl Into<String>) -> Self {
        self.in_tree = Some(provider_id.into());
        self
    }

    pub fn policy(mut self, policy: IsolationPolicy) -> Self {
        self.group_policy = policy;
        self
    }

    pub fn same_subtree<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.same_subtree
            .push(labels.into_iter().map(Into::into).collect());
        self
    }

    pub fn member_of<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.member_of.push(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn server_group(mut self, group_id: impl Into<String>, consumer_id: impl Into<String>) -> Self {
        self.server_group = Some(GroupPlacement {
            group_id: group_id.into(),
            consumer_id: consumer_id.into(),
        });
        self
    }

    pub fn bounds(mut self, bounds: SearchBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn group_by_label(&self, label: &str) -> Option<&RequestGroup> {
        self.groups.iter().find(|g| g.label == label)
    }

    /// Every trait name the request mentions, for catalog checks.
    pub fn trait_names(&self) -> BTreeSet<&String> {
        self.groups
            .iter()
            .flat_map(RequestGroup::trait_names)
            .chain(&self.root_required_traits)
            .chain(&self.root_forbidden_traits)
            .collect()
    }

    /// Every resource class the request asks for.
    pub fn resource_classes(&self) -> BTreeSet<&String> {
        self.groups.iter().flat_map(|g| g.resources.keys()).collect()
    }

    /// Assemble a request from labelled constraints. Group-scoped
    /// constraints with the empty label go to the unnumbered group, except
    /// aggregate clauses, which constrain the whole request.
    pub fn from_constraints<I>(constraints: I) -> EngineResult<Self>
    where
        I: IntoIterator<Item = (String, Constraint)>,
    {
        let mut request = AllocationRequest::new();
        let mut groups: BTreeMap<String, RequestGroup> = BTreeMap::new();
        for (label, constraint) in constraints {
            if constraint.is_group_scoped() {
                match constraint {
                    Constraint::AggregateMemberOf { ids } if label.is_empty() => {
                        request.member_of.push(ids)
                    }
                    Constraint::ForbiddenAggregates { ids } if label.is_empty() => {
                        request.forbidden_aggregates.extend(ids)
                    }
                    other => groups
                        .entry(label.clone())
                        .or_insert_with(|| RequestGroup::new(label))
                        .apply(other)?,
                }
                continue;
            }
            if !label.is_empty() {
                return Err(EngineError::Validation(format!(
                    "{constraint:?} cannot be attached to group '{label}'"
                )));
            }
            match constraint {
                Constraint::RootRequiredTrait { name } => {
                    request.root_required_traits.insert(name);
                }
                Constraint::RootForbiddenTrait { name } => {
                    request.root_forbidden_traits.insert(name);
                }
                Constraint::InTree { provider_id } => request.in_tree = Some(provider_id),
                Constraint::SameSubtree { labels } => request.same_subtree.push(labels),
                Constraint::GroupPolicy { policy } => request.group_policy = policy,
                Constraint::AvailabilityZone { name } => request.availability_zone = Some(name),
                _ => {}
            }
        }
        // The unnumbered group, if any, sorts first.
        request.groups = groups.into_values().collect();
        Ok(request)
    }

    /// Parse a Placement-style query string. Returns the request and the
    /// `limit` parameter, if present.
    pub fn parse_query(query: &str) -> EngineResult<(Self, Option<usize>)> {
        let mut constraints = Vec::new();
        let mut limit = None;
        let mut policy_given = false;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                EngineError::Validation(format!("query parameter '{pair}' has no value"))
            })?;
            let value = value.trim();
            match key {
                "limit" => limit = Some(parse_limit(value)?),
                "in_tree" => constraints.push((
                    String::new(),
                    Constraint::InTree {
                        provider_id: nonempty(key, value)?.to_string(),
                    },
                )),
                "group_policy" => {
                    policy_given = true;
                    let policy = match value {
                        "isolate" => IsolationPolicy::Isolate,
                        "none" => IsolationPolicy::None,
                        other => {
                            return Err(EngineError::Validation(format!(
                                "group_policy must be 'isolate' or 'none', got '{other}'"
                            )));
                        }
                    };
                    constraints.push((String::new(), Constraint::GroupPolicy { policy }));
                }
                "same_subtree" => {
                    let labels = split_list(key, value)?;
                    for label in &labels {
                        check_suffix(label)?;
                    }
                    constraints.push((
                        String::new(),
                        Constraint::SameSubtree {
                            labels: labels.into_iter().collect(),
                        },
                    ));
                }
                "root_required" => {
                    for item in split_list(key, value)? {
                        let constraint = match item.strip_prefix('!') {
                            Some(name) => Constraint::RootForbiddenTrait {
                                name: checked_name(name)?,
                            },
                            None => Constraint::RootRequiredTrait {
                                name: checked_name(&item)?,
                            },
                        };
                        constraints.push((String::new(), constraint));
                    }
                }
                "availability_zone" => constraints.push((
                    String::new(),
                    Constraint::AvailabilityZone {
                        name: nonempty(key, value)?.to_string(),
                    },
                )),
                _ => {
                    let (base, label) = split_suffix(key)?;
                    for constraint in parse_group_param(base, value)? {
                        constraints.push((label.to_string(), constraint));
                    }
                }
            }
        }
        let request = Self::from_constraints(constraints)?;
        if request.groups.iter().filter(|g| g.is_numbered()).count() > 1 && !policy_given {
            return Err(EngineError::Validation(
                "group_policy is required when more than one numbered group is requested"
                    .to_string(),
            ));
        }
        request.validate()?;
        Ok((request, limit))
    }

    /// Structural checks that need no access to the graph.
    pub fn validate(&self) -> EngineResult<()> {
        if self.groups.is_empty() {
            return Err(EngineError::Validation(
                "request must contain at least one resource group".to_string(),
            ));
        }
        let mut labels = BTreeSet::new();
        for group in &self.groups {
            if !labels.insert(group.label.as_str()) {
                return Err(EngineError::Validation(format!(
                    "group '{}' appears more than once",
                    group.label
                )));
            }
            if group.is_numbered() {
                check_suffix(&group.label)?;
            }
            for (class, amount) in &group.resources {
                checked_name(class)?;
                if *amount == 0 {
                    return Err(EngineError::Validation(format!(
                        "amount for {class} in group '{}' must be at least 1",
                        group.label
                    )));
                }
            }
            if let Some(name) = group.required_traits.intersection(&group.forbidden_traits).next() {
                return Err(EngineError::Validation(format!(
                    "trait {name} is both required and forbidden in group '{}'",
                    group.label
                )));
            }
            if group.any_of_traits.iter().any(BTreeSet::is_empty)
                || group.member_of.iter().any(BTreeSet::is_empty)
            {
                return Err(EngineError::Validation(format!(
                    "group '{}' has an empty any-of clause",
                    group.label
                )));
            }
            if group.is_resourceless()
                && group.required_traits.is_empty()
                && group.forbidden_traits.is_empty()
                && group.any_of_traits.is_empty()
                && group.member_of.is_empty()
            {
                return Err(EngineError::Validation(format!(
                    "group '{}' requests neither resources nor traits",
                    group.label
                )));
            }
        }
        if self.member_of.iter().any(BTreeSet::is_empty) {
            return Err(EngineError::Validation(
                "member_of has an empty any-of clause".to_string(),
            ));
        }
        for subtree in &self.same_subtree {
            if subtree.is_empty() {
                return Err(EngineError::Validation(
                    "same_subtree must name at least one group".to_string(),
                ));
            }
            if let Some(missing) = subtree.iter().find(|l| !labels.contains(l.as_str())) {
                return Err(EngineError::Validation(format!(
                    "same_subtree names unknown group '{missing}'"
                )));
            }
        }
        if let Some(bounds) = self.bounds
            && (bounds.max_roots == 0 || bounds.max_combinations == 0)
        {
            return Err(EngineError::Validation(
                "search bounds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_group_param(base: &str, value: &str) -> EngineResult<Vec<Constraint>> {
    let mut out = Vec::new();
    match base {
        "resources" => {
            for item in split_list(base, value)? {
                let (class, amount) = item.split_once(':').ok_or_else(|| {
                    EngineError::Validation(format!(
                        "badly formed resources parameter '{item}', expected CLASS:AMOUNT"
                    ))
                })?;
                let amount: u64 = amount.trim().parse().map_err(|_| {
                    EngineError::Validation(format!("amount for {class} must be an integer"))
                })?;
                out.push(Constraint::ResourceAmount {
                    class: checked_name(class.trim())?,
                    amount,
                });
            }
        }
        "required" => match value.strip_prefix("in:") {
            Some(rest) => out.push(Constraint::AnyOfTraits {
                names: split_list(base, rest)?
                    .iter()
                    .map(|n| checked_name(n))
                    .collect::<EngineResult<_>>()?,
            }),
            None => {
                for item in split_list(base, value)? {
                    out.push(match item.strip_prefix('!') {
                        Some(name) => Constraint::ForbiddenTrait {
                            name: checked_name(name)?,
                        },
                        None => Constraint::RequiredTrait {
                            name: checked_name(&item)?,
                        },
                    });
                }
            }
        },
        "member_of" => {
            let (forbidden, rest) = match value.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, value),
            };
            let ids: BTreeSet<String> = match rest.strip_prefix("in:") {
                Some(list) => split_list(base, list)?.into_iter().collect(),
                None if forbidden => split_list(base, rest)?.into_iter().collect(),
                None => BTreeSet::from([nonempty(base, rest)?.to_string()]),
            };
            out.push(if forbidden {
                Constraint::ForbiddenAggregates { ids }
            } else {
                Constraint::AggregateMemberOf { ids }
            });
        }
        "topology" => out.push(Constraint::TopologyTrait {
            name: checked_name(value)?,
        }),
        other => {
            return Err(EngineError::Validation(format!(
                "unknown query parameter '{other}'"
            )));
        }
    }
    Ok(out)
}

fn split_suffix(key: &str) -> EngineResult<(&str, &str)> {
    for base in ["resources", "required", "member_of", "topology"] {
        if let Some(suffix) = key.strip_prefix(base) {
            if !suffix.is_empty() {
                check_suffix(suffix)?;
            }
            return Ok((base, suffix));
        }
    }
    Err(EngineError::Validation(format!(
        "unknown query parameter '{key}'"
    )))
}

fn check_suffix(label: &str) -> EngineResult<()> {
    if SUFFIX_PATTERN.is_match(label) {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "'{label}' is not a valid group suffix"
        )))
    }
}

fn split_list(key: &str, value: &str) -> EngineResult<Vec<String>> {
    let items: Vec<String> = value
        .split(',')
        .map(|s| s.trim().to_string())
        .collect();
    if items.iter().any(String::is_empty) {
        return Err(EngineError::Validation(format!(
            "{key} contains an empty item"
        )));
    }
    Ok(items)
}

fn nonempty<'v>(key: &str, value: &'v str) -> EngineResult<&'v str> {
    if value.is_empty() {
        Err(EngineError::Validation(format!("{key} must not be empty")))
    } else {
        Ok(value)
    }
}

fn checked_name(name: &str) -> EngineResult<String> {
    validate_name(name).map_err(|e| EngineError::Validation(e.to_string()))?;
    Ok(name.to_string())
}

fn parse_limit(value: &str) -> EngineResult<usize> {
    match value.parse::<usize>() {
        Ok(limit) if limit > 0 => Ok(limit),
        _ => Err(EngineError::Validation(format!(
            "limit must be a positive integer, got '{value}'"
        ))),
    }
}
