//! Domain types for the Quarry resource graph.
//!
//! Every type here is persisted as JSON in a redb table. Relationship edges
//! (parent/child, trait membership, aggregate membership, consumption) live
//! in their own index tables and are not embedded in these records.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type ProviderId = String;
pub type ConsumerId = String;

// ── Resource providers ─────────────────────────────────────────────

/// A schedulable source of resources. Providers form a forest through
/// `parent_id`; a provider without a parent is a root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceProvider {
    pub id: ProviderId,
    pub name: String,
    pub generation: u64,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub parent_id: Option<ProviderId>,
    /// Global generation of the last write that touched this provider.
    #[serde(default)]
    pub modified_at: u64,
}

impl ResourceProvider {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            generation: 0,
            disabled: false,
            parent_id: None,
            modified_at: 0,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceClass {
    pub name: String,
    pub is_custom: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Trait {
    pub name: String,
    pub is_custom: bool,
}

// ── Inventory ──────────────────────────────────────────────────────

/// Quantities a provider offers for one resource class, without the
/// owning provider and class. This is the shape callers submit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryRecord {
    pub total: u64,
    #[serde(default)]
    pub reserved: u64,
    #[serde(default = "one")]
    pub min_unit: u64,
    /// Defaults to `total` when omitted.
    #[serde(default)]
    pub max_unit: Option<u64>,
    #[serde(default = "one")]
    pub step_size: u64,
    #[serde(default = "unit_ratio")]
    pub allocation_ratio: f64,
}

fn one() -> u64 {
    1
}

fn unit_ratio() -> f64 {
    1.0
}

impl InventoryRecord {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            reserved: 0,
            min_unit: 1,
            max_unit: None,
            step_size: 1,
            allocation_ratio: 1.0,
        }
    }

    pub fn reserved(mut self, reserved: u64) -> Self {
        self.reserved = reserved;
        self
    }

    pub fn ratio(mut self, allocation_ratio: f64) -> Self {
        self.allocation_ratio = allocation_ratio;
        self
    }

    pub fn units(mut self, min_unit: u64, max_unit: u64, step_size: u64) -> Self {
        self.min_unit = min_unit;
        self.max_unit = Some(max_unit);
        self.step_size = step_size;
        self
    }
}

/// A stored inventory record: one per (provider, resource class).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Inventory {
    pub provider_id: ProviderId,
    pub resource_class: String,
    pub total: u64,
    pub reserved: u64,
    pub min_unit: u64,
    pub max_unit: u64,
    pub step_size: u64,
    pub allocation_ratio: f64,
}

impl Inventory {
    pub fn from_record(provider_id: &str, resource_class: &str, record: &InventoryRecord) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            resource_class: resource_class.to_string(),
            total: record.total,
            reserved: record.reserved,
            min_unit: record.min_unit,
            max_unit: record.max_unit.unwrap_or(record.total),
            step_size: record.step_size,
            allocation_ratio: record.allocation_ratio,
        }
    }

    /// `floor((total - reserved) * allocation_ratio)`.
    pub fn capacity(&self) -> u64 {
        let usable = self.total.saturating_sub(self.reserved) as f64;
        (usable * self.allocation_ratio).floor() as u64
    }

    /// Check the record's own invariants, returning a description of the
    /// first violation.
    pub fn check(&self) -> Result<(), String> {
        if self.reserved > self.total {
            return Err(format!(
                "reserved ({}) exceeds total ({})",
                self.reserved, self.total
            ));
        }
        if self.min_unit == 0 {
            return Err("min_unit must be at least 1".to_string());
        }
        if self.min_unit > self.max_unit {
            return Err(format!(
                "min_unit ({}) exceeds max_unit ({})",
                self.min_unit, self.max_unit
            ));
        }
        if self.step_size == 0 {
            return Err("step_size must be at least 1".to_string());
        }
        if !(self.allocation_ratio.is_finite() && self.allocation_ratio > 0.0) {
            return Err(format!(
                "allocation_ratio ({}) must be a positive number",
                self.allocation_ratio
            ));
        }
        Ok(())
    }

    pub fn table_key(&self) -> String {
        format!("{}/{}", self.provider_id, self.resource_class)
    }
}

// ── Aggregates ─────────────────────────────────────────────────────

/// A named grouping of providers. Non-empty allow lists make the aggregate
/// isolating for tenants or images respectively.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Aggregate {
    pub id: String,
    #[serde(default)]
    pub tenant_allow: Vec<String>,
    #[serde(default)]
    pub image_allow: Vec<String>,
    #[serde(default)]
    pub availability_zone: Option<String>,
}

impl Aggregate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

// ── Consumers & allocations ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Consumer {
    pub id: ConsumerId,
    pub generation: u64,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub modified_at: u64,
}

/// Amount of one inventory consumed by one consumer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Allocation {
    pub consumer_id: ConsumerId,
    pub provider_id: ProviderId,
    pub resource_class: String,
    pub used: u64,
}

// ── Server groups ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GroupPolicy {
    Affinity,
    AntiAffinity,
    SoftAffinity,
    SoftAntiAffinity,
}

impl GroupPolicy {
    /// Hard policies filter hosts; soft policies only influence ranking.
    pub fn is_hard(self) -> bool {
        matches!(self, GroupPolicy::Affinity | GroupPolicy::AntiAffinity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerGroup {
    pub id: String,
    pub policy: GroupPolicy,
    /// Per-host member cap for anti-affinity. Falls back to the engine
    /// default when unset.
    #[serde(default)]
    pub max_server_per_host: Option<u32>,
}

/// A consumer's membership in a server group, with the host (root
/// provider) it currently occupies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMember {
    pub group_id: String,
    pub consumer_id: ConsumerId,
    #[serde(default)]
    pub host: Option<ProviderId>,
}

// ── Generation-tracked entities ────────────────────────────────────

/// An entity carrying a generation counter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Provider(ProviderId),
    Consumer(ConsumerId),
}

impl EntityRef {
    pub fn provider(id: impl Into<String>) -> Self {
        EntityRef::Provider(id.into())
    }

    pub fn consumer(id: impl Into<String>) -> Self {
        EntityRef::Consumer(id.into())
    }

    pub fn id(&self) -> &str {
        match self {
            EntityRef::Provider(id) | EntityRef::Consumer(id) => id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Provider(id) => write!(f, "provider {id}"),
            EntityRef::Consumer(id) => write!(f, "consumer {id}"),
        }
    }
}

/// Current version of an entity as seen by a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub generation: u64,
    pub modified_at: u64,
}
