//! redb table definitions for the Quarry resource graph.
//!
//! Each table uses `&str` keys and `&[u8]` values. Entity tables hold
//! JSON-serialized records; edge tables use composite `{a}/{b}` keys so that
//! all edges leaving one node are a single prefix scan. Identifiers must
//! therefore never contain `/`.

use redb::TableDefinition;

/// Definition type shared by every table in the store.
pub type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Provider records keyed by `{provider_id}`.
pub const PROVIDERS: Table = TableDefinition::new("providers");

/// Provider name uniqueness index: `{name}` -> provider id.
pub const PROVIDER_NAMES: Table = TableDefinition::new("provider_names");

/// Parent/child edges keyed by `{parent_id}/{child_id}`.
pub const PROVIDER_CHILDREN: Table = TableDefinition::new("provider_children");

/// Root providers keyed by `{provider_id}`.
pub const ROOTS: Table = TableDefinition::new("roots");

/// Inventory records keyed by `{provider_id}/{resource_class}`.
pub const INVENTORIES: Table = TableDefinition::new("inventories");

/// Reverse inventory index keyed by `{resource_class}/{provider_id}`.
pub const CLASS_PROVIDERS: Table = TableDefinition::new("class_providers");

/// Resource class catalog keyed by `{name}`.
pub const RESOURCE_CLASSES: Table = TableDefinition::new("resource_classes");

/// Trait catalog keyed by `{name}`.
pub const TRAITS: Table = TableDefinition::new("traits");

/// Trait membership keyed by `{provider_id}/{trait}`.
pub const PROVIDER_TRAITS: Table = TableDefinition::new("provider_traits");

/// Reverse trait membership keyed by `{trait}/{provider_id}`.
pub const TRAIT_PROVIDERS: Table = TableDefinition::new("trait_providers");

/// Aggregate records keyed by `{aggregate_id}`.
pub const AGGREGATES: Table = TableDefinition::new("aggregates");

/// Aggregate membership keyed by `{provider_id}/{aggregate_id}`.
pub const PROVIDER_AGGREGATES: Table = TableDefinition::new("provider_aggregates");

/// Reverse aggregate membership keyed by `{aggregate_id}/{provider_id}`.
pub const AGGREGATE_MEMBERS: Table = TableDefinition::new("aggregate_members");

/// Classes a provider shares with its aggregate peers, keyed by `{provider_id}`.
pub const SHARED_CLASSES: Table = TableDefinition::new("shared_classes");

/// Consumer records keyed by `{consumer_id}`.
pub const CONSUMERS: Table = TableDefinition::new("consumers");

/// Allocations keyed by `{consumer_id}/{provider_id}/{resource_class}`.
pub const ALLOCATIONS: Table = TableDefinition::new("allocations");

/// Usage index keyed by `{provider_id}/{resource_class}/{consumer_id}`.
pub const INVENTORY_ALLOCATIONS: Table = TableDefinition::new("inventory_allocations");

/// Project ownership keyed by `{project_id}/{consumer_id}`.
pub const PROJECT_CONSUMERS: Table = TableDefinition::new("project_consumers");

/// Server group records keyed by `{group_id}`.
pub const SERVER_GROUPS: Table = TableDefinition::new("server_groups");

/// Group membership keyed by `{group_id}/{consumer_id}`.
pub const GROUP_MEMBERS: Table = TableDefinition::new("group_members");

/// Reverse group membership: `{consumer_id}` -> group id.
pub const CONSUMER_GROUPS: Table = TableDefinition::new("consumer_groups");

/// Store-wide counters keyed by name.
pub const META: Table = TableDefinition::new("meta");

pub const ALL_TABLES: &[Table] = &[
    PROVIDERS,
    PROVIDER_NAMES,
    PROVIDER_CHILDREN,
    ROOTS,
    INVENTORIES,
    CLASS_PROVIDERS,
    RESOURCE_CLASSES,
    TRAITS,
    PROVIDER_TRAITS,
    TRAIT_PROVIDERS,
    AGGREGATES,
    PROVIDER_AGGREGATES,
    AGGREGATE_MEMBERS,
    SHARED_CLASSES,
    CONSUMERS,
    ALLOCATIONS,
    INVENTORY_ALLOCATIONS,
    PROJECT_CONSUMERS,
    SERVER_GROUPS,
    GROUP_MEMBERS,
    CONSUMER_GROUPS,
    META,
];

/// META key holding the global write generation.
pub const GLOBAL_GENERATION_KEY: &str = "global_generation";
