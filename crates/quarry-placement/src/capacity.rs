//! Capacity and usage arithmetic.
//!
//! Available capacity is always `capacity - committed - virtual`, where the
//! virtual term is a signed adjustment coming from a simulation session.
//! Committed queries simply pass an empty [`UsageOverlay`].

use std::collections::BTreeMap;

use quarry_state::{Graph, Inventory};
use serde::Serialize;

use crate::error::{EngineError, EngineResult};

/// Signed usage adjustments per (provider, resource class).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageOverlay {
    adjustments: BTreeMap<(String, String), i64>,
}

impl UsageOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.adjustments.is_empty()
    }

    /// Add `delta` to the pair's adjustment. Fails without changing the
    /// overlay if the running total leaves the `i64` range.
    pub fn adjust(&mut self, provider_id: &str, class: &str, delta: i64) -> EngineResult<()> {
        let key = (provider_id.to_string(), class.to_string());
        let current = self.adjustments.get(&key).copied().unwrap_or(0);
        let total = current.checked_add(delta).ok_or_else(|| {
            EngineError::Validation(format!(
                "usage adjustment for {class} on provider {provider_id} is out of range"
            ))
        })?;
        if total == 0 {
            self.adjustments.remove(&key);
        } else {
            self.adjustments.insert(key, total);
        }
        Ok(())
    }

    /// Record an allocation changing from `old` to `new` units.
    pub fn adjust_between(
        &mut self,
        provider_id: &str,
        class: &str,
        old: u64,
        new: u64,
    ) -> EngineResult<()> {
        let delta = i64::try_from(i128::from(new) - i128::from(old)).map_err(|_| {
            EngineError::Validation(format!(
                "change from {old} to {new} {class} on provider {provider_id} is out of range"
            ))
        })?;
        self.adjust(provider_id, class, delta)
    }

    pub fn get(&self, provider_id: &str, class: &str) -> i64 {
        self.adjustments
            .get(&(provider_id.to_string(), class.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, i64)> {
        self.adjustments
            .iter()
            .map(|((provider, class), delta)| (provider.as_str(), class.as_str(), *delta))
    }
}

/// Usage after applying a signed adjustment, floored at zero.
pub fn effective_usage(committed: u64, adjustment: i64) -> u64 {
    let used = i128::from(committed) + i128::from(adjustment);
    used.clamp(0, i128::from(u64::MAX)) as u64
}

/// Free capacity of `inventory` given committed usage and a virtual adjustment.
pub fn headroom(inventory: &Inventory, committed: u64, adjustment: i64) -> u64 {
    inventory
        .capacity()
        .saturating_sub(effective_usage(committed, adjustment))
}

/// Free capacity of one (provider, class) pair. A class the provider has no
/// inventory of has zero capacity.
pub fn available_capacity(
    graph: &Graph<'_>,
    provider_id: &str,
    class: &str,
    overlay: &UsageOverlay,
) -> EngineResult<u64> {
    let Some(inventory) = graph.inventory(provider_id, class)? else {
        return Ok(0);
    };
    let committed = graph.usage(provider_id, class)?;
    Ok(headroom(
        &inventory,
        committed,
        overlay.get(provider_id, class),
    ))
}

/// Whether `amount` respects the inventory's unit constraints.
pub fn amount_fits_units(inventory: &Inventory, amount: u64) -> bool {
    amount >= inventory.min_unit
        && amount <= inventory.max_unit
        && amount % inventory.step_size == 0
}

/// Validate `amount` against `min_unit`, `max_unit` and `step_size`.
pub fn check_units(inventory: &Inventory, amount: u64) -> EngineResult<()> {
    if amount_fits_units(inventory, amount) {
        return Ok(());
    }
    Err(EngineError::Validation(format!(
        "{amount} {} on provider {} violates min_unit {}, max_unit {}, step_size {}",
        inventory.resource_class,
        inventory.provider_id,
        inventory.min_unit,
        inventory.max_unit,
        inventory.step_size
    )))
}
