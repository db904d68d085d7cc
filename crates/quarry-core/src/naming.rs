//! Naming rules for resource classes and traits.
//!
//! Both share one alphabet: upper-case ASCII letters, digits and `_`.
//! Operator-defined names carry the `CUSTOM_` prefix; everything else is
//! treated as a standard name.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

pub const CUSTOM_PREFIX: &str = "CUSTOM_";

/// Resource classes present in every store from bootstrap on.
pub const STANDARD_RESOURCE_CLASSES: &[&str] = &[
    "VCPU",
    "MEMORY_MB",
    "DISK_GB",
    "PCI_DEVICE",
    "SRIOV_NET_VF",
    "NUMA_SOCKET",
    "NUMA_CORE",
    "NUMA_THREAD",
    "NUMA_MEMORY_MB",
    "IPV4_ADDRESS",
    "VGPU",
    "VGPU_DISPLAY_HEAD",
    "NET_BW_EGR_KILOBIT_PER_SEC",
    "NET_BW_IGR_KILOBIT_PER_SEC",
    "PCPU",
    "FPGA",
    "MEM_ENCRYPTION_CONTEXT",
];

/// Standard classes that name discrete devices.
pub const DEVICE_RESOURCE_CLASSES: &[&str] =
    &["PCI_DEVICE", "SRIOV_NET_VF", "VGPU", "FPGA"];

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Z0-9_]{1,255}$").expect("name pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("'{0}' must match [A-Z0-9_]+")]
    Malformed(String),

    #[error("'{0}' must start with CUSTOM_")]
    NotCustom(String),
}

pub fn is_custom(name: &str) -> bool {
    name.starts_with(CUSTOM_PREFIX)
}

pub fn is_standard_class(name: &str) -> bool {
    STANDARD_RESOURCE_CLASSES.contains(&name)
}

pub fn is_device_class(name: &str) -> bool {
    DEVICE_RESOURCE_CLASSES.contains(&name) || name.starts_with("CUSTOM_PCI_")
}

/// Validate the shape of a trait or resource class name.
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(NameError::Malformed(name.to_string()))
    }
}

/// Names an operator may create: well-formed and `CUSTOM_`-prefixed.
pub fn validate_custom_name(name: &str) -> Result<(), NameError> {
    validate_name(name)?;
    if is_custom(name) && name.len() > CUSTOM_PREFIX.len() {
        Ok(())
    } else {
        Err(NameError::NotCustom(name.to_string()))
    }
}
