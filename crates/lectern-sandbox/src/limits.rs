// src/limits.rs
use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

/// Per-jail resource ceilings, applied as `deny` rctl rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Processes inside the jail (default: 16)
    pub maxproc: u64,
    /// Virtual address space in bytes (default: 2.5 GiB)
    pub vmemoryuse: u64,
    /// Resident memory in bytes (default: 512 MiB)
    pub memoryuse: u64,
    /// Swap in bytes (default: 512 MiB)
    pub swapuse: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            maxproc: 16,
            vmemoryuse: 2560 * MIB,
            memoryuse: 512 * MIB,
            swapuse: 512 * MIB,
        }
    }
}

/// Subject filter matching every rule attached to `jail`.
pub fn rule_prefix(jail: &str) -> String {
    format!("jail:{}:", jail)
}

impl Limits {
    /// One rule string per resource, scoped to `jail`.
    pub fn rules(&self, jail: &str) -> Vec<String> {
        let prefix = rule_prefix(jail);
        [
            ("maxproc", self.maxproc),
            ("vmemoryuse", self.vmemoryuse),
            ("memoryuse", self.memoryuse),
            ("swapuse", self.swapuse),
        ]
        .into_iter()
        .map(|(resource, amount)| format!("{prefix}{resource}:deny={amount}"))
        .collect()
    }
}
