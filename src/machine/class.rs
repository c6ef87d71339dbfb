//! Machine classes (spec §3.4): immutable capability bundles sized to a
//! single guest, with a resource manager-derived `resources` vector and
//! `available` fit count.

use crate::quantity::ResourceVector;
use serde::{Deserialize, Serialize};

/// The capabilities a class declares before resource sources expand them
/// into a concrete [`ResourceVector`] (e.g. the hugepages source turns
/// `memory_bytes` into a page count).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineClassCapabilities {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
    #[serde(default)]
    pub other: ResourceVector,
}

/// A registered machine class. Immutable after registration (spec §3.4);
/// `resources` and `available` are derived and refreshed by the
/// [`crate::resources::ResourceManager`], never edited directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineClass {
    pub name: String,
    pub capabilities: MachineClassCapabilities,
    /// The expanded per-instance resource vector, populated once sources
    /// have run `modify` on `capabilities` during initialisation.
    #[serde(default)]
    pub resources: ResourceVector,
    /// How many more instances of this class currently fit on the host.
    #[serde(default)]
    pub available: i64,
}

impl MachineClass {
    pub fn new(name: impl Into<String>, capabilities: MachineClassCapabilities) -> Self {
        Self {
            name: name.into(),
            capabilities,
            resources: ResourceVector::new(),
            available: 0,
        }
    }
}
