//! The pluggable resource-source capability set (spec §4.2, §9).
//!
//! A source is a capability set — `{init, modify, allocate, deallocate,
//! available, class_count}` — not a class hierarchy; a minimal polymorphic
//! dispatch (`Box<dyn ResourceSource>`) is all the manager needs.

use crate::error::RuntimeResult;
use crate::quantity::ResourceVector;
use std::collections::HashSet;

/// One accounting module for one or more named resources (spec §4.2).
///
/// Every method is invoked while the [`crate::resources::ResourceManager`]
/// holds its single coarse mutex, so implementations do not need their own
/// interior synchronisation.
pub trait ResourceSource: Send + Sync {
    /// Stable identifier, used only in logs and error messages.
    fn source_name(&self) -> &'static str;

    /// Rewrites a class's requested vector in place — e.g. rounding CPU up
    /// to whole cores, or translating memory into a hugepage count plus a
    /// rounded memory quantity. Sources that don't touch a given resource
    /// leave it untouched.
    fn modify(&self, resources: &mut ResourceVector);

    /// Probes the host, publishes this source's initial availability, and
    /// returns the resource names it manages (for incompatibility checks).
    fn init(&mut self) -> RuntimeResult<HashSet<String>>;

    /// Subtracts the subset of `required` this source manages from its
    /// internal availability. Refuses (without mutating state) if doing so
    /// would drive any managed quantity negative. Returns exactly the
    /// granted subset.
    fn allocate(&mut self, required: &ResourceVector) -> RuntimeResult<ResourceVector>;

    /// Refunds the subset of `required` this source manages. Never refuses.
    /// Returns the names this source touched.
    fn deallocate(&mut self, required: &ResourceVector) -> Vec<String>;

    /// A snapshot of this source's current availability.
    fn available(&self) -> ResourceVector;

    /// `floor(availability / per-instance demand)` for the resources this
    /// source manages, or [`crate::quantity::QUANTITY_COUNT_IGNORE`] if
    /// `class_required` names nothing this source manages.
    fn class_count(&self, class_required: &ResourceVector) -> i64;
}
