//! The object envelope shared by every persisted entity (spec §3.1).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata common to every record the [`crate::store::Store`] persists.
///
/// `id` is immutable after create; `created_at` is set exactly once;
/// `resource_version` increases strictly on every successful persisting
/// operation (spec §3.1, §8).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Unix epoch milliseconds of the first successful `Create`.
    pub created_at: i64,
    /// Unix epoch milliseconds of the `Delete` that set this, if any.
    #[serde(default)]
    pub deleted_at: Option<i64>,
    /// Incremented by spec-modifying updates. Distinct from
    /// `resource_version`, which increments on *every* persisting write.
    #[serde(default)]
    pub generation: u64,
    /// Monotonic per-record counter; the single source of truth for
    /// optimistic concurrency (spec §9).
    #[serde(default)]
    pub resource_version: u64,
    /// Ordered set of owner tokens that must be cleared before hard delete.
    #[serde(default)]
    pub finalizers: Vec<String>,
}

impl ObjectMeta {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            created_at: 0,
            deleted_at: None,
            generation: 0,
            resource_version: 0,
            finalizers: Vec::new(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn can_hard_delete(&self) -> bool {
        self.finalizers.is_empty()
    }

    /// Whether `self.labels` satisfies every key/value pair in `selector`.
    /// An empty selector matches everything.
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).map(|lv| lv == v).unwrap_or(false))
    }
}

/// Trait implemented by every type the [`crate::store::Store`] persists:
/// it must expose its envelope, mutably, so the store can stamp
/// `resource_version`/`created_at`/`deleted_at` without caring about the
/// rest of the payload.
pub trait Object: Clone + PartialEq + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static {
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Whether `self`'s spec differs from `previous`'s. [`crate::store::Store::update`]
    /// uses this to decide whether to bump `generation`, which tracks spec
    /// changes only (spec §3.1) and must stay distinct from
    /// `resource_version`, which bumps on every persisting write including a
    /// status-only update. Types with no spec/status split have nothing to
    /// track and can leave this at the default `false`.
    fn spec_changed(&self, _previous: &Self) -> bool {
        false
    }
}
