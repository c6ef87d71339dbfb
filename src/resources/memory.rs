//! The `memory` resource source (spec §4.2).
//!
//! Probes total RAM, subtracts a configured reservation, and publishes the
//! remainder as `memory` (bytes).

use super::source::ResourceSource;
use crate::error::{RuntimeError, RuntimeResult};
use crate::quantity::{Quantity, ResourceVector, QUANTITY_COUNT_IGNORE, RESOURCE_MEMORY};
use std::collections::HashSet;

pub struct MemorySource {
    reserved_bytes: i64,
    available_bytes: i64,
}

impl MemorySource {
    pub fn new(reserved_bytes: i64) -> Self {
        Self {
            reserved_bytes,
            available_bytes: 0,
        }
    }

    /// Total physical RAM in bytes, probed via `sysconf`.
    fn probe_total_bytes() -> i64 {
        #[cfg(target_os = "linux")]
        unsafe {
            let pages = libc::sysconf(libc::_SC_PHYS_PAGES);
            let page_size = libc::sysconf(libc::_SC_PAGESIZE);
            if pages > 0 && page_size > 0 {
                return pages * page_size;
            }
        }
        0
    }
}

impl ResourceSource for MemorySource {
    fn source_name(&self) -> &'static str {
        "memory"
    }

    fn modify(&self, _resources: &mut ResourceVector) {
        // Plain byte quantities need no rewriting; `hugepages` handles the
        // hugepage-backed case.
    }

    fn init(&mut self) -> RuntimeResult<HashSet<String>> {
        let total = Self::probe_total_bytes();
        self.available_bytes = (total - self.reserved_bytes).max(0);
        Ok(HashSet::from([RESOURCE_MEMORY.to_string()]))
    }

    fn allocate(&mut self, required: &ResourceVector) -> RuntimeResult<ResourceVector> {
        let Some(req) = required.get(RESOURCE_MEMORY) else {
            return Ok(ResourceVector::new());
        };
        let next = self.available_bytes - req.amount;
        if next < 0 {
            return Err(RuntimeError::ResourceExhausted(format!(
                "memory: requested {} bytes, only {} available",
                req.amount, self.available_bytes
            )));
        }
        self.available_bytes = next;
        let mut granted = ResourceVector::new();
        granted.insert(RESOURCE_MEMORY.to_string(), *req);
        Ok(granted)
    }

    fn deallocate(&mut self, required: &ResourceVector) -> Vec<String> {
        let Some(req) = required.get(RESOURCE_MEMORY) else {
            return Vec::new();
        };
        self.available_bytes += req.amount;
        vec![RESOURCE_MEMORY.to_string()]
    }

    fn available(&self) -> ResourceVector {
        let mut v = ResourceVector::new();
        v.insert(RESOURCE_MEMORY.to_string(), Quantity::bytes(self.available_bytes));
        v
    }

    fn class_count(&self, class_required: &ResourceVector) -> i64 {
        match class_required.get(RESOURCE_MEMORY) {
            Some(per_instance) => Quantity::bytes(self.available_bytes).floor_div(per_instance),
            None => QUANTITY_COUNT_IGNORE,
        }
    }
}
