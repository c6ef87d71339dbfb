//! The `hugepages` resource source (spec §4.2).
//!
//! Probes the configured hugepage size and total pages, subtracts a blocked
//! count, and publishes both `hugepages` (a page count) and `memory` (pages
//! × page size). `modify` rounds a class's requested memory up to a whole
//! number of pages and records the resulting page count.

use super::source::ResourceSource;
use crate::error::{RuntimeError, RuntimeResult};
use crate::quantity::{Quantity, ResourceVector, QUANTITY_COUNT_IGNORE, RESOURCE_HUGEPAGES, RESOURCE_MEMORY};
use std::collections::HashSet;
use std::path::PathBuf;

pub struct HugepagesSource {
    page_size_bytes: i64,
    blocked_pages: i64,
    available_pages: i64,
    sysfs_root: PathBuf,
}

impl HugepagesSource {
    pub fn new(page_size_bytes: i64, blocked_pages: i64) -> Self {
        Self {
            page_size_bytes,
            blocked_pages,
            available_pages: 0,
            sysfs_root: PathBuf::from("/sys/kernel/mm/hugepages"),
        }
    }

    #[cfg(test)]
    fn with_sysfs_root(mut self, root: PathBuf) -> Self {
        self.sysfs_root = root;
        self
    }

    fn page_dir(&self) -> PathBuf {
        self.sysfs_root
            .join(format!("hugepages-{}kB", self.page_size_bytes / 1024))
    }

    /// Reads `nr_hugepages` from sysfs; 0 if the kernel has none configured
    /// or the path doesn't exist (e.g. a dev box with no hugetlbfs).
    fn probe_total_pages(&self) -> i64 {
        std::fs::read_to_string(self.page_dir().join("nr_hugepages"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }
}

impl ResourceSource for HugepagesSource {
    fn source_name(&self) -> &'static str {
        "hugepages"
    }

    fn modify(&self, resources: &mut ResourceVector) {
        let Some(mem) = resources.get(RESOURCE_MEMORY).copied() else {
            return;
        };
        if self.page_size_bytes <= 0 {
            return;
        }
        let pages = (mem.amount + self.page_size_bytes - 1) / self.page_size_bytes;
        resources.insert(RESOURCE_MEMORY.to_string(), Quantity::bytes(pages * self.page_size_bytes));
        resources.insert(RESOURCE_HUGEPAGES.to_string(), Quantity::count(pages));
    }

    fn init(&mut self) -> RuntimeResult<HashSet<String>> {
        let total = self.probe_total_pages();
        self.available_pages = (total - self.blocked_pages).max(0);
        Ok(HashSet::from([
            RESOURCE_HUGEPAGES.to_string(),
            RESOURCE_MEMORY.to_string(),
        ]))
    }

    fn allocate(&mut self, required: &ResourceVector) -> RuntimeResult<ResourceVector> {
        let Some(req_pages) = required.get(RESOURCE_HUGEPAGES) else {
            return Ok(ResourceVector::new());
        };
        let next = self.available_pages - req_pages.amount;
        if next < 0 {
            return Err(RuntimeError::ResourceExhausted(format!(
                "hugepages: requested {} pages, only {} available",
                req_pages.amount, self.available_pages
            )));
        }
        self.available_pages = next;
        let mut granted = ResourceVector::new();
        granted.insert(RESOURCE_HUGEPAGES.to_string(), *req_pages);
        if let Some(mem) = required.get(RESOURCE_MEMORY) {
            granted.insert(RESOURCE_MEMORY.to_string(), *mem);
        }
        Ok(granted)
    }

    fn deallocate(&mut self, required: &ResourceVector) -> Vec<String> {
        let Some(req_pages) = required.get(RESOURCE_HUGEPAGES) else {
            return Vec::new();
        };
        self.available_pages += req_pages.amount;
        let mut touched = vec![RESOURCE_HUGEPAGES.to_string()];
        if required.contains_key(RESOURCE_MEMORY) {
            touched.push(RESOURCE_MEMORY.to_string());
        }
        touched
    }

    fn available(&self) -> ResourceVector {
        let mut v = ResourceVector::new();
        v.insert(RESOURCE_HUGEPAGES.to_string(), Quantity::count(self.available_pages));
        v.insert(
            RESOURCE_MEMORY.to_string(),
            Quantity::bytes(self.available_pages * self.page_size_bytes),
        );
        v
    }

    fn class_count(&self, class_required: &ResourceVector) -> i64 {
        match class_required.get(RESOURCE_HUGEPAGES) {
            Some(per_instance) => Quantity::count(self.available_pages).floor_div(per_instance),
            None => QUANTITY_COUNT_IGNORE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modify_rounds_memory_up_to_whole_pages() {
        let src = HugepagesSource::new(2 * 1024 * 1024, 0);
        let mut v = ResourceVector::new();
        v.insert(RESOURCE_MEMORY.to_string(), Quantity::bytes(3 * 1024 * 1024));
        src.modify(&mut v);
        assert_eq!(v.get(RESOURCE_HUGEPAGES).unwrap().amount, 2);
        assert_eq!(v.get(RESOURCE_MEMORY).unwrap().amount, 4 * 1024 * 1024);
    }

    #[test]
    fn probe_missing_sysfs_path_yields_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = HugepagesSource::new(2 * 1024 * 1024, 0).with_sysfs_root(dir.path().to_path_buf());
        let names = src.init().unwrap();
        assert!(names.contains(super::RESOURCE_HUGEPAGES));
        assert_eq!(src.available_pages, 0);
    }

    #[test]
    fn blocked_pages_are_subtracted() {
        let dir = tempfile::tempdir().unwrap();
        let page_dir = dir.path().join("hugepages-2048kB");
        std::fs::create_dir_all(&page_dir).unwrap();
        std::fs::write(page_dir.join("nr_hugepages"), "100\n").unwrap();

        let mut src = HugepagesSource::new(2 * 1024 * 1024, 10).with_sysfs_root(dir.path().to_path_buf());
        src.init().unwrap();
        assert_eq!(src.available_pages, 90);
    }
}
