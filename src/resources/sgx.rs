//! The `sgx-per-numa` resource source (spec §4.2), gated behind the `sgx`
//! Cargo feature.
//!
//! Enumerates NUMA cells, reads each cell's SGX-EPC size, and publishes one
//! quantity per cell under `memory.epc.sgx.numa.<N>` plus the aggregate
//! `memory.epc.sgx`. Allocation prefers the cell with the most free EPC
//! unless the request names a specific cell key, in which case it must be
//! satisfied from exactly that cell.

use super::source::ResourceSource;
use crate::error::{RuntimeError, RuntimeResult};
use crate::quantity::{sgx_epc_numa_cell, Quantity, ResourceVector, QUANTITY_COUNT_IGNORE, RESOURCE_SGX_EPC};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

pub struct SgxPerNumaSource {
    /// cell id -> available EPC bytes.
    available: BTreeMap<u32, i64>,
    sysfs_root: PathBuf,
}

impl SgxPerNumaSource {
    pub fn new() -> Self {
        Self {
            available: BTreeMap::new(),
            sysfs_root: PathBuf::from("/sys/devices/system/node"),
        }
    }

    #[cfg(test)]
    fn with_sysfs_root(mut self, root: PathBuf) -> Self {
        self.sysfs_root = root;
        self
    }

    fn probe_cells(&self) -> BTreeMap<u32, i64> {
        let mut cells = BTreeMap::new();
        let Ok(entries) = std::fs::read_dir(&self.sysfs_root) else {
            return cells;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(id_str) = name.strip_prefix("node") else {
                continue;
            };
            let Ok(id) = id_str.parse::<u32>() else {
                continue;
            };
            let epc_path = entry.path().join("x86").join("sgx_total_bytes");
            let bytes = std::fs::read_to_string(epc_path)
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .unwrap_or(0);
            cells.insert(id, bytes);
        }
        cells
    }

    fn total(&self) -> i64 {
        self.available.values().sum()
    }
}

impl Default for SgxPerNumaSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSource for SgxPerNumaSource {
    fn source_name(&self) -> &'static str {
        "sgx-per-numa"
    }

    fn modify(&self, _resources: &mut ResourceVector) {
        // SGX-EPC quantities are requested verbatim; no rounding.
    }

    fn init(&mut self) -> RuntimeResult<HashSet<String>> {
        self.available = self.probe_cells();
        let mut names: HashSet<String> = self
            .available
            .keys()
            .map(|id| sgx_epc_numa_cell(*id))
            .collect();
        names.insert(RESOURCE_SGX_EPC.to_string());
        Ok(names)
    }

    fn allocate(&mut self, required: &ResourceVector) -> RuntimeResult<ResourceVector> {
        // A request naming a specific cell must be satisfied from that cell.
        for (id, bytes) in self.available.clone() {
            let key = sgx_epc_numa_cell(id);
            if let Some(req) = required.get(&key) {
                if req.amount > bytes {
                    return Err(RuntimeError::ResourceExhausted(format!(
                        "sgx epc: cell {id} has {bytes} bytes, requested {}",
                        req.amount
                    )));
                }
            }
        }

        let Some(req) = required.get(RESOURCE_SGX_EPC) else {
            // No aggregate request; still honour any cell-specific keys.
            let mut granted = ResourceVector::new();
            for (id, _) in self.available.clone() {
                let key = sgx_epc_numa_cell(id);
                if let Some(req) = required.get(&key) {
                    *self.available.get_mut(&id).unwrap() -= req.amount;
                    granted.insert(key, *req);
                }
            }
            return Ok(granted);
        };

        // Aggregate request: prefer the cell with the most free EPC.
        let Some((&best_cell, &best_bytes)) = self.available.iter().max_by_key(|(_, v)| **v) else {
            return Err(RuntimeError::ResourceExhausted(
                "sgx epc: no NUMA cells available".into(),
            ));
        };
        if req.amount > best_bytes {
            return Err(RuntimeError::ResourceExhausted(format!(
                "sgx epc: best cell {best_cell} has {best_bytes} bytes, requested {}",
                req.amount
            )));
        }
        *self.available.get_mut(&best_cell).unwrap() -= req.amount;
        let mut granted = ResourceVector::new();
        granted.insert(RESOURCE_SGX_EPC.to_string(), *req);
        granted.insert(sgx_epc_numa_cell(best_cell), *req);
        Ok(granted)
    }

    fn deallocate(&mut self, required: &ResourceVector) -> Vec<String> {
        let mut touched = Vec::new();
        let ids: Vec<u32> = self.available.keys().copied().collect();
        for id in ids {
            let key = sgx_epc_numa_cell(id);
            if let Some(req) = required.get(&key) {
                *self.available.get_mut(&id).unwrap() += req.amount;
                touched.push(key);
            }
        }
        if required.contains_key(RESOURCE_SGX_EPC) {
            touched.push(RESOURCE_SGX_EPC.to_string());
        }
        touched
    }

    fn available(&self) -> ResourceVector {
        let mut v = ResourceVector::new();
        v.insert(RESOURCE_SGX_EPC.to_string(), Quantity::bytes(self.total()));
        for (id, bytes) in &self.available {
            v.insert(sgx_epc_numa_cell(*id), Quantity::bytes(*bytes));
        }
        v
    }

    fn class_count(&self, class_required: &ResourceVector) -> i64 {
        match class_required.get(RESOURCE_SGX_EPC) {
            Some(per_instance) => Quantity::bytes(self.total()).floor_div(per_instance),
            None => QUANTITY_COUNT_IGNORE,
        }
    }
}
