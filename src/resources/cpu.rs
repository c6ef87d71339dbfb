//! The `cpu` resource source (spec §4.2).
//!
//! Probes logical core count, multiplies by an overcommit factor, and
//! publishes the result in milliCPUs. `modify` rounds a class's requested
//! CPU up to a whole number of cores, matching the granularity at which the
//! hypervisor actually pins vCPUs.

use super::source::ResourceSource;
use crate::error::{RuntimeError, RuntimeResult};
use crate::quantity::{Quantity, ResourceVector, QUANTITY_COUNT_IGNORE, RESOURCE_CPU};
use std::collections::HashSet;

const MILLI_PER_CORE: i64 = 1000;

pub struct CpuSource {
    overcommit_factor: f64,
    available_millis: i64,
}

impl CpuSource {
    /// `overcommit_factor` must be `> 0` (validated by the CLI layer, spec
    /// §10.3); a value of `1.0` means no overcommit.
    pub fn new(overcommit_factor: f64) -> Self {
        Self {
            overcommit_factor,
            available_millis: 0,
        }
    }
}

impl ResourceSource for CpuSource {
    fn source_name(&self) -> &'static str {
        "cpu"
    }

    fn modify(&self, resources: &mut ResourceVector) {
        if let Some(q) = resources.get_mut(RESOURCE_CPU) {
            let rounded = round_up(q.amount, MILLI_PER_CORE);
            *q = Quantity::milli_cpu(rounded);
        }
    }

    fn init(&mut self) -> RuntimeResult<HashSet<String>> {
        let cores = num_cpus::get() as i64;
        self.available_millis = ((cores as f64) * self.overcommit_factor * MILLI_PER_CORE as f64) as i64;
        Ok(HashSet::from([RESOURCE_CPU.to_string()]))
    }

    fn allocate(&mut self, required: &ResourceVector) -> RuntimeResult<ResourceVector> {
        let Some(req) = required.get(RESOURCE_CPU) else {
            return Ok(ResourceVector::new());
        };
        let next = self.available_millis - req.amount;
        if next < 0 {
            return Err(RuntimeError::ResourceExhausted(format!(
                "cpu: requested {}m, only {}m available",
                req.amount, self.available_millis
            )));
        }
        self.available_millis = next;
        let mut granted = ResourceVector::new();
        granted.insert(RESOURCE_CPU.to_string(), *req);
        Ok(granted)
    }

    fn deallocate(&mut self, required: &ResourceVector) -> Vec<String> {
        let Some(req) = required.get(RESOURCE_CPU) else {
            return Vec::new();
        };
        self.available_millis += req.amount;
        vec![RESOURCE_CPU.to_string()]
    }

    fn available(&self) -> ResourceVector {
        let mut v = ResourceVector::new();
        v.insert(RESOURCE_CPU.to_string(), Quantity::milli_cpu(self.available_millis));
        v
    }

    fn class_count(&self, class_required: &ResourceVector) -> i64 {
        match class_required.get(RESOURCE_CPU) {
            Some(per_instance) => Quantity::milli_cpu(self.available_millis).floor_div(per_instance),
            None => QUANTITY_COUNT_IGNORE,
        }
    }
}

fn round_up(amount: i64, multiple: i64) -> i64 {
    if multiple <= 0 {
        return amount;
    }
    ((amount + multiple - 1) / multiple) * multiple
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modify_rounds_up_to_whole_cores() {
        let src = CpuSource::new(1.0);
        let mut v = ResourceVector::new();
        v.insert(RESOURCE_CPU.to_string(), Quantity::milli_cpu(2500));
        src.modify(&mut v);
        assert_eq!(v.get(RESOURCE_CPU).unwrap().amount, 3000);
    }

    #[test]
    fn allocate_refuses_when_it_would_go_negative() {
        let mut src = CpuSource::new(1.0);
        src.available_millis = 1000;
        let mut req = ResourceVector::new();
        req.insert(RESOURCE_CPU.to_string(), Quantity::milli_cpu(2000));
        assert!(src.allocate(&req).is_err());
        // Refusal must not mutate state.
        assert_eq!(src.available_millis, 1000);
    }

    #[test]
    fn allocate_then_deallocate_round_trips() {
        let mut src = CpuSource::new(1.0);
        src.available_millis = 4000;
        let mut req = ResourceVector::new();
        req.insert(RESOURCE_CPU.to_string(), Quantity::milli_cpu(1500));
        src.allocate(&req).unwrap();
        assert_eq!(src.available_millis, 2500);
        src.deallocate(&req);
        assert_eq!(src.available_millis, 4000);
    }
}
