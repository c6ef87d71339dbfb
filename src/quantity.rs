//! Exact, unit-tagged resource quantities (spec §3.3).
//!
//! Resource names are free-form strings (`cpu`, `memory`, `hugepages`,
//! `memory.epc.sgx`, `memory.epc.sgx.numa.<N>`, ...); a [`Quantity`] pairs an
//! exact `i64` amount with a [`Unit`] tag so that a caller mixing up
//! milliCPUs and bytes fails to compile a sensible comparison rather than
//! silently misallocating.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The unit a [`Quantity`] is expressed in. Arithmetic between two
/// quantities of different units is a logic error the caller must not
/// commit; this type does not attempt lossy conversion between units that
/// aren't the same dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    /// milliCPUs (1000 == one logical core), decimal.
    MilliCpu,
    /// bytes, binary (KiB/MiB/GiB multiples of 1024).
    Bytes,
    /// a plain count (e.g. hugepages), decimal.
    Count,
}

/// An exact integer quantity with a unit tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quantity {
    pub amount: i64,
    pub unit: Unit,
}

impl Quantity {
    pub fn new(amount: i64, unit: Unit) -> Self {
        Self { amount, unit }
    }

    pub fn milli_cpu(m: i64) -> Self {
        Self::new(m, Unit::MilliCpu)
    }

    pub fn bytes(b: i64) -> Self {
        Self::new(b, Unit::Bytes)
    }

    pub fn count(n: i64) -> Self {
        Self::new(n, Unit::Count)
    }

    /// Checked add; `None` if the units differ or the sum overflows.
    pub fn checked_add(&self, other: &Quantity) -> Option<Quantity> {
        if self.unit != other.unit {
            return None;
        }
        self.amount
            .checked_add(other.amount)
            .map(|amount| Quantity::new(amount, self.unit))
    }

    /// Checked subtract; `None` if the units differ or the result underflows.
    pub fn checked_sub(&self, other: &Quantity) -> Option<Quantity> {
        if self.unit != other.unit {
            return None;
        }
        self.amount
            .checked_sub(other.amount)
            .map(|amount| Quantity::new(amount, self.unit))
    }

    /// `floor(self / per_instance)`, or `i64::MAX` if `per_instance` is zero
    /// or non-positive (an unconstrained source never binds the fit count).
    pub fn floor_div(&self, per_instance: &Quantity) -> i64 {
        if self.unit != per_instance.unit || per_instance.amount <= 0 {
            return i64::MAX;
        }
        (self.amount / per_instance.amount).max(0)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            Unit::MilliCpu => write!(f, "{}m", self.amount),
            Unit::Bytes => write!(f, "{}", self.amount),
            Unit::Count => write!(f, "{}", self.amount),
        }
    }
}

/// A resource vector: resource-name → quantity. Ordered by name so that
/// persisted/serialized vectors are stable across runs.
pub type ResourceVector = BTreeMap<String, Quantity>;

/// Sentinel `classCount` for a source that has nothing to say about a given
/// class's requirements — it must never be the binding constraint (spec §4.2).
pub const QUANTITY_COUNT_IGNORE: i64 = i64::MAX;

pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_MEMORY: &str = "memory";
pub const RESOURCE_HUGEPAGES: &str = "hugepages";
pub const RESOURCE_SGX_EPC: &str = "memory.epc.sgx";

/// `memory.epc.sgx.numa.<cell>` — the per-cell SGX-EPC resource name.
pub fn sgx_epc_numa_cell(cell: u32) -> String {
    format!("memory.epc.sgx.numa.{cell}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_div_is_fit_count() {
        let avail = Quantity::bytes(18 * 1024 * 1024 * 1024);
        let per = Quantity::bytes(8 * 1024 * 1024 * 1024);
        assert_eq!(avail.floor_div(&per), 2);
    }

    #[test]
    fn floor_div_mismatched_units_is_unconstrained() {
        let avail = Quantity::bytes(1024);
        let per = Quantity::milli_cpu(1);
        assert_eq!(avail.floor_div(&per), i64::MAX);
    }

    #[test]
    fn checked_sub_rejects_unit_mismatch() {
        let a = Quantity::milli_cpu(100);
        let b = Quantity::bytes(10);
        assert!(a.checked_sub(&b).is_none());
    }

    #[test]
    fn checked_sub_detects_underflow() {
        let a = Quantity::count(1);
        let b = Quantity::count(2);
        assert!(a.checked_sub(&b).is_none());
    }
}
