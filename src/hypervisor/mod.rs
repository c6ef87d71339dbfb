//! The hypervisor driver seam (spec §2, §4.4).
//!
//! The reconciler talks to the actual hypervisor (qemu/libvirt in
//! production) through this trait so that domain lifecycle and NUMA
//! topology queries can be exercised without a real VMM in tests.

use crate::error::RuntimeResult;
use crate::machine::Machine;
use crate::numa::{DomainPlacement, NumaCellState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Point-in-time domain status as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Stopped,
    Missing,
}

#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Current NUMA topology and per-cell free hugepage counts.
    async fn numa_cells(&self) -> RuntimeResult<Vec<NumaCellState>>;

    /// Host-wide count of vCPUs already pinned to `cpu_id`, used by the
    /// NUMA planner to balance placement.
    fn pin_count(&self, cpu_id: u32) -> u64;

    /// Creates or updates the domain backing `machine` at `placement`,
    /// powering it on if `machine.spec.power` is `On`.
    async fn realise(&self, machine: &Machine, placement: &DomainPlacement) -> RuntimeResult<()>;

    /// Tears down the domain backing `machine`, releasing its NUMA pins.
    async fn destroy(&self, machine: &Machine) -> RuntimeResult<()>;

    /// Current domain power state, `Missing` if no domain exists.
    async fn status(&self, machine_id: &str) -> RuntimeResult<DomainState>;
}

/// An in-memory hypervisor used by integration tests and local development
/// (spec §9: the reconciler must not assume a real VMM is present). Tracks
/// domain state and per-CPU pin counts without shelling out anywhere.
#[derive(Default)]
pub struct NullHypervisor {
    cells: Mutex<Vec<NumaCellState>>,
    domains: Mutex<HashMap<String, DomainState>>,
    pins: Mutex<HashMap<u32, u64>>,
    realise_calls: AtomicU64,
}

impl NullHypervisor {
    pub fn new(cells: Vec<NumaCellState>) -> Self {
        Self {
            cells: Mutex::new(cells),
            domains: Mutex::new(HashMap::new()),
            pins: Mutex::new(HashMap::new()),
            realise_calls: AtomicU64::new(0),
        }
    }

    pub fn realise_call_count(&self) -> u64 {
        self.realise_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HypervisorDriver for NullHypervisor {
    async fn numa_cells(&self) -> RuntimeResult<Vec<NumaCellState>> {
        Ok(self.cells.lock().unwrap().clone())
    }

    fn pin_count(&self, cpu_id: u32) -> u64 {
        *self.pins.lock().unwrap().get(&cpu_id).unwrap_or(&0)
    }

    async fn realise(&self, machine: &Machine, placement: &DomainPlacement) -> RuntimeResult<()> {
        self.realise_calls.fetch_add(1, Ordering::SeqCst);
        let mut pins = self.pins.lock().unwrap();
        for (_, cpu) in &placement.vcpu_pins {
            *pins.entry(*cpu).or_insert(0) += 1;
        }
        let state = match machine.spec.power.0 {
            crate::machine::Power::On => DomainState::Running,
            crate::machine::Power::Off => DomainState::Stopped,
        };
        self.domains.lock().unwrap().insert(machine.metadata.id.clone(), state);
        Ok(())
    }

    async fn destroy(&self, machine: &Machine) -> RuntimeResult<()> {
        self.domains.lock().unwrap().remove(&machine.metadata.id);
        Ok(())
    }

    async fn status(&self, machine_id: &str) -> RuntimeResult<DomainState> {
        Ok(*self
            .domains
            .lock()
            .unwrap()
            .get(machine_id)
            .unwrap_or(&DomainState::Missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Machine, MachineSpec, Power, PowerOrDefault};
    use crate::numa::DomainPlacement;

    fn machine(id: &str, power: Power) -> Machine {
        Machine::new(id, MachineSpec { power: PowerOrDefault(power), ..Default::default() })
    }

    #[tokio::test]
    async fn realise_then_destroy_round_trips_domain_state() {
        let hv = NullHypervisor::new(vec![NumaCellState { id: 0, cpu_ids: vec![0, 1], free_hugepages: 10 }]);
        let m = machine("m1", Power::On);
        let placement = DomainPlacement {
            cells: vec![],
            strict_cells: vec![],
            nodeset: String::new(),
            vcpu_pins: vec![(0, 0)],
        };

        assert_eq!(hv.status("m1").await.unwrap(), DomainState::Missing);
        hv.realise(&m, &placement).await.unwrap();
        assert_eq!(hv.status("m1").await.unwrap(), DomainState::Running);
        assert_eq!(hv.pin_count(0), 1);

        hv.destroy(&m).await.unwrap();
        assert_eq!(hv.status("m1").await.unwrap(), DomainState::Missing);
    }

    #[tokio::test]
    async fn powered_off_machine_realises_as_stopped() {
        let hv = NullHypervisor::new(vec![]);
        let m = machine("m2", Power::Off);
        let placement = DomainPlacement { cells: vec![], strict_cells: vec![], nodeset: String::new(), vcpu_pins: vec![] };
        hv.realise(&m, &placement).await.unwrap();
        assert_eq!(hv.status("m2").await.unwrap(), DomainState::Stopped);
    }
}
