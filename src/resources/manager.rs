//! The host resource manager (spec §4.3).
//!
//! Owns the registered sources and the machine-class list, drives
//! initialisation (replaying existing machines' reservations), mediates all
//! allocate/deallocate calls, and recomputes class fit counts. A single
//! coarse mutex serialises every state change (spec §5).

use super::source::ResourceSource;
use crate::error::{RuntimeError, RuntimeResult};
use crate::machine::{Machine, MachineClass};
use crate::quantity::ResourceVector;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Pins/unpins a machine's vCPUs once the resource manager has granted (or
/// released) its CPU allocation. Implemented by the NUMA planner's
/// hypervisor-backed collaborator; optional (spec §4.3).
pub trait NumaScheduler: Send + Sync {
    fn pin(&self, cores: i64, machine: &Machine) -> RuntimeResult<()>;
    fn unpin(&self, machine: &Machine) -> RuntimeResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Reset,
    Configured,
    Initialised,
}

/// A point-in-time snapshot of one class's fit count (spec §4.3 `Status`).
#[derive(Debug, Clone, PartialEq)]
pub struct ClassStatus {
    pub name: String,
    pub fit_count: i64,
}

struct Inner {
    state: State,
    sources: Vec<Box<dyn ResourceSource>>,
    classes: Vec<MachineClass>,
    numa_scheduler: Option<Arc<dyn NumaScheduler>>,
}

pub struct ResourceManager {
    inner: Mutex<Inner>,
    cancelled: AtomicBool,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Reset,
                sources: Vec::new(),
                classes: Vec::new(),
                numa_scheduler: None,
            }),
            cancelled: AtomicBool::new(false),
        }
    }

    /// `reset -> configured` (spec §4.3). Idempotent while still configured.
    pub fn configure(&self) -> RuntimeResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Reset | State::Configured => {
                inner.state = State::Configured;
                Ok(())
            }
            State::Initialised => Err(RuntimeError::InvalidArgument(
                "resource manager already initialised".into(),
            )),
        }
    }

    pub fn register_source(&self, source: Box<dyn ResourceSource>) -> RuntimeResult<()> {
        let mut inner = self.inner.lock();
        Self::require_configured(&inner)?;
        inner.sources.push(source);
        Ok(())
    }

    pub fn set_classes(&self, classes: Vec<MachineClass>) -> RuntimeResult<()> {
        let mut inner = self.inner.lock();
        Self::require_configured(&inner)?;
        inner.classes = classes;
        Ok(())
    }

    pub fn set_numa_scheduler(&self, scheduler: Arc<dyn NumaScheduler>) -> RuntimeResult<()> {
        let mut inner = self.inner.lock();
        Self::require_configured(&inner)?;
        inner.numa_scheduler = Some(scheduler);
        Ok(())
    }

    fn require_configured(inner: &Inner) -> RuntimeResult<()> {
        match inner.state {
            State::Reset | State::Configured => Ok(()),
            State::Initialised => Err(RuntimeError::InvalidArgument(
                "resource manager already initialised".into(),
            )),
        }
    }

    /// `configured -> initialised` (spec §4.3). Calls `init` on every
    /// source, replays each existing machine's `spec.resources` through
    /// `allocate`, builds the class table, and computes `available` per
    /// class. Refuses re-initialisation.
    pub fn initialise(&self, existing_machines: &[Machine]) -> RuntimeResult<()> {
        let mut inner = self.inner.lock();
        if inner.state == State::Initialised {
            return Err(RuntimeError::InvalidArgument(
                "resource manager already initialised".into(),
            ));
        }

        let mut managed_names: HashSet<String> = HashSet::new();
        for source in inner.sources.iter_mut() {
            let names = source.init()?;
            for name in names {
                if !managed_names.insert(name.clone()) {
                    return Err(RuntimeError::IncompatibleSources(format!(
                        "resource {name:?} is published by more than one source"
                    )));
                }
            }
        }

        for machine in existing_machines {
            if machine.spec.resources.is_empty() {
                continue;
            }
            Self::allocate_locked(&mut inner, &machine.spec.resources).map_err(|e| {
                RuntimeError::InvalidArgument(format!(
                    "replaying reservations for machine {:?}: {e}",
                    machine.metadata.id
                ))
            })?;
        }

        let mut classes = std::mem::take(&mut inner.classes);
        for class in classes.iter_mut() {
            let mut resources = ResourceVector::new();
            resources.insert(
                crate::quantity::RESOURCE_CPU.to_string(),
                crate::quantity::Quantity::milli_cpu(class.capabilities.cpu_millis),
            );
            resources.insert(
                crate::quantity::RESOURCE_MEMORY.to_string(),
                crate::quantity::Quantity::bytes(class.capabilities.memory_bytes),
            );
            for (k, v) in &class.capabilities.other {
                resources.insert(k.clone(), *v);
            }
            for source in &inner.sources {
                source.modify(&mut resources);
            }
            class.resources = resources;
        }
        inner.classes = classes;
        inner.state = State::Initialised;
        Self::recompute_availability(&mut inner);
        info!(classes = inner.classes.len(), sources = inner.sources.len(), "resource manager initialised");
        Ok(())
    }

    fn check_cancelled(&self) -> RuntimeResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(RuntimeError::Canceled);
        }
        Ok(())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Reserves `required` across every registered source, writing the
    /// union of granted vectors into `machine.spec.resources`. Any source
    /// refusal rolls back everything already granted (spec §4.3, §7).
    pub fn allocate(&self, machine: &mut Machine, required: &ResourceVector) -> RuntimeResult<()> {
        self.check_cancelled()?;
        if required.is_empty() {
            return Err(RuntimeError::InvalidArgument("empty resource request".into()));
        }
        let mut inner = self.inner.lock();
        let granted = Self::allocate_locked(&mut inner, required)?;
        for (name, qty) in &granted {
            machine.spec.resources.insert(name.clone(), *qty);
        }

        if let Some(scheduler) = inner.numa_scheduler.clone() {
            if let Some(cpu) = granted.get(crate::quantity::RESOURCE_CPU) {
                let cores = cpu.amount / 1000;
                if let Err(e) = scheduler.pin(cores, machine) {
                    warn!(machine = %machine.metadata.id, error = %e, "numa pin failed");
                }
            }
        }

        Self::recompute_availability(&mut inner);
        Ok(())
    }

    fn allocate_locked(inner: &mut Inner, required: &ResourceVector) -> RuntimeResult<ResourceVector> {
        let mut granted = ResourceVector::new();
        let mut touched_sources = Vec::new();
        for (idx, source) in inner.sources.iter_mut().enumerate() {
            match source.allocate(required) {
                Ok(g) => {
                    touched_sources.push(idx);
                    for (k, v) in g {
                        granted.insert(k, v);
                    }
                }
                Err(e) => {
                    for &done_idx in &touched_sources {
                        inner.sources[done_idx].deallocate(&granted);
                    }
                    return Err(e);
                }
            }
        }
        Ok(granted)
    }

    /// Releases `to_free` across every registered source, removing the
    /// refunded names from `machine.spec.resources` (spec §4.3).
    pub fn deallocate(&self, machine: &mut Machine, to_free: &ResourceVector) -> RuntimeResult<()> {
        self.check_cancelled()?;
        let mut inner = self.inner.lock();
        for source in inner.sources.iter_mut() {
            let touched = source.deallocate(to_free);
            for name in touched {
                machine.spec.resources.remove(&name);
            }
        }

        if let Some(scheduler) = inner.numa_scheduler.clone() {
            if let Err(e) = scheduler.unpin(machine) {
                warn!(machine = %machine.metadata.id, error = %e, "numa unpin failed");
            }
        }

        Self::recompute_availability(&mut inner);
        Ok(())
    }

    fn recompute_availability(inner: &mut Inner) {
        for class in inner.classes.iter_mut() {
            let mut fit = i64::MAX;
            for source in &inner.sources {
                let c = source.class_count(&class.resources);
                if c < fit {
                    fit = c;
                }
            }
            class.available = fit.max(0);
        }
    }

    /// A point-in-time snapshot of every class's fit count (spec §4.3).
    pub fn status(&self) -> Vec<ClassStatus> {
        let inner = self.inner.lock();
        inner
            .classes
            .iter()
            .map(|c| ClassStatus {
                name: c.name.clone(),
                fit_count: c.available,
            })
            .collect()
    }

    /// The current machine-class table (post-initialisation), used by the
    /// RPC façade to validate a `CreateMachine`'s requested class.
    pub fn class(&self, name: &str) -> Option<MachineClass> {
        let inner = self.inner.lock();
        inner.classes.iter().find(|c| c.name == name).cloned()
    }
}
