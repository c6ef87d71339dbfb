//! NUMA cell and hugepage placement planning (spec §4.4).
//!
//! Given a required memory footprint and vCPU count, chooses the minimum
//! set of NUMA cells that can supply the memory in preallocated hugepages,
//! distributes vCPUs across those cells in proportion to the memory drawn,
//! and emits a complete placement descriptor.

use crate::error::{RuntimeError, RuntimeResult};
use std::collections::HashSet;

/// One NUMA cell's current state, as read from the hypervisor (spec §4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaCellState {
    pub id: u32,
    pub cpu_ids: Vec<u32>,
    pub free_hugepages: u64,
}

/// The host topology query surface the planner needs. Implemented by
/// [`crate::hypervisor::HypervisorDriver`]'s NUMA-facing methods.
pub trait NumaHost: Send + Sync {
    fn cells(&self) -> RuntimeResult<Vec<NumaCellState>>;
    /// Host-wide count of vCPUs already pinned to `cpu_id`, used to balance
    /// placement across an otherwise-tied set of CPUs.
    fn pin_count(&self, cpu_id: u32) -> u64;
}

/// Per-cell memory + CPU contribution to a domain's placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerCellPlacement {
    pub cell: u32,
    pub memory_kib: i64,
    pub cpu_ids: Vec<u32>,
}

/// The complete placement descriptor emitted to the hypervisor driver
/// (spec §4.4 step 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainPlacement {
    pub cells: Vec<PerCellPlacement>,
    /// NUMA cell ids that should be bound "strict" (as opposed to
    /// "preferred") — one entry per cell contributing memory.
    pub strict_cells: Vec<u32>,
    /// The concatenated nodeset, libvirt-style (e.g. `"0,1"`).
    pub nodeset: String,
    /// `vCPU index -> host CPU id`.
    pub vcpu_pins: Vec<(u32, u32)>,
}

fn ceil_div(a: i64, b: i64) -> i64 {
    if b <= 0 {
        return a;
    }
    (a + b - 1) / b
}

fn round_up(amount: i64, multiple: i64) -> i64 {
    if multiple <= 0 {
        return amount;
    }
    ceil_div(amount, multiple) * multiple
}

/// Validates the preconditions shared by [`Planner::plan`] and
/// [`HugepageTuner::tune`] (spec §4.4 "Preconditions").
fn preflight(
    host: &dyn NumaHost,
    hugepage_size_bytes: i64,
    required_memory_bytes: i64,
) -> RuntimeResult<Vec<NumaCellState>> {
    if hugepage_size_bytes <= 0 {
        return Err(RuntimeError::InvalidArgument("hugepage size must be positive".into()));
    }
    let cells = host.cells()?;
    if cells.is_empty() {
        return Err(RuntimeError::InvalidArgument(
            "host exposes no NUMA cells".into(),
        ));
    }

    let total_free_bytes: i64 = cells
        .iter()
        .map(|c| c.free_hugepages as i64 * hugepage_size_bytes)
        .sum();
    let total_free_kib = total_free_bytes / 1024;
    let required_kib = ceil_div(required_memory_bytes, 1024);
    if total_free_kib < required_kib {
        return Err(RuntimeError::ResourceExhausted(format!(
            "insufficient hugepages: need {required_kib} KiB, have {total_free_kib} KiB"
        )));
    }
    Ok(cells)
}

/// Chooses NUMA cells and, within them, host CPUs for one machine's domain
/// (spec §4.4).
pub struct Planner;

impl Planner {
    pub fn plan(
        host: &dyn NumaHost,
        hugepage_size_bytes: i64,
        blocked_cpus: &HashSet<u32>,
        required_memory_bytes: i64,
        vcpus: u32,
    ) -> RuntimeResult<DomainPlacement> {
        let cells = preflight(host, hugepage_size_bytes, required_memory_bytes)?;
        let required_aligned = round_up(required_memory_bytes, hugepage_size_bytes);

        // Sort by descending free pages, ties broken by ascending cell id.
        let mut sorted: Vec<&NumaCellState> = cells.iter().collect();
        sorted.sort_by(|a, b| b.free_hugepages.cmp(&a.free_hugepages).then(a.id.cmp(&b.id)));

        let mut remaining = required_aligned;
        let mut cell_mem: Vec<(u32, i64)> = Vec::new();
        for cell in sorted {
            if remaining <= 0 {
                break;
            }
            let cell_free_bytes = cell.free_hugepages as i64 * hugepage_size_bytes;
            let take = cell_free_bytes.min(remaining);
            if take > 0 {
                cell_mem.push((cell.id, take));
                remaining -= take;
            }
        }
        if remaining > 0 {
            // The aggregate preflight passed but alignment ate into the
            // margin; surface the same error the preflight would have.
            return Err(RuntimeError::ResourceExhausted(
                "insufficient hugepages after alignment".into(),
            ));
        }

        let total_mem = required_aligned;
        let mut vcpu_remaining = vcpus as i64;
        let mut pins = Vec::new();
        let mut next_vcpu_index = 0u32;
        let mut per_cell = Vec::with_capacity(cell_mem.len());

        for (i, (cell_id, mem)) in cell_mem.iter().enumerate() {
            let is_last = i == cell_mem.len() - 1;
            let share = if is_last {
                vcpu_remaining
            } else {
                ceil_div(vcpus as i64 * mem, total_mem).min(vcpu_remaining)
            };

            let cell_info = cells.iter().find(|c| c.id == *cell_id).expect("cell_mem only names known cells");
            let mut candidates: Vec<u32> = cell_info
                .cpu_ids
                .iter()
                .copied()
                .filter(|c| !blocked_cpus.contains(c))
                .collect();
            candidates.sort_by(|a, b| host.pin_count(*a).cmp(&host.pin_count(*b)).then(a.cmp(b)));

            let take_n = (share.max(0) as usize).min(candidates.len());
            let chosen: Vec<u32> = candidates.into_iter().take(take_n).collect();
            for host_cpu in &chosen {
                pins.push((next_vcpu_index, *host_cpu));
                next_vcpu_index += 1;
            }
            vcpu_remaining -= chosen.len() as i64;

            per_cell.push(PerCellPlacement {
                cell: *cell_id,
                memory_kib: mem / 1024,
                cpu_ids: chosen,
            });
        }

        let strict_cells: Vec<u32> = per_cell.iter().map(|p| p.cell).collect();
        let nodeset = strict_cells
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");

        Ok(DomainPlacement {
            cells: per_cell,
            strict_cells,
            nodeset,
            vcpu_pins: pins,
        })
    }
}

/// Same preflight as [`Planner::plan`], no per-cell placement: used when a
/// domain only needs the hugepage-backing flag set, not explicit NUMA
/// pinning (spec §4.4 "HugepageTuner variant").
pub struct HugepageTuner;

impl HugepageTuner {
    pub fn tune(host: &dyn NumaHost, hugepage_size_bytes: i64, required_memory_bytes: i64) -> RuntimeResult<()> {
        preflight(host, hugepage_size_bytes, required_memory_bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeHost {
        cells: Vec<NumaCellState>,
        pin_counts: HashMap<u32, u64>,
    }

    impl NumaHost for FakeHost {
        fn cells(&self) -> RuntimeResult<Vec<NumaCellState>> {
            Ok(self.cells.clone())
        }
        fn pin_count(&self, cpu_id: u32) -> u64 {
            *self.pin_counts.get(&cpu_id).unwrap_or(&0)
        }
    }

    const MIB: i64 = 1024 * 1024;

    #[test]
    fn spec_example_two_cells_single_cell_supplies_all() {
        let host = FakeHost {
            cells: vec![
                NumaCellState { id: 0, cpu_ids: vec![0, 1, 2, 3], free_hugepages: 100 },
                NumaCellState { id: 1, cpu_ids: vec![4, 5, 6, 7], free_hugepages: 200 },
            ],
            pin_counts: HashMap::new(),
        };

        let placement = Planner::plan(&host, MIB, &HashSet::new(), 150 * MIB, 4).unwrap();

        assert_eq!(placement.cells.len(), 1);
        assert_eq!(placement.cells[0].cell, 1);
        assert_eq!(placement.cells[0].memory_kib, 150 * 1024);
        assert_eq!(placement.cells[0].cpu_ids.len(), 4);
        assert_eq!(placement.vcpu_pins.len(), 4);
        assert_eq!(placement.nodeset, "1");
    }

    #[test]
    fn memory_spans_multiple_cells_proportionally() {
        let host = FakeHost {
            cells: vec![
                NumaCellState { id: 0, cpu_ids: vec![0, 1], free_hugepages: 100 },
                NumaCellState { id: 1, cpu_ids: vec![2, 3], free_hugepages: 100 },
            ],
            pin_counts: HashMap::new(),
        };

        // 150 MiB total: cell with more free pages (tie -> lower id first)
        // supplies 100 MiB, the other the remaining 50 MiB.
        let placement = Planner::plan(&host, MIB, &HashSet::new(), 150 * MIB, 2).unwrap();
        let total_mem: i64 = placement.cells.iter().map(|c| c.memory_kib).sum();
        assert_eq!(total_mem, 150 * 1024);
        let total_vcpus: usize = placement.cells.iter().map(|c| c.cpu_ids.len()).sum();
        assert_eq!(total_vcpus, 2);

        // No host CPU pinned twice.
        let mut seen = HashSet::new();
        for (_, cpu) in &placement.vcpu_pins {
            assert!(seen.insert(*cpu), "cpu {cpu} pinned twice");
        }
    }

    #[test]
    fn insufficient_hugepages_is_resource_exhausted() {
        let host = FakeHost {
            cells: vec![NumaCellState { id: 0, cpu_ids: vec![0], free_hugepages: 10 }],
            pin_counts: HashMap::new(),
        };
        let err = Planner::plan(&host, MIB, &HashSet::new(), 100 * MIB, 1).unwrap_err();
        assert!(matches!(err, RuntimeError::ResourceExhausted(_)));
    }

    #[test]
    fn no_numa_cells_is_invalid_argument() {
        let host = FakeHost { cells: vec![], pin_counts: HashMap::new() };
        let err = Planner::plan(&host, MIB, &HashSet::new(), MIB, 1).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));
    }

    #[test]
    fn blocked_cpus_are_excluded_from_candidates() {
        let host = FakeHost {
            cells: vec![NumaCellState { id: 0, cpu_ids: vec![0, 1, 2], free_hugepages: 100 }],
            pin_counts: HashMap::new(),
        };
        let mut blocked = HashSet::new();
        blocked.insert(0);
        blocked.insert(1);
        let placement = Planner::plan(&host, MIB, &blocked, 10 * MIB, 2).unwrap();
        assert_eq!(placement.cells[0].cpu_ids, vec![2]);
    }

    #[test]
    fn hugepage_tuner_only_checks_preflight() {
        let host = FakeHost {
            cells: vec![NumaCellState { id: 0, cpu_ids: vec![0], free_hugepages: 100 }],
            pin_counts: HashMap::new(),
        };
        assert!(HugepageTuner::tune(&host, MIB, 10 * MIB).is_ok());
        assert!(HugepageTuner::tune(&host, MIB, 1000 * MIB).is_err());
    }
}
