//! Host-side VM schedulers, mapping VM MIPS requests to PE allocations.

use std::collections::BTreeSet;

use indexmap::IndexMap;

use dcsim_core::EPSILON;

use crate::core::pe::Pe;

/// Fraction of the requested MIPS allocated to a VM migrating into the host.
const MIGRATING_IN_SHARE: f64 = 0.1;
/// Fraction of the requested MIPS retained by a VM migrating out of the host.
const MIGRATING_OUT_SHARE: f64 = 0.9;

/// Allocates host PEs to VMs.
///
/// The scheduler tracks the MIPS allocated to every VM per PE. Allocation of a
/// VM that already holds PEs releases them first, so repeated allocations are
/// idempotent. Iteration over VMs follows the allocation insertion order to
/// keep placement decisions deterministic.
pub trait VmScheduler {
    /// Allocates PEs to the VM according to its per-PE MIPS request.
    fn allocate_pes(&mut self, vm_id: u32, requested_mips: &[f64]) -> bool;

    /// Releases all PEs allocated to the VM.
    fn deallocate_pes(&mut self, vm_id: u32);

    /// Releases PEs of all VMs.
    fn deallocate_all(&mut self);

    /// Returns the MIPS allocated to the VM per PE.
    fn allocated_mips_for_vm(&self, vm_id: u32) -> Vec<f64>;

    /// Returns the total MIPS allocated to the VM.
    fn total_allocated_mips_for_vm(&self, vm_id: u32) -> f64;

    /// Returns the total MIPS capacity of the host PEs.
    fn total_capacity(&self) -> f64;

    /// Returns the MIPS capacity of a single PE.
    fn pe_capacity(&self) -> f64;

    /// Returns the MIPS not allocated to any VM.
    fn available_mips(&self) -> f64;

    /// Marks the VM as migrating into the host.
    fn add_migrating_in(&mut self, vm_id: u32);

    /// Clears the migrating-in mark.
    fn remove_migrating_in(&mut self, vm_id: u32);

    /// Marks the VM as migrating out of the host.
    fn add_migrating_out(&mut self, vm_id: u32);

    /// Clears the migrating-out mark.
    fn remove_migrating_out(&mut self, vm_id: u32);
}

////////////////////////////////////////////////////////////////////////////////

/// Time-shared VM scheduler.
///
/// VM requests can be split across PEs. When the total demand exceeds the host
/// capacity, all allocations are scaled down proportionally. A VM migrating in
/// receives 10% of its request (the migration overhead), a VM migrating out
/// loses 10% of its request.
pub struct VmSchedulerTimeShared {
    pe_count: u32,
    pe_capacity: f64,
    requested: IndexMap<u32, Vec<f64>>,
    allocated: IndexMap<u32, Vec<f64>>,
    migrating_in: BTreeSet<u32>,
    migrating_out: BTreeSet<u32>,
}

impl VmSchedulerTimeShared {
    pub fn new(pes: &[Pe]) -> Self {
        assert!(!pes.is_empty());
        Self {
            pe_count: pes.len() as u32,
            pe_capacity: pes[0].mips(),
            requested: IndexMap::new(),
            allocated: IndexMap::new(),
            migrating_in: BTreeSet::new(),
            migrating_out: BTreeSet::new(),
        }
    }

    fn redistribute(&mut self) {
        let total_requested: f64 = self.requested.values().flatten().sum();
        let capacity = self.total_capacity();
        let scale = if total_requested > capacity + EPSILON {
            capacity / total_requested
        } else {
            1.
        };
        self.allocated = self
            .requested
            .iter()
            .map(|(&vm_id, mips)| (vm_id, mips.iter().map(|m| m * scale).collect()))
            .collect();
    }
}

impl VmScheduler for VmSchedulerTimeShared {
    fn allocate_pes(&mut self, vm_id: u32, requested_mips: &[f64]) -> bool {
        self.requested.shift_remove(&vm_id);
        let mut factor = 1.;
        if self.migrating_in.contains(&vm_id) {
            factor = MIGRATING_IN_SHARE;
        } else if self.migrating_out.contains(&vm_id) {
            factor = MIGRATING_OUT_SHARE;
        }
        let capped: Vec<f64> = requested_mips
            .iter()
            .map(|m| m.min(self.pe_capacity) * factor)
            .collect();
        self.requested.insert(vm_id, capped);
        self.redistribute();
        true
    }

    fn deallocate_pes(&mut self, vm_id: u32) {
        self.requested.shift_remove(&vm_id);
        self.redistribute();
    }

    fn deallocate_all(&mut self) {
        self.requested.clear();
        self.allocated.clear();
    }

    fn allocated_mips_for_vm(&self, vm_id: u32) -> Vec<f64> {
        self.allocated.get(&vm_id).cloned().unwrap_or_default()
    }

    fn total_allocated_mips_for_vm(&self, vm_id: u32) -> f64 {
        self.allocated.get(&vm_id).map(|mips| mips.iter().sum()).unwrap_or(0.)
    }

    fn total_capacity(&self) -> f64 {
        self.pe_capacity * self.pe_count as f64
    }

    fn pe_capacity(&self) -> f64 {
        self.pe_capacity
    }

    fn available_mips(&self) -> f64 {
        let allocated: f64 = self.allocated.values().flatten().sum();
        (self.total_capacity() - allocated).max(0.)
    }

    fn add_migrating_in(&mut self, vm_id: u32) {
        self.migrating_in.insert(vm_id);
    }

    fn remove_migrating_in(&mut self, vm_id: u32) {
        self.migrating_in.remove(&vm_id);
    }

    fn add_migrating_out(&mut self, vm_id: u32) {
        self.migrating_out.insert(vm_id);
    }

    fn remove_migrating_out(&mut self, vm_id: u32) {
        self.migrating_out.remove(&vm_id);
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Space-shared VM scheduler.
///
/// Whole PEs are assigned to VMs, one per entry of the MIPS request.
/// Allocation fails when the host does not have enough free PEs.
pub struct VmSchedulerSpaceShared {
    pe_count: u32,
    pe_capacity: f64,
    free_pes: Vec<u32>,
    pe_map: IndexMap<u32, Vec<u32>>,
    allocated: IndexMap<u32, Vec<f64>>,
    migrating_in: BTreeSet<u32>,
    migrating_out: BTreeSet<u32>,
}

impl VmSchedulerSpaceShared {
    pub fn new(pes: &[Pe]) -> Self {
        assert!(!pes.is_empty());
        Self {
            pe_count: pes.len() as u32,
            pe_capacity: pes[0].mips(),
            free_pes: pes.iter().map(|pe| pe.id()).collect(),
            pe_map: IndexMap::new(),
            allocated: IndexMap::new(),
            migrating_in: BTreeSet::new(),
            migrating_out: BTreeSet::new(),
        }
    }
}

impl VmScheduler for VmSchedulerSpaceShared {
    fn allocate_pes(&mut self, vm_id: u32, requested_mips: &[f64]) -> bool {
        self.deallocate_pes(vm_id);
        if requested_mips.len() > self.free_pes.len() {
            return false;
        }
        let pes: Vec<u32> = self.free_pes.drain(..requested_mips.len()).collect();
        let capped: Vec<f64> = requested_mips.iter().map(|m| m.min(self.pe_capacity)).collect();
        self.pe_map.insert(vm_id, pes);
        self.allocated.insert(vm_id, capped);
        true
    }

    fn deallocate_pes(&mut self, vm_id: u32) {
        if let Some(pes) = self.pe_map.shift_remove(&vm_id) {
            self.free_pes.extend(pes);
            self.free_pes.sort_unstable();
        }
        self.allocated.shift_remove(&vm_id);
    }

    fn deallocate_all(&mut self) {
        self.free_pes = (0..self.pe_count).collect();
        self.pe_map.clear();
        self.allocated.clear();
    }

    fn allocated_mips_for_vm(&self, vm_id: u32) -> Vec<f64> {
        self.allocated.get(&vm_id).cloned().unwrap_or_default()
    }

    fn total_allocated_mips_for_vm(&self, vm_id: u32) -> f64 {
        self.allocated.get(&vm_id).map(|mips| mips.iter().sum()).unwrap_or(0.)
    }

    fn total_capacity(&self) -> f64 {
        self.pe_capacity * self.pe_count as f64
    }

    fn pe_capacity(&self) -> f64 {
        self.pe_capacity
    }

    fn available_mips(&self) -> f64 {
        self.pe_capacity * self.free_pes.len() as f64
    }

    fn add_migrating_in(&mut self, vm_id: u32) {
        self.migrating_in.insert(vm_id);
    }

    fn remove_migrating_in(&mut self, vm_id: u32) {
        self.migrating_in.remove(&vm_id);
    }

    fn add_migrating_out(&mut self, vm_id: u32) {
        self.migrating_out.insert(vm_id);
    }

    fn remove_migrating_out(&mut self, vm_id: u32) {
        self.migrating_out.remove(&vm_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pe::make_pe_list;

    #[test]
    fn test_time_shared_proportional_scaling() {
        let pes = make_pe_list(2, 1000.);
        let mut scheduler = VmSchedulerTimeShared::new(&pes);

        assert!(scheduler.allocate_pes(0, &[1000., 500.]));
        assert_eq!(scheduler.total_allocated_mips_for_vm(0), 1500.);
        assert_eq!(scheduler.available_mips(), 500.);

        // total demand 3000 against capacity 2000, everyone is scaled by 2/3
        assert!(scheduler.allocate_pes(1, &[1000., 500.]));
        assert!((scheduler.total_allocated_mips_for_vm(0) - 1000.).abs() < 1e-9);
        assert!((scheduler.total_allocated_mips_for_vm(1) - 1000.).abs() < 1e-9);
        assert!(scheduler.available_mips() < 1e-9);

        scheduler.deallocate_pes(1);
        assert_eq!(scheduler.total_allocated_mips_for_vm(0), 1500.);
    }

    #[test]
    fn test_time_shared_caps_request_at_pe_capacity() {
        let pes = make_pe_list(1, 1000.);
        let mut scheduler = VmSchedulerTimeShared::new(&pes);
        assert!(scheduler.allocate_pes(0, &[1500.]));
        assert_eq!(scheduler.total_allocated_mips_for_vm(0), 1000.);
    }

    #[test]
    fn test_time_shared_migration_factors() {
        let pes = make_pe_list(2, 1000.);
        let mut scheduler = VmSchedulerTimeShared::new(&pes);

        scheduler.add_migrating_in(0);
        assert!(scheduler.allocate_pes(0, &[1000.]));
        assert!((scheduler.total_allocated_mips_for_vm(0) - 100.).abs() < 1e-9);

        scheduler.remove_migrating_in(0);
        scheduler.add_migrating_out(0);
        assert!(scheduler.allocate_pes(0, &[1000.]));
        assert!((scheduler.total_allocated_mips_for_vm(0) - 900.).abs() < 1e-9);
    }

    #[test]
    fn test_space_shared_whole_pes() {
        let pes = make_pe_list(2, 1000.);
        let mut scheduler = VmSchedulerSpaceShared::new(&pes);

        assert!(scheduler.allocate_pes(0, &[500.]));
        assert_eq!(scheduler.available_mips(), 1000.);
        assert!(scheduler.allocate_pes(1, &[700.]));
        // no free PEs left
        assert!(!scheduler.allocate_pes(2, &[100.]));

        scheduler.deallocate_pes(0);
        assert!(!scheduler.allocate_pes(2, &[100., 100.]));
        assert!(scheduler.allocate_pes(2, &[100.]));
    }
}
