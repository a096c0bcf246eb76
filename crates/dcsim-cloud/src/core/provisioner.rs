//! Host resource provisioners.

use indexmap::IndexMap;

use dcsim_core::EPSILON;

/// Reservation ledger for a scalar host resource (RAM or bandwidth).
///
/// The amount in use is always recomputed from the allocation map, so repeated
/// allocations and deallocations do not accumulate floating-point drift.
#[derive(Clone)]
pub struct ResourceProvisioner {
    capacity: f64,
    allocations: IndexMap<u32, f64>,
}

impl ResourceProvisioner {
    pub fn new(capacity: f64) -> Self {
        Self {
            capacity,
            allocations: IndexMap::new(),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn used(&self) -> f64 {
        self.allocations.values().sum()
    }

    pub fn available(&self) -> f64 {
        self.capacity - self.used()
    }

    /// Checks whether the requested amount can be allocated to the VM,
    /// without mutating the ledger.
    ///
    /// A VM that already holds an allocation is evaluated as if its current
    /// allocation was released first.
    pub fn is_suitable(&self, vm_id: u32, amount: f64) -> bool {
        let current = self.allocations.get(&vm_id).copied().unwrap_or(0.);
        self.available() + current + EPSILON >= amount
    }

    /// Reserves the requested amount for the VM, releasing its previous
    /// allocation first. Fails if the remaining capacity is insufficient.
    pub fn allocate(&mut self, vm_id: u32, amount: f64) -> bool {
        if !self.is_suitable(vm_id, amount) {
            return false;
        }
        self.allocations.insert(vm_id, amount);
        true
    }

    pub fn allocated_for_vm(&self, vm_id: u32) -> f64 {
        self.allocations.get(&vm_id).copied().unwrap_or(0.)
    }

    pub fn deallocate(&mut self, vm_id: u32) {
        self.allocations.shift_remove(&vm_id);
    }

    pub fn deallocate_all(&mut self) {
        self.allocations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_release() {
        let mut provisioner = ResourceProvisioner::new(1000.);
        assert!(provisioner.allocate(1, 600.));
        assert!(provisioner.allocate(2, 400.));
        assert_eq!(provisioner.available(), 0.);
        assert!(!provisioner.allocate(3, 1.));
        provisioner.deallocate(1);
        assert_eq!(provisioner.available(), 600.);
        assert!(provisioner.allocate(3, 600.));
    }

    #[test]
    fn test_reallocation_releases_first() {
        let mut provisioner = ResourceProvisioner::new(1000.);
        assert!(provisioner.allocate(1, 900.));
        // shrinking an existing allocation must not fail on capacity
        assert!(provisioner.is_suitable(1, 1000.));
        assert!(provisioner.allocate(1, 1000.));
        assert_eq!(provisioner.used(), 1000.);
        provisioner.deallocate_all();
        assert_eq!(provisioner.used(), 0.);
    }
}
