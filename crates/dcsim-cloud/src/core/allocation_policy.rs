//! Virtual machine allocation policies.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use dcsim_core::context::SimulationContext;
use dcsim_core::log_debug;

use crate::core::host::Host;
use crate::core::suitability::HostSuitability;
use crate::core::vm::Vm;

/// A VM-to-host mapping produced by the allocation optimization.
pub struct MigrationDecision {
    pub vm: Rc<RefCell<Vm>>,
    pub source_host: Option<u32>,
    pub target_host: u32,
}

/// Places VMs on hosts and optionally optimizes the placement with migrations.
pub trait VmAllocationPolicy {
    /// Registers a host. Hosts are examined in registration order.
    fn add_host(&mut self, host: Rc<RefCell<Host>>);

    /// Returns the registered hosts in registration order.
    fn hosts(&self) -> &[Rc<RefCell<Host>>];

    /// Picks a host for the VM without allocating it.
    fn find_host_for_vm(&self, vm: &Rc<RefCell<Vm>>, time: f64) -> Option<u32>;

    /// Allocates a host for the VM, returns `false` when no host can take it.
    fn allocate_host_for_vm(&mut self, vm: &Rc<RefCell<Vm>>, time: f64) -> bool;

    /// Allocates the VM on the given host, bypassing the host search.
    fn allocate_host_for_vm_on(&mut self, vm: &Rc<RefCell<Vm>>, host_id: u32, time: f64) -> bool;

    /// Releases the host resources of the VM.
    fn deallocate_host_for_vm(&mut self, vm_id: u32);

    /// Returns the host currently serving the VM.
    fn host_of_vm(&self, vm_id: u32) -> Option<u32>;

    /// Re-evaluates the placement and returns the migrations to perform.
    fn optimize_allocation(&mut self, time: f64) -> Vec<MigrationDecision>;

    /// Wall-clock durations of the past optimization passes.
    fn optimization_time_history(&self) -> &[f64] {
        &[]
    }
}

/// Host list and VM-to-host table shared by the allocation policy implementations.
pub(crate) struct HostPool {
    hosts: Vec<Rc<RefCell<Host>>>,
    vm_table: HashMap<u32, u32>,
}

impl HostPool {
    pub fn new() -> Self {
        Self {
            hosts: Vec::new(),
            vm_table: HashMap::new(),
        }
    }

    pub fn add_host(&mut self, host: Rc<RefCell<Host>>) {
        self.hosts.push(host);
    }

    pub fn hosts(&self) -> &[Rc<RefCell<Host>>] {
        &self.hosts
    }

    pub fn host_by_id(&self, host_id: u32) -> Rc<RefCell<Host>> {
        self.hosts
            .iter()
            .find(|host| host.borrow().id() == host_id)
            .unwrap_or_else(|| panic!("unknown host #{}", host_id))
            .clone()
    }

    pub fn host_of_vm(&self, vm_id: u32) -> Option<u32> {
        self.vm_table.get(&vm_id).copied()
    }

    pub fn set_host_of_vm(&mut self, vm_id: u32, host_id: u32) {
        self.vm_table.insert(vm_id, host_id);
    }

    /// Creates the VM on the host and records the mapping.
    pub fn allocate_on(&mut self, vm: &Rc<RefCell<Vm>>, host_id: u32, time: f64) -> bool {
        let host = self.host_by_id(host_id);
        let created = host.borrow_mut().vm_create(vm.clone(), time);
        if created {
            self.vm_table.insert(vm.borrow().id(), host_id);
        }
        created
    }

    /// Destroys the VM on its recorded host.
    pub fn deallocate(&mut self, vm_id: u32) {
        if let Some(host_id) = self.vm_table.remove(&vm_id) {
            self.host_by_id(host_id).borrow_mut().vm_destroy(vm_id);
        }
    }
}

/// A power-aware allocation policy without migrations: first fit over the host
/// list in registration order, breaking ties towards the host that has been
/// registered first (in a homogeneous pool this prefers already loaded hosts
/// staying first in the list, keeping empty hosts switched off).
pub struct PowerVmAllocationPolicySimple {
    pool: HostPool,
    suitability: Box<dyn HostSuitability>,
    ctx: SimulationContext,
}

impl PowerVmAllocationPolicySimple {
    pub fn new(suitability: Box<dyn HostSuitability>, ctx: SimulationContext) -> Self {
        Self {
            pool: HostPool::new(),
            suitability,
            ctx,
        }
    }
}

impl VmAllocationPolicy for PowerVmAllocationPolicySimple {
    fn add_host(&mut self, host: Rc<RefCell<Host>>) {
        self.pool.add_host(host);
    }

    fn hosts(&self) -> &[Rc<RefCell<Host>>] {
        self.pool.hosts()
    }

    fn find_host_for_vm(&self, vm: &Rc<RefCell<Vm>>, time: f64) -> Option<u32> {
        for host in self.pool.hosts() {
            let host = host.borrow();
            if self.suitability.is_suitable(&host, &vm.borrow(), time) {
                return Some(host.id());
            }
        }
        None
    }

    fn allocate_host_for_vm(&mut self, vm: &Rc<RefCell<Vm>>, time: f64) -> bool {
        match self.find_host_for_vm(vm, time) {
            Some(host_id) => {
                let created = self.pool.allocate_on(vm, host_id, time);
                if created {
                    log_debug!(
                        self.ctx,
                        "vm #{} allocated on host #{}",
                        vm.borrow().id(),
                        host_id
                    );
                }
                created
            }
            None => {
                log_debug!(self.ctx, "no suitable host for vm #{}", vm.borrow().id());
                false
            }
        }
    }

    fn allocate_host_for_vm_on(&mut self, vm: &Rc<RefCell<Vm>>, host_id: u32, time: f64) -> bool {
        self.pool.allocate_on(vm, host_id, time)
    }

    fn deallocate_host_for_vm(&mut self, vm_id: u32) {
        self.pool.deallocate(vm_id);
    }

    fn host_of_vm(&self, vm_id: u32) -> Option<u32> {
        self.pool.host_of_vm(vm_id)
    }

    /// This policy does not optimize the VM allocation.
    fn optimize_allocation(&mut self, _time: f64) -> Vec<MigrationDecision> {
        Vec::new()
    }
}
