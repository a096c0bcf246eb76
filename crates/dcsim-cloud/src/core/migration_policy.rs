//! Power-aware VM allocation policy with migration-based consolidation.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::time::Instant;

use dcsim_core::context::SimulationContext;
use dcsim_core::{log_debug, log_error};

use crate::core::allocation_policy::{HostPool, MigrationDecision, VmAllocationPolicy};
use crate::core::host::Host;
use crate::core::overload::OverloadDetector;
use crate::core::suitability::HostSuitability;
use crate::core::vm::Vm;
use crate::core::vm_selection::VmSelectionPolicy;

/// A power-aware allocation policy that dynamically optimizes the VM
/// placement using live migrations.
///
/// Every optimization pass detects overloaded hosts, picks migration victims
/// from them, searches consolidation targets minimizing the marginal power
/// increase, and tries to fully evacuate underutilized hosts so they can be
/// switched off. All placement decisions are made speculatively against the
/// real host state and rolled back from a saved snapshot before the migration
/// map is handed to the datacenter.
pub struct PowerVmAllocationPolicyMigration {
    pool: HostPool,
    suitability: Box<dyn HostSuitability>,
    vm_selection: Box<dyn VmSelectionPolicy>,
    overload_detector: Box<dyn OverloadDetector>,
    saved_allocation: Vec<(Rc<RefCell<Vm>>, u32)>,
    // three separate per-host histories recorded at each optimization pass
    time_history: HashMap<u32, Vec<f64>>,
    utilization_history: HashMap<u32, Vec<f64>>,
    metric_history: HashMap<u32, Vec<f64>>,
    // wall-clock instrumentation of the optimization stages
    execution_time_host_selection: Vec<f64>,
    execution_time_vm_selection: Vec<f64>,
    execution_time_vm_reallocation: Vec<f64>,
    execution_time_total: Vec<f64>,
    ctx: SimulationContext,
}

impl PowerVmAllocationPolicyMigration {
    pub fn new(
        suitability: Box<dyn HostSuitability>,
        vm_selection: Box<dyn VmSelectionPolicy>,
        overload_detector: Box<dyn OverloadDetector>,
        ctx: SimulationContext,
    ) -> Self {
        Self {
            pool: HostPool::new(),
            suitability,
            vm_selection,
            overload_detector,
            saved_allocation: Vec::new(),
            time_history: HashMap::new(),
            utilization_history: HashMap::new(),
            metric_history: HashMap::new(),
            execution_time_host_selection: Vec::new(),
            execution_time_vm_selection: Vec::new(),
            execution_time_vm_reallocation: Vec::new(),
            execution_time_total: Vec::new(),
            ctx,
        }
    }

    /// Finds a host that can take the VM and will not become overloaded after
    /// the allocation, minimizing the power increase caused by the VM.
    fn find_host_for_vm_excluding(
        &self,
        vm: &Rc<RefCell<Vm>>,
        excluded_hosts: &BTreeSet<u32>,
        time: f64,
    ) -> Option<u32> {
        let mut min_power_diff = f64::MAX;
        let mut result = None;
        for host in self.pool.hosts() {
            let host_id = host.borrow().id();
            if excluded_hosts.contains(&host_id) {
                continue;
            }
            {
                let host_ref = host.borrow();
                if !self.suitability.is_suitable(&host_ref, &vm.borrow(), time) {
                    continue;
                }
            }
            let active = self.utilization_of_cpu_mips(&host.borrow()) != 0.;
            if active && self.is_host_overloaded_after_allocation(host, vm, time) {
                continue;
            }
            let host_ref = host.borrow();
            if let Some(power_after) = self.power_after_allocation(&host_ref, &vm.borrow(), time) {
                let power_diff = power_after - host_ref.power();
                if power_diff < min_power_diff {
                    min_power_diff = power_diff;
                    result = Some(host_id);
                }
            }
        }
        result
    }

    /// Checks if a host would be overloaded after placing the candidate VM.
    ///
    /// The VM is created on the host and destroyed again; a failed creation
    /// counts as overload.
    fn is_host_overloaded_after_allocation(&self, host: &Rc<RefCell<Host>>, vm: &Rc<RefCell<Vm>>, time: f64) -> bool {
        let created = host.borrow_mut().vm_create(vm.clone(), time);
        if !created {
            return true;
        }
        let overloaded = self.overload_detector.is_host_overloaded(&host.borrow());
        let vm_id = vm.borrow().id();
        host.borrow_mut().vm_destroy(vm_id);
        overloaded
    }

    /// CPU utilization of the host in MIPS including the full future demand of
    /// VMs that are still migrating in.
    fn utilization_of_cpu_mips(&self, host: &Host) -> f64 {
        let mut total = 0.;
        for vm in host.vms() {
            let vm_id = vm.borrow().id();
            let allocated = host.total_allocated_mips_for_vm(vm_id);
            if host.is_vm_migrating_in(vm_id) {
                // the remaining demand of a migrating-in vm once its 10% share ends
                total += allocated * 0.9 / 0.1;
            }
            total += allocated;
        }
        total
    }

    /// Power consumption of the host after a hypothetical placement of the VM.
    fn power_after_allocation(&self, host: &Host, vm: &Vm, time: f64) -> Option<f64> {
        host.power_model()?;
        let requested = vm.current_requested_total_mips(time);
        let potential_utilization = (self.utilization_of_cpu_mips(host) + requested) / host.total_mips();
        Some(host.power_at(potential_utilization))
    }

    /// Picks migration victims from the overloaded hosts, speculatively
    /// removing them until each host stops being overloaded.
    fn vms_to_migrate_from_overloaded(&self, overloaded_hosts: &[u32]) -> Vec<Rc<RefCell<Vm>>> {
        let mut victims = Vec::new();
        for &host_id in overloaded_hosts {
            let host = self.pool.host_by_id(host_id);
            loop {
                let selected = self.vm_selection.select_vm_to_migrate(&host.borrow(), &self.ctx);
                let Some(vm) = selected else {
                    break;
                };
                let vm_id = vm.borrow().id();
                victims.push(vm);
                host.borrow_mut().vm_destroy(vm_id);
                if !self.overload_detector.is_host_overloaded(&host.borrow()) {
                    break;
                }
            }
        }
        victims
    }

    /// Places the victim VMs on new hosts, most CPU-hungry first.
    ///
    /// With `rollback_on_failure` the placement is all-or-nothing: if any VM
    /// cannot be placed, every speculative creation made here is destroyed and
    /// an empty map is returned.
    fn new_vm_placement(
        &self,
        mut vms_to_migrate: Vec<Rc<RefCell<Vm>>>,
        excluded_hosts: &BTreeSet<u32>,
        time: f64,
        rollback_on_failure: bool,
    ) -> Vec<(Rc<RefCell<Vm>>, u32)> {
        vms_to_migrate.sort_by(|a, b| {
            b.borrow()
                .cpu_utilization(time)
                .total_cmp(&a.borrow().cpu_utilization(time))
        });

        let mut placement: Vec<(Rc<RefCell<Vm>>, u32)> = Vec::new();
        for vm in vms_to_migrate {
            match self.find_host_for_vm_excluding(&vm, excluded_hosts, time) {
                Some(host_id) => {
                    self.pool.host_by_id(host_id).borrow_mut().vm_create(vm.clone(), time);
                    log_debug!(self.ctx, "vm #{} placed on host #{}", vm.borrow().id(), host_id);
                    placement.push((vm, host_id));
                }
                None => {
                    if rollback_on_failure {
                        log_debug!(
                            self.ctx,
                            "failed relocating all vms from an underused host, cancelling its relocation"
                        );
                        for (vm, host_id) in placement.drain(..) {
                            let vm_id = vm.borrow().id();
                            self.pool.host_by_id(host_id).borrow_mut().vm_destroy(vm_id);
                        }
                        return placement;
                    }
                    log_debug!(self.ctx, "no new host found for vm #{}", vm.borrow().id());
                }
            }
        }
        placement
    }

    /// Tries to fully evacuate underutilized hosts, one by one, starting from
    /// the least loaded, until every host has been examined.
    fn migrations_from_underutilized_hosts(
        &self,
        overloaded_hosts: &[u32],
        time: f64,
    ) -> Vec<(Rc<RefCell<Vm>>, u32)> {
        let mut migration_map = Vec::new();
        let switched_off: Vec<u32> = self
            .pool
            .hosts()
            .iter()
            .filter(|host| host.borrow().utilization_of_cpu() == 0.)
            .map(|host| host.borrow().id())
            .collect();

        let mut excluded_for_underload: BTreeSet<u32> =
            overloaded_hosts.iter().chain(switched_off.iter()).cloned().collect();
        let mut excluded_for_placement = excluded_for_underload.clone();
        let host_count = self.pool.hosts().len();

        loop {
            if excluded_for_underload.len() == host_count {
                break;
            }
            let Some(under_id) = self.find_underutilized_host(&excluded_for_underload) else {
                break;
            };
            log_debug!(self.ctx, "emptying underused host #{}", under_id);

            excluded_for_underload.insert(under_id);
            excluded_for_placement.insert(under_id);

            let host = self.pool.host_by_id(under_id);
            let vms_to_migrate: Vec<Rc<RefCell<Vm>>> = host
                .borrow()
                .vms()
                .iter()
                .filter(|vm| !vm.borrow().is_in_migration())
                .cloned()
                .collect();
            if vms_to_migrate.is_empty() {
                continue;
            }

            let placement = self.new_vm_placement(vms_to_migrate, &excluded_for_placement, time, true);
            for (_, target) in &placement {
                excluded_for_underload.insert(*target);
            }
            migration_map.extend(placement);
        }
        migration_map
    }

    /// Returns the host with the minimum non-zero utilization that is not
    /// excluded and whose VMs can still be moved.
    fn find_underutilized_host(&self, excluded_hosts: &BTreeSet<u32>) -> Option<u32> {
        let mut min_utilization = 1.;
        let mut result = None;
        for host in self.pool.hosts() {
            let host = host.borrow();
            if excluded_hosts.contains(&host.id()) {
                continue;
            }
            let utilization = host.utilization_of_cpu();
            if utilization > 0.
                && utilization < min_utilization
                && !Self::all_vms_migrating_out_or_any_vm_migrating_in(&host)
            {
                min_utilization = utilization;
                result = Some(host.id());
            }
        }
        result
    }

    // The scan returns false on the first VM that is not migrating at all,
    // true on the first migrating-in VM, and true when every VM is
    // migrating out.
    fn all_vms_migrating_out_or_any_vm_migrating_in(host: &Host) -> bool {
        for vm in host.vms() {
            let vm = vm.borrow();
            if !vm.is_in_migration() {
                return false;
            }
            if host.is_vm_migrating_in(vm.id()) {
                return true;
            }
        }
        true
    }

    /// Snapshots the current VM-to-host mapping, excluding migrating-in VMs.
    fn save_allocation(&mut self) {
        self.saved_allocation.clear();
        for host in self.pool.hosts() {
            let host = host.borrow();
            for vm in host.vms() {
                let vm_id = vm.borrow().id();
                if !host.is_vm_migrating_in(vm_id) {
                    self.saved_allocation.push((vm.clone(), host.id()));
                }
            }
        }
    }

    /// Rebuilds every host from the snapshot taken by [`Self::save_allocation`].
    ///
    /// A failed re-creation means the speculative passes corrupted the host
    /// bookkeeping, which is a bug, so it aborts the simulation.
    fn restore_allocation(&mut self, time: f64) {
        for host in self.pool.hosts() {
            let mut host = host.borrow_mut();
            host.vm_destroy_all();
            host.reallocate_migrating_in_vms(time);
        }
        for (vm, host_id) in &self.saved_allocation {
            let host = self.pool.host_by_id(*host_id);
            let created = host.borrow_mut().vm_create(vm.clone(), time);
            if !created {
                log_error!(
                    self.ctx,
                    "failed restoring allocation of vm #{} on host #{}",
                    vm.borrow().id(),
                    host_id
                );
                panic!("allocation restore failed: host bookkeeping is inconsistent");
            }
        }
        let restored: Vec<(u32, u32)> = self
            .saved_allocation
            .iter()
            .map(|(vm, host_id)| (vm.borrow().id(), *host_id))
            .collect();
        for (vm_id, host_id) in restored {
            self.pool.set_host_of_vm(vm_id, host_id);
        }
    }

    /// Appends an entry to each of the three per-host histories, at most one
    /// entry per simulation time.
    fn add_history_entry(&mut self, host_id: u32, time: f64, utilization: f64, metric: f64) {
        let times = self.time_history.entry(host_id).or_default();
        if times.last() == Some(&time) {
            return;
        }
        times.push(time);
        self.utilization_history.entry(host_id).or_default().push(utilization);
        self.metric_history.entry(host_id).or_default().push(metric);
    }

    pub fn time_history(&self) -> &HashMap<u32, Vec<f64>> {
        &self.time_history
    }

    pub fn utilization_history(&self) -> &HashMap<u32, Vec<f64>> {
        &self.utilization_history
    }

    pub fn metric_history(&self) -> &HashMap<u32, Vec<f64>> {
        &self.metric_history
    }

    pub fn execution_time_host_selection(&self) -> &[f64] {
        &self.execution_time_host_selection
    }

    pub fn execution_time_vm_selection(&self) -> &[f64] {
        &self.execution_time_vm_selection
    }

    pub fn execution_time_vm_reallocation(&self) -> &[f64] {
        &self.execution_time_vm_reallocation
    }
}

impl VmAllocationPolicy for PowerVmAllocationPolicyMigration {
    fn add_host(&mut self, host: Rc<RefCell<Host>>) {
        self.pool.add_host(host);
    }

    fn hosts(&self) -> &[Rc<RefCell<Host>>] {
        self.pool.hosts()
    }

    fn find_host_for_vm(&self, vm: &Rc<RefCell<Vm>>, time: f64) -> Option<u32> {
        let mut excluded = BTreeSet::new();
        if let Some(host_id) = vm.borrow().host_id() {
            excluded.insert(host_id);
        }
        self.find_host_for_vm_excluding(vm, &excluded, time)
    }

    fn allocate_host_for_vm(&mut self, vm: &Rc<RefCell<Vm>>, time: f64) -> bool {
        match self.find_host_for_vm(vm, time) {
            Some(host_id) => {
                let created = self.pool.allocate_on(vm, host_id, time);
                if created {
                    log_debug!(self.ctx, "vm #{} allocated on host #{}", vm.borrow().id(), host_id);
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

    fn optimize_allocation(&mut self, time: f64) -> Vec<MigrationDecision> {
        let total_start = Instant::now();

        let host_selection_start = Instant::now();
        let overloaded_hosts: Vec<u32> = self
            .pool
            .hosts()
            .iter()
            .filter(|host| self.overload_detector.is_host_overloaded(&host.borrow()))
            .map(|host| host.borrow().id())
            .collect();
        self.execution_time_host_selection
            .push(host_selection_start.elapsed().as_secs_f64());

        if !overloaded_hosts.is_empty() {
            log_debug!(self.ctx, "overloaded hosts: {:?}", overloaded_hosts);
        }

        let history: Vec<(u32, f64, f64)> = self
            .pool
            .hosts()
            .iter()
            .map(|host| {
                let host = host.borrow();
                (
                    host.id(),
                    host.utilization_of_cpu(),
                    self.overload_detector.metric(&host),
                )
            })
            .collect();
        for (host_id, utilization, metric) in history {
            self.add_history_entry(host_id, time, utilization, metric);
        }

        self.save_allocation();

        let vm_selection_start = Instant::now();
        let victims = self.vms_to_migrate_from_overloaded(&overloaded_hosts);
        self.execution_time_vm_selection
            .push(vm_selection_start.elapsed().as_secs_f64());

        let reallocation_start = Instant::now();
        let excluded: BTreeSet<u32> = overloaded_hosts.iter().cloned().collect();
        let mut migration_map = self.new_vm_placement(victims, &excluded, time, false);
        self.execution_time_vm_reallocation
            .push(reallocation_start.elapsed().as_secs_f64());

        migration_map.extend(self.migrations_from_underutilized_hosts(&overloaded_hosts, time));

        self.restore_allocation(time);

        self.execution_time_total.push(total_start.elapsed().as_secs_f64());

        migration_map
            .into_iter()
            .map(|(vm, target_host)| {
                let source_host = vm.borrow().host_id();
                MigrationDecision {
                    vm,
                    source_host,
                    target_host,
                }
            })
            .collect()
    }

    fn optimization_time_history(&self) -> &[f64] {
        &self.execution_time_total
    }
}
