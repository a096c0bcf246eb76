//! Physical hosts supporting dynamic workloads and performance degradation.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use indexmap::IndexMap;

use dcsim_core::context::SimulationContext;
use dcsim_core::{log_info, log_trace};

use crate::core::common::AllocationVerdict;
use crate::core::pe::Pe;
use crate::core::power_model::HostPowerModel;
use crate::core::provisioner::ResourceProvisioner;
use crate::core::slav_metric::{HostSlavMetric, OverloadTimeFraction};
use crate::core::vm::Vm;
use crate::core::vm_scheduler::VmScheduler;

/// Length of the host utilization history ring used by overload detectors.
pub const HOST_UTILIZATION_HISTORY_LENGTH: usize = 30;

/// An entry of the host state history.
#[derive(Clone, Debug, PartialEq)]
pub struct HostStateHistoryEntry {
    pub time: f64,
    pub allocated_mips: f64,
    pub requested_mips: f64,
    pub is_active: bool,
}

/// A physical host holding a list of PEs, RAM/bandwidth/storage provisioners,
/// a VM scheduler and an optional power model.
///
/// A host is considered switched off iff its CPU utilization is exactly zero.
pub struct Host {
    id: u32,
    pes: Vec<Pe>,
    ram_provisioner: ResourceProvisioner,
    bw_provisioner: ResourceProvisioner,
    storage_provisioner: ResourceProvisioner,
    vm_scheduler: Box<dyn VmScheduler>,
    power_model: Option<Box<dyn HostPowerModel>>,
    vms: Vec<Rc<RefCell<Vm>>>,
    vms_migrating_in: IndexMap<u32, Rc<RefCell<Vm>>>,
    utilization_mips: f64,
    previous_utilization_mips: f64,
    state_history: Vec<HostStateHistoryEntry>,
    utilization_history: VecDeque<f64>,
    last_utilization_history_time: f64,
    slav_metric: Box<dyn HostSlavMetric>,
    ctx: SimulationContext,
}

impl Host {
    pub fn new(
        pes: Vec<Pe>,
        ram: u64,
        bw: u64,
        storage: u64,
        vm_scheduler: Box<dyn VmScheduler>,
        power_model: Option<Box<dyn HostPowerModel>>,
        ctx: SimulationContext,
    ) -> Self {
        Self {
            id: ctx.id(),
            pes,
            ram_provisioner: ResourceProvisioner::new(ram as f64),
            bw_provisioner: ResourceProvisioner::new(bw as f64),
            storage_provisioner: ResourceProvisioner::new(storage as f64),
            vm_scheduler,
            power_model,
            vms: Vec::new(),
            vms_migrating_in: IndexMap::new(),
            utilization_mips: 0.,
            previous_utilization_mips: 0.,
            state_history: Vec::new(),
            utilization_history: VecDeque::new(),
            last_utilization_history_time: -1.,
            slav_metric: Box::new(OverloadTimeFraction::new()),
            ctx,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Total MIPS capacity over the working PEs.
    pub fn total_mips(&self) -> f64 {
        self.pes.iter().filter(|pe| !pe.is_failed()).map(|pe| pe.mips()).sum()
    }

    pub fn pes(&self) -> &[Pe] {
        &self.pes
    }

    pub fn bw(&self) -> u64 {
        self.bw_provisioner.capacity() as u64
    }

    pub fn ram(&self) -> u64 {
        self.ram_provisioner.capacity() as u64
    }

    pub fn vms(&self) -> &[Rc<RefCell<Vm>>] {
        &self.vms
    }

    pub fn vm_by_id(&self, vm_id: u32) -> Option<Rc<RefCell<Vm>>> {
        self.vms.iter().find(|vm| vm.borrow().id() == vm_id).cloned()
    }

    pub fn is_vm_migrating_in(&self, vm_id: u32) -> bool {
        self.vms_migrating_in.contains_key(&vm_id)
    }

    pub fn ram_provisioner(&self) -> &ResourceProvisioner {
        &self.ram_provisioner
    }

    pub fn bw_provisioner(&self) -> &ResourceProvisioner {
        &self.bw_provisioner
    }

    /// Checks whether the host can accommodate the VM, without mutating any ledger.
    pub fn check_allocation(&self, vm: &Vm) -> AllocationVerdict {
        if !self.storage_provisioner.is_suitable(vm.id(), vm.size() as f64) {
            return AllocationVerdict::NotEnoughStorage;
        }
        if !self.ram_provisioner.is_suitable(vm.id(), vm.ram() as f64) {
            return AllocationVerdict::NotEnoughRam;
        }
        if !self.bw_provisioner.is_suitable(vm.id(), vm.bw() as f64) {
            return AllocationVerdict::NotEnoughBw;
        }
        if self.vm_scheduler.pe_capacity() < vm.mips() {
            return AllocationVerdict::NotEnoughMips;
        }
        AllocationVerdict::Success
    }

    /// Creates the VM on this host, reserving storage, RAM, bandwidth and PEs.
    ///
    /// Returns `false` and leaves the host unchanged if any reservation fails.
    pub fn vm_create(&mut self, vm: Rc<RefCell<Vm>>, time: f64) -> bool {
        let verdict = self.check_allocation(&vm.borrow());
        let vm_id = vm.borrow().id();
        if verdict != AllocationVerdict::Success {
            log_trace!(self.ctx, "vm #{} rejected by host #{}: {:?}", vm_id, self.id, verdict);
            return false;
        }
        let (ram, bw, size) = {
            let vm = vm.borrow();
            (vm.ram() as f64, vm.bw() as f64, vm.size() as f64)
        };
        self.storage_provisioner.allocate(vm_id, size);
        self.ram_provisioner.allocate(vm_id, ram);
        self.bw_provisioner.allocate(vm_id, bw);
        let requested = vm.borrow().current_requested_mips(time);
        if !self.vm_scheduler.allocate_pes(vm_id, &requested) {
            log_trace!(self.ctx, "not enough free PEs for vm #{} on host #{}", vm_id, self.id);
            self.storage_provisioner.deallocate(vm_id);
            self.ram_provisioner.deallocate(vm_id);
            self.bw_provisioner.deallocate(vm_id);
            return false;
        }
        vm.borrow_mut().set_host_id(Some(self.id));
        self.utilization_mips += self.vm_scheduler.total_allocated_mips_for_vm(vm_id);
        self.vms.push(vm);
        true
    }

    /// Destroys the VM and releases all its reservations.
    pub fn vm_destroy(&mut self, vm_id: u32) {
        if let Some(vm) = self.vm_by_id(vm_id) {
            vm.borrow_mut().set_host_id(None);
            self.utilization_mips -= self.vm_scheduler.total_allocated_mips_for_vm(vm_id);
            self.vm_scheduler.deallocate_pes(vm_id);
            self.vm_scheduler.remove_migrating_out(vm_id);
            self.ram_provisioner.deallocate(vm_id);
            self.bw_provisioner.deallocate(vm_id);
            self.storage_provisioner.deallocate(vm_id);
            self.vms.retain(|vm| vm.borrow().id() != vm_id);
        }
    }

    /// Destroys all VMs on the host.
    pub fn vm_destroy_all(&mut self) {
        for vm in &self.vms {
            vm.borrow_mut().set_host_id(None);
        }
        self.vms.clear();
        self.vm_scheduler.deallocate_all();
        self.ram_provisioner.deallocate_all();
        self.bw_provisioner.deallocate_all();
        self.storage_provisioner.deallocate_all();
        self.utilization_mips = 0.;
    }

    /// Registers a VM migrating into this host and reserves its resources.
    ///
    /// The reservations are held through the whole migration window. The VM
    /// keeps pointing at its source host until the migration completes.
    ///
    /// Panics if the reservation fails, since the allocation policy verifies
    /// suitability before scheduling a migration.
    pub fn add_migrating_in_vm(&mut self, vm: Rc<RefCell<Vm>>, time: f64) {
        let vm_id = vm.borrow().id();
        if self.vms_migrating_in.contains_key(&vm_id) {
            return;
        }
        vm.borrow_mut().set_in_migration(true);
        let (ram, bw, size) = {
            let vm = vm.borrow();
            (vm.ram() as f64, vm.bw() as f64, vm.size() as f64)
        };
        let reserved = self.storage_provisioner.allocate(vm_id, size)
            && self.ram_provisioner.allocate(vm_id, ram)
            && self.bw_provisioner.allocate(vm_id, bw);
        if !reserved {
            panic!(
                "unable to reserve resources for vm #{} migrating into host #{}",
                vm_id, self.id
            );
        }
        self.vm_scheduler.add_migrating_in(vm_id);
        let requested = vm.borrow().current_requested_mips(time);
        self.vm_scheduler.allocate_pes(vm_id, &requested);
        self.vms_migrating_in.insert(vm_id, vm.clone());
        self.vms.push(vm);
    }

    /// Removes the migrating-in reservation of the VM.
    pub fn remove_migrating_in_vm(&mut self, vm_id: u32) {
        if self.vms_migrating_in.shift_remove(&vm_id).is_some() {
            self.vms.retain(|vm| vm.borrow().id() != vm_id);
            self.vm_scheduler.deallocate_pes(vm_id);
            self.vm_scheduler.remove_migrating_in(vm_id);
            self.ram_provisioner.deallocate(vm_id);
            self.bw_provisioner.deallocate(vm_id);
            self.storage_provisioner.deallocate(vm_id);
        }
    }

    /// Restores the reservations of VMs migrating into this host.
    ///
    /// Used when the host allocation is rebuilt from a snapshot.
    pub fn reallocate_migrating_in_vms(&mut self, time: f64) {
        let migrating: Vec<Rc<RefCell<Vm>>> = self.vms_migrating_in.values().cloned().collect();
        for vm in migrating {
            let vm_id = vm.borrow().id();
            let (ram, bw, size) = {
                let vm = vm.borrow();
                (vm.ram() as f64, vm.bw() as f64, vm.size() as f64)
            };
            self.storage_provisioner.allocate(vm_id, size);
            self.ram_provisioner.allocate(vm_id, ram);
            self.bw_provisioner.allocate(vm_id, bw);
            self.vm_scheduler.add_migrating_in(vm_id);
            let requested = vm.borrow().current_requested_mips(time);
            self.vm_scheduler.allocate_pes(vm_id, &requested);
            if self.vm_by_id(vm_id).is_none() {
                self.vms.push(vm);
            }
        }
    }

    /// Updates the processing of VMs hosted here.
    ///
    /// Advances cloudlet execution with the previously allocated MIPS shares,
    /// then reallocates PEs according to the current VM demands, applying the
    /// 10% performance degradation to VMs migrating out, and records the host
    /// state history.
    ///
    /// Returns the expected completion time of the next cloudlet on this host,
    /// or `f64::MAX` if there is none.
    pub fn update_vms_processing(&mut self, time: f64) -> f64 {
        let mut smaller_time = f64::MAX;
        for vm in &self.vms {
            let vm_id = vm.borrow().id();
            let mips = self.vm_scheduler.allocated_mips_for_vm(vm_id);
            let next = vm.borrow_mut().update_processing(time, &mips);
            if next > 0. && next < smaller_time {
                smaller_time = next;
            }
        }

        self.previous_utilization_mips = self.utilization_mips;
        self.utilization_mips = 0.;
        let mut host_total_requested_mips = 0.;

        for vm in &self.vms {
            self.vm_scheduler.deallocate_pes(vm.borrow().id());
        }
        for vm in &self.vms {
            let vm = vm.borrow();
            // keep the scheduler migration marks in sync with the VM state
            if vm.is_in_migration() && !self.vms_migrating_in.contains_key(&vm.id()) {
                self.vm_scheduler.add_migrating_out(vm.id());
            } else {
                self.vm_scheduler.remove_migrating_out(vm.id());
            }
            self.vm_scheduler.allocate_pes(vm.id(), &vm.current_requested_mips(time));
        }

        for vm in &self.vms {
            let mut vm = vm.borrow_mut();
            let vm_id = vm.id();
            let total_requested_mips = vm.current_requested_total_mips(time);
            let mut total_allocated_mips = self.vm_scheduler.total_allocated_mips_for_vm(vm_id);

            if !self.vms_migrating_in.contains_key(&vm_id) {
                let missing_mips = total_requested_mips - total_allocated_mips;
                if missing_mips > 0.1 {
                    log_info!(
                        self.ctx,
                        "vm #{} is underallocated: {:.2} MIps could not be allocated",
                        vm_id,
                        missing_mips
                    );
                }
                let is_migrating_out =
                    vm.is_in_migration() && !self.vms_migrating_in.contains_key(&vm_id);
                vm.add_state_history_entry(
                    time,
                    total_allocated_mips,
                    total_requested_mips,
                    is_migrating_out,
                );
                if vm.is_in_migration() {
                    // 10% performance degradation due to migration
                    total_allocated_mips /= 0.9;
                }
            }

            self.utilization_mips += total_allocated_mips;
            host_total_requested_mips += total_requested_mips;
        }

        self.add_state_history_entry(
            time,
            self.utilization_mips,
            host_total_requested_mips,
            self.utilization_mips > 0.,
        );
        let utilization = self.utilization_of_cpu();
        if time == self.last_utilization_history_time {
            if let Some(front) = self.utilization_history.front_mut() {
                *front = utilization;
            }
        } else {
            self.last_utilization_history_time = time;
            self.utilization_history.push_front(utilization);
            self.utilization_history.truncate(HOST_UTILIZATION_HISTORY_LENGTH);
        }
        self.slav_metric.update(time, utilization);

        smaller_time
    }

    /// Returns the VMs whose execution has completed and which are not migrating.
    pub fn completed_vms(&self, time: f64) -> Vec<Rc<RefCell<Vm>>> {
        self.vms
            .iter()
            .filter(|vm| {
                let vm = vm.borrow();
                !vm.is_in_migration() && vm.current_requested_total_mips(time) == 0.
            })
            .cloned()
            .collect()
    }

    /// Total MIPS currently allocated to the VM by the host scheduler.
    pub fn total_allocated_mips_for_vm(&self, vm_id: u32) -> f64 {
        self.vm_scheduler.total_allocated_mips_for_vm(vm_id)
    }

    /// MIPS not allocated to any VM.
    pub fn available_mips(&self) -> f64 {
        self.vm_scheduler.available_mips()
    }

    /// Sum of the nominal MIPS capacities of the hosted VMs.
    pub fn vm_total_mips_sum(&self) -> f64 {
        self.vms.iter().map(|vm| vm.borrow().total_mips()).sum()
    }

    /// Current CPU utilization in [0, 1].
    ///
    /// Values slightly above 1 (up to 1.01) are clamped to 1 to tolerate
    /// cumulative rounding in the MIPS bookkeeping.
    pub fn utilization_of_cpu(&self) -> f64 {
        Self::clamp_utilization(self.utilization_mips / self.total_mips())
    }

    /// CPU utilization at the previous processing update.
    pub fn previous_utilization_of_cpu(&self) -> f64 {
        Self::clamp_utilization(self.previous_utilization_mips / self.total_mips())
    }

    fn clamp_utilization(utilization: f64) -> f64 {
        if utilization > 1. && utilization <= 1.01 {
            return 1.;
        }
        utilization
    }

    /// Current CPU utilization in MIPS.
    pub fn utilization_of_cpu_mips(&self) -> f64 {
        self.utilization_mips
    }

    pub fn power_model(&self) -> Option<&dyn HostPowerModel> {
        self.power_model.as_deref()
    }

    /// Power consumption at the given CPU utilization, 0 for hosts without a power model.
    pub fn power_at(&self, utilization: f64) -> f64 {
        match &self.power_model {
            Some(model) => {
                if utilization == 0. {
                    // a switched off host consumes nothing
                    0.
                } else {
                    model.power(utilization)
                }
            }
            None => 0.,
        }
    }

    /// Current power consumption.
    pub fn power(&self) -> f64 {
        self.power_at(self.utilization_of_cpu())
    }

    /// Power consumption at full load regardless of the current utilization.
    pub fn max_power(&self) -> f64 {
        self.power_model.as_ref().map(|model| model.max_power()).unwrap_or(0.)
    }

    /// Energy consumed over `[t0, t1]`, by convention a linear interpolation
    /// between the utilization samples at the interval endpoints.
    pub fn energy_consumption(&self, t0: f64, t1: f64) -> f64 {
        let from_power = self.power_at(self.previous_utilization_of_cpu());
        let to_power = self.power_at(self.utilization_of_cpu());
        (from_power + (to_power - from_power) / 2.) * (t1 - t0)
    }

    /// Host utilization history ring, the most recent entry first.
    pub fn utilization_history(&self) -> &VecDeque<f64> {
        &self.utilization_history
    }

    pub fn state_history(&self) -> &[HostStateHistoryEntry] {
        &self.state_history
    }

    /// Adds a host state history entry, replacing the last entry if it has the same time.
    fn add_state_history_entry(&mut self, time: f64, allocated_mips: f64, requested_mips: f64, is_active: bool) {
        let entry = HostStateHistoryEntry {
            time,
            allocated_mips,
            requested_mips,
            is_active,
        };
        if let Some(last) = self.state_history.last_mut() {
            if last.time == time {
                *last = entry;
                return;
            }
        }
        self.state_history.push(entry);
    }

    /// Current value of the host SLA violation metric.
    pub fn slav_value(&self) -> f64 {
        self.slav_metric.value()
    }
}
