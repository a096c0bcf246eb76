//! Virtual machines.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;

use crate::core::cloudlet::Cloudlet;
use crate::core::cloudlet_scheduler::CloudletScheduler;

/// Length of the VM utilization history ring used by selection policies.
pub const VM_UTILIZATION_HISTORY_LENGTH: usize = 10;

/// An entry of the VM allocation history.
#[derive(Clone, Debug, PartialEq)]
pub struct VmStateHistoryEntry {
    pub time: f64,
    pub allocated_mips: f64,
    pub requested_mips: f64,
    pub in_migration: bool,
}

/// A virtual machine, pinned to exactly one host at a time except during migration.
pub struct Vm {
    id: u32,
    owner: u32,
    mips: f64,
    pes: u32,
    ram: u64,
    bw: u64,
    size: u64,
    host_id: Option<u32>,
    in_migration: bool,
    created: bool,
    cloudlet_scheduler: Box<dyn CloudletScheduler>,
    utilization_history: VecDeque<f64>,
    state_history: Vec<VmStateHistoryEntry>,
    last_utilization_history_time: f64,
}

impl Serialize for Vm {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Vm", 3)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("mips", &self.mips)?;
        state.serialize_field("pes", &self.pes)?;
        state.end()
    }
}

impl Vm {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        owner: u32,
        mips: f64,
        pes: u32,
        ram: u64,
        bw: u64,
        size: u64,
        cloudlet_scheduler: Box<dyn CloudletScheduler>,
    ) -> Self {
        Self {
            id,
            owner,
            mips,
            pes,
            ram,
            bw,
            size,
            host_id: None,
            in_migration: false,
            created: false,
            cloudlet_scheduler,
            utilization_history: VecDeque::new(),
            state_history: Vec::new(),
            last_utilization_history_time: -1.,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn owner(&self) -> u32 {
        self.owner
    }

    /// Requested MIPS per PE.
    pub fn mips(&self) -> f64 {
        self.mips
    }

    pub fn pes(&self) -> u32 {
        self.pes
    }

    pub fn ram(&self) -> u64 {
        self.ram
    }

    pub fn bw(&self) -> u64 {
        self.bw
    }

    /// VM image size.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn total_mips(&self) -> f64 {
        self.mips * self.pes as f64
    }

    pub fn host_id(&self) -> Option<u32> {
        self.host_id
    }

    pub fn set_host_id(&mut self, host_id: Option<u32>) {
        self.host_id = host_id;
    }

    pub fn is_in_migration(&self) -> bool {
        self.in_migration
    }

    pub fn set_in_migration(&mut self, in_migration: bool) {
        self.in_migration = in_migration;
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn set_created(&mut self, created: bool) {
        self.created = created;
    }

    /// MIPS currently requested by the VM, one entry per PE.
    ///
    /// A VM being instantiated requests its full capacity, afterwards the
    /// request is driven by the utilization of its cloudlets.
    pub fn current_requested_mips(&self, time: f64) -> Vec<f64> {
        if !self.created {
            return vec![self.mips; self.pes as usize];
        }
        self.cloudlet_scheduler.requested_mips(time, self.mips, self.pes)
    }

    pub fn current_requested_total_mips(&self, time: f64) -> f64 {
        self.current_requested_mips(time).iter().sum()
    }

    /// Current CPU utilization of the VM relative to its total capacity, in [0, 1].
    pub fn cpu_utilization(&self, time: f64) -> f64 {
        (self.current_requested_total_mips(time) / self.total_mips()).min(1.)
    }

    /// Submits a cloudlet to the VM's scheduler, returns the estimated completion time.
    pub fn submit_cloudlet(&mut self, mut cloudlet: Cloudlet, time: f64) -> f64 {
        cloudlet.set_vm_id(self.id);
        self.cloudlet_scheduler.submit(cloudlet, time, self.mips, self.pes)
    }

    /// Advances the execution of the VM's cloudlets with the given allocated
    /// MIPS share and records the utilization history.
    ///
    /// Returns the expected completion time of the next cloudlet, or
    /// `f64::MAX` if there is none.
    pub fn update_processing(&mut self, time: f64, mips_share: &[f64]) -> f64 {
        let result = self
            .cloudlet_scheduler
            .update_processing(time, mips_share, self.mips, self.pes);
        if time != self.last_utilization_history_time {
            self.last_utilization_history_time = time;
            self.utilization_history.push_front(self.cpu_utilization(time));
            self.utilization_history.truncate(VM_UTILIZATION_HISTORY_LENGTH);
        }
        result
    }

    pub fn take_finished_cloudlets(&mut self) -> Vec<Cloudlet> {
        self.cloudlet_scheduler.take_finished()
    }

    pub fn active_cloudlet_count(&self) -> usize {
        self.cloudlet_scheduler.active_count()
    }

    /// Utilization history ring, the most recent entry first.
    pub fn utilization_history(&self) -> &VecDeque<f64> {
        &self.utilization_history
    }

    pub fn state_history(&self) -> &[VmStateHistoryEntry] {
        &self.state_history
    }

    /// Adds a VM state history entry, replacing the last entry if it has the same time.
    pub fn add_state_history_entry(
        &mut self,
        time: f64,
        allocated_mips: f64,
        requested_mips: f64,
        in_migration: bool,
    ) {
        let entry = VmStateHistoryEntry {
            time,
            allocated_mips,
            requested_mips,
            in_migration,
        };
        if let Some(last) = self.state_history.last_mut() {
            if last.time == time {
                *last = entry;
                return;
            }
        }
        self.state_history.push(entry);
    }
}

/// Registry of all VMs participating in the simulation, shared between the
/// broker and the datacenter. Components exchange VM identifiers in events and
/// resolve them here.
pub struct VmRegistry {
    vms: IndexMap<u32, Rc<RefCell<Vm>>>,
    next_id: u32,
}

impl VmRegistry {
    pub fn new() -> Self {
        Self {
            vms: IndexMap::new(),
            next_id: 0,
        }
    }

    pub fn generate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn register(&mut self, vm: Vm) -> Rc<RefCell<Vm>> {
        let id = vm.id();
        self.next_id = self.next_id.max(id + 1);
        let vm = Rc::new(RefCell::new(vm));
        self.vms.insert(id, vm.clone());
        vm
    }

    /// Returns the VM with the given id.
    ///
    /// Panics if the VM is not registered, which indicates an event with a
    /// stale or corrupted VM id.
    pub fn get(&self, vm_id: u32) -> Rc<RefCell<Vm>> {
        self.vms
            .get(&vm_id)
            .unwrap_or_else(|| panic!("unknown vm #{}", vm_id))
            .clone()
    }

    pub fn contains(&self, vm_id: u32) -> bool {
        self.vms.contains_key(&vm_id)
    }

    pub fn ids(&self) -> Vec<u32> {
        self.vms.keys().cloned().collect()
    }
}

impl Default for VmRegistry {
    fn default() -> Self {
        Self::new()
    }
}
