//! The datacenter entity driving host processing, energy accounting and migrations.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use dcsim_core::cast;
use dcsim_core::context::SimulationContext;
use dcsim_core::event::Event;
use dcsim_core::handler::EventHandler;
use dcsim_core::{log_debug, log_info, log_trace, log_warn};

use crate::core::allocation_policy::VmAllocationPolicy;
use crate::core::cloudlet::{Cloudlet, CloudletState};
use crate::core::config::SimulationConfig;
use crate::core::events::cloudlet::{CloudletCompleted, CloudletSubmission};
use crate::core::events::datacenter::ProcessingTick;
use crate::core::events::vm::{VmCreationAck, VmCreationRequest, VmDestructionRequest, VmMigrationFinished};
use crate::core::host::Host;
use crate::core::vm::{Vm, VmRegistry};

/// A datacenter owning a set of hosts through its VM allocation policy.
///
/// The datacenter periodically re-processes its hosts (every
/// `scheduling_interval` seconds of simulation time, or earlier when a
/// cloudlet completion is expected), accumulates the consumed energy and,
/// unless migrations are disabled, asks the allocation policy for placement
/// optimizations and orchestrates the resulting live migrations.
pub struct Datacenter {
    policy: Box<dyn VmAllocationPolicy>,
    vm_registry: Rc<RefCell<VmRegistry>>,
    vms: IndexMap<u32, Rc<RefCell<Vm>>>,
    power_aware: bool,
    power: f64,
    migration_count: u32,
    last_process_time: f64,
    cloudlet_submitted: f64,
    ctx: SimulationContext,
    sim_config: Rc<SimulationConfig>,
}

impl Datacenter {
    pub fn new(
        policy: Box<dyn VmAllocationPolicy>,
        vm_registry: Rc<RefCell<VmRegistry>>,
        power_aware: bool,
        ctx: SimulationContext,
        sim_config: Rc<SimulationConfig>,
    ) -> Self {
        Self {
            policy,
            vm_registry,
            vms: IndexMap::new(),
            power_aware,
            power: 0.,
            migration_count: 0,
            last_process_time: 0.,
            cloudlet_submitted: -1.,
            ctx,
            sim_config,
        }
    }

    pub fn id(&self) -> u32 {
        self.ctx.id()
    }

    pub fn add_host(&mut self, host: Rc<RefCell<Host>>) {
        self.policy.add_host(host);
    }

    pub fn hosts(&self) -> &[Rc<RefCell<Host>>] {
        self.policy.hosts()
    }

    /// Switches between the power-aware and the `max_power × Δt` energy accounting.
    pub fn set_power_aware(&mut self, power_aware: bool) {
        self.power_aware = power_aware;
    }

    /// Accumulated energy consumption in watt-seconds.
    pub fn power(&self) -> f64 {
        self.power
    }

    pub fn migration_count(&self) -> u32 {
        self.migration_count
    }

    pub fn policy(&self) -> &dyn VmAllocationPolicy {
        self.policy.as_ref()
    }

    /// Places the VM on the given host directly, bypassing the host search.
    /// This is useful for creating the initial resource pool state.
    pub fn place_vm_on_host(&mut self, vm_id: u32, host_id: u32) -> bool {
        let vm = self.vm_registry.borrow().get(vm_id);
        let placed = self.policy.allocate_host_for_vm_on(&vm, host_id, self.ctx.time());
        if placed {
            vm.borrow_mut().set_created(true);
            self.vms.insert(vm_id, vm);
        }
        placed
    }

    fn host_by_id(&self, host_id: u32) -> Rc<RefCell<Host>> {
        self.policy
            .hosts()
            .iter()
            .find(|host| host.borrow().id() == host_id)
            .unwrap_or_else(|| panic!("unknown host #{}", host_id))
            .clone()
    }

    fn is_processing_tick(event: &Event) -> bool {
        event.data.is::<ProcessingTick>()
    }

    fn on_vm_creation_request(&mut self, vm_id: u32, ack: bool, src: u32) {
        let vm = self.vm_registry.borrow().get(vm_id);
        let success = self.policy.allocate_host_for_vm(&vm, self.ctx.time());
        let host_id = vm.borrow().host_id();
        if success {
            // from now on the VM demand is driven by its cloudlets
            vm.borrow_mut().set_created(true);
            self.vms.insert(vm_id, vm);
        } else {
            log_warn!(self.ctx, "failed to create vm #{}: no suitable host", vm_id);
        }
        if ack {
            self.ctx.emit_now(
                VmCreationAck {
                    vm_id,
                    host_id: host_id.unwrap_or(0),
                    success,
                },
                src,
            );
        }
    }

    fn on_vm_destruction_request(&mut self, vm_id: u32) {
        if self.vms.shift_remove(&vm_id).is_some() {
            self.policy.deallocate_host_for_vm(vm_id);
            log_debug!(self.ctx, "vm #{} destroyed", vm_id);
        }
    }

    fn on_cloudlet_submission(&mut self, mut cloudlet: Cloudlet) {
        self.update_cloudlet_processing();

        let cloudlet_id = cloudlet.id();
        let vm_id = cloudlet
            .vm_id()
            .unwrap_or_else(|| panic!("cloudlet #{} submitted without a bound vm", cloudlet_id));
        if !self.vms.contains_key(&vm_id) {
            log_warn!(
                self.ctx,
                "cloudlet #{} rejected: vm #{} is not running in this datacenter",
                cloudlet_id,
                vm_id
            );
            cloudlet.set_state(CloudletState::Failed);
            let owner = cloudlet.user_id();
            self.ctx.emit_now(CloudletCompleted { cloudlet }, owner);
            return;
        }

        let now = self.ctx.time();
        let vm = self.vm_registry.borrow().get(vm_id);
        let estimate = vm.borrow_mut().submit_cloudlet(cloudlet, now);
        log_debug!(self.ctx, "cloudlet #{} submitted to vm #{}", cloudlet_id, vm_id);
        if estimate > now && estimate < f64::MAX {
            self.ctx.emit_self(ProcessingTick {}, estimate - now);
        }
        self.cloudlet_submitted = now;
    }

    fn on_vm_migration_finished(&mut self, vm_id: u32, target_host: u32) {
        if self.ctx.time() > self.last_process_time {
            self.update_processing_force();
        }

        let vm = self.vm_registry.borrow().get(vm_id);
        self.policy.deallocate_host_for_vm(vm_id);
        self.host_by_id(target_host).borrow_mut().remove_migrating_in_vm(vm_id);
        let placed = self.policy.allocate_host_for_vm_on(&vm, target_host, self.ctx.time());
        if !placed {
            panic!(
                "failed to complete migration of vm #{} to host #{}: reservation was lost",
                vm_id, target_host
            );
        }
        vm.borrow_mut().set_in_migration(false);
        log_debug!(self.ctx, "migration of vm #{} to host #{} completed", vm_id, target_host);

        // refresh the processing unless another migration lands at this very moment
        let pending = self
            .ctx
            .find_first_deferred(|event| event.data.is::<VmMigrationFinished>());
        if pending.map_or(true, |event| event.time > self.ctx.time()) {
            self.update_processing_force();
        }
    }

    /// The periodic processing tick.
    fn update_cloudlet_processing(&mut self) {
        // stay idle until the first cloudlet arrives; submissions at the
        // current time postpone the processing to the next interval
        if self.cloudlet_submitted < 0. || self.cloudlet_submitted == self.ctx.time() {
            let id = self.ctx.id();
            self.ctx
                .cancel_events(|event| event.dst == id && Self::is_processing_tick(event));
            self.ctx
                .emit_self(ProcessingTick {}, self.sim_config.scheduling_interval);
            return;
        }

        let current_time = self.ctx.time();
        if current_time <= self.last_process_time {
            return;
        }

        let mut min_time = self.update_processing_force();

        if !self.sim_config.disable_migrations {
            let decisions = self.policy.optimize_allocation(current_time);
            for decision in decisions {
                let vm_id = decision.vm.borrow().id();
                let target = self.host_by_id(decision.target_host);
                match decision.source_host {
                    Some(source) => log_info!(
                        self.ctx,
                        "started migrating vm #{} from host #{} to host #{}",
                        vm_id,
                        source,
                        decision.target_host
                    ),
                    None => log_info!(
                        self.ctx,
                        "started migrating vm #{} to host #{}",
                        vm_id,
                        decision.target_host
                    ),
                }
                target.borrow_mut().add_migrating_in_vm(decision.vm.clone(), current_time);
                self.migration_count += 1;

                // migration delay = RAM / available bandwidth, where only half
                // of the target host bandwidth is available for migration and
                // the other half serves normal VM communication
                let ram = decision.vm.borrow().ram() as f64;
                let bw = target.borrow().bw() as f64;
                let delay = ram / (bw / (2. * 8.));
                self.ctx.emit_self(
                    VmMigrationFinished {
                        vm_id,
                        target_host: decision.target_host,
                    },
                    delay,
                );
            }
        }

        let mut timeframe_energy = 0.;
        for host in self.policy.hosts() {
            let host = host.borrow();
            let host_energy = if self.power_aware {
                host.energy_consumption(self.last_process_time, current_time)
            } else {
                host.max_power() * (current_time - self.last_process_time)
            };
            timeframe_energy += host_energy;
        }
        self.power += timeframe_energy;
        log_trace!(
            self.ctx,
            "total energy for time frame [{:.3}, {:.3}]: {:.2} Ws",
            self.last_process_time,
            current_time,
            timeframe_energy
        );

        // ensure a minimal time between processing ticks, and never skip over
        // a point of the scheduling grid
        min_time = min_time.max(current_time + self.ctx.min_event_gap() + 0.01);
        let interval = self.sim_config.scheduling_interval;
        min_time = min_time.min(current_time + (interval - current_time % interval));

        let id = self.ctx.id();
        self.ctx
            .cancel_events(|event| event.dst == id && Self::is_processing_tick(event));
        if self.vms.is_empty() {
            log_trace!(self.ctx, "no active vms, processing suspended");
        } else {
            self.ctx.emit_self(ProcessingTick {}, min_time - current_time);
        }

        self.last_process_time = current_time;
    }

    /// Updates every host, returns completed cloudlets to their owners and
    /// deallocates completed VMs.
    ///
    /// Returns the minimum over hosts of the expected next completion time.
    fn update_processing_force(&mut self) -> f64 {
        let current_time = self.ctx.time();
        let mut min_time = f64::MAX;

        let hosts: Vec<Rc<RefCell<Host>>> = self.policy.hosts().to_vec();
        for host in &hosts {
            let time = host.borrow_mut().update_vms_processing(current_time);
            if time < min_time {
                min_time = time;
            }
        }

        for host in &hosts {
            let vms: Vec<Rc<RefCell<Vm>>> = host.borrow().vms().to_vec();
            for vm in vms {
                let (vm_id, owner) = {
                    let vm = vm.borrow();
                    (vm.id(), vm.owner())
                };
                let finished = vm.borrow_mut().take_finished_cloudlets();
                for cloudlet in finished {
                    log_debug!(self.ctx, "cloudlet #{} completed on vm #{}", cloudlet.id(), vm_id);
                    self.ctx.emit_now(CloudletCompleted { cloudlet }, owner);
                }
            }
        }

        for host in &hosts {
            let host_id = host.borrow().id();
            let completed = host.borrow().completed_vms(current_time);
            for vm in completed {
                let vm_id = vm.borrow().id();
                self.policy.deallocate_host_for_vm(vm_id);
                self.vms.shift_remove(&vm_id);
                log_info!(self.ctx, "removed completed vm #{} from host #{}", vm_id, host_id);
            }
        }

        self.last_process_time = current_time;
        min_time
    }
}

impl EventHandler for Datacenter {
    fn on(&mut self, event: Event) {
        let src = event.src;
        cast!(match event.data {
            VmCreationRequest { vm_id, ack } => {
                self.on_vm_creation_request(vm_id, ack, src);
            }
            VmDestructionRequest { vm_id } => {
                self.on_vm_destruction_request(vm_id);
            }
            VmMigrationFinished { vm_id, target_host } => {
                self.on_vm_migration_finished(vm_id, target_host);
            }
            CloudletSubmission { cloudlet } => {
                self.on_cloudlet_submission(cloudlet);
            }
            ProcessingTick {} => {
                self.update_cloudlet_processing();
            }
        })
    }

    fn on_shutdown(&mut self) {
        log_info!(
            self.ctx,
            "datacenter finished: energy consumed {:.2} Ws, {} migrations",
            self.power,
            self.migration_count
        );
    }
}
