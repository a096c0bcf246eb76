//! The main entry point for simulation configuration and execution.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use sugars::{rc, refcell};

use dcsim_core::component::Id;
use dcsim_core::context::SimulationContext;
use dcsim_core::simulation::Simulation;

use crate::core::allocation_policy::{PowerVmAllocationPolicySimple, VmAllocationPolicy};
use crate::core::broker::Broker;
use crate::core::cloudlet::Cloudlet;
use crate::core::cloudlet_scheduler::{CloudletScheduler, CloudletSchedulerTimeShared};
use crate::core::config::SimulationConfig;
use crate::core::datacenter::Datacenter;
use crate::core::host::Host;
use crate::core::metrics::{mean, ExperimentMetrics};
use crate::core::pe::{make_pe_list, Pe};
use crate::core::power_model::HostPowerModel;
use crate::core::suitability::suitability_for_config;
use crate::core::utilization_model::{UtilizationModel, UtilizationModelFull};
use crate::core::vm::{Vm, VmRegistry};
use crate::core::vm_scheduler::{VmScheduler, VmSchedulerTimeShared};
use crate::extensions::workload::WorkloadSource;

/// Default cloudlet input and output file sizes.
const CLOUDLET_FILE_SIZE: u64 = 300;

/// Represents a cloud simulation, provides methods for its configuration and execution.
///
/// It wires the kernel, the datacenter with its allocation policy, and the
/// broker together and provides convenient access to them.
pub struct CloudSimulation {
    sim: Simulation,
    datacenter: Rc<RefCell<Datacenter>>,
    datacenter_id: Id,
    broker: Rc<RefCell<Broker>>,
    broker_id: Id,
    vm_registry: Rc<RefCell<VmRegistry>>,
    hosts: BTreeMap<u32, Rc<RefCell<Host>>>,
    next_cloudlet_id: u32,
    sim_config: Rc<SimulationConfig>,
}

impl CloudSimulation {
    /// Creates a simulation with the first-fit allocation policy selected by the config.
    pub fn new(sim: Simulation, sim_config: SimulationConfig) -> Self {
        let oversubscribe = sim_config.oversubscribe;
        Self::with_policy(sim, sim_config, |ctx| {
            Box::new(PowerVmAllocationPolicySimple::new(
                suitability_for_config(oversubscribe),
                ctx,
            ))
        })
    }

    /// Creates a simulation with a custom VM allocation policy.
    pub fn with_policy<F>(mut sim: Simulation, sim_config: SimulationConfig, make_policy: F) -> Self
    where
        F: FnOnce(SimulationContext) -> Box<dyn VmAllocationPolicy>,
    {
        sim.set_min_event_gap(sim_config.min_event_gap);
        if sim_config.simulation_limit > 0. {
            sim.terminate_at(sim_config.simulation_limit);
        }
        let sim_config = rc!(sim_config);

        let vm_registry = rc!(refcell!(VmRegistry::new()));
        let policy = make_policy(sim.create_context("allocation_policy"));

        let datacenter = rc!(refcell!(Datacenter::new(
            policy,
            vm_registry.clone(),
            true,
            sim.create_context("datacenter"),
            sim_config.clone(),
        )));
        let datacenter_id = sim.add_handler("datacenter", datacenter.clone());

        let broker = rc!(refcell!(Broker::new(
            datacenter_id,
            vm_registry.clone(),
            sim.create_context("broker"),
        )));
        let broker_id = sim.add_handler("broker", broker.clone());

        Self {
            sim,
            datacenter,
            datacenter_id,
            broker,
            broker_id,
            vm_registry,
            hosts: BTreeMap::new(),
            next_cloudlet_id: 0,
            sim_config,
        }
    }

    /// Switches the datacenter to the non-power-aware energy accounting
    /// (`max_power × Δt` per host regardless of the load).
    ///
    /// Should be called before the simulation is started.
    pub fn set_non_power_aware(&mut self) {
        self.datacenter.borrow_mut().set_power_aware(false);
    }

    /// Creates a new host with a time-shared VM scheduler, returns the host ID.
    pub fn add_host(
        &mut self,
        name: &str,
        pe_count: u32,
        mips_per_pe: f64,
        ram: u64,
        bw: u64,
        storage: u64,
        power_model: Option<Box<dyn HostPowerModel>>,
    ) -> u32 {
        let pes = make_pe_list(pe_count, mips_per_pe);
        let scheduler = Box::new(VmSchedulerTimeShared::new(&pes));
        self.add_host_with_scheduler(name, pes, ram, bw, storage, scheduler, power_model)
    }

    /// Creates a new host with the given PEs and VM scheduler, returns the host ID.
    pub fn add_host_with_scheduler(
        &mut self,
        name: &str,
        pes: Vec<Pe>,
        ram: u64,
        bw: u64,
        storage: u64,
        vm_scheduler: Box<dyn VmScheduler>,
        power_model: Option<Box<dyn HostPowerModel>>,
    ) -> u32 {
        let ctx = self.sim.create_context(name);
        let id = ctx.id();
        let host = rc!(refcell!(Host::new(pes, ram, bw, storage, vm_scheduler, power_model, ctx)));
        self.datacenter.borrow_mut().add_host(host.clone());
        self.hosts.insert(id, host);
        id
    }

    /// Creates a new VM and immediately submits its creation request via the broker.
    /// Returns the VM ID.
    pub fn spawn_vm_now(
        &mut self,
        mips_per_pe: f64,
        pes: u32,
        ram: u64,
        bw: u64,
        size: u64,
        cloudlet_scheduler: Box<dyn CloudletScheduler>,
    ) -> u32 {
        self.spawn_vm_with_delay(mips_per_pe, pes, ram, bw, size, cloudlet_scheduler, 0.)
    }

    /// Creates a new VM and submits its creation request with the given delay.
    /// Returns the VM ID.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_vm_with_delay(
        &mut self,
        mips_per_pe: f64,
        pes: u32,
        ram: u64,
        bw: u64,
        size: u64,
        cloudlet_scheduler: Box<dyn CloudletScheduler>,
        delay: f64,
    ) -> u32 {
        let id = self.vm_registry.borrow_mut().generate_id();
        let vm = Vm::new(id, self.broker_id, mips_per_pe, pes, ram, bw, size, cloudlet_scheduler);
        self.vm_registry.borrow_mut().register(vm);
        self.broker.borrow_mut().submit_vm(id, delay);
        id
    }

    /// Creates a new VM and places it on the given host bypassing the broker
    /// and the host search. This is useful for creating the initial resource
    /// pool state.
    ///
    /// Panics if the host cannot accommodate the VM.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_vm_on_host(
        &mut self,
        mips_per_pe: f64,
        pes: u32,
        ram: u64,
        bw: u64,
        size: u64,
        cloudlet_scheduler: Box<dyn CloudletScheduler>,
        host_id: u32,
    ) -> u32 {
        let id = self.vm_registry.borrow_mut().generate_id();
        let vm = Vm::new(id, self.broker_id, mips_per_pe, pes, ram, bw, size, cloudlet_scheduler);
        self.vm_registry.borrow_mut().register(vm);
        let placed = self.datacenter.borrow_mut().place_vm_on_host(id, host_id);
        assert!(placed, "can't place vm #{} on host #{}", id, host_id);
        id
    }

    /// Creates a cloudlet and hands it to the broker for submission.
    /// Returns the cloudlet ID.
    pub fn submit_cloudlet(
        &mut self,
        length: f64,
        pes: u32,
        utilization_model: Box<dyn UtilizationModel>,
        vm_id: Option<u32>,
    ) -> u32 {
        let id = self.next_cloudlet_id;
        self.next_cloudlet_id += 1;
        let mut cloudlet = Cloudlet::new(
            id,
            self.broker_id,
            length,
            pes,
            CLOUDLET_FILE_SIZE,
            CLOUDLET_FILE_SIZE,
            utilization_model,
        );
        if let Some(vm_id) = vm_id {
            cloudlet.set_vm_id(vm_id);
        }
        self.broker.borrow_mut().submit_cloudlet(cloudlet);
        id
    }

    /// Spawns a VM and a fully loaded cloudlet for every entry of the workload source.
    pub fn spawn_vms_from_workload(&mut self, source: &mut dyn WorkloadSource, mips_per_pe: f64, vm_size: u64) {
        while let Some(entry) = source.next_entry() {
            let vm_id = self.spawn_vm_with_delay(
                mips_per_pe,
                entry.pes,
                entry.ram,
                entry.bw,
                vm_size,
                Box::new(CloudletSchedulerTimeShared::new()),
                entry.arrival_time,
            );
            self.submit_cloudlet(
                entry.length,
                entry.pes,
                Box::new(UtilizationModelFull::new()),
                Some(vm_id),
            );
        }
    }

    /// Runs the simulation to completion and returns the final simulation time.
    pub fn run(&mut self) -> f64 {
        self.sim.run()
    }

    /// Performs the specified number of steps through the simulation.
    pub fn steps(&mut self, step_count: u64) -> bool {
        self.sim.steps(step_count)
    }

    /// Steps through the simulation with duration limit.
    pub fn step_for_duration(&mut self, duration: f64) {
        self.sim.step_for_duration(duration);
    }

    /// Returns the current simulation time.
    pub fn current_time(&self) -> f64 {
        self.sim.time()
    }

    /// Returns the reference to the host.
    pub fn host(&self, host_id: u32) -> Rc<RefCell<Host>> {
        self.hosts.get(&host_id).unwrap().clone()
    }

    /// Returns the reference to the VM.
    pub fn vm(&self, vm_id: u32) -> Rc<RefCell<Vm>> {
        self.vm_registry.borrow().get(vm_id)
    }

    /// Returns the ID of the host currently serving the VM.
    pub fn vm_location(&self, vm_id: u32) -> Option<u32> {
        self.vm_registry.borrow().get(vm_id).borrow().host_id()
    }

    /// Returns the reference to the broker.
    pub fn broker(&self) -> Rc<RefCell<Broker>> {
        self.broker.clone()
    }

    /// Returns the broker entity ID.
    pub fn broker_id(&self) -> Id {
        self.broker_id
    }

    /// Returns the datacenter entity ID.
    pub fn datacenter_id(&self) -> Id {
        self.datacenter_id
    }

    /// Accumulated datacenter energy consumption in watt-seconds.
    pub fn energy_consumed(&self) -> f64 {
        self.datacenter.borrow().power()
    }

    /// Number of started VM migrations.
    pub fn migration_count(&self) -> u32 {
        self.datacenter.borrow().migration_count()
    }

    /// Returns the simulation config.
    pub fn sim_config(&self) -> Rc<SimulationConfig> {
        self.sim_config.clone()
    }

    /// Collects the summary metrics of the finished run.
    pub fn metrics(&self, experiment_name: &str) -> ExperimentMetrics {
        let sla_violation = mean(
            &self
                .hosts
                .values()
                .map(|host| host.borrow().slav_value())
                .collect::<Vec<_>>(),
        );
        let datacenter = self.datacenter.borrow();
        ExperimentMetrics {
            experiment_name: experiment_name.to_string(),
            simulation_time: self.sim.time(),
            energy_consumption: datacenter.power(),
            migration_count: datacenter.migration_count(),
            sla_violation,
            mean_optimization_time: mean(datacenter.policy().optimization_time_history()),
        }
    }
}
