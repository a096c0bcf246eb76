use dcsim_core::simulation::Simulation;

use dcsim_cloud::core::cloudlet::CloudletState;
use dcsim_cloud::core::cloudlet_scheduler::CloudletSchedulerTimeShared;
use dcsim_cloud::core::config::SimulationConfig;
use dcsim_cloud::core::migration_policy::PowerVmAllocationPolicyMigration;
use dcsim_cloud::core::overload::StaticThreshold;
use dcsim_cloud::core::power_model::{EmpiricalPowerModel, LinearPowerModel};
use dcsim_cloud::core::suitability::Oversubscription;
use dcsim_cloud::core::utilization_model::{UtilizationModelConstant, UtilizationModelFull};
use dcsim_cloud::core::vm_selection::MinimumMigrationTime;
use dcsim_cloud::simulation::CloudSimulation;

fn init_logger() {
    use std::io::Write;
    let _ = env_logger::Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .try_init();
}

fn assert_approx(actual: f64, expected: f64, tolerance: f64) {
    assert!(
        (actual - expected).abs() <= tolerance,
        "expected {} +- {}, got {}",
        expected,
        tolerance,
        actual
    );
}

fn migration_sim(seed: u64, threshold: f64) -> CloudSimulation {
    let sim = Simulation::new(seed);
    let config = SimulationConfig::default();
    CloudSimulation::with_policy(sim, config, move |ctx| {
        Box::new(PowerVmAllocationPolicyMigration::new(
            Box::new(Oversubscription),
            Box::new(MinimumMigrationTime),
            Box::new(StaticThreshold::new(threshold)),
            ctx,
        ))
    })
}

// A power curve that flattens towards full load, so packing work onto the
// most loaded host gives the smallest marginal power increase.
fn concave_power_points() -> Vec<f64> {
    vec![40., 60., 80., 95., 105., 112., 118., 123., 127., 129., 130.]
}

// Two hosts, two half-size VMs, one fully loaded cloudlet per VM.
// Both cloudlets complete after 20 seconds of execution, nothing migrates.
#[test]
fn test_two_hosts_two_vms_complete_without_migrations() {
    init_logger();
    let sim = Simulation::new(123);
    let config = SimulationConfig {
        disable_migrations: true,
        ..SimulationConfig::default()
    };
    let mut cloud = CloudSimulation::new(sim, config);

    for name in ["host1", "host2"] {
        cloud.add_host(name, 1, 1000., 8192, 10000, 100000, Some(Box::new(LinearPowerModel::new(250., 100.))));
    }
    let vm1 = cloud.spawn_vm_now(500., 1, 512, 100, 100, Box::new(CloudletSchedulerTimeShared::new()));
    let vm2 = cloud.spawn_vm_now(500., 1, 512, 100, 100, Box::new(CloudletSchedulerTimeShared::new()));
    cloud.submit_cloudlet(10000., 1, Box::new(UtilizationModelFull::new()), Some(vm1));
    cloud.submit_cloudlet(10000., 1, Box::new(UtilizationModelFull::new()), Some(vm2));

    let end_time = cloud.run();
    assert_approx(end_time, 20., 0.1);

    let broker = cloud.broker();
    let broker = broker.borrow();
    let returned = broker.returned_cloudlets();
    assert_eq!(returned.len(), 2);
    for cloudlet in returned {
        assert_eq!(cloudlet.state(), CloudletState::Success);
        assert_approx(cloudlet.finish_time(), 20., 0.1);
        assert_approx(cloudlet.finish_time() - cloudlet.exec_start_time(), 20., 0.1);
    }
    assert_eq!(cloud.migration_count(), 0);
    // the VMs are spread over both hosts by first fit
    assert!(cloud.energy_consumed() > 0.);
}

// One host loaded at 95% against a static threshold of 80% and one empty
// host: the first optimization pass emits exactly one migration, and by the
// next tick the VM runs on the previously empty host.
//
// The migration takes RAM / (BW / 16) = 1000 / (1000 / 16) = 16 seconds.
#[test]
fn test_overloaded_host_offloads_to_empty_host() {
    init_logger();
    let mut cloud = migration_sim(123, 0.8);
    let h1 = cloud.add_host("host1", 1, 1000., 8192, 1000, 100000, Some(Box::new(LinearPowerModel::new(250., 100.))));
    let h2 = cloud.add_host("host2", 1, 1000., 8192, 1000, 100000, Some(Box::new(LinearPowerModel::new(250., 100.))));

    let vm = cloud.spawn_vm_on_host(1000., 1, 1000, 1000, 100, Box::new(CloudletSchedulerTimeShared::new()), h1);
    cloud.submit_cloudlet(
        10_000_000.,
        1,
        Box::new(UtilizationModelConstant::new(0.95)),
        Some(vm),
    );

    // the first scheduling interval detects the overload and starts the migration
    cloud.step_for_duration(305.);
    assert_eq!(cloud.migration_count(), 1);
    assert!(cloud.vm(vm).borrow().is_in_migration());
    assert_eq!(cloud.vm_location(vm), Some(h1));

    // still in flight 15 seconds later
    cloud.step_for_duration(10.5);
    assert!(cloud.vm(vm).borrow().is_in_migration());

    // and completed within the next second
    cloud.step_for_duration(1.);
    assert!(!cloud.vm(vm).borrow().is_in_migration());
    assert_eq!(cloud.vm_location(vm), Some(h2));
}

// Three underutilized hosts at 10%, 20% and 30% load with a concave power
// model: consolidation empties the two least loaded hosts onto the most
// loaded one, which has the capacity for all three VMs.
#[test]
fn test_consolidation_empties_underutilized_hosts() {
    let sim = Simulation::new(123);
    let config = SimulationConfig::default();
    let mut cloud = CloudSimulation::with_policy(sim, config, |ctx| {
        Box::new(PowerVmAllocationPolicyMigration::new(
            Box::new(Oversubscription),
            Box::new(MinimumMigrationTime),
            Box::new(StaticThreshold::new(0.8)),
            ctx,
        ))
    });

    let mut hosts = Vec::new();
    for name in ["host1", "host2", "host3"] {
        hosts.push(cloud.add_host(
            name,
            1,
            1000.,
            8192,
            1000,
            100000,
            Some(Box::new(EmpiricalPowerModel::new(concave_power_points()))),
        ));
    }

    let mut vms = Vec::new();
    for (idx, utilization) in [0.1, 0.2, 0.3].iter().enumerate() {
        let vm = cloud.spawn_vm_on_host(
            1000.,
            1,
            512,
            100,
            100,
            Box::new(CloudletSchedulerTimeShared::new()),
            hosts[idx],
        );
        cloud.submit_cloudlet(
            10_000_000.,
            1,
            Box::new(UtilizationModelConstant::new(*utilization)),
            Some(vm),
        );
        vms.push(vm);
    }

    let mut last_energy = 0.;
    for _ in 0..13 {
        cloud.step_for_duration(50.);

        // capacity invariants hold at every step
        for &host_id in &hosts {
            let host = cloud.host(host_id);
            let host = host.borrow();
            let allocated: f64 = host
                .vms()
                .iter()
                .map(|vm| host.total_allocated_mips_for_vm(vm.borrow().id()))
                .sum();
            assert!(allocated <= host.total_mips() + 1e-9);
            assert!(host.ram_provisioner().used() <= host.ram_provisioner().capacity() + 1e-9);
            assert!(host.bw_provisioner().used() <= host.bw_provisioner().capacity() + 1e-9);
        }

        // each VM is hosted at most once, ignoring migrating-in reservations
        for &vm_id in &vms {
            let mut hosting = 0;
            for &host_id in &hosts {
                let host = cloud.host(host_id);
                let host = host.borrow();
                if host.vm_by_id(vm_id).is_some() && !host.is_vm_migrating_in(vm_id) {
                    hosting += 1;
                }
            }
            assert!(hosting <= 1, "vm #{} is hosted {} times", vm_id, hosting);
        }

        // accumulated energy never decreases
        let energy = cloud.energy_consumed();
        assert!(energy >= last_energy);
        last_energy = energy;
    }

    // the state history has one entry per processing time, in time order
    for &host_id in &hosts {
        let host = cloud.host(host_id);
        let host = host.borrow();
        let history = host.state_history();
        assert!(!history.is_empty());
        for pair in history.windows(2) {
            assert!(pair[0].time < pair[1].time);
        }
    }

    // both migrations target the host that was loaded at 30%
    assert_eq!(cloud.migration_count(), 2);
    for &vm_id in &vms {
        assert_eq!(cloud.vm_location(vm_id), Some(hosts[2]));
    }
    assert_eq!(cloud.host(hosts[0]).borrow().utilization_of_cpu(), 0.);
    assert_eq!(cloud.host(hosts[1]).borrow().utilization_of_cpu(), 0.);
    assert!(cloud.host(hosts[2]).borrow().utilization_of_cpu() > 0.);
}

// Identical runs produce bitwise identical placements and energy.
#[test]
fn test_placement_is_deterministic() {
    let run = || {
        let mut cloud = migration_sim(7, 0.8);
        let mut hosts = Vec::new();
        for name in ["host1", "host2", "host3"] {
            hosts.push(cloud.add_host(
                name,
                1,
                1000.,
                8192,
                1000,
                100000,
                Some(Box::new(EmpiricalPowerModel::new(concave_power_points()))),
            ));
        }
        let mut vms = Vec::new();
        for (idx, utilization) in [0.25, 0.15, 0.35].iter().enumerate() {
            let vm = cloud.spawn_vm_on_host(
                1000.,
                1,
                512,
                100,
                100,
                Box::new(CloudletSchedulerTimeShared::new()),
                hosts[idx],
            );
            cloud.submit_cloudlet(
                10_000_000.,
                1,
                Box::new(UtilizationModelConstant::new(*utilization)),
                Some(vm),
            );
            vms.push(vm);
        }
        cloud.step_for_duration(650.);
        let locations: Vec<Option<u32>> = vms.iter().map(|&vm| cloud.vm_location(vm)).collect();
        (locations, cloud.migration_count(), cloud.energy_consumed())
    };

    let first = run();
    let second = run();
    assert_eq!(first.0, second.0);
    assert_eq!(first.1, second.1);
    assert_eq!(first.2, second.2);
}

// Non-power-aware accounting: every host is billed its full power for the
// whole simulated day regardless of its load.
#[test]
fn test_non_power_aware_energy() {
    let sim = Simulation::new(123);
    let config = SimulationConfig {
        disable_migrations: true,
        simulation_limit: 86401.,
        ..SimulationConfig::default()
    };
    let mut cloud = CloudSimulation::new(sim, config);
    cloud.set_non_power_aware();

    for name in ["host1", "host2", "host3", "host4"] {
        cloud.add_host(name, 2, 1000., 16384, 10000, 100000, Some(Box::new(LinearPowerModel::new(250., 100.))));
    }
    for _ in 0..8 {
        let vm = cloud.spawn_vm_now(500., 1, 512, 100, 100, Box::new(CloudletSchedulerTimeShared::new()));
        // 100000 seconds of work, far beyond the simulated day
        cloud.submit_cloudlet(50_000_000., 1, Box::new(UtilizationModelFull::new()), Some(vm));
    }

    let end_time = cloud.run();
    assert_approx(end_time, 86400., 1.);
    // 4 hosts at max power 250 W for 86400 seconds
    assert_approx(cloud.energy_consumed(), 4. * 250. * 86400., 10.);
}

// Metrics of a finished run are collected from the datacenter and hosts.
#[test]
fn test_metrics_collection() {
    let mut cloud = migration_sim(123, 0.8);
    let h1 = cloud.add_host("host1", 1, 1000., 8192, 1000, 100000, Some(Box::new(LinearPowerModel::new(250., 100.))));
    cloud.add_host("host2", 1, 1000., 8192, 1000, 100000, Some(Box::new(LinearPowerModel::new(250., 100.))));

    let vm = cloud.spawn_vm_on_host(1000., 1, 1000, 1000, 100, Box::new(CloudletSchedulerTimeShared::new()), h1);
    cloud.submit_cloudlet(
        10_000_000.,
        1,
        Box::new(UtilizationModelConstant::new(0.95)),
        Some(vm),
    );

    cloud.step_for_duration(650.);
    let metrics = cloud.metrics("overload_offloading");
    assert_eq!(metrics.experiment_name, "overload_offloading");
    assert!(metrics.simulation_time > 600.);
    assert!(metrics.energy_consumption > 0.);
    assert!(metrics.migration_count >= 1);
    assert!(metrics.mean_optimization_time >= 0.);
}
