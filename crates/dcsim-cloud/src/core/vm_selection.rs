//! VM selection policies used to pick migration victims on overloaded hosts.

use std::cell::RefCell;
use std::rc::Rc;

use dcsim_core::context::SimulationContext;

use crate::core::host::Host;
use crate::core::vm::Vm;

/// Selects the next VM to migrate away from a host.
///
/// Only VMs that are not already migrating are candidates. Returns `None`
/// when the host has no movable VM left.
pub trait VmSelectionPolicy {
    fn select_vm_to_migrate(&self, host: &Host, ctx: &SimulationContext) -> Option<Rc<RefCell<Vm>>>;
}

fn movable_vms(host: &Host) -> Vec<Rc<RefCell<Vm>>> {
    host.vms()
        .iter()
        .filter(|vm| !vm.borrow().is_in_migration())
        .cloned()
        .collect()
}

////////////////////////////////////////////////////////////////////////////////

/// Picks the VM with the minimum RAM footprint, i.e. the shortest migration.
pub struct MinimumMigrationTime;

impl VmSelectionPolicy for MinimumMigrationTime {
    fn select_vm_to_migrate(&self, host: &Host, _ctx: &SimulationContext) -> Option<Rc<RefCell<Vm>>> {
        let mut result: Option<Rc<RefCell<Vm>>> = None;
        let mut min_ram = u64::MAX;
        for vm in movable_vms(host) {
            let ram = vm.borrow().ram();
            if ram < min_ram {
                min_ram = ram;
                result = Some(vm);
            }
        }
        result
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Picks the VM whose utilization history correlates the most with the
/// aggregate utilization of the other VMs on the host.
///
/// Falls back to minimum migration time when the histories are too short to
/// correlate.
pub struct MaximumCorrelation;

/// Number of utilization history entries required to compute a correlation.
const MIN_CORRELATION_HISTORY: usize = 3;

impl VmSelectionPolicy for MaximumCorrelation {
    fn select_vm_to_migrate(&self, host: &Host, ctx: &SimulationContext) -> Option<Rc<RefCell<Vm>>> {
        let vms = movable_vms(host);
        if vms.is_empty() {
            return None;
        }

        let histories: Vec<Vec<f64>> = vms
            .iter()
            .map(|vm| vm.borrow().utilization_history().iter().cloned().collect())
            .collect();
        let common_length = histories.iter().map(|h| h.len()).min().unwrap();
        if common_length < MIN_CORRELATION_HISTORY || vms.len() < 2 {
            return MinimumMigrationTime.select_vm_to_migrate(host, ctx);
        }

        let mut result = None;
        let mut max_correlation = f64::MIN;
        for (idx, history) in histories.iter().enumerate() {
            let others: Vec<f64> = (0..common_length)
                .map(|step| {
                    histories
                        .iter()
                        .enumerate()
                        .filter(|(other, _)| *other != idx)
                        .map(|(_, h)| h[step])
                        .sum()
                })
                .collect();
            let correlation = pearson_correlation(&history[..common_length], &others);
            if correlation > max_correlation {
                max_correlation = correlation;
                result = Some(vms[idx].clone());
            }
        }
        result
    }
}

fn pearson_correlation(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let mut covariance = 0.;
    let mut variance_x = 0.;
    let mut variance_y = 0.;
    for (&xi, &yi) in x.iter().zip(y.iter()) {
        covariance += (xi - mean_x) * (yi - mean_y);
        variance_x += (xi - mean_x).powi(2);
        variance_y += (yi - mean_y).powi(2);
    }
    if variance_x == 0. || variance_y == 0. {
        return 0.;
    }
    covariance / (variance_x * variance_y).sqrt()
}

////////////////////////////////////////////////////////////////////////////////

/// Picks a random movable VM using the simulation-wide random number generator.
pub struct RandomSelection;

impl VmSelectionPolicy for RandomSelection {
    fn select_vm_to_migrate(&self, host: &Host, ctx: &SimulationContext) -> Option<Rc<RefCell<Vm>>> {
        let vms = movable_vms(host);
        if vms.is_empty() {
            return None;
        }
        let index = ctx.gen_range(0..vms.len());
        Some(vms[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pearson_correlation() {
        let x = [0.1, 0.2, 0.3, 0.4];
        let y = [0.2, 0.4, 0.6, 0.8];
        assert!((pearson_correlation(&x, &y) - 1.).abs() < 1e-9);
        let inverse = [0.8, 0.6, 0.4, 0.2];
        assert!((pearson_correlation(&x, &inverse) + 1.).abs() < 1e-9);
        let flat = [0.5, 0.5, 0.5, 0.5];
        assert_eq!(pearson_correlation(&x, &flat), 0.);
    }
}
