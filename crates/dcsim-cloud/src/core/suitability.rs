//! Host suitability evaluation.

use dcsim_core::EPSILON;

use crate::core::host::Host;
use crate::core::vm::Vm;

/// Evaluates whether a host can accept a VM.
///
/// A host is suitable iff its bandwidth, RAM and MIPS checks all pass. The
/// MIPS check has two variants differing in whether the nominal VM capacities
/// or the actual current demands are compared against the host capacity.
pub trait HostSuitability {
    fn is_suitable(&self, host: &Host, vm: &Vm, time: f64) -> bool {
        self.is_bw_suitable(host, vm) && self.is_ram_suitable(host, vm) && self.is_mips_suitable(host, vm, time)
    }

    fn is_bw_suitable(&self, host: &Host, vm: &Vm) -> bool {
        host.bw_provisioner().is_suitable(vm.id(), vm.bw() as f64)
    }

    fn is_ram_suitable(&self, host: &Host, vm: &Vm) -> bool {
        host.ram_provisioner().is_suitable(vm.id(), vm.ram() as f64)
    }

    fn is_mips_suitable(&self, host: &Host, vm: &Vm, time: f64) -> bool;
}

/// MIPS check against the nominal VM capacities: the capacity left after
/// serving the nominal demands of the hosted VMs must cover the nominal
/// demand of the new VM.
pub struct NoOversubscription;

impl HostSuitability for NoOversubscription {
    fn is_mips_suitable(&self, host: &Host, vm: &Vm, _time: f64) -> bool {
        host.total_mips() - host.vm_total_mips_sum() > vm.total_mips() + EPSILON
    }
}

/// MIPS check against the actual current demand of the new VM: only the MIPS
/// left unallocated must cover it, so the nominal capacities may oversubscribe
/// the host.
pub struct Oversubscription;

impl HostSuitability for Oversubscription {
    fn is_mips_suitable(&self, host: &Host, vm: &Vm, time: f64) -> bool {
        host.available_mips() > vm.current_requested_total_mips(time) + EPSILON
    }
}

/// Returns the suitability variant selected by the `oversubscribe` config option.
pub fn suitability_for_config(oversubscribe: bool) -> Box<dyn HostSuitability> {
    if oversubscribe {
        Box::new(Oversubscription)
    } else {
        Box::new(NoOversubscription)
    }
}
