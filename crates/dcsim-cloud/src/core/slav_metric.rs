//! Service-level agreement violation metrics.

use dyn_clone::{clone_trait_object, DynClone};

/// Trait for implementation of host-level SLA violation metric.
///
/// This metric measures the amount of SLA violation caused by the host
/// overload, when it is not able to provide the full performance to hosted VMs.
pub trait HostSlavMetric: DynClone {
    /// Called whenever the host's CPU load changes to update the metric value.
    fn update(&mut self, time: f64, cpu_load: f64);

    /// Returns the current metric value.
    fn value(&self) -> f64;
}

clone_trait_object!(HostSlavMetric);

/// Overload Time Fraction (OTF) metric.
///
/// `OTF = T_overload / T_active`
/// - `T_overload` is the total time during which the host was overloaded (leading to an SLA violation).
/// - `T_active` is the total time the host was active (running VMs).
#[derive(Clone)]
pub struct OverloadTimeFraction {
    prev_time: f64,
    prev_cpu_load: f64,
    total_active_time: f64,
    total_overloaded_time: f64,
}

impl OverloadTimeFraction {
    pub fn new() -> Self {
        Self {
            prev_time: 0.,
            prev_cpu_load: 0.,
            total_active_time: 0.,
            total_overloaded_time: 0.,
        }
    }
}

impl Default for OverloadTimeFraction {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSlavMetric for OverloadTimeFraction {
    fn update(&mut self, time: f64, cpu_load: f64) {
        let time_delta = time - self.prev_time;

        if self.prev_cpu_load > 0. {
            self.total_active_time += time_delta;
        }
        if self.prev_cpu_load >= 1. {
            self.total_overloaded_time += time_delta;
        }

        self.prev_time = time;
        self.prev_cpu_load = cpu_load;
    }

    fn value(&self) -> f64 {
        if self.total_active_time == 0. {
            return 0.;
        }
        self.total_overloaded_time / self.total_active_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overload_time_fraction() {
        let mut otf = OverloadTimeFraction::new();
        otf.update(0., 0.5);
        otf.update(10., 1.0);
        otf.update(20., 0.);
        // active for 20 seconds, overloaded for the last 10
        assert_eq!(otf.value(), 0.5);
    }

    #[test]
    fn test_idle_host_has_no_violation() {
        let otf = OverloadTimeFraction::new();
        assert_eq!(otf.value(), 0.);
    }
}
