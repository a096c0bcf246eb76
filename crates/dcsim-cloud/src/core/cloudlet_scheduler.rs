//! Cloudlet schedulers, splitting the VM CPU time across active cloudlets.

use std::collections::VecDeque;

use crate::core::cloudlet::{Cloudlet, CloudletState};

/// Schedules cloudlets inside a single VM.
///
/// The scheduler receives the MIPS share actually allocated to its VM by the
/// host at every processing update and reports the expected time of the next
/// cloudlet completion, which the datacenter uses to schedule extra processing
/// ticks between scheduling intervals.
pub trait CloudletScheduler {
    /// Accepts a cloudlet for execution, returns the estimated completion time
    /// (or 0 if the cloudlet was queued).
    fn submit(&mut self, cloudlet: Cloudlet, time: f64, vm_mips: f64, vm_pes: u32) -> f64;

    /// Advances the execution of cloudlets using the MIPS share allocated to
    /// the VM since the previous update.
    ///
    /// Returns the expected completion time of the next cloudlet, or
    /// `f64::MAX` if there is none.
    fn update_processing(&mut self, time: f64, mips_share: &[f64], vm_mips: f64, vm_pes: u32) -> f64;

    /// Returns the MIPS currently requested by the cloudlets, one entry per VM PE.
    fn requested_mips(&self, time: f64, vm_mips: f64, vm_pes: u32) -> Vec<f64>;

    /// Returns the total CPU utilization of the VM in [0, 1].
    fn total_utilization(&self, time: f64, vm_pes: u32) -> f64;

    /// Removes and returns the cloudlets completed since the last call.
    fn take_finished(&mut self) -> Vec<Cloudlet>;

    /// Returns the number of cloudlets being executed or waiting.
    fn active_count(&self) -> usize;
}

////////////////////////////////////////////////////////////////////////////////

/// Time-shared scheduler driven by cloudlet utilization models.
///
/// All cloudlets execute concurrently, the allocated VM capacity is split
/// between them proportionally to their current demands.
pub struct CloudletSchedulerTimeShared {
    exec: Vec<Cloudlet>,
    finished: Vec<Cloudlet>,
    previous_time: f64,
}

impl CloudletSchedulerTimeShared {
    pub fn new() -> Self {
        Self {
            exec: Vec::new(),
            finished: Vec::new(),
            previous_time: 0.,
        }
    }

    fn requested_for(cloudlet: &Cloudlet, time: f64, vm_mips: f64) -> f64 {
        cloudlet.utilization(time) * vm_mips * cloudlet.pes() as f64
    }
}

impl Default for CloudletSchedulerTimeShared {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudletScheduler for CloudletSchedulerTimeShared {
    fn submit(&mut self, mut cloudlet: Cloudlet, time: f64, vm_mips: f64, _vm_pes: u32) -> f64 {
        cloudlet.set_state(CloudletState::InExec);
        cloudlet.set_exec_start_time(time);
        if cloudlet.arrival_time() < 0. {
            cloudlet.set_arrival_time(time);
        }
        let utilization = cloudlet.utilization(time);
        let estimate = if utilization > 0. {
            time + cloudlet.length() / (vm_mips * utilization)
        } else {
            f64::MAX
        };
        if self.exec.is_empty() {
            self.previous_time = time;
        }
        self.exec.push(cloudlet);
        estimate
    }

    fn update_processing(&mut self, time: f64, mips_share: &[f64], vm_mips: f64, _vm_pes: u32) -> f64 {
        let timespan = time - self.previous_time;
        let allocated_total: f64 = mips_share.iter().sum();
        let requested_total: f64 = self
            .exec
            .iter()
            .map(|cl| Self::requested_for(cl, time, vm_mips))
            .sum();

        if timespan > 0. && requested_total > 0. {
            for cloudlet in self.exec.iter_mut() {
                let weight = Self::requested_for(cloudlet, time, vm_mips) / requested_total;
                cloudlet.add_finished_length(allocated_total * weight * timespan);
            }
        }
        self.previous_time = time;

        let mut i = 0;
        while i < self.exec.len() {
            if self.exec[i].is_finished() {
                let mut cloudlet = self.exec.remove(i);
                cloudlet.set_state(CloudletState::Success);
                cloudlet.set_finish_time(time);
                self.finished.push(cloudlet);
            } else {
                i += 1;
            }
        }

        let mut next_completion = f64::MAX;
        if requested_total > 0. {
            for cloudlet in self.exec.iter() {
                let weight = Self::requested_for(cloudlet, time, vm_mips) / requested_total;
                let allocated = allocated_total * weight;
                if allocated > 0. {
                    next_completion = next_completion.min(time + cloudlet.remaining_length() / allocated);
                }
            }
        }
        next_completion
    }

    fn requested_mips(&self, time: f64, vm_mips: f64, vm_pes: u32) -> Vec<f64> {
        let utilization = self.total_utilization(time, vm_pes);
        vec![vm_mips * utilization; vm_pes as usize]
    }

    fn total_utilization(&self, time: f64, vm_pes: u32) -> f64 {
        let total: f64 = self
            .exec
            .iter()
            .map(|cl| cl.utilization(time) * cl.pes() as f64)
            .sum();
        (total / vm_pes as f64).min(1.)
    }

    fn take_finished(&mut self) -> Vec<Cloudlet> {
        std::mem::take(&mut self.finished)
    }

    fn active_count(&self) -> usize {
        self.exec.len()
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Space-shared scheduler assigning whole PEs to cloudlets.
///
/// A cloudlet runs at the full VM speed on its PEs, cloudlets that do not fit
/// wait in a FIFO queue. Utilization models do not throttle execution here.
pub struct CloudletSchedulerSpaceShared {
    exec: Vec<Cloudlet>,
    waiting: VecDeque<Cloudlet>,
    finished: Vec<Cloudlet>,
    previous_time: f64,
    used_pes: u32,
}

impl CloudletSchedulerSpaceShared {
    pub fn new() -> Self {
        Self {
            exec: Vec::new(),
            waiting: VecDeque::new(),
            finished: Vec::new(),
            previous_time: 0.,
            used_pes: 0,
        }
    }

    fn start_waiting_cloudlets(&mut self, time: f64, vm_pes: u32) {
        while let Some(cloudlet) = self.waiting.front() {
            if self.used_pes + cloudlet.pes() > vm_pes {
                break;
            }
            let mut cloudlet = self.waiting.pop_front().unwrap();
            cloudlet.set_state(CloudletState::InExec);
            cloudlet.set_exec_start_time(time);
            self.used_pes += cloudlet.pes();
            self.exec.push(cloudlet);
        }
    }
}

impl Default for CloudletSchedulerSpaceShared {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudletScheduler for CloudletSchedulerSpaceShared {
    fn submit(&mut self, mut cloudlet: Cloudlet, time: f64, vm_mips: f64, vm_pes: u32) -> f64 {
        if cloudlet.arrival_time() < 0. {
            cloudlet.set_arrival_time(time);
        }
        if self.used_pes + cloudlet.pes() <= vm_pes {
            cloudlet.set_state(CloudletState::InExec);
            cloudlet.set_exec_start_time(time);
            self.used_pes += cloudlet.pes();
            if self.exec.is_empty() {
                self.previous_time = time;
            }
            let estimate = time + cloudlet.length() / vm_mips;
            self.exec.push(cloudlet);
            estimate
        } else {
            cloudlet.set_state(CloudletState::Queued);
            self.waiting.push_back(cloudlet);
            0.
        }
    }

    fn update_processing(&mut self, time: f64, mips_share: &[f64], _vm_mips: f64, vm_pes: u32) -> f64 {
        let timespan = time - self.previous_time;
        let allocated_total: f64 = mips_share.iter().sum();
        let per_pe = if self.used_pes > 0 {
            allocated_total / self.used_pes as f64
        } else {
            0.
        };

        if timespan > 0. {
            for cloudlet in self.exec.iter_mut() {
                cloudlet.add_finished_length(per_pe * cloudlet.pes() as f64 * timespan);
            }
        }
        self.previous_time = time;

        let mut i = 0;
        while i < self.exec.len() {
            if self.exec[i].is_finished() {
                let mut cloudlet = self.exec.remove(i);
                cloudlet.set_state(CloudletState::Success);
                cloudlet.set_finish_time(time);
                self.used_pes -= cloudlet.pes();
                self.finished.push(cloudlet);
            } else {
                i += 1;
            }
        }
        self.start_waiting_cloudlets(time, vm_pes);

        let mut next_completion = f64::MAX;
        for cloudlet in self.exec.iter() {
            let allocated = per_pe * cloudlet.pes() as f64;
            if allocated > 0. {
                next_completion = next_completion.min(time + cloudlet.remaining_length() / allocated);
            }
        }
        next_completion
    }

    fn requested_mips(&self, _time: f64, vm_mips: f64, vm_pes: u32) -> Vec<f64> {
        (0..vm_pes)
            .map(|pe| if pe < self.used_pes { vm_mips } else { 0. })
            .collect()
    }

    fn total_utilization(&self, time: f64, vm_pes: u32) -> f64 {
        let total: f64 = self
            .exec
            .iter()
            .map(|cl| cl.utilization(time) * cl.pes() as f64)
            .sum();
        (total / vm_pes as f64).min(1.)
    }

    fn take_finished(&mut self) -> Vec<Cloudlet> {
        std::mem::take(&mut self.finished)
    }

    fn active_count(&self) -> usize {
        self.exec.len() + self.waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::utilization_model::{UtilizationModelConstant, UtilizationModelFull};

    fn cloudlet(id: u32, length: f64, pes: u32) -> Cloudlet {
        Cloudlet::new(id, 0, length, pes, 300, 300, Box::new(UtilizationModelFull::new()))
    }

    #[test]
    fn test_time_shared_single_cloudlet() {
        let mut scheduler = CloudletSchedulerTimeShared::new();
        let estimate = scheduler.submit(cloudlet(0, 10000., 1), 0., 500., 1);
        assert_eq!(estimate, 20.);

        let next = scheduler.update_processing(10., &[500.], 500., 1);
        assert_eq!(next, 20.);
        assert!(scheduler.take_finished().is_empty());

        let next = scheduler.update_processing(20., &[500.], 500., 1);
        assert_eq!(next, f64::MAX);
        let finished = scheduler.take_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].state(), CloudletState::Success);
        assert_eq!(finished[0].finish_time(), 20.);
    }

    #[test]
    fn test_time_shared_splits_capacity_proportionally() {
        let mut scheduler = CloudletSchedulerTimeShared::new();
        scheduler.submit(
            Cloudlet::new(0, 0, 1000., 1, 300, 300, Box::new(UtilizationModelFull::new())),
            0.,
            1000.,
            1,
        );
        scheduler.submit(
            Cloudlet::new(1, 0, 1000., 1, 300, 300, Box::new(UtilizationModelConstant::new(0.5))),
            0.,
            1000.,
            1,
        );
        // demands are 1000 and 500 MIPS, the allocated 900 is split 2:1
        scheduler.update_processing(10., &[900.], 1000., 1);
        let requested = scheduler.requested_mips(10., 1000., 1);
        assert_eq!(requested.len(), 1);
        assert_eq!(requested[0], 1000.);
        assert_eq!(scheduler.exec[0].finished_so_far(), 1000. * 6.);
        assert_eq!(scheduler.exec[1].finished_so_far(), 1000. * 3.);
    }

    #[test]
    fn test_space_shared_queues_cloudlets() {
        let mut scheduler = CloudletSchedulerSpaceShared::new();
        let estimate = scheduler.submit(cloudlet(0, 1000., 2), 0., 1000., 2);
        assert_eq!(estimate, 1.);
        // no free PEs left, the second cloudlet waits
        let estimate = scheduler.submit(cloudlet(1, 1000., 2), 0., 1000., 2);
        assert_eq!(estimate, 0.);
        assert_eq!(scheduler.active_count(), 2);

        scheduler.update_processing(1., &[1000., 1000.], 1000., 2);
        assert_eq!(scheduler.take_finished().len(), 1);
        // the waiting cloudlet starts once the PEs are released
        assert_eq!(scheduler.exec.len(), 1);
        assert_eq!(scheduler.exec[0].exec_start_time(), 1.);

        scheduler.update_processing(2., &[1000., 1000.], 1000., 2);
        assert_eq!(scheduler.take_finished().len(), 1);
        assert_eq!(scheduler.active_count(), 0);
    }
}
