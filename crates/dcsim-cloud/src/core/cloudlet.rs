//! Cloudlets, the units of work executed by VMs.

use std::fmt::{Display, Formatter};

use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;

use dcsim_core::EPSILON;

use crate::core::utilization_model::UtilizationModel;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum CloudletState {
    Created,
    Ready,
    Queued,
    InExec,
    Paused,
    Success,
    Failed,
    Canceled,
}

impl Display for CloudletState {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            CloudletState::Created => write!(f, "created"),
            CloudletState::Ready => write!(f, "ready"),
            CloudletState::Queued => write!(f, "queued"),
            CloudletState::InExec => write!(f, "in exec"),
            CloudletState::Paused => write!(f, "paused"),
            CloudletState::Success => write!(f, "success"),
            CloudletState::Failed => write!(f, "failed"),
            CloudletState::Canceled => write!(f, "canceled"),
        }
    }
}

/// A unit of work with a length in million instructions per PE and a CPU
/// utilization model.
///
/// A cloudlet is owned by the broker until submitted, then by the cloudlet
/// scheduler of its VM until completion, and is finally returned to the broker.
#[derive(Clone)]
pub struct Cloudlet {
    id: u32,
    user_id: u32,
    length: f64,
    pes: u32,
    file_size: u64,
    output_size: u64,
    utilization_model: Box<dyn UtilizationModel>,
    state: CloudletState,
    vm_id: Option<u32>,
    finished_so_far: f64,
    arrival_time: f64,
    exec_start_time: f64,
    finish_time: f64,
}

impl Serialize for Cloudlet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Cloudlet", 3)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("length", &self.length)?;
        state.serialize_field("state", &self.state)?;
        state.end()
    }
}

impl Cloudlet {
    pub fn new(
        id: u32,
        user_id: u32,
        length: f64,
        pes: u32,
        file_size: u64,
        output_size: u64,
        utilization_model: Box<dyn UtilizationModel>,
    ) -> Self {
        Self {
            id,
            user_id,
            length,
            pes,
            file_size,
            output_size,
            utilization_model,
            state: CloudletState::Created,
            vm_id: None,
            finished_so_far: 0.,
            arrival_time: -1.,
            exec_start_time: -1.,
            finish_time: -1.,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    /// Cloudlet length in million instructions per PE.
    pub fn length(&self) -> f64 {
        self.length
    }

    /// Total cloudlet length over all its PEs.
    pub fn total_length(&self) -> f64 {
        self.length * self.pes as f64
    }

    pub fn pes(&self) -> u32 {
        self.pes
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn output_size(&self) -> u64 {
        self.output_size
    }

    pub fn state(&self) -> CloudletState {
        self.state
    }

    pub fn set_state(&mut self, state: CloudletState) {
        self.state = state;
    }

    pub fn vm_id(&self) -> Option<u32> {
        self.vm_id
    }

    pub fn set_vm_id(&mut self, vm_id: u32) {
        self.vm_id = Some(vm_id);
    }

    /// CPU demand at the given time as a fraction of the full cloudlet speed.
    pub fn utilization(&self, time: f64) -> f64 {
        self.utilization_model.utilization(time)
    }

    pub fn finished_so_far(&self) -> f64 {
        self.finished_so_far
    }

    /// Accounts the progress made since the previous update.
    pub fn add_finished_length(&mut self, length: f64) {
        self.finished_so_far = (self.finished_so_far + length).min(self.total_length());
    }

    pub fn remaining_length(&self) -> f64 {
        self.total_length() - self.finished_so_far
    }

    pub fn is_finished(&self) -> bool {
        self.remaining_length() <= EPSILON
    }

    pub fn arrival_time(&self) -> f64 {
        self.arrival_time
    }

    pub fn set_arrival_time(&mut self, time: f64) {
        self.arrival_time = time;
    }

    pub fn exec_start_time(&self) -> f64 {
        self.exec_start_time
    }

    pub fn set_exec_start_time(&mut self, time: f64) {
        self.exec_start_time = time;
    }

    pub fn finish_time(&self) -> f64 {
        self.finish_time
    }

    pub fn set_finish_time(&mut self, time: f64) {
        self.finish_time = time;
    }
}
