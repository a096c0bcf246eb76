//! The datacenter broker entity, acting on behalf of a cloud user.

use std::cell::RefCell;
use std::rc::Rc;

use dcsim_core::cast;
use dcsim_core::component::Id;
use dcsim_core::context::SimulationContext;
use dcsim_core::event::Event;
use dcsim_core::handler::EventHandler;
use dcsim_core::{log_debug, log_info, log_warn};

use dcsim_core::EPSILON;

use crate::core::cloudlet::{Cloudlet, CloudletState};
use crate::core::events::cloudlet::{CloudletCompleted, CloudletSubmission};
use crate::core::events::vm::{VmCreationAck, VmCreationRequest, VmDestructionRequest};
use crate::core::vm::VmRegistry;

/// A broker owning a set of VM requests and cloudlets.
///
/// The broker requests the creation of its VMs when the simulation starts,
/// binds and submits its cloudlets once every creation request has been
/// acknowledged, collects the returned cloudlets and finally destroys its VMs.
pub struct Broker {
    datacenter_id: Id,
    vm_registry: Rc<RefCell<VmRegistry>>,
    pending_vms: Vec<(u32, f64)>,
    created_vms: Vec<u32>,
    failed_vms: Vec<u32>,
    acks_expected: usize,
    pending_cloudlets: Vec<Cloudlet>,
    submitted_cloudlets: usize,
    completed_cloudlets: usize,
    returned_cloudlets: Vec<Cloudlet>,
    next_bound_vm: usize,
    started: bool,
    ctx: SimulationContext,
}

impl Broker {
    pub fn new(datacenter_id: Id, vm_registry: Rc<RefCell<VmRegistry>>, ctx: SimulationContext) -> Self {
        Self {
            datacenter_id,
            vm_registry,
            pending_vms: Vec::new(),
            created_vms: Vec::new(),
            failed_vms: Vec::new(),
            acks_expected: 0,
            pending_cloudlets: Vec::new(),
            submitted_cloudlets: 0,
            completed_cloudlets: 0,
            returned_cloudlets: Vec::new(),
            next_bound_vm: 0,
            started: false,
            ctx,
        }
    }

    pub fn id(&self) -> Id {
        self.ctx.id()
    }

    /// Queues a VM creation request to be sent after the given delay.
    pub fn submit_vm(&mut self, vm_id: u32, delay: f64) {
        if self.started {
            self.send_vm_request(vm_id, delay);
        } else {
            self.pending_vms.push((vm_id, delay));
        }
    }

    /// Queues a cloudlet for submission.
    ///
    /// Cloudlets with a bound VM are submitted to it, the others are bound
    /// round-robin over the successfully created VMs.
    pub fn submit_cloudlet(&mut self, cloudlet: Cloudlet) {
        self.pending_cloudlets.push(cloudlet);
        if self.started && self.acks_expected == 0 {
            self.submit_pending_cloudlets();
        }
    }

    pub fn returned_cloudlets(&self) -> &[Cloudlet] {
        &self.returned_cloudlets
    }

    pub fn failed_vms(&self) -> &[u32] {
        &self.failed_vms
    }

    fn send_vm_request(&mut self, vm_id: u32, delay: f64) {
        self.acks_expected += 1;
        self.ctx
            .emit(VmCreationRequest { vm_id, ack: true }, self.datacenter_id, delay);
    }

    fn on_vm_creation_ack(&mut self, vm_id: u32, host_id: u32, success: bool) {
        if success {
            log_debug!(self.ctx, "vm #{} created on host #{}", vm_id, host_id);
            self.created_vms.push(vm_id);
        } else {
            log_warn!(self.ctx, "creation of vm #{} failed", vm_id);
            self.failed_vms.push(vm_id);
        }
        self.acks_expected -= 1;
        if self.acks_expected == 0 {
            self.submit_pending_cloudlets();
            self.destroy_vms_if_done();
        }
    }

    fn submit_pending_cloudlets(&mut self) {
        let cloudlets = std::mem::take(&mut self.pending_cloudlets);
        for mut cloudlet in cloudlets {
            let vm_id = match cloudlet.vm_id() {
                Some(vm_id) if self.vm_registry.borrow().contains(vm_id) => vm_id,
                _ => {
                    if self.created_vms.is_empty() {
                        log_warn!(
                            self.ctx,
                            "no vm available for cloudlet #{}, dropping it",
                            cloudlet.id()
                        );
                        cloudlet.set_state(CloudletState::Failed);
                        self.returned_cloudlets.push(cloudlet);
                        continue;
                    }
                    let vm_id = self.created_vms[self.next_bound_vm % self.created_vms.len()];
                    self.next_bound_vm += 1;
                    vm_id
                }
            };
            cloudlet.set_vm_id(vm_id);
            cloudlet.set_state(CloudletState::Ready);
            log_debug!(self.ctx, "sending cloudlet #{} to vm #{}", cloudlet.id(), vm_id);
            self.submitted_cloudlets += 1;
            self.ctx.emit_now(CloudletSubmission { cloudlet }, self.datacenter_id);
        }
    }

    fn on_cloudlet_completed(&mut self, cloudlet: Cloudlet) {
        log_info!(
            self.ctx,
            "cloudlet #{} returned after {:.3} seconds of execution",
            cloudlet.id(),
            (cloudlet.finish_time() - cloudlet.exec_start_time()).max(0.)
        );
        self.returned_cloudlets.push(cloudlet);
        self.completed_cloudlets += 1;
        self.destroy_vms_if_done();
    }

    fn destroy_vms_if_done(&mut self) {
        if self.acks_expected > 0 || !self.pending_cloudlets.is_empty() {
            return;
        }
        if self.completed_cloudlets < self.submitted_cloudlets {
            return;
        }
        for vm_id in std::mem::take(&mut self.created_vms) {
            log_debug!(self.ctx, "destroying vm #{}", vm_id);
            self.ctx
                .emit_now(VmDestructionRequest { vm_id }, self.datacenter_id);
        }
    }
}

impl EventHandler for Broker {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            VmCreationAck { vm_id, host_id, success } => {
                self.on_vm_creation_ack(vm_id, host_id, success);
            }
            CloudletCompleted { cloudlet } => {
                self.on_cloudlet_completed(cloudlet);
            }
        })
    }

    fn on_start(&mut self) {
        self.started = true;
        let pending = std::mem::take(&mut self.pending_vms);
        for (vm_id, delay) in pending {
            self.send_vm_request(vm_id, delay.max(EPSILON));
        }
        if self.acks_expected == 0 && !self.pending_cloudlets.is_empty() {
            self.submit_pending_cloudlets();
        }
    }

    fn on_shutdown(&mut self) {
        log_info!(
            self.ctx,
            "broker finished: {} cloudlets returned, {} vm creations failed",
            self.returned_cloudlets.len(),
            self.failed_vms.len()
        );
    }
}
