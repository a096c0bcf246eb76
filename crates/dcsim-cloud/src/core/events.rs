//! Standard simulation events.

// VM LIFECYCLE EVENTS /////////////////////////////////////////////////////////////////////////////

pub mod vm {
    use serde::Serialize;

    /// Request to create a VM registered in the VM registry.
    #[derive(Clone, Serialize)]
    pub struct VmCreationRequest {
        pub vm_id: u32,
        pub ack: bool,
    }

    /// Reply to an acknowledged VM creation request.
    #[derive(Clone, Serialize)]
    pub struct VmCreationAck {
        pub vm_id: u32,
        pub host_id: u32,
        pub success: bool,
    }

    /// Request to destroy a VM and release its resources.
    #[derive(Clone, Serialize)]
    pub struct VmDestructionRequest {
        pub vm_id: u32,
    }

    /// Completion of a live VM migration, delivered after the migration delay.
    #[derive(Clone, Serialize)]
    pub struct VmMigrationFinished {
        pub vm_id: u32,
        pub target_host: u32,
    }
}

// CLOUDLET EVENTS /////////////////////////////////////////////////////////////////////////////////

pub mod cloudlet {
    use serde::Serialize;

    use crate::core::cloudlet::Cloudlet;

    /// Submission of a cloudlet to its bound VM. The cloudlet ownership moves
    /// with the event, from the broker to the VM's cloudlet scheduler.
    #[derive(Clone, Serialize)]
    pub struct CloudletSubmission {
        pub cloudlet: Cloudlet,
    }

    /// Return of a completed cloudlet to its owner.
    #[derive(Clone, Serialize)]
    pub struct CloudletCompleted {
        pub cloudlet: Cloudlet,
    }
}

// DATACENTER EVENTS ///////////////////////////////////////////////////////////////////////////////

pub mod datacenter {
    use serde::Serialize;

    /// Periodic datacenter processing tick.
    #[derive(Clone, Serialize)]
    pub struct ProcessingTick {}
}
