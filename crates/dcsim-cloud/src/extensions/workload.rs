//! Workload sources.

/// A single unit of work produced by a workload source.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkloadEntry {
    /// Arrival time in seconds of simulation time.
    pub arrival_time: f64,
    /// Work length in million instructions per PE.
    pub length: f64,
    /// Number of PEs the work runs on.
    pub pes: u32,
    /// RAM demand of the VM serving the work.
    pub ram: u64,
    /// Bandwidth demand of the VM serving the work.
    pub bw: u64,
}

/// An opaque iterator of workload entries.
///
/// Entries must be produced in non-decreasing order of their arrival times.
pub trait WorkloadSource {
    fn next_entry(&mut self) -> Option<WorkloadEntry>;
}
