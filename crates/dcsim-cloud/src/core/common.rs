//! Common data structures.

/// Describes a result of checking the allocation feasibility.
#[derive(PartialEq, Eq, Debug)]
pub enum AllocationVerdict {
    Success,
    NotEnoughRam,
    NotEnoughBw,
    NotEnoughStorage,
    NotEnoughMips,
}
