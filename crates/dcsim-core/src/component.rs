//! Simulation components.

/// Identifier of simulation component.
pub type Id = u32;

/// Lifecycle state of a simulation entity.
///
/// Entities are registered in `Runnable` state, moved to `Running` when the
/// simulation starts, may be temporarily put on hold (events destined to a
/// holding entity are kept in the deferred queue), and end up `Finished` after
/// the simulation completes or the entity is removed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntityState {
    /// Entity is registered but not started yet.
    Runnable,
    /// Entity is processing events.
    Running,
    /// Entity is on hold, its events are deferred.
    Holding,
    /// Entity has completed, its events are discarded.
    Finished,
}
