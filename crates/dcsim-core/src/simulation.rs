//! Simulation configuration and execution.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::Level::Trace;
use log::{debug, log_enabled, trace};
use serde_json::json;
use serde_type_name::type_name;

use crate::component::{EntityState, Id};
use crate::context::SimulationContext;
use crate::handler::{EventCancellationPolicy, EventHandler};
use crate::log::log_undelivered_event;
use crate::state::SimulationState;
use crate::Event;

/// Represents a simulation, provides methods for its configuration and execution.
pub struct Simulation {
    sim_state: Rc<RefCell<SimulationState>>,
    name_to_id: HashMap<String, Id>,
    names: Rc<RefCell<Vec<String>>>,
    handlers: Vec<Option<Rc<RefCell<dyn EventHandler>>>>,
    entity_states: Vec<EntityState>,
    started: bool,
}

impl Simulation {
    /// Creates a new simulation with specified random seed.
    pub fn new(seed: u64) -> Self {
        Self {
            sim_state: Rc::new(RefCell::new(SimulationState::new(seed))),
            name_to_id: HashMap::new(),
            names: Rc::new(RefCell::new(Vec::new())),
            handlers: Vec::new(),
            entity_states: Vec::new(),
            started: false,
        }
    }

    fn register(&mut self, name: &str) -> Id {
        if let Some(&id) = self.name_to_id.get(name) {
            return id;
        }
        let id = self.name_to_id.len() as Id;
        self.name_to_id.insert(name.to_owned(), id);
        self.names.borrow_mut().push(name.to_owned());
        self.handlers.push(None);
        self.entity_states.push(EntityState::Runnable);
        id
    }

    /// Returns the identifier of component by its name.
    ///
    /// Panics if component with such name does not exist.
    pub fn lookup_id(&self, name: &str) -> Id {
        *self.name_to_id.get(name).unwrap()
    }

    /// Returns the name of component by its identifier.
    ///
    /// Panics if component with such Id does not exist.
    pub fn lookup_name(&self, id: Id) -> String {
        self.names.borrow()[id as usize].clone()
    }

    /// Creates a new simulation context with specified name.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use dcsim_core::Simulation;
    ///
    /// let mut sim = Simulation::new(123);
    /// let comp_ctx = sim.create_context("comp");
    /// assert_eq!(comp_ctx.id(), 0); // component ids are assigned sequentially starting from 0
    /// assert_eq!(comp_ctx.name(), "comp");
    /// ```
    pub fn create_context<S>(&mut self, name: S) -> SimulationContext
    where
        S: AsRef<str>,
    {
        let ctx = SimulationContext::new(
            self.register(name.as_ref()),
            name.as_ref(),
            self.sim_state.clone(),
            self.names.clone(),
        );
        debug!(
            target: "simulation",
            "[{:.3} {} simulation] Created context: {}",
            self.time(),
            crate::log::get_colored("DEBUG", colored::Color::Blue),
            json!({"name": ctx.name(), "id": ctx.id()})
        );
        ctx
    }

    /// Registers the event handler implementation for entity with specified name,
    /// returns the entity Id.
    ///
    /// The entity is registered in `Runnable` state and starts receiving events
    /// once the simulation is started.
    pub fn add_handler<S>(&mut self, name: S, handler: Rc<RefCell<dyn EventHandler>>) -> Id
    where
        S: AsRef<str>,
    {
        let id = self.register(name.as_ref());
        self.handlers[id as usize] = Some(handler.clone());
        self.entity_states[id as usize] = EntityState::Runnable;
        // entities added to an already started simulation are started right away
        if self.started {
            self.entity_states[id as usize] = EntityState::Running;
            handler.borrow_mut().on_start();
        }
        debug!(
            target: "simulation",
            "[{:.3} {} simulation] Added handler: {}",
            self.time(),
            crate::log::get_colored("DEBUG", colored::Color::Blue),
            json!({"name": name.as_ref(), "id": id})
        );
        id
    }

    /// Removes the event handler for entity with specified name,
    /// cancelling the pending events according to the specified policy.
    ///
    /// The entity is moved to `Finished` state, all subsequent events destined
    /// to it are discarded.
    pub fn remove_handler<S>(&mut self, name: S, cancel_policy: EventCancellationPolicy)
    where
        S: AsRef<str>,
    {
        let id = self.lookup_id(name.as_ref());
        self.handlers[id as usize] = None;
        self.entity_states[id as usize] = EntityState::Finished;
        match cancel_policy {
            EventCancellationPolicy::Incoming => self.cancel_events(|e| e.dst == id),
            EventCancellationPolicy::Outgoing => self.cancel_events(|e| e.src == id),
            EventCancellationPolicy::All => self.cancel_events(|e| e.src == id || e.dst == id),
            EventCancellationPolicy::None => {}
        }
        debug!(
            target: "simulation",
            "[{:.3} {} simulation] Removed handler: {}",
            self.time(),
            crate::log::get_colored("DEBUG", colored::Color::Blue),
            json!({"name": name.as_ref(), "id": id})
        );
    }

    /// Returns the lifecycle state of the specified entity.
    pub fn entity_state(&self, id: Id) -> EntityState {
        self.entity_states[id as usize]
    }

    /// Puts the entity on hold: its events are kept in the deferred queue
    /// until the entity is resumed.
    pub fn hold(&mut self, id: Id) {
        self.entity_states[id as usize] = EntityState::Holding;
    }

    /// Resumes the entity and requeues its deferred events.
    ///
    /// The deferred events are redelivered in their original order, the clock
    /// never goes backwards.
    pub fn resume(&mut self, id: Id) {
        self.entity_states[id as usize] = EntityState::Running;
        self.sim_state.borrow_mut().resume_deferred(id);
    }

    /// Returns the current simulation time.
    pub fn time(&self) -> f64 {
        self.sim_state.borrow().time()
    }

    /// Sets the minimum delay enforced between an event emission and its delivery.
    ///
    /// Panics if the gap is not strictly positive.
    pub fn set_min_event_gap(&mut self, gap: f64) {
        self.sim_state.borrow_mut().set_min_event_gap(gap);
    }

    /// Sets the hard upper bound of simulation time.
    ///
    /// Events scheduled strictly after this time are never delivered.
    pub fn terminate_at(&mut self, time: f64) {
        self.sim_state.borrow_mut().set_termination_time(time);
    }

    /// Performs a single step through the simulation.
    ///
    /// Takes the next event from the future queue, advances the simulation time
    /// and tries to deliver it to the destination entity. Events destined to a
    /// not-yet-running or holding entity are moved to the deferred queue, events
    /// destined to a finished or unknown entity are logged and discarded.
    ///
    /// Returns `true` if some pending event was found and `false` otherwise.
    pub fn step(&mut self) -> bool {
        if !self.started {
            self.start_entities();
        }
        let next = self.sim_state.borrow_mut().next_event();
        if let Some(event) = next {
            match self.entity_states.get(event.dst as usize) {
                Some(EntityState::Running) => {
                    let handler = self.handlers[event.dst as usize].clone();
                    if let Some(handler) = handler {
                        if log_enabled!(Trace) {
                            let src_name = self.lookup_name(event.src);
                            let dst_name = self.lookup_name(event.dst);
                            trace!(
                                target: &dst_name,
                                "[{:.3} {} {}] {}",
                                event.time,
                                crate::log::get_colored("EVENT", colored::Color::BrightBlack),
                                dst_name,
                                json!({"type": type_name(&event.data).unwrap(), "data": &event.data, "src": src_name})
                            );
                        }
                        handler.borrow_mut().on(event);
                    } else {
                        log_undelivered_event(event);
                    }
                }
                Some(EntityState::Runnable) | Some(EntityState::Holding) => {
                    self.sim_state.borrow_mut().defer_event(event);
                }
                _ => {
                    log_undelivered_event(event);
                }
            }
            true
        } else {
            false
        }
    }

    /// Performs the specified number of steps through the simulation.
    ///
    /// Returns `true` if there could be more pending events and `false` otherwise.
    pub fn steps(&mut self, step_count: u64) -> bool {
        for _ in 0..step_count {
            if !self.step() {
                return false;
            }
        }
        true
    }

    /// Steps through the simulation until there are no pending events left.
    pub fn step_until_no_events(&mut self) {
        while self.step() {}
    }

    /// Steps through the simulation with duration limit.
    ///
    /// Returns `true` if there could be more pending events and `false` otherwise.
    pub fn step_for_duration(&mut self, duration: f64) -> bool {
        let end_time = self.sim_state.borrow().time() + duration;
        loop {
            if let Some(event) = self.sim_state.borrow_mut().peek_event() {
                if event.time > end_time {
                    return true;
                }
            } else {
                return false;
            }
            self.step();
        }
    }

    /// Runs the simulation to completion and returns the final simulation time.
    ///
    /// Starts every registered entity (moving it to `Running` state and calling
    /// [`EventHandler::on_start`]), then steps through the events until the
    /// future queue is exhausted or the next event is scheduled after the
    /// termination time. Remaining events are drained without delivery, and
    /// every entity is shut down via [`EventHandler::on_shutdown`].
    pub fn run(&mut self) -> f64 {
        self.start_entities();
        loop {
            let next_time = self.sim_state.borrow_mut().peek_event().map(|e| e.time);
            match next_time {
                Some(time) => {
                    if let Some(limit) = self.sim_state.borrow().termination_time() {
                        if time > limit {
                            break;
                        }
                    }
                    self.step();
                }
                None => break,
            }
        }
        self.sim_state.borrow_mut().drain_events();
        self.shutdown_entities();
        self.time()
    }

    fn start_entities(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        for id in 0..self.handlers.len() {
            if let Some(handler) = self.handlers[id].clone() {
                // an entity put on hold before the start stays on hold
                if self.entity_states[id] == EntityState::Runnable {
                    self.entity_states[id] = EntityState::Running;
                }
                handler.borrow_mut().on_start();
            }
        }
    }

    fn shutdown_entities(&mut self) {
        for id in 0..self.handlers.len() {
            if let Some(handler) = self.handlers[id].clone() {
                self.entity_states[id] = EntityState::Finished;
                handler.borrow_mut().on_shutdown();
            }
        }
    }

    /// Stops the simulation, draining all pending and deferred events without delivery.
    pub fn stop(&mut self) {
        self.sim_state.borrow_mut().drain_events();
    }

    /// Returns a random float in the range _[0, 1)_
    /// using the simulation-wide random number generator.
    pub fn rand(&mut self) -> f64 {
        self.sim_state.borrow_mut().rand()
    }

    /// Returns the total number of created events.
    ///
    /// Note that cancelled events are also counted here.
    pub fn event_count(&self) -> u64 {
        self.sim_state.borrow().event_count()
    }

    /// Cancels events that satisfy the given predicate function.
    ///
    /// Note that already processed events cannot be cancelled.
    pub fn cancel_events<F>(&mut self, pred: F)
    where
        F: Fn(&Event) -> bool,
    {
        self.sim_state.borrow_mut().cancel_events(pred);
    }

    /// Cancels the earliest pending event that satisfies the given predicate function.
    pub fn cancel_first_event<F>(&mut self, pred: F) -> bool
    where
        F: Fn(&Event) -> bool,
    {
        self.sim_state.borrow_mut().cancel_first_event(pred)
    }

    /// Returns a copy of pending events sorted by their occurrence order.
    pub fn dump_events(&self) -> Vec<Event> {
        self.sim_state.borrow().dump_events()
    }
}
