use std::collections::{BinaryHeap, HashSet};

use rand::distributions::uniform::{SampleRange, SampleUniform};
use rand::prelude::*;
use rand_pcg::Pcg64;

use crate::component::Id;
use crate::event::{Event, EventData, EventId};

/// Absolute tolerance used for floating-point comparisons across the simulator.
pub const EPSILON: f64 = 1e-12;

pub struct SimulationState {
    clock: f64,
    rand: Pcg64,
    events: BinaryHeap<Event>,
    // events whose destination was not ready, kept ordered by (time, id)
    deferred: Vec<Event>,
    canceled_events: HashSet<EventId>,
    event_count: u64,
    min_event_gap: f64,
    termination_time: Option<f64>,
}

impl SimulationState {
    pub fn new(seed: u64) -> Self {
        Self {
            clock: 0.0,
            rand: Pcg64::seed_from_u64(seed),
            events: BinaryHeap::new(),
            deferred: Vec::new(),
            canceled_events: HashSet::new(),
            event_count: 0,
            min_event_gap: EPSILON,
            termination_time: None,
        }
    }

    pub fn time(&self) -> f64 {
        self.clock
    }

    pub fn set_min_event_gap(&mut self, gap: f64) {
        assert!(gap > 0., "min event gap must be strictly positive, got {}", gap);
        self.min_event_gap = gap;
    }

    pub fn min_event_gap(&self) -> f64 {
        self.min_event_gap
    }

    pub fn set_termination_time(&mut self, time: f64) {
        self.termination_time = Some(time);
    }

    pub fn termination_time(&self) -> Option<f64> {
        self.termination_time
    }

    pub fn rand(&mut self) -> f64 {
        self.rand.gen_range(0.0..1.0)
    }

    pub fn gen_range<T, R>(&mut self, range: R) -> T
    where
        T: SampleUniform,
        R: SampleRange<T>,
    {
        self.rand.gen_range(range)
    }

    pub fn add_event<T>(&mut self, data: T, src: Id, dst: Id, delay: f64) -> EventId
    where
        T: EventData,
    {
        assert!(
            delay >= 0.,
            "invalid schedule: negative delay {} for event from {} to {}",
            delay,
            src,
            dst
        );
        let event_id = self.event_count;
        let event = Event {
            id: event_id,
            time: self.clock + delay.max(self.min_event_gap),
            src,
            dst,
            data: Box::new(data),
        };
        self.events.push(event);
        self.event_count += 1;
        event_id
    }

    pub fn next_event(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.events.pop() {
                if !self.canceled_events.remove(&event.id) {
                    // the clock never goes backwards, even if a deferred event
                    // scheduled in the past is requeued
                    self.clock = self.clock.max(event.time);
                    return Some(event);
                }
            } else {
                return None;
            }
        }
    }

    pub fn peek_event(&mut self) -> Option<&Event> {
        while let Some(event) = self.events.peek() {
            if self.canceled_events.contains(&event.id) {
                let event = self.events.pop().unwrap();
                self.canceled_events.remove(&event.id);
            } else {
                break;
            }
        }
        self.events.peek()
    }

    /// Moves an undeliverable event to the deferred queue.
    pub fn defer_event(&mut self, event: Event) {
        let pos = self
            .deferred
            .partition_point(|e| e.time < event.time || (e.time == event.time && e.id < event.id));
        self.deferred.insert(pos, event);
    }

    /// Returns a copy of the first deferred event for the given destination
    /// matching the predicate.
    pub fn find_first_deferred<F>(&self, dst: Id, pred: F) -> Option<Event>
    where
        F: Fn(&Event) -> bool,
    {
        self.deferred.iter().find(|e| e.dst == dst && pred(e)).cloned()
    }

    /// Puts deferred events of the resumed entity back into the future queue.
    pub fn resume_deferred(&mut self, dst: Id) {
        let mut kept = Vec::with_capacity(self.deferred.len());
        for event in self.deferred.drain(..) {
            if event.dst == dst {
                self.events.push(event);
            } else {
                kept.push(event);
            }
        }
        self.deferred = kept;
    }

    pub fn cancel_events<F>(&mut self, pred: F)
    where
        F: Fn(&Event) -> bool,
    {
        for event in self.events.iter() {
            if !self.canceled_events.contains(&event.id) && pred(event) {
                self.canceled_events.insert(event.id);
            }
        }
    }

    /// Cancels the earliest pending event matching the predicate.
    ///
    /// Returns `true` if some event was canceled.
    pub fn cancel_first_event<F>(&mut self, pred: F) -> bool
    where
        F: Fn(&Event) -> bool,
    {
        let mut first: Option<(f64, EventId)> = None;
        for event in self.events.iter() {
            if self.canceled_events.contains(&event.id) || !pred(event) {
                continue;
            }
            if first.is_none() || (event.time, event.id) < first.unwrap() {
                first = Some((event.time, event.id));
            }
        }
        if let Some((_, id)) = first {
            self.canceled_events.insert(id);
            true
        } else {
            false
        }
    }

    /// Discards all pending and deferred events without delivery.
    pub fn drain_events(&mut self) {
        self.events.clear();
        self.deferred.clear();
        self.canceled_events.clear();
    }

    pub fn dump_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for event in self.events.iter() {
            if !self.canceled_events.contains(&event.id) {
                events.push(event.clone());
            }
        }
        events.sort();
        // heap order is reversed
        events.reverse();
        events
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }
}
