use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;

use dcsim_core::{cast, Event, EventCancellationPolicy, EventHandler, Id, Simulation, SimulationContext};

#[derive(Clone, Serialize)]
struct Ping {
    seq: u32,
}

#[derive(Clone, Serialize)]
struct Tick {}

struct Recorder {
    delivered: Vec<(f64, u32)>,
}

struct RecorderComponent {
    recorder: Rc<RefCell<Recorder>>,
}

impl EventHandler for RecorderComponent {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            Ping { seq } => {
                self.recorder.borrow_mut().delivered.push((event.time, seq));
            }
        })
    }
}

fn make_recorder(sim: &mut Simulation, name: &str) -> (Id, Rc<RefCell<Recorder>>) {
    let recorder = Rc::new(RefCell::new(Recorder { delivered: Vec::new() }));
    let comp = Rc::new(RefCell::new(RecorderComponent {
        recorder: recorder.clone(),
    }));
    let id = sim.add_handler(name, comp);
    (id, recorder)
}

#[test]
fn test_clock_monotonicity() {
    let mut sim = Simulation::new(123);
    let (dst, recorder) = make_recorder(&mut sim, "dst");
    let ctx = sim.create_context("src");

    ctx.emit(Ping { seq: 2 }, dst, 5.0);
    ctx.emit(Ping { seq: 0 }, dst, 1.0);
    ctx.emit(Ping { seq: 1 }, dst, 3.0);
    sim.run();

    let delivered = recorder.borrow().delivered.clone();
    assert_eq!(delivered.iter().map(|d| d.1).collect::<Vec<_>>(), vec![0, 1, 2]);
    for pair in delivered.windows(2) {
        assert!(pair[0].0 <= pair[1].0);
    }
    assert_eq!(sim.time(), 5.0);
}

#[test]
fn test_fifo_order_of_simultaneous_events() {
    let mut sim = Simulation::new(123);
    let (dst, recorder) = make_recorder(&mut sim, "dst");
    let ctx = sim.create_context("src");

    for seq in 0..10 {
        ctx.emit(Ping { seq }, dst, 2.0);
    }
    sim.run();

    let seqs: Vec<u32> = recorder.borrow().delivered.iter().map(|d| d.1).collect();
    assert_eq!(seqs, (0..10).collect::<Vec<_>>());
}

#[test]
fn test_min_event_gap_is_applied() {
    let mut sim = Simulation::new(123);
    sim.set_min_event_gap(0.5);
    let (dst, recorder) = make_recorder(&mut sim, "dst");
    let ctx = sim.create_context("src");

    ctx.emit_now(Ping { seq: 0 }, dst);
    ctx.emit(Ping { seq: 1 }, dst, 0.1);
    sim.run();

    let delivered = recorder.borrow().delivered.clone();
    assert_eq!(delivered, vec![(0.5, 0), (0.5, 1)]);
}

#[test]
#[should_panic(expected = "invalid schedule")]
fn test_negative_delay_panics() {
    let mut sim = Simulation::new(123);
    let (dst, _) = make_recorder(&mut sim, "dst");
    let ctx = sim.create_context("src");
    ctx.emit(Ping { seq: 0 }, dst, -1.0);
}

#[test]
fn test_termination_time() {
    let mut sim = Simulation::new(123);
    sim.terminate_at(4.0);
    let (dst, recorder) = make_recorder(&mut sim, "dst");
    let ctx = sim.create_context("src");

    ctx.emit(Ping { seq: 0 }, dst, 2.0);
    ctx.emit(Ping { seq: 1 }, dst, 4.0);
    ctx.emit(Ping { seq: 2 }, dst, 6.0);
    sim.run();

    // events after the termination time are drained without delivery
    let seqs: Vec<u32> = recorder.borrow().delivered.iter().map(|d| d.1).collect();
    assert_eq!(seqs, vec![0, 1]);
    assert_eq!(sim.dump_events().len(), 0);
}

#[test]
fn test_cancel_first_and_all() {
    let mut sim = Simulation::new(123);
    let (dst, recorder) = make_recorder(&mut sim, "dst");
    let ctx = sim.create_context("src");
    let src = ctx.id();

    ctx.emit(Ping { seq: 0 }, dst, 1.0);
    ctx.emit(Ping { seq: 1 }, dst, 2.0);
    ctx.emit(Ping { seq: 2 }, dst, 3.0);
    ctx.emit(Tick {}, dst, 2.5);

    // drops the earliest Ping only
    assert!(sim.cancel_first_event(|e| e.src == src && e.data.is::<Ping>()));
    sim.cancel_events(|e| e.src == src && e.data.is::<Tick>());
    sim.run();

    let seqs: Vec<u32> = recorder.borrow().delivered.iter().map(|d| d.1).collect();
    assert_eq!(seqs, vec![1, 2]);
}

#[test]
fn test_deferred_events_for_holding_entity() {
    let mut sim = Simulation::new(123);
    let (dst, recorder) = make_recorder(&mut sim, "dst");
    let (other, other_recorder) = make_recorder(&mut sim, "other");
    let ctx = sim.create_context("src");

    ctx.emit(Ping { seq: 0 }, dst, 1.0);
    ctx.emit(Ping { seq: 1 }, dst, 2.0);
    ctx.emit(Ping { seq: 2 }, other, 3.0);

    // entities start running on the first step
    sim.steps(1);
    assert_eq!(recorder.borrow().delivered.len(), 1);

    sim.hold(dst);
    sim.step_until_no_events();
    assert_eq!(recorder.borrow().delivered.len(), 1);
    assert_eq!(other_recorder.borrow().delivered.len(), 1);
    assert_eq!(sim.time(), 3.0);

    // deferred events are redelivered on resume, clock stays monotone
    sim.resume(dst);
    sim.step_until_no_events();
    let delivered = recorder.borrow().delivered.clone();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[1].1, 1);
    assert_eq!(sim.time(), 3.0);
}

#[test]
fn test_find_first_deferred() {
    let mut sim = Simulation::new(123);
    let dst_ctx = sim.create_context("dst");
    let (dst, _) = make_recorder(&mut sim, "dst");
    let ctx = sim.create_context("src");

    ctx.emit(Ping { seq: 7 }, dst, 1.0);
    ctx.emit(Tick {}, dst, 2.0);
    sim.hold(dst);
    sim.step_until_no_events();

    // deferred events are observable without removal
    let found = dst_ctx.find_first_deferred(|e| e.data.is::<Tick>()).unwrap();
    assert_eq!(found.time, 2.0);
    let found = dst_ctx.find_first_deferred(|e| e.data.is::<Ping>()).unwrap();
    assert_eq!(found.time, 1.0);
    assert!(dst_ctx
        .find_first_deferred(|e| e.data.is::<Ping>() && e.time > 1.5)
        .is_none());

    let probe_ctx = sim.create_context("probe");
    assert!(probe_ctx.find_first_deferred(|_| true).is_none());
}

#[test]
fn test_remove_handler_cancels_events() {
    let mut sim = Simulation::new(123);
    let (dst, recorder) = make_recorder(&mut sim, "dst");
    let (_, other_recorder) = make_recorder(&mut sim, "other");
    let other = sim.lookup_id("other");
    let ctx = sim.create_context("src");

    ctx.emit(Ping { seq: 0 }, dst, 1.0);
    ctx.emit(Ping { seq: 1 }, dst, 2.0);
    ctx.emit(Ping { seq: 2 }, other, 2.0);
    sim.steps(1);

    sim.remove_handler("dst", EventCancellationPolicy::Incoming);
    sim.run();

    assert_eq!(recorder.borrow().delivered.len(), 1);
    assert_eq!(other_recorder.borrow().delivered.len(), 1);
}

#[test]
fn test_stop_drains_pending_events() {
    let mut sim = Simulation::new(123);
    let (dst, recorder) = make_recorder(&mut sim, "dst");
    let ctx = sim.create_context("src");

    ctx.emit(Ping { seq: 0 }, dst, 1.0);
    ctx.emit(Ping { seq: 1 }, dst, 2.0);
    sim.steps(1);

    sim.stop();
    assert!(!sim.step());
    assert_eq!(recorder.borrow().delivered.len(), 1);
    assert_eq!(sim.time(), 1.0);
}

struct SelfScheduler {
    ctx: SimulationContext,
    ticks: u32,
    started: bool,
    stopped: bool,
}

impl EventHandler for SelfScheduler {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            Tick {} => {
                self.ticks += 1;
                if self.ticks < 3 {
                    self.ctx.emit_self(Tick {}, 1.0);
                }
            }
        })
    }

    fn on_start(&mut self) {
        self.started = true;
        self.ctx.emit_self(Tick {}, 1.0);
    }

    fn on_shutdown(&mut self) {
        self.stopped = true;
    }
}

#[test]
fn test_entity_lifecycle() {
    let mut sim = Simulation::new(123);
    let ctx = sim.create_context("timer");
    let comp = Rc::new(RefCell::new(SelfScheduler {
        ctx,
        ticks: 0,
        started: false,
        stopped: false,
    }));
    sim.add_handler("timer", comp.clone());

    let timer_id = sim.lookup_id("timer");
    assert_eq!(sim.entity_state(timer_id), dcsim_core::EntityState::Runnable);

    let end_time = sim.run();

    assert!(comp.borrow().started);
    assert!(comp.borrow().stopped);
    assert_eq!(comp.borrow().ticks, 3);
    assert_eq!(end_time, 3.0);
    assert_eq!(sim.entity_state(timer_id), dcsim_core::EntityState::Finished);
}
