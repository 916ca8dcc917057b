//! Background ramp worker.
//!
//! Some instruments keep changing after a command returns: a magnet power
//! supply ramps its field towards a target at a fixed rate. [`RampWorker`] runs
//! that motion on its own thread. Command handlers send [`WorkerEvent`]s; the
//! worker steps a [`Rampable`] model once per tick and records every state
//! transition in a bounded history.

use crate::instrument::lock;
use heapless::HistoryBuffer;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// Default interval between two ramp steps.
pub const DEFAULT_TICK: Duration = Duration::from_millis(50);

/// Number of state transitions kept for inspection.
pub const HISTORY_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Up => 1.0,
            Direction::Down => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RampState {
    /// At zero and not moving
    AtRest,
    Ramping { target: f64 },
    /// Stopped away from zero, either at the target or paused
    Holding,
    Manual(Direction),
    Zeroing,
    Faulted,
    Terminated,
}

impl RampState {
    /// Numeric state as reported by magnet programmer `STATE?` queries.
    pub fn code(self) -> u8 {
        match self {
            RampState::Terminated => 0,
            RampState::Ramping { .. } => 1,
            RampState::Holding => 2,
            RampState::Manual(Direction::Up) => 4,
            RampState::Manual(Direction::Down) => 5,
            RampState::Zeroing => 6,
            RampState::Faulted => 7,
            RampState::AtRest => 9,
        }
    }

    pub fn is_moving(self) -> bool {
        matches!(
            self,
            RampState::Ramping { .. } | RampState::Manual(_) | RampState::Zeroing
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    Start,
    Pause,
    Zero,
    Manual(Direction),
    Fault,
    Shutdown,
}

/// Device state the worker moves. Rates are in position units per second.
pub trait Rampable: Send + 'static {
    fn position(&self) -> f64;

    fn target(&self) -> f64;

    fn rate(&self) -> f64;

    /// End point of a manual ramp in `direction`.
    fn limit(&self, direction: Direction) -> f64;

    /// Writes a new position together with the velocity that produced it.
    fn apply(&mut self, position: f64, velocity: f64);

    /// Motion stopped at the current position.
    fn settle(&mut self) {
        let position = self.position();
        self.apply(position, 0.0);
    }

    /// Drops to the safe state, e.g. zero field after a quench.
    fn fault(&mut self);
}

struct Shared<M> {
    model: M,
    state: RampState,
    history: HistoryBuffer<RampState, HISTORY_DEPTH>,
}

impl<M> Shared<M> {
    fn transition(&mut self, state: RampState) {
        if self.state != state {
            debug!("🔄 Ramp state {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.history.write(state);
    }
}

pub struct RampWorker<M: Rampable> {
    shared: Arc<Mutex<Shared<M>>>,
    events: mpsc::Sender<WorkerEvent>,
    thread: Option<JoinHandle<()>>,
    tick: Duration,
}

impl<M: Rampable> RampWorker<M> {
    /// Starts the worker thread with `model` at rest.
    pub fn spawn(model: M, tick: Duration) -> std::io::Result<Self> {
        let mut history = HistoryBuffer::new();
        history.write(RampState::AtRest);
        let shared = Arc::new(Mutex::new(Shared {
            model,
            state: RampState::AtRest,
            history,
        }));
        let (events, receiver) = mpsc::channel();

        let thread = thread::Builder::new().name("ramp-worker".to_string()).spawn({
            let shared = Arc::clone(&shared);
            move || run(&shared, &receiver, tick)
        })?;

        Ok(Self {
            shared,
            events,
            thread: Some(thread),
            tick,
        })
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    pub fn send(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            debug!("Ramp worker already stopped, {:?} ignored", event);
        }
    }

    pub fn start(&self) {
        self.send(WorkerEvent::Start);
    }

    pub fn pause(&self) {
        self.send(WorkerEvent::Pause);
    }

    pub fn zero(&self) {
        self.send(WorkerEvent::Zero);
    }

    pub fn manual(&self, direction: Direction) {
        self.send(WorkerEvent::Manual(direction));
    }

    pub fn fault(&self) {
        self.send(WorkerEvent::Fault);
    }

    pub fn state(&self) -> RampState {
        lock(&self.shared).state
    }

    /// Recorded transitions, oldest first.
    pub fn history(&self) -> Vec<RampState> {
        lock(&self.shared).history.oldest_ordered().copied().collect()
    }

    /// Runs `f` with exclusive access to the model.
    pub fn with_model<R>(&self, f: impl FnOnce(&mut M) -> R) -> R {
        f(&mut lock(&self.shared).model)
    }

    /// Stops the thread and waits for it to exit.
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.send(WorkerEvent::Shutdown);
            if thread.join().is_err() {
                tracing::error!("Ramp worker thread panicked");
            }
        }
    }
}

impl<M: Rampable> Drop for RampWorker<M> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<M: Rampable>(shared: &Mutex<Shared<M>>, events: &mpsc::Receiver<WorkerEvent>, tick: Duration) {
    let mut pending = None;
    loop {
        let event = match pending.take() {
            Some(event) => event,
            None => match events.recv_timeout(tick) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => WorkerEvent::Shutdown,
            },
        };

        match event {
            WorkerEvent::Start => {
                let target = {
                    let mut guard = lock(shared);
                    let target = guard.model.target();
                    guard.transition(RampState::Ramping { target });
                    target
                };
                pending = ramp(shared, events, tick, target);
            }
            WorkerEvent::Zero => {
                lock(shared).transition(RampState::Zeroing);
                pending = ramp(shared, events, tick, 0.0);
            }
            WorkerEvent::Manual(direction) => {
                let limit = {
                    let mut guard = lock(shared);
                    guard.transition(RampState::Manual(direction));
                    guard.model.limit(direction)
                };
                pending = ramp(shared, events, tick, limit);
            }
            WorkerEvent::Pause => {
                let mut guard = lock(shared);
                guard.model.settle();
                guard.transition(RampState::Holding);
            }
            WorkerEvent::Fault => {
                let mut guard = lock(shared);
                guard.model.fault();
                guard.transition(RampState::Faulted);
            }
            WorkerEvent::Shutdown => {
                let mut guard = lock(shared);
                guard.model.settle();
                guard.transition(RampState::Terminated);
                info!("Ramp worker stopped");
                return;
            }
        }
    }
}

// Steps towards `target` once per tick. Returns the event that interrupted
// the ramp, or `None` when the target was reached.
fn ramp<M: Rampable>(
    shared: &Mutex<Shared<M>>,
    events: &mpsc::Receiver<WorkerEvent>,
    tick: Duration,
    target: f64,
) -> Option<WorkerEvent> {
    let seconds = tick.as_secs_f64();
    loop {
        {
            let mut guard = lock(shared);
            let position = guard.model.position();
            let remaining = target - position;
            let step = (guard.model.rate() * seconds).min(remaining.abs());
            let direction = remaining.signum();
            let next = if step >= remaining.abs() {
                target
            } else {
                position + direction * step
            };
            guard.model.apply(next, direction * step / seconds);

            if next == target {
                guard.model.settle();
                let state = if target == 0.0 {
                    RampState::AtRest
                } else {
                    RampState::Holding
                };
                guard.transition(state);
                return None;
            }
        }

        match events.recv_timeout(tick) {
            Ok(event) => return Some(event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Some(WorkerEvent::Shutdown),
        }
    }
}
