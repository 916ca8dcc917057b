//! Sessions: the instruments belonging to one client.
//!
//! An [`Experiment`] owns one instrument per logical port and polls all of
//! them from a single thread. Every command dispatch and every hook between
//! instruments of one session therefore happens in one place, in order.

use crate::config::InstrumentOptions;
use crate::error::Result;
use crate::instrument::{lock, DynInstrument, Instrument, PortHandle};
use crate::instruments::{CurrentSource, MagnetProgrammer, Voltmeter};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub type SharedInstrument = Arc<Mutex<dyn DynInstrument>>;

/// Cooperative cancellation flag shared by the server, its sessions and
/// their connections.
#[derive(Clone)]
pub struct EndSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for EndSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl EndSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Completes once the signal has been triggered.
    pub async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = receiver.wait_for(|ended| *ended).await;
    }
}

pub struct Experiment {
    name: String,
    stations: BTreeMap<u16, SharedInstrument>,
    ports: BTreeMap<u16, PortHandle>,
    lines_per_poll: usize,
}

pub struct ExperimentBuilder {
    experiment: Experiment,
}

impl ExperimentBuilder {
    /// Serves `instrument` on the logical `port`.
    pub fn attach<I: Instrument>(mut self, port: u16, instrument: Arc<Mutex<I>>) -> Self {
        let handle = lock(&instrument).take_port();
        let experiment = &mut self.experiment;
        match handle {
            Some(handle) => {
                experiment.ports.insert(port, handle);
            }
            None => warn!("{} on port {} has no free queues", experiment.name, port),
        }
        if experiment.stations.insert(port, instrument).is_some() {
            warn!("{}: port {} attached twice, keeping the last instrument", experiment.name, port);
        }
        self
    }

    pub fn lines_per_poll(mut self, lines: usize) -> Self {
        self.experiment.lines_per_poll = lines.max(1);
        self
    }

    pub fn build(self) -> Experiment {
        self.experiment
    }
}

impl Experiment {
    pub fn builder(name: impl Into<String>) -> ExperimentBuilder {
        ExperimentBuilder {
            experiment: Experiment {
                name: name.into(),
                stations: BTreeMap::new(),
                ports: BTreeMap::new(),
                lines_per_poll: crate::config::DEFAULT_LINES_PER_POLL,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ports(&self) -> Vec<u16> {
        self.stations.keys().copied().collect()
    }

    pub fn port(&self, port: u16) -> Option<PortHandle> {
        self.ports.get(&port).cloned()
    }

    pub fn set_lines_per_poll(&mut self, lines: usize) {
        self.lines_per_poll = lines.max(1);
    }

    pub fn instrument(&self, port: u16) -> Option<SharedInstrument> {
        self.stations.get(&port).cloned()
    }

    /// One pass over every instrument. Returns the number of lines handled.
    pub fn poll_once(&self) -> usize {
        self.stations
            .values()
            .map(|station| lock(station).process_messages(self.lines_per_poll))
            .sum()
    }

    /// Polls until `end` fires, then shuts the instruments down.
    pub fn run(&self, end: &EndSignal, idle: Duration) {
        info!("🧪 Experiment {} started", self.name);
        while !end.is_triggered() {
            if self.poll_once() == 0 {
                thread::sleep(idle);
            }
        }
        self.shutdown();
        info!("🧪 Experiment {} finished", self.name);
    }

    /// Runs the polling loop on a dedicated thread.
    pub fn spawn(self: Arc<Self>, end: EndSignal, idle: Duration) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("experiment-{}", self.name))
            .spawn(move || self.run(&end, idle))
    }

    pub fn shutdown(&self) {
        for station in self.stations.values() {
            lock(station).close();
        }
    }
}

/// Recipe for the experiment each new client receives.
pub trait ExperimentSetup: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Logical ports, one per instrument.
    fn ports(&self) -> Vec<u16>;

    fn build(&self, client: IpAddr, options: &InstrumentOptions) -> Result<Experiment>;
}

/// A current source driving a voltmeter through a resistor.
#[derive(Debug, Clone, PartialEq)]
pub struct OhmSetup {
    pub resistance: f64,
    pub voltmeter_port: u16,
    pub source_port: u16,
}

impl OhmSetup {
    pub const VOLTMETER_PORT: u16 = 9001;
    pub const SOURCE_PORT: u16 = 9002;

    pub fn new(resistance: f64) -> Self {
        Self {
            resistance,
            voltmeter_port: Self::VOLTMETER_PORT,
            source_port: Self::SOURCE_PORT,
        }
    }

    /// The two instruments, already wired together.
    pub fn instruments(
        &self,
        options: &InstrumentOptions,
    ) -> Result<(Arc<Mutex<Voltmeter>>, Arc<Mutex<CurrentSource>>)> {
        let voltmeter = Arc::new(Mutex::new(Voltmeter::new(options)?));
        let mut source = CurrentSource::new(options)?;

        let resistance = self.resistance;
        let meter = Arc::clone(&voltmeter);
        source.add_hook(None, move |source: &CurrentSource, _| {
            let voltage = if source.is_on() {
                source.current() * resistance
            } else {
                0.0
            };
            lock(&meter).set_voltage(voltage);
        });

        Ok((voltmeter, Arc::new(Mutex::new(source))))
    }
}

impl ExperimentSetup for OhmSetup {
    fn name(&self) -> &str {
        "ohm"
    }

    fn ports(&self) -> Vec<u16> {
        vec![self.voltmeter_port, self.source_port]
    }

    fn build(&self, client: IpAddr, options: &InstrumentOptions) -> Result<Experiment> {
        let (voltmeter, source) = self.instruments(options)?;
        Ok(Experiment::builder(format!("ohm-{client}"))
            .attach(self.voltmeter_port, voltmeter)
            .attach(self.source_port, source)
            .build())
    }
}

/// A single magnet power-supply programmer.
#[derive(Debug, Clone, PartialEq)]
pub struct MagnetSetup {
    pub coil_constant: f64,
    pub inductance: f64,
    pub port: u16,
}

impl MagnetSetup {
    pub const PORT: u16 = 7180;

    pub fn new(coil_constant: f64, inductance: f64) -> Self {
        Self {
            coil_constant,
            inductance,
            port: Self::PORT,
        }
    }
}

impl ExperimentSetup for MagnetSetup {
    fn name(&self) -> &str {
        "magnet"
    }

    fn ports(&self) -> Vec<u16> {
        vec![self.port]
    }

    fn build(&self, client: IpAddr, options: &InstrumentOptions) -> Result<Experiment> {
        let magnet = MagnetProgrammer::new(self.coil_constant, self.inductance, options)?;
        Ok(Experiment::builder(format!("magnet-{client}"))
            .attach(self.port, Arc::new(Mutex::new(magnet)))
            .build())
    }
}
