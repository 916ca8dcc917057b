//! Shared instrument machinery.
//!
//! Every simulated instrument embeds an [`InstrumentCore`] and implements
//! [`Instrument`]. The core owns the command tree, the input and output queues,
//! the error queue, the IEEE 488.2 status registers and the hook table. The
//! provided trait methods implement message processing on top of it, and the
//! blanket [`DynInstrument`] impl lets an experiment hold instruments of
//! different types behind one interface.

use crate::command_tree::{CommandTree, ShortForms};
use crate::config::InstrumentOptions;
use crate::error::{Result, ScpiError};
use crate::protocol::{self, Argument, ProgramMessageUnit};
use crate::value::{no_args, single, FloatArg};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, warn};

/// Default depth of the per-instrument input and output queues.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Response to an error query when the queue is exhausted.
pub const NO_ERROR: &str = "0,\"No error\"";

// Standard event status register bits
pub const ESR_OPERATION_COMPLETE: u8 = 0x01;
pub const ESR_DEVICE_ERROR: u8 = 0x08;
pub const ESR_EXECUTION_ERROR: u8 = 0x10;
pub const ESR_COMMAND_ERROR: u8 = 0x20;

// Status byte bits
pub const STB_ERROR_QUEUE: u8 = 0x04;
pub const STB_EVENT_SUMMARY: u8 = 0x20;
pub const STB_MASTER_SUMMARY: u8 = 0x40;

/// Callback fired after a hookable value was set. Receives the instrument and
/// the name of the value that changed.
pub type Hook<T> = Arc<dyn Fn(&T, &str) + Send + Sync>;

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Append-only error log read through a cursor.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    entries: Vec<String>,
    cursor: usize,
}

impl ErrorLog {
    pub fn push(&mut self, entry: String) {
        self.entries.push(entry);
    }

    /// Oldest entry not yet read.
    pub fn next_entry(&mut self) -> Option<&str> {
        let entry = self.entries.get(self.cursor)?;
        self.cursor += 1;
        Some(entry.as_str())
    }

    pub fn pending(&self) -> usize {
        self.entries.len() - self.cursor
    }

    /// Marks every entry as read; the history itself is kept.
    pub fn clear(&mut self) {
        self.cursor = self.entries.len();
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusRegisters {
    pub event_status: u8,
    pub event_enable: u8,
    pub service_enable: u8,
}

/// Client side of an instrument's queues, handed to the transport.
#[derive(Clone)]
pub struct PortHandle {
    input: mpsc::Sender<Vec<u8>>,
    output: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>,
    line_ending: Vec<u8>,
}

impl PortHandle {
    pub fn line_ending(&self) -> &[u8] {
        &self.line_ending
    }

    /// Queues one program message, waiting while the input queue is full.
    pub async fn submit(&self, line: Vec<u8>) -> std::result::Result<(), Vec<u8>> {
        self.input.send(line).await.map_err(|error| error.0)
    }

    pub fn try_submit(&self, line: Vec<u8>) -> std::result::Result<(), TrySendError<Vec<u8>>> {
        self.input.try_send(line)
    }

    /// Waits for the next encoded response. `None` once the instrument is gone.
    pub async fn next_response(&self) -> Option<Vec<u8>> {
        self.output.lock().await.recv().await
    }

    pub fn try_response(&self) -> Option<Vec<u8>> {
        self.output.try_lock().ok()?.try_recv().ok()
    }
}

pub struct InstrumentCore<T> {
    identity: String,
    tree: Arc<CommandTree<T>>,
    line_ending: Vec<u8>,
    errors: ErrorLog,
    status: StatusRegisters,
    hooks: HashMap<Option<String>, Vec<Hook<T>>>,
    input: mpsc::Receiver<Vec<u8>>,
    output: mpsc::Sender<Vec<u8>>,
    backlog: VecDeque<Vec<u8>>,
    port: Option<PortHandle>,
}

impl<T> InstrumentCore<T> {
    pub fn new(identity: impl Into<String>, tree: CommandTree<T>, options: &InstrumentOptions) -> Self {
        let depth = options.queue_depth.max(1);
        let line_ending = options.line_ending_bytes();
        let (input_tx, input_rx) = mpsc::channel(depth);
        let (output_tx, output_rx) = mpsc::channel(depth);
        let port = PortHandle {
            input: input_tx,
            output: Arc::new(tokio::sync::Mutex::new(output_rx)),
            line_ending: line_ending.clone(),
        };
        Self {
            identity: identity.into(),
            tree: Arc::new(tree),
            line_ending,
            errors: ErrorLog::default(),
            status: StatusRegisters::default(),
            hooks: HashMap::new(),
            input: input_rx,
            output: output_tx,
            backlog: VecDeque::new(),
            port: Some(port),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn tree(&self) -> &CommandTree<T> {
        &self.tree
    }

    pub fn line_ending(&self) -> &[u8] {
        &self.line_ending
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    pub fn errors_mut(&mut self) -> &mut ErrorLog {
        &mut self.errors
    }

    pub fn status(&self) -> StatusRegisters {
        self.status
    }

    pub fn status_mut(&mut self) -> &mut StatusRegisters {
        &mut self.status
    }

    /// Status byte as reported by `*STB?`.
    pub fn status_byte(&self) -> u8 {
        let mut byte = 0;
        if self.errors.pending() > 0 {
            byte |= STB_ERROR_QUEUE;
        }
        if self.status.event_status & self.status.event_enable != 0 {
            byte |= STB_EVENT_SUMMARY;
        }
        if byte & self.status.service_enable != 0 {
            byte |= STB_MASTER_SUMMARY;
        }
        byte
    }

    pub fn log_error(&mut self, error: &ScpiError) {
        self.status.event_status |= match error.code() {
            -199..=-100 => ESR_COMMAND_ERROR,
            -299..=-200 => ESR_EXECUTION_ERROR,
            _ => ESR_DEVICE_ERROR,
        };
        debug!("{}: {}", self.identity, error);
        self.errors.push(error.to_queue_entry());
    }

    fn send(&mut self, response: Vec<u8>) {
        self.flush_backlog();
        if !self.backlog.is_empty() {
            self.backlog.push_back(response);
            return;
        }
        match self.output.try_send(response) {
            Ok(()) => {}
            Err(TrySendError::Full(response)) => {
                warn!("⚠️ Output queue full on {}, holding response", self.identity);
                self.backlog.push_back(response);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("{}: output queue closed, response dropped", self.identity);
            }
        }
    }

    fn flush_backlog(&mut self) {
        while let Some(response) = self.backlog.pop_front() {
            match self.output.try_send(response) {
                Ok(()) => {}
                Err(TrySendError::Full(response)) => {
                    self.backlog.push_front(response);
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    self.backlog.clear();
                    return;
                }
            }
        }
    }
}

/// A simulated instrument with its own command set.
pub trait Instrument: Sized + Send + 'static {
    fn core(&self) -> &InstrumentCore<Self>;

    fn core_mut(&mut self) -> &mut InstrumentCore<Self>;

    /// Restores power-on settings; invoked by `*RST`.
    fn reset(&mut self) {}

    /// Result of `*TST?`, `0` meaning passed.
    fn self_test(&mut self) -> String {
        "0".to_string()
    }

    /// Stops background activity before the instrument is dropped.
    fn shutdown(&mut self) {}

    /// Executes one program message, yielding query responses as they are produced.
    fn process(&mut self, line: &[u8]) -> Responses<'_, Self> {
        match protocol::parse(line) {
            Ok(message) => Responses::new(self, message.units, None),
            Err(error) => Responses::new(self, Vec::new(), Some(error)),
        }
    }

    /// Responses of `line` up to the first failure.
    fn ask(&mut self, line: &str) -> Vec<String> {
        self.process(line.as_bytes()).map_while(Result::ok).collect()
    }

    /// Registers `hook` for the value `name`, or for every hookable value when `None`.
    fn add_hook<F>(&mut self, name: Option<&str>, hook: F)
    where
        F: Fn(&Self, &str) + Send + Sync + 'static,
    {
        self.core_mut()
            .hooks
            .entry(name.map(str::to_string))
            .or_default()
            .push(Arc::new(hook));
    }

    /// Fires the hooks registered for `name` and the wildcard hooks.
    fn notify(&self, name: &str) {
        let hooks = &self.core().hooks;
        let named = hooks.get(&Some(name.to_string())).into_iter().flatten();
        let wildcard = hooks.get(&None).into_iter().flatten();
        for hook in named.chain(wildcard) {
            hook(self, name);
        }
    }
}

/// Wraps a setter so that the hooks for `name` fire once it succeeds.
pub fn hooked<T, F>(name: &'static str, setter: F) -> impl Fn(&mut T, &[Argument]) -> Result<()>
where
    T: Instrument,
    F: Fn(&mut T, &[Argument]) -> Result<()> + Send + Sync + 'static,
{
    move |target, args| {
        setter(target, args)?;
        target.notify(name);
        Ok(())
    }
}

/// Lazy execution of one program message.
///
/// Each unit runs when the iterator is advanced. The first failure is logged
/// to the instrument, yielded as an `Err`, and ends the iteration, so the
/// effects and responses of earlier units stand.
pub struct Responses<'a, T: Instrument> {
    instrument: &'a mut T,
    units: std::vec::IntoIter<ProgramMessageUnit>,
    parent: Vec<String>,
    pending: Option<ScpiError>,
    done: bool,
}

impl<'a, T: Instrument> Responses<'a, T> {
    fn new(instrument: &'a mut T, units: Vec<ProgramMessageUnit>, pending: Option<ScpiError>) -> Self {
        Self {
            instrument,
            units: units.into_iter(),
            parent: Vec::new(),
            pending,
            done: false,
        }
    }

    fn execute(&mut self, unit: ProgramMessageUnit) -> Result<Option<String>> {
        let command = match unit {
            ProgramMessageUnit::Command(command) => command,
            ProgramMessageUnit::Empty => return Ok(None),
            ProgramMessageUnit::Invalid(text) => return Err(ScpiError::Parse(text)),
        };

        let tree = Arc::clone(&self.instrument.core().tree);
        let resolved = tree.resolve(&command.header, &self.parent)?;
        self.parent = resolved.parent;

        if command.query {
            let handler = resolved.handlers.query_handler(&command.header)?;
            handler(self.instrument, &command.args).map(Some)
        } else {
            let handler = resolved.handlers.set_handler(&command.header)?;
            handler(self.instrument, &command.args).map(|()| None)
        }
    }

    fn fail(&mut self, error: ScpiError) -> Option<Result<String>> {
        self.done = true;
        self.instrument.core_mut().log_error(&error);
        Some(Err(error))
    }
}

impl<T: Instrument> Iterator for Responses<'_, T> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(error) = self.pending.take() {
            return self.fail(error);
        }
        loop {
            let Some(unit) = self.units.next() else {
                self.done = true;
                return None;
            };
            match self.execute(unit) {
                Ok(Some(response)) => return Some(Ok(response)),
                Ok(None) => {}
                Err(error) => return self.fail(error),
            }
        }
    }
}

/// Object-safe view of an instrument used by experiments and the server.
pub trait DynInstrument: Send {
    fn name(&self) -> &str;

    /// Handles at most `budget` queued lines without blocking. Returns the
    /// number of lines handled.
    ///
    /// Input stays queued while a response is held back for a full output
    /// queue, so at most one response waits outside the queue.
    fn process_messages(&mut self, budget: usize) -> usize;

    /// Takes the client side of the queues; available once.
    fn take_port(&mut self) -> Option<PortHandle>;

    /// Records a transport-level error in the instrument's error queue.
    fn log_error(&mut self, error: &ScpiError);

    fn close(&mut self);
}

impl<T: Instrument> DynInstrument for T {
    fn name(&self) -> &str {
        self.core().identity()
    }

    fn process_messages(&mut self, budget: usize) -> usize {
        self.core_mut().flush_backlog();

        let mut handled = 0;
        while handled < budget {
            if !self.core().backlog.is_empty() {
                debug!("{}: output queue full, input paused", self.core().identity());
                break;
            }
            let line = match self.core_mut().input.try_recv() {
                Ok(line) => line,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            };
            handled += 1;

            let results: Vec<Result<String>> = self.process(&line).collect();
            let mut responses = Vec::new();
            for response in results {
                match response {
                    Ok(response) => responses.push(response),
                    Err(error) => warn!(
                        "❌ {} rejected `{}`: {}",
                        self.core().identity(),
                        protocol::decode_latin1(&line),
                        error
                    ),
                }
            }

            if !responses.is_empty() {
                let encoded = protocol::encode_response(&responses, &self.core().line_ending);
                self.core_mut().send(encoded);
            }
        }
        handled
    }

    fn take_port(&mut self) -> Option<PortHandle> {
        self.core_mut().port.take()
    }

    fn log_error(&mut self, error: &ScpiError) {
        self.core_mut().log_error(error);
    }

    fn close(&mut self) {
        Instrument::shutdown(self);
    }
}

fn register_byte(args: &[Argument]) -> Result<u8> {
    let value = FloatArg::new().limits(0.0, 255.0).resolve(single(args)?)?;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(value.round() as u8)
}

fn next_error<T: Instrument>(target: &mut T, args: &[Argument]) -> Result<String> {
    no_args(args)?;
    Ok(target
        .core_mut()
        .errors
        .next_entry()
        .map_or_else(|| NO_ERROR.to_string(), str::to_string))
}

/// Command tree holding the IEEE 488.2 common commands and the SCPI error
/// queue, the starting point for every instrument's own tree.
pub fn base_commands<T: Instrument>() -> Result<CommandTree<T>> {
    let mut tree = CommandTree::new(ShortForms::Derived);

    tree.on_query("*IDN", |target: &mut T, args| {
        no_args(args)?;
        Ok(target.core().identity().to_string())
    })?;
    tree.on_set("*RST", |target: &mut T, args| {
        no_args(args)?;
        target.reset();
        Ok(())
    })?;
    tree.on_query("*TST", |target: &mut T, args| {
        no_args(args)?;
        Ok(target.self_test())
    })?;
    tree.on_set("*OPC", |target: &mut T, args| {
        no_args(args)?;
        target.core_mut().status.event_status |= ESR_OPERATION_COMPLETE;
        Ok(())
    })?;
    tree.on_query("*OPC", |_: &mut T, args| {
        no_args(args)?;
        Ok("1".to_string())
    })?;
    tree.on_set("*WAI", |_: &mut T, args| no_args(args))?;
    tree.on_set("*CLS", |target: &mut T, args| {
        no_args(args)?;
        let core = target.core_mut();
        core.errors.clear();
        core.status.event_status = 0;
        Ok(())
    })?;
    tree.on_set("*ESE", |target: &mut T, args| {
        target.core_mut().status.event_enable = register_byte(args)?;
        Ok(())
    })?;
    tree.on_query("*ESE", |target: &mut T, args| {
        no_args(args)?;
        Ok(target.core().status.event_enable.to_string())
    })?;
    tree.on_query("*ESR", |target: &mut T, args| {
        no_args(args)?;
        let status = &mut target.core_mut().status;
        Ok(std::mem::take(&mut status.event_status).to_string())
    })?;
    tree.on_set("*SRE", |target: &mut T, args| {
        target.core_mut().status.service_enable = register_byte(args)?;
        Ok(())
    })?;
    tree.on_query("*SRE", |target: &mut T, args| {
        no_args(args)?;
        Ok(target.core().status.service_enable.to_string())
    })?;
    tree.on_query("*STB", |target: &mut T, args| {
        no_args(args)?;
        Ok(target.core().status_byte().to_string())
    })?;
    tree.on_query("*ERR", next_error::<T>)?;
    tree.on_query(":SYSTem:ERRor[:NEXT]", next_error::<T>)?;

    Ok(tree)
}
