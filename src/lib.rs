//! # SCPI Instrument Simulator
//!
//! Virtual laboratory instruments speaking SCPI / IEEE 488.2 over plain TCP
//! sockets, so that instrument-control software can be developed and tested
//! without the hardware.
//!
//! ## Features
//!
//! - **Full program message grammar**: common and compound headers, shorthand
//!   headers relative to the previous unit, numbers with units, strings and
//!   arbitrary blocks
//! - **Command trees**: manual-style patterns such as
//!   `[:SOURce[1]]:CURRent[:LEVel]` expand into every long and short form
//! - **Per-client sessions**: every client address gets its own set of
//!   instruments, polled from one thread so hooks between them stay ordered
//! - **Background simulation**: ramping devices run on a worker thread that
//!   commands can interrupt within one tick
//! - **IEEE 488.2 status reporting**: error queue, event status and status byte
//!
//! ## Quick Start
//!
//! ```rust
//! use scpisim::config::InstrumentOptions;
//! use scpisim::instrument::Instrument;
//! use scpisim::instruments::CurrentSource;
//!
//! let mut source = CurrentSource::new(&InstrumentOptions::default())?;
//!
//! // Set commands produce no output; queries answer in order.
//! let responses = source.ask(":SOUR:CURR 2.5 A;:OUTP ON;:CURR?;:OUTP?");
//! assert_eq!(responses, vec!["2.50", "1"]);
//!
//! // Failures land in the error queue.
//! source.ask(":SOUR:CURR 20 A");
//! assert_eq!(source.ask("*ERR?")[0], "-222,\"Data out of range; 20 not within [-10, 10]\"");
//! # Ok::<(), scpisim::ScpiError>(())
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - Program message parser
//! - [`value`] - Numeric, boolean and choice argument resolution
//! - [`command_tree`] - Pattern registration and header resolution
//! - [`instrument`] - Instrument core, common commands and hooks
//! - [`worker`] - Background ramp worker
//! - [`instruments`] - Voltmeter, current source and magnet programmer
//! - [`experiment`] - Per-client sessions and their polling loop
//! - [`server`] - TCP listeners and connection loops
//! - [`config`] - Server and instrument settings

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod command_tree;
pub mod config;
pub mod error;
pub mod experiment;
pub mod instrument;
pub mod instruments;
pub mod protocol;
pub mod server;
pub mod value;
pub mod worker;

// Re-export main public types for convenience
pub use command_tree::{CommandTree, ShortForms};
pub use config::{InstrumentOptions, ServerConfig};
pub use error::{Result, ScpiError, ServerError};
pub use experiment::{EndSignal, Experiment, ExperimentSetup, MagnetSetup, OhmSetup};
pub use instrument::{DynInstrument, Instrument, InstrumentCore};
pub use protocol::{parse, Argument, Header};
pub use server::Server;
pub use worker::{RampState, RampWorker};
