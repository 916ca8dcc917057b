//! Error types shared by the protocol engine and the transport.
//!
//! [`ScpiError`] covers everything that can go wrong while a program message is
//! parsed, resolved against a command tree and executed by an instrument, plus
//! the registration-time failures of a command tree. [`ServerError`] covers the
//! socket side.

use std::net::IpAddr;
use thiserror::Error;

/// Result type alias using [`ScpiError`].
pub type Result<T> = std::result::Result<T, ScpiError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScpiError {
    // ============ Message errors ============
    /// A program message unit could not be tokenized
    #[error("Syntax error; {0}")]
    Parse(String),

    /// The whole program message exceeds the receive buffer
    #[error("Program message too long; {length} bytes exceed {limit}")]
    MessageTooLarge { length: usize, limit: usize },

    // ============ Dispatch errors ============
    /// No registered node for the header, or the node has no handlers at all
    #[error("Undefined header; {header}")]
    UnsupportedCommand { header: String },

    /// The header exists but only in query form
    #[error("Undefined header; {header} is query only")]
    NotSettable { header: String },

    /// The header exists but only in set form
    #[error("Undefined header; {header}? has no query form")]
    NotQueryable { header: String },

    // ============ Argument errors ============
    #[error("Illegal parameter value; {0}")]
    InvalidArgument(String),

    #[error("Data out of range; {value} not within [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },

    /// Instrument-specific condition, e.g. an accessory that is not installed
    #[error("Device-specific error; {0}")]
    Device(String),

    // ============ Registration errors ============
    #[error("Invalid command pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Duplicate short mnemonic {short} generated from {long}")]
    ShortFormCollision { short: String, long: String },

    #[error("Command {pattern} already registered")]
    AlreadyRegistered { pattern: String },
}

impl ScpiError {
    /// Standard SCPI error number reported through the error queue.
    pub fn code(&self) -> i16 {
        match self {
            ScpiError::Parse(_) => -102,
            ScpiError::MessageTooLarge { .. } => -223,
            ScpiError::UnsupportedCommand { .. }
            | ScpiError::NotSettable { .. }
            | ScpiError::NotQueryable { .. } => -113,
            ScpiError::InvalidArgument(_) => -224,
            ScpiError::OutOfRange { .. } => -222,
            ScpiError::Device(_) => -300,
            ScpiError::InvalidPattern { .. }
            | ScpiError::ShortFormCollision { .. }
            | ScpiError::AlreadyRegistered { .. } => -100,
        }
    }

    /// Error-queue entry in the `<code>,"<message>"` form.
    pub fn to_queue_entry(&self) -> String {
        format!("{},\"{}\"", self.code(), self).replace('\n', " ")
    }

    /// Whether the failure belongs to the "command error" class of the standard
    /// event status register (as opposed to execution or device errors).
    pub fn is_command_error(&self) -> bool {
        matches!(self.code(), -199..=-100)
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ScpiError::InvalidArgument(message.into())
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("No instrument found at port {port}; available ports are {available:?}")]
    NoInstrument { port: u16, available: Vec<u16> },

    #[error("Cannot create session for {client}: {source}")]
    Session {
        client: IpAddr,
        #[source]
        source: ScpiError,
    },

    #[error("Instrument queue for port {port} is closed")]
    QueueClosed { port: u16 },
}
