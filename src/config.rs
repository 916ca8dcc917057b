//! Server and instrument settings.
//!
//! Every field has a default, so a configuration file only needs the values
//! it changes:
//!
//! ```json
//! { "host": "0.0.0.0", "instruments": { "line_ending": "\r\n" } }
//! ```

use crate::error::ServerError;
use crate::protocol::{encode_latin1, MAX_MESSAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1;
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_LINES_PER_POLL: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the instrument ports are bound to
    pub host: String,
    /// Pause between two polling passes of an experiment
    pub poll_interval_ms: u64,
    /// Size of a single socket read
    pub read_chunk_size: usize,
    /// Longest line accepted from one connection; longer lines are dropped
    pub max_line_length: usize,
    /// Lines one instrument may handle per polling pass
    pub lines_per_poll: usize,
    pub instruments: InstrumentOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_line_length: MAX_MESSAGE_SIZE,
            lines_per_poll: DEFAULT_LINES_PER_POLL,
            instruments: InstrumentOptions::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ServerError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Settings applied to every instrument an experiment creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentOptions {
    pub queue_depth: usize,
    pub line_ending: String,
    pub worker_tick_ms: u64,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        Self {
            queue_depth: crate::instrument::DEFAULT_QUEUE_DEPTH,
            line_ending: "\n".to_string(),
            worker_tick_ms: 50,
        }
    }
}

impl InstrumentOptions {
    pub fn line_ending_bytes(&self) -> Vec<u8> {
        if self.line_ending.is_empty() {
            b"\n".to_vec()
        } else {
            encode_latin1(&self.line_ending)
        }
    }

    pub fn worker_tick(&self) -> Duration {
        Duration::from_millis(self.worker_tick_ms.max(1))
    }
}
