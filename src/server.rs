//! TCP transport in the VISA `TCPIP::<host>::<port>::SOCKET` form.
//!
//! One listener per logical instrument port. The first connection from a
//! client address creates that client's experiment; later connections from
//! the same address, on any port, join it. Each connection moves complete
//! lines into the instrument's input queue and responses back out.

use crate::config::ServerConfig;
use crate::error::{ScpiError, ServerError};
use crate::experiment::{EndSignal, Experiment, ExperimentSetup, SharedInstrument};
use crate::instrument::{lock, PortHandle};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Session {
    experiment: Arc<Experiment>,
    thread: std::thread::JoinHandle<()>,
}

struct Context<S> {
    config: ServerConfig,
    setup: S,
    sessions: Mutex<HashMap<IpAddr, Session>>,
    end: EndSignal,
}

impl<S: ExperimentSetup> Context<S> {
    /// Finds or creates the client's experiment and returns the queues and
    /// the instrument behind `port`.
    fn port_for(&self, client: IpAddr, port: u16) -> Result<(PortHandle, SharedInstrument), ServerError> {
        let mut sessions = lock(&self.sessions);
        let session = match sessions.entry(client) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut experiment = self
                    .setup
                    .build(client, &self.config.instruments)
                    .map_err(|source| ServerError::Session { client, source })?;
                experiment.set_lines_per_poll(self.config.lines_per_poll);
                let experiment = Arc::new(experiment);
                let thread = Arc::clone(&experiment)
                    .spawn(self.end.clone(), self.config.poll_interval())?;
                info!("🧪 Created {} session for {}", self.setup.name(), client);
                entry.insert(Session { experiment, thread })
            }
        };
        let experiment = &session.experiment;
        experiment
            .port(port)
            .zip(experiment.instrument(port))
            .ok_or_else(|| ServerError::NoInstrument {
                port,
                available: experiment.ports(),
            })
    }
}

pub struct Server<S: ExperimentSetup> {
    context: Arc<Context<S>>,
    listeners: Vec<(u16, TcpListener)>,
}

impl<S: ExperimentSetup> Server<S> {
    /// Binds every port of `setup` on the configured host.
    pub async fn bind(config: ServerConfig, setup: S) -> Result<Self, ServerError> {
        Self::bind_ports(config, setup, false).await
    }

    /// Like [`Server::bind`] but on OS-assigned ports; see [`Server::local_addr`].
    pub async fn bind_ephemeral(config: ServerConfig, setup: S) -> Result<Self, ServerError> {
        Self::bind_ports(config, setup, true).await
    }

    async fn bind_ports(config: ServerConfig, setup: S, ephemeral: bool) -> Result<Self, ServerError> {
        let mut listeners = Vec::new();
        for port in setup.ports() {
            let bind_port = if ephemeral { 0 } else { port };
            let listener = TcpListener::bind((config.host.as_str(), bind_port)).await?;
            info!(
                "🌐 {} port {} listening on TCPIP::{}::{}::SOCKET",
                setup.name(),
                port,
                config.host,
                listener.local_addr()?.port()
            );
            listeners.push((port, listener));
        }

        Ok(Self {
            context: Arc::new(Context {
                config,
                setup,
                sessions: Mutex::new(HashMap::new()),
                end: EndSignal::new(),
            }),
            listeners,
        })
    }

    /// Actual socket address serving the logical `port`.
    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|(logical, _)| *logical == port)
            .and_then(|(_, listener)| listener.local_addr().ok())
    }

    /// Triggering the returned signal stops [`Server::run`].
    pub fn end_signal(&self) -> EndSignal {
        self.context.end.clone()
    }

    /// Accepts connections until the end signal fires, then waits for every
    /// session to shut its instruments down.
    pub async fn run(self) -> Result<(), ServerError> {
        let mut accept_loops = Vec::new();
        for (port, listener) in self.listeners {
            let context = Arc::clone(&self.context);
            accept_loops.push(tokio::spawn(accept_loop(port, listener, context)));
        }

        self.context.end.wait().await;
        for task in accept_loops {
            if let Err(e) = task.await {
                error!("Listener task failed: {}", e);
            }
        }

        let sessions: Vec<Session> = lock(&self.context.sessions).drain().map(|(_, s)| s).collect();
        let joined = tokio::task::spawn_blocking(move || {
            for session in sessions {
                if session.thread.join().is_err() {
                    error!("Experiment {} panicked", session.experiment.name());
                }
            }
        });
        if let Err(e) = joined.await {
            error!("Session shutdown failed: {}", e);
        }
        info!("Server stopped");
        Ok(())
    }
}

async fn accept_loop<S: ExperimentSetup>(port: u16, listener: TcpListener, context: Arc<Context<S>>) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    loop {
        tokio::select! {
            () = context.end.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("🔗 New client connected to port {}: {}", port, addr);
                    match context.port_for(addr.ip(), port) {
                        Ok((handle, instrument)) => {
                            let context = Arc::clone(&context);
                            connections.push(tokio::spawn(async move {
                                if let Err(e) = communicate(stream, port, handle, instrument, &context).await {
                                    warn!("Client {} error: {}", addr, e);
                                }
                                info!("🔌 Client {} disconnected from port {}", addr, port);
                            }));
                        }
                        Err(e) => error!("❌ Rejecting {}: {}", addr, e),
                    }
                    connections.retain(|task| !task.is_finished());
                }
                Err(e) => error!("Failed to accept connection on port {}: {}", port, e),
            },
        }
    }
    for task in connections {
        if let Err(e) = task.await {
            error!("Connection task failed: {}", e);
        }
    }
}

async fn communicate<S>(
    stream: TcpStream,
    port: u16,
    handle: PortHandle,
    instrument: SharedInstrument,
    context: &Context<S>,
) -> Result<(), ServerError> {
    let (mut reader, mut writer) = stream.into_split();
    let mut chunk = vec![0u8; context.config.read_chunk_size.max(1)];
    let mut lines = LineAssembler::new(handle.line_ending(), context.config.max_line_length);

    loop {
        tokio::select! {
            () = context.end.wait() => return Ok(()),
            read = reader.read(&mut chunk) => {
                let count = read?;
                if count == 0 {
                    return Ok(());
                }
                for line in lines.feed(&chunk[..count]) {
                    match line {
                        Line::Complete(line) => submit(&handle, port, line).await?,
                        Line::Overflow { length } => {
                            let error = ScpiError::MessageTooLarge { length, limit: lines.limit() };
                            warn!("⚠️ Port {}: {}, discarding line", port, error);
                            lock(&instrument).log_error(&error);
                        }
                    }
                }
            }
            response = handle.next_response() => match response {
                Some(bytes) => writer.write_all(&bytes).await?,
                None => return Err(ServerError::QueueClosed { port }),
            },
        }
    }
}

// Pushes one line, waiting for room when the instrument falls behind.
async fn submit(handle: &PortHandle, port: u16, line: Vec<u8>) -> Result<(), ServerError> {
    match handle.try_submit(line) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(line)) => {
            warn!("⏳ Input queue full on port {}, waiting", port);
            handle
                .submit(line)
                .await
                .map_err(|_| ServerError::QueueClosed { port })
        }
        Err(TrySendError::Closed(_)) => Err(ServerError::QueueClosed { port }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Complete(Vec<u8>),
    /// A line grew past the limit after `length` bytes. Nothing of it is
    /// passed on, including whatever arrives before its line ending.
    Overflow { length: usize },
}

/// Reassembles lines from socket reads for one connection.
pub struct LineAssembler {
    pending: Vec<u8>,
    ending: Vec<u8>,
    limit: usize,
    discarding: bool,
}

impl LineAssembler {
    pub fn new(ending: &[u8], limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            ending: ending.to_vec(),
            limit,
            discarding: false,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_discarding(&self) -> bool {
        self.discarding
    }

    /// Appends `bytes` and returns the lines they completed.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Line> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        for line in split_lines(&mut self.pending, &self.ending) {
            if self.discarding {
                // Rest of an overflowed line
                self.discarding = false;
            } else if line.len() > self.limit {
                lines.push(Line::Overflow { length: line.len() });
            } else {
                lines.push(Line::Complete(line));
            }
        }

        if self.pending.len() > self.limit {
            if !self.discarding {
                lines.push(Line::Overflow {
                    length: self.pending.len(),
                });
                self.discarding = true;
            }
            // Keep a possible partial line ending.
            let keep = self.ending.len().saturating_sub(1).min(self.pending.len());
            self.pending.drain(..self.pending.len() - keep);
        }
        lines
    }
}

/// Removes every complete line from `buffer`, leaving the unterminated tail.
pub fn split_lines(buffer: &mut Vec<u8>, ending: &[u8]) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    if ending.is_empty() {
        return lines;
    }
    let mut start = 0;
    while let Some(offset) = buffer[start..]
        .windows(ending.len())
        .position(|window| window == ending)
    {
        lines.push(buffer[start..start + offset].to_vec());
        start += offset + ending.len();
    }
    buffer.drain(..start);
    if !lines.is_empty() {
        debug!("{} complete lines, {} bytes pending", lines.len(), buffer.len());
    }
    lines
}
