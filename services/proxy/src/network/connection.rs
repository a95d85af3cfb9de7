//! Connection task with watermark flow control and lifecycle events.
//!
//! A [`Connection`] is built (accepted or client), given its read filters and
//! callbacks, and then moved onto its own task with [`Connection::run`]. From
//! then on it is driven by three sources: its socket, commands sent through
//! [`ConnectionHandle`], and the shutdown signal.
//!
//! Events are raised on the connection's own task, first to the registered
//! [`ConnectionCallbacks`] and then to the read filters.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use super::buffer::{Watermark, WriteBuffer};
use super::filter::{FilterManager, ReadFilter, ReadFilterCallbacks};
use super::listener::DrainGuard;
use super::{shutdown_signalled, ConnectionEvent, ConnectionId};
use crate::config::{
    ClusterConfig, ListenerConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_FLUSH_TIMEOUT,
    DEFAULT_READ_TIMEOUT,
};
use crate::error::{ProxyError, Result};

/// Bytes reserved for each socket read.
pub const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Cap on unread input when the connection has no buffer limit.
pub const DEFAULT_READ_BUFFER_LIMIT: usize = 1024 * 1024;

/// How to close a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseType {
    /// Write out buffered data first (bounded by the flush timeout).
    FlushWrite,
    /// Discard buffered data and close now.
    NoFlush,
}

/// Observer of a connection's lifecycle and watermark events.
pub trait ConnectionCallbacks: Send {
    fn on_event(&mut self, event: ConnectionEvent);
}

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Write buffer limit; high watermark = limit, low = limit / 2. 0 disables.
    pub buffer_limit: u32,
    /// Deadline for a single read attempt.
    pub read_timeout: Duration,
    /// Consecutive elapsed read deadlines tolerated before closing.
    /// `None` never closes on read timeouts.
    pub max_read_timeouts: Option<u32>,
    /// Dial timeout for client connections.
    pub connect_timeout: Duration,
    /// Bound on a flush-then-close.
    pub flush_timeout: Duration,
}

impl ConnectionConfig {
    pub fn with_buffer_limit(buffer_limit: u32) -> Self {
        Self {
            buffer_limit,
            ..Self::default()
        }
    }

    /// Settings for a connection accepted by a listener.
    pub fn for_listener(listener: &ListenerConfig) -> Self {
        Self {
            buffer_limit: listener.conn_buffer_limit_bytes,
            max_read_timeouts: listener.max_read_timeouts,
            ..Self::default()
        }
    }

    /// Settings for a connection dialed to one of a cluster's hosts.
    pub fn for_cluster(cluster: &ClusterConfig) -> Self {
        Self {
            buffer_limit: cluster.conn_buffer_limit_bytes,
            connect_timeout: cluster.connect_timeout(),
            max_read_timeouts: cluster.max_read_timeouts,
            ..Self::default()
        }
    }

    /// Unread input at which reading pauses.
    pub fn read_buffer_limit(&self) -> usize {
        match self.buffer_limit {
            0 => DEFAULT_READ_BUFFER_LIMIT,
            limit => limit as usize,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_limit: crate::config::DEFAULT_CONN_BUFFER_LIMIT_BYTES,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_read_timeouts: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

enum Command {
    Write(Bytes),
    Close(CloseType),
    SetReadDisabled(bool),
    ContinueReading,
    AddReadFilter(Box<dyn ReadFilter>),
    AddCallbacks(Box<dyn ConnectionCallbacks>),
}

/// Cloneable handle used by other tasks to drive a connection.
///
/// Every operation is a non-blocking enqueue. Once the connection is closed
/// and released, operations are no-ops.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    remote_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    tx: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Local address, known up front for accepted connections only.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Queue bytes for transmission.
    pub fn write(&self, data: Bytes) -> Result<()> {
        self.send(Command::Write(data))
    }

    /// Close the connection. Closing twice is a no-op.
    pub fn close(&self, close_type: CloseType) {
        let _ = self.send(Command::Close(close_type));
    }

    /// Pause or resume reading from the socket.
    pub fn set_read_disabled(&self, disabled: bool) {
        let _ = self.send(Command::SetReadDisabled(disabled));
    }

    /// Resume a read filter chain halted by StopIteration.
    pub fn continue_reading(&self) {
        let _ = self.send(Command::ContinueReading);
    }

    /// Append a read filter to the running connection.
    pub fn add_read_filter(&self, filter: Box<dyn ReadFilter>) -> Result<()> {
        self.send(Command::AddReadFilter(filter))
    }

    /// Register an observer on the running connection.
    pub fn add_connection_callbacks(&self, callbacks: Box<dyn ConnectionCallbacks>) -> Result<()> {
        self.send(Command::AddCallbacks(callbacks))
    }

    /// Whether the connection has closed and released its resources.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| ProxyError::ConnectionClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closing { deadline: Instant },
    Closed,
}

/// One network connection and everything attached to it.
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    stream: Option<TcpStream>,
    config: ConnectionConfig,
    handle: ConnectionHandle,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
    filter_manager: FilterManager,
    callbacks: Vec<Box<dyn ConnectionCallbacks>>,
    read_buffer: BytesMut,
    write_buffer: WriteBuffer,
    read_disabled: bool,
    read_eof: bool,
    read_timeouts: u32,
    connected: bool,
    state: State,
    drain_guard: Option<DrainGuard>,
}

impl Connection {
    /// Wrap a socket accepted by a listener.
    pub fn accepted(
        stream: TcpStream,
        remote_addr: SocketAddr,
        config: ConnectionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let local_addr = stream.local_addr().ok();
        Self::new(remote_addr, local_addr, Some(stream), config, shutdown)
    }

    /// Prepare a connection that dials `remote_addr` when run.
    ///
    /// Writes issued before the dial completes are sent once connected.
    pub fn client(
        remote_addr: SocketAddr,
        config: ConnectionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self::new(remote_addr, None, None, config, shutdown)
    }

    fn new(
        remote_addr: SocketAddr,
        local_addr: Option<SocketAddr>,
        stream: Option<TcpStream>,
        config: ConnectionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let id = ConnectionId::next();
        let (tx, commands) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            id,
            remote_addr,
            local_addr,
            tx,
        };

        Self {
            id,
            remote_addr,
            local_addr,
            stream,
            write_buffer: WriteBuffer::with_limit(config.buffer_limit as usize),
            config,
            handle,
            commands,
            shutdown,
            filter_manager: FilterManager::new(),
            callbacks: Vec::new(),
            read_buffer: BytesMut::new(),
            read_disabled: false,
            read_eof: false,
            read_timeouts: 0,
            connected: false,
            state: State::Open,
            drain_guard: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Local address; for client connections, known once the dial completes.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Hold `guard` until this connection finishes. Filters added afterwards
    /// can pass it on to tasks they start.
    pub fn set_drain_guard(&mut self, guard: DrainGuard) {
        self.drain_guard = Some(guard);
    }

    /// Append a read filter, handing it its callbacks.
    pub fn add_read_filter(&mut self, mut filter: Box<dyn ReadFilter>) {
        filter.initialize_read_filter_callbacks(ReadFilterCallbacks::new(
            self.handle.clone(),
            self.shutdown.clone(),
            self.drain_guard.clone(),
        ));
        self.filter_manager.add_read_filter(filter);
    }

    /// Register an observer for lifecycle and watermark events.
    pub fn add_connection_callbacks(&mut self, callbacks: Box<dyn ConnectionCallbacks>) {
        self.callbacks.push(callbacks);
    }

    /// Drive the connection until it closes.
    pub async fn run(mut self) {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => match self.dial().await {
                Some(stream) => stream,
                None => return,
            },
        };

        if self.local_addr.is_none() {
            self.local_addr = stream.local_addr().ok();
        }
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        self.connected = true;
        self.raise_event(ConnectionEvent::Connected);
        self.filter_manager.on_new_connection();

        let mut shutdown = self.shutdown.clone();
        let mut shutdown_seen = false;

        while self.state != State::Closed {
            let can_read = self.can_read();
            if can_read {
                self.read_buffer.reserve(READ_CHUNK_SIZE);
            }
            let can_write = !self.write_buffer.is_empty();
            let (closing, flush_deadline) = match self.state {
                State::Closing { deadline } => (true, deadline),
                _ => (false, Instant::now()),
            };
            let read_timeout = self.config.read_timeout;

            tokio::select! {
                biased;

                _ = shutdown_signalled(&mut shutdown), if !shutdown_seen => {
                    shutdown_seen = true;
                    debug!(connection_id = %self.id, "Shutdown signalled, closing connection");
                    self.close(CloseType::FlushWrite);
                }

                Some(command) = self.commands.recv() => {
                    self.handle_command(command);
                }

                result = writer.write_buf(self.write_buffer.bytes_mut()), if can_write => {
                    self.on_write_result(result);
                }

                result = timeout(read_timeout, reader.read_buf(&mut self.read_buffer)), if can_read => {
                    match result {
                        Ok(read) => self.on_read_result(read),
                        Err(_) => self.on_read_timeout(),
                    }
                }

                _ = tokio::time::sleep_until(flush_deadline), if closing => {
                    debug!(
                        connection_id = %self.id,
                        pending_bytes = self.write_buffer.len(),
                        "Flush timeout, closing connection"
                    );
                    self.close_now(ConnectionEvent::LocalClose);
                }
            }
        }

        let _ = writer.shutdown().await;
    }

    async fn dial(&mut self) -> Option<TcpStream> {
        debug!(
            connection_id = %self.id,
            remote_addr = %self.remote_addr,
            "Connecting to upstream"
        );

        let mut shutdown = self.shutdown.clone();
        let connect = timeout(self.config.connect_timeout, TcpStream::connect(self.remote_addr));

        tokio::select! {
            result = connect => match result {
                Ok(Ok(stream)) => Some(stream),
                Ok(Err(e)) => {
                    debug!(
                        connection_id = %self.id,
                        remote_addr = %self.remote_addr,
                        error = %e,
                        "Upstream connect failed"
                    );
                    self.close_now(ConnectionEvent::ConnectFailed);
                    None
                }
                Err(_) => {
                    debug!(
                        connection_id = %self.id,
                        remote_addr = %self.remote_addr,
                        "Upstream connect timeout"
                    );
                    self.close_now(ConnectionEvent::ConnectTimeout);
                    None
                }
            },
            _ = shutdown_signalled(&mut shutdown) => {
                self.close_now(ConnectionEvent::LocalClose);
                None
            }
        }
    }

    fn can_read(&self) -> bool {
        self.state == State::Open
            && !self.read_disabled
            && !self.read_eof
            && self.read_buffer.len() < self.config.read_buffer_limit()
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Write(data) => self.write(&data),
            Command::Close(close_type) => self.close(close_type),
            Command::SetReadDisabled(disabled) => {
                if self.read_disabled != disabled {
                    trace!(connection_id = %self.id, disabled, "Read disabled changed");
                }
                self.read_disabled = disabled;
            }
            Command::ContinueReading => self.continue_reading(),
            Command::AddReadFilter(filter) => {
                self.add_read_filter(filter);
                if self.connected {
                    self.filter_manager.on_new_connection();
                }
            }
            Command::AddCallbacks(callbacks) => self.add_connection_callbacks(callbacks),
        }
    }

    fn write(&mut self, data: &[u8]) {
        if self.state != State::Open {
            trace!(
                connection_id = %self.id,
                bytes = data.len(),
                "Dropping write on closing connection"
            );
            return;
        }
        if let Some(Watermark::AboveHigh) = self.write_buffer.append(data) {
            self.raise_event(ConnectionEvent::AboveWriteBufferHighWatermark);
        }
    }

    fn on_write_result(&mut self, result: io::Result<usize>) {
        match result {
            Ok(_) => {
                if let Some(Watermark::BelowLow) = self.write_buffer.check_low_watermark() {
                    self.raise_event(ConnectionEvent::BelowWriteBufferLowWatermark);
                }
                if matches!(self.state, State::Closing { .. }) && self.write_buffer.is_empty() {
                    self.close_now(ConnectionEvent::LocalClose);
                }
            }
            Err(e) => {
                debug!(connection_id = %self.id, error = %e, "Write error");
                self.close_now(ConnectionEvent::RemoteClose);
            }
        }
    }

    fn on_read_result(&mut self, result: io::Result<usize>) {
        match result {
            Ok(0) => {
                self.read_eof = true;
                if self.filter_manager.is_halted() {
                    // Close once the chain resumes so buffered input is not lost.
                    trace!(connection_id = %self.id, "EOF while filter chain halted");
                    return;
                }
                self.filter_manager.on_read(&mut self.read_buffer, true);
                self.close_now(ConnectionEvent::RemoteClose);
            }
            Ok(n) => {
                trace!(connection_id = %self.id, bytes = n, "Read");
                self.read_timeouts = 0;
                self.filter_manager.on_read(&mut self.read_buffer, false);
            }
            Err(e) => {
                debug!(connection_id = %self.id, error = %e, "Read error");
                self.close_now(ConnectionEvent::RemoteClose);
            }
        }
    }

    fn on_read_timeout(&mut self) {
        self.read_timeouts += 1;
        if let Some(max) = self.config.max_read_timeouts {
            if self.read_timeouts >= max {
                debug!(
                    connection_id = %self.id,
                    read_timeouts = self.read_timeouts,
                    "Read patience exhausted, closing connection"
                );
                self.close_now(ConnectionEvent::LocalClose);
            }
        }
    }

    fn continue_reading(&mut self) {
        if self.state == State::Closed {
            return;
        }
        let end_stream = self.read_eof;
        self.filter_manager
            .continue_reading(&mut self.read_buffer, end_stream);
        if end_stream && !self.filter_manager.is_halted() {
            self.close_now(ConnectionEvent::RemoteClose);
        }
    }

    fn close(&mut self, close_type: CloseType) {
        match (self.state, close_type) {
            (State::Closed, _) => {}
            (State::Closing { .. }, CloseType::FlushWrite) => {}
            (_, CloseType::NoFlush) => self.close_now(ConnectionEvent::LocalClose),
            (State::Open, CloseType::FlushWrite) => {
                if self.write_buffer.is_empty() {
                    self.close_now(ConnectionEvent::LocalClose);
                } else {
                    debug!(
                        connection_id = %self.id,
                        pending_bytes = self.write_buffer.len(),
                        "Flushing before close"
                    );
                    self.state = State::Closing {
                        deadline: Instant::now() + self.config.flush_timeout,
                    };
                }
            }
        }
    }

    fn close_now(&mut self, event: ConnectionEvent) {
        if self.state == State::Closed {
            return;
        }
        self.state = State::Closed;
        self.write_buffer.clear();
        debug!(connection_id = %self.id, event = ?event, "Connection closed");
        self.raise_event(event);
    }

    fn raise_event(&mut self, event: ConnectionEvent) {
        for callbacks in &mut self.callbacks {
            callbacks.on_event(event);
        }
        self.filter_manager.on_event(event);
    }
}
