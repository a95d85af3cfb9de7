//! Connections, read filter chains and listeners.
//!
//! ## Architecture
//!
//! ```text
//! Listener --accept--> Connection task ----events----> ConnectionCallbacks
//!                         |    ^                          + ReadFilter::on_event
//!                   on_data|    |commands (ConnectionHandle)
//!                         v    |
//!                     FilterManager -> ReadFilter, ReadFilter, ...
//! ```
//!
//! Every connection runs on its own task and owns its socket, buffers and
//! filters. Other tasks only talk to it through a [`ConnectionHandle`], so no
//! per-connection state is shared.

mod buffer;
mod connection;
mod filter;
mod listener;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

pub use buffer::{Watermark, WriteBuffer};
pub use connection::{
    CloseType, Connection, ConnectionCallbacks, ConnectionConfig, ConnectionHandle,
    DEFAULT_READ_BUFFER_LIMIT, READ_CHUNK_SIZE,
};
pub use filter::{FilterManager, FilterStatus, ReadFilter, ReadFilterCallbacks};
pub use listener::{DrainGuard, Listener, ListenerStats, NetworkFilterFactory};

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next identifier.
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Events a connection raises to its callbacks and read filters.
///
/// `Connected` is always first. A close event is always last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Socket established (accepted or dialed).
    Connected,
    /// Closed by this side (`close`, shutdown, flush timeout, read patience).
    LocalClose,
    /// Closed by the peer or by a transport error.
    ///
    /// A read EOF counts as a full close: pending writes are discarded, so a
    /// peer that half-closes its send side gets no further response.
    RemoteClose,
    /// Upstream dial failed.
    ConnectFailed,
    /// Upstream dial did not finish within the connect timeout.
    ConnectTimeout,
    /// Write buffer occupancy went above the high watermark.
    AboveWriteBufferHighWatermark,
    /// Write buffer occupancy fell to the low watermark after being above high.
    BelowWriteBufferLowWatermark,
}

impl ConnectionEvent {
    /// Whether this event terminates the connection.
    pub fn is_close(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::LocalClose
                | ConnectionEvent::RemoteClose
                | ConnectionEvent::ConnectFailed
                | ConnectionEvent::ConnectTimeout
        )
    }
}

/// Resolves once the shutdown signal is raised.
///
/// If every sender is gone the signal can never fire, so this pends forever.
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
