//! Read filter chain.
//!
//! Filters run in registration order for two events: "new connection" and
//! "data received". A filter answers [`FilterStatus::Continue`] to pass the
//! event on, or [`FilterStatus::StopIteration`] to end it there.
//!
//! A StopIteration from `on_new_connection` halts the whole chain: received
//! data stays buffered on the connection until a filter calls
//! [`ReadFilterCallbacks::continue_reading`]. Resuming initializes the
//! remaining filters and then dispatches the buffered data from the first
//! filter.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::sync::watch;

use super::connection::ConnectionHandle;
use super::listener::DrainGuard;
use super::ConnectionEvent;

/// Result of a filter invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    /// Pass the event to the next filter.
    Continue,
    /// Stop dispatching this event.
    StopIteration,
}

/// Capabilities handed to a filter when it is registered on a connection.
#[derive(Debug, Clone)]
pub struct ReadFilterCallbacks {
    connection: ConnectionHandle,
    shutdown: watch::Receiver<bool>,
    drain_guard: Option<DrainGuard>,
}

impl ReadFilterCallbacks {
    pub(crate) fn new(
        connection: ConnectionHandle,
        shutdown: watch::Receiver<bool>,
        drain_guard: Option<DrainGuard>,
    ) -> Self {
        Self {
            connection,
            shutdown,
            drain_guard,
        }
    }

    /// The connection owning this filter.
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Resume a chain halted by StopIteration. Safe to call from any task.
    pub fn continue_reading(&self) {
        self.connection.continue_reading();
    }

    /// Shutdown signal of the owning connection, for tasks the filter starts.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    /// Listener slot of the owning connection, for tasks the filter starts.
    /// `None` when the connection was not accepted by a [`super::Listener`].
    pub fn drain_guard(&self) -> Option<DrainGuard> {
        self.drain_guard.clone()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.connection.local_addr()
    }
}

/// A handler in a connection's read path.
///
/// One instance serves exactly one connection and is only ever called from
/// that connection's task.
pub trait ReadFilter: Send {
    /// Called once when the filter is added to a connection.
    fn initialize_read_filter_callbacks(&mut self, _callbacks: ReadFilterCallbacks) {}

    /// Called once, before any data, when the connection is established.
    fn on_new_connection(&mut self) -> FilterStatus {
        FilterStatus::Continue
    }

    /// Called with the connection's unread input. Consumed bytes must be
    /// removed from `data`; whatever is left stays buffered.
    fn on_data(&mut self, data: &mut BytesMut, end_stream: bool) -> FilterStatus;

    /// Called when a chain halted by StopIteration resumes, before buffered
    /// data is dispatched. Only filters that already saw "new connection"
    /// are called.
    fn on_continue(&mut self) {}

    /// Called for every event the owning connection raises, after its
    /// connection callbacks.
    fn on_event(&mut self, _event: ConnectionEvent) {}
}

struct ActiveReadFilter {
    filter: Box<dyn ReadFilter>,
    initialized: bool,
}

/// Ordered read filters of one connection.
#[derive(Default)]
pub struct FilterManager {
    filters: Vec<ActiveReadFilter>,
    halted: bool,
}

impl FilterManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter. It is initialized on the next dispatch.
    pub fn add_read_filter(&mut self, filter: Box<dyn ReadFilter>) {
        self.filters.push(ActiveReadFilter {
            filter,
            initialized: false,
        });
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Whether a filter stopped the "new connection" event and has not resumed.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Dispatch "new connection" to every filter not yet initialized.
    pub fn on_new_connection(&mut self) -> FilterStatus {
        if self.halted {
            return FilterStatus::StopIteration;
        }
        for active in self.filters.iter_mut().filter(|active| !active.initialized) {
            active.initialized = true;
            if active.filter.on_new_connection() == FilterStatus::StopIteration {
                self.halted = true;
                return FilterStatus::StopIteration;
            }
        }
        FilterStatus::Continue
    }

    /// Dispatch received data. Withheld while the chain is halted.
    pub fn on_read(&mut self, buffer: &mut BytesMut, end_stream: bool) {
        if self.on_new_connection() == FilterStatus::StopIteration {
            return;
        }
        if buffer.is_empty() && !end_stream {
            return;
        }
        for active in &mut self.filters {
            if active.filter.on_data(buffer, end_stream) == FilterStatus::StopIteration {
                return;
            }
        }
    }

    /// Resume the chain and dispatch whatever is buffered.
    pub fn continue_reading(&mut self, buffer: &mut BytesMut, end_stream: bool) {
        if self.halted {
            self.halted = false;
            for active in self.filters.iter_mut().filter(|active| active.initialized) {
                active.filter.on_continue();
            }
        }
        self.on_read(buffer, end_stream);
    }

    /// Forward a connection event to every filter.
    pub fn on_event(&mut self, event: ConnectionEvent) {
        for active in &mut self.filters {
            active.filter.on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records calls; consumes data when `consume` is set.
    struct Recorder {
        name: &'static str,
        log: Log,
        on_new: FilterStatus,
        on_data: FilterStatus,
        consume: bool,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Log) -> Self {
            Self {
                name,
                log: Arc::clone(log),
                on_new: FilterStatus::Continue,
                on_data: FilterStatus::Continue,
                consume: false,
            }
        }
    }

    impl ReadFilter for Recorder {
        fn on_new_connection(&mut self) -> FilterStatus {
            self.log.lock().unwrap().push(format!("{}:new", self.name));
            self.on_new
        }

        fn on_data(&mut self, data: &mut BytesMut, end_stream: bool) -> FilterStatus {
            self.log.lock().unwrap().push(format!(
                "{}:data:{}:{}",
                self.name,
                String::from_utf8_lossy(data),
                end_stream
            ));
            if self.consume {
                data.clear();
            }
            self.on_data
        }

        fn on_event(&mut self, event: ConnectionEvent) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:event:{:?}", self.name, event));
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let log = Log::default();
        let mut manager = FilterManager::new();
        manager.add_read_filter(Box::new(Recorder::new("a", &log)));
        manager.add_read_filter(Box::new(Recorder::new("b", &log)));

        assert_eq!(manager.on_new_connection(), FilterStatus::Continue);
        let mut buffer = BytesMut::from(&b"hi"[..]);
        manager.on_read(&mut buffer, false);

        assert_eq!(
            entries(&log),
            vec!["a:new", "b:new", "a:data:hi:false", "b:data:hi:false"]
        );
    }

    #[test]
    fn test_new_connection_runs_once() {
        let log = Log::default();
        let mut manager = FilterManager::new();
        manager.add_read_filter(Box::new(Recorder::new("a", &log)));

        manager.on_new_connection();
        manager.on_new_connection();
        let mut buffer = BytesMut::from(&b"x"[..]);
        manager.on_read(&mut buffer, false);

        assert_eq!(entries(&log), vec!["a:new", "a:data:x:false"]);
    }

    #[test]
    fn test_stop_on_data_only_halts_that_event() {
        let log = Log::default();
        let mut manager = FilterManager::new();
        let mut first = Recorder::new("a", &log);
        first.on_data = FilterStatus::StopIteration;
        first.consume = true;
        manager.add_read_filter(Box::new(first));
        manager.add_read_filter(Box::new(Recorder::new("b", &log)));
        manager.on_new_connection();

        let mut buffer = BytesMut::from(&b"one"[..]);
        manager.on_read(&mut buffer, false);
        buffer.extend_from_slice(b"two");
        manager.on_read(&mut buffer, false);

        assert_eq!(
            entries(&log),
            vec!["a:new", "b:new", "a:data:one:false", "a:data:two:false"]
        );
        assert!(!manager.is_halted());
    }

    #[test]
    fn test_stop_on_new_connection_withholds_data_until_continue() {
        let log = Log::default();
        let mut manager = FilterManager::new();
        let mut first = Recorder::new("a", &log);
        first.on_new = FilterStatus::StopIteration;
        manager.add_read_filter(Box::new(first));
        let mut second = Recorder::new("b", &log);
        second.consume = true;
        manager.add_read_filter(Box::new(second));

        assert_eq!(manager.on_new_connection(), FilterStatus::StopIteration);
        assert!(manager.is_halted());

        let mut buffer = BytesMut::from(&b"held"[..]);
        manager.on_read(&mut buffer, false);
        buffer.extend_from_slice(b"-more");
        manager.on_read(&mut buffer, false);
        assert_eq!(entries(&log), vec!["a:new"]);
        assert_eq!(&buffer[..], b"held-more");

        manager.continue_reading(&mut buffer, false);
        assert_eq!(
            entries(&log),
            vec![
                "a:new",
                "b:new",
                "a:data:held-more:false",
                "b:data:held-more:false"
            ]
        );
        assert!(buffer.is_empty());
        assert!(!manager.is_halted());
    }

    /// Halts the chain and counts resumes.
    struct Resumable(Arc<Mutex<u32>>);

    impl ReadFilter for Resumable {
        fn on_new_connection(&mut self) -> FilterStatus {
            FilterStatus::StopIteration
        }

        fn on_data(&mut self, _data: &mut BytesMut, _end_stream: bool) -> FilterStatus {
            FilterStatus::Continue
        }

        fn on_continue(&mut self) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn test_continue_notifies_only_when_halted() {
        let resumes = Arc::new(Mutex::new(0));
        let log = Log::default();
        let mut manager = FilterManager::new();
        manager.add_read_filter(Box::new(Resumable(Arc::clone(&resumes))));
        manager.add_read_filter(Box::new(Recorder::new("b", &log)));

        assert_eq!(manager.on_new_connection(), FilterStatus::StopIteration);
        let mut buffer = BytesMut::new();
        manager.continue_reading(&mut buffer, false);
        assert_eq!(*resumes.lock().unwrap(), 1);
        assert_eq!(entries(&log), vec!["b:new"]);

        // Not halted any more: nothing to resume.
        manager.continue_reading(&mut buffer, false);
        assert_eq!(*resumes.lock().unwrap(), 1);
    }

    #[test]
    fn test_continue_redispatches_unconsumed_data() {
        let log = Log::default();
        let mut manager = FilterManager::new();
        let mut first = Recorder::new("a", &log);
        first.on_data = FilterStatus::StopIteration;
        manager.add_read_filter(Box::new(first));
        manager.on_new_connection();

        let mut buffer = BytesMut::from(&b"keep"[..]);
        manager.on_read(&mut buffer, false);
        manager.continue_reading(&mut buffer, false);

        assert_eq!(
            entries(&log),
            vec!["a:new", "a:data:keep:false", "a:data:keep:false"]
        );
    }

    #[test]
    fn test_empty_buffer_not_dispatched_unless_end_stream() {
        let log = Log::default();
        let mut manager = FilterManager::new();
        manager.add_read_filter(Box::new(Recorder::new("a", &log)));
        manager.on_new_connection();

        let mut buffer = BytesMut::new();
        manager.on_read(&mut buffer, false);
        manager.on_read(&mut buffer, true);

        assert_eq!(entries(&log), vec!["a:new", "a:data::true"]);
    }

    #[test]
    fn test_filter_added_later_is_initialized_on_next_dispatch() {
        let log = Log::default();
        let mut manager = FilterManager::new();
        manager.add_read_filter(Box::new(Recorder::new("a", &log)));
        manager.on_new_connection();

        manager.add_read_filter(Box::new(Recorder::new("b", &log)));
        let mut buffer = BytesMut::from(&b"z"[..]);
        manager.on_read(&mut buffer, false);

        assert_eq!(
            entries(&log),
            vec!["a:new", "b:new", "a:data:z:false", "b:data:z:false"]
        );
    }

    #[test]
    fn test_events_reach_every_filter() {
        let log = Log::default();
        let mut manager = FilterManager::new();
        manager.add_read_filter(Box::new(Recorder::new("a", &log)));
        manager.add_read_filter(Box::new(Recorder::new("b", &log)));

        manager.on_event(ConnectionEvent::AboveWriteBufferHighWatermark);

        assert_eq!(
            entries(&log),
            vec![
                "a:event:AboveWriteBufferHighWatermark",
                "b:event:AboveWriteBufferHighWatermark"
            ]
        );
        assert_eq!(manager.len(), 2);
    }
}
