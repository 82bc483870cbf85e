//! Scripted [`TransportFactory`] for exercising the forwarding state machines without real
//! sockets. Every stream/datagram it hands out shares its state with this factory through an
//! `Arc<Mutex<_>>` keyed by fd (rather than `Rc<RefCell<_>>`, since the transport traits require
//! `Send`), so a test can keep poking a connection after the engine has moved the transport into
//! the connection table.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use crate::callbacks::Callbacks;
use crate::connection::ConnId;
use crate::transport::{DatagramTransport, StreamTransport, TransportFactory};
use crate::tuple::FiveTuple;

static NEXT_FD: AtomicI32 = AtomicI32::new(100);

fn next_fd() -> RawFd {
    NEXT_FD.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Copy)]
enum ConnectOutcome {
    Synchronous,
    Async(Option<io::ErrorKind>),
}

struct StreamState {
    fd: RawFd,
    read_buf: VecDeque<u8>,
    eof: bool,
    err: Option<io::ErrorKind>,
    written: Vec<u8>,
}

/// Stands in for a connected (or connecting) TCP socket.
pub struct MockStream {
    state: Arc<Mutex<StreamState>>,
    outcome: ConnectOutcome,
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if let Some(kind) = state.err.take() {
            return Err(io::Error::from(kind));
        }
        if state.read_buf.is_empty() {
            return if state.eof { Ok(0) } else { Err(io::Error::from(io::ErrorKind::WouldBlock)) };
        }
        let n = state.read_buf.len().min(buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.read_buf.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().unwrap().written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StreamTransport for MockStream {
    fn connect(&mut self, _addr: SocketAddrV4) -> io::Result<bool> {
        match self.outcome {
            ConnectOutcome::Synchronous => Ok(true),
            ConnectOutcome::Async(_) => Ok(false),
        }
    }

    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        match self.outcome {
            ConnectOutcome::Async(Some(kind)) => Ok(Some(io::Error::from(kind))),
            _ => Ok(None),
        }
    }

    fn shutdown(&mut self) {}

    fn raw_fd(&self) -> RawFd {
        self.state.lock().unwrap().fd
    }
}

struct DatagramState {
    fd: RawFd,
    inbox: VecDeque<(Vec<u8>, SocketAddrV4)>,
    sent: Vec<(Vec<u8>, SocketAddrV4)>,
}

pub struct MockDatagram {
    state: Arc<Mutex<DatagramState>>,
}

impl DatagramTransport for MockDatagram {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddrV4) -> io::Result<usize> {
        self.state.lock().unwrap().sent.push((buf.to_vec(), addr));
        Ok(buf.len())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
        let mut state = self.state.lock().unwrap();
        match state.inbox.pop_front() {
            Some((data, addr)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, addr))
            }
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.state.lock().unwrap().fd
    }
}

/// Scripted [`TransportFactory`]. `script_connect` queues the outcome for the *next*
/// `new_stream` call; tests that don't care about connect behavior can skip it and get a
/// synchronous success by default.
pub struct MockTransportFactory {
    outcomes: Mutex<VecDeque<ConnectOutcome>>,
    streams: Mutex<HashMap<RawFd, Arc<Mutex<StreamState>>>>,
    datagrams: Mutex<HashMap<RawFd, Arc<Mutex<DatagramState>>>>,
    icmp: MockDatagram,
}

impl MockTransportFactory {
    pub fn new() -> MockTransportFactory {
        let icmp_state = Arc::new(Mutex::new(DatagramState { fd: next_fd(), inbox: VecDeque::new(), sent: Vec::new() }));
        MockTransportFactory {
            outcomes: Mutex::new(VecDeque::new()),
            streams: Mutex::new(HashMap::new()),
            datagrams: Mutex::new(HashMap::new()),
            icmp: MockDatagram { state: icmp_state },
        }
    }

    /// Queues how the next `new_stream`'s connect should behave. `synchronous = true` makes
    /// `connect` return `Ok(true)` immediately; `synchronous = false` makes it return `Ok(false)`
    /// and defers the outcome to the following `take_error` call, as driven by
    /// `error_after_writable` (`Some(None)` succeeds, `Some(Some(kind))` fails with `kind`).
    pub fn script_connect(&self, synchronous: bool, error_after_writable: Option<Option<io::ErrorKind>>) {
        let outcome = if synchronous {
            ConnectOutcome::Synchronous
        } else {
            ConnectOutcome::Async(error_after_writable.flatten())
        };
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    /// Appends bytes to `fd`'s read buffer, as if they had just arrived from the "server".
    pub fn feed_server_bytes(&self, fd: RawFd, data: &[u8]) {
        if let Some(state) = self.streams.lock().unwrap().get(&fd) {
            state.lock().unwrap().read_buf.extend(data.iter().copied());
        }
    }

    /// Marks `fd` as EOF once its queued bytes (if any) are drained.
    pub fn close_server_side(&self, fd: RawFd) {
        if let Some(state) = self.streams.lock().unwrap().get(&fd) {
            state.lock().unwrap().eof = true;
        }
    }

    /// Returns everything written to `fd` by the engine so far.
    pub fn written_to(&self, fd: RawFd) -> Vec<u8> {
        self.streams.lock().unwrap().get(&fd).map(|s| s.lock().unwrap().written.clone()).unwrap_or_default()
    }

    /// Queues a datagram for the next matching `recv_from` on `fd` (the per-connection UDP
    /// socket, or the shared ICMP socket's fd).
    pub fn feed_datagram(&self, fd: RawFd, data: &[u8], from: SocketAddrV4) {
        if fd == self.icmp.state.lock().unwrap().fd {
            self.icmp.state.lock().unwrap().inbox.push_back((data.to_vec(), from));
            return;
        }
        if let Some(state) = self.datagrams.lock().unwrap().get(&fd) {
            state.lock().unwrap().inbox.push_back((data.to_vec(), from));
        }
    }

    pub fn sent_datagrams(&self, fd: RawFd) -> Vec<(Vec<u8>, SocketAddrV4)> {
        if fd == self.icmp.state.lock().unwrap().fd {
            return self.icmp.state.lock().unwrap().sent.clone();
        }
        self.datagrams.lock().unwrap().get(&fd).map(|s| s.lock().unwrap().sent.clone()).unwrap_or_default()
    }

    pub fn icmp_fd(&self) -> RawFd {
        self.icmp.state.lock().unwrap().fd
    }
}

impl Default for MockTransportFactory {
    fn default() -> MockTransportFactory {
        MockTransportFactory::new()
    }
}

impl TransportFactory for MockTransportFactory {
    fn new_stream(&self) -> io::Result<Box<dyn StreamTransport>> {
        let fd = next_fd();
        let outcome = self.outcomes.lock().unwrap().pop_front().unwrap_or(ConnectOutcome::Synchronous);
        let state = Arc::new(Mutex::new(StreamState { fd, read_buf: VecDeque::new(), eof: false, err: None, written: Vec::new() }));
        self.streams.lock().unwrap().insert(fd, state.clone());
        Ok(Box::new(MockStream { state, outcome }))
    }

    fn new_datagram(&self) -> io::Result<Box<dyn DatagramTransport>> {
        let fd = next_fd();
        let state = Arc::new(Mutex::new(DatagramState { fd, inbox: VecDeque::new(), sent: Vec::new() }));
        self.datagrams.lock().unwrap().insert(fd, state.clone());
        Ok(Box::new(MockDatagram { state }))
    }

    fn icmp_socket(&self) -> &dyn DatagramTransport {
        &self.icmp
    }

    fn icmp_socket_mut(&mut self) -> &mut dyn DatagramTransport {
        &mut self.icmp
    }
}

/// Records every callback invocation so tests can assert on them directly.
#[derive(Default)]
pub struct MockCallbacks {
    pub sent: Vec<Vec<u8>>,
    pub opened_socks: Vec<RawFd>,
    pub closed_socks: Vec<RawFd>,
    pub opened_conns: Vec<FiveTuple>,
    pub closed_conns: Vec<ConnId>,
    pub refuse_new: bool,
}

impl Callbacks for MockCallbacks {
    fn send_client(&mut self, buf: &[u8], _conn: ConnId) -> bool {
        self.sent.push(buf.to_vec());
        true
    }

    fn on_socket_open(&mut self, fd: RawFd) {
        self.opened_socks.push(fd);
    }

    fn on_socket_close(&mut self, fd: RawFd) {
        self.closed_socks.push(fd);
    }

    fn on_connection_open(&mut self, tuple: &FiveTuple) -> bool {
        self.opened_conns.push(*tuple);
        !self.refuse_new
    }

    fn on_connection_close(&mut self, conn: ConnId) {
        self.closed_conns.push(conn);
    }
}
