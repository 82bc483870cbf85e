//! The engine: owns the connection table, the transport factory, the callback table, the
//! scratch reply buffer, and the config (§3 "Engine state"). Its public API is the surface
//! described in §6; the protocol-specific forwarding logic lives in sibling modules
//! (`tcp`, `udp`, `icmp`) as additional `impl` blocks on [`Engine`] so this file stays the
//! table-of-contents rather than growing one state machine per protocol inline.

use std::any::Any;
use std::collections::HashSet;
use std::os::unix::io::RawFd;

use flux::logging::{self, Logger};
use flux::time::timestamp_secs;

use crate::callbacks::Callbacks;
use crate::config::Config;
use crate::connection::{Connection, ConnId, Status};
use crate::error::{ConfigError, EngineResult, ParseError};
use crate::packet::{self, ParsedPacket};
use crate::table::{Stats, Table};
use crate::transport::TransportFactory;
use crate::tuple::FiveTuple;

/// The maximum IPv4 datagram size; the scratch reply buffer is sized to it once at construction
/// (§3 "scratch reply buffer").
pub const MAX_IPV4_DATAGRAM: usize = 65535;

/// What happened to a packet handed to [`Engine::easy_forward`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ForwardOutcome {
    /// The packet was accepted and acted on (possibly emitting a reply, possibly just updating
    /// connection state).
    Forwarded,
    /// The packet was recognized but intentionally dropped: a CONNECTING-state TCP packet
    /// retransmit, a sentinel-socket TCP segment, a refused connection, or a soft-rejected ICMP
    /// message. Not an error (§7 "Unsupported" / §4.D "CONNECTING: silently dropped").
    Dropped,
}

#[derive(Debug)]
pub enum EasyForwardError {
    Parse(ParseError),
    Engine(crate::error::EngineError),
}

impl From<ParseError> for EasyForwardError {
    fn from(err: ParseError) -> Self {
        EasyForwardError::Parse(err)
    }
}

impl From<crate::error::EngineError> for EasyForwardError {
    fn from(err: crate::error::EngineError) -> Self {
        EasyForwardError::Engine(err)
    }
}

pub struct Engine<T: TransportFactory, C: Callbacks> {
    pub(crate) config: Config,
    pub(crate) table: Table,
    pub(crate) transports: T,
    pub(crate) callbacks: C,
    pub(crate) scratch: Vec<u8>,
    pub(crate) log: Logger,
    userdata: Option<Box<dyn Any>>,
}

impl<T: TransportFactory, C: Callbacks> Engine<T, C> {
    pub fn new(config: Config, transports: T, callbacks: C) -> Result<Engine<T, C>, ConfigError> {
        Self::with_logger(config, transports, callbacks, logging::discard())
    }

    pub fn with_logger(config: Config, transports: T, callbacks: C, log: Logger) -> Result<Engine<T, C>, ConfigError> {
        config.validate()?;
        Ok(Engine {
            config,
            table: Table::new(),
            transports,
            callbacks,
            scratch: vec![0u8; MAX_IPV4_DATAGRAM],
            log,
            userdata: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn userdata(&self) -> Option<&dyn Any> {
        self.userdata.as_deref()
    }

    pub fn set_userdata(&mut self, data: Box<dyn Any>) {
        self.userdata = Some(data);
    }

    /// Parses a raw IPv4 buffer without touching any engine state (§4.A).
    pub fn parse<'a>(buf: &'a [u8]) -> Result<ParsedPacket<'a>, ParseError> {
        packet::parse(buf)
    }

    /// Looks up `tuple`; if absent and `create` is true, invokes `on_connection_open` and
    /// inserts a new NEW-status record unless the callback refuses it (§4.C).
    pub fn lookup_or_create(&mut self, tuple: FiveTuple, create: bool) -> Option<ConnId> {
        if let Some(id) = self.table.find(&tuple) {
            return Some(id);
        }
        if !create {
            return None;
        }

        if self.table.num_open_socks() >= self.config.socket_ceiling {
            self.purge(timestamp_secs());
        }

        let callbacks = &mut self.callbacks;
        let now = timestamp_secs();
        let max_window = self.config.max_window;
        let id = self.table.lookup_or_insert(tuple, now, || {
            if callbacks.on_connection_open(&tuple) {
                Some(crate::connection::initial_state(&tuple, max_window))
            } else {
                None
            }
        });

        if id.is_some() {
            logging::debug!(self.log, "connection opened"; "tuple" => %tuple);
        }
        id
    }

    pub fn set_dnat(&mut self, conn: ConnId, addr: std::net::SocketAddrV4) {
        if let Some(conn) = self.table.get_mut(conn) {
            conn.set_dnat(addr);
        }
    }

    pub fn tuple(&self, conn: ConnId) -> Option<FiveTuple> {
        self.table.get(conn).map(|c| c.tuple)
    }

    pub fn connection_userdata(&self, conn: ConnId) -> Option<&dyn Any> {
        self.table.get(conn).and_then(|c| c.userdata.as_deref())
    }

    pub fn set_connection_userdata(&mut self, conn: ConnId, data: Box<dyn Any>) {
        if let Some(conn) = self.table.get_mut(conn) {
            conn.userdata = Some(data);
        }
    }

    /// Parses `buf`, looks up or creates the matching connection, and forwards it in one call
    /// (§6 "easy forward"). Auto-ACKs data segments, matching the common-case variant.
    ///
    /// On a fatal forwarding error the record is destroyed immediately rather than left for the
    /// next purge tick (§3 "`destroy_conn` ... called from the purge pass or from the top-level
    /// 'easy forward' error path"): a freshly created, socket-less record that failed its very
    /// first forward has nothing worth keeping around for an idle timeout.
    pub fn easy_forward(&mut self, buf: &[u8]) -> Result<ForwardOutcome, EasyForwardError> {
        let parsed = packet::parse(buf)?;
        let conn = match self.lookup_or_create(parsed.tuple, true) {
            Some(conn) => conn,
            None => return Ok(ForwardOutcome::Dropped),
        };
        if let Err(err) = self.forward(conn, &parsed, false) {
            let proto = parsed.tuple.proto;
            self.close_for_destroy(conn, proto);
            self.table.destroy(conn);
            return Err(err.into());
        }
        Ok(ForwardOutcome::Forwarded)
    }

    /// Forwards an already-parsed packet against an already-resolved connection. `no_ack`
    /// suppresses the TCP auto-ACK-on-data-segment behavior (§6 "two variants").
    pub fn forward(&mut self, conn: ConnId, parsed: &ParsedPacket<'_>, no_ack: bool) -> EngineResult<()> {
        match parsed.l4 {
            crate::packet::L4Info::Tcp(info) => self.tcp_forward(conn, info, parsed.payload, no_ack),
            crate::packet::L4Info::Udp => self.udp_forward(conn, parsed.payload),
            crate::packet::L4Info::Icmp(info) => self.icmp_forward(conn, info, parsed.payload),
        }
    }

    /// Fills `readable`/`writable` with the raw fds the caller's readiness primitive should
    /// watch: every live connection's per-protocol socket, plus the shared ICMP socket, always
    /// watched for readability. TCP sockets mid-connect are watched for writability instead
    /// (§4.G, §3 invariant 4 — pending-queue connections are excluded from `readable`).
    pub fn fill_readiness(&self, readable: &mut HashSet<RawFd>, writable: &mut HashSet<RawFd>) {
        readable.insert(self.transports.icmp_socket().raw_fd());

        self.table.iterate_open(|_id, conn| {
            if let Some(fd) = conn.raw_fd() {
                match conn.status {
                    Status::Connecting => {
                        writable.insert(fd);
                    }
                    Status::Connected => {
                        let blocked_by_pending = conn.proto_state.as_tcp().map(|s| s.pending.is_some()).unwrap_or(false);
                        if !blocked_by_pending {
                            readable.insert(fd);
                        }
                    }
                    _ => {}
                }
            }
            false
        });
    }

    /// Dispatches a readiness result against every live connection plus the shared ICMP socket
    /// (§4.G). Returns the number of events handled.
    pub fn dispatch_readiness(&mut self, readable: &HashSet<RawFd>, writable: &HashSet<RawFd>) -> usize {
        let mut handled = 0;

        if readable.contains(&self.transports.icmp_socket().raw_fd()) {
            self.icmp_handle_readable();
            handled += 1;
        }

        for id in self.table.ids() {
            let (fd, status) = match self.table.get(id) {
                Some(conn) => (conn.raw_fd(), conn.status),
                None => continue,
            };
            let fd = match fd {
                Some(fd) => fd,
                None => continue,
            };

            if readable.contains(&fd) {
                self.dispatch_readable(id);
                handled += 1;
            } else if writable.contains(&fd) && status == Status::Connecting {
                self.tcp_handle_connect_writable(id);
                handled += 1;
            }
        }

        handled
    }

    fn dispatch_readable(&mut self, id: ConnId) {
        let proto = match self.table.get(id) {
            Some(conn) => conn.tuple.proto,
            None => return,
        };
        match proto {
            crate::tuple::Proto::Tcp => self.tcp_handle_readable(id),
            crate::tuple::Proto::Udp => self.udp_handle_readable(id),
            crate::tuple::Proto::Icmp => {}
        }
    }

    /// Runs the idleness and overload purge passes with caller-supplied `now` (§4.H).
    pub fn purge(&mut self, now: u64) {
        self.purge_idle(now);
        self.purge_overload();
    }

    /// Visits every non-CLOSED connection (§4.C `iterate`).
    pub fn iterate(&self, f: impl FnMut(ConnId, &Connection) -> bool) {
        self.table.iterate_open(f);
    }

    pub fn stats(&self) -> Stats {
        self.table.stats()
    }
}
