//! The connection record (§3) and its protocol-tagged state. A record is immutable in its
//! 5-tuple once inserted into [`crate::table::Table`]; everything else mutates as packets and
//! readiness events are forwarded through it.

use crate::transport::{DatagramTransport, StreamTransport};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

use crate::tuple::FiveTuple;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Status {
    New,
    Connecting,
    Connected,
    Closed,
}

/// A buffer of server-originated bytes that arrived faster than the client's advertised window
/// could absorb, queued until `drain_pending` can emit them (§4.D).
#[derive(Debug, Default, Clone)]
pub struct PendingData {
    pub bytes: Vec<u8>,
    pub sent: usize,
}

impl PendingData {
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.sent
    }

    pub fn is_empty(&self) -> bool {
        self.sent >= self.bytes.len()
    }
}

/// TCP-only state. Never read from a non-TCP record; see [`ProtoState`] (§9 tagged-variant note).
/// `stream` doubles as the spec's "OS socket handle or sentinel" field: `None` is the sentinel.
pub struct TcpState {
    /// The engine's view of the client's next inbound sequence number.
    pub client_seq: u32,
    /// The engine's next outbound sequence number.
    pub zdtun_seq: u32,
    /// Remaining bytes in the client's advertised window, from the engine's perspective.
    pub window: u32,
    pub fin_ack_sent: bool,
    pub pending: Option<PendingData>,
    pub stream: Option<Box<dyn StreamTransport>>,
}

impl TcpState {
    /// The state a brand-new NEW-status record starts in: no socket yet, sequence numbers
    /// unseeded until the first SYN is processed (§4.D).
    fn new(window: u32) -> TcpState {
        TcpState {
            client_seq: 0,
            zdtun_seq: 0,
            window,
            fin_ack_sent: false,
            pending: None,
            stream: None,
        }
    }
}

/// UDP-only state: the per-connection datagram socket (§4.E).
pub struct UdpState {
    pub stream: Option<Box<dyn DatagramTransport>>,
}

/// ICMP-only state: the last-seen echo id/seq, kept so a reply can be matched back (§4.F). There
/// is no per-connection socket: all ICMP connections share the engine's one raw socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct IcmpState {
    pub echo_id: u16,
    pub echo_seq: u16,
}

/// Sum type discriminated by protocol, per §9: TCP fields are never reachable from a UDP or ICMP
/// record and vice versa.
pub enum ProtoState {
    Tcp(TcpState),
    Udp(UdpState),
    Icmp(IcmpState),
}

impl ProtoState {
    pub fn as_tcp(&self) -> Option<&TcpState> {
        match self {
            ProtoState::Tcp(state) => Some(state),
            _ => None,
        }
    }

    pub fn as_tcp_mut(&mut self) -> Option<&mut TcpState> {
        match self {
            ProtoState::Tcp(state) => Some(state),
            _ => None,
        }
    }

    pub fn as_udp_mut(&mut self) -> Option<&mut UdpState> {
        match self {
            ProtoState::Udp(state) => Some(state),
            _ => None,
        }
    }

    pub fn as_icmp(&self) -> Option<&IcmpState> {
        match self {
            ProtoState::Icmp(state) => Some(state),
            _ => None,
        }
    }

    pub fn as_icmp_mut(&mut self) -> Option<&mut IcmpState> {
        match self {
            ProtoState::Icmp(state) => Some(state),
            _ => None,
        }
    }
}

/// Builds the protocol-tagged state a brand-new record starts in, from the tuple alone
/// (§4.C `lookup`): TCP gets no socket until its first SYN, UDP none until its first packet, and
/// ICMP's echo id/seq are read straight off the tuple's reused port slots (§3).
pub fn initial_state(tuple: &FiveTuple, max_window: u32) -> ProtoState {
    match tuple.proto {
        crate::tuple::Proto::Tcp => ProtoState::Tcp(TcpState::new(max_window)),
        crate::tuple::Proto::Udp => ProtoState::Udp(UdpState { stream: None }),
        crate::tuple::Proto::Icmp => ProtoState::Icmp(IcmpState {
            echo_id: tuple.src_port(),
            echo_seq: tuple.dst_port(),
        }),
    }
}

/// A stable reference to a connection slot. Indexes into [`crate::table::Table`]'s slab; stale
/// ids (after `destroy`) simply miss the lookup rather than dereferencing freed memory.
pub type ConnId = usize;

/// One entry of the connection table (§3 "Connection record").
pub struct Connection {
    pub tuple: FiveTuple,
    pub tstamp: u64,
    pub status: Status,
    pub dnat: Option<SocketAddrV4>,
    pub proto_state: ProtoState,
    pub userdata: Option<Box<dyn std::any::Any>>,
}

impl Connection {
    pub fn new(tuple: FiveTuple, tstamp: u64, proto_state: ProtoState) -> Connection {
        Connection {
            tuple,
            tstamp,
            status: Status::New,
            dnat: None,
            proto_state,
            userdata: None,
        }
    }

    /// Invariant 3 (§3): true exactly when this record has a live per-connection socket
    /// registered in the readiness set. Always false for ICMP, which has none of its own.
    pub fn has_socket(&self) -> bool {
        match &self.proto_state {
            ProtoState::Tcp(state) => state.stream.is_some(),
            ProtoState::Udp(state) => state.stream.is_some(),
            ProtoState::Icmp(_) => false,
        }
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        match &self.proto_state {
            ProtoState::Tcp(state) => state.stream.as_ref().map(|s| s.raw_fd()),
            ProtoState::Udp(state) => state.stream.as_ref().map(|s| s.raw_fd()),
            ProtoState::Icmp(_) => None,
        }
    }

    /// The effective destination: the DNAT override if one was set, else the tuple's own
    /// destination (§3 "DNAT override").
    pub fn effective_destination(&self) -> SocketAddrV4 {
        self.dnat.unwrap_or_else(|| {
            let ip = Ipv4Addr::from(self.tuple.dst_ip);
            SocketAddrV4::new(ip, self.tuple.dst_port())
        })
    }

    pub fn set_dnat(&mut self, addr: SocketAddrV4) {
        self.dnat = Some(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::Proto;

    #[test]
    fn test_effective_destination_defaults_to_tuple() {
        let tuple = FiveTuple::new(Proto::Tcp, [10, 0, 0, 1], 5000, [1, 2, 3, 4], 80);
        let conn = Connection::new(tuple, 0, ProtoState::Udp(UdpState { stream: None }));
        assert_eq!(conn.effective_destination(), SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 80));
    }

    #[test]
    fn test_dnat_override_wins() {
        let tuple = FiveTuple::new(Proto::Tcp, [10, 0, 0, 1], 5000, [1, 2, 3, 4], 80);
        let mut conn = Connection::new(tuple, 0, ProtoState::Udp(UdpState { stream: None }));
        conn.set_dnat(SocketAddrV4::new(Ipv4Addr::new(9, 9, 9, 9), 443));
        assert_eq!(conn.effective_destination(), SocketAddrV4::new(Ipv4Addr::new(9, 9, 9, 9), 443));
    }

    #[test]
    fn test_pending_data_remaining_and_empty() {
        let mut pending = PendingData { bytes: vec![1, 2, 3, 4], sent: 0 };
        assert_eq!(pending.remaining(), 4);
        assert!(!pending.is_empty());
        pending.sent = 4;
        assert_eq!(pending.remaining(), 0);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_icmp_has_no_socket() {
        let tuple = FiveTuple::new(Proto::Icmp, [10, 0, 0, 1], 7, [1, 2, 3, 4], 1);
        let conn = Connection::new(tuple, 0, ProtoState::Icmp(IcmpState { echo_id: 7, echo_seq: 1 }));
        assert!(!conn.has_socket());
        assert!(conn.raw_fd().is_none());
    }
}
