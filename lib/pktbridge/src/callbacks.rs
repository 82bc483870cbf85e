//! The host-supplied callback interface (§6). All methods but [`Callbacks::send_client`] have a
//! permissive default, mirroring the original's "all optional except send_client" contract.

use crate::connection::ConnId;
use crate::tuple::FiveTuple;
use std::os::unix::io::RawFd;

/// Which way a packet accounted through [`Callbacks::account_packet`] is travelling.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
    /// From the client, into the engine.
    ToEngine,
    /// From the engine, synthesized for the client.
    ToClient,
}

pub trait Callbacks {
    /// Emits a synthesized packet to the tun device. Returning `false` triggers the connection
    /// to be closed, matching the original's "nonzero triggers close" contract.
    fn send_client(&mut self, buf: &[u8], conn: ConnId) -> bool;

    /// The host should start tracking `fd` with its own readiness primitive.
    fn on_socket_open(&mut self, _fd: RawFd) {}

    /// The host should stop tracking `fd`; it has already been closed by the engine.
    fn on_socket_close(&mut self, _fd: RawFd) {}

    /// Returning `false` refuses creation of the connection for `tuple` (§4.C).
    fn on_connection_open(&mut self, _tuple: &FiveTuple) -> bool {
        true
    }

    /// Last chance to release any user-side state attached to `conn` before it is destroyed.
    fn on_connection_close(&mut self, _conn: ConnId) {}

    fn account_packet(&mut self, _buf: &[u8], _direction: Direction, _conn: ConnId) {}
}
