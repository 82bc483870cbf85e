//! UDP forwarding (§4.E): connect-on-first-packet datagram relay, plus the eager DNS-response
//! purge carried over from the original engine's ephemeral-port economy.

use flux::logging;

use crate::callbacks::{Callbacks, Direction};
use crate::connection::{ConnId, Status};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::reply;
use crate::transport::TransportFactory;

const DNS_PORT: u16 = 53;

impl<T: TransportFactory, C: Callbacks> Engine<T, C> {
    pub(crate) fn udp_forward(&mut self, conn_id: ConnId, payload: &[u8]) -> EngineResult<()> {
        let status = match self.table.get(conn_id) {
            Some(conn) => conn.status,
            None => return Ok(()),
        };

        if status == Status::Closed {
            return Ok(());
        }

        if status == Status::New {
            let datagram = self.transports.new_datagram().map_err(EngineError::from)?;
            let fd = datagram.raw_fd();
            self.callbacks.on_socket_open(fd);
            self.table.note_socket_opened();

            if let Some(udp) = self.table.get_mut(conn_id).and_then(|c| c.proto_state.as_udp_mut()) {
                udp.stream = Some(datagram);
            }
            if let Some(conn) = self.table.get_mut(conn_id) {
                conn.status = Status::Connected;
            }
            logging::debug!(self.log, "udp socket opened"; "conn" => conn_id);
        }

        let dest = match self.table.get(conn_id) {
            Some(conn) => conn.effective_destination(),
            None => return Ok(()),
        };

        let result = {
            let stream = self
                .table
                .get_mut(conn_id)
                .and_then(|c| c.proto_state.as_udp_mut())
                .and_then(|u| u.stream.as_mut());
            match stream {
                Some(stream) => stream.send_to(payload, dest),
                None => return Ok(()),
            }
        };

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                let engine_err: EngineError = err.into();
                match engine_err {
                    EngineError::Wait => Ok(()),
                    fatal => {
                        self.udp_close(conn_id);
                        Err(fatal)
                    }
                }
            }
        }
    }

    /// The per-connection datagram socket became readable (§4.E reply handler).
    pub(crate) fn udp_handle_readable(&mut self, conn_id: ConnId) {
        let mut buf = [0u8; 16384];
        let result = {
            let stream = self
                .table
                .get_mut(conn_id)
                .and_then(|c| c.proto_state.as_udp_mut())
                .and_then(|u| u.stream.as_mut());
            match stream {
                Some(stream) => stream.recv_from(&mut buf),
                None => return,
            }
        };

        let n = match result {
            Ok((n, _from)) => n,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(_) => {
                self.udp_close(conn_id);
                return;
            }
        };

        let payload_is_dns_response = {
            let payload = &buf[..n];
            let tuple = match self.table.get(conn_id) {
                Some(conn) => conn.tuple,
                None => return,
            };

            let len = reply::build_udp(&mut self.scratch, &tuple, payload);
            let accepted = self.callbacks.send_client(&self.scratch[..len], conn_id);
            self.callbacks.account_packet(&self.scratch[..len], Direction::ToClient, conn_id);

            if !accepted {
                self.udp_close(conn_id);
                return;
            }

            tuple.dst_port() == DNS_PORT && is_dns_response(payload)
        };

        if payload_is_dns_response {
            logging::debug!(self.log, "udp dns response, eager purge"; "conn" => conn_id);
            self.udp_close(conn_id);
        }
    }

    /// Idempotent close (§4.C `close_conn`), UDP side: no RST-equivalent to emit, just the
    /// socket release and bookkeeping.
    pub(crate) fn udp_close(&mut self, conn_id: ConnId) {
        let already_closed = self.table.get(conn_id).map(|c| c.status == Status::Closed).unwrap_or(true);
        if already_closed {
            return;
        }

        let closed_fd = self
            .table
            .get_mut(conn_id)
            .and_then(|c| c.proto_state.as_udp_mut())
            .and_then(|u| u.stream.take())
            .map(|stream| stream.raw_fd());

        if let Some(fd) = closed_fd {
            self.callbacks.on_socket_close(fd);
            self.table.note_socket_closed();
        }

        self.table.mark_closed(conn_id);
        self.callbacks.on_connection_close(conn_id);
        logging::debug!(self.log, "udp connection closed"; "conn" => conn_id);
    }
}

/// The DNS header's QR bit (top bit of the flags byte at offset 2) set means "this is a
/// response" (§4.E).
fn is_dns_response(payload: &[u8]) -> bool {
    payload.len() >= 3 && payload[2] & 0x80 != 0
}
