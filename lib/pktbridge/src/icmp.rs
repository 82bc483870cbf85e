//! ICMP echo relay (§4.F): one process-wide raw socket shared by every ICMP "connection"; no
//! per-connection socket exists, so replies are demultiplexed by scanning the table for
//! `(remote IP, echo id)` instead of by fd.

use flux::logging;

use crate::callbacks::{Callbacks, Direction};
use crate::checksum;
use crate::connection::ConnId;
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::packet::{IcmpInfo, IcmpKind};
use crate::reply;
use crate::transport::TransportFactory;
use crate::tuple::Proto;

impl<T: TransportFactory, C: Callbacks> Engine<T, C> {
    pub(crate) fn icmp_forward(&mut self, conn_id: ConnId, info: IcmpInfo, payload: &[u8]) -> EngineResult<()> {
        let dest = match self.table.get(conn_id) {
            Some(conn) => conn.effective_destination(),
            None => return Ok(()),
        };

        if let Some(icmp) = self.table.get_mut(conn_id).and_then(|c| c.proto_state.as_icmp_mut()) {
            icmp.echo_id = info.id;
            icmp.echo_seq = info.seq;
        }

        let mut message = Vec::with_capacity(8 + payload.len());
        message.extend_from_slice(&icmp_header_bytes(&info));
        message.extend_from_slice(payload);
        checksum::recompute_icmp_checksum(&mut message);

        self.transports.icmp_socket_mut().send_to(&message, dest)?;
        Ok(())
    }

    /// The shared raw socket became readable; §4.G dispatches this once per readiness pass, not
    /// once per connection.
    pub(crate) fn icmp_handle_readable(&mut self) {
        let mut buf = [0u8; 16384];
        let (n, from) = match self.transports.icmp_socket_mut().recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(_) => return,
        };

        if n < 8 {
            return;
        }

        let echo_id = u16::from_be_bytes([buf[4], buf[5]]);
        let source_ip = from.ip().octets();

        let mut matched = None;
        self.table.iterate_open(|id, conn| {
            if conn.tuple.proto == Proto::Icmp && conn.tuple.dst_ip == source_ip {
                if let Some(icmp) = conn.proto_state.as_icmp() {
                    if icmp.echo_id == echo_id {
                        matched = Some(id);
                        return true;
                    }
                }
            }
            false
        });

        let conn_id = match matched {
            Some(id) => id,
            None => {
                logging::trace!(self.log, "icmp reply matched no connection, dropped"; "echo_id" => echo_id);
                return;
            }
        };

        let tuple = match self.table.get(conn_id) {
            Some(conn) => conn.tuple,
            None => return,
        };

        let len = reply::build_icmp(&mut self.scratch, &tuple, &mut buf[..n]);
        let accepted = self.callbacks.send_client(&self.scratch[..len], conn_id);
        self.callbacks.account_packet(&self.scratch[..len], Direction::ToClient, conn_id);

        if !accepted {
            self.table.mark_closed(conn_id);
            self.callbacks.on_connection_close(conn_id);
        }
    }
}

fn icmp_header_bytes(info: &IcmpInfo) -> [u8; 8] {
    let mut header = [0u8; 8];
    header[0] = match info.kind {
        IcmpKind::EchoRequest => 8,
        IcmpKind::EchoReply => 0,
    };
    header[4..6].copy_from_slice(&info.id.to_be_bytes());
    header[6..8].copy_from_slice(&info.seq.to_be_bytes());
    header
}
