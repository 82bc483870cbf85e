//! The purger (§4.H): two independent passes, idleness and overload, both driven by the
//! connection table's own timestamp rather than a separate timer wheel.

use flux::logging;

use crate::connection::{ConnId, Status};
use crate::callbacks::Callbacks;
use crate::engine::Engine;
use crate::transport::TransportFactory;
use crate::tuple::Proto;

impl<T: TransportFactory, C: Callbacks> Engine<T, C> {
    /// Destroys every record that is already CLOSED, or idle beyond its protocol's budget
    /// (§4.H pass 1).
    pub(crate) fn purge_idle(&mut self, now: u64) {
        for id in self.table.ids() {
            let (proto, status, tstamp) = match self.table.get(id) {
                Some(conn) => (conn.tuple.proto, conn.status, conn.tstamp),
                None => continue,
            };

            let timeout = match proto {
                Proto::Tcp => self.config.tcp_idle_timeout,
                Proto::Udp => self.config.udp_idle_timeout,
                Proto::Icmp => self.config.icmp_idle_timeout,
            };

            let idle = now.saturating_sub(tstamp) > timeout.as_secs();
            if status == Status::Closed || idle {
                if idle && status != Status::Closed {
                    logging::debug!(self.log, "purging idle connection"; "conn" => id);
                }
                self.close_for_destroy(id, proto);
                self.table.destroy(id);
            }
        }
    }

    /// If the open-socket count still exceeds `socket_ceiling`, destroys the oldest records
    /// (by timestamp) until it falls to `overload_target` (§4.H pass 2).
    pub(crate) fn purge_overload(&mut self) {
        if self.table.num_open_socks() <= self.config.socket_ceiling {
            return;
        }

        let mut candidates = Vec::new();
        self.table.iterate_open(|id, conn| {
            candidates.push((id, conn.tstamp, conn.tuple.proto));
            false
        });
        candidates.sort_by_key(|&(_, tstamp, _)| tstamp);

        for (id, _, proto) in candidates {
            if self.table.num_open_socks() <= self.config.overload_target {
                break;
            }
            logging::debug!(self.log, "overload eviction"; "conn" => id);
            self.close_for_destroy(id, proto);
            self.table.destroy(id);
        }
    }

    pub(crate) fn close_for_destroy(&mut self, id: ConnId, proto: Proto) {
        let already_closed = self.table.get(id).map(|c| c.status == Status::Closed).unwrap_or(true);
        if already_closed {
            return;
        }

        match proto {
            Proto::Tcp => self.tcp_close(id, false),
            Proto::Udp => self.udp_close(id),
            Proto::Icmp => {
                self.table.mark_closed(id);
                self.callbacks.on_connection_close(id);
            }
        }
    }
}
