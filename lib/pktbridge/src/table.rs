//! The 5-tuple connection table (§4.C): a slab of [`Connection`] records plus a free list for
//! reclaimed slots, with a `HashMap<FiveTuple, ConnId>` on top for tuple lookup. This is the
//! same slab + free-list idiom this crate's own `Endpoint` uses for its `Channel` slots, applied
//! here to the deferred-destruction pattern of §9: a closed record keeps its slot (and stays out
//! of `live`) until the purger reclaims it, so an in-flight callback can never read a freed slot.

use crate::connection::{Connection, ConnId, ProtoState, Status};
use crate::tuple::{FiveTuple, Proto};
use indexmap::IndexSet;
use std::collections::HashMap;

/// Aggregate counts the engine exposes through `Engine::stats` (§6).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoStats {
    pub active: usize,
    pub lifetime: u64,
    pub oldest_tstamp: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub tcp: ProtoStats,
    pub udp: ProtoStats,
    pub icmp: ProtoStats,
    pub num_open_socks: usize,
    pub num_active_connections: usize,
}

pub struct Table {
    slots: Vec<Option<Connection>>,
    free: Vec<usize>,
    index: HashMap<FiveTuple, ConnId>,
    /// Slots currently holding a live (not-yet-destroyed) record, in insertion order. Mirrors
    /// `Endpoint::live` in this crate's networking stack.
    live: IndexSet<ConnId>,
    num_open_socks: usize,
    lifetime: [u64; 3],
}

fn proto_slot(proto: Proto) -> usize {
    match proto {
        Proto::Tcp => 0,
        Proto::Udp => 1,
        Proto::Icmp => 2,
    }
}

impl Table {
    pub fn new() -> Table {
        Table {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            live: IndexSet::new(),
            num_open_socks: 0,
            lifetime: [0; 3],
        }
    }

    pub fn num_active_connections(&self) -> usize {
        self.live.len()
    }

    pub fn num_open_socks(&self) -> usize {
        self.num_open_socks
    }

    #[inline]
    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.slots.get(id).and_then(|slot| slot.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slots.get_mut(id).and_then(|slot| slot.as_mut())
    }

    pub fn find(&self, tuple: &FiveTuple) -> Option<ConnId> {
        self.index.get(tuple).copied()
    }

    /// Looks up `tuple`. If absent and `make` produces a record (the embedder's
    /// `on_connection_open` callback returned acceptance), inserts it and returns the new id.
    /// `make` receives the slot the record will live in so ICMP/TCP/UDP state can be built with
    /// the final id if needed; return `None` to refuse creation (§4.C).
    pub fn lookup_or_insert(
        &mut self,
        tuple: FiveTuple,
        tstamp: u64,
        make: impl FnOnce() -> Option<ProtoState>,
    ) -> Option<ConnId> {
        if let Some(&id) = self.index.get(&tuple) {
            return Some(id);
        }

        let proto_state = make()?;
        let conn = Connection::new(tuple, tstamp, proto_state);

        let id = if let Some(slot) = self.free.pop() {
            self.slots[slot] = Some(conn);
            slot
        } else {
            self.slots.push(Some(conn));
            self.slots.len() - 1
        };

        self.index.insert(tuple, id);
        self.live.insert(id);
        self.lifetime[proto_slot(tuple.proto)] += 1;
        Some(id)
    }

    pub fn note_socket_opened(&mut self) {
        self.num_open_socks += 1;
    }

    pub fn note_socket_closed(&mut self) {
        debug_assert!(self.num_open_socks > 0);
        self.num_open_socks = self.num_open_socks.saturating_sub(1);
    }

    /// Marks `id` closed without removing it from the slab: invariant 2 (§3) takes effect
    /// immediately, but the slot is only freed by [`Table::destroy`]. Returns `false` if already
    /// closed or absent, matching close's idempotence (testable property 7).
    pub fn mark_closed(&mut self, id: ConnId) -> bool {
        match self.get_mut(id) {
            Some(conn) if conn.status != Status::Closed => {
                conn.status = Status::Closed;
                true
            }
            _ => false,
        }
    }

    /// Physically removes `id`: drops the record, reclaims its slot, and removes it from the
    /// tuple index and the live set. Idempotent; missing ids are a no-op.
    pub fn destroy(&mut self, id: ConnId) {
        if let Some(conn) = self.slots.get_mut(id).and_then(|s| s.take()) {
            self.index.remove(&conn.tuple);
            self.live.shift_remove(&id);
            self.free.push(id);
        }
    }

    /// Traverses every live (not-yet-destroyed) record in insertion order, matching
    /// `Table::iterate`'s "skip CLOSED" contract only where callers need it — most callers want
    /// to see CLOSED records too (e.g. the purger), so this yields ids and lets the caller check
    /// status itself.
    pub fn ids(&self) -> Vec<ConnId> {
        self.live.iter().copied().collect()
    }

    /// As §4.C's `iterate`: visits only non-CLOSED records, stopping early if `f` returns `true`.
    pub fn iterate_open(&self, mut f: impl FnMut(ConnId, &Connection) -> bool) {
        for &id in self.live.iter() {
            if let Some(conn) = self.get(id) {
                if conn.status != Status::Closed && f(id, conn) {
                    break;
                }
            }
        }
    }

    pub fn stats(&self) -> Stats {
        let mut stats = Stats {
            num_open_socks: self.num_open_socks,
            num_active_connections: self.live.len(),
            ..Default::default()
        };

        for &id in self.live.iter() {
            if let Some(conn) = self.get(id) {
                let bucket = match conn.tuple.proto {
                    Proto::Tcp => &mut stats.tcp,
                    Proto::Udp => &mut stats.udp,
                    Proto::Icmp => &mut stats.icmp,
                };
                bucket.active += 1;
                bucket.oldest_tstamp = Some(match bucket.oldest_tstamp {
                    Some(oldest) => oldest.min(conn.tstamp),
                    None => conn.tstamp,
                });
            }
        }

        stats.tcp.lifetime = self.lifetime[proto_slot(Proto::Tcp)];
        stats.udp.lifetime = self.lifetime[proto_slot(Proto::Udp)];
        stats.icmp.lifetime = self.lifetime[proto_slot(Proto::Icmp)];
        stats
    }
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}
