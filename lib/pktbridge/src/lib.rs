//! A user-space packet-to-socket tunneling engine: terminates TCP/UDP/ICMP flows carried in raw
//! IPv4 packets from a tun-like interface, forwards their payloads through real OS sockets, and
//! synthesizes IPv4 reply packets back to the client.
//!
//! [`engine::Engine`] is the single entry point; everything else in this crate exists to build
//! one, feed it parsed packets, and drive its readiness and purge loops.

pub mod callbacks;
pub mod checksum;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod packet;
pub mod reply;
pub mod table;
pub mod transport;
pub mod tuple;

mod icmp;
mod purge;
mod tcp;
mod udp;

pub use callbacks::{Callbacks, Direction};
pub use config::Config;
pub use connection::{ConnId, Connection};
pub use engine::{EasyForwardError, Engine, ForwardOutcome};
pub use error::{ConfigError, EngineError, EngineResult, ParseError};
pub use table::{ProtoStats, Stats};
pub use transport::{DatagramTransport, OsTransportFactory, StreamTransport, TransportFactory};
pub use tuple::{FiveTuple, Proto};
