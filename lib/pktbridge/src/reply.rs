//! Assembles a complete IPv4 + L4 reply into the engine's scratch buffer (§3 "scratch reply
//! buffer", §4.B). Every builder here writes IP header, L4 header, and payload back-to-back so
//! the result is ready to hand straight to `Callbacks::send_client`.

use crate::checksum::{self, TcpFlags};
use crate::tuple::{FiveTuple, Proto};

pub const IP_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

/// Writes an IPv4 + TCP segment for `tuple.swapped()` (the engine answering as the remote peer)
/// into `buf`, payload included, and returns the total packet length.
#[allow(clippy::too_many_arguments)]
pub fn build_tcp(buf: &mut [u8], tuple: &FiveTuple, flags: TcpFlags, seq: u32, ack: u32, window: u32, payload: &[u8]) -> usize {
    let swapped = tuple.swapped();
    let total = IP_HEADER_LEN + TCP_HEADER_LEN + payload.len();
    assert!(buf.len() >= total);

    buf[IP_HEADER_LEN + TCP_HEADER_LEN..total].copy_from_slice(payload);

    checksum::write_tcp_header(
        &mut buf[IP_HEADER_LEN..total],
        swapped.src_port(),
        swapped.dst_port(),
        seq,
        ack,
        flags,
        window.min(u16::MAX as u32) as u16,
        payload.len(),
        swapped.src_ip,
        swapped.dst_ip,
    );

    checksum::write_ipv4_header(buf, Proto::Tcp, swapped.src_ip, swapped.dst_ip, (TCP_HEADER_LEN + payload.len()) as u16);

    total
}

/// Writes an IPv4 + UDP datagram for `tuple.swapped()` into `buf` and returns the total length.
/// The UDP checksum field is left zero per §4.B.
pub fn build_udp(buf: &mut [u8], tuple: &FiveTuple, payload: &[u8]) -> usize {
    let swapped = tuple.swapped();
    let total = IP_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    assert!(buf.len() >= total);

    buf[IP_HEADER_LEN + UDP_HEADER_LEN..total].copy_from_slice(payload);
    checksum::write_udp_header(&mut buf[IP_HEADER_LEN..total], swapped.src_port(), swapped.dst_port(), payload.len());
    checksum::write_ipv4_header(buf, Proto::Udp, swapped.src_ip, swapped.dst_ip, (UDP_HEADER_LEN + payload.len()) as u16);

    total
}

/// Writes an IPv4 + ICMP message for `tuple.swapped()` into `buf`. `icmp_message` is the
/// untouched ICMP body (type/code/checksum/id/seq/payload) as received from the raw socket; its
/// checksum is recomputed in place before the IP header is prefixed.
pub fn build_icmp(buf: &mut [u8], tuple: &FiveTuple, icmp_message: &mut [u8]) -> usize {
    let swapped = tuple.swapped();
    let total = IP_HEADER_LEN + icmp_message.len();
    assert!(buf.len() >= total);

    checksum::recompute_icmp_checksum(icmp_message);
    buf[IP_HEADER_LEN..total].copy_from_slice(icmp_message);
    checksum::write_ipv4_header(buf, Proto::Icmp, swapped.src_ip, swapped.dst_ip, icmp_message.len() as u16);

    total
}
