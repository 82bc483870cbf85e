//! IPv4/TCP/UDP/ICMP checksum computation and outbound header synthesis (§4.B).
//!
//! Every builder in this module writes its header with the checksum field zeroed, computes the
//! checksum over the result, then patches it in — matching invariant 6 (§3) regardless of which
//! protocol is involved.

use crate::tuple::Proto;
use byteorder::{BigEndian, ByteOrder};

/// The RFC 1071 one's-complement checksum, folded to 16 bits. The input length may be odd; a
/// trailing byte is treated as if padded with a zero low byte.
pub fn internet_checksum(data: &[u8]) -> u16 {
    fold_and_negate(raw_sum(data))
}

fn raw_sum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for chunk in &mut chunks {
        sum += u32::from(BigEndian::read_u16(chunk));
    }

    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    sum
}

fn fold_and_negate(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Writes a 20-byte IPv4 header (no options) at the start of `buf`, with source/destination
/// swapped relative to the tuple already being the "remote peer" view (callers pass the tuple
/// they want to appear as `src -> dst` in the synthesized packet).
pub fn write_ipv4_header(buf: &mut [u8], proto: Proto, src_ip: [u8; 4], dst_ip: [u8; 4], l4_len: u16) {
    assert!(buf.len() >= 20);

    buf[0] = 0x45; // version 4, IHL 5
    buf[1] = 0; // DSCP/ECN
    BigEndian::write_u16(&mut buf[2..4], 20 + l4_len); // total length
    BigEndian::write_u16(&mut buf[4..6], 0); // identification
    BigEndian::write_u16(&mut buf[6..8], 0x4000); // flags=DF, fragment offset 0
    buf[8] = 64; // TTL
    buf[9] = proto as u8;
    BigEndian::write_u16(&mut buf[10..12], 0); // checksum, filled below
    buf[12..16].copy_from_slice(&src_ip);
    buf[16..20].copy_from_slice(&dst_ip);

    let csum = internet_checksum(&buf[..20]);
    BigEndian::write_u16(&mut buf[10..12], csum);
}

bitflags::bitflags! {
    /// TCP control bits this engine ever needs to read or emit. Options (MSS/SACK/timestamps/
    /// window scale) are out of scope (§1) so there is no reserved/options handling here.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct TcpFlags: u8 {
        const FIN = 0b0000_0001;
        const SYN = 0b0000_0010;
        const RST = 0b0000_0100;
        const PSH = 0b0000_1000;
        const ACK = 0b0001_0000;
    }
}

/// Writes a 20-byte TCP header (data offset 5, no options) at `buf[0..20]`. The payload of
/// `payload_len` bytes is assumed to already sit in `buf[20..20+payload_len]`; the pseudo-header
/// checksum is computed over header + payload as the RFC requires.
#[allow(clippy::too_many_arguments)]
pub fn write_tcp_header(
    buf: &mut [u8],
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload_len: usize,
    pseudo_src: [u8; 4],
    pseudo_dst: [u8; 4],
) {
    assert!(buf.len() >= 20 + payload_len);

    BigEndian::write_u16(&mut buf[0..2], src_port);
    BigEndian::write_u16(&mut buf[2..4], dst_port);
    BigEndian::write_u32(&mut buf[4..8], seq);
    BigEndian::write_u32(&mut buf[8..12], if flags.contains(TcpFlags::ACK) { ack } else { 0 });
    buf[12] = 5 << 4; // data offset 5, reserved bits 0
    buf[13] = flags.bits();
    BigEndian::write_u16(&mut buf[14..16], window);
    BigEndian::write_u16(&mut buf[16..18], 0); // checksum, filled below
    BigEndian::write_u16(&mut buf[18..20], 0); // urgent pointer

    let tcp_len = 20 + payload_len;
    let csum = tcp_checksum(&buf[..tcp_len], pseudo_src, pseudo_dst);
    BigEndian::write_u16(&mut buf[16..18], csum);
}

/// TCP checksum over the IPv4 pseudo-header + TCP header + payload.
pub fn tcp_checksum(tcp_segment: &[u8], src_ip: [u8; 4], dst_ip: [u8; 4]) -> u16 {
    l4_pseudo_header_checksum(tcp_segment, src_ip, dst_ip, Proto::Tcp)
}

fn l4_pseudo_header_checksum(segment: &[u8], src_ip: [u8; 4], dst_ip: [u8; 4], proto: Proto) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src_ip);
    pseudo[4..8].copy_from_slice(&dst_ip);
    pseudo[8] = 0;
    pseudo[9] = proto as u8;
    BigEndian::write_u16(&mut pseudo[10..12], segment.len() as u16);

    // The pseudo-header is always 12 bytes (even), so the boundary between it and the segment
    // falls on a 16-bit word boundary: the two halves can be summed independently and combined.
    fold_and_negate(raw_sum(&pseudo) + raw_sum(segment))
}

/// Writes an 8-byte UDP header at `buf[0..8]`. The checksum is explicitly left at zero, which
/// RFC 768 permits over IPv4 (§4.B): the engine elects not to pay the cost of computing it.
pub fn write_udp_header(buf: &mut [u8], src_port: u16, dst_port: u16, payload_len: usize) {
    assert!(buf.len() >= 8 + payload_len);

    BigEndian::write_u16(&mut buf[0..2], src_port);
    BigEndian::write_u16(&mut buf[2..4], dst_port);
    BigEndian::write_u16(&mut buf[4..6], (8 + payload_len) as u16);
    BigEndian::write_u16(&mut buf[6..8], 0);
}

/// Recomputes the ICMP checksum over `message` in place (header + payload), zeroing the
/// checksum field first per invariant 6.
pub fn recompute_icmp_checksum(message: &mut [u8]) {
    assert!(message.len() >= 4);
    message[2] = 0;
    message[3] = 0;
    let csum = internet_checksum(message);
    BigEndian::write_u16(&mut message[2..4], csum);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internet_checksum_known_vector() {
        // RFC 1071 worked example.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(internet_checksum(&data), 0x220D);
    }

    #[test]
    fn test_ipv4_header_verifies_to_zero() {
        let mut buf = [0u8; 20];
        write_ipv4_header(&mut buf, Proto::Tcp, [10, 0, 0, 1], [8, 8, 8, 8], 20);
        assert_eq!(internet_checksum(&buf), 0);
    }

    #[test]
    fn test_tcp_header_verifies_with_pseudo_header() {
        let mut buf = [0u8; 24];
        buf[20..24].copy_from_slice(b"ping");
        write_tcp_header(
            &mut buf,
            80,
            1234,
            0x77EB77EB,
            1001,
            TcpFlags::SYN | TcpFlags::ACK,
            14600,
            4,
            [1, 2, 3, 4],
            [5, 6, 7, 8],
        );

        let mut pseudo_and_segment = Vec::new();
        pseudo_and_segment.extend_from_slice(&[1, 2, 3, 4]);
        pseudo_and_segment.extend_from_slice(&[5, 6, 7, 8]);
        pseudo_and_segment.push(0);
        pseudo_and_segment.push(Proto::Tcp as u8);
        pseudo_and_segment.extend_from_slice(&(24u16).to_be_bytes());
        pseudo_and_segment.extend_from_slice(&buf);

        assert_eq!(internet_checksum(&pseudo_and_segment), 0);
    }

    #[test]
    fn test_tcp_header_fields() {
        let mut buf = [0u8; 20];
        write_tcp_header(&mut buf, 80, 1234, 0x77EB77EB, 1001, TcpFlags::SYN | TcpFlags::ACK, 14600, 0, [1, 2, 3, 4], [5, 6, 7, 8]);

        assert_eq!(BigEndian::read_u16(&buf[0..2]), 80);
        assert_eq!(BigEndian::read_u16(&buf[2..4]), 1234);
        assert_eq!(BigEndian::read_u32(&buf[4..8]), 0x77EB77EB);
        assert_eq!(BigEndian::read_u32(&buf[8..12]), 1001);
        assert_eq!(buf[12] >> 4, 5);
        assert_eq!(TcpFlags::from_bits_truncate(buf[13]), TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(BigEndian::read_u16(&buf[14..16]), 14600);
    }

    #[test]
    fn test_tcp_header_ack_zero_without_ack_flag() {
        let mut buf = [0u8; 20];
        write_tcp_header(&mut buf, 80, 1234, 1, 999, TcpFlags::SYN, 100, 0, [0; 4], [0; 4]);
        assert_eq!(BigEndian::read_u32(&buf[8..12]), 0);
    }

    #[test]
    fn test_udp_header_checksum_is_zero() {
        let mut buf = [0u8; 8];
        write_udp_header(&mut buf, 53, 4000, 0);
        assert_eq!(BigEndian::read_u16(&buf[6..8]), 0);
    }

    #[test]
    fn test_icmp_checksum_recompute_verifies() {
        // Echo request, type 8 code 0, id=7 seq=1, no payload.
        let mut msg = [8u8, 0, 0, 0, 0, 7, 0, 1];
        recompute_icmp_checksum(&mut msg);
        assert_eq!(internet_checksum(&msg), 0);
    }
}
