//! Decodes a raw IPv4 buffer into a typed view carrying the 5-tuple, header boundaries, and
//! payload slice (§4.A). Performs no checksum verification — the tun driver is trusted to have
//! already validated the packet before handing it to the engine.

use crate::checksum::TcpFlags;
use crate::error::ParseError;
use crate::tuple::{FiveTuple, Proto};
use byteorder::{BigEndian, ByteOrder};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum IcmpKind {
    EchoRequest,
    EchoReply,
}

#[derive(Debug, Clone, Copy)]
pub struct TcpInfo {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct IcmpInfo {
    pub kind: IcmpKind,
    pub id: u16,
    pub seq: u16,
}

#[derive(Debug, Clone, Copy)]
pub enum L4Info {
    Tcp(TcpInfo),
    Udp,
    Icmp(IcmpInfo),
}

/// A parsed view into a caller-owned buffer. Carries the 5-tuple plus enough protocol-specific
/// detail (flags, sequence numbers, window, echo id/seq) for the forwarders to act without
/// re-parsing the buffer themselves.
#[derive(Debug, Clone, Copy)]
pub struct ParsedPacket<'a> {
    pub tuple: FiveTuple,
    pub l4: L4Info,
    pub ip_header_len: usize,
    pub l4_header_len: usize,
    pub payload: &'a [u8],
}

const MIN_IP_HEADER_LEN: usize = 20;
const MIN_TCP_HEADER_LEN: usize = 20;
const MIN_UDP_HEADER_LEN: usize = 8;
const MIN_ICMP_HEADER_LEN: usize = 8;

/// Parses `buf` as a raw IPv4 datagram. See [`ParseError`] for the exact rejection taxonomy.
pub fn parse(buf: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    if buf.len() < MIN_IP_HEADER_LEN {
        return Err(ParseError::TooShortForIpHeader);
    }

    let version = buf[0] >> 4;
    if version != 4 {
        return Err(ParseError::NotIpv4);
    }

    let ihl = usize::from(buf[0] & 0x0F) * 4;
    if ihl < MIN_IP_HEADER_LEN || buf.len() < ihl {
        return Err(ParseError::TooShortForDeclaredIpHeader);
    }

    let protocol = buf[9];
    let src_ip = [buf[12], buf[13], buf[14], buf[15]];
    let dst_ip = [buf[16], buf[17], buf[18], buf[19]];

    let l4 = &buf[ihl..];

    let proto = Proto::from_ip_protocol(protocol).ok_or(ParseError::UnknownProtocol(protocol))?;

    match proto {
        Proto::Tcp => parse_tcp(l4, ihl, src_ip, dst_ip),
        Proto::Udp => parse_udp(l4, ihl, src_ip, dst_ip),
        Proto::Icmp => parse_icmp(l4, ihl, src_ip, dst_ip),
    }
}

fn parse_tcp(l4: &[u8], ihl: usize, src_ip: [u8; 4], dst_ip: [u8; 4]) -> Result<ParsedPacket<'_>, ParseError> {
    if l4.len() < MIN_TCP_HEADER_LEN {
        return Err(ParseError::TcpTooShort);
    }

    let data_offset = usize::from(l4[12] >> 4) * 4;
    if data_offset < MIN_TCP_HEADER_LEN || l4.len() < data_offset {
        return Err(ParseError::TcpTooShort);
    }

    let src_port = BigEndian::read_u16(&l4[0..2]);
    let dst_port = BigEndian::read_u16(&l4[2..4]);
    let seq = BigEndian::read_u32(&l4[4..8]);
    let ack = BigEndian::read_u32(&l4[8..12]);
    let flags = TcpFlags::from_bits_truncate(l4[13]);
    let window = BigEndian::read_u16(&l4[14..16]);

    Ok(ParsedPacket {
        tuple: FiveTuple::new(Proto::Tcp, src_ip, src_port, dst_ip, dst_port),
        l4: L4Info::Tcp(TcpInfo { seq, ack, flags, window }),
        ip_header_len: ihl,
        l4_header_len: data_offset,
        payload: &l4[data_offset..],
    })
}

fn parse_udp(l4: &[u8], ihl: usize, src_ip: [u8; 4], dst_ip: [u8; 4]) -> Result<ParsedPacket<'_>, ParseError> {
    if l4.len() < MIN_UDP_HEADER_LEN {
        return Err(ParseError::UdpTooShort);
    }

    let src_port = BigEndian::read_u16(&l4[0..2]);
    let dst_port = BigEndian::read_u16(&l4[2..4]);

    Ok(ParsedPacket {
        tuple: FiveTuple::new(Proto::Udp, src_ip, src_port, dst_ip, dst_port),
        l4: L4Info::Udp,
        ip_header_len: ihl,
        l4_header_len: MIN_UDP_HEADER_LEN,
        payload: &l4[MIN_UDP_HEADER_LEN..],
    })
}

fn parse_icmp(l4: &[u8], ihl: usize, src_ip: [u8; 4], dst_ip: [u8; 4]) -> Result<ParsedPacket<'_>, ParseError> {
    if l4.len() < MIN_ICMP_HEADER_LEN {
        return Err(ParseError::IcmpUnsupported);
    }

    let kind = match l4[0] {
        8 => IcmpKind::EchoRequest,
        0 => IcmpKind::EchoReply,
        _ => return Err(ParseError::IcmpUnsupported),
    };

    let id = BigEndian::read_u16(&l4[4..6]);
    let seq = BigEndian::read_u16(&l4[6..8]);

    Ok(ParsedPacket {
        tuple: FiveTuple::new(Proto::Icmp, src_ip, id, dst_ip, seq),
        l4: L4Info::Icmp(IcmpInfo { kind, id, seq }),
        ip_header_len: ihl,
        l4_header_len: MIN_ICMP_HEADER_LEN,
        payload: &l4[MIN_ICMP_HEADER_LEN..],
    })
}
