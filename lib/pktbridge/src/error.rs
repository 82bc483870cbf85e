use std::io;

/// Errors surfaced by the packet parser (§4.A). Each malformed or unsupported shape gets its
/// own variant rather than a catch-all, so callers can log or count them individually.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ParseError {
    /// Buffer shorter than a minimal IPv4 header.
    TooShortForIpHeader,
    /// IP version field is not 4.
    NotIpv4,
    /// Buffer shorter than the header length the IP header itself declares.
    TooShortForDeclaredIpHeader,
    /// TCP segment shorter than 20 bytes, or shorter than its own declared data offset.
    TcpTooShort,
    /// UDP datagram shorter than 8 bytes.
    UdpTooShort,
    /// ICMP message that is neither an echo request nor an echo reply. Soft-rejected: the
    /// caller is expected to drop the packet silently rather than log it as an error.
    IcmpUnsupported,
    /// Any L4 protocol other than TCP/UDP/ICMP.
    UnknownProtocol(u8),
}

/// Errors surfaced by engine-level operations (forwarding, socket I/O).
///
/// `Wait` is not a failure: it means a non-blocking operation has nothing to report yet
/// (e.g. `io::ErrorKind::WouldBlock`). Only `Fatal` should ever close a connection.
#[derive(Debug, Eq, PartialEq)]
pub enum EngineError {
    Wait,
    Fatal(EngineErrorKind),
}

#[derive(Debug, Eq, PartialEq)]
pub enum EngineErrorKind {
    /// The peer actively refused, reset, or aborted the connection. Distinguished from other
    /// I/O errors because the handling differs (§7): close quietly and emit RST, rather than
    /// reporting failure to the caller.
    PeerClosed,
    Io(io::ErrorKind),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<io::Error> for EngineError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => EngineError::Wait,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => EngineError::Fatal(EngineErrorKind::PeerClosed),
            kind => EngineError::Fatal(EngineErrorKind::Io(kind)),
        }
    }
}

/// Augments `Result` with the §7 propagation policy: `Wait` is not a failure.
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for EngineResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(EngineError::Wait))
    }
}

/// Errors raised while validating a [`crate::config::Config`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConfigError {
    /// `overload_target` must be strictly less than `socket_ceiling`, otherwise the overload
    /// purge pass (§4.H) can never bring the table back under budget.
    OverloadTargetNotBelowCeiling,
    /// An idle timeout of zero would destroy connections on every purge tick.
    ZeroIdleTimeout,
}
