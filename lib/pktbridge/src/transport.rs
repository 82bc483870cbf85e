//! The trait seam between the forwarding state machines (§4.D-F) and concrete OS sockets
//! (§4.I). Production code runs against [`OsTransportFactory`]; tests run the exact same state
//! machine code against [`mock::MockTransportFactory`].

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// A connection-oriented transport standing in for a TCP socket.
pub trait StreamTransport: Read + Write + Send {
    /// Starts a non-blocking connect. Returns `Ok(true)` if the connect completed
    /// synchronously, `Ok(false)` if it is in progress (the caller should wait for
    /// writability and then call [`StreamTransport::take_error`]).
    fn connect(&mut self, addr: SocketAddrV4) -> io::Result<bool>;

    /// Polls `SO_ERROR` after a writability notification following an in-progress connect.
    /// `Ok(None)` means the connect succeeded.
    fn take_error(&mut self) -> io::Result<Option<io::Error>>;

    fn shutdown(&mut self);

    /// The raw OS handle, handed to `on_socket_open`/`on_socket_close` (§6) so the embedder can
    /// register it with its own readiness primitive.
    fn raw_fd(&self) -> RawFd;
}

/// A connectionless transport standing in for a UDP socket, or the one shared raw ICMP socket.
pub trait DatagramTransport: Send {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddrV4) -> io::Result<usize>;
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)>;
    fn raw_fd(&self) -> RawFd;
}

/// Produces transports for new connections and owns the one process-wide raw ICMP socket.
/// Implemented once for real OS sockets ([`OsTransportFactory`]) and once for
/// [`mock::MockTransportFactory`] in tests.
pub trait TransportFactory {
    fn new_stream(&self) -> io::Result<Box<dyn StreamTransport>>;
    fn new_datagram(&self) -> io::Result<Box<dyn DatagramTransport>>;
    fn icmp_socket(&self) -> &dyn DatagramTransport;
    fn icmp_socket_mut(&mut self) -> &mut dyn DatagramTransport;
}

/// A non-blocking TCP stream backed directly by `socket2::Socket`, which implements `Read` and
/// `Write` itself so no conversion to `std::net::TcpStream` is needed.
pub struct TcpTransport {
    inner: Socket,
}

impl TcpTransport {
    fn new() -> io::Result<TcpTransport> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        Ok(TcpTransport { inner: socket })
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl StreamTransport for TcpTransport {
    fn connect(&mut self, addr: SocketAddrV4) -> io::Result<bool> {
        match self.inner.connect(&SockAddr::from(SocketAddr::V4(addr))) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock || is_in_progress(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    fn shutdown(&mut self) {
        let _ = self.inner.shutdown(std::net::Shutdown::Both);
    }

    fn raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

fn is_in_progress(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == EINPROGRESS)
}

#[cfg(target_os = "linux")]
const EINPROGRESS: i32 = 115;
#[cfg(target_os = "macos")]
const EINPROGRESS: i32 = 36;
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
const EINPROGRESS: i32 = 115;

/// A `socket2::Socket`-backed datagram transport for UDP connections.
pub struct UdpTransport {
    inner: Socket,
}

impl DatagramTransport for UdpTransport {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddrV4) -> io::Result<usize> {
        self.inner.send_to(buf, &SockAddr::from(SocketAddr::V4(addr)))
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
        // SAFETY: `recv_from` never reads from `buf` before the OS has written into it, so
        // treating the `u8` slice as `MaybeUninit<u8>` here is sound.
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [std::mem::MaybeUninit<u8>]) };
        let (n, addr) = self.inner.recv_from(uninit)?;
        let ip = match addr.as_socket() {
            Some(SocketAddr::V4(v4)) => v4,
            _ => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        };
        Ok((n, ip))
    }

    fn raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// A raw `IPPROTO_ICMP` socket. One is created per engine and shared by every ICMP connection
/// (§4.F).
pub struct IcmpTransport {
    inner: Socket,
}

impl IcmpTransport {
    fn new() -> io::Result<IcmpTransport> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.set_nonblocking(true)?;
        Ok(IcmpTransport { inner: socket })
    }
}

impl DatagramTransport for IcmpTransport {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddrV4) -> io::Result<usize> {
        self.inner.send_to(buf, &SockAddr::from(SocketAddr::V4(addr)))
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
        // SAFETY: `recv_from` never reads from `buf` before it has been written by the OS, so
        // treating the `u8` slice as `MaybeUninit<u8>` here is sound.
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [std::mem::MaybeUninit<u8>]) };
        let (n, addr) = self.inner.recv_from(uninit)?;
        let ip = match addr.as_socket() {
            Some(SocketAddr::V4(v4)) => v4,
            _ => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        };
        Ok((n, ip))
    }

    fn raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// [`TransportFactory`] backed by real OS sockets.
pub struct OsTransportFactory {
    icmp: IcmpTransport,
}

impl OsTransportFactory {
    pub fn new() -> io::Result<OsTransportFactory> {
        Ok(OsTransportFactory { icmp: IcmpTransport::new()? })
    }
}

impl TransportFactory for OsTransportFactory {
    fn new_stream(&self) -> io::Result<Box<dyn StreamTransport>> {
        Ok(Box::new(TcpTransport::new()?))
    }

    fn new_datagram(&self) -> io::Result<Box<dyn DatagramTransport>> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))))?;
        Ok(Box::new(UdpTransport { inner: socket }))
    }

    fn icmp_socket(&self) -> &dyn DatagramTransport {
        &self.icmp
    }

    fn icmp_socket_mut(&mut self) -> &mut dyn DatagramTransport {
        &mut self.icmp
    }
}

#[cfg(test)]
pub(crate) mod mock;
