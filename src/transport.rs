//! Raw `AF_PACKET`/`SOCK_RAW` Ethernet transport, bound to a single
//! interface.
//!
//! This is the only place in the crate that makes direct syscalls; the
//! core (pib/frame/device/dispatcher) only ever sees byte slices. Frames
//! are delivered and sent whole, including the 12-byte Ethernet header —
//! the dispatcher is responsible for reading/writing that header.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

use thiserror::Error;

/// Errors from raw-socket setup or I/O.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to create raw socket: {0}")]
    Socket(#[source] io::Error),
    #[error("interface name {0:?} contains an interior NUL")]
    BadInterfaceName(String),
    #[error("failed to resolve interface index for {iface:?}: {source}")]
    Ifindex {
        iface: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind to interface {iface:?}: {source}")]
    Bind {
        iface: String,
        #[source]
        source: io::Error,
    },
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("recv failed: {0}")]
    Recv(#[source] io::Error),
}

/// EtherType used in the `AF_PACKET` bind/send path (`ETH_P_ALL`, network byte order).
const ETH_P_ALL: u16 = 0x0003;

/// The frame I/O surface the dispatcher needs. Lets `Dispatcher` own a
/// transport without hard-coding `RawTransport`, so tests can substitute an
/// in-memory mock instead of binding a real `AF_PACKET` socket.
pub trait FrameTransport: Send + Sync {
    /// Send a whole frame (destination/source MAC already prepended).
    fn send(&self, frame: &[u8]) -> Result<(), TransportError>;
    /// Block for up to `timeout` waiting for the socket to become readable.
    fn wait_readable(&self, timeout: Duration) -> Result<bool, TransportError>;
    /// Receive one frame into `buf`, returning the number of bytes read.
    fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// A raw Ethernet transport bound to one interface.
pub struct RawTransport {
    fd: RawFd,
}

impl RawTransport {
    /// Open a raw socket and bind it to `ifname`.
    pub fn bind(ifname: &str) -> Result<Self, TransportError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (ETH_P_ALL as i32).to_be() as i32,
            )
        };
        if fd < 0 {
            return Err(TransportError::Socket(io::Error::last_os_error()));
        }

        let ifindex = interface_index(ifname)?;

        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = (ETH_P_ALL as i32).to_be() as u16;
        addr.sll_ifindex = ifindex;

        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as u32,
            )
        };
        if ret < 0 {
            let source = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(TransportError::Bind {
                iface: ifname.to_string(),
                source,
            });
        }

        Ok(RawTransport { fd })
    }

    /// The raw file descriptor, for use with `select`/`poll` in the run loop.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Block for up to `timeout` waiting for the socket to become
    /// readable. Returns `true` if it is.
    pub fn wait_readable(&self, timeout: Duration) -> Result<bool, TransportError> {
        let mut read_fds: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_fds);
            libc::FD_SET(self.fd, &mut read_fds);
        }
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };

        let ret = unsafe {
            libc::select(
                self.fd + 1,
                &mut read_fds,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut tv,
            )
        };
        if ret < 0 {
            return Err(TransportError::Recv(io::Error::last_os_error()));
        }
        Ok(ret > 0)
    }

    /// Receive one frame into `buf`, returning the number of bytes read.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            return Err(TransportError::Recv(io::Error::last_os_error()));
        }
        Ok(n as usize)
    }

    /// Send a whole frame (destination/source MAC already prepended).
    pub fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let n = unsafe {
            libc::send(
                self.fd,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
            )
        };
        if n < 0 {
            return Err(TransportError::Send(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for RawTransport {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl FrameTransport for RawTransport {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        RawTransport::send(self, frame)
    }

    fn wait_readable(&self, timeout: Duration) -> Result<bool, TransportError> {
        RawTransport::wait_readable(self, timeout)
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        RawTransport::recv(self, buf)
    }
}

fn interface_index(ifname: &str) -> Result<i32, TransportError> {
    let cname = CString::new(ifname)
        .map_err(|_| TransportError::BadInterfaceName(ifname.to_string()))?;
    let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if idx == 0 {
        return Err(TransportError::Ifindex {
            iface: ifname.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(idx as i32)
}
