//! Thin `libc` wrappers for stream socket descriptors.

use std::{
    ffi::c_void,
    io::{Error, ErrorKind, Read, Result, Write},
    mem::size_of,
    net::SocketAddr,
    os::fd::RawFd,
};

use errno::errno;
use libc::*;
use os_socketaddr::OsSocketAddr;

use super::addr::AddressFamily;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: c_int = MSG_NOSIGNAL;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: c_int = 0;

fn would_block(code: i32) -> bool {
    code == EAGAIN || code == EWOULDBLOCK
}

/// Create a blocking stream socket for `family`.
pub fn stream_socket(family: AddressFamily) -> Result<RawFd> {
    let domain = match family {
        AddressFamily::IPv4 => AF_INET,
        AddressFamily::IPv6 => AF_INET6,
    };

    let fd = unsafe { socket(domain, SOCK_STREAM, IPPROTO_TCP) };

    if fd < 0 {
        return Err(Error::last_os_error());
    }

    unsafe {
        if fcntl(fd, F_SETFD, FD_CLOEXEC) < 0 {
            let err = Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
    }

    Ok(fd)
}

pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = fcntl(fd, F_GETFL);

        if flags < 0 {
            return Err(Error::last_os_error());
        }

        if fcntl(fd, F_SETFL, flags | O_NONBLOCK) < 0 {
            return Err(Error::last_os_error());
        }
    }

    Ok(())
}

pub fn is_cloexec(fd: RawFd) -> Result<bool> {
    let flags = unsafe { fcntl(fd, F_GETFD) };

    if flags < 0 {
        return Err(Error::last_os_error());
    }

    Ok(flags & FD_CLOEXEC != 0)
}

pub fn is_nonblocking(fd: RawFd) -> Result<bool> {
    let flags = unsafe { fcntl(fd, F_GETFL) };

    if flags < 0 {
        return Err(Error::last_os_error());
    }

    Ok(flags & O_NONBLOCK != 0)
}

fn set_flag(fd: RawFd, level: c_int, name: c_int) -> Result<()> {
    let on: c_int = 1;

    let ret = unsafe {
        setsockopt(
            fd,
            level,
            name,
            &on as *const c_int as *const c_void,
            size_of::<c_int>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(Error::last_os_error());
    }

    Ok(())
}

fn get_flag(fd: RawFd, level: c_int, name: c_int) -> Result<c_int> {
    let mut value: c_int = 0;

    let mut len = size_of::<c_int>() as socklen_t;

    let ret = unsafe {
        getsockopt(
            fd,
            level,
            name,
            &mut value as *mut c_int as *mut c_void,
            &mut len,
        )
    };

    if ret < 0 {
        return Err(Error::last_os_error());
    }

    Ok(value)
}

pub fn set_reuse_address(fd: RawFd) -> Result<()> {
    set_flag(fd, SOL_SOCKET, SO_REUSEADDR)
}

pub fn reuse_address_enabled(fd: RawFd) -> Result<bool> {
    get_flag(fd, SOL_SOCKET, SO_REUSEADDR).map(|v| v != 0)
}

/// Suppress `SIGPIPE` on writes to a broken connection.
///
/// Linux has no socket option for this, every [`send`] passes `MSG_NOSIGNAL` instead.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd"
))]
pub fn set_no_sigpipe(fd: RawFd) -> Result<()> {
    set_flag(fd, SOL_SOCKET, SO_NOSIGPIPE)
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd"
)))]
pub fn set_no_sigpipe(_fd: RawFd) -> Result<()> {
    Ok(())
}

/// Non-blocking mode, address reuse and broken-pipe suppression.
pub fn configure(fd: RawFd) -> Result<()> {
    set_nonblocking(fd)?;
    set_reuse_address(fd)?;
    set_no_sigpipe(fd)
}

pub fn bind(fd: RawFd, addr: SocketAddr) -> Result<()> {
    let addr: OsSocketAddr = addr.into();

    if unsafe { libc::bind(fd, addr.as_ptr(), addr.len()) } < 0 {
        return Err(Error::last_os_error());
    }

    Ok(())
}

pub fn listen(fd: RawFd, backlog: usize) -> Result<()> {
    if unsafe { libc::listen(fd, backlog.min(c_int::MAX as usize) as c_int) } < 0 {
        return Err(Error::last_os_error());
    }

    Ok(())
}

/// Start connecting. Returns `true` when already connected and `false` when
/// the connection is in progress.
pub fn connect(fd: RawFd, addr: SocketAddr) -> Result<bool> {
    let addr: OsSocketAddr = addr.into();

    if unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) } < 0 {
        let e = errno();

        if e.0 == EINPROGRESS || e.0 == EINTR || would_block(e.0) {
            return Ok(false);
        }

        if e.0 == EISCONN {
            return Ok(true);
        }

        return Err(Error::from_raw_os_error(e.0));
    }

    Ok(true)
}

/// Pending `SO_ERROR` of `fd`, if any.
pub fn take_error(fd: RawFd) -> Result<Option<Error>> {
    let code = get_flag(fd, SOL_SOCKET, SO_ERROR)?;

    if code != 0 {
        return Ok(Some(Error::from_raw_os_error(code)));
    }

    Ok(None)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn accept_cloexec(fd: RawFd, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    unsafe { accept4(fd, addr, len, SOCK_CLOEXEC) }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn accept_cloexec(fd: RawFd, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    let conn_fd = unsafe { libc::accept(fd, addr, len) };

    if conn_fd >= 0 && unsafe { fcntl(conn_fd, F_SETFD, FD_CLOEXEC) } < 0 {
        // keep errno of the failed fcntl for the caller
        let e = errno();
        unsafe { libc::close(conn_fd) };
        errno::set_errno(e);
        return -1;
    }

    conn_fd
}

/// Accept one connection with `FD_CLOEXEC` set. `None` means no connection is waiting.
pub fn accept(fd: RawFd) -> Result<Option<(RawFd, Option<SocketAddr>)>> {
    let mut remote = [0u8; size_of::<sockaddr_in6>()];

    let mut len = remote.len() as socklen_t;

    let conn_fd = accept_cloexec(fd, remote.as_mut_ptr() as *mut sockaddr, &mut len);

    if conn_fd < 0 {
        let e = errno();

        if would_block(e.0) || e.0 == EINTR || e.0 == ECONNABORTED {
            return Ok(None);
        }

        return Err(Error::from_raw_os_error(e.0));
    }

    let peer = unsafe { OsSocketAddr::copy_from_raw(remote.as_ptr() as *const sockaddr, len) }
        .into_addr();

    log::trace!(target:"tcp_socket", "fd({}) accept connection({}) from ({:?})", fd, conn_fd, peer);

    Ok(Some((conn_fd, peer)))
}

fn sock_name(
    fd: RawFd,
    f: unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int,
) -> Result<SocketAddr> {
    let mut buff = [0u8; size_of::<sockaddr_in6>()];

    let mut len = buff.len() as socklen_t;

    if unsafe { f(fd, buff.as_mut_ptr() as *mut sockaddr, &mut len) } < 0 {
        return Err(Error::last_os_error());
    }

    let addr = unsafe { OsSocketAddr::copy_from_raw(buff.as_ptr() as *const sockaddr, len) };

    addr.into_addr()
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "unsupported address family"))
}

pub fn local_addr(fd: RawFd) -> Result<SocketAddr> {
    sock_name(fd, getsockname)
}

pub fn peer_addr(fd: RawFd) -> Result<SocketAddr> {
    sock_name(fd, getpeername)
}

/// Bytes readable without blocking.
pub fn bytes_available(fd: RawFd) -> Result<usize> {
    let mut available: c_int = 0;

    if unsafe { ioctl(fd, FIONREAD, &mut available as *mut c_int) } < 0 {
        return Err(Error::last_os_error());
    }

    Ok(available.max(0) as usize)
}

pub fn recv(fd: RawFd, buff: &mut [u8]) -> Result<usize> {
    let len = unsafe { libc::recv(fd, buff.as_mut_ptr() as *mut c_void, buff.len(), 0) };

    if len < 0 {
        return Err(Error::last_os_error());
    }

    log::trace!(target:"tcp_socket", "fd({}) recv {}", fd, len);

    Ok(len as usize)
}

pub fn send(fd: RawFd, buff: &[u8]) -> Result<usize> {
    let len = unsafe { libc::send(fd, buff.as_ptr() as *const c_void, buff.len(), SEND_FLAGS) };

    if len < 0 {
        return Err(Error::last_os_error());
    }

    log::trace!(target:"tcp_socket", "fd({}) send {}", fd, len);

    Ok(len as usize)
}

/// Peek one byte to tell an orderly shutdown from a spurious wake-up.
///
/// `Ok(true)` when the peer has shut down its side and nothing is left to
/// read, `Ok(false)` when the descriptor is still readable later. A reset or
/// any other pending socket error comes back as `Err`.
pub fn peer_closed(fd: RawFd) -> Result<bool> {
    let mut peeked = [0u8; 1];

    let len = unsafe {
        libc::recv(
            fd,
            peeked.as_mut_ptr() as *mut c_void,
            peeked.len(),
            MSG_PEEK | MSG_DONTWAIT,
        )
    };

    if len < 0 {
        let e = errno();

        if would_block(e.0) || e.0 == EINTR {
            return Ok(false);
        }

        return Err(Error::from_raw_os_error(e.0));
    }

    Ok(len == 0)
}

pub fn close(fd: RawFd) -> Result<()> {
    log::trace!(target:"tcp_socket", "close fd({})", fd);

    if unsafe { libc::close(fd) } < 0 {
        return Err(Error::last_os_error());
    }

    Ok(())
}

/// [`Read`] adapter over a raw descriptor.
#[derive(Debug, Clone, Copy)]
pub struct FdReader(pub RawFd);

impl Read for FdReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        recv(self.0, buf)
    }
}

/// [`Write`] adapter over a raw descriptor.
#[derive(Debug, Clone, Copy)]
pub struct FdWriter(pub RawFd);

impl Write for FdWriter {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        send(self.0, buf)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
