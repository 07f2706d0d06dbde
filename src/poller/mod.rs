//! OS readiness primitive. `epoll` on linux, `kqueue` on the BSD family.

#[cfg_attr(any(target_os = "linux", target_os = "android"), path = "epoll.rs")]
#[cfg_attr(target_os = "macos", path = "kqueue.rs")]
#[cfg_attr(target_os = "ios", path = "kqueue.rs")]
#[cfg_attr(target_os = "freebsd", path = "kqueue.rs")]
mod impls;

use std::{
    fmt::Display,
    io::{Error, Result},
    os::fd::RawFd,
};

pub use impls::*;

/// Interest registered for one descriptor during a poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FdInterest {
    pub readable: bool,
    pub writable: bool,
}

impl FdInterest {
    pub fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }
}

/// Fired readiness. The optional payload is the count the OS reported with
/// the event (pending connections, readable bytes or writable space), when
/// the backend provides one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    Readable(RawFd, Option<usize>),
    Writable(RawFd, Option<usize>),
}

impl PollEvent {
    pub fn fd(&self) -> RawFd {
        match self {
            Self::Readable(fd, _) | Self::Writable(fd, _) => *fd,
        }
    }
}

impl Display for PollEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Readable(v, data) => {
                write!(f, "PollEvent readable({}, {:?})", v, data)
            }
            Self::Writable(v, data) => {
                write!(f, "PollEvent writable({}, {:?})", v, data)
            }
        }
    }
}

/// Self-pipe used to interrupt a blocking poll call.
#[derive(Debug)]
pub(crate) struct WakePipe {
    pub(crate) reader: RawFd,
    writer: RawFd,
}

impl WakePipe {
    pub(crate) fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];

        unsafe {
            if libc::pipe(fds.as_mut_ptr()) < 0 {
                return Err(Error::last_os_error());
            }

            for fd in fds {
                let flags = libc::fcntl(fd, libc::F_GETFL);

                if flags < 0
                    || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0
                    || libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0
                {
                    let err = Error::last_os_error();
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                    return Err(err);
                }
            }
        }

        Ok(Self {
            reader: fds[0],
            writer: fds[1],
        })
    }

    pub(crate) fn notify(&self) {
        let one = [1u8];

        // A full pipe already guarantees a pending wake-up.
        unsafe { libc::write(self.writer, one.as_ptr() as *const libc::c_void, 1) };
    }

    pub(crate) fn drain(&self) {
        let mut buff = [0u8; 64];

        loop {
            let len = unsafe {
                libc::read(
                    self.reader,
                    buff.as_mut_ptr() as *mut libc::c_void,
                    buff.len(),
                )
            };

            if len <= 0 {
                break;
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.reader);
            libc::close(self.writer);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use super::*;

    fn socket_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];

        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };

        assert_eq!(ret, 0);

        (fds[0], fds[1])
    }

    #[test]
    fn test_readable_after_write() {
        _ = pretty_env_logger::try_init();

        let poller = SysPoller::new().unwrap();

        let (left, right) = socket_pair();

        let mut interests = HashMap::new();

        interests.insert(
            left,
            FdInterest {
                readable: true,
                writable: false,
            },
        );

        let events = poller
            .poll_once(&interests, 16, Duration::from_millis(10))
            .unwrap();

        assert!(events.is_empty());

        let buff = b"hello";

        unsafe { libc::write(right, buff.as_ptr() as *const libc::c_void, buff.len()) };

        let events = poller
            .poll_once(&interests, 16, Duration::from_millis(500))
            .unwrap();

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], PollEvent::Readable(fd, _) if fd == left));

        unsafe {
            libc::close(left);
            libc::close(right);
        }
    }

    #[test]
    fn test_wake_interrupts_poll() {
        let poller = SysPoller::new().unwrap();

        poller.wake();

        let now = std::time::Instant::now();

        let events = poller
            .poll_once(&HashMap::new(), 16, Duration::from_secs(5))
            .unwrap();

        assert!(events.is_empty());
        assert!(now.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_dropped_interest_is_deregistered() {
        let poller = SysPoller::new().unwrap();

        let (left, right) = socket_pair();

        let mut interests = HashMap::new();

        interests.insert(
            left,
            FdInterest {
                readable: false,
                writable: true,
            },
        );

        let events = poller
            .poll_once(&interests, 16, Duration::from_millis(500))
            .unwrap();

        assert!(matches!(events[..], [PollEvent::Writable(fd, _)] if fd == left));

        let events = poller
            .poll_once(&HashMap::new(), 16, Duration::from_millis(10))
            .unwrap();

        assert!(events.is_empty());

        unsafe {
            libc::close(left);
            libc::close(right);
        }
    }
}
