use std::{
    collections::HashMap,
    io::{Error, Result},
    os::fd::RawFd,
    ptr::null_mut,
    sync::Mutex,
    time::Duration,
};

use errno::errno;
use libc::*;

use super::{FdInterest, PollEvent, WakePipe};

/// Level-triggered `epoll` instance.
#[derive(Debug)]
pub struct SysPoller {
    handle: RawFd,
    wake: WakePipe,
    registered: Mutex<HashMap<RawFd, u32>>,
}

impl Drop for SysPoller {
    fn drop(&mut self) {
        log::debug!(target:"poller", "close epoll handle({})", self.handle);
        unsafe { close(self.handle) };
    }
}

impl SysPoller {
    pub fn new() -> Result<Self> {
        let handle = unsafe { epoll_create1(EPOLL_CLOEXEC) };

        if -1 == handle {
            return Err(Error::last_os_error());
        }

        let wake = match WakePipe::new() {
            Ok(wake) => wake,
            Err(err) => {
                unsafe { close(handle) };
                return Err(err);
            }
        };

        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: wake.reader as u64,
        };

        if unsafe { epoll_ctl(handle, EPOLL_CTL_ADD, wake.reader, &mut event) } == -1 {
            let err = Error::last_os_error();
            unsafe { close(handle) };
            return Err(err);
        }

        Ok(Self {
            handle,
            wake,
            registered: Default::default(),
        })
    }

    /// Interrupt a concurrent [`poll_once`](Self::poll_once) call.
    pub fn wake(&self) {
        self.wake.notify();
    }

    fn ctl(&self, op: c_int, fd: RawFd, events: u32) -> Result<()> {
        let mut event = epoll_event {
            events,
            u64: fd as u64,
        };

        let event_ptr = if op == EPOLL_CTL_DEL {
            null_mut()
        } else {
            &mut event as *mut epoll_event
        };

        if unsafe { epoll_ctl(self.handle, op, fd, event_ptr) } == -1 {
            return Err(Error::last_os_error());
        }

        Ok(())
    }

    /// Drop every registration of `fd`. Must run before `fd` is closed, a
    /// reused descriptor number otherwise inherits the stale entry.
    pub fn deregister(&self, fd: RawFd) {
        let mut registered = self
            .registered
            .lock()
            .unwrap_or_else(|err| err.into_inner());

        if registered.remove(&fd).is_some() {
            if let Err(err) = self.ctl(EPOLL_CTL_DEL, fd, 0) {
                log::trace!(target:"poller", "epoll_ctl del fd({}) {}", fd, err);
            }
        }
    }

    fn sync_interests(&self, interests: &HashMap<RawFd, FdInterest>) {
        let mut registered = self
            .registered
            .lock()
            .unwrap_or_else(|err| err.into_inner());

        let stale: Vec<RawFd> = registered
            .keys()
            .filter(|fd| !interests.contains_key(fd))
            .cloned()
            .collect();

        for fd in stale {
            registered.remove(&fd);

            // Closed fds are removed by the kernel already.
            if let Err(err) = self.ctl(EPOLL_CTL_DEL, fd, 0) {
                log::trace!(target:"poller", "epoll_ctl del fd({}) {}", fd, err);
            }
        }

        for (fd, interest) in interests {
            if interest.is_empty() {
                continue;
            }

            let mut events = 0u32;

            if interest.readable {
                events |= EPOLLIN as u32;
            }

            if interest.writable {
                events |= EPOLLOUT as u32;
            }

            let result = match registered.get(fd) {
                Some(current) if *current == events => continue,
                Some(_) => self.ctl(EPOLL_CTL_MOD, *fd, events).or_else(|err| {
                    if err.raw_os_error() == Some(ENOENT) {
                        self.ctl(EPOLL_CTL_ADD, *fd, events)
                    } else {
                        Err(err)
                    }
                }),
                None => self.ctl(EPOLL_CTL_ADD, *fd, events).or_else(|err| {
                    if err.raw_os_error() == Some(EEXIST) {
                        self.ctl(EPOLL_CTL_MOD, *fd, events)
                    } else {
                        Err(err)
                    }
                }),
            };

            match result {
                Ok(_) => {
                    registered.insert(*fd, events);
                }
                Err(err) => {
                    log::error!(target:"poller", "register fd({}) events({:#x}) error, {}", fd, events, err);
                    registered.remove(fd);
                }
            }
        }
    }

    /// Apply `interests` and wait up to `timeout` for readiness.
    pub fn poll_once(
        &self,
        interests: &HashMap<RawFd, FdInterest>,
        max_events: usize,
        timeout: Duration,
    ) -> Result<Vec<PollEvent>> {
        self.sync_interests(interests);

        let mut fired_events: Vec<epoll_event> =
            vec![unsafe { std::mem::zeroed() }; max_events.max(1)];

        let timeout = timeout.as_millis().min(c_int::MAX as u128) as c_int;

        let fired = unsafe {
            epoll_wait(
                self.handle,
                fired_events.as_mut_ptr(),
                fired_events.len() as c_int,
                timeout,
            )
        };

        if fired < 0 {
            let e = errno();

            if e.0 == EINTR {
                return Ok(vec![]);
            }

            log::debug!(target:"poller", "epoll_wait error({})", e);

            return Err(Error::from_raw_os_error(e.0));
        }

        let mut events = Vec::with_capacity(fired as usize);

        for event in &fired_events[..fired as usize] {
            let fd = event.u64 as RawFd;

            if fd == self.wake.reader {
                self.wake.drain();
                continue;
            }

            let flags = event.events;

            let hangup = flags & (EPOLLHUP | EPOLLERR) as u32 != 0;

            if flags & EPOLLIN as u32 != 0 || hangup {
                events.push(PollEvent::Readable(fd, None));
            }

            if flags & EPOLLOUT as u32 != 0 || hangup {
                events.push(PollEvent::Writable(fd, None));
            }
        }

        log::trace!(target:"poller", "raised {:?}", events);

        Ok(events)
    }
}
