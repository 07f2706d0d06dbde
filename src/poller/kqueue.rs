use std::{
    collections::HashMap,
    io::{self, Error, Result},
    os::fd::RawFd,
    ptr::null_mut,
    sync::Mutex,
    time::Duration,
};

use libc::*;

use super::{FdInterest, PollEvent, WakePipe};

/// Level-triggered `kqueue` instance.
#[derive(Debug)]
pub struct SysPoller {
    kq_handle: RawFd,
    wake: WakePipe,
    registered: Mutex<HashMap<RawFd, FdInterest>>,
}

impl Drop for SysPoller {
    fn drop(&mut self) {
        log::debug!(target:"poller", "close kqueue handle({})", self.kq_handle);
        unsafe { close(self.kq_handle) };
    }
}

fn change(fd: RawFd, filter: i16, flags: u16) -> kevent {
    let mut event: kevent = unsafe { std::mem::zeroed() };

    event.ident = fd as _;
    event.filter = filter as _;
    event.flags = flags as _;
    event.udata = null_mut();

    event
}

impl SysPoller {
    pub fn new() -> Result<Self> {
        let kq_handle = unsafe { kqueue() };

        if kq_handle < 0 {
            return Err(Error::last_os_error());
        }

        let wake = match WakePipe::new() {
            Ok(wake) => wake,
            Err(err) => {
                unsafe { close(kq_handle) };
                return Err(err);
            }
        };

        let changes = [change(wake.reader, EVFILT_READ, EV_ADD | EV_ENABLE)];

        let ret = unsafe {
            kevent(
                kq_handle,
                changes.as_ptr(),
                changes.len() as c_int,
                null_mut(),
                0,
                std::ptr::null(),
            )
        };

        if ret < 0 {
            let err = Error::last_os_error();
            unsafe { close(kq_handle) };
            return Err(err);
        }

        Ok(Self {
            kq_handle,
            wake,
            registered: Default::default(),
        })
    }

    /// Interrupt a concurrent [`poll_once`](Self::poll_once) call.
    pub fn wake(&self) {
        self.wake.notify();
    }

    /// Drop every filter of `fd`. Must run before `fd` is closed, a reused
    /// descriptor number otherwise inherits the stale entry.
    pub fn deregister(&self, fd: RawFd) {
        let current = self
            .registered
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .remove(&fd);

        let Some(current) = current else {
            return;
        };

        let mut changes = vec![];

        if current.readable {
            changes.push(change(fd, EVFILT_READ, EV_DELETE));
        }

        if current.writable {
            changes.push(change(fd, EVFILT_WRITE, EV_DELETE));
        }

        let ret = unsafe {
            kevent(
                self.kq_handle,
                changes.as_ptr(),
                changes.len() as c_int,
                null_mut(),
                0,
                std::ptr::null(),
            )
        };

        if ret < 0 {
            log::trace!(target:"poller", "kevent delete fd({}) {}", fd, Error::last_os_error());
        }
    }

    fn collect_changes(&self, interests: &HashMap<RawFd, FdInterest>) -> Vec<kevent> {
        let mut registered = self
            .registered
            .lock()
            .unwrap_or_else(|err| err.into_inner());

        let mut changes = vec![];

        let mut push = |fd: RawFd, filter: i16, before: bool, after: bool| {
            if before == after {
                return;
            }

            let flags = if after { EV_ADD | EV_ENABLE } else { EV_DELETE };

            changes.push(change(fd, filter, flags));
        };

        for (fd, current) in registered.iter() {
            let wanted = interests.get(fd).cloned().unwrap_or_default();

            push(*fd, EVFILT_READ, current.readable, wanted.readable);
            push(*fd, EVFILT_WRITE, current.writable, wanted.writable);
        }

        for (fd, wanted) in interests {
            if !registered.contains_key(fd) {
                push(*fd, EVFILT_READ, false, wanted.readable);
                push(*fd, EVFILT_WRITE, false, wanted.writable);
            }
        }

        registered.clear();

        for (fd, wanted) in interests {
            if !wanted.is_empty() {
                registered.insert(*fd, *wanted);
            }
        }

        changes
    }

    /// Apply `interests` and wait up to `timeout` for readiness.
    pub fn poll_once(
        &self,
        interests: &HashMap<RawFd, FdInterest>,
        max_events: usize,
        timeout: Duration,
    ) -> Result<Vec<PollEvent>> {
        let changes = self.collect_changes(interests);

        // Room for per-change error receipts plus fired events.
        let mut fired_events: Vec<kevent> =
            vec![unsafe { std::mem::zeroed() }; max_events.max(1) + changes.len()];

        let timeout = timespec {
            tv_sec: timeout.as_secs() as _,
            tv_nsec: timeout.subsec_nanos() as _,
        };

        let fired = unsafe {
            kevent(
                self.kq_handle,
                changes.as_ptr(),
                changes.len() as c_int,
                fired_events.as_mut_ptr(),
                fired_events.len() as c_int,
                &timeout,
            )
        };

        if fired < 0 {
            let err = Error::last_os_error();

            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(vec![]);
            }

            return Err(err);
        }

        let mut ret = Vec::with_capacity(fired as usize);

        for event in &fired_events[..fired as usize] {
            let fd = event.ident as RawFd;

            if event.flags & EV_ERROR != 0 {
                // Changes against already closed fds land here.
                log::trace!(target:"poller", "fd({}) fired error,{}", fd, Error::from_raw_os_error(event.data as i32));
                continue;
            }

            if fd == self.wake.reader {
                self.wake.drain();
                continue;
            }

            let data = Some(event.data.max(0) as usize);

            match event.filter {
                EVFILT_READ => ret.push(PollEvent::Readable(fd, data)),
                EVFILT_WRITE => ret.push(PollEvent::Writable(fd, data)),
                _ => {
                    continue;
                }
            }
        }

        log::trace!(target:"poller", "raised {:?}", ret);

        Ok(ret)
    }
}
