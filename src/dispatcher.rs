//! Readiness dispatcher.
//!
//! Watches descriptors through the platform [`SysPoller`] and delivers
//! [`Readiness`] notifications onto the [`SerialQueue`] each [`Watcher`] was
//! registered with.
//!
//! Notifications are level-triggered and coalesced: a fired watcher is
//! disarmed until its handler has returned on its queue, then re-armed. So at
//! most one notification per watcher is in flight, and a condition that is
//! still true after the handler ran fires again on the next poll cycle.

use std::{
    collections::HashMap,
    fmt::{Debug, Display},
    io::Result,
    os::fd::RawFd,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    thread,
    time::Duration,
};

use futures::executor::ThreadPool;
use once_cell::sync::OnceCell;

use crate::{
    config::DispatcherConfig,
    locked,
    net::sys,
    poller::{FdInterest, PollEvent, SysPoller},
    queue::SerialQueue,
};

/// Kind of readiness a [`Watcher`] observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    /// Listening descriptor has connections waiting.
    Accept,
    /// Connected descriptor has bytes to read, or reached end of stream.
    Read,
    /// Descriptor can be written without blocking.
    Write,
}

/// Notification delivered to a watcher handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Pending connection count, at least one.
    AcceptReady(usize),
    /// Bytes available to read. Zero means end of stream or a spurious wake-up.
    ReadReady(usize),
    /// Writable space as reported by the OS, at least one.
    WriteReady(usize),
    /// Last notification of a canceled watcher.
    Canceled,
}

impl Display for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AcceptReady(v) => write!(f, "accept ready({})", v),
            Self::ReadReady(v) => write!(f, "read ready({})", v),
            Self::WriteReady(v) => write!(f, "write ready({})", v),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

type Handler = Box<dyn FnMut(Readiness) + Send + 'static>;

struct Registration {
    fd: RawFd,
    interest: Interest,
    queue: SerialQueue,
    handler: Arc<Mutex<Handler>>,
    canceled: Arc<AtomicBool>,
    armed: bool,
    enabled: bool,
    oneshot: bool,
}

impl Registration {
    fn is_live(&self) -> bool {
        self.armed && self.enabled && !self.canceled.load(Ordering::SeqCst)
    }
}

struct DispatcherInner {
    config: DispatcherConfig,
    poller: SysPoller,
    pool: ThreadPool,
    registrations: Mutex<HashMap<u64, Registration>>,
    next_id: AtomicU64,
    polling: Mutex<()>,
    started: AtomicBool,
}

impl DispatcherInner {
    fn interests(&self) -> HashMap<RawFd, FdInterest> {
        let registrations = locked(&self.registrations);

        let mut interests = HashMap::<RawFd, FdInterest>::new();

        for registration in registrations.values().filter(|r| r.is_live()) {
            let interest = interests.entry(registration.fd).or_default();

            match registration.interest {
                Interest::Accept | Interest::Read => interest.readable = true,
                Interest::Write => interest.writable = true,
            }
        }

        interests
    }

    fn rearm(&self, id: u64) {
        if let Some(registration) = locked(&self.registrations).get_mut(&id) {
            registration.armed = true;
        }

        self.poller.wake();
    }
}

/// Readiness dispatcher handle, cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("watchers", &self.watchers())
            .finish()
    }
}

static SHARED: OnceCell<Dispatcher> = OnceCell::new();

impl Dispatcher {
    /// Create new dispatcher. No poll thread is running until [`start`](Self::start) is called,
    /// [`poll_once`](Self::poll_once) may be driven manually instead.
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        let poller = SysPoller::new()?;

        let pool = ThreadPool::builder()
            .pool_size(config.worker_threads)
            .name_prefix("dispatch-socket-queue-")
            .create()?;

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                config,
                poller,
                pool,
                registrations: Default::default(),
                next_id: AtomicU64::new(1),
                polling: Default::default(),
                started: AtomicBool::new(false),
            }),
        })
    }

    /// Process wide dispatcher with a running poll thread.
    pub fn shared() -> Result<Self> {
        SHARED
            .get_or_try_init(|| {
                let dispatcher = Dispatcher::new(DispatcherConfig::default())?;

                dispatcher.start()?;

                Ok(dispatcher)
            })
            .cloned()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Spawn the background poll thread. Calling it again is a no-op.
    ///
    /// The thread only holds a weak reference and exits once every
    /// dispatcher handle is gone.
    pub fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);

        let timeout = self.inner.config.poll_timeout;

        let spawned = thread::Builder::new()
            .name("dispatch-socket-poller".into())
            .spawn(move || loop {
                let Some(inner) = weak.upgrade() else {
                    log::debug!(target:"dispatcher", "dispatcher released, poll thread exit");
                    break;
                };

                let dispatcher = Dispatcher { inner };

                if let Err(err) = dispatcher.poll_once(timeout) {
                    log::error!(target:"dispatcher", "poll_once error, {}", err);
                    thread::sleep(timeout);
                }
            });

        if let Err(err) = spawned {
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(err);
        }

        Ok(())
    }

    /// Create new serialized queue executing on this dispatcher's worker pool.
    pub fn queue(&self, label: impl Into<String>) -> SerialQueue {
        SerialQueue::new(label, &self.inner.pool)
    }

    /// Get the count of live watcher registrations.
    pub fn watchers(&self) -> usize {
        locked(&self.inner.registrations).len()
    }

    /// Register `handler` for `interest` on `fd`. Notifications run on `queue`.
    pub fn watch<F>(&self, fd: RawFd, interest: Interest, queue: &SerialQueue, handler: F) -> Watcher
    where
        F: FnMut(Readiness) + Send + 'static,
    {
        self.register(fd, interest, queue, Box::new(handler), false)
    }

    /// Like [`watch`](Self::watch) but fires at most once. The registration
    /// stays until the returned watcher is canceled.
    pub fn watch_once<F>(
        &self,
        fd: RawFd,
        interest: Interest,
        queue: &SerialQueue,
        handler: F,
    ) -> Watcher
    where
        F: FnMut(Readiness) + Send + 'static,
    {
        self.register(fd, interest, queue, Box::new(handler), true)
    }

    fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        queue: &SerialQueue,
        handler: Handler,
        oneshot: bool,
    ) -> Watcher {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);

        let canceled = Arc::new(AtomicBool::new(false));

        locked(&self.inner.registrations).insert(
            id,
            Registration {
                fd,
                interest,
                queue: queue.clone(),
                handler: Arc::new(Mutex::new(handler)),
                canceled: canceled.clone(),
                armed: true,
                enabled: true,
                oneshot,
            },
        );

        log::trace!(target:"dispatcher", "watch fd({}) {:?} id({}) on queue({})", fd, interest, id, queue.label());

        self.inner.poller.wake();

        Watcher {
            id,
            fd,
            interest,
            canceled,
            dispatcher: Arc::downgrade(&self.inner),
        }
    }

    /// Run one poll cycle and dispatch fired notifications onto their queues.
    /// Returns the number of dispatched notifications.
    pub fn poll_once(&self, timeout: Duration) -> Result<usize> {
        let _polling = locked(&self.inner.polling);

        let interests = self.inner.interests();

        let events =
            self.inner
                .poller
                .poll_once(&interests, self.inner.config.max_events, timeout)?;

        if events.is_empty() {
            return Ok(0);
        }

        let mut registrations = locked(&self.inner.registrations);

        let mut by_fd = HashMap::<RawFd, Vec<u64>>::new();

        for (id, registration) in registrations.iter() {
            if registration.is_live() {
                by_fd.entry(registration.fd).or_default().push(*id);
            }
        }

        let mut fired = 0;

        for event in events {
            let Some(ids) = by_fd.get(&event.fd()) else {
                continue;
            };

            for id in ids {
                let Some(registration) = registrations.get_mut(id) else {
                    continue;
                };

                if !registration.is_live() {
                    continue;
                }

                let readiness = match (event, registration.interest) {
                    (PollEvent::Readable(_, data), Interest::Accept) => {
                        Readiness::AcceptReady(data.unwrap_or(1).max(1))
                    }
                    (PollEvent::Readable(fd, data), Interest::Read) => {
                        let available = match data {
                            Some(available) => available,
                            None => sys::bytes_available(fd).unwrap_or(0),
                        };

                        Readiness::ReadReady(available)
                    }
                    (PollEvent::Writable(_, data), Interest::Write) => {
                        Readiness::WriteReady(data.unwrap_or(1).max(1))
                    }
                    _ => continue,
                };

                registration.armed = false;

                let task = notification(
                    Arc::downgrade(&self.inner),
                    *id,
                    registration,
                    readiness,
                );

                if registration.queue.dispatch_async(task) {
                    fired += 1;
                } else {
                    log::warn!(target:"dispatcher", "queue({}) closed, drop {} for fd({})", registration.queue.label(), readiness, registration.fd);
                }
            }
        }

        log::trace!(target:"dispatcher", "poll_once({})", fired);

        Ok(fired)
    }
}

fn notification(
    dispatcher: Weak<DispatcherInner>,
    id: u64,
    registration: &Registration,
    readiness: Readiness,
) -> impl FnOnce() + Send + 'static {
    let handler = registration.handler.clone();
    let canceled = registration.canceled.clone();
    let oneshot = registration.oneshot;

    move || {
        // Canceled after this notification was queued.
        if canceled.load(Ordering::SeqCst) {
            return;
        }

        {
            let mut handler = locked(&handler);
            (handler)(readiness);
        }

        if !oneshot && !canceled.load(Ordering::SeqCst) {
            if let Some(dispatcher) = dispatcher.upgrade() {
                dispatcher.rearm(id);
            }
        }
    }
}

/// Cancelable readiness registration. Dropping it cancels the registration.
pub struct Watcher {
    id: u64,
    fd: RawFd,
    interest: Interest,
    canceled: Arc<AtomicBool>,
    dispatcher: Weak<DispatcherInner>,
}

impl Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("interest", &self.interest)
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

impl Watcher {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Cancel the registration. Idempotent.
    ///
    /// Cancel before closing the descriptor: the registration and, if it was
    /// the last one on the descriptor, the OS level interest are removed
    /// before this returns, so no new
    /// notification is dispatched for it. Notifications already queued are
    /// skipped, and the handler receives [`Readiness::Canceled`] on its queue
    /// before it is released.
    pub fn cancel(&self) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return;
        };

        let registration = {
            let mut registrations = locked(&dispatcher.registrations);

            let registration = registrations.remove(&self.id);

            if !registrations.values().any(|r| r.fd == self.fd) {
                dispatcher.poller.deregister(self.fd);
            }

            registration
        };

        dispatcher.poller.wake();

        if let Some(registration) = registration {
            log::trace!(target:"dispatcher", "cancel fd({}) {:?} id({})", self.fd, self.interest, self.id);

            let handler = registration.handler;

            registration.queue.dispatch_async(move || {
                let mut handler = locked(&handler);
                (handler)(Readiness::Canceled);
            });
        }
    }

    /// Stop observing readiness without canceling.
    pub fn suspend(&self) {
        self.set_enabled(false)
    }

    /// Resume a [`suspend`](Self::suspend)ed watcher.
    pub fn resume(&self) {
        self.set_enabled(true)
    }

    fn set_enabled(&self, enabled: bool) {
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return;
        };

        if let Some(registration) = locked(&dispatcher.registrations).get_mut(&self.id) {
            registration.enabled = enabled;
        }

        dispatcher.poller.wake();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::executor::block_on;

    use super::*;

    fn socket_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];

        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };

        assert_eq!(ret, 0);

        (fds[0], fds[1])
    }

    fn send(fd: RawFd, buff: &[u8]) {
        let len = unsafe { libc::write(fd, buff.as_ptr() as *const libc::c_void, buff.len()) };

        assert_eq!(len, buff.len() as isize);
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(DispatcherConfig::default().with_worker_threads(2)).unwrap()
    }

    #[test]
    fn test_read_ready_reports_available() {
        _ = pretty_env_logger::try_init();

        let dispatcher = dispatcher();

        let queue = dispatcher.queue("read");

        let (left, right) = socket_pair();

        let seen = Arc::new(Mutex::new(vec![]));

        let handler_seen = seen.clone();

        let watcher = dispatcher.watch(left, Interest::Read, &queue, move |readiness| {
            handler_seen.lock().unwrap().push(readiness);
        });

        assert_eq!(dispatcher.watchers(), 1);

        send(right, b"hello");

        assert_eq!(dispatcher.poll_once(Duration::from_secs(1)).unwrap(), 1);

        block_on(queue.barrier());

        assert_eq!(*seen.lock().unwrap(), vec![Readiness::ReadReady(5)]);

        watcher.cancel();

        block_on(queue.barrier());

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Readiness::ReadReady(5), Readiness::Canceled]
        );
        assert_eq!(dispatcher.watchers(), 0);

        unsafe {
            libc::close(left);
            libc::close(right);
        }
    }

    #[test]
    fn test_unconsumed_readiness_fires_again() {
        let dispatcher = dispatcher();

        let queue = dispatcher.queue("level");

        let (left, right) = socket_pair();

        let counter = Arc::new(AtomicUsize::new(0));

        let handler_counter = counter.clone();

        let _watcher = dispatcher.watch(left, Interest::Read, &queue, move |readiness| {
            if let Readiness::ReadReady(_) = readiness {
                handler_counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        send(right, b"x");

        for _ in 0..3 {
            assert_eq!(dispatcher.poll_once(Duration::from_secs(1)).unwrap(), 1);
            block_on(queue.barrier());
        }

        assert_eq!(counter.load(Ordering::SeqCst), 3);

        unsafe {
            libc::close(left);
            libc::close(right);
        }
    }

    #[test]
    fn test_watch_once_and_suspend() {
        let dispatcher = dispatcher();

        let queue = dispatcher.queue("once");

        let (left, right) = socket_pair();

        let counter = Arc::new(AtomicUsize::new(0));

        let handler_counter = counter.clone();

        let watcher = dispatcher.watch_once(left, Interest::Write, &queue, move |readiness| {
            if let Readiness::WriteReady(_) = readiness {
                handler_counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert_eq!(dispatcher.poll_once(Duration::from_secs(1)).unwrap(), 1);
        block_on(queue.barrier());

        assert_eq!(dispatcher.poll_once(Duration::from_millis(20)).unwrap(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        drop(watcher);

        assert_eq!(dispatcher.watchers(), 0);

        let read = dispatcher.watch(left, Interest::Read, &queue, |_| {});

        read.suspend();

        send(right, b"x");

        assert_eq!(dispatcher.poll_once(Duration::from_millis(20)).unwrap(), 0);

        read.resume();

        assert_eq!(dispatcher.poll_once(Duration::from_secs(1)).unwrap(), 1);

        unsafe {
            libc::close(left);
            libc::close(right);
        }
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let dispatcher = dispatcher();

        let queue = dispatcher.queue("cancel");

        let (left, right) = socket_pair();

        let canceled = Arc::new(AtomicUsize::new(0));

        let handler_canceled = canceled.clone();

        let watcher = dispatcher.watch(left, Interest::Read, &queue, move |readiness| {
            if readiness == Readiness::Canceled {
                handler_canceled.fetch_add(1, Ordering::SeqCst);
            }
        });

        watcher.cancel();
        watcher.cancel();
        drop(watcher);

        block_on(queue.barrier());

        assert_eq!(canceled.load(Ordering::SeqCst), 1);

        unsafe {
            libc::close(left);
            libc::close(right);
        }
    }

    #[test]
    fn test_background_thread() {
        let dispatcher = dispatcher();

        dispatcher.start().unwrap();
        dispatcher.start().unwrap();

        let queue = dispatcher.queue("background");

        let (left, right) = socket_pair();

        let (sender, receiver) = futures::channel::oneshot::channel();

        let mut sender = Some(sender);

        let _watcher = dispatcher.watch(left, Interest::Read, &queue, move |readiness| {
            if let Some(sender) = sender.take() {
                _ = sender.send(readiness);
            }
        });

        send(right, b"abc");

        assert_eq!(block_on(receiver).unwrap(), Readiness::ReadReady(3));

        unsafe {
            libc::close(left);
            libc::close(right);
        }
    }
}
