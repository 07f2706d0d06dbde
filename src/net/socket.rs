//! Readiness driven TCP socket.
//!
//! A [`Socket`] owns one non-blocking descriptor and one [`SerialQueue`].
//! Every watcher it registers delivers onto that queue, so the socket's
//! read state, outbound queue and children are only touched by one
//! notification at a time. A listening socket owns the connections it
//! accepts, each with its own queue.

mod connect;
mod read;
mod write;

pub use connect::*;
pub use read::*;
pub use write::*;

use std::{
    collections::BTreeMap,
    fmt::{Debug, Display},
    io,
    net::SocketAddr,
    os::fd::RawFd,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use crate::{
    config::SocketConfig,
    dispatcher::{Dispatcher, Interest, Readiness, Watcher},
    error::{Result, SocketError},
    locked,
    queue::SerialQueue,
};

use super::{
    addr::{classify, AddressFamily, AddressResolver, SystemResolver},
    delegate::{Discard, SocketDelegate},
    sys,
};

/// Process unique socket identifier. Identifiers increase monotonically, so
/// ordering by id is creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketId(u64);

impl SocketId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);

        Self(NEXT.fetch_add(1, Ordering::SeqCst))
    }
}

impl Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

/// Collaborators shared by a socket and every connection it accepts.
#[derive(Clone)]
struct Context {
    dispatcher: Dispatcher,
    config: SocketConfig,
    delegate: Arc<dyn SocketDelegate>,
    resolver: Arc<dyn AddressResolver>,
}

struct SocketState {
    fd: Option<RawFd>,
    family: Option<AddressFamily>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    accept_watcher: Option<Watcher>,
    read_watcher: Option<Watcher>,
    write_watcher: Option<Watcher>,
    admission_suspended: bool,
    children: BTreeMap<SocketId, Socket>,
    reader: ReadMachine,
    outbound: OutboundQueue,
}

impl SocketState {
    fn new(config: &SocketConfig) -> Self {
        Self {
            fd: None,
            family: None,
            local_addr: None,
            peer_addr: None,
            accept_watcher: None,
            read_watcher: None,
            write_watcher: None,
            admission_suspended: false,
            children: Default::default(),
            reader: ReadMachine::new(config.buffer_capacity),
            outbound: OutboundQueue::new(config.write_queue_limit),
        }
    }

    /// Detach every watcher. Dropping the result cancels them.
    fn take_watchers(&mut self) -> [Option<Watcher>; 3] {
        [
            self.accept_watcher.take(),
            self.read_watcher.take(),
            self.write_watcher.take(),
        ]
    }
}

struct SocketCore {
    id: SocketId,
    context: Context,
    queue: SerialQueue,
    state: Mutex<SocketState>,
}

impl SocketCore {
    fn disconnect(&self) -> Result<()> {
        let (fd, watchers) = {
            let mut state = locked(&self.state);

            state.reader.reset();
            state.outbound.clear();
            state.admission_suspended = false;

            (state.fd.take(), state.take_watchers())
        };

        // watchers are canceled before the descriptor number can be reused.
        drop(watchers);

        match fd {
            Some(fd) => {
                log::debug!(target:"tcp_socket", "{} disconnect fd({})", self.id, fd);
                sys::close(fd).map_err(SocketError::Close)
            }
            None => Ok(()),
        }
    }

    fn shutdown(&self) -> Result<()> {
        let closed = self.disconnect();

        let children = std::mem::take(&mut locked(&self.state).children);

        for (id, child) in children.iter() {
            if let Err(err) = child.core.shutdown() {
                log::error!(target:"tcp_socket", "{} shutdown child {}, {}", self.id, id, err);
            }
        }

        closed
    }
}

impl Drop for SocketCore {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!(target:"tcp_socket", "{} release, {}", self.id, err);
        }
    }
}

/// Builder for [`Socket`] with non-default collaborators.
pub struct SocketBuilder {
    dispatcher: Option<Dispatcher>,
    config: SocketConfig,
    delegate: Arc<dyn SocketDelegate>,
    resolver: Arc<dyn AddressResolver>,
}

impl Default for SocketBuilder {
    fn default() -> Self {
        Self {
            dispatcher: None,
            config: Default::default(),
            delegate: Arc::new(Discard),
            resolver: Arc::new(SystemResolver),
        }
    }
}

impl SocketBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Dispatcher delivering readiness. Defaults to [`Dispatcher::shared`].
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn config(mut self, config: SocketConfig) -> Self {
        self.config = config;
        self
    }

    pub fn delegate<D: SocketDelegate + 'static>(mut self, delegate: D) -> Self {
        self.delegate = Arc::new(delegate);
        self
    }

    pub fn resolver<R: AddressResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn build(self) -> Result<Socket> {
        let dispatcher = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Dispatcher::shared().map_err(SocketError::Dispatcher)?,
        };

        Ok(Socket::with_context(Context {
            dispatcher,
            config: self.config,
            delegate: self.delegate,
            resolver: self.resolver,
        }))
    }
}

/// Non-blocking TCP socket, cheap to clone. The last handle dropped runs
/// [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct Socket {
    core: Arc<SocketCore>,
}

impl Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = locked(&self.core.state);

        f.debug_struct("Socket")
            .field("id", &self.core.id)
            .field("fd", &state.fd)
            .field("family", &state.family)
            .field("children", &state.children.len())
            .finish()
    }
}

impl Socket {
    /// Create socket on the shared dispatcher with default configuration.
    pub fn new() -> Result<Self> {
        SocketBuilder::new().build()
    }

    pub fn builder() -> SocketBuilder {
        SocketBuilder::new()
    }

    fn with_context(context: Context) -> Self {
        let id = SocketId::next();

        let queue = context.dispatcher.queue(id.to_string());

        let state = SocketState::new(&context.config);

        Self {
            core: Arc::new(SocketCore {
                id,
                context,
                queue,
                state: Mutex::new(state),
            }),
        }
    }

    fn from_weak(core: &Weak<SocketCore>) -> Option<Self> {
        core.upgrade().map(|core| Self { core })
    }

    pub fn id(&self) -> SocketId {
        self.core.id
    }

    /// Serialized queue every notification of this socket runs on.
    pub fn queue(&self) -> &SerialQueue {
        &self.core.queue
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.core.context.dispatcher
    }

    pub fn config(&self) -> &SocketConfig {
        &self.core.context.config
    }

    /// Open descriptor, `None` before listen/connect and after disconnect.
    pub fn descriptor(&self) -> Option<RawFd> {
        locked(&self.core.state).fd
    }

    pub fn address_family(&self) -> Option<AddressFamily> {
        locked(&self.core.state).family
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        locked(&self.core.state).local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        locked(&self.core.state).peer_addr
    }

    /// Count of accepted connections owned by this socket.
    pub fn connected_count(&self) -> usize {
        locked(&self.core.state).children.len()
    }

    /// Ids of accepted connections in accept order.
    pub fn children(&self) -> Vec<SocketId> {
        locked(&self.core.state).children.keys().copied().collect()
    }

    pub fn child(&self, id: SocketId) -> Option<Socket> {
        locked(&self.core.state).children.get(&id).cloned()
    }

    /// Outbound bytes not yet written to the descriptor.
    pub fn pending_writes(&self) -> usize {
        locked(&self.core.state).outbound.len()
    }

    /// Bind the wildcard address on an OS assigned port and start accepting.
    pub fn listen(&self) -> Result<SocketAddr> {
        self.listen_on(0)
    }

    /// Bind the wildcard address on `port` and start accepting. Port 0
    /// requests an ephemeral port. Returns the bound address.
    pub fn listen_on(&self, port: u16) -> Result<SocketAddr> {
        if self.descriptor().is_some() {
            return Err(SocketError::AlreadyOpen);
        }

        let context = &self.core.context;

        let host = if context.config.prefer_ipv6 { "::" } else { "" };

        let addr = context
            .resolver
            .resolve(host, port)
            .ok_or_else(|| SocketError::Unresolved {
                host: host.to_owned(),
                port,
            })?;

        let family = classify(&addr);

        let fd = sys::stream_socket(family).map_err(SocketError::Listen)?;

        let local_addr = match open_listener(fd, addr, context.config.max_pending_connections) {
            Ok(local_addr) => local_addr,
            Err(err) => {
                _ = sys::close(fd);
                return Err(SocketError::Listen(err));
            }
        };

        let mut state = locked(&self.core.state);

        if state.fd.is_some() {
            drop(state);
            _ = sys::close(fd);
            return Err(SocketError::AlreadyOpen);
        }

        state.fd = Some(fd);
        state.family = Some(family);
        state.local_addr = Some(local_addr);
        state.accept_watcher = Some(self.watch(fd, Interest::Accept));

        log::debug!(target:"tcp_socket", "{} listen on {}, fd({})", self.core.id, local_addr, fd);

        Ok(local_addr)
    }

    /// Connect to `host:port` without blocking. The returned future resolves
    /// to the peer address once the connection is established, the socket's
    /// watchers are then set up on its queue.
    pub fn connect(&self, host: impl Into<String>, port: u16) -> Connect {
        Connect::new(self.clone(), host.into(), port)
    }

    /// Cancel every watcher and close the descriptor. Accepted connections
    /// stay owned, only [`shutdown`](Self::shutdown) releases them.
    /// Disconnecting a socket without descriptor is a no-op.
    pub fn disconnect(&self) -> Result<()> {
        self.core.disconnect()
    }

    /// Disconnect, then shut down and release every accepted connection. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        self.core.shutdown()
    }

    /// Remove accepted connection `id`, canceling its watchers and closing it
    /// before it is released. Reopens admission if accepting was paused at
    /// the connection cap.
    pub fn remove_child(&self, id: SocketId) -> Option<Socket> {
        let child = {
            let mut state = locked(&self.core.state);

            let child = state.children.remove(&id)?;

            if state.admission_suspended
                && state.children.len() < self.core.context.config.max_pending_connections
            {
                state.admission_suspended = false;

                if let Some(watcher) = &state.accept_watcher {
                    log::debug!(target:"tcp_socket", "{} resume accepting", self.core.id);
                    watcher.resume();
                }
            }

            child
        };

        if let Err(err) = child.shutdown() {
            log::error!(target:"tcp_socket", "{} remove child {}, {}", self.core.id, id, err);
        }

        Some(child)
    }

    /// Enqueue `bytes` for writing. The write watcher is registered on the
    /// socket's queue when the queue turns non-empty, and canceled once it
    /// drains.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        let was_empty = {
            let mut state = locked(&self.core.state);

            if state.fd.is_none() {
                return Err(SocketError::NotConnected);
            }

            let was_empty = state.outbound.is_empty();

            state.outbound.push(bytes)?;

            was_empty
        };

        if was_empty {
            let core = Arc::downgrade(&self.core);

            self.core.queue.dispatch_async(move || {
                if let Some(socket) = Socket::from_weak(&core) {
                    socket.arm_write();
                }
            });
        }

        Ok(())
    }

    fn watch(&self, fd: RawFd, interest: Interest) -> Watcher {
        let core = Arc::downgrade(&self.core);

        self.core
            .context
            .dispatcher
            .watch(fd, interest, &self.core.queue, move |readiness| {
                if let Some(socket) = Socket::from_weak(&core) {
                    socket.on_readiness(readiness);
                }
            })
    }

    fn on_readiness(&self, readiness: Readiness) {
        match readiness {
            Readiness::AcceptReady(pending) => self.handle_accept(pending),
            Readiness::ReadReady(available) => self.handle_read(available),
            Readiness::WriteReady(_) => self.handle_write(),
            Readiness::Canceled => {
                log::trace!(target:"tcp_socket", "{} watcher released", self.core.id);
            }
        }
    }

    fn handle_accept(&self, pending: usize) {
        let config = &self.core.context.config;

        log::trace!(target:"tcp_socket", "{} accept ready({})", self.core.id, pending);

        loop {
            let (fd, family) = {
                let mut state = locked(&self.core.state);

                let (Some(fd), Some(family)) = (state.fd, state.family) else {
                    return;
                };

                if state.children.len() >= config.max_pending_connections {
                    if !state.admission_suspended {
                        log::debug!(target:"tcp_socket", "{} connection cap {} reached, pause accepting", self.core.id, config.max_pending_connections);

                        state.admission_suspended = true;

                        if let Some(watcher) = &state.accept_watcher {
                            watcher.suspend();
                        }
                    }

                    return;
                }

                (fd, family)
            };

            let (conn_fd, peer) = match sys::accept(fd) {
                Ok(Some(accepted)) => accepted,
                Ok(None) => return,
                Err(err) => {
                    self.core
                        .context
                        .delegate
                        .on_error(self, SocketError::Accept(err));
                    return;
                }
            };

            match self.adopt(conn_fd, family, peer) {
                Ok(child) => {
                    self.core.context.delegate.on_accept(self, &child, peer);
                    child.schedule_setup();
                }
                Err(err) => {
                    _ = sys::close(conn_fd);
                    self.core
                        .context
                        .delegate
                        .on_error(self, SocketError::Accept(err));
                }
            }

            if !config.drain_accept_backlog {
                return;
            }
        }
    }

    /// Wrap an accepted descriptor as a child. Its watchers are not set up
    /// yet, the caller schedules that once `on_accept` has run.
    fn adopt(
        &self,
        fd: RawFd,
        family: AddressFamily,
        peer: Option<SocketAddr>,
    ) -> io::Result<Socket> {
        sys::configure(fd)?;

        let child = Socket::with_context(self.core.context.clone());

        {
            let mut state = locked(&child.core.state);

            state.fd = Some(fd);
            state.family = Some(family);
            state.local_addr = sys::local_addr(fd).ok();
            state.peer_addr = peer;
        }

        locked(&self.core.state)
            .children
            .insert(child.core.id, child.clone());

        log::debug!(target:"tcp_socket", "{} accept {} fd({}) from {:?}", self.core.id, child.core.id, fd, peer);

        Ok(child)
    }

    fn schedule_setup(&self) {
        let core = Arc::downgrade(&self.core);

        self.core.queue.dispatch_async(move || {
            if let Some(socket) = Socket::from_weak(&core) {
                socket.setup_watchers();
            }
        });
    }

    fn setup_watchers(&self) {
        let mut state = locked(&self.core.state);

        let Some(fd) = state.fd else {
            return;
        };

        if state.read_watcher.is_none() {
            state.read_watcher = Some(self.watch(fd, Interest::Read));
        }

        if state.write_watcher.is_none() && !state.outbound.is_empty() {
            state.write_watcher = Some(self.watch(fd, Interest::Write));
        }

        log::trace!(target:"tcp_socket", "{} watchers ready, fd({})", self.core.id, fd);
    }

    fn handle_read(&self, available: usize) {
        let (outcome, released) = {
            let mut state = locked(&self.core.state);

            let Some(fd) = state.fd else {
                return;
            };

            let outcome = match available {
                0 => match sys::peer_closed(fd) {
                    Ok(true) => state.reader.finish(),
                    Ok(false) => state.reader.on_readable(0, &mut sys::FdReader(fd)),
                    Err(err) => state.reader.fail(err),
                },
                _ => state.reader.on_readable(available, &mut sys::FdReader(fd)),
            };

            let released = match outcome {
                ReadOutcome::EndOfStream(_) | ReadOutcome::Failed(_) => state.read_watcher.take(),
                _ => None,
            };

            (outcome, released)
        };

        drop(released);

        let delegate = &self.core.context.delegate;

        match outcome {
            ReadOutcome::Idle | ReadOutcome::Accumulating => {}
            ReadOutcome::Completed(data) => {
                log::trace!(target:"tcp_socket", "{} read unit complete, length({})", self.core.id, data.len());
                delegate.on_read(self, data);
            }
            ReadOutcome::EndOfStream(data) => {
                if let Some(data) = data {
                    delegate.on_read(self, data);
                }

                delegate.on_closed(self);
            }
            ReadOutcome::Failed(err) => delegate.on_error(self, SocketError::Read(err)),
        }
    }

    fn arm_write(&self) {
        let mut state = locked(&self.core.state);

        let Some(fd) = state.fd else {
            return;
        };

        if state.write_watcher.is_none() && !state.outbound.is_empty() {
            state.write_watcher = Some(self.watch(fd, Interest::Write));
        }
    }

    fn handle_write(&self) {
        let (failure, released) = {
            let mut state = locked(&self.core.state);

            let Some(fd) = state.fd else {
                return;
            };

            match state.outbound.flush_to(&mut sys::FdWriter(fd)) {
                Ok(Flush::Blocked(written)) => {
                    log::trace!(target:"tcp_socket", "{} write blocked after {}, pending({})", self.core.id, written, state.outbound.len());
                    return;
                }
                Ok(Flush::Drained(written)) => {
                    log::trace!(target:"tcp_socket", "{} write drained after {}", self.core.id, written);
                    (None, state.write_watcher.take())
                }
                Err(err) => {
                    state.outbound.clear();
                    (Some(err), state.write_watcher.take())
                }
            }
        };

        drop(released);

        if let Some(err) = failure {
            self.core
                .context
                .delegate
                .on_error(self, SocketError::Write(err));
        }
    }

    /// Take ownership of a connected descriptor produced by [`Connect`].
    fn attach_connected(&self, fd: RawFd, family: AddressFamily, addr: SocketAddr) -> Result<SocketAddr> {
        let peer = {
            let mut state = locked(&self.core.state);

            if state.fd.is_some() {
                drop(state);
                _ = sys::close(fd);
                return Err(SocketError::AlreadyOpen);
            }

            let peer = sys::peer_addr(fd).unwrap_or(addr);

            state.fd = Some(fd);
            state.family = Some(family);
            state.local_addr = sys::local_addr(fd).ok();
            state.peer_addr = Some(peer);

            peer
        };

        self.schedule_setup();

        log::debug!(target:"tcp_socket", "{} connected to {}, fd({})", self.core.id, peer, fd);

        Ok(peer)
    }
}

fn open_listener(fd: RawFd, addr: SocketAddr, backlog: usize) -> io::Result<SocketAddr> {
    sys::configure(fd)?;
    sys::bind(fd, addr)?;
    sys::listen(fd, backlog)?;
    sys::local_addr(fd)
}

#[cfg(test)]
mod tests {
    use std::{io::Write, net::TcpStream, time::Duration};

    use futures::executor::block_on;

    use crate::config::DispatcherConfig;

    use super::*;

    fn socket(config: SocketConfig) -> (Dispatcher, Socket) {
        let dispatcher =
            Dispatcher::new(DispatcherConfig::default().with_worker_threads(2)).unwrap();

        let socket = Socket::builder()
            .dispatcher(dispatcher.clone())
            .config(config)
            .build()
            .unwrap();

        (dispatcher, socket)
    }

    fn pump(dispatcher: &Dispatcher, socket: &Socket) {
        dispatcher.poll_once(Duration::from_millis(100)).unwrap();
        block_on(socket.queue().barrier());
    }

    #[test]
    fn test_socket_ids_are_ordered() {
        let a = SocketId::next();
        let b = SocketId::next();

        assert!(a < b);
        assert!(a.to_string().starts_with("socket#"));
    }

    #[test]
    fn test_listen_twice() {
        _ = pretty_env_logger::try_init();

        let (_dispatcher, socket) = socket(SocketConfig::default());

        socket.listen().unwrap();

        assert!(matches!(socket.listen(), Err(SocketError::AlreadyOpen)));
    }

    #[test]
    fn test_write_requires_descriptor() {
        let (_dispatcher, socket) = socket(SocketConfig::default());

        assert!(matches!(socket.write(b"x"), Err(SocketError::NotConnected)));
        assert_eq!(socket.pending_writes(), 0);
    }

    #[test]
    fn test_accept_one_per_wakeup() {
        _ = pretty_env_logger::try_init();

        let (dispatcher, listener) =
            socket(SocketConfig::default().with_drain_accept_backlog(false));

        let addr = listener.listen().unwrap();

        let _clients = (0..3)
            .map(|_| TcpStream::connect(("127.0.0.1", addr.port())).unwrap())
            .collect::<Vec<_>>();

        std::thread::sleep(Duration::from_millis(50));

        pump(&dispatcher, &listener);

        assert_eq!(listener.connected_count(), 1);

        pump(&dispatcher, &listener);
        pump(&dispatcher, &listener);

        assert_eq!(listener.connected_count(), 3);
    }

    #[test]
    fn test_child_read_watcher_is_canceled_on_peer_close() {
        _ = pretty_env_logger::try_init();

        let (dispatcher, listener) = socket(SocketConfig::default());

        let addr = listener.listen().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();

        std::thread::sleep(Duration::from_millis(50));

        pump(&dispatcher, &listener);

        let child = listener.child(listener.children()[0]).unwrap();

        block_on(child.queue().barrier());

        // accept watcher plus the child's read watcher
        assert_eq!(dispatcher.watchers(), 2);

        client.write_all(b"bye").unwrap();

        drop(client);

        std::thread::sleep(Duration::from_millis(50));

        for _ in 0..3 {
            pump(&dispatcher, &child);
        }

        assert_eq!(dispatcher.watchers(), 1);
        assert!(child.descriptor().is_some());
        assert_eq!(listener.connected_count(), 1);
    }
}
