use std::{
    future::Future,
    net::SocketAddr,
    os::fd::RawFd,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use futures::task::AtomicWaker;

use crate::{
    dispatcher::{Interest, Readiness, Watcher},
    error::{Result, SocketError},
    net::{
        addr::{classify, AddressFamily},
        sys,
    },
};

use super::Socket;

#[derive(Default)]
struct ConnectSignal {
    fired: AtomicBool,
    waker: AtomicWaker,
}

struct InProgress {
    fd: RawFd,
    family: AddressFamily,
    addr: SocketAddr,
    signal: Arc<ConnectSignal>,
    watcher: Watcher,
}

enum Stage {
    Start,
    InProgress(InProgress),
    Done,
}

/// Future returned by [`Socket::connect`].
///
/// The descriptor is connected in non-blocking mode and completion is
/// detected by a one-shot write watcher. Dropping the future before it
/// resolves closes the half open descriptor.
pub struct Connect {
    socket: Socket,
    host: String,
    port: u16,
    stage: Stage,
}

impl Connect {
    pub(super) fn new(socket: Socket, host: String, port: u16) -> Self {
        Self {
            socket,
            host,
            port,
            stage: Stage::Start,
        }
    }

    fn start(&mut self, cx: &mut Context<'_>) -> Poll<Result<SocketAddr>> {
        if self.socket.descriptor().is_some() {
            return Poll::Ready(Err(SocketError::AlreadyOpen));
        }

        let context = &self.socket.core.context;

        let Some(addr) = context.resolver.resolve(&self.host, self.port) else {
            return Poll::Ready(Err(SocketError::Unresolved {
                host: self.host.clone(),
                port: self.port,
            }));
        };

        let family = classify(&addr);

        let fd = match sys::stream_socket(family) {
            Ok(fd) => fd,
            Err(err) => return Poll::Ready(Err(SocketError::Connect(err))),
        };

        let connected = sys::configure(fd).and_then(|_| sys::connect(fd, addr));

        match connected {
            Ok(true) => Poll::Ready(self.socket.attach_connected(fd, family, addr)),
            Ok(false) => {
                log::trace!(target:"tcp_socket", "{} connect {} in progress, fd({})", self.socket.id(), addr, fd);

                let signal = Arc::new(ConnectSignal::default());

                signal.waker.register(cx.waker());

                let handler_signal = signal.clone();

                let watcher = context.dispatcher.watch_once(
                    fd,
                    Interest::Write,
                    self.socket.queue(),
                    move |readiness| {
                        if let Readiness::WriteReady(_) = readiness {
                            handler_signal.fired.store(true, Ordering::SeqCst);
                            handler_signal.waker.wake();
                        }
                    },
                );

                self.stage = Stage::InProgress(InProgress {
                    fd,
                    family,
                    addr,
                    signal,
                    watcher,
                });

                Poll::Pending
            }
            Err(err) => {
                _ = sys::close(fd);
                Poll::Ready(Err(SocketError::Connect(err)))
            }
        }
    }

    fn finish(&mut self, pending: InProgress) -> Result<SocketAddr> {
        let InProgress {
            fd,
            family,
            addr,
            watcher,
            ..
        } = pending;

        watcher.cancel();

        let failure = match sys::take_error(fd) {
            Ok(None) => None,
            Ok(Some(err)) | Err(err) => Some(err),
        };

        if let Some(err) = failure {
            log::debug!(target:"tcp_socket", "{} connect {} failed, {}", self.socket.id(), addr, err);
            _ = sys::close(fd);
            return Err(SocketError::Connect(err));
        }

        self.socket.attach_connected(fd, family, addr)
    }
}

impl Future for Connect {
    type Output = Result<SocketAddr>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Start => self.start(cx),
            Stage::InProgress(pending) => {
                pending.signal.waker.register(cx.waker());

                if !pending.signal.fired.load(Ordering::SeqCst) {
                    self.stage = Stage::InProgress(pending);
                    return Poll::Pending;
                }

                Poll::Ready(self.finish(pending))
            }
            Stage::Done => panic!("Connect polled after completion"),
        }
    }
}

impl Drop for Connect {
    fn drop(&mut self) {
        if let Stage::InProgress(pending) = &self.stage {
            pending.watcher.cancel();
            _ = sys::close(pending.fd);
        }
    }
}
