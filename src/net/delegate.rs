use std::net::SocketAddr;

use crate::error::SocketError;

use super::{accumulator::DataAccumulator, socket::Socket};

/// Receives runtime events of a socket tree.
///
/// Every method is invoked on the serialized queue of the socket it reports
/// on, so calls for one socket never overlap. Implementations may call back
/// into the socket (e.g. [`Socket::write`]).
pub trait SocketDelegate: Send + Sync {
    /// `listener` accepted `connection`. The connection's read watcher is
    /// scheduled on its own queue after this returns, so no read of
    /// `connection` reaches the delegate before this call.
    fn on_accept(&self, listener: &Socket, connection: &Socket, peer: Option<SocketAddr>) {
        log::trace!(target:"tcp_socket", "{} accept {} from {:?}", listener.id(), connection.id(), peer);
    }

    /// A logical read unit completed.
    fn on_read(&self, socket: &Socket, data: DataAccumulator) {
        log::trace!(target:"tcp_socket", "{} discard read unit, length({})", socket.id(), data.len());
    }

    /// Peer shut down its side. The read watcher is already canceled, the
    /// descriptor stays open until [`Socket::disconnect`] or [`Socket::shutdown`].
    fn on_closed(&self, socket: &Socket) {
        log::debug!(target:"tcp_socket", "{} closed by peer", socket.id());
    }

    /// Runtime I/O failure. A read failure (including a reset by the peer)
    /// cancels the read watcher, a write failure cancels the write watcher
    /// and drops the outbound queue.
    fn on_error(&self, socket: &Socket, error: SocketError) {
        log::error!(target:"tcp_socket", "{} {}", socket.id(), error);
    }
}

/// Delegate that logs every event and drops completed reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl SocketDelegate for Discard {}
