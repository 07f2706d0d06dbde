//! Socket error taxonomy.

use std::{fmt::Display, io};

/// Errors returned by socket setup calls or reported to a
/// [`SocketDelegate`](crate::net::SocketDelegate) at runtime.
#[derive(Debug)]
pub enum SocketError {
    /// The readiness dispatcher could not be created or started.
    Dispatcher(io::Error),
    /// Creating, configuring, binding or listening on the descriptor failed.
    Listen(io::Error),
    /// Creating or connecting the outbound descriptor failed.
    Connect(io::Error),
    /// Host could not be parsed or looked up.
    Unresolved { host: String, port: u16 },
    /// `accept` failed with something other than "no connection".
    Accept(io::Error),
    /// Reading from a connected descriptor failed. The read watcher is canceled.
    Read(io::Error),
    /// Writing to a connected descriptor failed. The write watcher is canceled.
    Write(io::Error),
    /// Outbound bytes are enqueued faster than they drain.
    WriteQueueFull { pending: usize, limit: usize },
    /// Operation requires an open descriptor.
    NotConnected,
    /// `listen` or `connect` on a socket that already owns a descriptor.
    AlreadyOpen,
    /// `close` reported an error.
    Close(io::Error),
}

impl Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dispatcher(err) => write!(f, "dispatcher unavailable: {}", err),
            Self::Listen(err) => write!(f, "listen failed: {}", err),
            Self::Connect(err) => write!(f, "connect failed: {}", err),
            Self::Unresolved { host, port } => {
                write!(f, "unable to resolve address {:?} port {}", host, port)
            }
            Self::Accept(err) => write!(f, "accept failed: {}", err),
            Self::Read(err) => write!(f, "read failed: {}", err),
            Self::Write(err) => write!(f, "write failed: {}", err),
            Self::WriteQueueFull { pending, limit } => write!(
                f,
                "write queue full, {} bytes pending with limit {}",
                pending, limit
            ),
            Self::NotConnected => write!(f, "socket has no open descriptor"),
            Self::AlreadyOpen => write!(f, "socket already owns a descriptor"),
            Self::Close(err) => write!(f, "close failed: {}", err),
        }
    }
}

impl std::error::Error for SocketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.os_error()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

impl SocketError {
    /// Underlying OS error, if any.
    pub fn os_error(&self) -> Option<&io::Error> {
        match self {
            Self::Dispatcher(err)
            | Self::Listen(err)
            | Self::Connect(err)
            | Self::Accept(err)
            | Self::Read(err)
            | Self::Write(err)
            | Self::Close(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SocketError> for io::Error {
    fn from(value: SocketError) -> Self {
        let kind = match &value {
            SocketError::Unresolved { .. } => io::ErrorKind::NotFound,
            SocketError::WriteQueueFull { .. } => io::ErrorKind::WouldBlock,
            SocketError::NotConnected => io::ErrorKind::NotConnected,
            SocketError::AlreadyOpen => io::ErrorKind::AlreadyExists,
            other => match other.os_error() {
                Some(err) => err.kind(),
                None => io::ErrorKind::Other,
            },
        };

        io::Error::new(kind, value)
    }
}

/// Result alias used by socket operations.
pub type Result<T> = std::result::Result<T, SocketError>;
