#![doc = include_str!("../README.md")]
#![cfg(target_family = "unix")]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod net;
pub mod queue;

mod poller;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::{DispatcherConfig, SocketConfig};
pub use dispatcher::{Dispatcher, Interest, Readiness, Watcher};
pub use error::{Result, SocketError};
pub use net::{DataAccumulator, Socket, SocketBuilder, SocketDelegate, SocketId};
pub use queue::SerialQueue;

/// Lock `mutex`, recovering the guard if a panicking holder poisoned it.
pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
