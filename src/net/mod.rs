//! TCP sockets driven by the readiness [`Dispatcher`](crate::dispatcher::Dispatcher).

pub mod accumulator;
pub mod addr;
mod delegate;
pub mod socket;
pub mod sys;

pub use accumulator::DataAccumulator;
pub use addr::{AddressFamily, AddressResolver, SystemResolver};
pub use delegate::*;
pub use socket::{Connect, Socket, SocketBuilder, SocketId};
