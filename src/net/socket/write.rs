//! Outbound byte queue of a connected socket.

use std::io::{self, ErrorKind, Write};

use crate::error::{Result, SocketError};

/// Result of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Queue is empty, carries bytes written by this attempt.
    Drained(usize),
    /// Sink would block with bytes still queued.
    Blocked(usize),
}

/// FIFO of bytes waiting for the descriptor to become writable.
#[derive(Debug)]
pub struct OutboundQueue {
    buff: Vec<u8>,
    offset: usize,
    limit: usize,
}

impl OutboundQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            buff: vec![],
            offset: 0,
            limit,
        }
    }

    /// Bytes not yet handed to the kernel.
    pub fn len(&self) -> usize {
        self.buff.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Enqueue `bytes`, failing when the queue would grow past its limit.
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        let pending = self.len() + bytes.len();

        if pending > self.limit {
            return Err(SocketError::WriteQueueFull {
                pending,
                limit: self.limit,
            });
        }

        if self.offset > 0 && self.offset >= self.buff.len() / 2 {
            self.buff.drain(..self.offset);
            self.offset = 0;
        }

        self.buff.extend_from_slice(bytes);

        Ok(())
    }

    pub fn clear(&mut self) {
        self.buff.clear();
        self.offset = 0;
    }

    /// Write queued bytes to `sink` until it would block or the queue is empty.
    pub fn flush_to<W: Write>(&mut self, sink: &mut W) -> io::Result<Flush> {
        let mut written = 0;

        while self.offset < self.buff.len() {
            match sink.write(&self.buff[self.offset..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::WriteZero,
                        "descriptor accepted zero bytes",
                    ));
                }
                Ok(len) => {
                    self.offset += len;
                    written += len;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(Flush::Blocked(written));
                }
                Err(err) => return Err(err),
            }
        }

        self.clear();

        Ok(Flush::Drained(written))
    }
}
