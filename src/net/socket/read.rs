//! Read path state machine of a connected socket.
//!
//! A unit is considered complete once a wake-up drains everything the
//! readiness notification reported as available. TCP has no message
//! boundaries, so this only approximates framing: peers that need exact
//! units must layer length-prefix or delimiter framing on top.

use std::io::{self, ErrorKind, Read};

use crate::net::accumulator::DataAccumulator;

/// Result of one read wake-up.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Nothing consumed and no unit in progress.
    Idle,
    /// Bytes appended, more than one chunk was available.
    Accumulating,
    /// The wake-up drained every available byte, the unit is finished.
    Completed(DataAccumulator),
    /// The source reached end of stream. Carries the unfinished unit, if any.
    EndOfStream(Option<DataAccumulator>),
    /// Read failed, the unfinished unit is dropped.
    Failed(io::Error),
}

/// `Idle` / `Accumulating` machine over one optional [`DataAccumulator`].
#[derive(Debug)]
pub struct ReadMachine {
    pending: Option<DataAccumulator>,
    buffer: Vec<u8>,
}

impl ReadMachine {
    /// `capacity` bytes are read at most per wake-up.
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: None,
            buffer: vec![0u8; capacity.max(1)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_accumulating(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.as_ref().map(|p| p.len()).unwrap_or(0)
    }

    /// Drop the unit in progress.
    pub fn reset(&mut self) {
        self.pending = None;
    }

    /// End of stream observed out of band, e.g. by a `MSG_PEEK` read.
    pub fn finish(&mut self) -> ReadOutcome {
        ReadOutcome::EndOfStream(self.pending.take().filter(|p| !p.is_empty()))
    }

    /// Read failure observed out of band. Any pending unit is dropped.
    pub fn fail(&mut self, err: io::Error) -> ReadOutcome {
        self.pending = None;
        ReadOutcome::Failed(err)
    }

    /// Handle a read notification reporting `available` bytes, reading from `source`.
    pub fn on_readable<R: Read>(&mut self, available: usize, source: &mut R) -> ReadOutcome {
        if available == 0 {
            return match self.pending.take() {
                Some(pending) => ReadOutcome::Completed(pending),
                None => ReadOutcome::Idle,
            };
        }

        let capacity = self.buffer.len();

        let chunk = available.min(capacity);

        let len = match source.read(&mut self.buffer[..chunk]) {
            Ok(len) => len,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return match self.pending {
                    Some(_) => ReadOutcome::Accumulating,
                    None => ReadOutcome::Idle,
                };
            }
            Err(err) => return self.fail(err),
        };

        if len == 0 {
            return self.finish();
        }

        self.pending
            .get_or_insert_with(|| DataAccumulator::with_capacity(available))
            .append(&self.buffer[..len]);

        if available > capacity {
            return ReadOutcome::Accumulating;
        }

        match self.pending.take() {
            Some(pending) => ReadOutcome::Completed(pending),
            None => ReadOutcome::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, io::Cursor};

    use super::*;

    /// Byte stream whose reads return at most `max_read` bytes each.
    struct Scripted {
        data: VecDeque<u8>,
        max_read: usize,
    }

    impl Scripted {
        fn available(&self) -> usize {
            self.data.len()
        }

        fn deliver(&mut self, bytes: &[u8]) {
            self.data.extend(bytes);
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let len = buf.len().min(self.max_read).min(self.data.len());

            for b in buf.iter_mut().take(len) {
                *b = self.data.pop_front().unwrap();
            }

            Ok(len)
        }
    }

    struct Failing(ErrorKind);

    impl Read for Failing {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(self.0, "synthetic"))
        }
    }

    #[test]
    fn test_two_writes_drained_in_one_wakeup() {
        let mut machine = ReadMachine::new(32 * 1024);

        let mut source = Scripted {
            data: VecDeque::new(),
            max_read: usize::MAX,
        };

        source.deliver(b"hello ");
        source.deliver(b"tcp!");

        let available = source.available();

        match machine.on_readable(available, &mut source) {
            ReadOutcome::Completed(data) => {
                assert_eq!(data.len(), 10);
                assert_eq!(data.as_bytes(), b"hello tcp!");
            }
            outcome => panic!("unexpected {:?}", outcome),
        }

        assert!(!machine.is_accumulating());
    }

    #[test]
    fn test_accumulates_across_wakeups() {
        let mut machine = ReadMachine::new(4);

        let mut source = Cursor::new(b"0123456789".to_vec());

        assert!(matches!(
            machine.on_readable(10, &mut source),
            ReadOutcome::Accumulating
        ));
        assert_eq!(machine.pending_len(), 4);

        assert!(matches!(
            machine.on_readable(6, &mut source),
            ReadOutcome::Accumulating
        ));
        assert_eq!(machine.pending_len(), 8);

        match machine.on_readable(2, &mut source) {
            ReadOutcome::Completed(data) => assert_eq!(data.as_bytes(), b"0123456789"),
            outcome => panic!("unexpected {:?}", outcome),
        }
    }

    #[test]
    fn test_arbitrary_chunks_preserve_order() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 251) as u8).collect();

        let mut machine = ReadMachine::new(64);

        let mut source = Scripted {
            data: VecDeque::new(),
            max_read: 48,
        };

        let mut received = vec![];

        let mut seed = 17usize;

        let mut offset = 0;

        while offset < payload.len() || machine.is_accumulating() || source.available() > 0 {
            if offset < payload.len() {
                seed = (seed * 1103515245 + 12345) % (1 << 31);

                let len = (seed % 64 + 1).min(payload.len() - offset);

                source.deliver(&payload[offset..offset + len]);

                offset += len;
            }

            let available = source.available();

            match machine.on_readable(available, &mut source) {
                ReadOutcome::Completed(data) => received.extend_from_slice(&data),
                ReadOutcome::Idle | ReadOutcome::Accumulating => {}
                outcome => panic!("unexpected {:?}", outcome),
            }
        }

        assert_eq!(received, payload);
    }

    #[test]
    fn test_end_of_stream_keeps_pending_unit() {
        let mut machine = ReadMachine::new(4);

        let mut source = Cursor::new(b"abcd".to_vec());

        assert!(matches!(
            machine.on_readable(10, &mut source),
            ReadOutcome::Accumulating
        ));

        match machine.on_readable(6, &mut source) {
            ReadOutcome::EndOfStream(Some(data)) => assert_eq!(data.as_bytes(), b"abcd"),
            outcome => panic!("unexpected {:?}", outcome),
        }

        let mut empty = Cursor::new(vec![]);

        assert!(matches!(
            machine.on_readable(3, &mut empty),
            ReadOutcome::EndOfStream(None)
        ));
    }

    #[test]
    fn test_zero_available() {
        let mut machine = ReadMachine::new(4);

        let mut source = Cursor::new(b"abcdef".to_vec());

        assert!(matches!(
            machine.on_readable(0, &mut source),
            ReadOutcome::Idle
        ));

        assert!(matches!(
            machine.on_readable(6, &mut source),
            ReadOutcome::Accumulating
        ));

        match machine.on_readable(0, &mut source) {
            ReadOutcome::Completed(data) => assert_eq!(data.as_bytes(), b"abcd"),
            outcome => panic!("unexpected {:?}", outcome),
        }
    }

    #[test]
    fn test_errors() {
        let mut machine = ReadMachine::new(4);

        assert!(matches!(
            machine.on_readable(4, &mut Failing(ErrorKind::WouldBlock)),
            ReadOutcome::Idle
        ));

        let mut source = Cursor::new(b"abcd".to_vec());

        assert!(matches!(
            machine.on_readable(8, &mut source),
            ReadOutcome::Accumulating
        ));

        assert!(matches!(
            machine.on_readable(4, &mut Failing(ErrorKind::Interrupted)),
            ReadOutcome::Accumulating
        ));

        match machine.on_readable(4, &mut Failing(ErrorKind::ConnectionReset)) {
            ReadOutcome::Failed(err) => assert_eq!(err.kind(), ErrorKind::ConnectionReset),
            outcome => panic!("unexpected {:?}", outcome),
        }

        assert!(!machine.is_accumulating());
    }

    #[test]
    fn test_fail_drops_pending_unit() {
        let mut machine = ReadMachine::new(4);

        let mut source = Cursor::new(b"abcd".to_vec());

        assert!(matches!(
            machine.on_readable(8, &mut source),
            ReadOutcome::Accumulating
        ));

        match machine.fail(ErrorKind::ConnectionReset.into()) {
            ReadOutcome::Failed(err) => assert_eq!(err.kind(), ErrorKind::ConnectionReset),
            outcome => panic!("unexpected {:?}", outcome),
        }

        assert!(!machine.is_accumulating());
        assert!(matches!(machine.finish(), ReadOutcome::EndOfStream(None)));
    }
}
