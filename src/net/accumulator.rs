//! In-progress buffer of one logical read.

use std::{fmt::Debug, ops::Deref};

/// Append-only byte buffer collecting the chunks of one logical read.
///
/// An accumulator is handed off by value when its unit completes, so a
/// finished one can no longer be appended to.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DataAccumulator {
    bytes: Vec<u8>,
}

impl Debug for DataAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataAccumulator")
            .field("length", &self.bytes.len())
            .finish()
    }
}

impl DataAccumulator {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn append(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl Deref for DataAccumulator {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl AsRef<[u8]> for DataAccumulator {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<DataAccumulator> for Vec<u8> {
    fn from(value: DataAccumulator) -> Self {
        value.bytes
    }
}
