//! State Recorder
//!
//! Byte cursor over a growable buffer, used for world snapshots, per-body
//! sync blobs and interaction buffers.
//! Features:
//! - Writes never fail
//! - Reads are fail-closed: once a read fails every later read is a no-op
//! - Validating mode compares instead of overwriting, to self-check that a
//!   save/restore round trip reproduces the same bytes
//!
//! Typed values are encoded with `bincode` (fixed-width, little-endian).

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Growable byte buffer with a read cursor and a sticky failure flag
#[derive(Debug, Clone, Default)]
pub struct StateRecorder {
    data: Vec<u8>,
    read_cursor: usize,
    failed: bool,
    validating: bool,
}

impl StateRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorder reading from existing bytes
    pub fn from_data(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    /// Append raw bytes
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Append a typed value
    pub fn write<T: Serialize + ?Sized>(&mut self, value: &T) {
        if let Err(err) = bincode::serialize_into(&mut self.data, value) {
            // Only non-serializable types (e.g. maps with non-string keys) reach this.
            log::error!("StateRecorder: failed to encode value: {}", err);
            self.failed = true;
        }
    }

    /// Copy `dest.len()` bytes into `dest`, or compare them when validating.
    pub fn read_bytes(&mut self, dest: &mut [u8]) -> bool {
        if self.failed {
            return false;
        }

        let end = self.read_cursor + dest.len();
        if end > self.data.len() {
            log::error!(
                "StateRecorder: reading {} bytes at {} past the end ({})",
                dest.len(),
                self.read_cursor,
                self.data.len()
            );
            self.failed = true;
            return false;
        }

        let source = &self.data[self.read_cursor..end];
        if self.validating {
            if dest != source {
                log::error!("StateRecorder: validation mismatch at {}", self.read_cursor);
                self.failed = true;
                return false;
            }
        } else {
            dest.copy_from_slice(source);
        }
        self.read_cursor = end;
        true
    }

    /// Read a typed value into `value`, or compare it when validating.
    ///
    /// `value` is untouched on failure and in validating mode.
    pub fn read<T: Serialize + DeserializeOwned>(&mut self, value: &mut T) -> bool {
        if self.failed {
            return false;
        }

        let mut remaining: &[u8] = &self.data[self.read_cursor..];
        let available = remaining.len();
        let decoded: T = match bincode::deserialize_from(&mut remaining) {
            Ok(decoded) => decoded,
            Err(err) => {
                log::error!("StateRecorder: read at {} failed: {}", self.read_cursor, err);
                self.failed = true;
                return false;
            }
        };
        let consumed = available - remaining.len();
        let source = &self.data[self.read_cursor..self.read_cursor + consumed];

        if self.validating {
            match bincode::serialize(value) {
                Ok(current) if current.as_slice() == source => {}
                _ => {
                    log::error!("StateRecorder: validation mismatch at {}", self.read_cursor);
                    self.failed = true;
                    return false;
                }
            }
        } else {
            *value = decoded;
        }
        self.read_cursor += consumed;
        true
    }

    /// Read a typed value, starting from `T::default()`
    pub fn read_value<T: Serialize + DeserializeOwned + Default>(&mut self) -> Option<T> {
        let mut value = T::default();
        self.read(&mut value).then_some(value)
    }

    /// Rewind the cursor without touching the data
    pub fn begin_read(&mut self) {
        self.read_cursor = 0;
    }

    /// Empty the buffer and reset cursor and failure
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_cursor = 0;
        self.failed = false;
    }

    /// Replace the buffer, resetting cursor and failure
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
        self.read_cursor = 0;
        self.failed = false;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn read_cursor(&self) -> usize {
        self.read_cursor
    }

    pub fn is_at_end(&self) -> bool {
        self.read_cursor >= self.data.len()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn set_validating(&mut self, validating: bool) {
        self.validating = validating;
    }

    pub fn is_validating(&self) -> bool {
        self.validating
    }

    /// Byte-for-byte comparison, including length
    pub fn is_equal(&self, other: &StateRecorder) -> bool {
        self.data == other.data
    }
}
