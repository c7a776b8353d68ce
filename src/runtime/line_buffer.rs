//! Per-connection receive buffer with newline framing.
//!
//! Bytes are appended as they arrive; complete lines are split off the
//! front as they become available. A trailing partial line stays buffered
//! until its delimiter arrives or the connection goes away.

use bytes::{Bytes, BytesMut};

/// Message delimiter. Nothing else is stripped, so a preceding `\r` stays
/// part of the message.
pub const DELIMITER: u8 = b'\n';

#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
    /// Prefix of `buf` already known to contain no delimiter.
    scanned: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Split off the next complete message, excluding its delimiter.
    ///
    /// Returns `None` once no delimiter remains; the partial line is kept.
    pub fn next_line(&mut self) -> Option<Bytes> {
        let Some(offset) = self.buf[self.scanned..]
            .iter()
            .position(|&b| b == DELIMITER)
        else {
            self.scanned = self.buf.len();
            return None;
        };

        let pos = self.scanned + offset;
        let mut line = self.buf.split_to(pos + 1);
        line.truncate(pos);
        self.scanned = 0;
        Some(line.freeze())
    }

    /// Bytes received after the last delimiter.
    #[cfg(test)]
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
