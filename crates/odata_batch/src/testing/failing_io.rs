// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::{self, ErrorKind, Read, Write};

/// A [`Write`] that accepts a fixed number of bytes and then fails every call.
///
/// The bytes accepted before the failure are kept and can be inspected.
#[derive(Debug)]
pub struct FailingWrite {
    remaining: usize,
    written: Vec<u8>,
}

impl FailingWrite {
    /// Creates a sink that accepts `limit` bytes before failing.
    #[must_use]
    pub fn after(limit: usize) -> Self {
        Self {
            remaining: limit,
            written: Vec::new(),
        }
    }

    /// The bytes accepted so far.
    #[must_use]
    pub fn written(&self) -> &[u8] {
        &self.written
    }
}

impl Write for FailingWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "the sink has failed"));
        }

        let count = buf.len().min(self.remaining);
        self.written.extend_from_slice(&buf[..count]);
        self.remaining -= count;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.remaining == 0 {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "the sink has failed"));
        }

        Ok(())
    }
}

/// A [`Read`] that returns a fixed prefix and then fails every call.
#[derive(Debug)]
pub struct FailingRead {
    prefix: Vec<u8>,
    position: usize,
}

impl FailingRead {
    /// Creates a source that returns `prefix` before failing.
    #[must_use]
    pub fn after(prefix: &[u8]) -> Self {
        Self {
            prefix: prefix.to_vec(),
            position: 0,
        }
    }
}

impl Read for FailingRead {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rest = &self.prefix[self.position..];
        if rest.is_empty() {
            return Err(io::Error::new(ErrorKind::ConnectionReset, "the source has failed"));
        }

        let count = buf.len().min(rest.len());
        buf[..count].copy_from_slice(&rest[..count]);
        self.position += count;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_fails_after_limit() {
        let mut sink = FailingWrite::after(3);

        assert_eq!(sink.write(b"abcde").unwrap(), 3);
        assert_eq!(sink.write(b"f").unwrap_err().kind(), ErrorKind::BrokenPipe);
        assert_eq!(sink.written(), b"abc");
    }

    #[test]
    fn read_fails_after_prefix() {
        let mut source = FailingRead::after(b"ab");
        let mut buffer = [0; 8];

        assert_eq!(source.read(&mut buffer).unwrap(), 2);
        assert_eq!(source.read(&mut buffer).unwrap_err().kind(), ErrorKind::ConnectionReset);
    }
}
