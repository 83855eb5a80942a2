// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::{self, ErrorKind};

use crate::transport::ReadTransport;
use crate::{Error, Result};

/// An in-memory [`ReadTransport`] over a fixed byte sequence.
///
/// By default bounded reads return as much as was asked for and the content has no delimiter.
/// The builder methods shorten bounded reads, place a delimiter and inject a failure.
#[derive(Debug, Clone)]
pub struct FakeTransport {
    data: Vec<u8>,
    position: usize,
    chunk_size: Option<usize>,
    delimiter_at: Option<usize>,
    fail_at: Option<usize>,
    delimiter_reads: usize,
}

impl FakeTransport {
    /// Creates a transport over a copy of `data`.
    #[must_use]
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            position: 0,
            chunk_size: None,
            delimiter_at: None,
            fail_at: None,
            delimiter_reads: 0,
        }
    }

    /// Makes every bounded read return at most `chunk_size` bytes.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size.max(1));
        self
    }

    /// Places a boundary delimiter right after the first `offset` bytes.
    #[must_use]
    pub fn with_delimiter_at(mut self, offset: usize) -> Self {
        self.delimiter_at = Some(offset.min(self.data.len()));
        self
    }

    /// Makes every read fail once the first `offset` bytes have been consumed.
    #[must_use]
    pub fn with_failure_at(mut self, offset: usize) -> Self {
        self.fail_at = Some(offset);
        self
    }

    /// Number of bytes consumed so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position as u64
    }

    /// Number of delimiter-aware reads performed so far.
    #[must_use]
    pub fn delimiter_reads(&self) -> usize {
        self.delimiter_reads
    }

    fn check_failure(&self) -> Result<usize> {
        match self.fail_at {
            Some(offset) if self.position >= offset => {
                Err(io::Error::new(ErrorKind::ConnectionAborted, "injected transport failure").into())
            }
            Some(offset) => Ok(offset),
            None => Ok(usize::MAX),
        }
    }

    fn take(&mut self, buffer: &mut [u8], count: usize) -> usize {
        buffer[..count].copy_from_slice(&self.data[self.position..self.position + count]);
        self.position += count;
        count
    }
}

impl ReadTransport for FakeTransport {
    fn read_bounded(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let fail_at = self.check_failure()?;

        let count = buffer
            .len()
            .min(self.data.len() - self.position)
            .min(fail_at - self.position)
            .min(self.chunk_size.unwrap_or(usize::MAX));

        Ok(self.take(buffer, count))
    }

    fn read_until_delimiter(&mut self, buffer: &mut [u8]) -> Result<usize> {
        self.delimiter_reads += 1;
        let fail_at = self.check_failure()?;

        let Some(delimiter_at) = self.delimiter_at else {
            if self.data.len() - self.position < buffer.len() {
                return Err(Error::format("the input ended inside operation content"));
            }
            return Ok(self.take(buffer, buffer.len()));
        };

        let available = delimiter_at.saturating_sub(self.position);
        let count = buffer.len().min(available);

        if count > fail_at - self.position {
            let partial = fail_at - self.position;
            self.take(buffer, partial);
            return Err(io::Error::new(ErrorKind::ConnectionAborted, "injected transport failure").into());
        }

        Ok(self.take(buffer, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_reads_respect_chunk_size() {
        let mut transport = FakeTransport::new(b"abcdef").with_chunk_size(4);
        let mut buffer = [0; 8];

        assert_eq!(transport.read_bounded(&mut buffer).unwrap(), 4);
        assert_eq!(transport.read_bounded(&mut buffer).unwrap(), 2);
        assert_eq!(transport.read_bounded(&mut buffer).unwrap(), 0);
        assert_eq!(transport.position(), 6);
    }

    #[test]
    fn delimiter_shortens_reads() {
        let mut transport = FakeTransport::new(b"abc--tail").with_delimiter_at(3);
        let mut buffer = [0; 2];

        assert_eq!(transport.read_until_delimiter(&mut buffer).unwrap(), 2);
        assert_eq!(transport.read_until_delimiter(&mut buffer).unwrap(), 1);
        assert_eq!(transport.delimiter_reads(), 2);
    }

    #[test]
    fn injected_failure() {
        let mut transport = FakeTransport::new(b"abcdef").with_failure_at(2);
        let mut buffer = [0; 8];

        assert_eq!(transport.read_bounded(&mut buffer).unwrap(), 2);
        assert!(matches!(transport.read_bounded(&mut buffer), Err(Error::Transport(_))));
    }
}
