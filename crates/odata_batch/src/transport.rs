// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::{ErrorKind, Read, Write};

use tracing::{Level, event};

use crate::headers::OperationHeaders;
use crate::{Error, Result};

// Size of a single read from the underlying reader when the buffer needs more data.
const READ_CHUNK_SIZE: usize = 8 * 1024;

// Header and boundary lines longer than this are rejected instead of buffered without limit.
const MAX_LINE_LENGTH: usize = 16 * 1024;

// A line break before the delimiter and one trailing byte after it must be visible before a
// candidate delimiter can be confirmed.
const DELIMITER_LOOKAHEAD: usize = 3;

/// The byte source that operation read streams delegate to.
///
/// Implementations sit on the single byte stream shared by all operations of a batch. Operation
/// streams apply offsets and counts before delegating, so implementations always fill the whole
/// provided slice or report why they could not.
pub trait ReadTransport: Send {
    /// Reads up to `buffer.len()` bytes without regard for any delimiter.
    ///
    /// Returns the number of bytes read. Zero bytes read for a non-empty buffer means the input
    /// has ended.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the underlying source fails.
    fn read_bounded(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Reads content up to the next delimiter of the innermost active boundary.
    ///
    /// Returns fewer bytes than `buffer.len()` exactly when the delimiter has been reached. The
    /// line break preceding the delimiter belongs to the delimiter and is never returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] if the input ends before a delimiter is found and
    /// [`Error::Transport`] if the underlying source fails.
    fn read_until_delimiter(&mut self, buffer: &mut [u8]) -> Result<usize>;
}

/// The byte sink that operation write streams and batch writers delegate to.
pub trait WriteTransport: Send {
    /// Writes all of `data`. Partial writes are considered a failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the underlying sink fails.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Flushes any buffered data to the underlying sink.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the underlying sink fails.
    fn flush(&mut self) -> Result<()>;

    /// Number of bytes written so far.
    fn position(&self) -> u64;
}

/// What kind of delimiter [`BatchReaderStream::skip_to_boundary`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryKind {
    /// `--boundary`: another part follows.
    Part,
    /// `--boundary--`: the multipart body of this boundary has ended.
    End,
}

#[derive(Debug, Clone, Copy)]
struct DelimiterMatch {
    // Where the content before the delimiter ends (start of the preceding line break).
    content_end: usize,
    // Where `--boundary` starts.
    delimiter_start: usize,
}

/// A buffered multipart reader over the body of a batch message.
///
/// Tracks a stack of active boundaries: the batch boundary at the bottom and, while a changeset
/// is being read, the changeset boundary on top. Delimiters are only recognized at the start of a
/// line and when followed by `--`, a line break, whitespace or the end of the input.
#[derive(Debug)]
pub struct BatchReaderStream<R> {
    inner: R,
    buffer: Vec<u8>,
    start: usize,
    eof: bool,
    at_line_start: bool,
    boundaries: Vec<String>,
    position: u64,
}

impl<R: Read> BatchReaderStream<R> {
    /// Creates a reader for a batch delimited by `boundary`.
    #[must_use]
    pub fn new(inner: R, boundary: impl Into<String>) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            start: 0,
            eof: false,
            at_line_start: true,
            boundaries: vec![boundary.into()],
            position: 0,
        }
    }

    /// The innermost active boundary.
    #[must_use]
    pub fn current_boundary(&self) -> Option<&str> {
        self.boundaries.last().map(String::as_str)
    }

    /// Makes `boundary` the innermost active boundary.
    pub fn push_boundary(&mut self, boundary: impl Into<String>) {
        self.boundaries.push(boundary.into());
    }

    /// Deactivates the innermost boundary.
    pub fn pop_boundary(&mut self) -> Option<String> {
        self.boundaries.pop()
    }

    /// Number of bytes consumed from the underlying reader so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Consumes the stream, returning the underlying reader. Buffered bytes are lost.
    #[must_use]
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Discards everything up to and including the next delimiter line of the innermost boundary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] if the input ends before a delimiter is found.
    pub fn skip_to_boundary(&mut self) -> Result<BoundaryKind> {
        let pattern_len = self.delimiter_pattern()?.len();
        let keep = pattern_len + DELIMITER_LOOKAHEAD;

        loop {
            self.fill_to(keep + READ_CHUNK_SIZE)?;

            if let Some(found) = self.find_delimiter()? {
                self.consume(found.delimiter_start + pattern_len);
                return self.finish_delimiter_line();
            }

            if self.eof {
                return Err(Error::format("the input ended before the next boundary delimiter"));
            }

            let discard = self.available().len().saturating_sub(keep);
            self.consume(discard);
        }
    }

    /// Reads one line, without its line break.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] if the input ends before anything could be read, if the line is
    /// too long or is not valid UTF-8.
    pub fn read_line(&mut self) -> Result<String> {
        loop {
            let available = self.available();

            if let Some(index) = available.iter().position(|byte| *byte == b'\n') {
                let line = decode_line(&available[..index])?;
                self.consume(index + 1);
                return Ok(line);
            }

            if available.len() > MAX_LINE_LENGTH {
                return Err(Error::format(format!("a line is longer than {MAX_LINE_LENGTH} bytes")));
            }

            if self.eof {
                if available.is_empty() {
                    return Err(Error::format("the input ended while a line was expected"));
                }

                let line = decode_line(available)?;
                let len = available.len();
                self.consume(len);
                return Ok(line);
            }

            let wanted = available.len() + 1;
            self.fill_to(wanted)?;
        }
    }

    /// Reads header lines up to and including the blank line that terminates them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] if a header line is malformed or the input ends first.
    pub fn read_headers(&mut self) -> Result<OperationHeaders> {
        let mut headers = OperationHeaders::new();

        loop {
            let line = self.read_line()?;
            if line.is_empty() {
                return Ok(headers);
            }

            let (name, value) = OperationHeaders::parse_line(&line)?;
            headers.insert(name, value);
        }
    }

    fn available(&self) -> &[u8] {
        &self.buffer[self.start..]
    }

    fn consume(&mut self, count: usize) {
        if count == 0 {
            return;
        }

        self.at_line_start = self.available()[count - 1] == b'\n';
        self.start += count;
        self.position += count as u64;
    }

    fn fill_to(&mut self, wanted: usize) -> Result<()> {
        while self.available().len() < wanted && !self.eof {
            if self.start > 0 {
                self.buffer.drain(..self.start);
                self.start = 0;
            }

            let filled = self.buffer.len();
            let grow = READ_CHUNK_SIZE.max(wanted - filled);
            self.buffer.resize(filled + grow, 0);

            let result = loop {
                match self.inner.read(&mut self.buffer[filled..]) {
                    Err(error) if error.kind() == ErrorKind::Interrupted => {}
                    other => break other,
                }
            };

            match result {
                Ok(read) => {
                    self.buffer.truncate(filled + read);
                    self.eof = read == 0;
                }
                Err(error) => {
                    self.buffer.truncate(filled);
                    return Err(error.into());
                }
            }
        }

        Ok(())
    }

    fn delimiter_pattern(&self) -> Result<String> {
        self.current_boundary()
            .map(|boundary| format!("--{boundary}"))
            .ok_or_else(|| Error::internal("no boundary is active"))
    }

    fn find_delimiter(&self) -> Result<Option<DelimiterMatch>> {
        let pattern = self.delimiter_pattern()?;
        let pattern = pattern.as_bytes();
        let data = self.available();

        let mut from = 0;
        while let Some(offset) = find_subslice(&data[from..], pattern) {
            let index = from + offset;
            from = index + 1;

            let at_line_start = if index == 0 { self.at_line_start } else { data[index - 1] == b'\n' };
            if !at_line_start {
                continue;
            }

            let after = index + pattern.len();
            let terminated = match data.get(after) {
                Some(&byte) => matches!(byte, b'-' | b'\r' | b'\n' | b' ' | b'\t'),
                None => self.eof,
            };
            if !terminated {
                continue;
            }

            let content_end = if index >= 2 && &data[index - 2..index] == b"\r\n" {
                index - 2
            } else {
                index.saturating_sub(1)
            };

            return Ok(Some(DelimiterMatch {
                content_end,
                delimiter_start: index,
            }));
        }

        Ok(None)
    }

    // Called with the cursor right after `--boundary`.
    fn finish_delimiter_line(&mut self) -> Result<BoundaryKind> {
        self.fill_to(2)?;

        let kind = if self.available().starts_with(b"--") {
            self.consume(2);
            BoundaryKind::End
        } else {
            BoundaryKind::Part
        };

        // Transport padding up to the end of the line. The closing delimiter may be the last
        // thing in the input.
        if !(kind == BoundaryKind::End && self.available().is_empty() && self.eof) {
            self.read_line()?;
        }

        event!(
            name: "odata_batch.transport.delimiter",
            Level::TRACE,
            boundary = self.current_boundary(),
            kind = ?kind,
            position = self.position,
        );

        Ok(kind)
    }
}

impl<R: Read + Send> ReadTransport for BatchReaderStream<R> {
    fn read_bounded(&mut self, buffer: &mut [u8]) -> Result<usize> {
        self.fill_to(1)?;

        let count = buffer.len().min(self.available().len());
        buffer[..count].copy_from_slice(&self.available()[..count]);
        self.consume(count);

        Ok(count)
    }

    fn read_until_delimiter(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let pattern_len = self.delimiter_pattern()?.len();
        self.fill_to(buffer.len() + pattern_len + DELIMITER_LOOKAHEAD)?;

        let count = match self.find_delimiter()? {
            Some(found) => buffer.len().min(found.content_end),
            None if self.available().len() < buffer.len() => {
                return Err(Error::format("the input ended inside operation content"));
            }
            None => buffer.len(),
        };

        buffer[..count].copy_from_slice(&self.available()[..count]);
        self.consume(count);

        Ok(count)
    }
}

/// A multipart writer over the body of a batch message.
///
/// Forwards bytes to the underlying writer and keeps track of how many were written.
#[derive(Debug)]
pub struct BatchWriterStream<W> {
    inner: W,
    position: u64,
}

impl<W: Write> BatchWriterStream<W> {
    /// Creates a writer over `inner`.
    #[must_use]
    pub fn new(inner: W) -> Self {
        Self { inner, position: 0 }
    }

    /// References the underlying writer.
    #[must_use]
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Consumes the stream, returning the underlying writer.
    #[must_use]
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Send> WriteTransport for BatchWriterStream<W> {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }

    haystack.windows(needle.len()).position(|window| window == needle)
}

fn decode_line(bytes: &[u8]) -> Result<String> {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);

    String::from_utf8(bytes.to_vec()).map_err(|error| Error::format(format!("a line is not valid UTF-8: {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(payload: &str) -> BatchReaderStream<&[u8]> {
        BatchReaderStream::new(payload.as_bytes(), "b")
    }

    fn read_content(stream: &mut BatchReaderStream<&[u8]>, chunk: usize) -> Vec<u8> {
        let mut content = Vec::new();
        let mut buffer = vec![0; chunk];

        loop {
            let read = stream.read_until_delimiter(&mut buffer).unwrap();
            content.extend_from_slice(&buffer[..read]);
            if read < chunk {
                return content;
            }
        }
    }

    #[test]
    fn skips_preamble_and_reports_delimiters() {
        let mut stream = reader("preamble\r\n--b\r\nA: 1\r\n\r\n--b--\r\nepilogue");

        assert_eq!(stream.skip_to_boundary().unwrap(), BoundaryKind::Part);
        assert_eq!(stream.read_headers().unwrap().get("a"), Some("1"));
        assert_eq!(stream.skip_to_boundary().unwrap(), BoundaryKind::End);
    }

    #[test]
    fn content_excludes_line_break_before_delimiter() {
        for chunk in [1, 2, 3, 5, 64] {
            let mut stream = reader("--b\r\n\r\nhello\r\nworld\r\n--b--");
            stream.skip_to_boundary().unwrap();
            stream.read_headers().unwrap();

            assert_eq!(read_content(&mut stream, chunk), b"hello\r\nworld", "chunk size {chunk}");
            assert_eq!(stream.skip_to_boundary().unwrap(), BoundaryKind::End);
        }
    }

    #[test]
    fn bare_line_feeds_are_accepted() {
        let mut stream = reader("--b\n\nbody\n--b--\n");
        stream.skip_to_boundary().unwrap();
        stream.read_headers().unwrap();

        assert_eq!(read_content(&mut stream, 16), b"body");
    }

    #[test]
    fn empty_content_directly_before_delimiter() {
        let mut stream = reader("--b\r\n\r\n--b--");
        stream.skip_to_boundary().unwrap();
        stream.read_headers().unwrap();

        assert_eq!(read_content(&mut stream, 8), b"");
        assert_eq!(stream.skip_to_boundary().unwrap(), BoundaryKind::End);
    }

    #[test]
    fn longer_boundary_with_same_prefix_is_content() {
        let mut stream = reader("--b\r\n\r\nx\r\n--bb\r\n--b--");
        stream.skip_to_boundary().unwrap();
        stream.read_headers().unwrap();

        assert_eq!(read_content(&mut stream, 4), b"x\r\n--bb");
    }

    #[test]
    fn delimiter_not_at_line_start_is_content() {
        let mut stream = reader("--b\r\n\r\nab--b\r\n--b--");
        stream.skip_to_boundary().unwrap();
        stream.read_headers().unwrap();

        assert_eq!(read_content(&mut stream, 4), b"ab--b");
    }

    #[test]
    fn missing_delimiter_is_format_error() {
        let mut stream = reader("--b\r\n\r\nno end in sight");
        stream.skip_to_boundary().unwrap();
        stream.read_headers().unwrap();

        let mut buffer = [0; 64];
        assert!(matches!(stream.read_until_delimiter(&mut buffer), Err(Error::Format(_))));

        let mut stream = reader("nothing here");
        assert!(matches!(stream.skip_to_boundary(), Err(Error::Format(_))));
    }

    #[test]
    fn nested_boundaries() {
        let mut stream = reader("--b\r\n\r\n--c\r\n\r\ninner\r\n--c--\r\n--b--");
        stream.skip_to_boundary().unwrap();
        stream.read_headers().unwrap();

        stream.push_boundary("c");
        assert_eq!(stream.skip_to_boundary().unwrap(), BoundaryKind::Part);
        stream.read_headers().unwrap();
        assert_eq!(read_content(&mut stream, 3), b"inner");
        assert_eq!(stream.skip_to_boundary().unwrap(), BoundaryKind::End);

        assert_eq!(stream.pop_boundary().as_deref(), Some("c"));
        assert_eq!(stream.current_boundary(), Some("b"));
        assert_eq!(stream.skip_to_boundary().unwrap(), BoundaryKind::End);
    }

    #[test]
    fn bounded_reads_ignore_delimiters() {
        let mut stream = reader("--b\r\n--b--");
        let mut buffer = [0; 4];

        assert_eq!(stream.read_bounded(&mut buffer).unwrap(), 4);
        assert_eq!(&buffer, b"--b\r");
        assert_eq!(stream.position(), 4);
    }

    #[test]
    fn overly_long_line_is_rejected() {
        let payload = "x".repeat(MAX_LINE_LENGTH + READ_CHUNK_SIZE);
        let mut stream = reader(&payload);

        assert!(matches!(stream.read_line(), Err(Error::Format(_))));
    }

    #[test]
    fn writer_tracks_position() {
        let mut stream = BatchWriterStream::new(Vec::new());

        stream.write_all(b"abc").unwrap();
        stream.write_all(b"de").unwrap();
        stream.flush().unwrap();

        assert_eq!(stream.position(), 5);
        assert_eq!(stream.get_ref(), b"abcde");
        assert_eq!(stream.into_inner(), b"abcde");
    }
}
