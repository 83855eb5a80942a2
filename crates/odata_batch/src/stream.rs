// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::io::{self, SeekFrom};
use std::sync::Arc;

use tracing::{Level, event};

use crate::listener::StreamListener;
use crate::shared::SharedTransport;
use crate::transport::{ReadTransport, WriteTransport};
use crate::{Error, Result};

/// How a read stream decides where the operation content ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadBound {
    /// The operation declared its content length.
    Length { remaining: u64 },
    /// The content runs until the next boundary delimiter.
    Delimiter { exhausted: bool },
}

/// A read-only view of one operation's content inside a batch.
///
/// The stream reads from the transport shared by the whole batch and stops at the end of its
/// own operation, either after the declared content length or at the next boundary delimiter.
/// It never reads past that point.
///
/// # Disposal
///
/// The owning [`BatchReader`][crate::BatchReader] cannot move on to the next operation until the
/// stream is disposed, either by calling [`dispose()`][Self::dispose] or by dropping it. Disposal
/// releases the stream's handle to the transport without closing it and notifies the listener
/// exactly once.
///
/// # Standard I/O
///
/// The stream also implements [`std::io::Read`], so it can be handed to code that consumes
/// ordinary readers (for example `serde_json::from_reader`).
pub struct OperationReadStream<T> {
    transport: Option<SharedTransport<T>>,
    bound: ReadBound,
    listener: Option<Arc<dyn StreamListener>>,
}

impl<T: ReadTransport> OperationReadStream<T> {
    pub(crate) fn length_bounded(transport: SharedTransport<T>, length: u64, listener: Arc<dyn StreamListener>) -> Self {
        Self {
            transport: Some(transport),
            bound: ReadBound::Length { remaining: length },
            listener: Some(listener),
        }
    }

    pub(crate) fn delimiter_bounded(transport: SharedTransport<T>, listener: Arc<dyn StreamListener>) -> Self {
        Self {
            transport: Some(transport),
            bound: ReadBound::Delimiter { exhausted: false },
            listener: Some(listener),
        }
    }

    /// Reads up to `count` bytes of operation content into `buffer[offset..offset + count]`.
    ///
    /// Returns the number of bytes read; zero means the operation content has ended (or `count`
    /// was zero). For content with a declared length, exactly `min(count, remaining)` bytes are
    /// read.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidArgument`] if the range does not fit in `buffer`. Checked before
    ///   anything else.
    /// * [`Error::Disposed`] if the stream was disposed.
    /// * [`Error::Format`] if the input ends before the content does.
    /// * [`Error::Transport`] if the underlying transport fails, now or earlier in the batch.
    pub fn read(&mut self, buffer: &mut [u8], offset: usize, count: usize) -> Result<usize> {
        validate_range(buffer.len(), offset, count)?;
        let transport = self.transport.as_ref().ok_or(Error::Disposed)?;

        if count == 0 {
            return Ok(0);
        }

        let target = &mut buffer[offset..offset + count];

        match &mut self.bound {
            ReadBound::Length { remaining } => {
                if *remaining == 0 {
                    return Ok(0);
                }

                let wanted = usize::try_from(*remaining).map_or(count, |remaining| remaining.min(count));
                let read = transport.with(|transport| fill_bounded(transport, &mut target[..wanted]))?;
                *remaining -= read as u64;
                Ok(read)
            }
            ReadBound::Delimiter { exhausted } => {
                if *exhausted {
                    return Ok(0);
                }

                let read = transport.with(|transport| transport.read_until_delimiter(target))?;
                if read < count {
                    *exhausted = true;
                }
                Ok(read)
            }
        }
    }

    /// Read streams can be read from.
    #[must_use]
    pub const fn can_read(&self) -> bool {
        true
    }

    /// Read streams cannot be written to.
    #[must_use]
    pub const fn can_write(&self) -> bool {
        false
    }

    /// Read streams cannot seek.
    #[must_use]
    pub const fn can_seek(&self) -> bool {
        false
    }

    /// Not supported on read streams.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::Unsupported`].
    pub fn seek(&mut self, _position: SeekFrom) -> Result<u64> {
        Err(Error::Unsupported("seek"))
    }

    /// Not supported on read streams: the total length is not known up front in general.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::Unsupported`].
    pub fn length(&self) -> Result<u64> {
        Err(Error::Unsupported("length"))
    }

    /// Not supported on read streams.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::Unsupported`].
    pub fn set_length(&mut self, _length: u64) -> Result<()> {
        Err(Error::Unsupported("set_length"))
    }

    /// Not supported on read streams.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::Unsupported`].
    pub fn position(&self) -> Result<u64> {
        Err(Error::Unsupported("position"))
    }

    /// Not supported on read streams.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::Unsupported`].
    pub fn set_position(&mut self, _position: u64) -> Result<()> {
        Err(Error::Unsupported("set_position"))
    }
}

impl<T> OperationReadStream<T> {
    /// Releases the stream's handle to the transport and notifies the listener.
    ///
    /// Calling this more than once has no further effect. Dropping the stream disposes it.
    pub fn dispose(&mut self) {
        self.transport = None;

        if let Some(listener) = self.listener.take() {
            event!(name: "odata_batch.stream.disposed", Level::TRACE, direction = "read");
            listener.stream_disposed();
        }
    }

    /// Whether the stream has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.transport.is_none()
    }
}

impl<T> Drop for OperationReadStream<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T> fmt::Debug for OperationReadStream<T> {
    #[cfg_attr(test, mutants::skip)] // Diagnostics only.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationReadStream")
            .field("bound", &self.bound)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl<T: ReadTransport> io::Read for OperationReadStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = buf.len();
        Self::read(self, buf, 0, count).map_err(Into::into)
    }
}

/// A write-only view of one operation's content inside a batch.
///
/// Bytes are passed straight to the transport shared by the whole batch. The writer does not
/// need to know the content length up front: the operation ends when the stream is disposed.
///
/// # Disposal
///
/// The owning [`BatchWriter`][crate::BatchWriter] cannot start the next operation until the stream
/// is disposed, either by calling [`dispose()`][Self::dispose] or by dropping it. Disposal releases
/// the stream's handle to the transport without closing it and notifies the listener exactly once.
pub struct OperationWriteStream<T> {
    transport: Option<SharedTransport<T>>,
    listener: Option<Arc<dyn StreamListener>>,
}

impl<T: WriteTransport> OperationWriteStream<T> {
    pub(crate) fn new(transport: SharedTransport<T>, listener: Arc<dyn StreamListener>) -> Self {
        Self {
            transport: Some(transport),
            listener: Some(listener),
        }
    }

    /// Writes `buffer[offset..offset + count]` as operation content.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidArgument`] if the range does not fit in `buffer`. Checked before
    ///   anything else.
    /// * [`Error::Disposed`] if the stream was disposed.
    /// * [`Error::Transport`] if the underlying transport fails, now or earlier in the batch.
    pub fn write(&mut self, buffer: &[u8], offset: usize, count: usize) -> Result<()> {
        validate_range(buffer.len(), offset, count)?;
        let transport = self.transport.as_ref().ok_or(Error::Disposed)?;

        transport.with(|transport| transport.write_all(&buffer[offset..offset + count]))
    }

    /// Flushes the underlying transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the stream was disposed and [`Error::Transport`] if the
    /// transport fails.
    pub fn flush(&mut self) -> Result<()> {
        let transport = self.transport.as_ref().ok_or(Error::Disposed)?;
        transport.with(WriteTransport::flush)
    }

    /// Write streams cannot be read from.
    #[must_use]
    pub const fn can_read(&self) -> bool {
        false
    }

    /// Write streams can be written to.
    #[must_use]
    pub const fn can_write(&self) -> bool {
        true
    }

    /// Write streams cannot seek.
    #[must_use]
    pub const fn can_seek(&self) -> bool {
        false
    }

    /// The position of the underlying transport, i.e. the number of bytes written to the batch
    /// so far, including the parts written before this operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the stream was disposed.
    pub fn position(&self) -> Result<u64> {
        let transport = self.transport.as_ref().ok_or(Error::Disposed)?;
        Ok(transport.inspect(WriteTransport::position))
    }

    /// The length of the underlying transport. Writing only ever appends, so this is the same as
    /// [`position()`][Self::position].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the stream was disposed.
    pub fn length(&self) -> Result<u64> {
        self.position()
    }

    /// Not supported on write streams.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::Unsupported`].
    pub fn seek(&mut self, _position: SeekFrom) -> Result<u64> {
        Err(Error::Unsupported("seek"))
    }

    /// Not supported on write streams.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::Unsupported`].
    pub fn set_length(&mut self, _length: u64) -> Result<()> {
        Err(Error::Unsupported("set_length"))
    }

    /// Not supported on write streams.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::Unsupported`].
    pub fn set_position(&mut self, _position: u64) -> Result<()> {
        Err(Error::Unsupported("set_position"))
    }
}

impl<T> OperationWriteStream<T> {
    /// Releases the stream's handle to the transport and notifies the listener.
    ///
    /// Calling this more than once has no further effect. Dropping the stream disposes it.
    pub fn dispose(&mut self) {
        self.transport = None;

        if let Some(listener) = self.listener.take() {
            event!(name: "odata_batch.stream.disposed", Level::TRACE, direction = "write");
            listener.stream_disposed();
        }
    }

    /// Whether the stream has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.transport.is_none()
    }
}

impl<T> Drop for OperationWriteStream<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T> fmt::Debug for OperationWriteStream<T> {
    #[cfg_attr(test, mutants::skip)] // Diagnostics only.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationWriteStream")
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl<T: WriteTransport> io::Write for OperationWriteStream<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Self::write(self, buf, 0, buf.len())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Self::flush(self).map_err(Into::into)
    }
}

fn validate_range(len: usize, offset: usize, count: usize) -> Result<()> {
    if offset > len {
        return Err(Error::invalid_argument("offset", format!("{offset} is past the end of a buffer of {len} bytes")));
    }

    if count > len - offset {
        return Err(Error::invalid_argument(
            "count",
            format!("{count} bytes at offset {offset} do not fit in a buffer of {len} bytes"),
        ));
    }

    Ok(())
}

fn fill_bounded<T: ReadTransport>(transport: &mut T, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;

    while filled < buffer.len() {
        let read = transport.read_bounded(&mut buffer[filled..])?;
        if read == 0 {
            return Err(Error::format("the input ended before the declared content length"));
        }
        filled += read;
    }

    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;
    use crate::testing::{CountingListener, FailingWrite, FakeTransport};
    use crate::transport::BatchWriterStream;

    fn listener() -> (Arc<CountingListener>, Arc<dyn StreamListener>) {
        let listener = Arc::new(CountingListener::new());
        let dyn_listener: Arc<dyn StreamListener> = Arc::clone(&listener) as Arc<dyn StreamListener>;
        (listener, dyn_listener)
    }

    fn length_stream(content: &[u8], length: u64) -> (OperationReadStream<FakeTransport>, Arc<CountingListener>) {
        let (counter, listener) = listener();
        let transport = SharedTransport::new(FakeTransport::new(content));
        (OperationReadStream::length_bounded(transport, length, listener), counter)
    }

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(OperationReadStream<FakeTransport>: Send, Sync);
        static_assertions::assert_impl_all!(OperationWriteStream<BatchWriterStream<Vec<u8>>>: Send, Sync);
    }

    #[test]
    fn length_bounded_reads_min_of_count_and_remaining() {
        for length in 0..=12_u64 {
            for count in 0..=8_usize {
                let (mut stream, _) = length_stream(b"0123456789abcdefgh", length);
                let mut buffer = [0; 10];

                let read = stream.read(&mut buffer, 2, count).unwrap();

                let expected = count.min(usize::try_from(length).unwrap());
                assert_eq!(read, expected, "length {length}, count {count}");
                assert_eq!(&buffer[2..2 + read], &b"0123456789abcdefgh"[..read]);
            }
        }
    }

    #[test]
    fn length_bounded_never_exceeds_declared_length() {
        let (mut stream, _) = length_stream(b"0123456789tail", 10);
        let transport = stream.transport.clone().unwrap();
        let mut buffer = [0; 4];

        let mut total = Vec::new();
        loop {
            let read = stream.read(&mut buffer, 0, 4).unwrap();
            if read == 0 {
                break;
            }
            total.extend_from_slice(&buffer[..read]);
        }

        assert_eq!(total, b"0123456789");
        assert_eq!(transport.inspect(FakeTransport::position), 10);
    }

    #[test]
    fn length_bounded_fills_across_short_transport_reads() {
        let (_, listener) = listener();
        let transport = SharedTransport::new(FakeTransport::new(b"0123456789tail").with_chunk_size(3));
        let mut stream = OperationReadStream::length_bounded(transport.clone(), 10, listener);
        let mut buffer = [0; 8];

        assert_eq!(stream.read(&mut buffer, 0, 8).unwrap(), 8);
        assert_eq!(&buffer, b"01234567");
        assert_eq!(stream.read(&mut buffer, 0, 8).unwrap(), 2);
        assert_eq!(&buffer[..2], b"89");
        assert_eq!(stream.read(&mut buffer, 0, 8).unwrap(), 0);
        assert_eq!(transport.inspect(FakeTransport::position), 10);
    }

    #[test]
    fn transport_failure_inside_content_is_replayed() {
        let (_, listener) = listener();
        let transport = SharedTransport::new(FakeTransport::new(b"0123456789").with_failure_at(4));
        let mut stream = OperationReadStream::length_bounded(transport.clone(), 10, listener);
        let mut buffer = [0; 8];

        assert_eq!(stream.read(&mut buffer, 0, 3).unwrap(), 3);

        let first = stream.read(&mut buffer, 0, 5).unwrap_err();
        assert!(matches!(first, Error::Transport(_)));

        for _ in 0..2 {
            let again = stream.read(&mut buffer, 0, 1).unwrap_err();
            assert_eq!(again.to_string(), first.to_string());
        }
        assert_eq!(transport.inspect(FakeTransport::position), 4);
    }

    #[test]
    fn length_bounded_reports_truncated_input() {
        let (mut stream, _) = length_stream(b"abc", 10);
        let mut buffer = [0; 10];

        assert!(matches!(stream.read(&mut buffer, 0, 10), Err(Error::Format(_))));
        // The transport is poisoned and keeps failing the same way.
        assert!(matches!(stream.read(&mut buffer, 0, 1), Err(Error::Format(_))));
    }

    #[test]
    fn delimiter_bounded_marks_exhausted_on_short_read() {
        let (counter, listener) = listener();
        let transport = SharedTransport::new(FakeTransport::new(b"hello").with_delimiter_at(5));
        let mut stream = OperationReadStream::delimiter_bounded(transport.clone(), listener);
        let mut buffer = [0; 8];

        assert_eq!(stream.read(&mut buffer, 0, 8).unwrap(), 5);
        assert_eq!(stream.read(&mut buffer, 0, 8).unwrap(), 0);
        assert_eq!(transport.inspect(FakeTransport::delimiter_reads), 1);

        drop(stream);
        assert_eq!(counter.disposed(), 1);
    }

    #[test]
    fn argument_validation_precedes_transport_access() {
        let (mut stream, _) = length_stream(b"abc", 3);
        let transport = stream.transport.clone().unwrap();
        let mut buffer = [0; 4];

        assert!(matches!(
            stream.read(&mut buffer, 5, 0),
            Err(Error::InvalidArgument { name: "offset", .. })
        ));
        assert!(matches!(
            stream.read(&mut buffer, 2, 3),
            Err(Error::InvalidArgument { name: "count", .. })
        ));
        assert_eq!(transport.inspect(FakeTransport::position), 0);

        stream.dispose();
        assert!(matches!(stream.read(&mut buffer, 9, 9), Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn dispose_is_idempotent_and_notifies_once() {
        let (mut stream, counter) = length_stream(b"abc", 3);

        stream.dispose();
        stream.dispose();
        assert!(stream.is_disposed());
        drop(stream);

        assert_eq!(counter.disposed(), 1);
    }

    #[test]
    fn io_after_dispose_fails() {
        let (mut stream, _) = length_stream(b"abc", 3);
        stream.dispose();

        let mut buffer = [0; 3];
        assert!(matches!(stream.read(&mut buffer, 0, 3), Err(Error::Disposed)));
    }

    #[test]
    fn read_stream_capabilities() {
        let (mut stream, _) = length_stream(b"abc", 3);

        assert!(stream.can_read());
        assert!(!stream.can_write());
        assert!(!stream.can_seek());
        assert!(matches!(stream.seek(SeekFrom::Start(0)), Err(Error::Unsupported("seek"))));
        assert!(matches!(stream.length(), Err(Error::Unsupported(_))));
        assert!(matches!(stream.set_length(1), Err(Error::Unsupported(_))));
        assert!(matches!(stream.position(), Err(Error::Unsupported(_))));
        assert!(matches!(stream.set_position(1), Err(Error::Unsupported(_))));
    }

    #[test]
    fn std_read_adapter() {
        let (mut stream, _) = length_stream(b"abcdef", 4);

        let mut content = String::new();
        stream.read_to_string(&mut content).unwrap();

        assert_eq!(content, "abcd");
    }

    #[test]
    fn write_stream_delegates_to_transport() {
        let (counter, listener) = listener();
        let transport = SharedTransport::new(BatchWriterStream::new(Vec::new()));
        let mut stream = OperationWriteStream::new(transport.clone(), listener);

        stream.write(b"xxhello", 2, 5).unwrap();
        stream.write_all(b"!").unwrap();
        stream.flush().unwrap();

        assert_eq!(stream.position().unwrap(), 6);
        assert_eq!(stream.length().unwrap(), 6);
        assert!(!stream.can_read());
        assert!(stream.can_write());
        assert!(!stream.can_seek());
        assert!(matches!(stream.seek(SeekFrom::End(0)), Err(Error::Unsupported(_))));
        assert!(matches!(stream.set_length(0), Err(Error::Unsupported(_))));
        assert!(matches!(stream.set_position(0), Err(Error::Unsupported(_))));

        drop(stream);
        assert_eq!(counter.disposed(), 1);

        let written = transport.try_into_inner().unwrap().into_inner();
        assert_eq!(written, b"hello!");
    }

    #[test]
    fn write_stream_validation_and_disposal() {
        let (_, listener) = listener();
        let transport = SharedTransport::new(BatchWriterStream::new(Vec::new()));
        let mut stream = OperationWriteStream::new(transport, listener);

        assert!(matches!(stream.write(b"abc", 1, 3), Err(Error::InvalidArgument { .. })));

        stream.dispose();
        assert!(matches!(stream.write(b"abc", 0, 3), Err(Error::Disposed)));
        assert!(matches!(stream.position(), Err(Error::Disposed)));
        assert!(matches!(stream.flush(), Err(Error::Disposed)));
    }

    #[test]
    fn write_failure_is_replayed() {
        let (_, listener) = listener();
        let transport = SharedTransport::new(BatchWriterStream::new(FailingWrite::after(3)));
        let mut stream = OperationWriteStream::new(transport, listener);

        let first = stream.write(b"abcdef", 0, 6).unwrap_err();
        let second = stream.write(b"a", 0, 1).unwrap_err();

        assert!(matches!(first, Error::Transport(_)));
        assert_eq!(first.to_string(), second.to_string());
    }
}
