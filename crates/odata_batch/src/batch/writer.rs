// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::Write;
use std::sync::Arc;

use tracing::{Level, event};

use super::{BatchState, StateCell, ensure_usable, intercept, sequencing_error};
use crate::headers::{
    APPLICATION_HTTP, BatchOperation, CONTENT_ID, CONTENT_TRANSFER_ENCODING, CONTENT_TYPE, MULTIPART_MIXED, generate_batch_boundary,
    generate_changeset_boundary,
};
use crate::listener::StreamListener;
use crate::shared::SharedTransport;
use crate::stream::OperationWriteStream;
use crate::transport::{BatchWriterStream, WriteTransport};
use crate::{Error, MessageQuotas, Result};

#[derive(Debug)]
struct Changeset {
    boundary: String,
    operations: usize,
}

/// Writes the operations of a multipart batch message one at a time.
///
/// [`create_operation_stream()`] writes the framing of the next operation and hands out an
/// [`OperationWriteStream`] for its content. The content ends when that stream is disposed;
/// until then the writer refuses to start anything else. [`write_batch_terminator()`] closes
/// the batch.
///
/// Every delimiter is written together with the line break that precedes it, so operation
/// content is never followed by an extra line break of its own.
///
/// Once the underlying sink fails, the writer is unusable: every later call fails with the
/// same error.
///
/// [`create_operation_stream()`]: Self::create_operation_stream
/// [`write_batch_terminator()`]: Self::write_batch_terminator
///
/// # Examples
///
/// ```
/// use std::io::Write;
///
/// use odata_batch::{BatchOperation, BatchWriter, OperationLine};
///
/// let mut writer = BatchWriter::new(Vec::new(), "batch_1");
///
/// let operation = BatchOperation::new(OperationLine::request("POST", "Customers"))
///     .with_header("Content-Type", "application/json");
/// let mut stream = writer.create_operation_stream(&operation)?;
/// stream.write_all(br#"{"Name":"Ada"}"#)?;
/// drop(stream);
///
/// writer.write_batch_terminator()?;
///
/// let payload = String::from_utf8(writer.into_inner()?)?;
/// assert!(payload.ends_with("\r\n--batch_1--\r\n"));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct BatchWriter<W> {
    transport: SharedTransport<BatchWriterStream<W>>,
    state: Arc<StateCell>,
    boundary: String,
    quotas: MessageQuotas,
    parts: usize,
    changeset: Option<Changeset>,
}

impl<W: Write + Send> BatchWriter<W> {
    /// Creates a writer for a batch delimited by `boundary`, with default quotas.
    #[must_use]
    pub fn new(sink: W, boundary: impl Into<String>) -> Self {
        Self::with_quotas(sink, boundary, MessageQuotas::default())
    }

    /// Creates a writer for a batch delimited by a freshly generated boundary.
    #[must_use]
    pub fn with_generated_boundary(sink: W) -> Self {
        Self::new(sink, generate_batch_boundary())
    }

    /// Creates a writer for a batch delimited by `boundary`.
    #[must_use]
    pub fn with_quotas(sink: W, boundary: impl Into<String>, quotas: MessageQuotas) -> Self {
        Self {
            transport: SharedTransport::new(BatchWriterStream::new(sink)),
            state: Arc::new(StateCell::new("writer")),
            boundary: boundary.into(),
            quotas,
            parts: 0,
            changeset: None,
        }
    }

    /// The batch boundary.
    #[must_use]
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// The value of the `Content-Type` header of the HTTP message carrying the batch.
    #[must_use]
    pub fn content_type(&self) -> String {
        format!("{MULTIPART_MIXED}; boundary={}", self.boundary)
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> BatchState {
        if self.transport.failure().is_some() {
            BatchState::Exception
        } else {
            self.state.get()
        }
    }

    /// Writes the framing of `operation` and hands out a stream for its content.
    ///
    /// Inside a changeset opened with [`start_changeset()`][Self::start_changeset], the operation
    /// is written to that changeset; the [`changeset`][BatchOperation::changeset] field of
    /// `operation` is not consulted.
    ///
    /// # Errors
    ///
    /// * [`Error::Sequencing`] if the previous operation stream is still live, or the writer has
    ///   completed or failed.
    /// * [`Error::QuotaExceeded`] if the batch or changeset would get more parts than allowed.
    /// * [`Error::Transport`] if the sink fails, now or earlier.
    pub fn create_operation_stream(&mut self, operation: &BatchOperation) -> Result<OperationWriteStream<BatchWriterStream<W>>> {
        const OPERATION: &str = "create_operation_stream";

        self.ensure_idle(OPERATION)?;

        let result = self.write_operation_framing(operation);
        intercept(&self.state, &self.transport, result)?;

        let listener = Arc::clone(&self.state) as Arc<dyn StreamListener>;
        let stream = OperationWriteStream::new(self.transport.clone(), listener);

        event!(
            name: "odata_batch.writer.stream_created",
            Level::DEBUG,
            operation.line = %operation.line,
            operation.content_id = operation.content_id.as_deref(),
        );
        self.state.set(BatchState::OperationStreamActive);

        Ok(stream)
    }

    /// Opens a changeset and returns its boundary.
    ///
    /// Operations created until [`end_changeset()`][Self::end_changeset] belong to it.
    ///
    /// # Errors
    ///
    /// * [`Error::Sequencing`] if a changeset is already open or an operation stream is live.
    /// * [`Error::QuotaExceeded`] if the batch would get more parts than allowed.
    /// * [`Error::Transport`] if the sink fails, now or earlier.
    pub fn start_changeset(&mut self) -> Result<String> {
        const OPERATION: &str = "start_changeset";

        self.ensure_idle(OPERATION)?;

        if self.changeset.is_some() {
            return Err(sequencing_error(OPERATION, self.state.get()));
        }

        let boundary = generate_changeset_boundary();
        let result = self.write_changeset_start(&boundary);
        intercept(&self.state, &self.transport, result)?;

        event!(
            name: "odata_batch.writer.changeset_start",
            Level::DEBUG,
            changeset.boundary = %boundary,
        );
        self.changeset = Some(Changeset {
            boundary: boundary.clone(),
            operations: 0,
        });

        Ok(boundary)
    }

    /// Closes the open changeset.
    ///
    /// # Errors
    ///
    /// * [`Error::Sequencing`] if no changeset is open or an operation stream is live.
    /// * [`Error::Transport`] if the sink fails, now or earlier.
    pub fn end_changeset(&mut self) -> Result<()> {
        const OPERATION: &str = "end_changeset";

        self.ensure_idle(OPERATION)?;

        let Some(changeset) = self.changeset.take() else {
            return Err(sequencing_error(OPERATION, self.state.get()));
        };

        let result = self.write(format!("\r\n--{}--\r\n", changeset.boundary).as_bytes());
        intercept(&self.state, &self.transport, result)?;

        event!(
            name: "odata_batch.writer.changeset_end",
            Level::DEBUG,
            changeset.boundary = %changeset.boundary,
            changeset.operations = changeset.operations,
        );

        Ok(())
    }

    /// Writes the closing delimiter of the batch and flushes the sink.
    ///
    /// # Errors
    ///
    /// * [`Error::Sequencing`] if a changeset is still open, an operation stream is live, or the
    ///   writer has completed or failed.
    /// * [`Error::Transport`] if the sink fails, now or earlier.
    pub fn write_batch_terminator(&mut self) -> Result<()> {
        const OPERATION: &str = "write_batch_terminator";

        self.ensure_idle(OPERATION)?;

        if self.changeset.is_some() {
            return Err(sequencing_error(OPERATION, self.state.get()));
        }

        let terminator = format!("\r\n--{}--\r\n", self.boundary);
        let result = self.write(terminator.as_bytes()).and_then(|()| self.transport.with(WriteTransport::flush));
        intercept(&self.state, &self.transport, result)?;

        event!(name: "odata_batch.writer.completed", Level::DEBUG, parts = self.parts);
        self.state.set(BatchState::Completed);

        Ok(())
    }

    /// Flushes the sink.
    ///
    /// # Errors
    ///
    /// * [`Error::Sequencing`] if an operation stream is live; flush through the stream instead.
    /// * [`Error::Transport`] if the sink fails, now or earlier.
    pub fn flush(&mut self) -> Result<()> {
        const OPERATION: &str = "flush";

        ensure_flushable(&self.state, &self.transport, OPERATION)?;

        let result = self.transport.with(WriteTransport::flush);
        intercept(&self.state, &self.transport, result)
    }

    /// Consumes the writer, returning the underlying sink.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sequencing`] if an operation stream is still live.
    pub fn into_inner(self) -> Result<W> {
        let state = self.state.get();
        if state == BatchState::OperationStreamActive || self.transport.is_shared() {
            return Err(sequencing_error("into_inner", state));
        }

        self.transport
            .try_into_inner()
            .map(BatchWriterStream::into_inner)
            .map_err(|_transport| Error::internal("the transport is still shared"))
    }

    fn ensure_idle(&self, operation: &'static str) -> Result<()> {
        ensure_usable(&self.state, &self.transport, operation)?;

        match self.state.get() {
            BatchState::Start | BatchState::OperationStreamDisposed => Ok(()),
            state => Err(sequencing_error(operation, state)),
        }
    }

    fn write_operation_framing(&mut self, operation: &BatchOperation) -> Result<()> {
        let boundary = match &mut self.changeset {
            Some(changeset) => {
                changeset.operations += 1;
                if changeset.operations > self.quotas.max_operations_per_changeset() {
                    return Err(Error::QuotaExceeded {
                        quota: "operations per changeset",
                        limit: self.quotas.max_operations_per_changeset(),
                    });
                }
                changeset.boundary.clone()
            }
            None => {
                self.count_part()?;
                self.boundary.clone()
            }
        };

        let mut framing = self.delimiter(&boundary);
        push_header(&mut framing, CONTENT_TYPE, APPLICATION_HTTP);
        push_header(&mut framing, CONTENT_TRANSFER_ENCODING, "binary");
        if let Some(content_id) = &operation.content_id {
            push_header(&mut framing, CONTENT_ID, content_id);
        }
        framing.push_str("\r\n");

        framing.push_str(&operation.line.to_string());
        framing.push_str("\r\n");
        for (name, value) in operation.headers.iter() {
            push_header(&mut framing, name, value);
        }
        framing.push_str("\r\n");

        self.write(framing.as_bytes())
    }

    fn write_changeset_start(&mut self, changeset_boundary: &str) -> Result<()> {
        self.count_part()?;

        let mut framing = self.delimiter(&self.boundary);
        push_header(
            &mut framing,
            CONTENT_TYPE,
            &format!("{MULTIPART_MIXED}; boundary={changeset_boundary}"),
        );
        framing.push_str("\r\n");

        self.write(framing.as_bytes())
    }

    fn count_part(&mut self) -> Result<()> {
        self.parts += 1;
        if self.parts > self.quotas.max_parts_per_batch() {
            return Err(Error::QuotaExceeded {
                quota: "parts per batch",
                limit: self.quotas.max_parts_per_batch(),
            });
        }
        Ok(())
    }

    // The very first delimiter starts the body and needs no line break before it.
    fn delimiter(&self, boundary: &str) -> String {
        let at_start = self.transport.inspect(WriteTransport::position) == 0;
        if at_start {
            format!("--{boundary}\r\n")
        } else {
            format!("\r\n--{boundary}\r\n")
        }
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        self.transport.with(|transport| transport.write_all(data))
    }
}

fn ensure_flushable<T>(state: &StateCell, transport: &SharedTransport<T>, operation: &'static str) -> Result<()> {
    if let Some(failure) = transport.failure() {
        state.set(BatchState::Exception);
        return Err(failure);
    }

    match state.get() {
        current @ (BatchState::OperationStreamActive | BatchState::Exception) => Err(sequencing_error(operation, current)),
        _ => Ok(()),
    }
}

fn push_header(framing: &mut String, name: &str, value: &str) {
    framing.push_str(name);
    framing.push_str(": ");
    framing.push_str(value);
    framing.push_str("\r\n");
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::headers::OperationLine;
    use crate::testing::FailingWrite;

    fn written(writer: BatchWriter<Vec<u8>>) -> String {
        String::from_utf8(writer.into_inner().unwrap()).unwrap()
    }

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(BatchWriter<Vec<u8>>: Send, Sync);
    }

    #[test]
    fn writes_framing_content_and_terminator() {
        let mut writer = BatchWriter::new(Vec::new(), "b");
        assert_eq!(writer.content_type(), "multipart/mixed; boundary=b");

        let operation = BatchOperation::new(OperationLine::request("POST", "Customers"))
            .with_content_id("1")
            .with_header("Content-Type", "application/json");
        let mut stream = writer.create_operation_stream(&operation).unwrap();
        stream.write_all(b"{}").unwrap();
        drop(stream);

        let empty = BatchOperation::new(OperationLine::request("GET", "Orders"));
        drop(writer.create_operation_stream(&empty).unwrap());

        writer.write_batch_terminator().unwrap();
        assert_eq!(writer.state(), BatchState::Completed);

        assert_eq!(
            written(writer),
            "--b\r\n\
             Content-Type: application/http\r\n\
             Content-Transfer-Encoding: binary\r\n\
             Content-ID: 1\r\n\
             \r\n\
             POST Customers HTTP/1.1\r\n\
             Content-Type: application/json\r\n\
             \r\n\
             {}\
             \r\n--b\r\n\
             Content-Type: application/http\r\n\
             Content-Transfer-Encoding: binary\r\n\
             \r\n\
             GET Orders HTTP/1.1\r\n\
             \r\n\
             \r\n--b--\r\n"
        );
    }

    #[test]
    fn second_stream_requires_disposal() {
        let mut writer = BatchWriter::new(Vec::new(), "b");
        let operation = BatchOperation::new(OperationLine::request("GET", "A"));

        let mut stream = writer.create_operation_stream(&operation).unwrap();
        stream.write(b"12345", 0, 5).unwrap();

        assert!(matches!(
            writer.create_operation_stream(&operation),
            Err(Error::Sequencing {
                state: "OperationStreamActive",
                ..
            })
        ));
        assert!(matches!(writer.write_batch_terminator(), Err(Error::Sequencing { .. })));
        assert!(matches!(writer.flush(), Err(Error::Sequencing { .. })));

        stream.dispose();
        assert_eq!(writer.state(), BatchState::OperationStreamDisposed);
        drop(writer.create_operation_stream(&operation).unwrap());
    }

    #[test]
    fn changesets_wrap_operations() {
        let mut writer = BatchWriter::new(Vec::new(), "b");
        let operation = BatchOperation::new(OperationLine::request("POST", "A"));

        let changeset = writer.start_changeset().unwrap();
        assert!(changeset.starts_with("changeset_"));
        assert!(matches!(writer.start_changeset(), Err(Error::Sequencing { .. })));

        drop(writer.create_operation_stream(&operation).unwrap());
        assert!(matches!(writer.write_batch_terminator(), Err(Error::Sequencing { .. })));

        writer.end_changeset().unwrap();
        assert!(matches!(writer.end_changeset(), Err(Error::Sequencing { .. })));
        writer.write_batch_terminator().unwrap();

        let payload = written(writer);
        assert!(payload.starts_with(&format!("--b\r\nContent-Type: multipart/mixed; boundary={changeset}\r\n\r\n\r\n--{changeset}\r\n")));
        assert!(payload.ends_with(&format!("\r\n--{changeset}--\r\n\r\n--b--\r\n")));
    }

    #[test]
    fn quotas_are_enforced() {
        let quotas = MessageQuotas::default().with_max_parts_per_batch(1);
        let mut writer = BatchWriter::with_quotas(Vec::new(), "b", quotas);
        let operation = BatchOperation::new(OperationLine::request("GET", "A"));

        drop(writer.create_operation_stream(&operation).unwrap());
        assert!(matches!(
            writer.create_operation_stream(&operation),
            Err(Error::QuotaExceeded { limit: 1, .. })
        ));
        assert_eq!(writer.state(), BatchState::Exception);
    }

    #[test]
    fn sink_failure_is_replayed() {
        let mut writer = BatchWriter::new(FailingWrite::after(8), "b");
        let operation = BatchOperation::new(OperationLine::request("GET", "A"));

        let first = writer.create_operation_stream(&operation).unwrap_err();
        assert!(matches!(first, Error::Transport(_)));
        assert_eq!(writer.state(), BatchState::Exception);

        for second in [
            writer.create_operation_stream(&operation).unwrap_err(),
            writer.write_batch_terminator().unwrap_err(),
            writer.flush().unwrap_err(),
        ] {
            assert_eq!(first.to_string(), second.to_string());
        }
    }

    #[test]
    fn failure_inside_stream_poisons_writer() {
        let mut writer = BatchWriter::new(FailingWrite::after(200), "b");
        let operation = BatchOperation::new(OperationLine::request("POST", "A"));

        let mut stream = writer.create_operation_stream(&operation).unwrap();
        let error = stream.write(&[0; 300], 0, 300).unwrap_err();
        drop(stream);

        assert_eq!(writer.state(), BatchState::Exception);
        assert_eq!(writer.write_batch_terminator().unwrap_err().to_string(), error.to_string());
    }

    #[test]
    fn completed_writer_rejects_operations() {
        let mut writer = BatchWriter::with_generated_boundary(Vec::new());
        assert!(writer.boundary().starts_with("batch_"));

        writer.write_batch_terminator().unwrap();
        writer.flush().unwrap();

        let operation = BatchOperation::new(OperationLine::request("GET", "A"));
        assert!(matches!(
            writer.create_operation_stream(&operation),
            Err(Error::Sequencing { state: "Completed", .. })
        ));
    }

    #[test]
    fn into_inner_requires_disposed_stream() {
        let mut writer = BatchWriter::new(Vec::new(), "b");
        let operation = BatchOperation::new(OperationLine::request("GET", "A"));

        let stream = writer.create_operation_stream(&operation).unwrap();
        assert!(matches!(
            writer.into_inner(),
            Err(Error::Sequencing {
                operation: "into_inner",
                ..
            })
        ));
        drop(stream);
    }
}
