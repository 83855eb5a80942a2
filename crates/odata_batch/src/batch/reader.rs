// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::Read;
use std::sync::Arc;

use tracing::{Level, event};

use super::{BatchState, StateCell, ensure_usable, intercept, sequencing_error};
use crate::headers::{APPLICATION_HTTP, BatchOperation, CONTENT_ID, CONTENT_TYPE, OperationHeaders, OperationLine};
use crate::listener::StreamListener;
use crate::shared::SharedTransport;
use crate::stream::OperationReadStream;
use crate::transport::{BatchReaderStream, BoundaryKind, ReadTransport};
use crate::{Error, MessageQuotas, Result};

// Scratch size used when discarding content the caller did not read.
const SKIP_BUFFER_SIZE: usize = 4096;

#[derive(Debug)]
struct Changeset {
    boundary: String,
    operations: usize,
}

#[derive(Debug, Clone, Copy)]
struct CurrentOperation {
    content_start: u64,
    content_length: Option<u64>,
}

/// Reads the operations of a multipart batch message one at a time.
///
/// The reader walks the batch in order. For each operation, [`read_operation_headers()`] returns
/// its request or response line and headers, then [`read_next_operation_body()`] hands out an
/// [`OperationReadStream`] over its content. Only one operation stream can be live at a time: the
/// reader refuses to move on until that stream has been disposed.
///
/// Content with a declared `Content-Length` is read by length; otherwise it runs until the next
/// boundary delimiter. Content the caller did not read is skipped when the reader moves on.
///
/// Changesets are entered and left transparently; operations inside a changeset report the
/// changeset boundary in [`BatchOperation::changeset`].
///
/// [`read_operation_headers()`]: Self::read_operation_headers
/// [`read_next_operation_body()`]: Self::read_next_operation_body
///
/// # Examples
///
/// ```
/// use std::io::Read;
///
/// use odata_batch::BatchReader;
///
/// let payload = "--batch_1\r\n\
///     Content-Type: application/http\r\n\
///     \r\n\
///     GET Customers HTTP/1.1\r\n\
///     \r\n\
///     \r\n\
///     --batch_1--\r\n";
///
/// let mut reader = BatchReader::new(payload.as_bytes(), "batch_1");
///
/// while let Some(operation) = reader.read_operation_headers()? {
///     let mut content = Vec::new();
///     reader.read_next_operation_body()?.read_to_end(&mut content)?;
///     println!("{:?}: {} bytes", operation.line, content.len());
/// }
///
/// assert!(reader.is_completed());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct BatchReader<R> {
    transport: SharedTransport<BatchReaderStream<R>>,
    state: Arc<StateCell>,
    quotas: MessageQuotas,
    parts: usize,
    changeset: Option<Changeset>,
    current: Option<CurrentOperation>,
}

impl<R: Read + Send> BatchReader<R> {
    /// Creates a reader for a batch delimited by `boundary`, with default quotas.
    #[must_use]
    pub fn new(input: R, boundary: impl Into<String>) -> Self {
        Self::with_quotas(input, boundary, MessageQuotas::default())
    }

    /// Creates a reader for a batch delimited by `boundary`.
    #[must_use]
    pub fn with_quotas(input: R, boundary: impl Into<String>, quotas: MessageQuotas) -> Self {
        Self {
            transport: SharedTransport::new(BatchReaderStream::new(input, boundary)),
            state: Arc::new(StateCell::new("reader")),
            quotas,
            parts: 0,
            changeset: None,
            current: None,
        }
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

    /// Whether the end of the batch has been read.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state() == BatchState::Completed
    }

    /// Moves to the next operation and returns its line and headers.
    ///
    /// Returns `None` once the closing delimiter of the batch has been read. Any content of the
    /// previous operation that was not read is skipped.
    ///
    /// # Errors
    ///
    /// * [`Error::Sequencing`] if the previous operation stream is still live, or the reader has
    ///   completed or failed.
    /// * [`Error::QuotaExceeded`] if the batch has more parts or a changeset more operations than
    ///   the quotas allow.
    /// * [`Error::Format`] if the payload is malformed and [`Error::Transport`] if the input fails.
    pub fn read_operation_headers(&mut self) -> Result<Option<BatchOperation>> {
        const OPERATION: &str = "read_operation_headers";

        ensure_usable(&self.state, &self.transport, OPERATION)?;

        match self.state.get() {
            BatchState::Start | BatchState::OperationHeaders | BatchState::OperationStreamDisposed => {}
            state => return Err(sequencing_error(OPERATION, state)),
        }

        let result = self.advance();
        intercept(&self.state, &self.transport, result)
    }

    /// Hands out a stream over the content of the operation whose headers were just read.
    ///
    /// The stream must be disposed (or dropped) before the reader can move to the next operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sequencing`] unless the reader is positioned right after the headers of
    /// an operation, which includes the case of an operation stream that is still live.
    pub fn read_next_operation_body(&mut self) -> Result<OperationReadStream<BatchReaderStream<R>>> {
        const OPERATION: &str = "read_next_operation_body";

        ensure_usable(&self.state, &self.transport, OPERATION)?;

        let state = self.state.get();
        if state != BatchState::OperationHeaders {
            return Err(sequencing_error(OPERATION, state));
        }

        let current = self
            .current
            .ok_or_else(|| Error::internal("operation headers were read but no operation is current"))?;

        let transport = self.transport.clone();
        let listener = Arc::clone(&self.state) as Arc<dyn StreamListener>;

        let stream = match current.content_length {
            Some(length) => OperationReadStream::length_bounded(transport, length, listener),
            None => OperationReadStream::delimiter_bounded(transport, listener),
        };

        event!(
            name: "odata_batch.reader.stream_created",
            Level::DEBUG,
            content_length = current.content_length,
        );
        self.state.set(BatchState::OperationStreamActive);

        Ok(stream)
    }

    /// Consumes the reader, returning the underlying input.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sequencing`] if an operation stream is still live.
    pub fn into_inner(self) -> Result<R> {
        let state = self.state.get();
        if state == BatchState::OperationStreamActive || self.transport.is_shared() {
            return Err(sequencing_error("into_inner", state));
        }

        self.transport
            .try_into_inner()
            .map(BatchReaderStream::into_inner)
            .map_err(|_transport| Error::internal("the transport is still shared"))
    }

    fn advance(&mut self) -> Result<Option<BatchOperation>> {
        self.skip_unread_content()?;

        loop {
            let kind = self.transport.with(BatchReaderStream::skip_to_boundary)?;

            match (kind, self.changeset.take()) {
                (BoundaryKind::End, Some(changeset)) => {
                    self.transport.with(|transport| {
                        transport.pop_boundary();
                        Ok(())
                    })?;
                    event!(
                        name: "odata_batch.reader.changeset_end",
                        Level::DEBUG,
                        changeset.boundary = %changeset.boundary,
                        changeset.operations = changeset.operations,
                    );
                }
                (BoundaryKind::End, None) => {
                    self.current = None;
                    self.state.set(BatchState::Completed);
                    return Ok(None);
                }
                (BoundaryKind::Part, changeset) => {
                    self.changeset = changeset;

                    let part_headers = self.transport.with(BatchReaderStream::read_headers)?;

                    if let Some(boundary) = part_headers.content_type_boundary() {
                        self.enter_changeset(boundary.to_owned())?;
                        continue;
                    }

                    return self.read_operation(&part_headers).map(Some);
                }
            }
        }
    }

    fn enter_changeset(&mut self, boundary: String) -> Result<()> {
        if self.changeset.is_some() {
            return Err(Error::format("changesets cannot be nested"));
        }

        self.count_part()?;

        self.transport.with(|transport| {
            transport.push_boundary(boundary.clone());
            Ok(())
        })?;

        event!(
            name: "odata_batch.reader.changeset_start",
            Level::DEBUG,
            changeset.boundary = %boundary,
        );
        self.changeset = Some(Changeset { boundary, operations: 0 });

        Ok(())
    }

    fn read_operation(&mut self, part_headers: &OperationHeaders) -> Result<BatchOperation> {
        validate_part_content_type(part_headers)?;

        match &mut self.changeset {
            Some(changeset) => {
                changeset.operations += 1;
                if changeset.operations > self.quotas.max_operations_per_changeset() {
                    return Err(Error::QuotaExceeded {
                        quota: "operations per changeset",
                        limit: self.quotas.max_operations_per_changeset(),
                    });
                }
            }
            None => self.count_part()?,
        }

        let (line, headers, content_start) = self.transport.with(|transport| {
            let line = transport.read_line()?;
            let headers = transport.read_headers()?;
            Ok((line, headers, transport.position()))
        })?;

        let line = OperationLine::parse(&line)?;
        let content_length = headers.content_length()?;

        self.current = Some(CurrentOperation {
            content_start,
            content_length,
        });
        self.state.set(BatchState::OperationHeaders);

        Ok(BatchOperation {
            line,
            headers,
            content_id: part_headers.get(CONTENT_ID).map(str::to_owned),
            changeset: self.changeset.as_ref().map(|changeset| changeset.boundary.clone()),
        })
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

    // Content with a declared length may itself contain text that looks like a delimiter, so it
    // is skipped by length before searching for the next delimiter.
    fn skip_unread_content(&mut self) -> Result<()> {
        let Some(current) = self.current.take() else {
            return Ok(());
        };
        let Some(length) = current.content_length else {
            return Ok(());
        };

        self.transport.with(|transport| {
            let consumed = transport.position() - current.content_start;
            let mut remaining = length.saturating_sub(consumed);
            let mut scratch = [0; SKIP_BUFFER_SIZE];

            while remaining > 0 {
                let wanted = usize::try_from(remaining).map_or(SKIP_BUFFER_SIZE, |remaining| remaining.min(SKIP_BUFFER_SIZE));
                let read = transport.read_bounded(&mut scratch[..wanted])?;
                if read == 0 {
                    return Err(Error::format("the input ended before the declared content length"));
                }
                remaining -= read as u64;
            }

            Ok(())
        })
    }
}

fn validate_part_content_type(part_headers: &OperationHeaders) -> Result<()> {
    let content_type = part_headers
        .get(CONTENT_TYPE)
        .ok_or_else(|| Error::format("a batch part has no Content-Type header"))?;

    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    if media_type.eq_ignore_ascii_case(APPLICATION_HTTP) {
        Ok(())
    } else {
        Err(Error::format(format!(
            "a batch part has Content-Type '{content_type}', expected '{APPLICATION_HTTP}'"
        )))
    }
}
