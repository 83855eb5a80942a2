// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Readers and writers for OData batch payloads.
//!
//! A batch is a `multipart/mixed` message carrying several HTTP operations, optionally grouped
//! into change sets. [`BatchReader`] walks such a message one operation at a time and
//! [`BatchWriter`] produces one. The content of each operation is exposed through an operation
//! stream ([`OperationReadStream`], [`OperationWriteStream`]) bounded to that operation's bytes:
//! it can never read past the operation's end, and it must be disposed before the batch moves on.
//!
//! # Batch state
//!
//! Readers and writers move through the states of [`BatchState`]. Calling an operation in a
//! state that does not allow it fails with [`Error::Sequencing`] and leaves the batch untouched.
//! A failure of the transport or a malformed payload moves the batch to
//! [`BatchState::Exception`]; from then on every call reports the same failure.
//!
//! ```
//! use std::io::Read;
//!
//! use odata_batch::{BatchOperation, BatchReader, BatchWriter, OperationLine};
//!
//! let mut writer = BatchWriter::new(Vec::new(), "batch_1");
//! let mut stream = writer.create_operation_stream(&BatchOperation::new(OperationLine::request(
//!     "GET",
//!     "Customers(1)",
//! )))?;
//! stream.dispose();
//! writer.write_batch_terminator()?;
//! let payload = writer.into_inner()?;
//!
//! let mut reader = BatchReader::new(&payload[..], "batch_1");
//! let operation = reader.read_operation_headers()?.expect("one operation");
//! assert_eq!(operation.line, OperationLine::request("GET", "Customers(1)"));
//! assert!(reader.read_operation_headers()?.is_none());
//! # Ok::<(), odata_batch::Error>(())
//! ```
//!
//! # Entry readers
//!
//! The [`reader`] module reads feeds, entries and links with a blocking or a suspending driver
//! over one shared state machine. The [`error_payload`] module reads and writes top-level error
//! payloads.
//!
//! # Logging
//!
//! State changes and failures are reported as `tracing` events whose names start with
//! `odata_batch.`.
//!
//! The `test-util` feature enables test doubles for transports, listeners and step sources.
//! These are in the `testing` module.

mod batch;
mod depth;
mod error;
pub mod error_payload;
mod headers;
mod listener;
mod quotas;
pub mod reader;
mod shared;
mod stream;
mod transport;

pub use batch::{BatchReader, BatchState, BatchWriter};
pub use depth::RecursionDepthGuard;
pub use error::{Error, Result};
pub use headers::{BatchOperation, OperationHeaders, OperationLine, generate_batch_boundary, generate_changeset_boundary};
pub use listener::StreamListener;
pub use quotas::MessageQuotas;
pub use stream::{OperationReadStream, OperationWriteStream};
pub use transport::{BatchReaderStream, BatchWriterStream, BoundaryKind, ReadTransport, WriteTransport};

#[cfg(any(test, feature = "test-util"))]
pub mod testing;
