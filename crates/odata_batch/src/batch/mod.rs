// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Batch readers and writers.

mod reader;
mod writer;

use std::fmt;

use parking_lot::Mutex;
use tracing::{Level, event};

pub use reader::BatchReader;
pub use writer::BatchWriter;

use crate::listener::StreamListener;
use crate::shared::SharedTransport;
use crate::{Error, Result};

/// The state of a [`BatchReader`] or [`BatchWriter`].
///
/// ```text
/// Start -> OperationHeaders -> OperationStreamActive -> OperationStreamDisposed -> OperationHeaders | Completed
/// ```
///
/// Any state may move to `Exception` when reading or writing fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchState {
    /// Nothing has been read or written yet.
    Start,
    /// The headers of an operation have been read; its content has not been requested yet.
    OperationHeaders,
    /// An operation stream has been handed out and not yet disposed.
    OperationStreamActive,
    /// The last operation stream has been disposed.
    OperationStreamDisposed,
    /// The end of the batch was read or written.
    Completed,
    /// Reading or writing failed; the batch cannot be used any more.
    Exception,
}

impl BatchState {
    /// The name of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::OperationHeaders => "OperationHeaders",
            Self::OperationStreamActive => "OperationStreamActive",
            Self::OperationStreamDisposed => "OperationStreamDisposed",
            Self::Completed => "Completed",
            Self::Exception => "Exception",
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holds the state of a batch and listens to the operation streams handed out by it.
#[derive(Debug)]
pub(crate) struct StateCell {
    role: &'static str,
    state: Mutex<BatchState>,
}

impl StateCell {
    pub(crate) fn new(role: &'static str) -> Self {
        Self {
            role,
            state: Mutex::new(BatchState::Start),
        }
    }

    pub(crate) fn get(&self) -> BatchState {
        *self.state.lock()
    }

    pub(crate) fn set(&self, to: BatchState) {
        let mut state = self.state.lock();
        transition(self.role, &mut state, to);
    }
}

impl StreamListener for StateCell {
    fn stream_disposed(&self) {
        let mut state = self.state.lock();
        if *state == BatchState::OperationStreamActive {
            transition(self.role, &mut state, BatchState::OperationStreamDisposed);
        }
    }
}

fn transition(role: &'static str, state: &mut BatchState, to: BatchState) {
    if *state != to {
        event!(
            name: "odata_batch.state",
            Level::TRACE,
            batch.role = role,
            batch.from = state.as_str(),
            batch.to = to.as_str(),
        );
        *state = to;
    }
}

/// Fails calls on a batch that has completed or failed.
///
/// A batch whose transport failed replays the captured failure; otherwise the call is a
/// sequencing error.
pub(crate) fn ensure_usable<T>(state: &StateCell, transport: &SharedTransport<T>, operation: &'static str) -> Result<()> {
    if let Some(failure) = transport.failure() {
        state.set(BatchState::Exception);
        return Err(failure);
    }

    match state.get() {
        current @ (BatchState::Completed | BatchState::Exception) => Err(Error::Sequencing {
            operation,
            state: current.as_str(),
        }),
        _ => Ok(()),
    }
}

/// Moves the batch to `Exception` if `result` failed for any reason other than misuse, capturing
/// fatal errors so that they are replayed.
pub(crate) fn intercept<T, R>(state: &StateCell, transport: &SharedTransport<T>, result: Result<R>) -> Result<R> {
    if let Err(error) = &result
        && !matches!(error, Error::Sequencing { .. } | Error::InvalidArgument { .. })
    {
        if error.is_fatal() {
            transport.poison(error);
        }
        state.set(BatchState::Exception);
    }

    result
}

pub(crate) fn sequencing_error(operation: &'static str, state: BatchState) -> Error {
    Error::Sequencing {
        operation,
        state: state.as_str(),
    }
}
