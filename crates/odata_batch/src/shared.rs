// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{Level, event};

use crate::{Error, Result};

/// A transport shared between a batch and the operation stream it currently has outstanding.
///
/// The batch state machine guarantees that only one party uses the transport at a time, so the
/// lock is never contended; it exists to give both parties a handle to the same transport.
///
/// The first fatal error returned by the transport is captured and every later access fails with
/// that same error.
#[derive(Debug)]
pub(crate) struct SharedTransport<T> {
    inner: Arc<Mutex<Guarded<T>>>,
}

#[derive(Debug)]
struct Guarded<T> {
    transport: T,
    failure: Option<Error>,
}

impl<T> SharedTransport<T> {
    pub(crate) fn new(transport: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Guarded { transport, failure: None })),
        }
    }

    /// Runs `f` against the transport unless the transport has already failed.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let mut guarded = self.inner.lock();

        if let Some(failure) = &guarded.failure {
            return Err(failure.clone());
        }

        let result = f(&mut guarded.transport);

        if let Err(error) = &result
            && error.is_fatal()
        {
            event!(
                name: "odata_batch.transport.poisoned",
                Level::DEBUG,
                error = %error,
            );
            guarded.failure = Some(error.clone());
        }

        result
    }

    /// Runs `f` against the transport without checking for or capturing failures.
    pub(crate) fn inspect<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.lock().transport)
    }

    /// The captured failure, if the transport has failed.
    pub(crate) fn failure(&self) -> Option<Error> {
        self.inner.lock().failure.clone()
    }

    /// Records `error` as the failure of the transport, unless one is already recorded.
    pub(crate) fn poison(&self, error: &Error) {
        let mut guarded = self.inner.lock();
        if guarded.failure.is_none() {
            guarded.failure = Some(error.clone());
        }
    }

    /// Whether handles other than this one exist.
    pub(crate) fn is_shared(&self) -> bool {
        Arc::strong_count(&self.inner) > 1
    }

    /// Takes the transport back out, provided no other handle exists.
    pub(crate) fn try_into_inner(self) -> std::result::Result<T, Self> {
        Arc::try_unwrap(self.inner)
            .map(|mutex| mutex.into_inner().transport)
            .map_err(|inner| Self { inner })
    }
}

impl<T> Clone for SharedTransport<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn fatal_errors_are_replayed() {
        let shared = SharedTransport::new(0_u32);

        let error = shared
            .with(|_| -> Result<()> { Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone").into()) })
            .unwrap_err();
        assert!(matches!(error, Error::Transport(_)));

        let mut called = false;
        let replayed = shared
            .with(|_| {
                called = true;
                Ok(())
            })
            .unwrap_err();

        assert!(!called);
        assert_eq!(replayed.to_string(), "gone");
        assert!(shared.failure().is_some());
    }

    #[test]
    fn non_fatal_errors_are_not_captured() {
        let shared = SharedTransport::new(0_u32);

        shared.with(|_| -> Result<()> { Err(Error::Unsupported("seek")) }).unwrap_err();

        shared
            .with(|value| {
                *value += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(shared.inspect(|value| *value), 1);
    }

    #[test]
    fn into_inner_requires_sole_handle() {
        let shared = SharedTransport::new(String::from("t"));
        let other = shared.clone();
        assert!(shared.is_shared());

        let shared = shared.try_into_inner().unwrap_err();
        drop(other);

        assert!(!shared.is_shared());
        assert_eq!(shared.try_into_inner().unwrap(), "t");
    }

    #[test]
    fn poison_keeps_first_failure() {
        let shared = SharedTransport::new(());

        shared.poison(&Error::format("first"));
        shared.poison(&Error::format("second"));

        assert_eq!(shared.failure().unwrap().to_string(), "malformed payload: first");
    }
}
