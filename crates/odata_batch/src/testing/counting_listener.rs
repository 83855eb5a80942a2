// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::StreamListener;

/// A [`StreamListener`] that counts the disposal notifications it receives.
#[derive(Debug, Default)]
pub struct CountingListener {
    disposed: AtomicUsize,
}

impl CountingListener {
    /// Creates a listener that has not been notified yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How many disposal notifications have been received.
    #[must_use]
    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl StreamListener for CountingListener {
    fn stream_disposed(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}
