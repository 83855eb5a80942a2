// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::pin::Pin;
use std::task;

/// Suspends a [`ScriptedSteps`][super::ScriptedSteps] step once before it runs.
///
/// The suspending driver is then polled again mid-step, as it would be with real asynchronous
/// input. The first poll returns `Pending` and wakes the task; the next returns `Ready`.
#[derive(Debug, Default)]
pub(crate) struct YieldOnce {
    polled: bool,
}

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        if self.polled {
            task::Poll::Ready(())
        } else {
            self.polled = true;
            cx.waker().wake_by_ref();
            task::Poll::Pending
        }
    }
}
