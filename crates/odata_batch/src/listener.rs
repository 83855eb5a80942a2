// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Receives lifecycle notifications from operation streams.
///
/// The batch reader and writer register themselves as the listener of every operation stream
/// they hand out, which is how they learn that the caller is done with an operation's content
/// and that the next operation may begin.
///
/// # Delivery
///
/// [`stream_disposed()`][Self::stream_disposed] is invoked exactly once per stream, synchronously,
/// before the disposing call (explicit `dispose()` or drop) returns. The stream has already
/// released its reference to the transport by then, so the listener is free to use the transport.
///
/// # Thread safety
///
/// This trait requires `Send` and `Sync` so that operation streams can cross threads together
/// with their owning batch.
pub trait StreamListener: Send + Sync {
    /// The stream was disposed and will not touch the transport again.
    fn stream_disposed(&self);
}
