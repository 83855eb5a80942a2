// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Utilities for testing code that reads or writes batches and payloads.

mod counting_listener;
mod failing_io;
mod fake_transport;
mod scripted_steps;
mod yield_once;

pub use counting_listener::*;
pub use failing_io::*;
pub use fake_transport::*;
pub use scripted_steps::*;
