// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use serde::Deserialize;
use serde_json::Value;

use crate::{Error, Result};

/// Counts how deep a recursive structure currently is and fails once a maximum is exceeded.
///
/// Used for nested inner errors and for nested entries. Level 1 is the first nested element;
/// entering level `max + 1` fails with [`Error::RecursionDepthExceeded`] and leaves the counter
/// unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecursionDepthGuard {
    depth: usize,
    max: usize,
}

impl RecursionDepthGuard {
    /// Creates a guard at depth zero.
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self { depth: 0, max }
    }

    /// Enters one more nesting level.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecursionDepthExceeded`] if the new level would exceed the maximum.
    pub fn enter(&mut self) -> Result<()> {
        if self.depth >= self.max {
            return Err(Error::RecursionDepthExceeded { max: self.max });
        }

        self.depth += 1;
        Ok(())
    }

    /// Leaves the current nesting level.
    pub fn leave(&mut self) {
        debug_assert!(self.depth > 0, "left a nesting level that was never entered");
        self.depth = self.depth.saturating_sub(1);
    }

    /// The current depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The configured maximum.
    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }
}

/// Parses one JSON document without the parser's own nesting limit.
///
/// Callers bound the nesting with a [`RecursionDepthGuard`] once the value is built. The stack
/// grows on demand while deeply nested input is parsed.
pub(crate) fn parse_json<'de, R: serde_json::de::Read<'de>>(mut deserializer: serde_json::Deserializer<R>) -> Result<Value> {
    deserializer.disable_recursion_limit();
    let value = Value::deserialize(serde_stacker::Deserializer::new(&mut deserializer)).map_err(Error::json)?;
    deserializer.end().map_err(Error::json)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fails_on_level_after_max() {
        let mut guard = RecursionDepthGuard::new(3);

        for _ in 0..3 {
            guard.enter().unwrap();
        }

        let error = guard.enter().unwrap_err();
        assert!(matches!(error, Error::RecursionDepthExceeded { max: 3 }));
        assert_eq!(guard.depth(), 3);
    }

    #[test]
    fn leave_allows_reentry() {
        let mut guard = RecursionDepthGuard::new(1);

        guard.enter().unwrap();
        guard.leave();
        guard.enter().unwrap();

        assert_eq!(guard.depth(), 1);
        assert_eq!(guard.max(), 1);
    }

    #[test]
    fn zero_max_rejects_everything() {
        let mut guard = RecursionDepthGuard::new(0);

        guard.enter().unwrap_err();
    }

    #[test]
    fn parse_json_accepts_nesting_past_parser_default() {
        let nested = format!("{}{}", "[".repeat(1000), "]".repeat(1000));

        let mut value = parse_json(serde_json::Deserializer::from_str(&nested)).unwrap();
        let mut depth = 0;
        while let Value::Array(mut items) = value {
            depth += 1;
            value = items.pop().unwrap_or(Value::Null);
        }

        assert_eq!(depth, 1000);
    }

    #[test]
    fn parse_json_rejects_trailing_content() {
        let error = parse_json(serde_json::Deserializer::from_slice(b"{} {}")).unwrap_err();

        assert!(matches!(error, Error::Format(_)));
    }
}
