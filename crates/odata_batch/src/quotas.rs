// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use serde::{Deserialize, Serialize};

const DEFAULT_MAX_PARTS_PER_BATCH: usize = 100;
const DEFAULT_MAX_OPERATIONS_PER_CHANGESET: usize = 1000;
const DEFAULT_MAX_NESTING_DEPTH: usize = 100;

/// Limits applied while reading or writing a message.
///
/// The quotas protect the process from payloads that are malformed or hostile: a batch with an
/// unbounded number of parts, or error and entry payloads nested deep enough to exhaust the stack.
///
/// Quotas can be embedded in host configuration; any field missing from the serialized form
/// takes its default value.
///
/// # Examples
///
/// ```
/// use odata_batch::MessageQuotas;
///
/// let quotas = MessageQuotas::default().with_max_parts_per_batch(10).with_max_nesting_depth(8);
///
/// assert_eq!(quotas.max_parts_per_batch(), 10);
/// assert_eq!(quotas.max_operations_per_changeset(), 1000);
/// assert_eq!(quotas.max_nesting_depth(), 8);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageQuotas {
    max_parts_per_batch: usize,
    max_operations_per_changeset: usize,
    max_nesting_depth: usize,
}

impl MessageQuotas {
    /// Maximum number of top-level parts (operations and changesets) in one batch.
    #[must_use]
    pub fn max_parts_per_batch(&self) -> usize {
        self.max_parts_per_batch
    }

    /// Maximum number of operations inside one changeset.
    #[must_use]
    pub fn max_operations_per_changeset(&self) -> usize {
        self.max_operations_per_changeset
    }

    /// Maximum nesting depth of entries and of inner errors.
    #[must_use]
    pub fn max_nesting_depth(&self) -> usize {
        self.max_nesting_depth
    }

    /// Sets the maximum number of top-level parts in one batch.
    #[must_use]
    pub fn with_max_parts_per_batch(mut self, value: usize) -> Self {
        self.max_parts_per_batch = value;
        self
    }

    /// Sets the maximum number of operations inside one changeset.
    #[must_use]
    pub fn with_max_operations_per_changeset(mut self, value: usize) -> Self {
        self.max_operations_per_changeset = value;
        self
    }

    /// Sets the maximum nesting depth of entries and of inner errors.
    #[must_use]
    pub fn with_max_nesting_depth(mut self, value: usize) -> Self {
        self.max_nesting_depth = value;
        self
    }
}

impl Default for MessageQuotas {
    fn default() -> Self {
        Self {
            max_parts_per_batch: DEFAULT_MAX_PARTS_PER_BATCH,
            max_operations_per_changeset: DEFAULT_MAX_OPERATIONS_PER_CHANGESET,
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_configuration_keeps_defaults() {
        let quotas: MessageQuotas = serde_json::from_str(r#"{ "maxNestingDepth": 4 }"#).unwrap();

        assert_eq!(quotas.max_nesting_depth(), 4);
        assert_eq!(quotas.max_parts_per_batch(), DEFAULT_MAX_PARTS_PER_BATCH);
        assert_eq!(quotas.max_operations_per_changeset(), DEFAULT_MAX_OPERATIONS_PER_CHANGESET);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(MessageQuotas::default().with_max_operations_per_changeset(7)).unwrap();

        assert_eq!(json["maxOperationsPerChangeset"], 7);
        assert_eq!(json["maxPartsPerBatch"], 100);
    }
}
