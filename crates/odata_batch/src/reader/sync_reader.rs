// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;

use super::{ReadStep, ReaderCore, ReaderItem, ReaderState, ScopeStack};
use crate::{MessageQuotas, Result};

/// Performs the work of each reader state, blocking until it is done.
///
/// Each method is called when the reader is in the matching state, with the scope of that state
/// on top of `scopes`. It must leave the reader in one of the states the step can lead to, with
/// an item matching that state; [`ReaderCore`] verifies both afterwards.
pub trait ReaderSteps {
    /// Data the step source keeps in each scope.
    type ScopeData: Debug + Default + Send;

    /// Reads the top-level item of the payload.
    ///
    /// # Errors
    ///
    /// Returns any error that prevents the step from completing.
    fn read_at_start(&mut self, scopes: &mut ScopeStack<Self::ScopeData>) -> Result<()>;

    /// Reads the first entry of the current feed, or moves to its end.
    ///
    /// # Errors
    ///
    /// Returns any error that prevents the step from completing.
    fn read_at_feed_start(&mut self, scopes: &mut ScopeStack<Self::ScopeData>) -> Result<()>;

    /// Leaves the current feed.
    ///
    /// # Errors
    ///
    /// Returns any error that prevents the step from completing.
    fn read_at_feed_end(&mut self, scopes: &mut ScopeStack<Self::ScopeData>) -> Result<()>;

    /// Reads the first navigation link of the current entry, or moves to its end.
    ///
    /// # Errors
    ///
    /// Returns any error that prevents the step from completing.
    fn read_at_entry_start(&mut self, scopes: &mut ScopeStack<Self::ScopeData>) -> Result<()>;

    /// Leaves the current entry.
    ///
    /// # Errors
    ///
    /// Returns any error that prevents the step from completing.
    fn read_at_entry_end(&mut self, scopes: &mut ScopeStack<Self::ScopeData>) -> Result<()>;

    /// Reads the content of the current navigation link.
    ///
    /// # Errors
    ///
    /// Returns any error that prevents the step from completing.
    fn read_at_navigation_link_start(&mut self, scopes: &mut ScopeStack<Self::ScopeData>) -> Result<()>;

    /// Leaves the current navigation link.
    ///
    /// # Errors
    ///
    /// Returns any error that prevents the step from completing.
    fn read_at_navigation_link_end(&mut self, scopes: &mut ScopeStack<Self::ScopeData>) -> Result<()>;

    /// Moves past the current entity reference link.
    ///
    /// # Errors
    ///
    /// Returns any error that prevents the step from completing.
    fn read_at_entity_reference_link(&mut self, scopes: &mut ScopeStack<Self::ScopeData>) -> Result<()>;
}

/// Reads feeds, entries and links from a payload, blocking in each step.
///
/// # Examples
///
/// ```
/// use odata_batch::reader::{JsonPayloadSteps, ODataReader, ReaderState};
///
/// let payload = br#"{ "value": [ { "Name": "Ada" } ] }"#;
/// let mut reader = ODataReader::new(JsonPayloadSteps::new(&payload[..]));
///
/// let mut states = Vec::new();
/// while reader.read()? {
///     states.push(reader.state());
/// }
///
/// assert_eq!(
///     states,
///     [ReaderState::FeedStart, ReaderState::EntryStart, ReaderState::EntryEnd, ReaderState::FeedEnd]
/// );
/// assert_eq!(reader.state(), ReaderState::Completed);
/// # Ok::<(), odata_batch::Error>(())
/// ```
#[derive(Debug)]
pub struct ODataReader<S: ReaderSteps> {
    steps: S,
    core: ReaderCore<S::ScopeData>,
}

impl<S: ReaderSteps> ODataReader<S> {
    /// Creates a reader with default quotas.
    #[must_use]
    pub fn new(steps: S) -> Self {
        Self::with_quotas(steps, MessageQuotas::default())
    }

    /// Creates a reader whose entries may nest as deep as the quotas allow.
    #[must_use]
    pub fn with_quotas(steps: S, quotas: MessageQuotas) -> Self {
        Self {
            steps,
            core: ReaderCore::new(quotas.max_nesting_depth()),
        }
    }

    /// Moves to the next state.
    ///
    /// Returns `false` once the payload has been read completely.
    ///
    /// # Errors
    ///
    /// * [`Error::Sequencing`][crate::Error::Sequencing] if the reader has completed or failed.
    /// * Any error of the step; the reader then moves to `Exception`.
    pub fn read(&mut self) -> Result<bool> {
        let step = self.core.next_step()?;
        let scopes = self.core.scopes_mut();

        let outcome = match step {
            ReadStep::Start => self.steps.read_at_start(scopes),
            ReadStep::FeedStart => self.steps.read_at_feed_start(scopes),
            ReadStep::FeedEnd => self.steps.read_at_feed_end(scopes),
            ReadStep::EntryStart => self.steps.read_at_entry_start(scopes),
            ReadStep::EntryEnd => self.steps.read_at_entry_end(scopes),
            ReadStep::NavigationLinkStart => self.steps.read_at_navigation_link_start(scopes),
            ReadStep::NavigationLinkEnd => self.steps.read_at_navigation_link_end(scopes),
            ReadStep::EntityReferenceLink => self.steps.read_at_entity_reference_link(scopes),
        };

        self.core.complete_step(step, outcome)
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> ReaderState {
        self.core.state()
    }

    /// The item of the current state.
    #[must_use]
    pub fn item(&self) -> Option<&ReaderItem> {
        self.core.item()
    }

    /// The step source.
    #[must_use]
    pub fn steps(&self) -> &S {
        &self.steps
    }
}
