// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;

use super::{ReadStep, ReaderCore, ReaderItem, ReaderState, ScopeStack};
use crate::{MessageQuotas, Result};

/// Performs the work of each reader state without blocking.
///
/// The suspending counterpart of [`ReaderSteps`][super::ReaderSteps], with the same contract for
/// every step.
#[trait_variant::make(Send)]
pub trait AsyncReaderSteps {
    /// Data the step source keeps in each scope.
    type ScopeData: Debug + Default + Send;

    /// Reads the top-level item of the payload.
    ///
    /// # Errors
    ///
    /// Returns any error that prevents the step from completing.
    async fn read_at_start(&mut self, scopes: &mut ScopeStack<Self::ScopeData>) -> Result<()>;

    /// Reads the first entry of the current feed, or moves to its end.
    ///
    /// # Errors
    ///
    /// Returns any error that prevents the step from completing.
    async fn read_at_feed_start(&mut self, scopes: &mut ScopeStack<Self::ScopeData>) -> Result<()>;

    /// Leaves the current feed.
    ///
    /// # Errors
    ///
    /// Returns any error that prevents the step from completing.
    async fn read_at_feed_end(&mut self, scopes: &mut ScopeStack<Self::ScopeData>) -> Result<()>;

    /// Reads the first navigation link of the current entry, or moves to its end.
    ///
    /// # Errors
    ///
    /// Returns any error that prevents the step from completing.
    async fn read_at_entry_start(&mut self, scopes: &mut ScopeStack<Self::ScopeData>) -> Result<()>;

    /// Leaves the current entry.
    ///
    /// # Errors
    ///
    /// Returns any error that prevents the step from completing.
    async fn read_at_entry_end(&mut self, scopes: &mut ScopeStack<Self::ScopeData>) -> Result<()>;

    /// Reads the content of the current navigation link.
    ///
    /// # Errors
    ///
    /// Returns any error that prevents the step from completing.
    async fn read_at_navigation_link_start(&mut self, scopes: &mut ScopeStack<Self::ScopeData>) -> Result<()>;

    /// Leaves the current navigation link.
    ///
    /// # Errors
    ///
    /// Returns any error that prevents the step from completing.
    async fn read_at_navigation_link_end(&mut self, scopes: &mut ScopeStack<Self::ScopeData>) -> Result<()>;

    /// Moves past the current entity reference link.
    ///
    /// # Errors
    ///
    /// Returns any error that prevents the step from completing.
    async fn read_at_entity_reference_link(&mut self, scopes: &mut ScopeStack<Self::ScopeData>) -> Result<()>;
}

/// Reads feeds, entries and links from a payload, suspending in each step.
///
/// Reports exactly the states and items an [`ODataReader`][super::ODataReader] would report for
/// the same step outcomes. Reading in the `Completed` or `Exception` state fails without
/// suspending.
///
/// # Examples
///
/// ```
/// # futures::executor::block_on(async {
/// use odata_batch::reader::{AsyncODataReader, JsonPayloadSteps, ReaderItem, ReaderState};
///
/// let payload = br#"{ "@odata.id": "Customers(1)", "Name": "Ada" }"#;
/// let mut reader = AsyncODataReader::new(JsonPayloadSteps::new(&payload[..]));
///
/// assert!(reader.read().await?);
/// assert_eq!(reader.state(), ReaderState::EntryStart);
///
/// let Some(ReaderItem::Entry(entry)) = reader.item() else {
///     panic!("expected an entry");
/// };
/// assert_eq!(entry.id.as_deref(), Some("Customers(1)"));
///
/// while reader.read().await? {}
/// assert_eq!(reader.state(), ReaderState::Completed);
/// # Ok::<(), odata_batch::Error>(())
/// # }).unwrap();
/// ```
#[derive(Debug)]
pub struct AsyncODataReader<S: AsyncReaderSteps> {
    steps: S,
    core: ReaderCore<S::ScopeData>,
}

impl<S: AsyncReaderSteps> AsyncODataReader<S> {
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
    pub async fn read(&mut self) -> Result<bool> {
        let step = self.core.next_step()?;
        let scopes = self.core.scopes_mut();

        let outcome = match step {
            ReadStep::Start => self.steps.read_at_start(scopes).await,
            ReadStep::FeedStart => self.steps.read_at_feed_start(scopes).await,
            ReadStep::FeedEnd => self.steps.read_at_feed_end(scopes).await,
            ReadStep::EntryStart => self.steps.read_at_entry_start(scopes).await,
            ReadStep::EntryEnd => self.steps.read_at_entry_end(scopes).await,
            ReadStep::NavigationLinkStart => self.steps.read_at_navigation_link_start(scopes).await,
            ReadStep::NavigationLinkEnd => self.steps.read_at_navigation_link_end(scopes).await,
            ReadStep::EntityReferenceLink => self.steps.read_at_entity_reference_link(scopes).await,
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
