// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;

use super::yield_once::YieldOnce;
use crate::reader::{AsyncReaderSteps, ReadStep, ReaderItem, ReaderState, ReaderSteps, Scope, ScopeStack};
use crate::{Error, Result};

/// A change a scripted step makes to the reader's scopes.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeEdit {
    /// Enters a new scope.
    Push(ReaderState, Option<ReaderItem>),
    /// Leaves the current scope.
    Pop,
    /// Changes the state of the current scope.
    SetState(ReaderState),
    /// Replaces the item of the current scope.
    SetItem(Option<ReaderItem>),
}

/// The outcome of one scripted step.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// The step applies these edits and succeeds.
    Edits(Vec<ScopeEdit>),
    /// The step fails with this error without touching the scopes.
    Fail(Error),
}

/// A step source that plays back a fixed script, whatever step the reader asks for.
///
/// Implements both [`ReaderSteps`] and [`AsyncReaderSteps`]; the suspending variant yields once
/// before every step. The steps the reader asked for are recorded.
#[derive(Debug, Clone)]
pub struct ScriptedSteps {
    script: VecDeque<ScriptedStep>,
    calls: Vec<ReadStep>,
}

impl ScriptedSteps {
    /// Creates a step source playing back `script`.
    #[must_use]
    pub fn new(script: impl IntoIterator<Item = ScriptedStep>) -> Self {
        Self {
            script: script.into_iter().collect(),
            calls: Vec::new(),
        }
    }

    /// The steps performed so far, in order.
    #[must_use]
    pub fn calls(&self) -> &[ReadStep] {
        &self.calls
    }

    fn perform(&mut self, step: ReadStep, scopes: &mut ScopeStack<()>) -> Result<()> {
        self.calls.push(step);

        match self.script.pop_front() {
            Some(ScriptedStep::Edits(edits)) => {
                for edit in edits {
                    apply(edit, scopes)?;
                }
                Ok(())
            }
            Some(ScriptedStep::Fail(error)) => Err(error),
            None => Err(Error::internal("the script has no more steps")),
        }
    }
}

fn apply(edit: ScopeEdit, scopes: &mut ScopeStack<()>) -> Result<()> {
    match edit {
        ScopeEdit::Push(state, item) => scopes.push(Scope::new(state, item, ())),
        ScopeEdit::Pop => {
            scopes.pop();
        }
        ScopeEdit::SetState(state) => current(scopes)?.set_state(state),
        ScopeEdit::SetItem(item) => current(scopes)?.set_item(item),
    }
    Ok(())
}

fn current(scopes: &mut ScopeStack<()>) -> Result<&mut Scope<()>> {
    scopes
        .current_mut()
        .ok_or_else(|| Error::internal("the script edited an empty scope stack"))
}

impl ReaderSteps for ScriptedSteps {
    type ScopeData = ();

    fn read_at_start(&mut self, scopes: &mut ScopeStack<()>) -> Result<()> {
        self.perform(ReadStep::Start, scopes)
    }

    fn read_at_feed_start(&mut self, scopes: &mut ScopeStack<()>) -> Result<()> {
        self.perform(ReadStep::FeedStart, scopes)
    }

    fn read_at_feed_end(&mut self, scopes: &mut ScopeStack<()>) -> Result<()> {
        self.perform(ReadStep::FeedEnd, scopes)
    }

    fn read_at_entry_start(&mut self, scopes: &mut ScopeStack<()>) -> Result<()> {
        self.perform(ReadStep::EntryStart, scopes)
    }

    fn read_at_entry_end(&mut self, scopes: &mut ScopeStack<()>) -> Result<()> {
        self.perform(ReadStep::EntryEnd, scopes)
    }

    fn read_at_navigation_link_start(&mut self, scopes: &mut ScopeStack<()>) -> Result<()> {
        self.perform(ReadStep::NavigationLinkStart, scopes)
    }

    fn read_at_navigation_link_end(&mut self, scopes: &mut ScopeStack<()>) -> Result<()> {
        self.perform(ReadStep::NavigationLinkEnd, scopes)
    }

    fn read_at_entity_reference_link(&mut self, scopes: &mut ScopeStack<()>) -> Result<()> {
        self.perform(ReadStep::EntityReferenceLink, scopes)
    }
}

impl AsyncReaderSteps for ScriptedSteps {
    type ScopeData = ();

    async fn read_at_start(&mut self, scopes: &mut ScopeStack<()>) -> Result<()> {
        YieldOnce::default().await;
        self.perform(ReadStep::Start, scopes)
    }

    async fn read_at_feed_start(&mut self, scopes: &mut ScopeStack<()>) -> Result<()> {
        YieldOnce::default().await;
        self.perform(ReadStep::FeedStart, scopes)
    }

    async fn read_at_feed_end(&mut self, scopes: &mut ScopeStack<()>) -> Result<()> {
        YieldOnce::default().await;
        self.perform(ReadStep::FeedEnd, scopes)
    }

    async fn read_at_entry_start(&mut self, scopes: &mut ScopeStack<()>) -> Result<()> {
        YieldOnce::default().await;
        self.perform(ReadStep::EntryStart, scopes)
    }

    async fn read_at_entry_end(&mut self, scopes: &mut ScopeStack<()>) -> Result<()> {
        YieldOnce::default().await;
        self.perform(ReadStep::EntryEnd, scopes)
    }

    async fn read_at_navigation_link_start(&mut self, scopes: &mut ScopeStack<()>) -> Result<()> {
        YieldOnce::default().await;
        self.perform(ReadStep::NavigationLinkStart, scopes)
    }

    async fn read_at_navigation_link_end(&mut self, scopes: &mut ScopeStack<()>) -> Result<()> {
        YieldOnce::default().await;
        self.perform(ReadStep::NavigationLinkEnd, scopes)
    }

    async fn read_at_entity_reference_link(&mut self, scopes: &mut ScopeStack<()>) -> Result<()> {
        YieldOnce::default().await;
        self.perform(ReadStep::EntityReferenceLink, scopes)
    }
}
