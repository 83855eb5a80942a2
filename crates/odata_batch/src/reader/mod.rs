// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Readers for feeds, entries and links.
//!
//! A reader walks a payload as a sequence of states, reporting the item it is positioned on at
//! each one. The transition table lives in [`ReaderCore`]; what happens in each state is supplied
//! by a step source, either blocking ([`ReaderSteps`], driven by [`ODataReader`]) or suspending
//! ([`AsyncReaderSteps`], driven by [`AsyncODataReader`]). Both drivers share the core, so they
//! report the same states and items in the same order.

mod async_reader;
mod items;
mod json;
mod sync_reader;

use std::fmt;

use tracing::{Level, event};

pub use async_reader::{AsyncODataReader, AsyncReaderSteps};
pub use items::{EntityReferenceLink, Entry, Feed, NavigationLink, ReaderItem};
pub use json::{JsonPayloadSteps, JsonScope};
pub use sync_reader::{ODataReader, ReaderSteps};

use crate::{Error, RecursionDepthGuard, Result};

/// The position of a reader within a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReaderState {
    /// Nothing has been read yet.
    Start,
    /// The start of a feed; the item is the [`Feed`].
    FeedStart,
    /// The end of a feed; the item is the [`Feed`].
    FeedEnd,
    /// The start of an entry; the item is the [`Entry`].
    EntryStart,
    /// The end of an entry; the item is the [`Entry`].
    EntryEnd,
    /// The start of a navigation link; the item is the [`NavigationLink`].
    NavigationLinkStart,
    /// The end of a navigation link; the item is the [`NavigationLink`].
    NavigationLinkEnd,
    /// A reference to an existing entity inside a navigation link.
    EntityReferenceLink,
    /// Reading failed; the reader cannot be used any more.
    Exception,
    /// The whole payload has been read.
    Completed,
}

impl ReaderState {
    /// The name of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::FeedStart => "FeedStart",
            Self::FeedEnd => "FeedEnd",
            Self::EntryStart => "EntryStart",
            Self::EntryEnd => "EntryEnd",
            Self::NavigationLinkStart => "NavigationLinkStart",
            Self::NavigationLinkEnd => "NavigationLinkEnd",
            Self::EntityReferenceLink => "EntityReferenceLink",
            Self::Exception => "Exception",
            Self::Completed => "Completed",
        }
    }
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The work a reader performs to move on from its current state.
///
/// There is one step per state that can be read from; the step source implements each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadStep {
    /// Reads the top-level item of the payload.
    Start,
    /// Reads the first entry of a feed, or its end.
    FeedStart,
    /// Leaves a feed.
    FeedEnd,
    /// Reads the first navigation link of an entry, or its end.
    EntryStart,
    /// Leaves an entry, moving to the next entry of the enclosing feed if there is one.
    EntryEnd,
    /// Reads the content of a navigation link.
    NavigationLinkStart,
    /// Leaves a navigation link, moving to the next link of the enclosing entry if there is one.
    NavigationLinkEnd,
    /// Moves past an entity reference link.
    EntityReferenceLink,
}

impl ReadStep {
    fn for_state(state: ReaderState) -> Option<Self> {
        match state {
            ReaderState::Start => Some(Self::Start),
            ReaderState::FeedStart => Some(Self::FeedStart),
            ReaderState::FeedEnd => Some(Self::FeedEnd),
            ReaderState::EntryStart => Some(Self::EntryStart),
            ReaderState::EntryEnd => Some(Self::EntryEnd),
            ReaderState::NavigationLinkStart => Some(Self::NavigationLinkStart),
            ReaderState::NavigationLinkEnd => Some(Self::NavigationLinkEnd),
            ReaderState::EntityReferenceLink => Some(Self::EntityReferenceLink),
            ReaderState::Exception | ReaderState::Completed => None,
        }
    }

    /// The states a step may leave the reader in.
    fn allows(self, to: ReaderState) -> bool {
        use ReaderState as S;

        match self {
            Self::Start => matches!(to, S::FeedStart | S::EntryStart),
            Self::FeedStart => matches!(to, S::EntryStart | S::FeedEnd),
            Self::FeedEnd => matches!(to, S::NavigationLinkEnd | S::Completed),
            Self::EntryStart => matches!(to, S::NavigationLinkStart | S::EntryEnd),
            Self::EntryEnd => matches!(to, S::EntryStart | S::FeedEnd | S::NavigationLinkEnd | S::Completed),
            Self::NavigationLinkStart => {
                matches!(to, S::EntryStart | S::FeedStart | S::EntityReferenceLink | S::NavigationLinkEnd)
            }
            Self::NavigationLinkEnd => matches!(to, S::NavigationLinkStart | S::EntryEnd),
            Self::EntityReferenceLink => matches!(to, S::EntityReferenceLink | S::NavigationLinkEnd),
        }
    }
}

/// One level of the reader's position: a state, the item reported in it and data private to
/// the step source.
#[derive(Debug)]
pub struct Scope<D> {
    state: ReaderState,
    item: Option<ReaderItem>,
    data: D,
}

impl<D> Scope<D> {
    /// Creates a scope.
    #[must_use]
    pub fn new(state: ReaderState, item: Option<ReaderItem>, data: D) -> Self {
        Self { state, item, data }
    }

    /// The state of the scope.
    #[must_use]
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Changes the state of the scope, keeping its item.
    pub fn set_state(&mut self, state: ReaderState) {
        self.state = state;
    }

    /// The item reported in this scope.
    #[must_use]
    pub fn item(&self) -> Option<&ReaderItem> {
        self.item.as_ref()
    }

    /// Replaces the item reported in this scope.
    pub fn set_item(&mut self, item: Option<ReaderItem>) {
        self.item = item;
    }

    /// Data private to the step source.
    #[must_use]
    pub fn data(&self) -> &D {
        &self.data
    }

    /// Data private to the step source.
    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }
}

/// The stack of scopes from the payload root to the current position.
///
/// The bottom scope stands for the payload itself: it is in `Start` until the top-level item is
/// read and in `Completed` once that item has ended.
#[derive(Debug)]
pub struct ScopeStack<D> {
    scopes: Vec<Scope<D>>,
}

impl<D> ScopeStack<D> {
    /// Creates a stack holding only `root`.
    #[must_use]
    pub fn new(root: Scope<D>) -> Self {
        Self { scopes: vec![root] }
    }

    /// Enters a nested scope.
    pub fn push(&mut self, scope: Scope<D>) {
        self.scopes.push(scope);
    }

    /// Leaves the current scope.
    pub fn pop(&mut self) -> Option<Scope<D>> {
        self.scopes.pop()
    }

    /// The current scope.
    #[must_use]
    pub fn current(&self) -> Option<&Scope<D>> {
        self.scopes.last()
    }

    /// The current scope.
    pub fn current_mut(&mut self) -> Option<&mut Scope<D>> {
        self.scopes.last_mut()
    }

    /// The scope enclosing the current one.
    #[must_use]
    pub fn parent(&self) -> Option<&Scope<D>> {
        self.scopes.len().checked_sub(2).and_then(|index| self.scopes.get(index))
    }

    /// Number of scopes, including the root.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    /// Whether the stack has no scopes at all, which a working reader never observes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Iterates from the root to the current scope.
    pub fn iter(&self) -> impl Iterator<Item = &Scope<D>> {
        self.scopes.iter()
    }
}

/// The transition table shared by the blocking and the suspending reader drivers.
///
/// A driver asks [`next_step()`][Self::next_step] which step to perform, performs it against
/// [`scopes_mut()`][Self::scopes_mut] and hands the outcome to
/// [`complete_step()`][Self::complete_step], which checks the transition, tracks entry nesting
/// and moves the reader to `Exception` on any failure.
#[derive(Debug)]
pub struct ReaderCore<D> {
    scopes: ScopeStack<D>,
    entry_depth: RecursionDepthGuard,
    faulted: bool,
}

impl<D: Default> ReaderCore<D> {
    /// Creates a core in the `Start` state, allowing entries to nest `max_nesting_depth` deep.
    #[must_use]
    pub fn new(max_nesting_depth: usize) -> Self {
        Self {
            scopes: ScopeStack::new(Scope::new(ReaderState::Start, None, D::default())),
            entry_depth: RecursionDepthGuard::new(max_nesting_depth),
            faulted: false,
        }
    }
}

impl<D> ReaderCore<D> {
    /// The current state.
    #[must_use]
    pub fn state(&self) -> ReaderState {
        if self.faulted {
            return ReaderState::Exception;
        }

        self.scopes.current().map_or(ReaderState::Exception, Scope::state)
    }

    /// The item of the current state.
    #[must_use]
    pub fn item(&self) -> Option<&ReaderItem> {
        if self.faulted {
            return None;
        }

        self.scopes.current().and_then(Scope::item)
    }

    /// The scopes, for inspection.
    #[must_use]
    pub fn scopes(&self) -> &ScopeStack<D> {
        &self.scopes
    }

    /// The scopes, for a step to work on.
    pub fn scopes_mut(&mut self) -> &mut ScopeStack<D> {
        &mut self.scopes
    }

    /// How deeply the current position is nested in entries.
    #[must_use]
    pub fn entry_depth(&self) -> usize {
        self.entry_depth.depth()
    }

    /// The step to perform to move on from the current state.
    ///
    /// # Errors
    ///
    /// * [`Error::Sequencing`] in the `Exception` and `Completed` states.
    /// * [`Error::Internal`] if the reader has lost track of its position; the reader moves to
    ///   `Exception`.
    pub fn next_step(&mut self) -> Result<ReadStep> {
        if self.faulted {
            return Err(read_sequencing_error(ReaderState::Exception));
        }

        let Some(scope) = self.scopes.current() else {
            self.faulted = true;
            return Err(Error::internal("the reader has no current scope"));
        };

        ReadStep::for_state(scope.state()).ok_or_else(|| read_sequencing_error(scope.state()))
    }

    /// Finishes `step` with the outcome of performing it.
    ///
    /// Returns `false` once the reader has completed.
    ///
    /// # Errors
    ///
    /// Returns the error of the step itself, [`Error::RecursionDepthExceeded`] if entries nest
    /// too deeply, or [`Error::Internal`] if the step left the reader in a state it cannot reach
    /// or reported an item that does not match the state. In all cases the reader moves to
    /// `Exception`.
    pub fn complete_step(&mut self, step: ReadStep, outcome: Result<()>) -> Result<bool> {
        match outcome.and_then(|()| self.after_step(step)) {
            Ok(state) => {
                event!(
                    name: "odata_batch.reader.step",
                    Level::TRACE,
                    step = ?step,
                    state = state.as_str(),
                    depth = self.entry_depth.depth(),
                );
                Ok(state != ReaderState::Completed)
            }
            Err(error) => {
                event!(
                    name: "odata_batch.reader.exception",
                    Level::DEBUG,
                    step = ?step,
                    error = %error,
                );
                self.faulted = true;
                Err(error)
            }
        }
    }

    fn after_step(&mut self, step: ReadStep) -> Result<ReaderState> {
        if step == ReadStep::EntryEnd {
            self.entry_depth.leave();
        }

        let scope = self
            .scopes
            .current()
            .ok_or_else(|| Error::internal("a read step left the reader without a current scope"))?;
        let state = scope.state();

        if !step.allows(state) {
            return Err(Error::internal(format!("the {step:?} step cannot move the reader to {state}")));
        }

        if !item_matches(state, scope.item()) {
            return Err(Error::internal(format!("the item reported in the {state} state does not match it")));
        }

        if state == ReaderState::EntryStart {
            self.entry_depth.enter()?;
        }

        Ok(state)
    }
}

fn item_matches(state: ReaderState, item: Option<&ReaderItem>) -> bool {
    match state {
        ReaderState::FeedStart | ReaderState::FeedEnd => matches!(item, Some(ReaderItem::Feed(_))),
        ReaderState::EntryStart | ReaderState::EntryEnd => matches!(item, Some(ReaderItem::Entry(_))),
        ReaderState::NavigationLinkStart | ReaderState::NavigationLinkEnd => {
            matches!(item, Some(ReaderItem::NavigationLink(_)))
        }
        ReaderState::EntityReferenceLink => matches!(item, Some(ReaderItem::EntityReferenceLink(_))),
        ReaderState::Completed => item.is_none(),
        ReaderState::Start | ReaderState::Exception => false,
    }
}

fn read_sequencing_error(state: ReaderState) -> Error {
    Error::Sequencing {
        operation: "read",
        state: state.as_str(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> Option<ReaderItem> {
        Some(Entry::default().into())
    }

    fn core() -> ReaderCore<()> {
        ReaderCore::new(2)
    }

    fn push(core: &mut ReaderCore<()>, state: ReaderState, item: Option<ReaderItem>) {
        core.scopes_mut().push(Scope::new(state, item, ()));
    }

    #[test]
    fn start_maps_to_start_step() {
        let mut core = core();

        assert_eq!(core.state(), ReaderState::Start);
        assert_eq!(core.item(), None);
        assert_eq!(core.next_step().unwrap(), ReadStep::Start);
    }

    #[test]
    fn terminal_states_are_sequencing_errors() {
        let mut core = core();
        core.scopes_mut().current_mut().unwrap().set_state(ReaderState::Completed);

        assert!(matches!(
            core.next_step(),
            Err(Error::Sequencing {
                operation: "read",
                state: "Completed"
            })
        ));
        assert_eq!(core.state(), ReaderState::Completed);

        let mut core = ReaderCore::<()>::new(2);
        core.complete_step(ReadStep::Start, Err(Error::format("bad"))).unwrap_err();
        assert_eq!(core.state(), ReaderState::Exception);
        assert!(matches!(core.next_step(), Err(Error::Sequencing { state: "Exception", .. })));
    }

    #[test]
    fn empty_stack_is_internal_error() {
        let mut core = core();
        core.scopes_mut().pop();

        assert!(matches!(core.next_step(), Err(Error::Internal(_))));
        assert_eq!(core.state(), ReaderState::Exception);
    }

    #[test]
    fn illegal_transition_is_internal_error() {
        let mut core = core();
        core.next_step().unwrap();
        push(&mut core, ReaderState::NavigationLinkStart, Some(NavigationLink::default().into()));

        assert!(matches!(core.complete_step(ReadStep::Start, Ok(())), Err(Error::Internal(_))));
        assert_eq!(core.state(), ReaderState::Exception);
        assert_eq!(core.item(), None);
    }

    #[test]
    fn mismatched_item_is_internal_error() {
        let mut core = core();
        push(&mut core, ReaderState::EntryStart, Some(Feed::default().into()));

        assert!(matches!(core.complete_step(ReadStep::Start, Ok(())), Err(Error::Internal(_))));
    }

    #[test]
    fn entry_nesting_is_bounded() {
        let mut core = core();

        push(&mut core, ReaderState::EntryStart, entry());
        assert!(core.complete_step(ReadStep::Start, Ok(())).unwrap());
        assert_eq!(core.entry_depth(), 1);

        push(&mut core, ReaderState::NavigationLinkStart, Some(NavigationLink::default().into()));
        core.complete_step(ReadStep::EntryStart, Ok(())).unwrap();

        push(&mut core, ReaderState::EntryStart, entry());
        core.complete_step(ReadStep::NavigationLinkStart, Ok(())).unwrap();
        assert_eq!(core.entry_depth(), 2);

        push(&mut core, ReaderState::NavigationLinkStart, Some(NavigationLink::default().into()));
        core.complete_step(ReadStep::EntryStart, Ok(())).unwrap();

        push(&mut core, ReaderState::EntryStart, entry());
        assert!(matches!(
            core.complete_step(ReadStep::NavigationLinkStart, Ok(())),
            Err(Error::RecursionDepthExceeded { max: 2 })
        ));
        assert_eq!(core.state(), ReaderState::Exception);
    }

    #[test]
    fn entry_end_releases_depth_and_completion_returns_false() {
        let mut core = core();

        push(&mut core, ReaderState::EntryStart, entry());
        core.complete_step(ReadStep::Start, Ok(())).unwrap();

        core.scopes_mut().current_mut().unwrap().set_state(ReaderState::EntryEnd);
        core.complete_step(ReadStep::EntryStart, Ok(())).unwrap();
        assert_eq!(core.entry_depth(), 1);

        core.scopes_mut().pop();
        core.scopes_mut().current_mut().unwrap().set_state(ReaderState::Completed);
        assert!(!core.complete_step(ReadStep::EntryEnd, Ok(())).unwrap());
        assert_eq!(core.entry_depth(), 0);
        assert_eq!(core.state(), ReaderState::Completed);
    }

    #[test]
    fn scope_stack_navigation() {
        let mut stack = ScopeStack::new(Scope::new(ReaderState::Start, None, 0));
        assert!(stack.parent().is_none());

        stack.push(Scope::new(ReaderState::FeedStart, Some(Feed::default().into()), 1));
        assert_eq!(stack.len(), 2);
        assert_eq!(*stack.parent().unwrap().data(), 0);
        assert_eq!(*stack.current().unwrap().data(), 1);

        *stack.current_mut().unwrap().data_mut() = 5;
        assert_eq!(stack.iter().map(|scope| *scope.data()).collect::<Vec<_>>(), [0, 5]);

        stack.pop();
        stack.pop();
        assert!(stack.is_empty());
    }
}
