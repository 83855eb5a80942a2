// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use serde_json::{Map, Value};

/// A feed: a collection of entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feed {
    /// The feed identifier.
    pub id: Option<String>,
    /// The total number of entries in the collection, which may exceed the number in the payload.
    pub count: Option<u64>,
    /// Link to the next page of entries.
    pub next_link: Option<String>,
}

/// An entry: a single entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
    /// The entity identifier.
    pub id: Option<String>,
    /// Qualified name of the entity type.
    pub type_name: Option<String>,
    /// The entity tag used for concurrency checks.
    pub etag: Option<String>,
    /// Structural property values, keyed by property name.
    pub properties: Map<String, Value>,
}

/// A navigation link from an entry to related entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NavigationLink {
    /// The navigation property name.
    pub name: String,
    /// Where the related entries can be retrieved, if the payload says so.
    pub url: Option<String>,
    /// Whether the link points to a collection, when known from the payload.
    pub is_collection: Option<bool>,
}

/// A reference from a navigation link to an existing entity, as used when binding entities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityReferenceLink {
    /// The URL of the referenced entity.
    pub url: String,
}

/// The item an [`ODataReader`][super::ODataReader] is positioned on.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderItem {
    /// Reported with `FeedStart` and `FeedEnd`.
    Feed(Feed),
    /// Reported with `EntryStart` and `EntryEnd`.
    Entry(Entry),
    /// Reported with `NavigationLinkStart` and `NavigationLinkEnd`.
    NavigationLink(NavigationLink),
    /// Reported with `EntityReferenceLink`.
    EntityReferenceLink(EntityReferenceLink),
}

impl From<Feed> for ReaderItem {
    fn from(value: Feed) -> Self {
        Self::Feed(value)
    }
}

impl From<Entry> for ReaderItem {
    fn from(value: Entry) -> Self {
        Self::Entry(value)
    }
}

impl From<NavigationLink> for ReaderItem {
    fn from(value: NavigationLink) -> Self {
        Self::NavigationLink(value)
    }
}

impl From<EntityReferenceLink> for ReaderItem {
    fn from(value: EntityReferenceLink) -> Self {
        Self::EntityReferenceLink(value)
    }
}
