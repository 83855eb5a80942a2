// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeMap, VecDeque};
use std::io;

use futures::io::{AsyncRead, AsyncReadExt};
use serde_json::{Map, Value};
use tracing::{Level, event};

use super::{
    AsyncReaderSteps, EntityReferenceLink, Entry, Feed, NavigationLink, ReaderItem, ReaderState, ReaderSteps, Scope, ScopeStack,
};
use crate::depth;
use crate::{Error, Result};

const FEED_VALUE: &str = "value";
const ODATA_ID: &str = "odata.id";
const ODATA_TYPE: &str = "odata.type";
const ODATA_ETAG: &str = "odata.etag";
const ODATA_COUNT: &str = "odata.count";
const ODATA_NEXT_LINK: &str = "odata.nextLink";
const ODATA_NAVIGATION_LINK: &str = "odata.navigationLink";
const ODATA_BIND: &str = "odata.bind";

/// What [`JsonPayloadSteps`] still has to read in a scope.
#[derive(Debug, Default)]
pub struct JsonScope(Cursor);

#[derive(Debug, Default)]
enum Cursor {
    #[default]
    Root,
    Feed(VecDeque<Map<String, Value>>),
    Entry(VecDeque<PendingLink>),
    Link(Option<LinkContent>),
    Reference,
}

#[derive(Debug)]
struct PendingLink {
    link: NavigationLink,
    content: LinkContent,
}

#[derive(Debug)]
enum LinkContent {
    Deferred,
    Entry(Map<String, Value>),
    Feed(VecDeque<Map<String, Value>>),
    References(VecDeque<String>),
}

/// Reads feeds, entries and links from a JSON payload.
///
/// The whole payload is read from the source in the `Start` step; the remaining steps walk the
/// parsed document. The payload is either a feed (an object with a `value` array of entries) or
/// a single entry (any other object). Within an entry:
///
/// * `@odata.id`, `@odata.type` and `@odata.etag` annotate the entry.
/// * Object members and non-empty arrays of objects are expanded navigation links. Without a
///   model, complex values cannot be told apart from expanded entries. An empty array stays a
///   property.
/// * `Name@odata.navigationLink` declares a deferred navigation link.
/// * `Name@odata.bind`, a URL or an array of URLs, declares entity reference links.
/// * Everything else is a structural property.
///
/// On a feed, `@odata.id`, `@odata.count` and `@odata.nextLink` are read. Links of an entry are
/// reported in the order of their names.
///
/// Implements [`ReaderSteps`] over [`std::io::Read`] sources and [`AsyncReaderSteps`] over
/// [`futures::io::AsyncRead`] sources.
#[derive(Debug)]
pub struct JsonPayloadSteps<R> {
    source: Option<R>,
}

impl<R> JsonPayloadSteps<R> {
    /// Creates a step source reading the payload from `source`.
    #[must_use]
    pub fn new(source: R) -> Self {
        Self { source: Some(source) }
    }

    fn take_source(&mut self) -> Result<R> {
        self.source
            .take()
            .ok_or_else(|| Error::internal("the payload has already been read"))
    }
}

impl<R: io::Read> ReaderSteps for JsonPayloadSteps<R> {
    type ScopeData = JsonScope;

    fn read_at_start(&mut self, scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
        let payload = depth::parse_json(serde_json::Deserializer::from_reader(self.take_source()?))?;
        start(payload, scopes)
    }

    fn read_at_feed_start(&mut self, scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
        next_entry_or_end(scopes)
    }

    fn read_at_feed_end(&mut self, scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
        end_child(scopes)
    }

    fn read_at_entry_start(&mut self, scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
        next_link_or_end(scopes)
    }

    fn read_at_entry_end(&mut self, scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
        end_child(scopes)
    }

    fn read_at_navigation_link_start(&mut self, scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
        navigation_link_content(scopes)
    }

    fn read_at_navigation_link_end(&mut self, scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
        scopes.pop();
        next_link_or_end(scopes)
    }

    fn read_at_entity_reference_link(&mut self, scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
        scopes.pop();
        next_reference_or_end(scopes)
    }
}

impl<R: AsyncRead + Unpin + Send> AsyncReaderSteps for JsonPayloadSteps<R> {
    type ScopeData = JsonScope;

    async fn read_at_start(&mut self, scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
        let mut source = self.take_source()?;
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes).await?;

        let payload = depth::parse_json(serde_json::Deserializer::from_slice(&bytes))?;
        start(payload, scopes)
    }

    async fn read_at_feed_start(&mut self, scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
        next_entry_or_end(scopes)
    }

    async fn read_at_feed_end(&mut self, scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
        end_child(scopes)
    }

    async fn read_at_entry_start(&mut self, scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
        next_link_or_end(scopes)
    }

    async fn read_at_entry_end(&mut self, scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
        end_child(scopes)
    }

    async fn read_at_navigation_link_start(&mut self, scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
        navigation_link_content(scopes)
    }

    async fn read_at_navigation_link_end(&mut self, scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
        scopes.pop();
        next_link_or_end(scopes)
    }

    async fn read_at_entity_reference_link(&mut self, scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
        scopes.pop();
        next_reference_or_end(scopes)
    }
}

fn start(payload: Value, scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
    let Value::Object(mut object) = payload else {
        return Err(Error::format("the payload must be a JSON object"));
    };

    match object.remove(FEED_VALUE) {
        Some(Value::Array(values)) => {
            let feed = Feed {
                id: instance_annotation(&object, ODATA_ID)?,
                count: object.get(&format!("@{ODATA_COUNT}")).and_then(Value::as_u64),
                next_link: instance_annotation(&object, ODATA_NEXT_LINK)?,
            };
            event!(name: "odata_batch.reader.json_payload", Level::TRACE, kind = "feed", entries = values.len());
            push_feed(scopes, feed, values)
        }
        other => {
            if let Some(value) = other {
                object.insert(FEED_VALUE.to_owned(), value);
            }
            event!(name: "odata_batch.reader.json_payload", Level::TRACE, kind = "entry");
            push_entry(scopes, object)
        }
    }
}

fn push_feed(scopes: &mut ScopeStack<JsonScope>, feed: Feed, values: Vec<Value>) -> Result<()> {
    let entries = values
        .into_iter()
        .map(|value| match value {
            Value::Object(object) => Ok(object),
            other => Err(Error::format(format!("a feed entry must be a JSON object, found {other}"))),
        })
        .collect::<Result<_>>()?;

    scopes.push(Scope::new(
        ReaderState::FeedStart,
        Some(feed.into()),
        JsonScope(Cursor::Feed(entries)),
    ));
    Ok(())
}

fn push_entry(scopes: &mut ScopeStack<JsonScope>, object: Map<String, Value>) -> Result<()> {
    let (entry, links) = parse_entry(object)?;

    scopes.push(Scope::new(
        ReaderState::EntryStart,
        Some(entry.into()),
        JsonScope(Cursor::Entry(links)),
    ));
    Ok(())
}

fn parse_entry(object: Map<String, Value>) -> Result<(Entry, VecDeque<PendingLink>)> {
    let mut entry = Entry::default();
    let mut links = BTreeMap::new();

    for (key, value) in object {
        if let Some((name, annotation)) = key.split_once('@') {
            if name.is_empty() {
                match annotation {
                    ODATA_ID => entry.id = Some(annotation_string(&key, value)?),
                    ODATA_TYPE => entry.type_name = Some(annotation_string(&key, value)?.trim_start_matches('#').to_owned()),
                    ODATA_ETAG => entry.etag = Some(annotation_string(&key, value)?),
                    _ => {}
                }
            } else {
                match annotation {
                    ODATA_NAVIGATION_LINK => {
                        let url = annotation_string(&key, value)?;
                        link_named(&mut links, name).link.url = Some(url);
                    }
                    ODATA_BIND => {
                        let (urls, is_collection) = match value {
                            Value::String(url) => (VecDeque::from([url]), false),
                            Value::Array(items) => (
                                items
                                    .into_iter()
                                    .map(|item| annotation_string(&key, item))
                                    .collect::<Result<_>>()?,
                                true,
                            ),
                            other => return Err(Error::format(format!("'{key}' must be a URL or an array of URLs, found {other}"))),
                        };

                        let pending = link_named(&mut links, name);
                        pending.link.is_collection = Some(is_collection);
                        pending.content = LinkContent::References(urls);
                    }
                    _ => {}
                }
            }
            continue;
        }

        match value {
            Value::Object(expanded) => {
                let pending = link_named(&mut links, &key);
                pending.link.is_collection = Some(false);
                pending.content = LinkContent::Entry(expanded);
            }
            Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_object) => {
                let entries = items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::Object(object) => Some(object),
                        _ => None,
                    })
                    .collect();

                let pending = link_named(&mut links, &key);
                pending.link.is_collection = Some(true);
                pending.content = LinkContent::Feed(entries);
            }
            property => {
                entry.properties.insert(key, property);
            }
        }
    }

    Ok((entry, links.into_values().collect()))
}

fn link_named<'a>(links: &'a mut BTreeMap<String, PendingLink>, name: &str) -> &'a mut PendingLink {
    links.entry(name.to_owned()).or_insert_with(|| PendingLink {
        link: NavigationLink {
            name: name.to_owned(),
            ..NavigationLink::default()
        },
        content: LinkContent::Deferred,
    })
}

fn next_entry_or_end(scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
    let scope = current(scopes)?;
    let JsonScope(Cursor::Feed(entries)) = scope.data_mut() else {
        return Err(unexpected_scope("feed"));
    };

    match entries.pop_front() {
        Some(object) => push_entry(scopes, object),
        None => {
            scope.set_state(ReaderState::FeedEnd);
            Ok(())
        }
    }
}

fn next_link_or_end(scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
    let scope = current(scopes)?;
    let JsonScope(Cursor::Entry(links)) = scope.data_mut() else {
        return Err(unexpected_scope("entry"));
    };

    match links.pop_front() {
        Some(PendingLink { link, content }) => {
            scopes.push(Scope::new(
                ReaderState::NavigationLinkStart,
                Some(link.into()),
                JsonScope(Cursor::Link(Some(content))),
            ));
            Ok(())
        }
        None => {
            scope.set_state(ReaderState::EntryEnd);
            Ok(())
        }
    }
}

fn navigation_link_content(scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
    let scope = current(scopes)?;
    let JsonScope(Cursor::Link(content)) = scope.data_mut() else {
        return Err(unexpected_scope("navigation link"));
    };

    match content.take() {
        None | Some(LinkContent::Deferred) => {
            scope.set_state(ReaderState::NavigationLinkEnd);
            Ok(())
        }
        Some(LinkContent::Entry(object)) => push_entry(scopes, object),
        Some(LinkContent::Feed(entries)) => {
            scopes.push(Scope::new(
                ReaderState::FeedStart,
                Some(Feed::default().into()),
                JsonScope(Cursor::Feed(entries)),
            ));
            Ok(())
        }
        Some(references @ LinkContent::References(_)) => {
            *content = Some(references);
            next_reference_or_end(scopes)
        }
    }
}

fn next_reference_or_end(scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
    let scope = current(scopes)?;
    let JsonScope(Cursor::Link(Some(LinkContent::References(urls)))) = scope.data_mut() else {
        return Err(unexpected_scope("entity reference links"));
    };

    match urls.pop_front() {
        Some(url) => {
            scopes.push(Scope::new(
                ReaderState::EntityReferenceLink,
                Some(ReaderItem::EntityReferenceLink(EntityReferenceLink { url })),
                JsonScope(Cursor::Reference),
            ));
            Ok(())
        }
        None => {
            scope.set_state(ReaderState::NavigationLinkEnd);
            Ok(())
        }
    }
}

// Leaves a finished feed or entry and moves its parent on.
fn end_child(scopes: &mut ScopeStack<JsonScope>) -> Result<()> {
    scopes.pop();
    let parent = current(scopes)?;

    match parent.state() {
        ReaderState::Start => {
            parent.set_state(ReaderState::Completed);
            parent.set_item(None);
            Ok(())
        }
        ReaderState::FeedStart => next_entry_or_end(scopes),
        ReaderState::NavigationLinkStart => {
            parent.set_state(ReaderState::NavigationLinkEnd);
            Ok(())
        }
        state => Err(Error::internal(format!("a feed or entry ended inside the {state} state"))),
    }
}

fn current(scopes: &mut ScopeStack<JsonScope>) -> Result<&mut Scope<JsonScope>> {
    scopes
        .current_mut()
        .ok_or_else(|| Error::internal("the reader has no current scope"))
}

fn unexpected_scope(expected: &str) -> Error {
    Error::internal(format!("expected the current scope to be a {expected}"))
}

fn instance_annotation(object: &Map<String, Value>, annotation: &str) -> Result<Option<String>> {
    let key = format!("@{annotation}");
    object
        .get(&key)
        .map(|value| annotation_string(&key, value.clone()))
        .transpose()
}

fn annotation_string(key: &str, value: Value) -> Result<String> {
    match value {
        Value::String(value) => Ok(value),
        other => Err(Error::format(format!("'{key}' must be a string, found {other}"))),
    }
}
