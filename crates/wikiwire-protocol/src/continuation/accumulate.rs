//! Per-entity accumulation of continuation rounds

use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::fmt;

use crate::decode::page_objects;
use crate::module::ResultSlot;

/// Identity of a page across rounds: its title, or its id when the server
/// sent no title.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    Title(String),
    PageId(i64),
    /// Neither title nor id; kept in arrival order.
    Position(usize),
}

impl EntityKey {
    fn of(page: &Map<String, Value>, position: usize) -> Self {
        if let Some(title) = page.get("title").and_then(Value::as_str) {
            Self::Title(title.to_string())
        } else if let Some(id) = page.get("pageid").and_then(Value::as_i64) {
            Self::PageId(id)
        } else {
            Self::Position(position)
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Title(title) => f.write_str(title),
            Self::PageId(id) => write!(f, "#{id}"),
            Self::Position(n) => write!(f, "@{n}"),
        }
    }
}

/// Everything a query has returned so far, merged across rounds.
///
/// Pages keep first-seen order. Within a page, array fields (revisions,
/// categories, ...) are appended in server order, object fields are merged
/// key by key, and scalars take the latest value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccumulatedResult {
    pages: IndexMap<EntityKey, Map<String, Value>>,
    lists: IndexMap<String, Vec<Value>>,
    meta: Map<String, Value>,
    extra: Map<String, Value>,
    anonymous: usize,
}

impl AccumulatedResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one round's result tree. With `allow_new_pages` false, data for
    /// pages not seen before is dropped.
    pub(crate) fn merge(&mut self, data: &Value, allow_new_pages: bool) {
        let Some(top) = data.as_object() else {
            return;
        };
        for (key, value) in top {
            if key == "query" {
                self.merge_query(value, allow_new_pages);
            } else {
                merge_field(&mut self.extra, key, value);
            }
        }
    }

    fn merge_query(&mut self, query: &Value, allow_new_pages: bool) {
        let Some(query) = query.as_object() else {
            return;
        };
        for (name, value) in query {
            match (name.as_str(), value) {
                ("pages", pages) => self.merge_pages(pages, allow_new_pages),
                (_, Value::Array(items)) => self
                    .lists
                    .entry(name.clone())
                    .or_default()
                    .extend(items.iter().cloned()),
                _ => merge_field(&mut self.meta, name, value),
            }
        }
    }

    fn merge_pages(&mut self, pages: &Value, allow_new_pages: bool) {
        for page in page_objects(pages) {
            let Some(fields) = page.as_object() else {
                continue;
            };
            let key = EntityKey::of(fields, self.anonymous);
            if matches!(key, EntityKey::Position(_)) {
                self.anonymous += 1;
            }
            if !allow_new_pages && !self.pages.contains_key(&key) {
                continue;
            }
            let entry = self.pages.entry(key).or_default();
            for (name, value) in fields {
                merge_field(entry, name, value);
            }
        }
    }

    pub fn pages(&self) -> impl Iterator<Item = (&EntityKey, &Map<String, Value>)> {
        self.pages.iter()
    }

    pub fn page(&self, title: &str) -> Option<&Map<String, Value>> {
        self.pages.get(&EntityKey::Title(title.to_string()))
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Titles of all pages, in first-seen order.
    pub fn titles(&self) -> Vec<&str> {
        self.pages
            .values()
            .filter_map(|p| p.get("title").and_then(Value::as_str))
            .collect()
    }

    /// Items of a list module such as `categorymembers`.
    pub fn list(&self, name: &str) -> &[Value] {
        self.lists.get(name).map_or(&[], Vec::as_slice)
    }

    /// Titles of a list module's items.
    pub fn list_titles(&self, name: &str) -> Vec<&str> {
        self.list(name)
            .iter()
            .filter_map(|item| item.get("title").and_then(Value::as_str))
            .collect()
    }

    pub fn list_names(&self) -> impl Iterator<Item = &str> {
        self.lists.keys().map(String::as_str)
    }

    /// Output of a meta module such as `userinfo` or `general`.
    pub fn meta(&self, name: &str) -> Option<&Value> {
        self.meta.get(name)
    }

    /// Top-level results outside `query`, e.g. `parse`.
    pub fn extra(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
            && self.lists.is_empty()
            && self.meta.is_empty()
            && self.extra.is_empty()
    }

    /// Everything as one JSON tree: `{pages: [...], lists: {...}, meta: {...}}`.
    pub fn to_value(&self) -> Value {
        let pages = self
            .pages
            .values()
            .map(|p| Value::Object(p.clone()))
            .collect();
        let lists = self
            .lists
            .iter()
            .map(|(k, v)| (k.clone(), Value::Array(v.clone())))
            .collect();
        let mut out = Map::new();
        out.insert("pages".to_string(), Value::Array(pages));
        out.insert("lists".to_string(), Value::Object(lists));
        out.insert("meta".to_string(), Value::Object(self.meta.clone()));
        if !self.extra.is_empty() {
            out.insert("extra".to_string(), Value::Object(self.extra.clone()));
        }
        Value::Object(out)
    }

    /// Number of items a module has accumulated.
    pub(crate) fn item_count(&self, slot: &ResultSlot) -> usize {
        match slot {
            ResultSlot::Pages => self.pages.len(),
            ResultSlot::List(name) => self.lists.get(name).map_or(0, Vec::len),
            ResultSlot::PageField(field) => self
                .pages
                .values()
                .filter_map(|p| p.get(field).and_then(Value::as_array))
                .map(Vec::len)
                .sum(),
            ResultSlot::Meta(_) | ResultSlot::None => 0,
        }
    }

    /// Keep only the first `max` items of a module.
    pub(crate) fn truncate(&mut self, slot: &ResultSlot, max: usize) {
        match slot {
            ResultSlot::Pages => self.pages.truncate(max),
            ResultSlot::List(name) => {
                if let Some(items) = self.lists.get_mut(name) {
                    items.truncate(max);
                }
            }
            ResultSlot::PageField(field) => {
                let mut budget = max;
                for page in self.pages.values_mut() {
                    if let Some(Value::Array(items)) = page.get_mut(field) {
                        items.truncate(budget);
                        budget -= items.len();
                    }
                }
            }
            ResultSlot::Meta(_) | ResultSlot::None => {}
        }
    }

    /// Drop everything a module contributed.
    pub(crate) fn discard(&mut self, slot: &ResultSlot) {
        match slot {
            ResultSlot::Pages => self.pages.clear(),
            ResultSlot::List(name) => {
                self.lists.shift_remove(name);
            }
            ResultSlot::PageField(field) => {
                for page in self.pages.values_mut() {
                    page.remove(field);
                }
            }
            ResultSlot::Meta(name) => {
                self.meta.remove(name);
            }
            ResultSlot::None => {}
        }
    }
}

fn merge_field(target: &mut Map<String, Value>, name: &str, value: &Value) {
    match (target.get_mut(name), value) {
        (Some(Value::Array(existing)), Value::Array(items)) => {
            existing.extend(items.iter().cloned());
        }
        (Some(Value::Object(existing)), Value::Object(fields)) => {
            for (k, v) in fields {
                existing.insert(k.clone(), v.clone());
            }
        }
        _ => {
            target.insert(name.to_string(), value.clone());
        }
    }
}
