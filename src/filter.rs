//! NIP-01 filters: matching and query planning.
//!
//! A filter ANDs its fields together and ORs the values inside each field:
//! - `ids`, `authors`, `kinds`
//! - `#<letter>` tag queries (`#e`, `#p`, ...)
//! - `since` / `until` time bounds
//! - `limit` result cap
//! - `search`, accepted on the wire but not evaluated

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::{Event, EventClass, ReplaceableKey};

/// Query descriptor exchanged with clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Lower bound on `created_at` (inclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Upper bound on `created_at`; see [`UntilBound`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// Full-text search is not supported; the field round-trips untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,

    /// Tag queries keyed with their `#` prefix (e.g. `#e`).
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
}

/// Whether `until` admits events created exactly at the bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UntilBound {
    /// `since <= created_at < until`
    #[default]
    Exclusive,
    /// `since <= created_at <= until` (NIP-01 wording)
    Inclusive,
}

/// Index path chosen for a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Direct lookups by id.
    Ids(Vec<String>),
    /// Lookups in the replaceable-key index.
    Replaceable(Vec<ReplaceableKey>),
    /// Posting lists of a single tag name.
    Tag { name: String, values: Vec<String> },
    /// Time-ordered scan over everything within the bounds.
    Scan,
}

impl Filter {
    /// Create a new empty filter (matches all events).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag filter; `tag_name` may be given with or without `#`.
    pub fn tag(mut self, tag_name: &str, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let key = if tag_name.starts_with('#') {
            tag_name.to_string()
        } else {
            format!("#{tag_name}")
        };
        self.tags.insert(key, values.into_iter().map(Into::into).collect());
        self
    }

    /// Check an event against this filter with the default time bounds.
    pub fn matches(&self, event: &Event) -> bool {
        self.matches_bounded(event, UntilBound::default())
    }

    /// Check an event against this filter.
    ///
    /// `limit` and `search` do not take part in matching.
    pub fn matches_bounded(&self, event: &Event, until_bound: UntilBound) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| *id == event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| *a == event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if !self.time_matches(event.created_at, until_bound) {
            return false;
        }
        self.tags_match(event)
    }

    fn time_matches(&self, created_at: u64, until_bound: UntilBound) -> bool {
        if let Some(since) = self.since {
            if created_at < since {
                return false;
            }
        }
        match (self.until, until_bound) {
            (Some(until), UntilBound::Exclusive) => created_at < until,
            (Some(until), UntilBound::Inclusive) => created_at <= until,
            (None, _) => true,
        }
    }

    fn tags_match(&self, event: &Event) -> bool {
        self.tags.iter().all(|(key, values)| {
            // Only `#<name>` keys constrain tags; other extension fields are ignored.
            let Some(name) = key.strip_prefix('#') else {
                return true;
            };
            event
                .tag_values(name)
                .any(|v| values.iter().any(|allowed| allowed == v))
        })
    }

    /// Pick the narrowest index path for this filter.
    ///
    /// This is a cost heuristic only: candidates produced by any plan are
    /// still checked with [`Filter::matches_bounded`].
    pub fn plan(&self) -> Plan {
        if let Some(ids) = &self.ids {
            return Plan::Ids(ids.clone());
        }
        if let Some(keys) = self.replaceable_keys() {
            return Plan::Replaceable(keys);
        }
        // Prefer the indexed tag with the fewest requested values.
        let tag = self
            .tags
            .iter()
            .filter_map(|(key, values)| {
                let name = key.strip_prefix('#')?;
                (name.chars().count() == 1).then_some((name, values))
            })
            .min_by_key(|(_, values)| values.len());
        if let Some((name, values)) = tag {
            return Plan::Tag {
                name: name.to_string(),
                values: values.clone(),
            };
        }
        Plan::Scan
    }

    /// Expand `authors` × `kinds` (× `#d`) into replaceable keys when every
    /// requested kind is replaceable.
    fn replaceable_keys(&self) -> Option<Vec<ReplaceableKey>> {
        let authors = self.authors.as_ref()?;
        let kinds = self.kinds.as_ref()?;
        if authors.is_empty() || kinds.is_empty() {
            return None;
        }
        let d_values = self.tags.get("#d");
        let mut keys = Vec::new();
        for &kind in kinds {
            let ds: Vec<Option<String>> = match EventClass::of_kind(kind) {
                EventClass::Replaceable => vec![None],
                EventClass::ParameterizedReplaceable => {
                    d_values?.iter().cloned().map(Some).collect()
                }
                _ => return None,
            };
            for author in authors {
                for d in &ds {
                    keys.push(ReplaceableKey {
                        pubkey: author.clone(),
                        kind,
                        d: d.clone(),
                    });
                }
            }
        }
        Some(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;

    fn make_event(id: &str, pubkey: &str, kind: u16, created_at: u64) -> Event {
        make_event_with_tags(id, pubkey, kind, created_at, vec![])
    }

    fn make_event_with_tags(
        id: &str,
        pubkey: &str,
        kind: u16,
        created_at: u64,
        tags: Vec<Vec<&str>>,
    ) -> Event {
        Event {
            id: id.to_string(),
            pubkey: pubkey.to_string(),
            created_at,
            kind,
            tags: tags
                .into_iter()
                .map(|t| Tag(t.into_iter().map(String::from).collect()))
                .collect(),
            content: "test".to_string(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn empty_filter_matches_all() {
        assert!(Filter::new().matches(&make_event("abc", "xyz", 1, 1000)));
    }

    #[test]
    fn kinds_are_ored() {
        let filter = Filter::new().kinds([1, 7]);
        assert!(filter.matches(&make_event("id", "pk", 1, 1000)));
        assert!(filter.matches(&make_event("id", "pk", 7, 1000)));
        assert!(!filter.matches(&make_event("id", "pk", 2, 1000)));
    }

    #[test]
    fn ids_and_authors_match_exactly() {
        let filter = Filter::new().ids(["abc"]);
        assert!(filter.matches(&make_event("abc", "pk", 1, 1)));
        assert!(!filter.matches(&make_event("abc123", "pk", 1, 1)));
        let filter = Filter::new().authors(["pk"]);
        assert!(!filter.matches(&make_event("id", "pk2", 1, 1)));
    }

    #[test]
    fn empty_value_list_matches_nothing() {
        assert!(!Filter::new().kinds([]).matches(&make_event("id", "pk", 1, 1)));
        assert!(!Filter::new().tag("e", Vec::<String>::new()).matches(&make_event_with_tags(
            "id",
            "pk",
            1,
            1,
            vec![vec!["e", "abc"]]
        )));
    }

    #[test]
    fn tag_filters() {
        let ev = make_event_with_tags("id", "pk", 1, 1, vec![vec!["e", "abc"], vec!["p", "def"]]);
        assert!(Filter::new().tag("e", ["abc"]).matches(&ev));
        assert!(!Filter::new().tag("e", ["xyz"]).matches(&ev));
        assert!(Filter::new().tag("#p", ["def", "zzz"]).matches(&ev));
        assert!(!Filter::new().tag("e", ["abc"]).tag("p", ["nope"]).matches(&ev));
        // a tag without a value never matches
        let bare = make_event_with_tags("id", "pk", 1, 1, vec![vec!["e"]]);
        assert!(!Filter::new().tag("e", ["abc"]).matches(&bare));
    }

    #[test]
    fn since_inclusive_until_exclusive_by_default() {
        let filter = Filter::new().since(100).until(200);
        assert!(!filter.matches(&make_event("id", "pk", 1, 99)));
        assert!(filter.matches(&make_event("id", "pk", 1, 100)));
        assert!(filter.matches(&make_event("id", "pk", 1, 199)));
        assert!(!filter.matches(&make_event("id", "pk", 1, 200)));
    }

    #[test]
    fn inclusive_until_when_configured() {
        let filter = Filter::new().since(100).until(200);
        let ev = make_event("id", "pk", 1, 200);
        assert!(filter.matches_bounded(&ev, UntilBound::Inclusive));
        assert!(!filter.matches_bounded(&make_event("id", "pk", 1, 201), UntilBound::Inclusive));
    }

    #[test]
    fn deserializes_wire_shape() {
        let filter: Filter = serde_json::from_str(
            r##"{"ids":["a"],"authors":["b"],"kinds":[1,30023],"#e":["x"],"#p":["y"],"since":1,"until":2,"limit":3,"search":"q"}"##,
        )
        .unwrap();
        assert_eq!(filter.ids.as_deref(), Some(&["a".to_string()][..]));
        assert_eq!(filter.kinds, Some(vec![1, 30023]));
        assert_eq!(filter.tags.get("#e").unwrap(), &vec!["x".to_string()]);
        assert_eq!(filter.tags.len(), 2);
        assert_eq!(filter.limit, Some(3));
        assert_eq!(filter.search.as_deref(), Some("q"));
        let json = serde_json::to_string(&filter).unwrap();
        assert!(json.contains(r##""#p":["y"]"##));
        assert_eq!(serde_json::from_str::<Filter>(&json).unwrap(), filter);
    }

    #[test]
    fn empty_json_filter_is_default() {
        let filter: Filter = serde_json::from_str("{}").unwrap();
        assert_eq!(filter, Filter::default());
        assert_eq!(serde_json::to_string(&filter).unwrap(), "{}");
    }

    #[test]
    fn unknown_fields_do_not_constrain_tags() {
        let filter: Filter = serde_json::from_str(r#"{"kinds":[1],"foo":["bar"]}"#).unwrap();
        let ev = make_event_with_tags("id", "pk", 1, 1, vec![vec!["t", "x"]]);
        assert!(filter.matches(&ev));
        assert!(matches!(filter.plan(), Plan::Scan));
        // an event that happens to carry a `foo` tag is not favored either
        let tagged = make_event_with_tags("id", "pk", 1, 1, vec![vec!["foo", "zzz"]]);
        assert!(filter.matches(&tagged));
    }

    #[test]
    fn plan_prefers_ids() {
        let filter = Filter::new().ids(["a"]).authors(["p"]).kinds([0]);
        assert_eq!(filter.plan(), Plan::Ids(vec!["a".into()]));
    }

    #[test]
    fn plan_uses_replaceable_index() {
        let filter = Filter::new().authors(["p1", "p2"]).kinds([0, 3]);
        match filter.plan() {
            Plan::Replaceable(keys) => assert_eq!(keys.len(), 4),
            other => panic!("unexpected plan {other:?}"),
        }
        let filter = Filter::new().authors(["p1"]).kinds([30023]).tag("d", ["a", "b"]);
        match filter.plan() {
            Plan::Replaceable(keys) => {
                assert_eq!(keys.len(), 2);
                assert_eq!(keys[0].d.as_deref(), Some("a"));
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn plan_falls_back_without_d_or_with_regular_kinds() {
        let filter = Filter::new().authors(["p1"]).kinds([30023]);
        assert_eq!(filter.plan(), Plan::Scan);
        let filter = Filter::new().authors(["p1"]).kinds([0, 1]);
        assert_eq!(filter.plan(), Plan::Scan);
    }

    #[test]
    fn plan_picks_smallest_tag() {
        let filter = Filter::new().tag("p", ["a", "b"]).tag("e", ["c"]);
        assert_eq!(
            filter.plan(),
            Plan::Tag {
                name: "e".into(),
                values: vec!["c".into()]
            }
        );
        let filter = Filter::new().tag("long", ["x"]);
        assert_eq!(filter.plan(), Plan::Scan);
    }
}
