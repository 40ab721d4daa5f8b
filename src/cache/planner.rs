//! Invalidation plan generation.
//!
//! Merges a batch of cache events into the set of tags and keys to mark stale.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use super::events::{CacheEvent, EventKind};
use super::keys::{CacheKey, Tag};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
    pub tags: BTreeSet<Tag>,
    pub keys: BTreeSet<CacheKey>,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<&str> = self.tags.iter().map(Tag::as_str).collect();
        write!(
            f,
            "InvalidationPlan {{ tags: [{}], keys: {} }}",
            tags.join(", "),
            self.keys.len()
        )
    }
}

impl InvalidationPlan {
    /// Merge events into a plan, ignoring events already seen by id.
    pub fn from_events(events: Vec<CacheEvent>) -> Self {
        let mut plan = Self::default();
        let mut seen_ids = HashSet::new();

        for event in events.into_iter().filter(|e| seen_ids.insert(e.id)) {
            match event.kind {
                EventKind::TagsInvalidated { tags } => plan.tags.extend(tags),
                EventKind::KeysInvalidated { keys } => plan.keys.extend(keys),
            }
        }

        plan
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, epoch: u64) -> CacheEvent {
        CacheEvent::new(kind, epoch)
    }

    #[test]
    fn merges_tags_and_keys() {
        let plan = InvalidationPlan::from_events(vec![
            event(
                EventKind::TagsInvalidated {
                    tags: vec![Tag::from("teams"), Tag::from("posts")],
                },
                0,
            ),
            event(
                EventKind::TagsInvalidated {
                    tags: vec![Tag::from("teams")],
                },
                1,
            ),
            event(
                EventKind::KeysInvalidated {
                    keys: vec![CacheKey::from("weeks")],
                },
                2,
            ),
        ]);

        assert_eq!(plan.tags.len(), 2);
        assert!(plan.keys.contains(&CacheKey::from("weeks")));
        assert_eq!(
            plan.to_string(),
            "InvalidationPlan { tags: [posts, teams], keys: 1 }"
        );
    }

    #[test]
    fn duplicate_event_ids_are_ignored() {
        let original = event(
            EventKind::KeysInvalidated {
                keys: vec![CacheKey::from("a")],
            },
            0,
        );
        let mut replay = original.clone();
        replay.kind = EventKind::KeysInvalidated {
            keys: vec![CacheKey::from("b")],
        };

        let plan = InvalidationPlan::from_events(vec![original, replay]);
        assert_eq!(plan.keys.len(), 1);
        assert!(plan.keys.contains(&CacheKey::from("a")));
    }

    #[test]
    fn empty_batch_is_empty_plan() {
        assert!(InvalidationPlan::from_events(Vec::new()).is_empty());
    }
}
