//! Bidirectional tag registry.
//!
//! Tracks which cache keys carry which tags so a tag invalidation can find every affected
//! entry, mounted or not.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use super::keys::{CacheKey, Tag};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::registry";

/// Tracks tag → keys and key → tags mappings.
pub struct CacheRegistry {
    tag_to_keys: RwLock<HashMap<Tag, HashSet<CacheKey>>>,
    key_to_tags: RwLock<HashMap<CacheKey, BTreeSet<Tag>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self {
            tag_to_keys: RwLock::new(HashMap::new()),
            key_to_tags: RwLock::new(HashMap::new()),
        }
    }

    /// Attach `tags` to `key`. Tags accumulate; registering never detaches earlier tags.
    pub fn register<'a>(&self, key: &CacheKey, tags: impl IntoIterator<Item = &'a Tag>) {
        let mut t2k = rw_write(&self.tag_to_keys, SOURCE, "register.tag_to_keys");
        let mut k2t = rw_write(&self.key_to_tags, SOURCE, "register.key_to_tags");

        let known = k2t.entry(key.clone()).or_default();
        for tag in tags {
            if known.insert(tag.clone()) {
                t2k.entry(tag.clone()).or_default().insert(key.clone());
            }
        }
    }

    pub fn keys_for_tag(&self, tag: &Tag) -> HashSet<CacheKey> {
        rw_read(&self.tag_to_keys, SOURCE, "keys_for_tag")
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tags_for_key(&self, key: &CacheKey) -> BTreeSet<Tag> {
        rw_read(&self.key_to_tags, SOURCE, "tags_for_key")
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove a key and clean up its tag mappings. Called when an entry is evicted.
    pub fn unregister(&self, key: &CacheKey) {
        let mut t2k = rw_write(&self.tag_to_keys, SOURCE, "unregister.tag_to_keys");
        let mut k2t = rw_write(&self.key_to_tags, SOURCE, "unregister.key_to_tags");

        if let Some(tags) = k2t.remove(key) {
            for tag in tags {
                if let Some(keys) = t2k.get_mut(&tag) {
                    keys.remove(key);
                    if keys.is_empty() {
                        t2k.remove(&tag);
                    }
                }
            }
        }
    }

    pub fn clear(&self) {
        rw_write(&self.tag_to_keys, SOURCE, "clear.tag_to_keys").clear();
        rw_write(&self.key_to_tags, SOURCE, "clear.key_to_tags").clear();
    }

    pub fn tag_count(&self) -> usize {
        rw_read(&self.tag_to_keys, SOURCE, "tag_count").len()
    }

    pub fn key_count(&self) -> usize {
        rw_read(&self.key_to_tags, SOURCE, "key_count").len()
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> Vec<Tag> {
        names.iter().map(|name| Tag::from(*name)).collect()
    }

    #[test]
    fn register_and_lookup() {
        let registry = CacheRegistry::new();
        let key = CacheKey::from("teams");
        registry.register(&key, &tags(&["teams", "dashboard"]));

        assert!(registry.keys_for_tag(&Tag::from("teams")).contains(&key));
        assert!(registry.keys_for_tag(&Tag::from("dashboard")).contains(&key));
        assert_eq!(registry.tags_for_key(&key).len(), 2);
    }

    #[test]
    fn tags_match_exactly() {
        let registry = CacheRegistry::new();
        registry.register(&CacheKey::from("teams-data"), &tags(&["teams-data"]));

        assert!(registry.keys_for_tag(&Tag::from("team")).is_empty());
        assert!(registry.keys_for_tag(&Tag::from("teams")).is_empty());
    }

    #[test]
    fn registering_twice_accumulates() {
        let registry = CacheRegistry::new();
        let key = CacheKey::from("posts");
        registry.register(&key, &tags(&["posts"]));
        registry.register(&key, &tags(&["posts", "feed"]));

        assert_eq!(registry.tags_for_key(&key).len(), 2);
        assert_eq!(registry.keys_for_tag(&Tag::from("posts")).len(), 1);
    }

    #[test]
    fn unregister_cleans_up() {
        let registry = CacheRegistry::new();
        let first = CacheKey::from("posts:{\"page\":0}");
        let second = CacheKey::from("posts:{\"page\":1}");
        registry.register(&first, &tags(&["posts"]));
        registry.register(&second, &tags(&["posts"]));

        registry.unregister(&first);
        assert_eq!(registry.keys_for_tag(&Tag::from("posts")).len(), 1);
        assert_eq!(registry.key_count(), 1);

        registry.unregister(&second);
        assert_eq!(registry.tag_count(), 0);
    }

    #[test]
    fn clear_removes_everything() {
        let registry = CacheRegistry::new();
        registry.register(&CacheKey::from("weeks"), &tags(&["weeks"]));
        registry.clear();
        assert_eq!(registry.tag_count(), 0);
        assert_eq!(registry.key_count(), 0);
    }
}
