//! Coalescing of duplicate read-only requests.
//!
//! Only actions explicitly classed [`ActionClass::Idempotent`] in the
//! [`ActionCatalog`] are eligible. Action names are never pattern-matched.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sha2::{Digest, Sha256};

use crate::completion::Completion;
use crate::protocol::Payload;
use crate::request_id::RequestId;

/// Read-only editor actions coalesced out of the box.
pub const DEFAULT_IDEMPOTENT_ACTIONS: &[&str] = &[
    "asset_exists",
    "find_by_class",
    "find_by_tag",
    "get_bounding_box",
    "get_component_property",
    "get_components",
    "get_dependencies",
    "get_editor_status",
    "get_metadata",
    "get_output_log",
    "get_project_settings",
    "get_property",
    "get_selected_actors",
    "list_assets",
    "list_levels",
    "list_objects",
    "search_assets",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ActionClass {
    /// No side effects; concurrent identical requests may share one dispatch.
    Idempotent,
    #[default]
    Mutating,
}

/// Explicit per-action capability tags. Unknown actions are `Mutating`.
#[derive(Debug, Clone)]
pub struct ActionCatalog {
    classes: HashMap<String, ActionClass>,
}

impl Default for ActionCatalog {
    fn default() -> Self {
        let mut catalog = Self::empty();
        for action in DEFAULT_IDEMPOTENT_ACTIONS {
            catalog.register(*action, ActionClass::Idempotent);
        }
        catalog
    }
}

impl ActionCatalog {
    pub fn empty() -> Self {
        Self {
            classes: HashMap::new(),
        }
    }

    pub fn register(&mut self, action: impl Into<String>, class: ActionClass) {
        self.classes.insert(action.into(), class);
    }

    pub fn with_action(mut self, action: impl Into<String>, class: ActionClass) -> Self {
        self.register(action, class);
        self
    }

    pub fn class_of(&self, action: &str) -> ActionClass {
        self.classes.get(action).copied().unwrap_or_default()
    }

    pub fn is_coalescable(&self, action: &str) -> bool {
        self.class_of(action) == ActionClass::Idempotent
    }
}

/// Cache key for `action` + `payload`, or `None` if the action is not coalescable.
///
/// Format: `{action}:{sha256 of canonical payload JSON, hex}`.
pub fn coalesce_key(catalog: &ActionCatalog, action: &str, payload: &Payload) -> Option<String> {
    if !catalog.is_coalescable(action) {
        return None;
    }
    let canonical = canonical_json(&serde_json::Value::Object(payload.clone()));
    let digest = Sha256::digest(canonical.as_bytes());
    Some(format!("{action}:{}", hex::encode(digest)))
}

/// Serialize with object keys sorted at every depth; array order is kept.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// In-flight completions keyed by coalesce key.
///
/// Entries disappear once their completion settles, so a caller arriving after
/// settlement always triggers a fresh dispatch.
#[derive(Default)]
pub struct CoalesceCache {
    entries: DashMap<String, Completion>,
}

impl CoalesceCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, key: &str) -> Option<Completion> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Register `completion` under `key` and watch it for settlement.
    ///
    /// Must be called within a tokio runtime.
    pub fn insert(self: &Arc<Self>, key: String, completion: Completion) {
        self.entries.insert(key.clone(), completion.clone());
        self.watch(key, completion);
    }

    /// Return the in-flight completion for `key`, or register the one built by
    /// `create`. The flag is `true` when an existing entry was joined.
    ///
    /// The key's shard stays locked while `create` runs, so concurrent callers
    /// with the same key observe exactly one creation. `create` must not touch
    /// this cache. Nothing is registered if it fails.
    pub fn get_or_try_insert_with<E>(
        self: &Arc<Self>,
        key: String,
        create: impl FnOnce() -> Result<Completion, E>,
    ) -> Result<(Completion, bool), E> {
        let completion = match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) => return Ok((entry.get().clone(), true)),
            Entry::Vacant(entry) => {
                let completion = create()?;
                entry.insert(completion.clone());
                completion
            }
        };
        self.watch(key, completion.clone());
        Ok((completion, false))
    }

    fn watch(self: &Arc<Self>, key: String, completion: Completion) {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let _ = completion.clone().await;
            if let Some(cache) = cache.upgrade() {
                cache.remove_if_current(&key, &completion);
            }
        });
    }

    /// Drop any entry served by `request_id`. Called when the request settles.
    pub fn evict_request(&self, request_id: &RequestId) {
        if self.is_empty() {
            return;
        }
        self.entries.retain(|key, completion| {
            let keep = completion.request_id() != *request_id;
            if !keep {
                tracing::debug!(%request_id, %key, "Evicting settled coalesced request");
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_if_current(&self, key: &str, completion: &Completion) {
        // A newer request may have taken the key since; leave it alone.
        if self
            .entries
            .remove_if(key, |_, current| current.same_request(completion))
            .is_some()
        {
            tracing::debug!(
                request_id = %completion.request_id(),
                %key,
                "Coalesced request settled"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion;
    use crate::error::BridgeError;
    use serde_json::json;
    use std::time::Duration;

    fn payload(value: serde_json::Value) -> Payload {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("payload must be an object, got {other}"),
        }
    }

    #[test]
    fn unknown_actions_are_mutating() {
        let catalog = ActionCatalog::default();
        assert_eq!(catalog.class_of("delete_assets"), ActionClass::Mutating);
        assert_eq!(catalog.class_of("list_assets"), ActionClass::Idempotent);
    }

    #[test]
    fn prefixes_do_not_imply_idempotence() {
        let catalog = ActionCatalog::default();
        // Starts like a read, but was never declared read-only.
        assert!(!catalog.is_coalescable("list_and_delete_assets"));
        assert!(!catalog.is_coalescable("get_or_create_material"));
    }

    #[test]
    fn catalog_override_can_mark_mutating() {
        let catalog = ActionCatalog::default().with_action("list_assets", ActionClass::Mutating);
        assert!(!catalog.is_coalescable("list_assets"));
    }

    #[test]
    fn key_is_empty_for_mutating_actions() {
        let catalog = ActionCatalog::default();
        let body = payload(json!({"path": "/Game"}));
        assert!(coalesce_key(&catalog, "delete_assets", &body).is_none());
    }

    #[test]
    fn key_ignores_object_key_order() {
        let catalog = ActionCatalog::default();
        let a = coalesce_key(
            &catalog,
            "list_assets",
            &payload(json!({"dir": "/Game", "recursive": true, "filter": {"b": 1, "a": 2}})),
        )
        .unwrap();

        let mut reordered = Payload::new();
        let mut filter = serde_json::Map::new();
        filter.insert("a".to_string(), json!(2));
        filter.insert("b".to_string(), json!(1));
        reordered.insert("filter".to_string(), serde_json::Value::Object(filter));
        reordered.insert("recursive".to_string(), json!(true));
        reordered.insert("dir".to_string(), json!("/Game"));
        let b = coalesce_key(&catalog, "list_assets", &reordered).unwrap();

        assert_eq!(a, b);
        assert!(a.starts_with("list_assets:"));
        assert_eq!(a.len(), "list_assets:".len() + 64);
    }

    #[test]
    fn key_distinguishes_payloads_and_actions() {
        let catalog = ActionCatalog::default();
        let game = payload(json!({"dir": "/Game"}));
        let engine = payload(json!({"dir": "/Engine"}));
        assert_ne!(
            coalesce_key(&catalog, "list_assets", &game),
            coalesce_key(&catalog, "list_assets", &engine)
        );
        assert_ne!(
            coalesce_key(&catalog, "list_assets", &game),
            coalesce_key(&catalog, "search_assets", &game)
        );
    }

    #[test]
    fn canonical_json_sorts_nested_keys_but_not_arrays() {
        let value = json!({"z": [3, {"y": 1, "x": 2}], "a": null});
        assert_eq!(canonical_json(&value), r#"{"a":null,"z":[3,{"x":2,"y":1}]}"#);
    }

    #[tokio::test]
    async fn cache_hit_returns_same_completion() {
        let cache = CoalesceCache::new();
        let id = RequestId::new();
        let (_settler, completion) = completion::channel(id);

        cache.insert("list_assets:abc".to_string(), completion);
        let hit = cache.get("list_assets:abc").unwrap();
        assert_eq!(hit.request_id(), id);
        assert!(cache.get("list_assets:def").is_none());
    }

    #[tokio::test]
    async fn settled_entry_is_removed() {
        let cache = CoalesceCache::new();
        let (settler, completion) = completion::channel(RequestId::new());
        cache.insert("k".to_string(), completion.clone());

        settler.fail(BridgeError::Cancelled);
        let _ = completion.await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while cache.get("k").is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("settled completion was not evicted");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn stale_watcher_does_not_evict_newer_entry() {
        let cache = CoalesceCache::new();
        let (old_settler, old) = completion::channel(RequestId::new());
        let (_new_settler, new) = completion::channel(RequestId::new());
        let new_id = new.request_id();

        cache.insert("k".to_string(), old.clone());
        cache.insert("k".to_string(), new);

        old_settler.fail(BridgeError::Cancelled);
        let _ = old.await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(cache.get("k").unwrap().request_id(), new_id);
    }

    #[tokio::test]
    async fn get_or_insert_joins_existing_entry() {
        let cache = CoalesceCache::new();
        let (_settler, completion) = completion::channel(RequestId::new());
        let id = completion.request_id();

        let (first, joined) = cache
            .get_or_try_insert_with("k".to_string(), || Ok::<_, BridgeError>(completion))
            .unwrap();
        assert!(!joined);
        assert_eq!(first.request_id(), id);

        let (second, joined) = cache
            .get_or_try_insert_with("k".to_string(), || -> Result<Completion, BridgeError> {
                panic!("existing entry must be joined")
            })
            .unwrap();
        assert!(joined);
        assert!(second.same_request(&first));
    }

    #[tokio::test]
    async fn failed_creation_registers_nothing() {
        let cache = CoalesceCache::new();
        let err = cache
            .get_or_try_insert_with("k".to_string(), || {
                Err::<Completion, _>(BridgeError::CapacityExceeded { limit: 1 })
            })
            .unwrap_err();
        assert_eq!(err, BridgeError::CapacityExceeded { limit: 1 });
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn evict_request_is_synchronous() {
        let cache = CoalesceCache::new();
        let (_settler, completion) = completion::channel(RequestId::new());
        let id = completion.request_id();
        cache.insert("k".to_string(), completion);
        assert_eq!(cache.len(), 1);

        cache.evict_request(&id);
        assert!(cache.get("k").is_none());
    }
}
