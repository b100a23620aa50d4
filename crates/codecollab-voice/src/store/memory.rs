//! In-process store backed by an ordered map of leaf paths.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use codecollab_common::now_millis;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use super::path::{normalize_path, split_parent, PushKeys};
use super::types::{ChildEvent, KvStore, StoreError, StoreSubscription};

/// A watcher of the direct children of `path`.
struct Watcher {
    path: String,
    tx: mpsc::UnboundedSender<ChildEvent>,
}

#[derive(Default)]
struct Inner {
    /// Leaf values keyed by full normalized path.
    entries: BTreeMap<String, Value>,
    watchers: Vec<Watcher>,
    keys: PushKeys,
}

impl Inner {
    /// Paths strictly below `path`, in key order.
    fn descendants(&self, path: &str) -> Vec<String> {
        // '0' is the byte after '/', so this range is exactly "path/..."
        let start = format!("{path}/");
        let end = format!("{path}0");
        self.entries
            .range(start..end)
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn emit(&mut self, leaf: &str, event: ChildEvent) {
        let (parent, _) = split_parent(leaf);
        let Some(parent) = parent else {
            return;
        };
        self.watchers.retain(|w| {
            if w.path != parent {
                return !w.tx.is_closed();
            }
            w.tx.send(event.clone()).is_ok()
        });
    }

    fn remove_leaf(&mut self, leaf: &str) {
        if self.entries.remove(leaf).is_some() {
            let (_, key) = split_parent(leaf);
            let event = ChildEvent::Removed {
                key: key.to_string(),
            };
            self.emit(leaf, event);
        }
    }

    fn remove_subtree(&mut self, path: &str) {
        for leaf in self.descendants(path) {
            self.remove_leaf(&leaf);
        }
        self.remove_leaf(path);
    }

    /// A leaf cannot have children; writing below one replaces it.
    fn remove_leaf_ancestors(&mut self, path: &str) {
        let mut cursor = path;
        while let (Some(parent), _) = split_parent(cursor) {
            if self.entries.contains_key(parent) {
                let parent = parent.to_string();
                self.remove_leaf(&parent);
                break;
            }
            cursor = parent;
        }
    }

    fn insert(&mut self, path: String, value: Value) {
        self.remove_leaf_ancestors(&path);
        for leaf in self.descendants(&path) {
            self.remove_leaf(&leaf);
        }
        let (_, key) = split_parent(&path);
        let key = key.to_string();
        let existed = self.entries.insert(path.clone(), value.clone()).is_some();
        let event = if existed {
            ChildEvent::Changed { key, value }
        } else {
            ChildEvent::Added { key, value }
        };
        self.emit(&path, event);
    }

    fn assemble(&self, path: &str) -> Option<Value> {
        if let Some(value) = self.entries.get(path) {
            return Some(value.clone());
        }
        let leaves = self.descendants(path);
        if leaves.is_empty() {
            return None;
        }
        let mut root = Map::new();
        for leaf in leaves {
            let rest = &leaf[path.len() + 1..];
            let mut node = &mut root;
            let mut segments = rest.split('/').peekable();
            while let Some(segment) = segments.next() {
                if segments.peek().is_none() {
                    node.insert(segment.to_string(), self.entries[&leaf].clone());
                    break;
                }
                let child = node
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !child.is_object() {
                    *child = Value::Object(Map::new());
                }
                node = match child {
                    Value::Object(map) => map,
                    _ => unreachable!("child was just made an object"),
                };
            }
        }
        Some(Value::Object(root))
    }
}

/// Store that lives entirely in this process.
///
/// Cloning yields another handle to the same data, so a single instance
/// can back every participant in tests or be served by the relay.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaf values currently stored.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of live child watchers.
    pub async fn watcher_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.len()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let path = normalize_path(path)?;
        let mut inner = self.inner.lock().await;
        if value.is_null() {
            inner.remove_subtree(&path);
        } else {
            inner.insert(path, value);
        }
        Ok(())
    }

    async fn append(&self, prefix: &str, value: Value) -> Result<String, StoreError> {
        let prefix = normalize_path(prefix)?;
        let mut inner = self.inner.lock().await;
        let key = inner.keys.next_key(now_millis());
        trace!(prefix = %prefix, key = %key, "append");
        inner.insert(format!("{prefix}/{key}"), value);
        Ok(key)
    }

    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let path = normalize_path(path)?;
        Ok(self.inner.lock().await.assemble(&path))
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let path = normalize_path(path)?;
        self.inner.lock().await.remove_subtree(&path);
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<StoreSubscription, StoreError> {
        let path = normalize_path(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;

        let prefix_len = path.len() + 1;
        for leaf in inner.descendants(&path) {
            let key = &leaf[prefix_len..];
            if key.contains('/') {
                continue;
            }
            let _ = tx.send(ChildEvent::Added {
                key: key.to_string(),
                value: inner.entries[&leaf].clone(),
            });
        }

        inner.watchers.push(Watcher {
            path: path.clone(),
            tx,
        });
        Ok(StoreSubscription::new(path, rx))
    }
}
