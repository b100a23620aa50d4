//! Realtime key-value store abstraction.
//!
//! The voice subsystem only needs a handful of operations from its backing
//! store: overwrite a value, append under an ordered unique key, read,
//! remove a subtree, and watch the direct children of a path. Any backend
//! with those semantics can carry signaling and heartbeats.

mod memory;
mod path;
mod types;

pub use memory::MemoryStore;
pub use path::{normalize_path, PushKeys};
pub use types::{ChildEvent, KvStore, StoreError, StoreSubscription};
