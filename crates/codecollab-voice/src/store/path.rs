//! Path normalization and ordered push keys.

use super::types::StoreError;

/// Characters a path segment may not contain.
const FORBIDDEN: &[char] = &['.', '#', '$', '[', ']'];

/// Trim surrounding slashes and reject empty or malformed segments.
pub fn normalize_path(path: &str) -> Result<String, StoreError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment.contains(FORBIDDEN) {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
    }
    Ok(trimmed.to_string())
}

/// Parent path and last segment of a normalized path.
pub(crate) fn split_parent(path: &str) -> (Option<&str>, &str) {
    match path.rsplit_once('/') {
        Some((parent, key)) => (Some(parent), key),
        None => (None, path),
    }
}

/// Generator for append keys that sort in creation order.
///
/// Keys are the millisecond clock followed by a per-millisecond sequence,
/// both zero padded, so lexicographic order is append order even when the
/// wall clock stalls or steps backwards.
#[derive(Debug, Default)]
pub struct PushKeys {
    last_millis: i64,
    seq: u32,
}

impl PushKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_key(&mut self, now_millis: i64) -> String {
        if now_millis > self.last_millis {
            self.last_millis = now_millis;
            self.seq = 0;
        } else {
            self.seq += 1;
        }
        format!("{:013}-{:06}", self.last_millis, self.seq)
    }
}
