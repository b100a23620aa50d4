//! Who is speaking right now.

use std::collections::{BTreeMap, HashSet};

use codecollab_common::ParticipantId;

/// Participant id to speaking flag.
///
/// Samples are collected per frame and committed once; only entries whose
/// value actually changed are reported back.
#[derive(Debug, Default, Clone)]
pub struct SpeakingState {
    entries: BTreeMap<ParticipantId, bool>,
}

impl SpeakingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one frame of samples and return the changes.
    ///
    /// A participant seen for the first time counts as a change only when
    /// speaking.
    pub fn commit<I>(&mut self, samples: I) -> Vec<(ParticipantId, bool)>
    where
        I: IntoIterator<Item = (ParticipantId, bool)>,
    {
        let mut changes = Vec::new();
        for (id, speaking) in samples {
            let previous = self.entries.insert(id.clone(), speaking);
            if previous.unwrap_or(false) != speaking {
                changes.push((id, speaking));
            }
        }
        changes
    }

    pub fn get(&self, id: &ParticipantId) -> Option<bool> {
        self.entries.get(id).copied()
    }

    /// Drop `id`, returning whether it was speaking.
    pub fn remove(&mut self, id: &ParticipantId) -> Option<bool> {
        self.entries.remove(id)
    }

    /// Keep only the listed participants.
    pub fn retain_only(&mut self, keep: &HashSet<ParticipantId>) {
        self.entries.retain(|id, _| keep.contains(id));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn snapshot(&self) -> BTreeMap<ParticipantId, bool> {
        self.entries.clone()
    }
}
