//! Initiator election.

use codecollab_common::ParticipantId;

/// Whether `local` opens the link toward `remote`.
///
/// The byte-wise greater id initiates, so for any distinct pair exactly
/// one side does. Nobody initiates toward themselves.
pub fn should_initiate(local: &ParticipantId, remote: &ParticipantId) -> bool {
    local.as_str().as_bytes() > remote.as_str().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_side_initiates() {
        let ids = ["amy", "bob", "Bob", "bob2", "b", "zed", "10", "9", "ümit"];
        for a in ids {
            for b in ids {
                let (a, b) = (ParticipantId::from(a), ParticipantId::from(b));
                let forward = should_initiate(&a, &b);
                let backward = should_initiate(&b, &a);
                if a == b {
                    assert!(!forward && !backward);
                } else {
                    assert!(forward ^ backward, "{a} vs {b}");
                }
            }
        }
    }

    #[test]
    fn comparison_is_bytewise() {
        // Not numeric, not case-folded.
        assert!(should_initiate(&"9".into(), &"10".into()));
        assert!(should_initiate(&"bob".into(), &"Bob".into()));
    }
}
