//! Arbitration: the accept/reject decision for a single proposal.
//!
//! Pure function of the candidate, the key's policy, and what is currently
//! stored. No locking or I/O happens here; the store calls it under the
//! per-key lock.

use chrono::{DateTime, Utc};

use voxbus_core::{Decision, Policy, Proposal, Rejection, StateEntry};

/// Decide whether `candidate` replaces `current`.
///
/// `last_version` is the highest version the key has ever had (a cleared key
/// has no `current` entry but keeps its counter). `arrival` stamps proposals
/// that carry no timestamp of their own.
pub fn evaluate(
    candidate: &Proposal,
    policy: Option<&Policy>,
    current: Option<&StateEntry>,
    last_version: u64,
    arrival: DateTime<Utc>,
) -> Decision {
    let Some(policy) = policy else {
        return reject(Rejection::UnknownKey);
    };
    if !policy.allows(candidate.source) {
        return reject(Rejection::Unauthorized);
    }
    if candidate.priority < policy.min_priority() {
        return reject(Rejection::PriorityTooLow);
    }
    if !policy.permits_value(&candidate.value) {
        return reject(Rejection::ValueNotAllowed);
    }

    let timestamp = candidate.timestamp.unwrap_or(arrival);

    if let Some(current) = current {
        if candidate.priority < current.priority {
            return reject(Rejection::Superseded);
        }
        // Equal priority: last writer wins by timestamp.
        if candidate.priority == current.priority && timestamp < current.timestamp {
            return reject(Rejection::Superseded);
        }
    }

    Decision::Accepted {
        entry: StateEntry {
            key: candidate.key.clone(),
            value: candidate.value.clone(),
            source: candidate.source,
            priority: candidate.priority,
            timestamp,
            version: last_version + 1,
        },
    }
}

fn reject(reason: Rejection) -> Decision {
    Decision::Rejected { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use voxbus_core::SourceId;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn accepted(decision: Decision) -> StateEntry {
        match decision {
            Decision::Accepted { entry } => entry,
            Decision::Rejected { reason } => panic!("expected accept, got {reason}"),
        }
    }

    #[test]
    fn test_unknown_key() {
        let p = Proposal::new("nope", true, SourceId::Gui, 1);
        let d = evaluate(&p, None, None, 0, at(0));
        assert_eq!(d.rejection(), Some(Rejection::UnknownKey));
    }

    #[test]
    fn test_unauthorized_regardless_of_priority() {
        let policy = Policy::new([SourceId::Tts], 2);
        let p = Proposal::new("ai_speaking", "off", SourceId::Gui, 1000);
        let d = evaluate(&p, Some(&policy), None, 0, at(0));
        assert_eq!(d.rejection(), Some(Rejection::Unauthorized));
    }

    #[test]
    fn test_priority_floor() {
        let policy = Policy::new([SourceId::Stt], 10);
        let p = Proposal::new("interrupt_ai_speech", true, SourceId::Stt, 9);
        let d = evaluate(&p, Some(&policy), None, 0, at(0));
        assert_eq!(d.rejection(), Some(Rejection::PriorityTooLow));
    }

    #[test]
    fn test_allow_if_guard() {
        let policy = Policy::new([SourceId::Gui], 0).with_allow_if(json!("True"));
        let p = Proposal::new("user_wants_to_talk", "False", SourceId::Gui, 1);
        let d = evaluate(&p, Some(&policy), None, 0, at(0));
        assert_eq!(d.rejection(), Some(Rejection::ValueNotAllowed));
    }

    #[test]
    fn test_first_write_gets_version_one() {
        let policy = Policy::new([SourceId::Tts], 2);
        let p = Proposal::new("ai_speaking", "on", SourceId::Tts, 2);
        let entry = accepted(evaluate(&p, Some(&policy), None, 0, at(50)));
        assert_eq!(entry.version, 1);
        assert_eq!(entry.timestamp, at(50));
        assert_eq!(entry.value, json!("on"));
    }

    #[test]
    fn test_lower_priority_superseded() {
        let policy = Policy::new([SourceId::Stt, SourceId::Llm], 0);
        let current = accepted(evaluate(
            &Proposal::new("user_wants_to_talk", "False", SourceId::Stt, 30),
            Some(&policy),
            None,
            0,
            at(0),
        ));
        let d = evaluate(
            &Proposal::new("user_wants_to_talk", "True", SourceId::Llm, 10),
            Some(&policy),
            Some(&current),
            current.version,
            at(10),
        );
        assert_eq!(d.rejection(), Some(Rejection::Superseded));
    }

    #[test]
    fn test_equal_priority_tie_break_by_timestamp() {
        let policy = Policy::new([SourceId::Llm, SourceId::Tts], 0);
        let later = accepted(evaluate(
            &Proposal::new("tts_ready", true, SourceId::Tts, 5).at(at(105)),
            Some(&policy),
            None,
            0,
            at(200),
        ));

        let earlier = Proposal::new("tts_ready", true, SourceId::Llm, 5).at(at(100));
        let d = evaluate(&earlier, Some(&policy), Some(&later), later.version, at(201));
        assert_eq!(d.rejection(), Some(Rejection::Superseded));

        let same_time = Proposal::new("tts_ready", false, SourceId::Llm, 5).at(at(105));
        let entry = accepted(evaluate(&same_time, Some(&policy), Some(&later), later.version, at(202)));
        assert_eq!(entry.version, 2);
        assert_eq!(entry.source, SourceId::Llm);
    }

    #[test]
    fn test_higher_priority_overrides_newer_entry() {
        let policy = Policy::new([SourceId::Stt, SourceId::Tts], 0);
        let current = accepted(evaluate(
            &Proposal::new("human_speaking", "True", SourceId::Tts, 10).at(at(500)),
            Some(&policy),
            None,
            0,
            at(500),
        ));
        let entry = accepted(evaluate(
            &Proposal::new("human_speaking", "False", SourceId::Stt, 20).at(at(1)),
            Some(&policy),
            Some(&current),
            current.version,
            at(501),
        ));
        assert_eq!(entry.version, 2);
    }

    #[test]
    fn test_cleared_key_continues_version() {
        let policy = Policy::new([SourceId::Llm], 0);
        let p = Proposal::new("ai_thinking", true, SourceId::Llm, 0);
        let entry = accepted(evaluate(&p, Some(&policy), None, 7, at(0)));
        assert_eq!(entry.version, 8);
    }
}
