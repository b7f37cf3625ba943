use std::collections::BTreeSet;

use crate::detection_store::DetectionRecord;

/// What one cycle's usage means for one user.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Transition {
    /// Normal and within limit.
    Stay,
    /// Normal -> Flagged.
    Flag(DetectionRecord),
    /// Still over limit on the same addresses, below the threshold.
    Escalate(DetectionRecord),
    /// Threshold reached. Carries the incremented record.
    Enforce(DetectionRecord),
    /// Flagged -> Normal.
    Recover,
}

/// Flagging needs more than `limit` current addresses. A flagged user stays
/// flagged only while more than `limit` of them overlap the recorded set.
pub(crate) fn evaluate(
    user: &str,
    record: Option<&DetectionRecord>,
    current: &BTreeSet<String>,
    limit: usize,
    threshold: u32,
) -> Transition {
    let Some(record) = record else {
        return if current.len() > limit {
            Transition::Flag(DetectionRecord::first(user, current.clone()))
        } else {
            Transition::Stay
        };
    };

    let matching = current.intersection(&record.ips).count();
    if matching <= limit {
        return Transition::Recover;
    }

    let count = record.out_of_limit_count.saturating_add(1);
    let updated = DetectionRecord {
        user: user.to_owned(),
        ips: current.clone(),
        out_of_limit_count: count,
    };

    if count >= threshold {
        Transition::Enforce(updated)
    } else {
        Transition::Escalate(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ips(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|ip| (*ip).to_owned()).collect()
    }

    fn flagged(values: &[&str], count: u32) -> DetectionRecord {
        DetectionRecord {
            user: "alice".to_owned(),
            ips: ips(values),
            out_of_limit_count: count,
        }
    }

    #[test]
    fn normal_user_over_limit_is_flagged() {
        let transition = evaluate("alice", None, &ips(&["A", "B", "C"]), 2, 3);

        assert_eq!(
            transition,
            Transition::Flag(DetectionRecord {
                user: "alice".to_owned(),
                ips: ips(&["A", "B", "C"]),
                out_of_limit_count: 1,
            })
        );
    }

    #[test]
    fn normal_user_at_limit_stays() {
        assert_eq!(evaluate("alice", None, &ips(&["A", "B"]), 2, 3), Transition::Stay);
    }

    #[test]
    fn rotating_addresses_recover_even_when_over_limit() {
        let record = flagged(&["A", "B", "C"], 2);

        let transition = evaluate("alice", Some(&record), &ips(&["A", "B", "D"]), 2, 3);

        assert_eq!(transition, Transition::Recover);
    }

    #[test]
    fn sustained_overlap_reaching_threshold_enforces() {
        let record = flagged(&["A", "B", "C"], 2);

        let transition = evaluate("alice", Some(&record), &ips(&["A", "B", "C", "D"]), 2, 3);

        assert_eq!(
            transition,
            Transition::Enforce(flagged(&["A", "B", "C", "D"], 3))
        );
    }

    #[test]
    fn sustained_overlap_below_threshold_escalates() {
        let record = flagged(&["A", "B", "C"], 1);

        let transition = evaluate("alice", Some(&record), &ips(&["A", "B", "C"]), 2, 3);

        assert_eq!(transition, Transition::Escalate(flagged(&["A", "B", "C"], 2)));
    }

    #[test]
    fn threshold_of_one_enforces_on_first_repeat() {
        let record = flagged(&["A", "B", "C"], 1);

        let transition = evaluate("alice", Some(&record), &ips(&["A", "B", "C"]), 2, 1);

        assert!(matches!(transition, Transition::Enforce(_)));
    }

    #[test]
    fn saturated_count_still_enforces() {
        let record = flagged(&["A", "B", "C"], u32::MAX);

        let transition = evaluate("alice", Some(&record), &ips(&["A", "B", "C"]), 2, 3);

        assert_eq!(transition, Transition::Enforce(flagged(&["A", "B", "C"], u32::MAX)));
    }
}
