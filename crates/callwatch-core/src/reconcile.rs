use std::collections::HashSet;

use time::OffsetDateTime;

use crate::CallRecord;

/// Writes produced by diffing one snapshot against the locally open rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationPlan {
    /// Snapshot rows first, in feed order, then synthesized closures.
    pub writes: Vec<CallRecord>,
    pub snapshot_rows: usize,
    pub synthesized_closures: usize,
}

/// Diffs a full snapshot against the rows currently stored as open.
///
/// The feed only lists open incidents, so any locally open entity missing from
/// `snapshot` is closed as of `now`. Whether each write lands is decided later
/// by the store's recency rule; this function only proposes.
#[must_use]
pub fn plan_reconciliation(
    snapshot: &[CallRecord],
    locally_open: &[CallRecord],
    now: OffsetDateTime,
) -> ReconciliationPlan {
    let reported: HashSet<i64> = snapshot.iter().map(|record| record.entity_id).collect();

    let closures = locally_open
        .iter()
        .filter(|record| !record.is_closed() && !reported.contains(&record.entity_id))
        .map(|record| record.closed_at(now));

    let mut writes = Vec::with_capacity(snapshot.len() + locally_open.len());
    writes.extend(snapshot.iter().cloned().map(|mut record| {
        record.local_key = None;
        record
    }));
    let snapshot_rows = writes.len();
    writes.extend(closures);
    let synthesized_closures = writes.len() - snapshot_rows;

    ReconciliationPlan {
        writes,
        snapshot_rows,
        synthesized_closures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn open_record(entity_id: i64) -> CallRecord {
        let mut record = CallRecord::new(
            entity_id,
            "Enroute",
            datetime!(2024-03-01 10:00:00 UTC),
            datetime!(2024-03-01 09:00:00 UTC),
        );
        record.local_key = Some(entity_id * 10);
        record
    }

    #[test]
    fn missing_open_entities_are_closed_as_of_now() {
        let now = datetime!(2024-03-01 12:00:00 UTC);
        let plan = plan_reconciliation(&[open_record(2)], &[open_record(1), open_record(2)], now);

        assert_eq!(plan.snapshot_rows, 1);
        assert_eq!(plan.synthesized_closures, 1);
        assert_eq!(plan.writes.len(), 2);

        let closure = &plan.writes[1];
        assert_eq!(closure.entity_id, 1);
        assert!(closure.is_closed());
        assert_eq!(closure.status_timestamp, now);
        assert_eq!(closure.creation_timestamp, datetime!(2024-03-01 09:00:00 UTC));
    }

    #[test]
    fn snapshot_rows_come_first_without_local_keys() {
        let now = datetime!(2024-03-01 12:00:00 UTC);
        let plan = plan_reconciliation(&[open_record(7), open_record(3)], &[], now);
        let ids: Vec<i64> = plan.writes.iter().map(|record| record.entity_id).collect();
        assert_eq!(ids, vec![7, 3]);
        assert!(plan.writes.iter().all(|record| record.local_key.is_none()));
        assert_eq!(plan.synthesized_closures, 0);
    }

    #[test]
    fn already_closed_rows_are_not_closed_again() {
        let now = datetime!(2024-03-01 12:00:00 UTC);
        let closed = open_record(5).closed_at(datetime!(2024-03-01 11:00:00 UTC));
        let plan = plan_reconciliation(&[], &[closed], now);
        assert!(plan.writes.is_empty());
    }

    #[test]
    fn empty_snapshot_closes_everything_open() {
        let now = datetime!(2024-03-01 12:00:00 UTC);
        let plan = plan_reconciliation(&[], &[open_record(1), open_record(2), open_record(3)], now);
        assert_eq!(plan.synthesized_closures, 3);
        assert!(plan.writes.iter().all(CallRecord::is_closed));
    }
}
