use callwatch_core::{now_utc, plan_reconciliation, CallRecord, ReconcileReport, Result};
use time::OffsetDateTime;
use tracing::info;

use crate::{list_open_calls, upsert_in, SqliteCallStore, StorageContext};

impl SqliteCallStore {
    /// Merges one full snapshot of open incidents, closing whatever vanished.
    pub fn reconcile(&mut self, snapshot: &[CallRecord]) -> Result<ReconcileReport> {
        self.reconcile_at(snapshot, now_utc())
    }

    /// [`Self::reconcile`] with an explicit clock for synthesized closures.
    ///
    /// The open-row read, the synthesized closures and the upsert share one
    /// transaction, so a failure anywhere leaves the store as it was.
    pub fn reconcile_at(
        &mut self,
        snapshot: &[CallRecord],
        now: OffsetDateTime,
    ) -> Result<ReconcileReport> {
        let policy = self.reopen_policy;
        let tx = self
            .conn
            .transaction()
            .storage("failed to start reconcile transaction")?;

        let locally_open = list_open_calls(&tx)?;
        let plan = plan_reconciliation(snapshot, &locally_open, now);
        let upsert = upsert_in(&tx, &plan.writes, policy)?;

        tx.commit().storage("failed to commit reconcile transaction")?;

        let report =
            ReconcileReport::from_upsert(plan.snapshot_rows, plan.synthesized_closures, upsert);
        info!(
            snapshot_rows = report.snapshot_rows,
            synthesized_closures = report.synthesized_closures,
            inserted = report.inserted,
            updated = report.updated,
            discarded = report.discarded,
            "snapshot reconciled"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::{call, fixture_store, minutes_after_base, must};
    use callwatch_core::{CallRecord, HistoryOptions};
    use proptest::prelude::*;
    use time::OffsetDateTime;

    fn observable(records: Vec<CallRecord>) -> Vec<(i64, String, OffsetDateTime)> {
        records
            .into_iter()
            .map(|record| (record.entity_id, record.status, record.status_timestamp))
            .collect()
    }

    #[test]
    fn vanished_open_call_is_closed_at_reconcile_time() {
        let mut store = fixture_store();
        must(store.reconcile_at(&[call(1, "Enroute", 1)], minutes_after_base(2)));

        let now = minutes_after_base(10);
        let report = must(store.reconcile_at(&[], now));
        assert_eq!(report.synthesized_closures, 1);
        assert_eq!(report.updated, 1);

        let stored = match must(store.find_by_entity_id(1)) {
            Some(value) => value,
            None => panic!("expected call 1 to remain stored"),
        };
        assert!(stored.is_closed());
        assert!(stored.status_timestamp >= now);
        assert_eq!(stored.location, "1 Main St");
    }

    #[test]
    fn reconcile_with_wall_clock_closes_at_or_after_call_time() {
        let mut store = fixture_store();
        must(store.reconcile(&[call(1, "Enroute", 1)]));

        let before = callwatch_core::now_utc();
        must(store.reconcile(&[]));
        let stored = must(store.find_by_entity_id(1));
        assert!(stored.is_some_and(|record| record.is_closed() && record.status_timestamp >= before));
    }

    #[test]
    fn applying_same_snapshot_twice_is_a_no_op() {
        let mut store = fixture_store();
        let snapshot = vec![call(1, "Enroute", 1), call(2, "Dispatched", 2)];

        must(store.reconcile_at(&snapshot, minutes_after_base(3)));
        let once = observable(must(store.get_all()));

        let report = must(store.reconcile_at(&snapshot, minutes_after_base(4)));
        assert_eq!(report.discarded, 2);
        assert_eq!(report.inserted + report.updated, 0);
        assert_eq!(observable(must(store.get_all())), once);
    }

    #[test]
    fn stale_snapshot_does_not_clobber_newer_state() {
        let mut store = fixture_store();
        must(store.reconcile_at(&[call(1, "Onscene", 5)], minutes_after_base(6)));
        must(store.reconcile_at(&[call(1, "Enroute", 2)], minutes_after_base(7)));

        let stored = must(store.find_by_entity_id(1));
        assert_eq!(stored.map(|record| record.status), Some("Onscene".to_string()));
    }

    #[test]
    fn synthetic_closure_does_not_override_newer_remote_closure() {
        let mut store = fixture_store();
        must(store.reconcile_at(&[call(1, "Enroute", 1)], minutes_after_base(1)));
        // The feed itself reports the closure, stamped later than our clock.
        must(store.upsert_batch(&[call(1, "Closed", 30)]));

        let report = must(store.reconcile_at(&[], minutes_after_base(20)));
        assert_eq!(report.synthesized_closures, 0);
        let stored = must(store.find_by_entity_id(1));
        assert_eq!(stored.map(|record| record.status_timestamp), Some(minutes_after_base(30)));
    }

    #[test]
    fn history_is_empty_until_the_call_disappears() {
        let mut store = fixture_store();
        must(store.reconcile_at(&[call(1, "Enroute", 1)], minutes_after_base(1)));
        assert_eq!(must(store.get_all()).len(), 1);
        assert!(must(store.query_history(&HistoryOptions::default())).is_empty());

        must(store.reconcile_at(&[], minutes_after_base(2)));
        let all = must(store.get_all());
        assert_eq!(all.len(), 1);
        assert!(all[0].is_closed());

        let history = must(store.query_history(&HistoryOptions::default()));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].entity_id, 1);
    }

    #[test]
    fn reported_calls_stay_open_while_others_close() {
        let mut store = fixture_store();
        must(store.reconcile_at(&[call(1, "Enroute", 1), call(2, "Enroute", 1)], minutes_after_base(1)));
        let report = must(store.reconcile_at(&[call(2, "Onscene", 3)], minutes_after_base(4)));
        assert_eq!(report.synthesized_closures, 1);

        let open = must(store.list_open());
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].entity_id, 2);
        assert_eq!(open[0].status, "Onscene");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_reconcile_is_idempotent(
            entries in prop::collection::vec((1i64..20, 0i64..50, any::<bool>()), 0..30)
        ) {
            let snapshot: Vec<CallRecord> = entries
                .iter()
                .map(|(id, minute, closed)| call(*id, if *closed { "Closed" } else { "Enroute" }, *minute))
                .collect();

            let mut store = fixture_store();
            must(store.reconcile_at(&[call(99, "Enroute", 0)], minutes_after_base(0)));
            must(store.reconcile_at(&snapshot, minutes_after_base(60)));
            let once = observable(must(store.get_all()));

            must(store.reconcile_at(&snapshot, minutes_after_base(61)));
            prop_assert_eq!(observable(must(store.get_all())), once);
        }
    }
}
