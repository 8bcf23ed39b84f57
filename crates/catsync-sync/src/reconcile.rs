use std::collections::BTreeSet;
use std::sync::Arc;

use catsync_core::CatalogRecord;
use catsync_store::CatalogStore;
use serde::Serialize;
use tracing::{info, warn};

use crate::SyncError;

pub const SAFETY_THRESHOLD_REASON: &str = "diff exceeds safety threshold";

/// Outcome of diffing the downstream key inventory against a fresh extraction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PurgePlan {
    pub to_delete: BTreeSet<String>,
    pub aborted: bool,
    pub reason: Option<String>,
    pub diff_percent: f64,
}

/// How many extracted records are new to the downstream store versus already
/// present there. Both kinds are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub new: usize,
    pub existing: usize,
}

pub struct Reconciler {
    store: Arc<dyn CatalogStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    pub async fn current_downstream_keys(&self) -> Result<BTreeSet<String>, SyncError> {
        let keys = self
            .store
            .list_codes()
            .await
            .map_err(|err| SyncError::SinkUnavailable(err.to_string()))?;
        info!(keys = keys.len(), "downstream key inventory read");
        Ok(keys)
    }
}

pub fn classify(existing: &BTreeSet<String>, records: &[CatalogRecord]) -> Classification {
    let known = records
        .iter()
        .filter(|record| existing.contains(&record.code))
        .count();
    Classification {
        new: records.len() - known,
        existing: known,
    }
}

/// Decide which downstream keys may be deleted.
///
/// The circuit breaker only fires when the fresh extraction did not shrink in
/// count yet would still remove more than `max_diff_percent` of the existing
/// keys. That shape means the key sets disagree wholesale (for example a
/// different or corrupted upstream), so nothing is deleted.
pub fn plan_purge(
    existing: &BTreeSet<String>,
    new: &BTreeSet<String>,
    max_diff_percent: f64,
) -> PurgePlan {
    let to_delete = existing.difference(new).cloned().collect::<BTreeSet<_>>();
    if to_delete.is_empty() {
        return PurgePlan {
            to_delete,
            aborted: false,
            reason: None,
            diff_percent: 0.0,
        };
    }

    let diff_percent = to_delete.len() as f64 / existing.len().max(1) as f64 * 100.0;
    if diff_percent > max_diff_percent && new.len() >= existing.len() {
        warn!(
            stale = to_delete.len(),
            existing = existing.len(),
            fresh = new.len(),
            diff_percent,
            max_diff_percent,
            "purge refused by safety threshold"
        );
        return PurgePlan {
            to_delete: BTreeSet::new(),
            aborted: true,
            reason: Some(SAFETY_THRESHOLD_REASON.to_string()),
            diff_percent,
        };
    }

    PurgePlan {
        to_delete,
        aborted: false,
        reason: None,
        diff_percent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{record, ScriptedStore};

    fn keys(codes: &[&str]) -> BTreeSet<String> {
        codes.iter().map(|c| c.to_string()).collect()
    }

    fn numbered(range: std::ops::Range<usize>) -> BTreeSet<String> {
        range.map(|i| format!("P{i:04}")).collect()
    }

    #[test]
    fn nothing_stale_means_nothing_to_delete() {
        let plan = plan_purge(&keys(&["A", "B"]), &keys(&["A", "B", "C"]), 5.0);
        assert!(!plan.aborted);
        assert!(plan.to_delete.is_empty());
        assert_eq!(plan.reason, None);
    }

    #[test]
    fn shrinking_catalog_is_purged_even_above_threshold() {
        let plan = plan_purge(&keys(&["A", "B", "C", "D"]), &keys(&["A", "B"]), 5.0);
        assert!(!plan.aborted);
        assert_eq!(plan.to_delete, keys(&["C", "D"]));
        assert_eq!(plan.diff_percent, 50.0);
    }

    #[test]
    fn one_missing_code_out_of_a_hundred_never_aborts() {
        let existing = numbered(0..100);
        let fresh = numbered(0..99);
        for threshold in [0.0, 0.5, 5.0, 100.0] {
            let plan = plan_purge(&existing, &fresh, threshold);
            assert!(!plan.aborted, "threshold {threshold}");
            assert_eq!(plan.to_delete, keys(&["P0099"]));
        }
    }

    #[test]
    fn wholesale_key_disagreement_trips_the_breaker() {
        let existing = numbered(0..100);
        // 50 overlapping codes plus 51 brand new ones
        let fresh = numbered(50..151);
        assert_eq!(fresh.len(), 101);

        let plan = plan_purge(&existing, &fresh, 5.0);
        assert!(plan.aborted);
        assert!(plan.to_delete.is_empty());
        assert_eq!(plan.reason.as_deref(), Some(SAFETY_THRESHOLD_REASON));
        assert_eq!(plan.diff_percent, 50.0);
    }

    #[test]
    fn small_churn_with_growth_is_allowed() {
        let existing = numbered(0..100);
        let fresh = numbered(3..110);
        let plan = plan_purge(&existing, &fresh, 5.0);
        assert!(!plan.aborted);
        assert_eq!(plan.to_delete.len(), 3);
    }

    #[test]
    fn empty_downstream_is_safe() {
        let plan = plan_purge(&BTreeSet::new(), &keys(&["A"]), 5.0);
        assert!(!plan.aborted);
        assert!(plan.to_delete.is_empty());
    }

    #[test]
    fn classify_counts_new_and_known_codes() {
        let existing = keys(&["A", "B"]);
        let records = vec![record("A"), record("C"), record("D")];
        assert_eq!(
            classify(&existing, &records),
            Classification { new: 2, existing: 1 }
        );
    }

    #[tokio::test]
    async fn inventory_read_failure_is_sink_unavailable() {
        let store = ScriptedStore::new();
        store.fail_list();
        let reconciler = Reconciler::new(Arc::new(store));
        let err = reconciler.current_downstream_keys().await.unwrap_err();
        assert!(matches!(err, SyncError::SinkUnavailable(_)));
    }
}
