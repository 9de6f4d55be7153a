//! Incremental merge of polled batches into the lifecycle store.

use std::sync::Arc;
use tracing::{debug, info};

use crate::alert::AlertScheduler;
use crate::cursor::Cursor;
use crate::lifecycle::{LifecycleStore, UpsertOutcome};
use crate::order::OrderRecord;
use crate::poller::Batch;

pub struct MergeEngine {
    store: Arc<LifecycleStore>,
    cursor: Arc<Cursor>,
    alerts: Arc<AlertScheduler>,
}

impl MergeEngine {
    pub fn new(
        store: Arc<LifecycleStore>,
        cursor: Arc<Cursor>,
        alerts: Arc<AlertScheduler>,
    ) -> Self {
        Self {
            store,
            cursor,
            alerts,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.get()
    }

    /// Apply a batch and return the records that are genuinely new.
    ///
    /// "New" is re-derived against the store rather than trusting the
    /// server's `after_id` filter. The cursor moves to the server's
    /// `latest_id` even when every record was a duplicate.
    pub fn merge(&self, batch: Batch) -> Vec<OrderRecord> {
        let Batch {
            mut records,
            latest_id,
        } = batch;

        records.sort_by_key(|r| r.id);
        records.dedup_by_key(|r| r.id);

        let highest_delivered = records.last().map(|r| r.id).unwrap_or(0);
        let mut fresh = Vec::new();
        let mut advanced = 0usize;

        for record in records {
            match self.store.upsert(record.clone()) {
                UpsertOutcome::Inserted => fresh.push(record),
                UpsertOutcome::Advanced(_) => advanced += 1,
                UpsertOutcome::Unchanged | UpsertOutcome::Ignored => {}
            }
        }

        let before = self.cursor.get();
        let after = self.cursor.advance(latest_id.max(highest_delivered));
        if after != before {
            debug!(from = before, to = after, "Cursor advanced");
        }

        if !fresh.is_empty() {
            info!(
                new_orders = fresh.len(),
                advanced = advanced,
                cursor = after,
                "Merged new orders"
            );
            self.alerts.ring();
        } else if advanced > 0 {
            info!(advanced = advanced, cursor = after, "Merged status updates");
        }

        fresh
    }
}
