//! Feed poller: one sequential, cancellable loop against the order feed.
//!
//! Each cycle fetches everything after the cursor, hands the batch to the
//! merge engine and picks the next delay from a fixed table keyed by the
//! cycle's outcome. Failures never leave the cycle; they only pick a longer
//! delay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PollingConfig;
use crate::merge::MergeEngine;
use crate::order::OrderRecord;

// ---------------------------------------------------------------------------
// Feed contract
// ---------------------------------------------------------------------------

/// One poll response: candidate records plus the server's latest known id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub records: Vec<OrderRecord>,
    pub latest_id: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PollError {
    #[error("order feed timed out")]
    Timeout,
    #[error("{0}")]
    Connect(String),
    #[error("order feed returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("order feed returned an unreadable body: {0}")]
    Decode(String),
    #[error("order feed response had an unexpected shape: {0}")]
    Malformed(String),
    #[error("order feed request failed: {0}")]
    Transport(String),
}

impl PollError {
    /// A well-formed exchange whose payload was not a batch. Treated as "no
    /// new data" rather than as an outage.
    pub fn is_malformed(&self) -> bool {
        matches!(self, PollError::Malformed(_))
    }
}

#[async_trait]
pub trait OrderFeed: Send + Sync {
    /// Fetch records with `id > cursor`.
    async fn poll(&self, cursor: u64) -> Result<Batch, PollError>;
}

/// Parse a raw feed body. An empty body or a JSON value that is not a batch
/// object is `Malformed`; text that is not JSON at all is `Decode`.
pub fn parse_batch(body: &str) -> Result<Batch, PollError> {
    if body.trim().is_empty() {
        return Err(PollError::Malformed("empty body".into()));
    }
    let value: Value =
        serde_json::from_str(body).map_err(|e| PollError::Decode(e.to_string()))?;
    parse_batch_value(&value)
}

pub fn parse_batch_value(value: &Value) -> Result<Batch, PollError> {
    let object = value
        .as_object()
        .ok_or_else(|| PollError::Malformed(format!("expected an object, got {}", kind(value))))?;
    let orders = object
        .get("orders")
        .ok_or_else(|| PollError::Malformed("missing `orders`".into()))?
        .as_array()
        .ok_or_else(|| PollError::Malformed("`orders` is not an array".into()))?;

    let mut records = Vec::with_capacity(orders.len());
    // Highest id seen among records that could not be decoded, so the cursor
    // still moves past them when the server omits `latest_id`.
    let mut skipped_max = 0u64;
    for raw in orders {
        match OrderRecord::from_value(raw) {
            Ok(record) => records.push(record),
            Err(error) => {
                if let Some(id) = raw.get("id").and_then(numeric_id) {
                    skipped_max = skipped_max.max(id);
                }
                warn!(
                    order_id = ?raw.get("id"),
                    error = %error,
                    "Skipping unreadable order in feed batch"
                );
            }
        }
    }

    let latest_id = object
        .get("latest_id")
        .or_else(|| object.get("latestId"))
        .and_then(numeric_id)
        .unwrap_or_else(|| {
            records
                .iter()
                .map(|r| r.id)
                .max()
                .unwrap_or(0)
                .max(skipped_max)
        });

    Ok(Batch { records, latest_id })
}

fn numeric_id(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str()?.trim().parse().ok())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Delay table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PollOutcome {
    Delivered { records: usize, new: usize },
    Malformed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelaySchedule {
    pub warmup: Duration,
    pub steady: Duration,
    pub empty_response: Duration,
    pub error: Duration,
}

impl DelaySchedule {
    pub fn next_delay(&self, outcome: &PollOutcome) -> Duration {
        match outcome {
            PollOutcome::Delivered { .. } => self.steady,
            PollOutcome::Malformed => self.empty_response,
            PollOutcome::Failed => self.error,
        }
    }
}

impl From<&PollingConfig> for DelaySchedule {
    fn from(config: &PollingConfig) -> Self {
        Self {
            warmup: Duration::from_millis(config.warmup_ms),
            steady: Duration::from_millis(config.steady_ms),
            empty_response: Duration::from_millis(config.empty_response_ms),
            error: Duration::from_millis(config.error_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollStatus {
    pub cycles: u64,
    pub last_outcome: Option<PollOutcome>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

pub struct FeedPoller {
    feed: Arc<dyn OrderFeed>,
    merge: Arc<MergeEngine>,
    schedule: DelaySchedule,
    timeout: Duration,
    /// Held for the whole of a cycle so scheduled and forced polls never
    /// overlap.
    in_flight: tokio::sync::Mutex<()>,
    status: Mutex<PollStatus>,
}

impl FeedPoller {
    pub fn new(
        feed: Arc<dyn OrderFeed>,
        merge: Arc<MergeEngine>,
        schedule: DelaySchedule,
        timeout: Duration,
    ) -> Self {
        Self {
            feed,
            merge,
            schedule,
            timeout,
            in_flight: tokio::sync::Mutex::new(()),
            status: Mutex::new(PollStatus::default()),
        }
    }

    pub fn status(&self) -> PollStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run exactly one poll-merge cycle.
    pub async fn poll_cycle(&self) -> PollOutcome {
        let _flight = self.in_flight.lock().await;
        let cursor = self.merge.cursor();

        let result = match tokio::time::timeout(self.timeout, self.feed.poll(cursor)).await {
            Ok(result) => result,
            Err(_) => Err(PollError::Timeout),
        };

        match result {
            Ok(batch) => {
                let records = batch.records.len();
                let new = self.merge.merge(batch).len();
                debug!(cursor, records, new, "Poll cycle delivered");
                self.record_success(PollOutcome::Delivered { records, new })
            }
            Err(error) if error.is_malformed() => {
                self.record_failure(PollOutcome::Malformed, &error)
            }
            Err(error) => self.record_failure(PollOutcome::Failed, &error),
        }
    }

    fn record_success(&self, outcome: PollOutcome) -> PollOutcome {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if status.consecutive_failures > 0 {
            info!(
                failed_cycles = status.consecutive_failures,
                "Order feed reachable again"
            );
        }
        status.cycles += 1;
        status.last_outcome = Some(outcome);
        status.last_success_at = Some(Utc::now());
        status.consecutive_failures = 0;
        status.last_error = None;
        outcome
    }

    fn record_failure(&self, outcome: PollOutcome, error: &PollError) -> PollOutcome {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.cycles += 1;
        status.last_outcome = Some(outcome);
        status.last_error = Some(error.to_string());
        if outcome == PollOutcome::Malformed {
            debug!(error = %error, "Order feed returned no usable batch");
            return outcome;
        }
        status.consecutive_failures += 1;
        // Warn once per outage; the rest of the outage goes to debug.
        if status.consecutive_failures == 1 {
            warn!(error = %error, "Order feed poll failed; backing off");
        } else {
            debug!(
                error = %error,
                consecutive_failures = status.consecutive_failures,
                "Order feed still failing"
            );
        }
        outcome
    }

    /// Poll until `cancel` fires. The first poll waits out the warm-up delay;
    /// later ones wait for the delay chosen by the previous outcome.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            warmup_ms = self.schedule.warmup.as_millis() as u64,
            steady_ms = self.schedule.steady.as_millis() as u64,
            "Order feed poller started"
        );
        let mut delay = self.schedule.warmup;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = self.poll_cycle() => outcome,
            };
            delay = self.schedule.next_delay(&outcome);
        }
        info!("Order feed poller stopped");
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::alert::tests::recording_scheduler;
    use crate::cursor::Cursor;
    use crate::lifecycle::tests::record;
    use crate::lifecycle::LifecycleStore;
    use crate::order::OrderStatus;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Feed that replays scripted replies and records each cursor it was
    /// asked for. Once the script runs out it returns empty batches.
    pub(crate) struct ScriptedFeed {
        replies: Mutex<VecDeque<Result<Batch, PollError>>>,
        pub(crate) cursors: Mutex<Vec<u64>>,
        active: AtomicUsize,
        pub(crate) max_active: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedFeed {
        pub(crate) fn new(replies: Vec<Result<Batch, PollError>>) -> Self {
            Self::with_delay(replies, Duration::ZERO)
        }

        pub(crate) fn with_delay(replies: Vec<Result<Batch, PollError>>, delay: Duration) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                cursors: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                delay,
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.cursors.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl OrderFeed for ScriptedFeed {
        async fn poll(&self, cursor: u64) -> Result<Batch, PollError> {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            self.cursors.lock().unwrap().push(cursor);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let reply = self.replies.lock().unwrap().pop_front();
            self.active.fetch_sub(1, Ordering::SeqCst);
            reply.unwrap_or_else(|| {
                Ok(Batch {
                    records: Vec::new(),
                    latest_id: 0,
                })
            })
        }
    }

    fn fast_schedule() -> DelaySchedule {
        DelaySchedule {
            warmup: Duration::from_millis(1),
            steady: Duration::from_millis(2),
            empty_response: Duration::from_millis(3),
            error: Duration::from_millis(4),
        }
    }

    fn poller(feed: Arc<ScriptedFeed>) -> (Arc<FeedPoller>, Arc<LifecycleStore>, Arc<Cursor>) {
        let store = Arc::new(LifecycleStore::new());
        let cursor = Arc::new(Cursor::new(0));
        let (alerts, _sink) = recording_scheduler();
        let merge = Arc::new(MergeEngine::new(store.clone(), cursor.clone(), alerts));
        let poller = Arc::new(FeedPoller::new(
            feed,
            merge,
            fast_schedule(),
            Duration::from_millis(200),
        ));
        (poller, store, cursor)
    }

    #[test]
    fn test_delay_table_is_pure_function_of_outcome() {
        let schedule = DelaySchedule::from(&PollingConfig::default());
        assert_eq!(
            schedule.next_delay(&PollOutcome::Delivered { records: 0, new: 0 }),
            Duration::from_secs(5)
        );
        assert_eq!(
            schedule.next_delay(&PollOutcome::Malformed),
            Duration::from_secs(6)
        );
        assert_eq!(
            schedule.next_delay(&PollOutcome::Failed),
            Duration::from_secs(15)
        );
        assert_eq!(schedule.warmup, Duration::from_secs(1));
    }

    #[test]
    fn test_parse_batch_shapes() {
        let batch = parse_batch(
            r#"{ "orders": [ { "id": 5, "status": "awaiting-approval" } ], "latest_id": 5 }"#,
        )
        .unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.latest_id, 5);

        assert!(parse_batch("").unwrap_err().is_malformed());
        assert!(parse_batch("null").unwrap_err().is_malformed());
        assert!(parse_batch(r#"{ "latest_id": 3 }"#).unwrap_err().is_malformed());
        assert!(parse_batch(r#"{ "orders": {} }"#).unwrap_err().is_malformed());
        assert!(matches!(
            parse_batch("<html>502</html>"),
            Err(PollError::Decode(_))
        ));
    }

    #[test]
    fn test_parse_batch_skips_bad_records_and_infers_latest_id() {
        let batch = parse_batch(
            r#"{ "orders": [
                { "id": 8, "status": "processing" },
                { "id": "oops", "status": "processing" },
                { "id": 9, "status": "teleported" }
            ] }"#,
        )
        .unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.latest_id, 9);
    }

    #[test]
    fn test_explicit_latest_id_wins_over_skipped_records() {
        let batch = parse_batch(
            r#"{ "orders": [ { "id": "12", "status": "teleported" } ], "latest_id": 10 }"#,
        )
        .unwrap();
        assert!(batch.records.is_empty());
        assert_eq!(batch.latest_id, 10);
    }

    #[test]
    fn test_undecodable_records_still_move_the_cursor() {
        let (alerts, _sink) = recording_scheduler();
        let store = Arc::new(LifecycleStore::new());
        let merge = MergeEngine::new(store.clone(), Arc::new(Cursor::new(0)), alerts);
        let batch = parse_batch(
            r#"{ "orders": [
                { "id": 3, "status": "awaiting-approval" },
                { "id": 6, "status": "teleported" }
            ] }"#,
        )
        .unwrap();
        merge.merge(batch);
        assert_eq!(merge.cursor(), 6);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_cycle_outcomes() {
        let feed = Arc::new(ScriptedFeed::new(vec![
            Ok(Batch {
                records: vec![record(5, OrderStatus::AwaitingApproval)],
                latest_id: 5,
            }),
            Err(PollError::Malformed("missing `orders`".into())),
            Err(PollError::Timeout),
        ]));
        let (poller, store, cursor) = poller(feed.clone());

        assert_eq!(
            poller.poll_cycle().await,
            PollOutcome::Delivered { records: 1, new: 1 }
        );
        assert!(store.contains(5));
        assert_eq!(cursor.get(), 5);

        assert_eq!(poller.poll_cycle().await, PollOutcome::Malformed);
        assert_eq!(poller.status().consecutive_failures, 0);

        assert_eq!(poller.poll_cycle().await, PollOutcome::Failed);
        let status = poller.status();
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(status.cycles, 3);
        assert!(status.last_success_at.is_some());

        assert_eq!(*feed.cursors.lock().unwrap(), vec![0, 5, 5]);
    }

    #[tokio::test]
    async fn test_slow_feed_is_a_timeout_failure() {
        let feed = Arc::new(ScriptedFeed::with_delay(
            Vec::new(),
            Duration::from_millis(500),
        ));
        let (poller, _store, _cursor) = poller(feed);
        assert_eq!(poller.poll_cycle().await, PollOutcome::Failed);
        assert_eq!(
            poller.status().last_error.as_deref(),
            Some("order feed timed out")
        );
    }

    #[tokio::test]
    async fn test_forced_and_scheduled_polls_never_overlap() {
        let feed = Arc::new(ScriptedFeed::with_delay(
            Vec::new(),
            Duration::from_millis(20),
        ));
        let (poller, _store, _cursor) = poller(feed.clone());
        let cancel = CancellationToken::new();
        let task = poller.clone().spawn(cancel.clone());

        for _ in 0..3 {
            poller.poll_cycle().await;
        }
        cancel.cancel();
        task.await.unwrap();

        assert!(feed.calls() >= 3);
        assert_eq!(feed.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loop_keeps_running_through_failures_and_stops_on_cancel() {
        let feed = Arc::new(ScriptedFeed::new(vec![
            Err(PollError::Connect("Cannot reach order feed".into())),
            Err(PollError::Status {
                status: 503,
                message: "Order feed server error (HTTP 503)".into(),
            }),
            Ok(Batch {
                records: vec![record(2, OrderStatus::AwaitingApproval)],
                latest_id: 2,
            }),
        ]));
        let (poller, store, cursor) = poller(feed.clone());
        let cancel = CancellationToken::new();
        let task = poller.clone().spawn(cancel.clone());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !store.contains(2) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(store.contains(2));
        assert_eq!(cursor.get(), 2);

        cancel.cancel();
        cancel.cancel();
        task.await.unwrap();

        let calls = feed.calls();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(feed.calls(), calls, "no polls after cancellation");
    }

    #[tokio::test]
    async fn test_cancel_before_first_poll() {
        let feed = Arc::new(ScriptedFeed::new(Vec::new()));
        let (poller, _store, _cursor) = poller(feed.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        poller.spawn(cancel).await.unwrap();
        assert_eq!(feed.calls(), 0);
    }
}
