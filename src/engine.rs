//! Engine facade: wires cursor, store, merge, poller, dispatcher and alerts,
//! and owns the single cancellation signal for the background tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::alert::{AlertScheduler, AudioSink};
use crate::config::Config;
use crate::cursor::Cursor;
use crate::diagnostics::EngineHealth;
use crate::dispatcher::{
    ActionDispatcher, ActionError, ActionTransport, Confirm, DispatchOutcome, Navigator,
    OrderAction,
};
use crate::lifecycle::{LifecycleStore, StoreEvent};
use crate::merge::MergeEngine;
use crate::order::OrderRecord;
use crate::poller::{DelaySchedule, FeedPoller, OrderFeed, PollOutcome};

/// External collaborators the engine talks to.
pub struct EngineParts {
    pub feed: Arc<dyn OrderFeed>,
    pub actions: Arc<dyn ActionTransport>,
    pub audio: Arc<dyn AudioSink>,
    pub confirm: Arc<dyn Confirm>,
    pub navigator: Arc<dyn Navigator>,
}

pub struct OrderEngine {
    store: Arc<LifecycleStore>,
    cursor: Arc<Cursor>,
    alerts: Arc<AlertScheduler>,
    poller: Arc<FeedPoller>,
    dispatcher: ActionDispatcher,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OrderEngine {
    pub fn new(config: &Config, parts: EngineParts) -> Self {
        let store = Arc::new(LifecycleStore::new());
        let cursor = Arc::new(Cursor::new(0));
        let alerts = Arc::new(AlertScheduler::new(parts.audio, config.alert.clone()));
        let merge = Arc::new(MergeEngine::new(
            store.clone(),
            cursor.clone(),
            alerts.clone(),
        ));
        let poller = Arc::new(FeedPoller::new(
            parts.feed,
            merge,
            DelaySchedule::from(&config.polling),
            Duration::from_millis(config.polling.timeout_ms),
        ));
        let dispatcher = ActionDispatcher::new(
            store.clone(),
            parts.actions,
            parts.confirm,
            parts.navigator,
            Duration::from_millis(config.actions.timeout_ms),
        );
        Self {
            store,
            cursor,
            alerts,
            poller,
            dispatcher,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the poll loop and the audio unlock watcher. Calling it again is
    /// a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) || self.cancel.is_cancelled() {
            return;
        }
        let poll_task = self.poller.clone().spawn(self.cancel.clone());
        let alerts = self.alerts.clone();
        let store = self.store.clone();
        let cancel = self.cancel.clone();
        let unlock_task = tokio::spawn(async move {
            if alerts.watch_unlock(cancel).await {
                store.report_audio_locked();
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([poll_task, unlock_task]);
        info!("Order engine started");
    }

    /// Stop scheduling polls. Safe to call any number of times, including
    /// before `start`. In-flight actions are not interrupted.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("Order engine shutting down");
        }
        self.cancel.cancel();
    }

    /// Wait for background tasks after `shutdown`.
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn dispatch(
        &self,
        id: u64,
        action: OrderAction,
    ) -> Result<DispatchOutcome, ActionError> {
        self.dispatcher.dispatch(id, action).await
    }

    /// Manual refresh outside the schedule. Waits for any in-flight poll.
    pub async fn force_poll(&self) -> PollOutcome {
        self.poller.poll_cycle().await
    }

    pub fn ring(&self) -> usize {
        self.alerts.ring()
    }

    pub fn unlock_audio(&self) -> bool {
        self.alerts.unlock()
    }

    pub fn snapshot(&self) -> Vec<OrderRecord> {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    pub fn store(&self) -> Arc<LifecycleStore> {
        self.store.clone()
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.get()
    }

    pub fn health(&self) -> EngineHealth {
        let poll = self.poller.status();
        EngineHealth {
            cursor: self.cursor.get(),
            visible_orders: self.store.len(),
            poll_cycles: poll.cycles,
            last_poll_outcome: poll.last_outcome,
            last_poll_success_at: poll.last_success_at,
            consecutive_poll_failures: poll.consecutive_failures,
            last_poll_error: poll.last_error,
            alert_bursts: self.alerts.bursts(),
            audio_unlock_pending: self.alerts.unlock_pending(),
            running: self.started.load(Ordering::SeqCst) && !self.cancel.is_cancelled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::tests::RecordingSink;
    use crate::alert::AudioState;
    use crate::config::{AlertConfig, PollingConfig};
    use crate::dispatcher::tests::{FakeTransport, FixedConfirm, RecordingNavigator};
    use crate::lifecycle::tests::record;
    use crate::order::OrderStatus;
    use crate::poller::tests::ScriptedFeed;
    use crate::poller::{Batch, PollError};
    use std::collections::HashMap;

    struct Rig {
        engine: OrderEngine,
        feed: Arc<ScriptedFeed>,
        sink: Arc<RecordingSink>,
        transport: Arc<FakeTransport>,
        navigator: Arc<RecordingNavigator>,
    }

    fn rig(replies: Vec<Result<Batch, PollError>>) -> Rig {
        rig_with_audio(replies, AudioState::Running, 3_000)
    }

    fn rig_with_audio(
        replies: Vec<Result<Batch, PollError>>,
        audio: AudioState,
        unlock_grace_ms: u64,
    ) -> Rig {
        let config = Config {
            feed_url: "https://shop.test/feed".into(),
            polling: PollingConfig {
                warmup_ms: 1,
                steady_ms: 2,
                empty_response_ms: 3,
                error_ms: 4,
                timeout_ms: 500,
            },
            alert: AlertConfig {
                unlock_grace_ms,
                ..AlertConfig::default()
            },
            ..Config::default()
        };
        let feed = Arc::new(ScriptedFeed::new(replies));
        let sink = Arc::new(RecordingSink::new(audio));
        let transport = Arc::new(FakeTransport::default());
        let navigator = Arc::new(RecordingNavigator::default());
        let engine = OrderEngine::new(
            &config,
            EngineParts {
                feed: feed.clone(),
                actions: transport.clone(),
                audio: sink.clone(),
                confirm: Arc::new(FixedConfirm(true)),
                navigator: navigator.clone(),
            },
        );
        Rig {
            engine,
            feed,
            sink,
            transport,
            navigator,
        }
    }

    fn batch(ids: &[(u64, OrderStatus)], latest_id: u64) -> Result<Batch, PollError> {
        Ok(Batch {
            records: ids.iter().map(|(id, s)| record(*id, *s)).collect(),
            latest_id,
        })
    }

    #[tokio::test]
    async fn test_new_order_then_stale_duplicate() {
        let rig = rig(vec![
            batch(&[(5, OrderStatus::AwaitingApproval)], 5),
            batch(&[(5, OrderStatus::AwaitingApproval)], 7),
        ]);

        assert_eq!(
            rig.engine.force_poll().await,
            PollOutcome::Delivered { records: 1, new: 1 }
        );
        assert_eq!(rig.engine.cursor(), 5);
        assert_eq!(rig.sink.pulse_count(), 5);

        assert_eq!(
            rig.engine.force_poll().await,
            PollOutcome::Delivered { records: 1, new: 0 }
        );
        assert_eq!(rig.engine.snapshot().len(), 1);
        assert_eq!(rig.engine.cursor(), 7);
        assert_eq!(rig.sink.pulse_count(), 5);
        assert_eq!(*rig.feed.cursors.lock().unwrap(), vec![0, 5]);
    }

    #[tokio::test]
    async fn test_full_lifecycle_is_observed_in_order() {
        let rig = rig(vec![
            batch(&[(5, OrderStatus::AwaitingApproval)], 5),
            batch(&[(5, OrderStatus::AwaitingApproval)], 5),
        ]);
        let mut rx = rig.engine.subscribe();
        rig.engine.force_poll().await;

        rig.engine
            .dispatch(5, OrderAction::Approve { eta: 20 })
            .await
            .unwrap();
        let entry = rig.engine.snapshot().pop().unwrap();
        assert_eq!(entry.status, OrderStatus::Processing);
        assert_eq!(entry.eta, Some(20));

        // A stale echo of the original record does not roll the order back.
        rig.engine.force_poll().await;
        assert_eq!(rig.engine.snapshot()[0].status, OrderStatus::Processing);
        rig.engine.dispatch(5, OrderAction::Advance).await.unwrap();
        rig.engine.dispatch(5, OrderAction::Complete).await.unwrap();
        assert!(rig.engine.snapshot().is_empty());

        let mut observed: HashMap<u64, Vec<OrderStatus>> = HashMap::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                StoreEvent::Inserted(r) | StoreEvent::Updated(r) => {
                    observed.entry(r.id).or_default().push(r.status)
                }
                StoreEvent::Removed { id, status } => observed.entry(id).or_default().push(status),
                StoreEvent::ActionFailed { .. } | StoreEvent::AudioLocked => {}
            }
        }
        assert_eq!(
            observed[&5],
            vec![
                OrderStatus::AwaitingApproval,
                OrderStatus::Processing,
                OrderStatus::OutForDelivery,
                OrderStatus::Complete
            ]
        );
        assert_eq!(rig.transport.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_advance_failure_navigates() {
        let rig = rig(vec![batch(&[(5, OrderStatus::Processing)], 5)]);
        rig.engine.force_poll().await;
        rig.transport
            .fail
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let outcome = rig.engine.dispatch(5, OrderAction::Advance).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Navigated { .. }));
        assert_eq!(rig.engine.snapshot()[0].status, OrderStatus::Processing);
        assert_eq!(rig.navigator.visited.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_started_engine_polls_until_shutdown() {
        let rig = rig(vec![
            Err(PollError::Timeout),
            batch(&[(1, OrderStatus::AwaitingApproval), (2, OrderStatus::AwaitingApproval)], 2),
        ]);
        rig.engine.start();
        rig.engine.start();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while rig.engine.snapshot().len() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(rig.engine.snapshot().len(), 2);
        assert!(rig.engine.health().running);

        rig.engine.shutdown();
        rig.engine.shutdown();
        rig.engine.join().await;

        let health = rig.engine.health();
        assert!(!health.running);
        assert_eq!(health.cursor, 2);
        assert_eq!(health.alert_bursts, 1);
    }

    #[tokio::test]
    async fn test_locked_audio_notifies_once_after_grace() {
        let rig = rig_with_audio(Vec::new(), AudioState::Suspended, 5);
        let mut rx = rig.engine.subscribe();
        rig.engine.start();

        let event = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Ok(StoreEvent::AudioLocked) => return true,
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
        })
        .await;
        assert!(matches!(event, Ok(true)));
        assert!(rig.engine.health().audio_unlock_pending);

        rig.engine.shutdown();
        rig.engine.join().await;
        while let Ok(event) = rx.try_recv() {
            assert_ne!(event, StoreEvent::AudioLocked);
        }

        assert!(rig.engine.unlock_audio());
        assert!(!rig.engine.health().audio_unlock_pending);
    }

    #[tokio::test]
    async fn test_running_audio_never_notifies() {
        let rig = rig_with_audio(Vec::new(), AudioState::Running, 5);
        let mut rx = rig.engine.subscribe();
        rig.engine.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        rig.engine.shutdown();
        rig.engine.join().await;
        while let Ok(event) = rx.try_recv() {
            assert_ne!(event, StoreEvent::AudioLocked);
        }
    }

    #[tokio::test]
    async fn test_shutdown_before_start_never_polls() {
        let rig = rig(Vec::new());
        rig.engine.shutdown();
        rig.engine.start();
        rig.engine.join().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(rig.feed.calls(), 0);
    }
}
