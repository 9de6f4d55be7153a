//! Operator actions: one variant, one transition, one remote call.
//!
//! The local entry only changes after the remote side confirms. Destructive
//! and terminal actions (reject, complete) ask the operator first. When the
//! call behind advance or complete fails, the desk falls back to opening the
//! capability URL directly so the operator is never stuck on a dead button;
//! approve, update-eta and reject failures are reported next to the order
//! instead.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::validate_capability_url;
use crate::lifecycle::{LifecycleStore, LocalFields, StoreError, TransitionOutcome};
use crate::order::{ActionKind, OrderRecord, OrderStatus};

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderAction {
    Approve { eta: u32 },
    UpdateEta { eta: u32 },
    Reject,
    Advance,
    Complete,
}

impl OrderAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            OrderAction::Approve { .. } => ActionKind::Approve,
            OrderAction::UpdateEta { .. } => ActionKind::UpdateEta,
            OrderAction::Reject => ActionKind::Reject,
            OrderAction::Advance => ActionKind::Advance,
            OrderAction::Complete => ActionKind::Complete,
        }
    }

    pub fn required_status(&self) -> OrderStatus {
        match self {
            OrderAction::Approve { .. } | OrderAction::Reject => OrderStatus::AwaitingApproval,
            OrderAction::UpdateEta { .. } | OrderAction::Advance => OrderStatus::Processing,
            OrderAction::Complete => OrderStatus::OutForDelivery,
        }
    }

    pub fn target_status(&self) -> OrderStatus {
        match self {
            OrderAction::Approve { .. } | OrderAction::UpdateEta { .. } => OrderStatus::Processing,
            OrderAction::Reject => OrderStatus::Rejected,
            OrderAction::Advance => OrderStatus::OutForDelivery,
            OrderAction::Complete => OrderStatus::Complete,
        }
    }

    pub fn eta(&self) -> Option<u32> {
        match self {
            OrderAction::Approve { eta } | OrderAction::UpdateEta { eta } => Some(*eta),
            _ => None,
        }
    }

    pub fn needs_confirmation(&self) -> bool {
        matches!(self, OrderAction::Reject | OrderAction::Complete)
    }

    pub fn navigates_on_failure(&self) -> bool {
        matches!(self, OrderAction::Advance | OrderAction::Complete)
    }

    fn confirm_prompt(&self, record: &OrderRecord) -> String {
        let label = if record.number.is_empty() {
            format!("#{}", record.id)
        } else {
            record.number.clone()
        };
        match self {
            OrderAction::Reject => format!("Reject order {label} from {}?", record.customer),
            _ => format!("Mark order {label} as delivered?"),
        }
    }
}

/// Parse the operator's ETA input. Blank means 0 minutes.
pub fn parse_eta_input(raw: &str) -> Result<u32, ActionError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed
        .parse::<u32>()
        .map_err(|_| ActionError::InvalidEta(trimmed.to_string()))
}

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Connect(String),
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },
    #[error("{0}")]
    Request(String),
}

#[async_trait]
pub trait ActionTransport: Send + Sync {
    /// Approve / update-eta: POST a single `eta` field.
    async fn submit_eta(&self, url: &str, eta: u32) -> Result<(), TransportError>;
    /// Advance / complete / reject: fire the capability URL.
    async fn trigger(&self, url: &str) -> Result<(), TransportError>;
    /// Turn a capability reference from the feed into an absolute URL.
    fn resolve(&self, raw: &str) -> String {
        raw.to_string()
    }
}

#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Full-navigation fallback target.
pub trait Navigator: Send + Sync {
    fn navigate(&self, url: &str) -> Result<(), String>;
}

/// Opens capability URLs in the system browser.
pub struct BrowserNavigator;

impl Navigator for BrowserNavigator {
    fn navigate(&self, url: &str) -> Result<(), String> {
        let parsed = validate_capability_url(url)?;
        webbrowser::open(parsed.as_str()).map_err(|e| format!("Failed to open {url}: {e}"))?;
        info!(
            host = parsed.host_str().unwrap_or("unknown"),
            "Opened capability URL in browser"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied(OrderStatus),
    Removed(OrderStatus),
    /// The operator declined the confirmation; nothing was sent.
    Declined,
    /// A poll already moved the order at or past this stage while the call
    /// was in flight.
    Superseded,
    /// The remote call failed and the capability URL was opened instead.
    Navigated { url: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("order {0} is not on the board")]
    UnknownOrder(u64),
    #[error("{action:?} is not available while order {id} is {status}")]
    Precondition {
        id: u64,
        action: ActionKind,
        status: OrderStatus,
    },
    #[error("order {id} has no capability URL for {action:?}")]
    MissingCapability { id: u64, action: ActionKind },
    #[error("ETA must be a whole, non-negative number of minutes (got {0:?})")]
    InvalidEta(String),
    #[error("{0}")]
    Rejected(String),
    #[error("{action:?} failed and the fallback could not open {url}: {reason}")]
    Unreachable {
        action: ActionKind,
        url: String,
        reason: String,
    },
}

pub struct ActionDispatcher {
    store: Arc<LifecycleStore>,
    transport: Arc<dyn ActionTransport>,
    confirm: Arc<dyn Confirm>,
    navigator: Arc<dyn Navigator>,
    timeout: Duration,
}

impl ActionDispatcher {
    pub fn new(
        store: Arc<LifecycleStore>,
        transport: Arc<dyn ActionTransport>,
        confirm: Arc<dyn Confirm>,
        navigator: Arc<dyn Navigator>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            confirm,
            navigator,
            timeout,
        }
    }

    pub async fn dispatch(
        &self,
        id: u64,
        action: OrderAction,
    ) -> Result<DispatchOutcome, ActionError> {
        let request_id = Uuid::new_v4();
        let kind = action.kind();
        let record = self.store.get(id).ok_or(ActionError::UnknownOrder(id))?;

        if record.status != action.required_status() {
            return Err(ActionError::Precondition {
                id,
                action: kind,
                status: record.status,
            });
        }
        let url = record
            .capability(kind)
            .map(|raw| self.transport.resolve(raw))
            .ok_or(ActionError::MissingCapability { id, action: kind })?;

        if action.needs_confirmation() && !self.confirm.confirm(&action.confirm_prompt(&record)).await
        {
            info!(%request_id, order_id = id, action = ?kind, "Operator declined confirmation");
            return Ok(DispatchOutcome::Declined);
        }

        debug!(%request_id, order_id = id, action = ?kind, "Dispatching order action");
        let call = async {
            match action.eta() {
                Some(eta) => self.transport.submit_eta(&url, eta).await,
                None => self.transport.trigger(&url).await,
            }
        };
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        match result {
            Ok(()) => self.confirmed(request_id, id, action),
            Err(error) if action.navigates_on_failure() => {
                warn!(
                    %request_id,
                    order_id = id,
                    action = ?kind,
                    error = %error,
                    "Action call failed, falling back to direct navigation"
                );
                if let Err(reason) = self.navigator.navigate(&url) {
                    let err = ActionError::Unreachable {
                        action: kind,
                        url: url.clone(),
                        reason,
                    };
                    self.store.report_action_failure(id, kind, err.to_string());
                    return Err(err);
                }
                Ok(DispatchOutcome::Navigated { url })
            }
            Err(error) => {
                warn!(
                    %request_id,
                    order_id = id,
                    action = ?kind,
                    error = %error,
                    "Action rejected"
                );
                let message = error.to_string();
                self.store.report_action_failure(id, kind, message.clone());
                Err(ActionError::Rejected(message))
            }
        }
    }

    fn confirmed(
        &self,
        request_id: Uuid,
        id: u64,
        action: OrderAction,
    ) -> Result<DispatchOutcome, ActionError> {
        let fields = LocalFields { eta: action.eta() };
        match self
            .store
            .apply_local_transition(id, action.target_status(), fields)
        {
            Ok(TransitionOutcome::Updated(status)) => Ok(DispatchOutcome::Applied(status)),
            Ok(TransitionOutcome::Removed(status)) => Ok(DispatchOutcome::Removed(status)),
            Err(StoreError::UnknownOrder(_)) | Err(StoreError::IllegalTransition { .. }) => {
                // Highest stage wins: the poller got there first.
                debug!(
                    %request_id,
                    order_id = id,
                    action = ?action.kind(),
                    "Confirmed action superseded by a newer poll"
                );
                Ok(DispatchOutcome::Superseded)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::lifecycle::tests::record;
    use crate::lifecycle::StoreEvent;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct FakeTransport {
        pub(crate) fail: AtomicBool,
        pub(crate) calls: Mutex<Vec<(String, Option<u32>)>>,
        pub(crate) hang: AtomicBool,
    }

    #[async_trait]
    impl ActionTransport for FakeTransport {
        async fn submit_eta(&self, url: &str, eta: u32) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push((url.to_string(), Some(eta)));
            self.outcome().await
        }

        async fn trigger(&self, url: &str) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push((url.to_string(), None));
            self.outcome().await
        }
    }

    impl FakeTransport {
        async fn outcome(&self) -> Result<(), TransportError> {
            if self.hang.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                Err(TransportError::Connect("Cannot reach shop.test".into()))
            } else {
                Ok(())
            }
        }
    }

    pub(crate) struct FixedConfirm(pub(crate) bool);

    #[async_trait]
    impl Confirm for FixedConfirm {
        async fn confirm(&self, _prompt: &str) -> bool {
            self.0
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingNavigator {
        pub(crate) visited: Mutex<Vec<String>>,
    }

    impl Navigator for RecordingNavigator {
        fn navigate(&self, url: &str) -> Result<(), String> {
            self.visited.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    struct Harness {
        store: Arc<LifecycleStore>,
        transport: Arc<FakeTransport>,
        navigator: Arc<RecordingNavigator>,
        dispatcher: ActionDispatcher,
    }

    fn harness(confirm: bool) -> Harness {
        let store = Arc::new(LifecycleStore::new());
        let transport = Arc::new(FakeTransport::default());
        let navigator = Arc::new(RecordingNavigator::default());
        let dispatcher = ActionDispatcher::new(
            store.clone(),
            transport.clone(),
            Arc::new(FixedConfirm(confirm)),
            navigator.clone(),
            Duration::from_millis(100),
        );
        Harness {
            store,
            transport,
            navigator,
            dispatcher,
        }
    }

    #[test]
    fn test_parse_eta_input() {
        assert_eq!(parse_eta_input(""), Ok(0));
        assert_eq!(parse_eta_input(" 20 "), Ok(20));
        assert_eq!(
            parse_eta_input("-5"),
            Err(ActionError::InvalidEta("-5".into()))
        );
        assert!(parse_eta_input("soon").is_err());
    }

    #[tokio::test]
    async fn test_approve_sets_processing_and_eta_without_poll() {
        let h = harness(true);
        h.store.upsert(record(5, OrderStatus::AwaitingApproval));

        let outcome = h
            .dispatcher
            .dispatch(5, OrderAction::Approve { eta: 20 })
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Applied(OrderStatus::Processing));
        let entry = h.store.get(5).unwrap();
        assert_eq!(entry.status, OrderStatus::Processing);
        assert_eq!(entry.eta, Some(20));
        assert_eq!(
            entry.available_actions(),
            &[ActionKind::UpdateEta, ActionKind::Advance]
        );
        assert_eq!(
            *h.transport.calls.lock().unwrap(),
            vec![("https://shop.test/orders/5/approve".to_string(), Some(20))]
        );
    }

    #[tokio::test]
    async fn test_approve_failure_is_reported_inline() {
        let h = harness(true);
        h.store.upsert(record(5, OrderStatus::AwaitingApproval));
        h.transport.fail.store(true, Ordering::SeqCst);
        let mut rx = h.store.subscribe();

        let err = h
            .dispatcher
            .dispatch(5, OrderAction::Approve { eta: 10 })
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Rejected(_)));
        assert_eq!(h.store.get(5).unwrap().status, OrderStatus::AwaitingApproval);
        assert!(h.navigator.visited.lock().unwrap().is_empty());
        assert!(matches!(
            rx.try_recv(),
            Ok(StoreEvent::ActionFailed {
                id: 5,
                action: ActionKind::Approve,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_update_eta_keeps_status() {
        let h = harness(true);
        h.store.upsert(record(3, OrderStatus::Processing));
        let outcome = h
            .dispatcher
            .dispatch(3, OrderAction::UpdateEta { eta: 45 })
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Applied(OrderStatus::Processing));
        assert_eq!(h.store.get(3).unwrap().eta, Some(45));
    }

    #[tokio::test]
    async fn test_reject_requires_confirmation() {
        let declined = harness(false);
        declined.store.upsert(record(4, OrderStatus::AwaitingApproval));
        assert_eq!(
            declined.dispatcher.dispatch(4, OrderAction::Reject).await,
            Ok(DispatchOutcome::Declined)
        );
        assert!(declined.transport.calls.lock().unwrap().is_empty());
        assert!(declined.store.contains(4));

        let confirmed = harness(true);
        confirmed.store.upsert(record(4, OrderStatus::AwaitingApproval));
        assert_eq!(
            confirmed.dispatcher.dispatch(4, OrderAction::Reject).await,
            Ok(DispatchOutcome::Removed(OrderStatus::Rejected))
        );
        assert!(!confirmed.store.contains(4));
    }

    #[tokio::test]
    async fn test_advance_failure_navigates_instead_of_mutating() {
        let h = harness(true);
        h.store.upsert(record(5, OrderStatus::Processing));
        h.transport.fail.store(true, Ordering::SeqCst);

        let outcome = h
            .dispatcher
            .dispatch(5, OrderAction::Advance)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Navigated {
                url: "https://shop.test/orders/5/out".into()
            }
        );
        assert_eq!(h.store.get(5).unwrap().status, OrderStatus::Processing);
        assert_eq!(
            *h.navigator.visited.lock().unwrap(),
            vec!["https://shop.test/orders/5/out".to_string()]
        );
    }

    #[tokio::test]
    async fn test_advance_then_complete() {
        let h = harness(true);
        h.store.upsert(record(8, OrderStatus::Processing));
        assert_eq!(
            h.dispatcher.dispatch(8, OrderAction::Advance).await,
            Ok(DispatchOutcome::Applied(OrderStatus::OutForDelivery))
        );
        assert_eq!(
            h.store.get(8).unwrap().available_actions(),
            &[ActionKind::Complete]
        );
        assert_eq!(
            h.dispatcher.dispatch(8, OrderAction::Complete).await,
            Ok(DispatchOutcome::Removed(OrderStatus::Complete))
        );
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_complete_timeout_takes_fallback_path() {
        let h = harness(true);
        h.store.upsert(record(9, OrderStatus::OutForDelivery));
        h.transport.hang.store(true, Ordering::SeqCst);

        let outcome = h
            .dispatcher
            .dispatch(9, OrderAction::Complete)
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Navigated { .. }));
        assert!(h.store.contains(9));
    }

    #[tokio::test]
    async fn test_stale_view_fails_precondition_without_call() {
        let h = harness(true);
        h.store.upsert(record(6, OrderStatus::OutForDelivery));
        let err = h
            .dispatcher
            .dispatch(6, OrderAction::Approve { eta: 5 })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ActionError::Precondition {
                id: 6,
                action: ActionKind::Approve,
                status: OrderStatus::OutForDelivery
            }
        );
        assert!(h.transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_capability() {
        let h = harness(true);
        let mut bare = record(2, OrderStatus::AwaitingApproval);
        bare.actions = Default::default();
        h.store.upsert(bare);
        assert_eq!(
            h.dispatcher.dispatch(2, OrderAction::Reject).await,
            Err(ActionError::MissingCapability {
                id: 2,
                action: ActionKind::Reject
            })
        );
    }

    #[tokio::test]
    async fn test_unknown_order() {
        let h = harness(true);
        assert_eq!(
            h.dispatcher.dispatch(77, OrderAction::Advance).await,
            Err(ActionError::UnknownOrder(77))
        );
    }
}
