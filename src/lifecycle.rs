//! Lifecycle store: the authoritative table of visible orders.
//!
//! The poller only inserts new entries (or lets the server push an entry to a
//! later stage); the action dispatcher only mutates entries that already exist.
//! Every mutation is published on a broadcast channel so renderers never touch
//! the table directly.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::order::{ActionKind, OrderRecord, OrderStatus};

const EVENT_CAPACITY: usize = 256;

/// Change notification published after every store mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Inserted(OrderRecord),
    Updated(OrderRecord),
    Removed { id: u64, status: OrderStatus },
    /// A non-terminal action failed; the order is unchanged and the message
    /// should be shown next to it.
    ActionFailed {
        id: u64,
        action: ActionKind,
        message: String,
    },
    /// Audio is still suspended after the unlock grace period. Published at
    /// most once per session.
    AudioLocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// The server reported a later stage than the local entry.
    Advanced(OrderStatus),
    Unchanged,
    /// Terminal on first sight, or already retired this session.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Updated(OrderStatus),
    Removed(OrderStatus),
}

/// Status-dependent fields carried alongside a local transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalFields {
    pub eta: Option<u32>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("order {0} is not on the board")]
    UnknownOrder(u64),
    #[error("order {id} cannot move from {from} to {to}")]
    IllegalTransition {
        id: u64,
        from: OrderStatus,
        to: OrderStatus,
    },
}

#[derive(Default)]
struct Table {
    arrival: Vec<u64>,
    entries: HashMap<u64, OrderRecord>,
    retired: HashSet<u64>,
}

impl Table {
    fn remove(&mut self, id: u64) -> Option<OrderRecord> {
        let removed = self.entries.remove(&id);
        if removed.is_some() {
            self.arrival.retain(|existing| *existing != id);
            self.retired.insert(id);
        }
        removed
    }
}

pub struct LifecycleStore {
    table: RwLock<Table>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for LifecycleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            table: RwLock::new(Table::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine: nothing is rendering yet.
        let _ = self.events.send(event);
    }

    /// Insert a polled record if it is new.
    ///
    /// An existing entry is never overwritten by an echo at the same or an
    /// earlier stage, so optimistic local edits survive stale polls. A record
    /// at a later, reachable stage walks the entry forward one step at a time.
    pub fn upsert(&self, record: OrderRecord) -> UpsertOutcome {
        let mut table = self.write();
        let id = record.id;

        if table.retired.contains(&id) {
            debug!(order_id = id, "Ignoring echo of retired order");
            return UpsertOutcome::Ignored;
        }

        let Some(current) = table.entries.get(&id).map(|r| r.status) else {
            if record.status.is_terminal() {
                debug!(order_id = id, status = %record.status, "Skipping terminal order on first sight");
                return UpsertOutcome::Ignored;
            }
            table.arrival.push(id);
            table.entries.insert(id, record.clone());
            self.publish(StoreEvent::Inserted(record));
            return UpsertOutcome::Inserted;
        };

        let Some(path) = current.path_to(record.status) else {
            return UpsertOutcome::Unchanged;
        };

        info!(
            order_id = id,
            from = %current,
            to = %record.status,
            "Server reports later stage, advancing local entry"
        );
        for step in path {
            if step.is_terminal() {
                table.remove(id);
                self.publish(StoreEvent::Removed { id, status: step });
                break;
            }
            if let Some(entry) = table.entries.get_mut(&id) {
                let local_eta = entry.eta;
                *entry = OrderRecord {
                    status: step,
                    eta: record.eta.or(local_eta),
                    ..record.clone()
                };
                self.publish(StoreEvent::Updated(entry.clone()));
            }
        }
        UpsertOutcome::Advanced(record.status)
    }

    /// Apply a transition the remote side has already confirmed.
    ///
    /// A same-status call is an in-place field update (ETA on a processing
    /// order). Terminal statuses remove the entry.
    pub fn apply_local_transition(
        &self,
        id: u64,
        new_status: OrderStatus,
        fields: LocalFields,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut table = self.write();
        let current = table
            .entries
            .get(&id)
            .map(|r| r.status)
            .ok_or(StoreError::UnknownOrder(id))?;

        let field_update = current == new_status && fields != LocalFields::default();
        if !field_update && !current.can_transition_to(new_status) {
            return Err(StoreError::IllegalTransition {
                id,
                from: current,
                to: new_status,
            });
        }

        if new_status.is_terminal() {
            table.remove(id);
            info!(order_id = id, status = %new_status, "Order left the board");
            self.publish(StoreEvent::Removed {
                id,
                status: new_status,
            });
            return Ok(TransitionOutcome::Removed(new_status));
        }

        let entry = table
            .entries
            .get_mut(&id)
            .ok_or(StoreError::UnknownOrder(id))?;
        entry.status = new_status;
        if let Some(eta) = fields.eta {
            entry.eta = Some(eta);
        }
        info!(order_id = id, status = %new_status, eta = ?entry.eta, "Applied local transition");
        self.publish(StoreEvent::Updated(entry.clone()));
        Ok(TransitionOutcome::Updated(new_status))
    }

    pub fn report_action_failure(&self, id: u64, action: ActionKind, message: String) {
        self.publish(StoreEvent::ActionFailed {
            id,
            action,
            message,
        });
    }

    pub fn report_audio_locked(&self) {
        self.publish(StoreEvent::AudioLocked);
    }

    /// Ordered (arrival order) copy of every visible order.
    pub fn snapshot(&self) -> Vec<OrderRecord> {
        let table = self.read();
        table
            .arrival
            .iter()
            .filter_map(|id| table.entries.get(id).cloned())
            .collect()
    }

    pub fn get(&self, id: u64) -> Option<OrderRecord> {
        self.read().entries.get(&id).cloned()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.read().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
