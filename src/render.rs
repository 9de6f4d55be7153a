//! Bridge between store change notifications and whatever draws the orders.
//!
//! The renderer never sees the store itself: it gets records on insert,
//! status changes on update and a removal call when an order leaves the
//! board.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::lifecycle::{LifecycleStore, StoreEvent};
use crate::order::{ActionKind, OrderRecord};

/// A displayed order card.
pub trait RenderHandle: Send {
    fn remove(&mut self);
    /// Status or a status-dependent field (ETA, affordances) changed.
    fn update_status(&mut self, record: &OrderRecord);
    fn show_error(&mut self, _action: ActionKind, _message: &str) {}
}

pub trait Renderer: Send {
    type Handle: RenderHandle;

    fn render(&mut self, record: &OrderRecord) -> Self::Handle;

    /// Tell the operator that alert sound needs an unlock gesture.
    fn audio_locked(&mut self) {}
}

pub struct RenderBridge<R: Renderer> {
    renderer: R,
    handles: HashMap<u64, R::Handle>,
}

impl<R: Renderer> RenderBridge<R> {
    pub fn new(renderer: R) -> Self {
        Self {
            renderer,
            handles: HashMap::new(),
        }
    }

    pub fn displayed(&self) -> usize {
        self.handles.len()
    }

    pub fn is_displayed(&self, id: u64) -> bool {
        self.handles.contains_key(&id)
    }

    pub fn apply(&mut self, event: &StoreEvent) {
        match event {
            StoreEvent::Inserted(record) => {
                if !self.handles.contains_key(&record.id) {
                    let handle = self.renderer.render(record);
                    self.handles.insert(record.id, handle);
                }
            }
            StoreEvent::Updated(record) => match self.handles.get_mut(&record.id) {
                Some(handle) => handle.update_status(record),
                None => {
                    let handle = self.renderer.render(record);
                    self.handles.insert(record.id, handle);
                }
            },
            StoreEvent::Removed { id, .. } => {
                if let Some(mut handle) = self.handles.remove(id) {
                    handle.remove();
                }
            }
            StoreEvent::ActionFailed {
                id,
                action,
                message,
            } => {
                if let Some(handle) = self.handles.get_mut(id) {
                    handle.show_error(*action, message);
                }
            }
            StoreEvent::AudioLocked => self.renderer.audio_locked(),
        }
    }

    /// Rebuild from a snapshot after missed notifications.
    pub fn resync(&mut self, snapshot: &[OrderRecord]) {
        let live: HashMap<u64, &OrderRecord> = snapshot.iter().map(|r| (r.id, r)).collect();
        let stale: Vec<u64> = self
            .handles
            .keys()
            .filter(|id| !live.contains_key(id))
            .copied()
            .collect();
        for id in stale {
            if let Some(mut handle) = self.handles.remove(&id) {
                handle.remove();
            }
        }
        for record in snapshot {
            match self.handles.get_mut(&record.id) {
                Some(handle) => handle.update_status(record),
                None => {
                    let handle = self.renderer.render(record);
                    self.handles.insert(record.id, handle);
                }
            }
        }
    }

    /// Follow the store until cancelled.
    pub async fn run(mut self, store: Arc<LifecycleStore>, cancel: CancellationToken) {
        let mut rx = store.subscribe();
        self.resync(&store.snapshot());
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => event,
            };
            match event {
                Ok(event) => self.apply(&event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Renderer fell behind, resyncing from snapshot");
                    self.resync(&store.snapshot());
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Render bridge stopped");
    }
}
