//! Audible alert bursts for incoming orders.
//!
//! A burst is a fixed number of short pulses laid out on the audio clock
//! relative to a single origin. Audio that is unavailable or still locked
//! (waiting for an operator gesture) turns `ring` into a no-op; it never fails
//! the poll cycle that triggered it.

use std::io::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AlertConfig, MAX_ALERT_PULSES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioState {
    Running,
    /// Present but locked until the operator interacts with the desk.
    Suspended,
    Unavailable,
}

/// One tone, expressed as offsets from the burst origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    pub start: Duration,
    pub stop: Duration,
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio output unavailable")]
    Unavailable,
    #[error("audio output error: {0}")]
    Device(String),
}

pub trait AudioSink: Send + Sync {
    fn state(&self) -> AudioState;
    fn schedule_pulse(&self, origin: Instant, pulse: Pulse) -> Result<(), AudioError>;
    /// Operator gesture: leave the suspended state if possible.
    fn resume(&self) -> Result<(), AudioError>;
}

/// Sink for hosts without sound.
pub struct NullAudioSink;

impl AudioSink for NullAudioSink {
    fn state(&self) -> AudioState {
        AudioState::Unavailable
    }

    fn schedule_pulse(&self, _origin: Instant, _pulse: Pulse) -> Result<(), AudioError> {
        Err(AudioError::Unavailable)
    }

    fn resume(&self) -> Result<(), AudioError> {
        Err(AudioError::Unavailable)
    }
}

/// Rings the terminal bell on stderr. Starts suspended, like a browser audio
/// context, until the operator unlocks it.
pub struct TerminalBellSink {
    unlocked: AtomicBool,
}

impl TerminalBellSink {
    pub fn new() -> Self {
        Self {
            unlocked: AtomicBool::new(false),
        }
    }
}

impl Default for TerminalBellSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for TerminalBellSink {
    fn state(&self) -> AudioState {
        if self.unlocked.load(Ordering::SeqCst) {
            AudioState::Running
        } else {
            AudioState::Suspended
        }
    }

    fn schedule_pulse(&self, origin: Instant, pulse: Pulse) -> Result<(), AudioError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AudioError::Device(format!("no runtime for pulse timer: {e}")))?;
        // The bell has no duration, so only the start offset matters.
        runtime.spawn(async move {
            tokio::time::sleep_until(origin + pulse.start).await;
            let mut stderr = std::io::stderr();
            let _ = stderr.write_all(b"\x07");
            let _ = stderr.flush();
        });
        Ok(())
    }

    fn resume(&self) -> Result<(), AudioError> {
        self.unlocked.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct AlertScheduler {
    sink: Arc<dyn AudioSink>,
    settings: AlertConfig,
    unlock_prompted: AtomicBool,
    unlock_pending: AtomicBool,
    bursts: AtomicU64,
}

impl AlertScheduler {
    pub fn new(sink: Arc<dyn AudioSink>, settings: AlertConfig) -> Self {
        Self {
            sink,
            settings,
            unlock_prompted: AtomicBool::new(false),
            unlock_pending: AtomicBool::new(false),
            bursts: AtomicU64::new(0),
        }
    }

    /// Pulse layout for one burst.
    pub fn burst(&self) -> Vec<Pulse> {
        let interval = self.settings.interval();
        let length = self.settings.length();
        (0..self.settings.pulses.min(MAX_ALERT_PULSES))
            .map(|i| {
                let start = interval.saturating_mul(i);
                Pulse {
                    start,
                    stop: start.saturating_add(length),
                }
            })
            .collect()
    }

    /// Schedule one burst. Returns how many pulses were scheduled (zero when
    /// audio is locked or missing).
    pub fn ring(&self) -> usize {
        match self.sink.state() {
            AudioState::Running => {}
            state => {
                debug!(?state, "Audio not running, skipping alert burst");
                return 0;
            }
        }

        let origin = Instant::now();
        let mut scheduled = 0usize;
        for pulse in self.burst() {
            if let Err(e) = self.sink.schedule_pulse(origin, pulse) {
                debug!(error = %e, scheduled, "Alert pulse could not be scheduled");
                break;
            }
            scheduled += 1;
        }
        if scheduled > 0 {
            self.bursts.fetch_add(1, Ordering::Relaxed);
        }
        scheduled
    }

    pub fn bursts(&self) -> u64 {
        self.bursts.load(Ordering::Relaxed)
    }

    /// Returns `true` exactly once: the first time audio is found suspended.
    /// The caller shows the unlock affordance when it does.
    pub fn check_unlock(&self) -> bool {
        if self.sink.state() != AudioState::Suspended {
            return false;
        }
        if self.unlock_prompted.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.unlock_pending.store(true, Ordering::SeqCst);
        info!("Audio is still locked, surfacing unlock prompt");
        true
    }

    /// Wait out the grace period, then run the one-shot unlock check.
    pub async fn watch_unlock(self: Arc<Self>, cancel: CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.settings.unlock_grace()) => self.check_unlock(),
        }
    }

    pub fn unlock_pending(&self) -> bool {
        self.unlock_pending.load(Ordering::SeqCst)
    }

    /// Operator pressed the unlock control.
    pub fn unlock(&self) -> bool {
        match self.sink.resume() {
            Ok(()) => {
                self.unlock_pending.store(false, Ordering::SeqCst);
                info!("Audio unlocked");
                true
            }
            Err(e) => {
                warn!(error = %e, "Audio unlock failed");
                false
            }
        }
    }
}
