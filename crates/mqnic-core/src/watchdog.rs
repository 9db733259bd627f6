//! Timer service and reset requests
//!
//! Fault conditions found on the data path (invalid descriptor counts, refill
//! starvation) or by the periodic health check (missing TX completions, ring
//! index corruption) are recorded as a [`ResetRequest`]. The timer service
//! thread wakes every `watchdog.interval`, runs the health check and executes
//! a pending reset.

use crate::error::{EngineError, ResetReason, Result};
use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A latched reset request; the first reason wins until taken
#[derive(Debug, Default)]
pub struct ResetRequest {
    pending: Mutex<Option<ResetReason>>,
}

impl ResetRequest {
    /// Create an empty request latch
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a reset; returns `false` if one is already pending
    pub fn request(&self, reason: ResetReason) -> bool {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            tracing::debug!("Reset already pending, ignoring {}", reason);
            return false;
        }
        tracing::error!("Device reset requested: {}", reason);
        *pending = Some(reason);
        true
    }

    /// Pending reason, if any
    pub fn peek(&self) -> Option<ResetReason> {
        *self.pending.lock()
    }

    /// Clear and return the pending reason
    pub fn take(&self) -> Option<ResetReason> {
        self.pending.lock().take()
    }
}

/// Outcome of one health check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// TX descriptors past the missing-completion timeout, over all rings
    pub missing_tx: usize,
    /// Descriptors that crossed the timeout during this check
    pub newly_missing_tx: usize,
    /// Rings whose indices failed the invariant check
    pub corrupted_rings: usize,
    /// Reset requested by this check
    pub reset: Option<ResetReason>,
}

impl HealthReport {
    /// True when nothing needed attention
    pub fn is_healthy(&self) -> bool {
        self.missing_tx == 0 && self.corrupted_rings == 0 && self.reset.is_none()
    }
}

/// Periodic background thread
///
/// Calls `tick` every `interval` until stopped or until `tick` returns
/// `false`.
pub struct TimerService {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl TimerService {
    /// Start the `mqnic-timer` thread
    pub fn spawn<F>(interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("mqnic-timer".into())
            .spawn(move || {
                tracing::debug!("Timer service started ({:?})", interval);
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if !tick() {
                                break;
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("Timer service stopped");
            })
            .map_err(EngineError::Io)?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("Timer service thread panicked");
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_reset_request_first_wins() {
        let req = ResetRequest::new();
        assert!(req.request(ResetReason::RxStarvation { queue: 1 }));
        assert!(!req.request(ResetReason::RingCorruption { queue: 0 }));
        assert_eq!(req.peek(), Some(ResetReason::RxStarvation { queue: 1 }));
        assert_eq!(req.take(), Some(ResetReason::RxStarvation { queue: 1 }));
        assert_eq!(req.take(), None);
    }

    #[test]
    fn test_timer_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let timer = TimerService::spawn(Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        timer.stop();

        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 3);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_timer_exits_when_tick_declines() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let timer = TimerService::spawn(Duration::from_millis(1), move || {
            counter.fetch_add(1, Ordering::SeqCst) < 1
        })
        .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        drop(timer);
    }

    #[test]
    fn test_health_report() {
        assert!(HealthReport::default().is_healthy());
        let report = HealthReport {
            missing_tx: 1,
            ..Default::default()
        };
        assert!(!report.is_healthy());
    }
}
