//! Heartbeat scheduler
//!
//! Once a BootNotification is accepted, the station sends a Heartbeat right
//! away and then one per interval, measuring each round trip. The scheduler
//! is bound to one session and stops with it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::correlator::CallFailure;
use super::session::Session;
use crate::error::OcppError;
use crate::ocpp::HeartbeatRequest;
use crate::reporting::{Reporter, RttSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Idle,
    Running,
    Stopped,
}

/// What the scheduler has done so far
#[derive(Debug, Clone)]
pub struct HeartbeatState {
    pub status: HeartbeatStatus,
    pub interval: Duration,
    pub last_sent_at: Option<DateTime<Utc>>,
    /// One entry per answered heartbeat, oldest first
    pub samples: Vec<RttSample>,
    /// Heartbeats that were rejected or timed out
    pub failures: u64,
}

impl HeartbeatState {
    fn idle() -> Self {
        Self {
            status: HeartbeatStatus::Idle,
            interval: Duration::ZERO,
            last_sent_at: None,
            samples: Vec::new(),
            failures: 0,
        }
    }
}

/// Interval from a BootNotification response; non-positive values fall back
pub fn interval_from_secs(secs: i32, fallback: Duration) -> Duration {
    if secs > 0 {
        Duration::from_secs(secs as u64)
    } else {
        fallback
    }
}

/// Periodic Heartbeat sender for one session
pub struct HeartbeatScheduler<R> {
    session: Session,
    reporter: R,
    state: watch::Sender<HeartbeatState>,
}

impl<R: Reporter> HeartbeatScheduler<R> {
    pub fn new(session: Session, reporter: R) -> Self {
        let (state, _) = watch::channel(HeartbeatState::idle());
        Self {
            session,
            reporter,
            state,
        }
    }

    pub fn state(&self) -> HeartbeatState {
        self.state.borrow().clone()
    }

    /// Spawn the heartbeat loop
    pub fn start(self, interval: Duration) -> HeartbeatHandle {
        let stop = Arc::new(Notify::new());
        let state = self.state.subscribe();

        self.state.send_modify(|s| {
            s.status = HeartbeatStatus::Running;
            s.interval = interval;
        });

        let task = tokio::spawn(self.run(interval, stop.clone()));

        HeartbeatHandle { state, stop, task }
    }

    async fn run(self, interval: Duration, stop: Arc<Notify>) -> HeartbeatState {
        info!(
            "Heartbeat on {} every {:?}",
            self.session.id(),
            interval
        );

        loop {
            let sent_at = Utc::now();
            let started = Instant::now();
            self.state.send_modify(|s| s.last_sent_at = Some(sent_at));

            let outcome = tokio::select! {
                outcome = self.session.send(&HeartbeatRequest {}) => outcome,
                _ = stop.notified() => break,
            };

            match outcome {
                Ok(_) => {
                    let sample = RttSample::new(sent_at, started.elapsed());
                    debug!("Heartbeat RTT {:?}", started.elapsed());

                    if let Err(e) = self.reporter.append(&sample) {
                        warn!("Failed to record RTT: {}", e);
                    }
                    self.state.send_modify(|s| s.samples.push(sample));
                }
                Err(OcppError::Call(CallFailure::Disconnected)) => break,
                Err(e) => {
                    warn!("Heartbeat failed: {}", e);
                    self.state.send_modify(|s| s.failures += 1);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.session.closing() => break,
                _ = stop.notified() => break,
            }
        }

        self.state.send_modify(|s| s.status = HeartbeatStatus::Stopped);
        info!("Heartbeat on {} stopped", self.session.id());
        self.state.borrow().clone()
    }
}

/// Control handle for a running scheduler
pub struct HeartbeatHandle {
    state: watch::Receiver<HeartbeatState>,
    stop: Arc<Notify>,
    task: JoinHandle<HeartbeatState>,
}

impl HeartbeatHandle {
    pub fn state(&self) -> HeartbeatState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> HeartbeatStatus {
        self.state.borrow().status
    }

    /// Ask the loop to stop at its next suspension point
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    /// Wait for the loop to end and return its final state
    pub async fn join(self) -> HeartbeatState {
        match self.task.await {
            Ok(state) => state,
            Err(e) => {
                warn!("Heartbeat task failed: {}", e);
                let mut state = self.state.borrow().clone();
                state.status = HeartbeatStatus::Stopped;
                state
            }
        }
    }
}
