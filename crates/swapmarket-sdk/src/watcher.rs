//! `PollDriver`: runs a [`PollTarget`] on a fixed cadence.
//!
//! The target does blocking chain and custody I/O, so every tick runs on
//! `spawn_blocking` behind an `Arc<Mutex<_>>`. A tick that finds the mutex
//! still held by the previous one is skipped, so at most one step is ever
//! in flight. The caller talks to the driver through `tokio::sync::mpsc`.

use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::lifecycle::{LifecycleState, PollTarget};

// ── Public types ────────────────────────────────────────────────────

/// Commands sent to the driver task.
#[derive(Debug)]
pub enum PollCmd {
    /// Forward a withdrawal address to the target.
    SetWithdrawalAddress(String),
    Shutdown,
}

/// Events emitted by the driver task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    StateChanged(LifecycleState),
    /// A tick fired while the previous one was still running.
    TickSkipped,
    /// The target reached a terminal state; the driver has exited.
    Finished(LifecycleState),
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between ticks (default: 5s).
    pub poll_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Handle for sending commands to a running driver.
#[derive(Clone)]
pub struct PollHandle {
    cmd_tx: UnboundedSender<PollCmd>,
}

impl PollHandle {
    pub fn set_withdrawal_address(&self, address: impl Into<String>) {
        let _ = self
            .cmd_tx
            .send(PollCmd::SetWithdrawalAddress(address.into()));
    }

    /// Stop the driver. A tick already running finishes first.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(PollCmd::Shutdown);
    }
}

fn lock<T>(target: &Mutex<T>) -> MutexGuard<'_, T> {
    target.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Spawn ───────────────────────────────────────────────────────────

/// Spawn the driver on the current tokio runtime.
///
/// The join handle resolves to the shared target once the driver stops.
pub fn spawn_poll_driver<T: PollTarget>(
    target: T,
    config: PollConfig,
) -> (
    PollHandle,
    UnboundedReceiver<PollEvent>,
    JoinHandle<Arc<Mutex<T>>>,
) {
    let (cmd_tx, cmd_rx) = unbounded_channel();
    let (event_tx, event_rx) = unbounded_channel();
    let target = Arc::new(Mutex::new(target));
    let join = tokio::spawn(driver_main(target, config, cmd_rx, event_tx));
    (PollHandle { cmd_tx }, event_rx, join)
}

async fn driver_main<T: PollTarget>(
    target: Arc<Mutex<T>>,
    config: PollConfig,
    mut cmd_rx: UnboundedReceiver<PollCmd>,
    event_tx: UnboundedSender<PollEvent>,
) -> Arc<Mutex<T>> {
    let mut interval = tokio::time::interval(config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let (state_tx, mut state_rx) = unbounded_channel::<LifecycleState>();
    let mut last = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(PollCmd::SetWithdrawalAddress(address)) => {
                    let target = target.clone();
                    let _ = tokio::task::spawn_blocking(move || {
                        lock(&target).set_withdrawal_address(address);
                    })
                    .await;
                }
                Some(PollCmd::Shutdown) => {
                    log::info!("poll_driver: shutting down");
                    break;
                }
                None => {
                    log::info!("poll_driver: command channel closed, shutting down");
                    break;
                }
            },
            _ = interval.tick() => {
                let target = target.clone();
                let state_tx = state_tx.clone();
                let event_tx = event_tx.clone();
                tokio::task::spawn_blocking(move || match target.try_lock() {
                    Ok(mut guard) => {
                        let _ = state_tx.send(guard.tick());
                    }
                    Err(TryLockError::Poisoned(e)) => {
                        let _ = state_tx.send(e.into_inner().tick());
                    }
                    Err(TryLockError::WouldBlock) => {
                        log::debug!("poll_driver: previous tick still running, skipping");
                        let _ = event_tx.send(PollEvent::TickSkipped);
                    }
                });
            },
            Some(state) = state_rx.recv() => {
                if last != Some(state) {
                    log::debug!("poll_driver: {last:?} -> {state:?}");
                    last = Some(state);
                    let _ = event_tx.send(PollEvent::StateChanged(state));
                }
                if state.is_terminal() {
                    let _ = event_tx.send(PollEvent::Finished(state));
                    break;
                }
            },
        }
    }
    target
}

// ── Tests ───────────────────────────────────────────────────────────
