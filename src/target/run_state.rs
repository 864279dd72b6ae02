//! Target run-state tracking
//!
//! The halted/running classification is authoritative only via the
//! debugger's asynchronous notifications; it is never inferred from
//! command results. A single state task consumes those notifications and
//! is the only writer of the state flag; everyone else observes
//! transitions through watch subscriptions.

use crate::mi::router::Router;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Current run state, written only by the state task
pub struct RunState {
    tx: watch::Sender<bool>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn is_running(&self) -> bool {
        *self.tx.borrow()
    }

    /// Observe state transitions. The receiver starts with the current
    /// value marked as seen.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.tx.send_replace(running);
    }
}

/// Start the task applying run-state side effects of notifications.
///
/// Delivery happens over unbounded subscriptions, so the router's reader
/// loop is never blocked by this work.
pub(crate) fn spawn_state_task(
    router: &Router,
    state: std::sync::Arc<RunState>,
    probe_window: Duration,
) -> JoinHandle<()> {
    let mut stopped_rx = router.subscribe("stopped", None);
    let mut running_rx = router.subscribe("running", None);
    let router = router.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = stopped_rx.recv() => match msg {
                    None => break,
                    Some(_) => {
                        // a 'stopped' notification is not always in sync
                        // with the debugger's internal target state; poll
                        // until it agrees before exposing the transition
                        confirm_halted(&router, probe_window).await;
                        state.set_running(false);
                    }
                },
                msg = running_rx.recv() => match msg {
                    None => break,
                    Some(_) => state.set_running(true),
                },
            }
        }
        debug!("Run-state task stopped");
    })
}

/// Poll an info command until the debugger accepts it, meaning the target
/// really is halted.
async fn confirm_halted(router: &Router, window: Duration) {
    let start = tokio::time::Instant::now();
    while start.elapsed() <= window {
        match router.send_sync("-thread-info", Some(window)).await {
            Ok(_) => return,
            Err(_) => tokio::time::sleep(Duration::from_millis(1)).await,
        }
    }
    warn!(
        "Target not halted within {:?} despite being reported as stopped",
        window
    );
}
