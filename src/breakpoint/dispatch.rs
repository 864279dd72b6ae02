//! Stop-notification dispatch
//!
//! Routes "breakpoint hit" stop notifications to the owning halt point by
//! debugger-assigned number. Runs its own loop with a short receive
//! timeout so a stop request is observed promptly even when the debugger
//! is quiet.

use crate::breakpoint::halt::HaltPoint;
use crate::mi::router::{Notification, Router};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const POLL_SLICE: Duration = Duration::from_millis(100);

/// Registry and dispatch loop for live halt points
pub struct BreakpointDispatch {
    // weak so a dropped-but-undeleted breakpoint does not outlive its owner
    registry: Mutex<HashMap<u32, Weak<HaltPoint>>>,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BreakpointDispatch {
    /// Subscribe to breakpoint-hit stops and start the dispatch loop.
    pub fn spawn(router: &Router) -> Arc<Self> {
        let rx = router.subscribe("stopped", Some("breakpoint-hit"));
        let this = Arc::new(Self {
            registry: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            task: Mutex::new(None),
        });

        let loop_this = Arc::clone(&this);
        let handle = tokio::spawn(async move {
            loop_this.run(rx).await;
        });
        *this.task.lock().expect("dispatch task lock poisoned") = Some(handle);
        this
    }

    /// Register a halt point under its debugger-assigned number.
    ///
    /// Re-registering a number replaces the previous entry; new hits go to
    /// the new instance.
    pub fn add(&self, bp: &Arc<HaltPoint>) {
        self.registry
            .lock()
            .expect("registry lock poisoned")
            .insert(bp.number(), Arc::downgrade(bp));
    }

    /// Remove a halt point by number.
    pub fn remove(&self, number: u32) {
        self.registry
            .lock()
            .expect("registry lock poisoned")
            .remove(&number);
    }

    /// Number of registered halt points
    pub fn len(&self) -> usize {
        self.registry.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask the dispatch loop to exit at its next poll slice.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Notification>) {
        while !self.stopped.load(Ordering::SeqCst) {
            match tokio::time::timeout(POLL_SLICE, rx.recv()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(notif)) => self.dispatch(notif).await,
            }
        }
        debug!("Breakpoint dispatch loop stopped");
    }

    async fn dispatch(&self, notif: Notification) {
        let number = match notif
            .payload
            .get_str("bkptno")
            .and_then(|n| n.parse::<u32>().ok())
        {
            Some(n) => n,
            None => {
                warn!("Breakpoint-hit stop without a usable bkptno: {:?}", notif.payload);
                return;
            }
        };

        let bp = self
            .registry
            .lock()
            .expect("registry lock poisoned")
            .get(&number)
            .and_then(Weak::upgrade);

        match bp {
            Some(bp) => bp.on_hit().await,
            None => {
                warn!(
                    "Breakpoint number {} not found in the registry of known breakpoints",
                    number
                );
            }
        }
    }
}
