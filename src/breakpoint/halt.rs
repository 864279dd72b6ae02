//! Halting breakpoints
//!
//! A [`HaltPoint`] stops the target and hands exactly one waiter a signal
//! per hit. A [`BarrierPoint`] is a halt point whose hit hook immediately
//! resumes the target, turning it into a "wait until passed here" gate.

use crate::breakpoint::{validate_location, Breakpoint, ReachedHook};
use crate::error::{Result, RigError};
use crate::target::Target;
use crate::utils::Value;
use async_trait::async_trait;
use futures::FutureExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, warn};

/// A breakpoint that halts the target and notifies a waiter
pub struct HaltPoint {
    target: Arc<Target>,
    location: String,
    number: u32,
    addr: String,
    hits: AtomicU64,
    /// Single-permit hand-off to at most one waiter; a second hit before
    /// the first signal is collected leaves one pending permit
    signal: Notify,
    on_reached: Option<ReachedHook>,
}

impl std::fmt::Debug for HaltPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaltPoint")
            .field("location", &self.location)
            .field("number", &self.number)
            .field("addr", &self.addr)
            .field("hits", &self.hits)
            .finish_non_exhaustive()
    }
}

impl HaltPoint {
    /// Insert a breakpoint at `location` and register it for dispatch.
    pub async fn new(target: &Arc<Target>, location: &str) -> Result<Arc<Self>> {
        Self::with_options(target, location, false, None).await
    }

    /// Insert with a temporary flag and/or a hit hook.
    pub async fn with_options(
        target: &Arc<Target>,
        location: &str,
        temporary: bool,
        on_reached: Option<ReachedHook>,
    ) -> Result<Arc<Self>> {
        validate_location(target, location)?;

        let args = if temporary { "-t " } else { "" };
        let payload = target
            .exec(&format!("-break-insert {}{}", args, location))
            .await
            .map_err(|e| {
                error!("Creating breakpoint at '{}' failed: {}", location, e);
                e
            })?;

        let bkpt = payload
            .as_ref()
            .and_then(|p| p.get("bkpt"))
            .ok_or_else(|| RigError::Registration("Invalid breakpoint information".to_string()))?;
        let number = bkpt
            .get_str("number")
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| {
                RigError::Registration("Breakpoint reply carries no usable number".to_string())
            })?;
        let addr = bkpt.get_str("addr").unwrap_or_default().to_string();

        let bp = Arc::new(Self {
            target: Arc::clone(target),
            location: location.to_string(),
            number,
            addr,
            hits: AtomicU64::new(0),
            signal: Notify::new(),
            on_reached,
        });
        target.dispatch().add(&bp);
        Ok(bp)
    }

    /// Debugger-assigned breakpoint number
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Resolved address reported at insertion time
    pub fn address(&self) -> &str {
        &self.addr
    }

    /// Hit handling, invoked by the dispatch loop.
    ///
    /// Waits until the debugger's internal state agrees the target is
    /// halted, runs the hook, then signals one waiter.
    pub(crate) async fn on_hit(&self) {
        self.hits.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = self.target.wait_halted(Duration::from_secs(1)).await {
            warn!("Halt point {}: target not confirmed halted: {}", self.location, e);
        }
        if let Err(e) = self.reached().await {
            warn!("Halt point {}: hit hook failed: {}", self.location, e);
        }
        self.signal.notify_one();
    }
}

#[async_trait]
impl Breakpoint for HaltPoint {
    fn location(&self) -> &str {
        &self.location
    }

    fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }

    async fn reached(&self) -> Result<()> {
        match &self.on_reached {
            Some(hook) => hook(Arc::clone(&self.target)).await,
            None => Ok(()),
        }
    }

    async fn wait_complete(&self, timeout: Option<Duration>) -> Result<()> {
        match timeout {
            Some(deadline) => tokio::time::timeout(deadline, self.signal.notified())
                .await
                .map_err(|_| {
                    RigError::Timeout(format!(
                        "Timeout while waiting to reach halt point at {}",
                        self.location
                    ))
                }),
            None => {
                self.signal.notified().await;
                Ok(())
            }
        }
    }

    async fn exec(&self, cmd: &str) -> Result<()> {
        // a halted target accepts ordinary commands
        self.target.exec(cmd).await.map(|_| ())
    }

    async fn eval(&self, expr: &str) -> Result<Value> {
        self.target.eval(expr).await
    }

    async fn ret(&self, ret_val: Option<&str>) -> Result<()> {
        self.target.ret(ret_val).await
    }

    async fn delete(&self) -> Result<()> {
        self.target.exec(&format!("-break-delete {}", self.number)).await?;
        self.target.dispatch().remove(self.number);
        Ok(())
    }
}

/// A halt point that resumes the target as soon as it is reached
pub struct BarrierPoint {
    inner: Arc<HaltPoint>,
}

impl std::fmt::Debug for BarrierPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarrierPoint").field("inner", &self.inner).finish()
    }
}

impl BarrierPoint {
    /// Create a barrier at `location`.
    ///
    /// Exactly one party may wait; any other count fails before the
    /// debugger is contacted.
    pub async fn new(target: &Arc<Target>, location: &str, parties: usize) -> Result<Self> {
        if parties != 1 {
            return Err(RigError::Unsupported(
                "Barrier points support exactly 1 party waiting for a location to be reached"
                    .to_string(),
            ));
        }

        let hook: ReachedHook =
            Arc::new(|target: Arc<Target>| async move { target.cont().await }.boxed());
        let inner = HaltPoint::with_options(target, location, false, Some(hook)).await?;
        Ok(Self { inner })
    }

    /// Block until the target has passed the barrier location.
    pub async fn cont_when_reached(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.wait_complete(timeout).await
    }

    /// The underlying halt point
    pub fn halt_point(&self) -> &Arc<HaltPoint> {
        &self.inner
    }
}

#[async_trait]
impl Breakpoint for BarrierPoint {
    fn location(&self) -> &str {
        self.inner.location()
    }

    fn hits(&self) -> u64 {
        self.inner.hits()
    }

    async fn reached(&self) -> Result<()> {
        self.inner.reached().await
    }

    async fn wait_complete(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.wait_complete(timeout).await
    }

    async fn exec(&self, cmd: &str) -> Result<()> {
        self.inner.exec(cmd).await
    }

    async fn eval(&self, expr: &str) -> Result<Value> {
        self.inner.eval(expr).await
    }

    async fn ret(&self, ret_val: Option<&str>) -> Result<()> {
        self.inner.ret(ret_val).await
    }

    async fn delete(&self) -> Result<()> {
        self.inner.delete().await
    }
}
