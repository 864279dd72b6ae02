//! Intercept breakpoints
//!
//! Both variants never halt the target from the test's point of view. The
//! command-list variant hands the companion script a fixed command batch to
//! run on every hit. The full variant opens a private loopback channel and
//! runs host code inside the paused execution context for the duration of
//! one HIT..FINISH_CONT turn.

use crate::breakpoint::{validate_location, Breakpoint};
use crate::error::{Result, RigError};
use crate::mi::context::MiContext;
use crate::target::Target;
use crate::utils::Value;
use crate::wire::{Frame, FrameType};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Companion command: register a fire-and-forget breakpoint (JSON array)
pub const CMD_INTERCEPT_CMDS: &str = "testrig-bp-intercept-cmds";
/// Companion command: register a full intercept breakpoint (TCP channel)
pub const CMD_INTERCEPT_TCP: &str = "testrig-bp-intercept-tcp";
/// Companion command: delete intercept breakpoints (no arg = all)
pub const CMD_INTERCEPT_DELETE: &str = "testrig-bp-intercept-delete";
/// Companion command: liveness probe answered via console record
pub const CMD_IS_RUNNING: &str = "testrig-is-running";

/// Hook run inside each intercept turn.
///
/// Receives the intercept point itself; `exec`/`eval`/`ret` on it go over
/// the private channel into the paused target context.
pub type InterceptHook =
    Arc<dyn Fn(Arc<InterceptPoint>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Fire-and-forget intercept: a command list run by the companion on every
/// hit, without halting the target
pub struct InterceptPointCmds {
    target: Arc<Target>,
    location: String,
}

impl InterceptPointCmds {
    pub async fn new(target: &Arc<Target>, location: &str, commands: &[&str]) -> Result<Self> {
        validate_location(target, location)?;

        let mut entries: Vec<&str> = vec![location];
        entries.extend_from_slice(commands);
        let json = serde_json::to_string(&entries)?;
        let escaped = json.replace('"', "\\\"");
        target.exec(&format!("{} {}", CMD_INTERCEPT_CMDS, escaped)).await?;

        Ok(Self {
            target: Arc::clone(target),
            location: location.to_string(),
        })
    }
}

#[async_trait]
impl Breakpoint for InterceptPointCmds {
    fn location(&self) -> &str {
        &self.location
    }

    fn hits(&self) -> u64 {
        warn!("A command intercept point does not report hit counts");
        0
    }

    async fn reached(&self) -> Result<()> {
        warn!("A command intercept point only executes the commands set in the constructor");
        Ok(())
    }

    async fn wait_complete(&self, _timeout: Option<Duration>) -> Result<()> {
        warn!("You can not wait for the completion of a command intercept point");
        Ok(())
    }

    async fn exec(&self, _cmd: &str) -> Result<()> {
        warn!("A command intercept point only executes the commands set in the constructor");
        Ok(())
    }

    async fn eval(&self, _expr: &str) -> Result<Value> {
        warn!("A command intercept point only executes the commands set in the constructor");
        Err(RigError::Unsupported(
            "eval is not available on a command intercept point".to_string(),
        ))
    }

    async fn ret(&self, _ret_val: Option<&str>) -> Result<()> {
        warn!("A command intercept point only executes the commands set in the constructor");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.target
            .cli_exec(&format!("{} {}", CMD_INTERCEPT_DELETE, self.location))
            .await
            .map(|_| ())
    }
}

struct TurnRequest {
    frame: Frame,
    resp: oneshot::Sender<Result<Frame>>,
}

/// Full intercept breakpoint with a private channel into the paused target
/// context
pub struct InterceptPoint {
    target: Arc<Target>,
    location: String,
    holder_id: String,
    hits: AtomicU64,
    running: AtomicBool,
    turn_active: AtomicBool,
    /// auto-reset completion signal for `wait_complete`
    complete: Notify,
    shutdown: Notify,
    req_tx: mpsc::Sender<TurnRequest>,
    default_wait: Duration,
    teardown_timeout: Duration,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for InterceptPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptPoint")
            .field("location", &self.location)
            .field("holder_id", &self.holder_id)
            .field("hits", &self.hits)
            .finish_non_exhaustive()
    }
}

impl InterceptPoint {
    /// Register the breakpoint with the companion and start its turn loop.
    ///
    /// The host listens on the configured loopback port before instructing
    /// the companion to connect; exactly one connection is accepted. No
    /// connection within the accept timeout fails the registration.
    pub async fn new(
        target: &Arc<Target>,
        location: &str,
        hook: Option<InterceptHook>,
    ) -> Result<Arc<Self>> {
        validate_location(target, location)?;

        let cfg = target.config().intercept.clone();
        let listener = TcpListener::bind(("127.0.0.1", cfg.port)).await.map_err(|e| {
            RigError::Registration(format!(
                "Failed to bind intercept port {}: {}",
                cfg.port, e
            ))
        })?;

        target
            .cli_exec(&format!("{} {}", CMD_INTERCEPT_TCP, location))
            .await?;

        let accept_timeout = Duration::from_millis(cfg.accept_timeout_ms);
        let (stream, _) = tokio::time::timeout(accept_timeout, listener.accept())
            .await
            .map_err(|_| {
                RigError::Registration(format!(
                    "Companion did not connect back for '{}' within {:?}",
                    location, accept_timeout
                ))
            })?
            .map_err(|e| {
                RigError::Registration(format!("Accepting intercept connection failed: {}", e))
            })?;
        drop(listener);

        // one request in flight per channel
        let (req_tx, req_rx) = mpsc::channel(1);

        let bp = Arc::new(Self {
            target: Arc::clone(target),
            location: location.to_string(),
            holder_id: uuid::Uuid::new_v4().to_string(),
            hits: AtomicU64::new(0),
            running: AtomicBool::new(true),
            turn_active: AtomicBool::new(false),
            complete: Notify::new(),
            shutdown: Notify::new(),
            req_tx,
            default_wait: Duration::from_millis(cfg.default_wait_timeout_ms),
            teardown_timeout: Duration::from_millis(cfg.teardown_timeout_ms),
            loop_task: Mutex::new(None),
        });

        target.intercepts().register(&bp);

        let task = tokio::spawn(Self::turn_loop(Arc::clone(&bp), stream, req_rx, hook));
        *bp.loop_task.lock().expect("loop task lock poisoned") = Some(task);
        Ok(bp)
    }

    async fn turn_loop(
        bp: Arc<Self>,
        mut stream: TcpStream,
        mut req_rx: mpsc::Receiver<TurnRequest>,
        hook: Option<InterceptHook>,
    ) {
        while bp.running.load(Ordering::SeqCst) {
            let frame = tokio::select! {
                _ = bp.shutdown.notified() => break,
                res = Frame::read_from(&mut stream) => match res {
                    Ok(frame) => frame,
                    Err(e) => {
                        if bp.running.swap(false, Ordering::SeqCst) {
                            warn!("Intercept point {}: channel error: {}", bp.location, e);
                        }
                        break;
                    }
                },
            };

            if frame.frame_type() != FrameType::Hit {
                warn!(
                    "Intercept point {}: received {:?} frame while waiting for Hit",
                    bp.location,
                    frame.frame_type()
                );
            }
            bp.hits.fetch_add(1, Ordering::SeqCst);

            let context = bp.target.context();
            match context.acquire(&bp.holder_id, MiContext::BpIntercept) {
                Ok(()) => {
                    bp.turn_active.store(true, Ordering::SeqCst);
                    if let Some(hook) = &hook {
                        let mut hook_fut = hook(Arc::clone(&bp));
                        // serve the hook's channel requests while it runs
                        loop {
                            tokio::select! {
                                res = &mut hook_fut => {
                                    if let Err(e) = res {
                                        warn!(
                                            "Intercept point {}: handler failed, letting the \
                                             target continue anyway: {}",
                                            bp.location, e
                                        );
                                    }
                                    break;
                                }
                                Some(req) = req_rx.recv() => {
                                    let resp = Self::roundtrip(&mut stream, req.frame).await;
                                    let _ = req.resp.send(resp);
                                }
                            }
                        }
                    }
                    bp.turn_active.store(false, Ordering::SeqCst);
                    if let Err(e) = context.release(&bp.holder_id) {
                        warn!("Intercept point {}: context release failed: {}", bp.location, e);
                    }
                }
                Err(e) => {
                    warn!(
                        "Intercept point {}: could not take over the command context, \
                         resuming target without running the handler: {}",
                        bp.location, e
                    );
                }
            }

            if let Err(e) = Frame::new(FrameType::FinishCont).write_to(&mut stream).await {
                warn!("Intercept point {}: resume message failed: {}", bp.location, e);
                bp.running.store(false, Ordering::SeqCst);
                bp.complete.notify_one();
                break;
            }
            bp.complete.notify_one();
        }

        // fail any request stranded by the loop ending
        req_rx.close();
        while let Ok(req) = req_rx.try_recv() {
            let _ = req.resp.send(Err(RigError::Transport(
                "Intercept channel closed".to_string(),
            )));
        }
        debug!("Intercept point {}: turn loop ended", bp.location);
    }

    async fn roundtrip(stream: &mut TcpStream, frame: Frame) -> Result<Frame> {
        frame.write_to(stream).await?;
        Frame::read_from(stream).await
    }

    /// One request/response exchange within the current turn
    async fn request(&self, frame: Frame) -> Result<Frame> {
        if !self.turn_active.load(Ordering::SeqCst) {
            return Err(RigError::ContextViolation(
                "exec/eval on an intercept point is only valid from its handler while a \
                 turn is in progress"
                    .to_string(),
            ));
        }
        let (tx, rx) = oneshot::channel();
        self.req_tx
            .send(TurnRequest { frame, resp: tx })
            .await
            .map_err(|_| RigError::Transport("Intercept turn loop terminated".to_string()))?;
        rx.await
            .map_err(|_| RigError::Transport("Intercept request was dropped".to_string()))?
    }
}

#[async_trait]
impl Breakpoint for InterceptPoint {
    fn location(&self) -> &str {
        &self.location
    }

    fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }

    /// The per-hit behavior is the hook supplied at construction; calling
    /// this directly does nothing.
    async fn reached(&self) -> Result<()> {
        Ok(())
    }

    async fn wait_complete(&self, timeout: Option<Duration>) -> Result<()> {
        // without an explicit deadline a high override timeout prevents
        // getting stuck when the location is never reached
        let (deadline, overridden) = match timeout {
            Some(t) => (t, false),
            None => (self.default_wait, true),
        };

        match tokio::time::timeout(deadline, self.complete.notified()).await {
            Ok(()) => Ok(()),
            Err(_) if overridden => Err(RigError::Timeout(format!(
                "Breakpoint {} not reached after override timeout of {:?}",
                self.location, deadline
            ))),
            Err(_) => Err(RigError::Timeout(format!(
                "Breakpoint {} not reached after timeout of {:?}",
                self.location, deadline
            ))),
        }
    }

    async fn exec(&self, cmd: &str) -> Result<()> {
        let resp = self
            .request(Frame::with_payload(FrameType::Exec, cmd.as_bytes()))
            .await?;
        match resp.frame_type() {
            FrameType::Except => Err(RigError::Command(format!(
                "Execution of command \"{}\" in breakpoint context failed: {}",
                cmd,
                resp.payload_text()
            ))),
            _ => Ok(()),
        }
    }

    async fn eval(&self, expr: &str) -> Result<Value> {
        let resp = self
            .request(Frame::with_payload(FrameType::Eval, expr.as_bytes()))
            .await?;
        if resp.frame_type() == FrameType::Except {
            return Err(RigError::Command(format!(
                "Evaluation of \"{}\" in breakpoint context failed: {}",
                expr,
                resp.payload_text()
            )));
        }

        let text = resp.payload_text();
        if text.contains("<optimized out>") {
            warn!("Accessed entity {} is optimized out in the binary", expr);
        }
        Ok(Value::parse(&text))
    }

    async fn ret(&self, ret_val: Option<&str>) -> Result<()> {
        match ret_val {
            Some(val) => self.exec(&format!("return {}", val)).await,
            None => self.exec("return").await,
        }
    }

    /// Best-effort teardown: deregister with the companion, close the
    /// channel, join the loop, drop out of the live-set. Failures along the
    /// way are logged, never raised.
    async fn delete(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            // already deleted, or the channel died earlier; keep the
            // live-set consistent either way
            self.target.intercepts().unregister(self);
            return Ok(());
        }

        if let Err(e) = self
            .target
            .cli_exec_timeout(
                &format!("{} {}", CMD_INTERCEPT_DELETE, self.location),
                Some(self.teardown_timeout),
            )
            .await
        {
            debug!("Intercept point {}: companion deregistration failed: {}", self.location, e);
        }

        self.shutdown.notify_one();
        let task = self.loop_task.lock().expect("loop task lock poisoned").take();
        if let Some(task) = task {
            if tokio::time::timeout(self.teardown_timeout, task).await.is_err() {
                warn!(
                    "Intercept point {}: turn loop did not stop within {:?}",
                    self.location, self.teardown_timeout
                );
            }
        }

        self.target.intercepts().unregister(self);
        Ok(())
    }
}

/// Session-wide live-set of full intercept points
#[derive(Default)]
pub struct InterceptRegistry {
    points: Mutex<Vec<Arc<InterceptPoint>>>,
}

impl InterceptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Vec<Arc<InterceptPoint>> {
        self.points.lock().expect("intercept registry poisoned").clone()
    }

    pub(crate) fn register(&self, bp: &Arc<InterceptPoint>) {
        self.points
            .lock()
            .expect("intercept registry poisoned")
            .push(Arc::clone(bp));
    }

    pub(crate) fn unregister(&self, bp: &InterceptPoint) {
        self.points
            .lock()
            .expect("intercept registry poisoned")
            .retain(|p| !std::ptr::eq(Arc::as_ptr(p), bp as *const _));
    }

    /// Number of live intercept points
    pub fn live_count(&self) -> usize {
        self.points.lock().expect("intercept registry poisoned").len()
    }

    /// Delete every live intercept point; used at session teardown.
    ///
    /// Logs a leak warning when an instance resists deletion.
    pub async fn delete_all(&self) {
        for bp in self.snapshot() {
            if let Err(e) = bp.delete().await {
                warn!("Intercept point {}: delete failed: {}", bp.location(), e);
            }
        }
        if self.live_count() != 0 {
            warn!("Not all intercept points were deleted!");
        }
    }
}
