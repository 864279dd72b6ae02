//! MI transport router
//!
//! A single reader task drains the debugger's output for the session's
//! lifetime, completes pending token-keyed requests, hands console records
//! carrying companion response ids to their slots, and fans notifications
//! out to subscribers. Callers go through [`Router::send_sync`] /
//! [`Router::send_async`], which serialize writes and enforce the MI
//! context.

use crate::error::{Result, RigError};
use crate::mi::context::{ContextGuard, MiContext};
use crate::mi::record::{self, MiRecord, MiValue, ResultClass};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// First token used for MI commands
const MI_TOKEN_START: u64 = 1000;
/// First id used for companion commands answered via console records
const CLI_TOKEN_START: u64 = 8000;

/// Marker the companion script embeds in console responses
pub const CONSOLE_RESP_MARKER: &str = "TESTRIG_RESP";

/// Console lines without a response id land in this slot
pub const CONSOLE_DEFAULT_SLOT: u64 = 0;

const BENIGN_STOPPED_IN_CALL: &str = "stopped while in a function called from GDB";
const BENIGN_QXFER_REPLY: &str = "Unknown remote qXfer reply: OK";
const ERR_TARGET_RUNNING: &str = "Cannot execute this command while the target is running";

fn console_resp_id_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(&format!(r"{},\s*(\d+)", CONSOLE_RESP_MARKER)).unwrap())
}

/// Reader/writer pair connected to the debugger's machine interface.
///
/// In production these are the debugger process's stdio pipes; tests wire
/// up `tokio::io::duplex` halves.
pub struct MiLink {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl MiLink {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// An asynchronous event delivered to subscribers
#[derive(Debug, Clone)]
pub struct Notification {
    pub event: String,
    pub reason: Option<String>,
    pub payload: MiValue,
}

type SubKey = (String, Option<String>);

struct RouterInner {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    context: Arc<ContextGuard>,
    next_mi_token: AtomicU64,
    next_cli_token: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<MiRecord>>>,
    console_slots: Mutex<HashMap<u64, oneshot::Sender<String>>>,
    subscribers: Mutex<HashMap<SubKey, Vec<mpsc::UnboundedSender<Notification>>>>,
    unclaimed: Mutex<HashMap<SubKey, VecDeque<Notification>>>,
    alive: AtomicBool,
    trace_commands: bool,
    default_timeout: Option<Duration>,
}

/// Handle to the MI transport router
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
    reader_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Router {
    /// Start the reader task and return the router handle.
    pub fn spawn(
        link: MiLink,
        context: Arc<ContextGuard>,
        default_timeout: Option<Duration>,
        trace_commands: bool,
    ) -> Self {
        let inner = Arc::new(RouterInner {
            writer: tokio::sync::Mutex::new(link.writer),
            context,
            next_mi_token: AtomicU64::new(MI_TOKEN_START),
            next_cli_token: AtomicU64::new(CLI_TOKEN_START),
            pending: Mutex::new(HashMap::new()),
            console_slots: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            unclaimed: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
            trace_commands,
            default_timeout,
        });

        let loop_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            RouterInner::reader_loop(loop_inner, link.reader).await;
        });

        Self {
            inner,
            reader_task: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Whether the reader loop is still draining debugger output
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// Send a command without waiting for its result.
    ///
    /// Returns the token identifying the command. Fails with
    /// `ContextViolation` when the MI context is not `Normal`.
    pub async fn send_async(&self, cmd: &str) -> Result<u64> {
        self.check_context()?;
        let token = self.inner.next_mi_token.fetch_add(1, Ordering::SeqCst);
        self.write_command(token, cmd).await?;
        Ok(token)
    }

    /// Send a command and block until its result arrives.
    ///
    /// `Ok(Some(payload))` for successful results; `Ok(None)` when the
    /// debugger reported one of the known-benign error patterns (downgraded
    /// to a warning). `timeout` falls back to the configured default; on
    /// expiry the in-flight command is not cancelled, a late result is
    /// simply discarded.
    pub async fn send_sync(&self, cmd: &str, timeout: Option<Duration>) -> Result<Option<MiValue>> {
        self.check_context()?;
        if !self.is_alive() {
            return Err(RigError::Transport("MI reader loop has terminated".to_string()));
        }

        let token = self.inner.next_mi_token.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .insert(token, tx);

        if let Err(e) = self.write_command(token, cmd).await {
            self.inner
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&token);
            return Err(e);
        }

        let timeout = timeout.or(self.inner.default_timeout);
        let record = match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(res) => res,
                Err(_) => {
                    self.inner
                        .pending
                        .lock()
                        .expect("pending lock poisoned")
                        .remove(&token);
                    return Err(RigError::Timeout(format!(
                        "No result for command '{}' (token {}) within {:?}",
                        cmd, token, deadline
                    )));
                }
            },
            None => rx.await,
        }
        .map_err(|_| RigError::Transport("MI reader loop terminated while waiting".to_string()))?;

        self.interpret_result(cmd, record)
    }

    /// Run a companion command that answers through a console record.
    ///
    /// The allocated response id is appended to the command line; the
    /// companion echoes it back inside its `TESTRIG_RESP` marker.
    pub async fn console_request(&self, cmd: &str, timeout: Option<Duration>) -> Result<String> {
        let id = self.inner.next_cli_token.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner
            .console_slots
            .lock()
            .expect("console lock poisoned")
            .insert(id, tx);

        let mi_cmd = format!("-interpreter-exec console \"{} {}\"", cmd, id);
        if let Err(e) = self.send_sync(&mi_cmd, timeout).await {
            self.inner
                .console_slots
                .lock()
                .expect("console lock poisoned")
                .remove(&id);
            return Err(e);
        }

        let deadline = timeout
            .or(self.inner.default_timeout)
            .unwrap_or(Duration::from_secs(10));
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(line)) => Ok(line),
            Ok(Err(_)) => Err(RigError::Transport(
                "MI reader loop terminated while waiting for console response".to_string(),
            )),
            Err(_) => {
                self.inner
                    .console_slots
                    .lock()
                    .expect("console lock poisoned")
                    .remove(&id);
                Err(RigError::Timeout(format!(
                    "No console response for '{}' (id {}) within {:?}",
                    cmd, id, deadline
                )))
            }
        }
    }

    /// Subscribe to notifications with the given event name.
    ///
    /// `reason = None` is the wildcard: it receives events of any reason
    /// not claimed by a specific-reason subscriber, and additionally every
    /// event already delivered to a different specific subscriber.
    pub fn subscribe(&self, event: &str, reason: Option<&str>) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .entry((event.to_string(), reason.map(str::to_string)))
            .or_default()
            .push(tx);
        rx
    }

    /// Retrieve a notification nobody subscribed to at delivery time.
    pub fn take_unclaimed(&self, event: &str, reason: Option<&str>) -> Option<Notification> {
        self.inner
            .unclaimed
            .lock()
            .expect("unclaimed lock poisoned")
            .get_mut(&(event.to_string(), reason.map(str::to_string)))
            .and_then(VecDeque::pop_front)
    }

    /// Stop the reader loop. Pending waiters fail with a transport error.
    pub fn shutdown(&self) {
        self.inner.alive.store(false, Ordering::SeqCst);
        if let Some(handle) = self
            .reader_task
            .lock()
            .expect("reader task lock poisoned")
            .take()
        {
            handle.abort();
        }
        self.inner.pending.lock().expect("pending lock poisoned").clear();
        self.inner
            .console_slots
            .lock()
            .expect("console lock poisoned")
            .clear();
    }

    fn check_context(&self) -> Result<()> {
        match self.inner.context.current() {
            MiContext::Normal => Ok(()),
            MiContext::BpIntercept => Err(RigError::ContextViolation(
                "Cannot use normal commands while an intercept breakpoint handler is \
                 executing. Use the exec/eval methods of the intercept point instead."
                    .to_string(),
            )),
        }
    }

    async fn write_command(&self, token: u64, cmd: &str) -> Result<()> {
        if self.inner.trace_commands {
            debug!("{} mi write: {}", token, cmd);
        }
        let line = format!("{}{}\n", token, cmd);
        let mut writer = self.inner.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| RigError::Transport(format!("MI write failed: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| RigError::Transport(format!("MI flush failed: {}", e)))?;
        Ok(())
    }

    fn interpret_result(&self, cmd: &str, record: MiRecord) -> Result<Option<MiValue>> {
        let (class, payload) = match record {
            MiRecord::Result { class, payload, .. } => (class, payload),
            other => {
                return Err(RigError::Internal(format!(
                    "Non-result record delivered to a command slot: {:?}",
                    other
                )))
            }
        };

        match class {
            ResultClass::Done | ResultClass::Running | ResultClass::Connected | ResultClass::Exit => {
                Ok(Some(payload))
            }
            ResultClass::Error => {
                let msg = payload.get_str("msg").unwrap_or_default().to_string();
                if msg.contains(BENIGN_STOPPED_IN_CALL) {
                    warn!(
                        "Target execution was stopped by the debugger while evaluating a \
                         function. Likely cause: a halting breakpoint was hit during 'eval'. \
                         Use intercept points when evaluating across breakpoints."
                    );
                    Ok(None)
                } else if msg.contains(BENIGN_QXFER_REPLY) {
                    warn!("Received message: {}", msg);
                    Ok(None)
                } else if msg.contains(ERR_TARGET_RUNNING) {
                    Err(RigError::Command(format!(
                        "Target must be halted to execute '{}'",
                        cmd
                    )))
                } else {
                    Err(RigError::Command(msg))
                }
            }
        }
    }
}

impl RouterInner {
    async fn reader_loop(inner: Arc<RouterInner>, reader: Box<dyn AsyncRead + Send + Unpin>) {
        let mut lines = BufReader::new(reader).lines();

        loop {
            if !inner.alive.load(Ordering::SeqCst) {
                break;
            }
            match lines.next_line().await {
                Ok(Some(line)) => match record::parse_line(&line) {
                    Ok(Some(rec)) => inner.route(rec),
                    Ok(None) => {}
                    Err(e) => warn!("Dropping unparseable MI line '{}': {}", line, e),
                },
                Ok(None) => {
                    error!("MI transport closed by the debugger; session is dead");
                    break;
                }
                Err(e) => {
                    error!("MI transport I/O failure: {}; session is dead", e);
                    break;
                }
            }
        }

        inner.alive.store(false, Ordering::SeqCst);
        // wake all blocked senders with a transport error instead of
        // letting them sit out their full timeouts
        inner.pending.lock().expect("pending lock poisoned").clear();
        inner
            .console_slots
            .lock()
            .expect("console lock poisoned")
            .clear();
    }

    fn route(&self, record: MiRecord) {
        match record {
            MiRecord::Result { token, class, payload } => match token {
                Some(t) => {
                    let tx = self.pending.lock().expect("pending lock poisoned").remove(&t);
                    match tx {
                        Some(tx) => {
                            let _ = tx.send(MiRecord::Result { token, class, payload });
                        }
                        None => debug!("Discarding result for token {} (no waiter)", t),
                    }
                }
                None => warn!(
                    "Result record without token: class {:?}, payload {:?}",
                    class, payload
                ),
            },
            MiRecord::Notify { event, payload, .. } => {
                let reason = payload.get_str("reason").map(str::to_string);
                self.deliver_notification(Notification {
                    event,
                    reason,
                    payload,
                });
            }
            MiRecord::Console(text) => self.route_console(text),
            MiRecord::Target(text) => trace!("[target] {}", text.trim_end()),
            MiRecord::Log(text) => trace!("[log] {}", text.trim_end()),
            MiRecord::Prompt => {}
        }
    }

    fn route_console(&self, text: String) {
        let slot = if text.contains(CONSOLE_RESP_MARKER) {
            match console_resp_id_re()
                .captures(&text)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u64>().ok())
            {
                Some(id) => id,
                None => {
                    warn!("Console response marker without parseable id: {}", text.trim_end());
                    return;
                }
            }
        } else {
            CONSOLE_DEFAULT_SLOT
        };

        let tx = self
            .console_slots
            .lock()
            .expect("console lock poisoned")
            .remove(&slot);
        match tx {
            Some(tx) => {
                let _ = tx.send(text);
            }
            None if slot != CONSOLE_DEFAULT_SLOT => {
                debug!("Discarding console response for id {} (no waiter)", slot)
            }
            None => trace!("[console] {}", text.trim_end()),
        }
    }

    fn deliver_notification(&self, notif: Notification) {
        let mut delivered = false;
        {
            let mut subs = self.subscribers.lock().expect("subscriber lock poisoned");

            if notif.reason.is_some() {
                let key = (notif.event.clone(), notif.reason.clone());
                if let Some(list) = subs.get_mut(&key) {
                    list.retain(|tx| tx.send(notif.clone()).is_ok());
                    delivered |= !list.is_empty();
                }
            }

            // wildcard subscribers are distinct channels, so they were not
            // notified above and always get their copy
            let key = (notif.event.clone(), None);
            if let Some(list) = subs.get_mut(&key) {
                list.retain(|tx| tx.send(notif.clone()).is_ok());
                delivered |= !list.is_empty();
            }
        }

        if !delivered {
            self.unclaimed
                .lock()
                .expect("unclaimed lock poisoned")
                .entry((notif.event.clone(), notif.reason.clone()))
                .or_default()
                .push_back(notif);
        }
    }
}
