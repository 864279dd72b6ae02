//! Target session
//!
//! One [`Target`] represents one device under test behind one debugger
//! connection. It owns the MI router, the context guard, breakpoint
//! dispatch, the intercept live-set and the run-state machine, and exposes
//! the command surface test code talks to.

pub mod run_state;

pub use run_state::RunState;

use crate::breakpoint::dispatch::BreakpointDispatch;
use crate::breakpoint::intercept::{InterceptRegistry, CMD_INTERCEPT_DELETE, CMD_IS_RUNNING};
use crate::config::Config;
use crate::error::{Result, RigError};
use crate::mi::context::ContextGuard;
use crate::mi::router::{MiLink, Router};
use crate::mi::MiValue;
use crate::symbols::SymbolLookup;
use crate::utils::{xpsr_in_it_block, Value};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Companion script sourced into the debugger's embedded interpreter
const COMPANION_SCRIPT: &str = include_str!("../../companion/testrig_gdb.py");

/// A target device under test
pub struct Target {
    config: Config,
    context: Arc<ContextGuard>,
    router: Router,
    dispatch: Arc<BreakpointDispatch>,
    intercepts: InterceptRegistry,
    run_state: Arc<RunState>,
    symbols: Option<Arc<dyn SymbolLookup>>,
    connected: AtomicBool,
    state_task: Mutex<Option<JoinHandle<()>>>,
}

impl Target {
    /// Connect over an established MI transport.
    ///
    /// Spawns the router, run-state and dispatch loops, switches the
    /// debugger to asynchronous mode, optionally selects the configured
    /// remote debug server and sources the companion script.
    pub async fn connect(
        link: MiLink,
        config: Config,
        symbols: Option<Arc<dyn SymbolLookup>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let context = Arc::new(ContextGuard::new());
        let default_timeout = config.transport.default_timeout_ms.map(Duration::from_millis);
        let router = Router::spawn(
            link,
            Arc::clone(&context),
            default_timeout,
            config.transport.trace_commands,
        );

        let run_state = Arc::new(RunState::new());
        let state_task = run_state::spawn_state_task(
            &router,
            Arc::clone(&run_state),
            Duration::from_millis(config.run_control.halted_probe_window_ms),
        );
        let dispatch = BreakpointDispatch::spawn(&router);

        let target = Arc::new(Self {
            config,
            context,
            router,
            dispatch,
            intercepts: InterceptRegistry::new(),
            run_state,
            symbols,
            connected: AtomicBool::new(false),
            state_task: Mutex::new(Some(state_task)),
        });

        target
            .exec_timeout("-gdb-set mi-async on", Some(Duration::from_secs(5)))
            .await?;
        if let Some(addr) = target.config.transport.remote_addr.clone() {
            target
                .exec_timeout(
                    &format!("-target-select remote {}", addr),
                    Some(Duration::from_secs(5)),
                )
                .await?;
        }
        target
            .cli_exec_timeout("set mem inaccessible-by-default off", Some(Duration::from_secs(1)))
            .await?;
        target.source_companion().await?;

        target.connected.store(true, Ordering::SeqCst);
        info!("Target session established");
        Ok(target)
    }

    /// Write the embedded companion script to a temp file and source it.
    async fn source_companion(&self) -> Result<()> {
        let script = COMPANION_SCRIPT.replace(
            "SERVER_PORT = 20080",
            &format!("SERVER_PORT = {}", self.config.intercept.port),
        );

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(script.as_bytes())?;
        file.flush()?;

        // the debugger wants forward slashes regardless of host platform
        let path = file.path().to_string_lossy().replace('\\', "/");
        self.cli_exec(&format!("source {}", path)).await?;
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////
    // Accessors

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn context(&self) -> &Arc<ContextGuard> {
        &self.context
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn dispatch(&self) -> &Arc<BreakpointDispatch> {
        &self.dispatch
    }

    pub fn intercepts(&self) -> &InterceptRegistry {
        &self.intercepts
    }

    pub fn symbols(&self) -> Option<&Arc<dyn SymbolLookup>> {
        self.symbols.as_ref()
    }

    ///////////////////////////////////////////////////////////////////////
    // Command execution and evaluation

    /// Run an MI command and wait for its result.
    pub async fn exec(&self, cmd: &str) -> Result<Option<MiValue>> {
        self.router.send_sync(cmd, None).await
    }

    /// Run an MI command with an explicit timeout.
    pub async fn exec_timeout(
        &self,
        cmd: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<MiValue>> {
        self.router.send_sync(cmd, timeout).await
    }

    /// Send an MI command without waiting; returns the command token.
    pub async fn exec_noblock(&self, cmd: &str) -> Result<u64> {
        self.router.send_async(cmd).await
    }

    /// Run a console command through the MI interpreter-exec wrapper.
    pub async fn cli_exec(&self, cmd: &str) -> Result<Option<MiValue>> {
        self.cli_exec_timeout(cmd, None).await
    }

    pub async fn cli_exec_timeout(
        &self,
        cmd: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<MiValue>> {
        self.router
            .send_sync(&format!("-interpreter-exec console \"{}\"", cmd), timeout)
            .await
    }

    /// Evaluate an expression in the current program context.
    ///
    /// Valid expressions are anything the halted program context resolves:
    /// registers (`$sp`), variables, dereferences, assignments, or function
    /// calls (`my_func(99)`). The textual result is smart-cast to a
    /// [`Value`].
    pub async fn eval(&self, expr: &str) -> Result<Value> {
        let payload = self
            .exec(&format!("-data-evaluate-expression \"{}\"", expr))
            .await?;
        let payload = payload.ok_or_else(|| {
            warn!("Eval of {} did not succeed (no result)", expr);
            RigError::Command(format!("Evaluation of '{}' produced no result", expr))
        })?;
        let text = payload.get_str("value").ok_or_else(|| {
            RigError::Command(format!("Evaluation of '{}' returned no value", expr))
        })?;

        if text.contains("<optimized out>") {
            warn!("Accessed entity {} is optimized out in the target binary", expr);
        }
        Ok(Value::parse(text))
    }

    /// Return from the current function, optionally forcing a value.
    pub async fn ret(&self, ret_val: Option<&str>) -> Result<()> {
        match ret_val {
            // MI's -exec-return does not accept a value; the console
            // command does
            Some(val) => self.cli_exec(&format!("return {}", val)).await.map(|_| ()),
            None => self.exec("-exec-return").await.map(|_| ()),
        }
    }

    ///////////////////////////////////////////////////////////////////////
    // Run control

    pub fn is_running(&self) -> bool {
        self.run_state.is_running()
    }

    /// Resume the target and wait until it reports running.
    ///
    /// The continue command is re-issued each poll slice until the running
    /// notification arrives or the retry budget is exhausted.
    pub async fn cont(&self) -> Result<()> {
        let slice = Duration::from_millis(self.config.run_control.state_poll_ms);
        let mut rx = self.run_state.subscribe();
        let mut tries = self.config.run_control.cont_retries;

        while !self.is_running() && tries > 0 {
            self.exec_noblock("-exec-continue").await?;
            let _ = tokio::time::timeout(slice, rx.changed()).await;
            tries -= 1;
        }
        if !self.is_running() {
            return Err(RigError::TargetState(
                "Target execution could not be continued".to_string(),
            ));
        }

        let settle = self.config.run_control.settle_delay_ms;
        if settle > 0 {
            tokio::time::sleep(Duration::from_millis(settle)).await;
        }
        Ok(())
    }

    /// Halt the target and wait until it reports stopped.
    ///
    /// Afterwards the core is stepped out of any pending IT block, since
    /// function-call evaluation is unsafe mid-block.
    pub async fn halt(&self) -> Result<()> {
        self.halt_with_options(false).await
    }

    /// Halt, optionally staying inside an IT block.
    ///
    /// With `stay_in_it_block` the caller takes over the responsibility of
    /// either stepping clear or masking the xPSR IT bits around any
    /// function-call evaluation.
    pub async fn halt_with_options(&self, stay_in_it_block: bool) -> Result<()> {
        let slice = Duration::from_millis(self.config.run_control.state_poll_ms);
        let mut rx = self.run_state.subscribe();
        let mut tries = self.config.run_control.halt_retries;

        while self.is_running() && tries > 0 {
            self.exec_noblock("-exec-interrupt --all").await?;
            let _ = tokio::time::timeout(slice, rx.changed()).await;
            tries -= 1;
        }
        if self.is_running() {
            return Err(RigError::TargetState(
                "Target execution could not be halted".to_string(),
            ));
        }

        if !stay_in_it_block {
            let mut budget = self.config.run_control.it_block_step_limit;
            loop {
                let xpsr = self.eval("$xpsr").await?.as_int().unwrap_or(0) as u32;
                if !xpsr_in_it_block(xpsr) {
                    break;
                }
                if budget == 0 {
                    return Err(RigError::TargetState(
                        "Target did not leave the IT block within the step limit".to_string(),
                    ));
                }
                self.step_inst().await?;
                budget -= 1;
            }
        }
        Ok(())
    }

    /// Step one source line.
    pub async fn step(&self) -> Result<()> {
        self.step_cmd("-exec-next").await
    }

    /// Step one instruction.
    pub async fn step_inst(&self) -> Result<()> {
        self.step_cmd("-exec-next-instruction").await
    }

    async fn step_cmd(&self, cmd: &str) -> Result<()> {
        // step completion surfaces as an ordinary stop notification;
        // subscribe before issuing so the edge cannot be missed
        let mut stops = self.router.subscribe("stopped", None);
        self.exec(cmd).await?;
        if stops.recv().await.is_none() {
            return Err(RigError::Transport(
                "MI reader loop terminated during step".to_string(),
            ));
        }
        // let the state task finish applying the transition
        self.wait_halted(Duration::from_secs(1)).await
    }

    /// Wait until the target is halted.
    ///
    /// Does not halt the target itself; pair with [`Target::halt`].
    pub async fn wait_halted(&self, window: Duration) -> Result<()> {
        let mut rx = self.run_state.subscribe();
        let wait = async {
            loop {
                if !*rx.borrow_and_update() {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(RigError::Transport("Run-state task terminated".to_string()));
                }
            }
        };
        match tokio::time::timeout(window, wait).await {
            Ok(res) => res,
            Err(_) => Err(RigError::Timeout(format!(
                "Target did not change to halted state within {:?}",
                window
            ))),
        }
    }

    /// Reset the target via the debug server and drop stale register state.
    pub async fn reset(&self) -> Result<()> {
        self.cli_exec("monitor reset").await?;
        self.flush_reg_cache().await
    }

    ///////////////////////////////////////////////////////////////////////
    // Breakpoint-related commands

    /// Remove every breakpoint: companion intercepts, debugger breakpoints
    /// and debug-server hardware breakpoints.
    pub async fn bp_clear_all(&self) -> Result<()> {
        self.cli_exec(CMD_INTERCEPT_DELETE).await?;
        self.exec("-break-delete").await?;
        self.cli_exec("monitor clrbp").await?;
        Ok(())
    }

    /// Number of breakpoints the debugger currently lists
    pub async fn bp_count(&self) -> Result<u32> {
        let payload = self
            .exec("-break-list")
            .await?
            .ok_or_else(|| RigError::Command("break-list produced no result".to_string()))?;
        payload
            .get("BreakpointTable")
            .and_then(|t| t.get_str("nr_rows"))
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| RigError::Command("break-list reply has no row count".to_string()))
    }

    ///////////////////////////////////////////////////////////////////////
    // Register access

    /// Register contents, optionally restricted to the given register
    /// numbers. `fmt` is the usual format letter (`x`, `d`, ...).
    pub async fn reg_values(&self, fmt: &str, regs: &[u32]) -> Result<MiValue> {
        let regs = regs.iter().map(u32::to_string).collect::<Vec<_>>().join(" ");
        let payload = self
            .exec(&format!(
                "-data-list-register-values --skip-unavailable {} {}",
                fmt, regs
            ))
            .await?
            .ok_or_else(|| RigError::Command("register read produced no result".to_string()))?;
        payload
            .get("register-values")
            .cloned()
            .ok_or_else(|| RigError::Command("register reply has no values".to_string()))
    }

    pub async fn reg_names(&self) -> Result<MiValue> {
        let payload = self
            .exec("-data-list-register-names")
            .await?
            .ok_or_else(|| RigError::Command("register names produced no result".to_string()))?;
        payload
            .get("register-names")
            .cloned()
            .ok_or_else(|| RigError::Command("register reply has no names".to_string()))
    }

    pub async fn reg_changed(&self) -> Result<MiValue> {
        let payload = self
            .exec("-data-list-changed-registers")
            .await?
            .ok_or_else(|| RigError::Command("changed registers produced no result".to_string()))?;
        payload
            .get("changed-registers")
            .cloned()
            .ok_or_else(|| RigError::Command("register reply has no change list".to_string()))
    }

    /// Drop the debugger's register cache after out-of-band target changes.
    pub async fn flush_reg_cache(&self) -> Result<()> {
        self.cli_exec("flushregs").await.map(|_| ())
    }

    ///////////////////////////////////////////////////////////////////////
    // Companion liveness

    /// Ask the companion script whether the target is currently running.
    ///
    /// Doubles as a liveness probe of the companion itself.
    pub async fn probe_target_running(&self) -> Result<bool> {
        let line = self.router.console_request(CMD_IS_RUNNING, None).await?;
        Ok(line.contains("YES"))
    }

    ///////////////////////////////////////////////////////////////////////
    // Lifecycle

    /// Tear the session down.
    ///
    /// Deletes all intercept points (leaks are logged), asks the debugger
    /// to exit and stops the rig's loops. Best-effort and idempotent;
    /// errors along the way are logged, never raised.
    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Tearing down target session");

        self.intercepts.delete_all().await;

        if let Err(e) = self.router.send_async("-gdb-exit").await {
            debug!("gdb exit command failed during teardown: {}", e);
        }

        self.dispatch.stop();
        if let Some(task) = self
            .state_task
            .lock()
            .expect("state task lock poisoned")
            .take()
        {
            task.abort();
        }
        self.router.shutdown();
    }
}
