//! Integration tests driving the rig against a scripted fake debugger

use embedded_testrig::breakpoint::intercept::InterceptHook;
use embedded_testrig::breakpoint::{
    BarrierPoint, Breakpoint, HaltPoint, InterceptPoint, InterceptPointCmds,
};
use embedded_testrig::config::Config;
use embedded_testrig::error::RigError;
use embedded_testrig::mi::{ContextGuard, MiContext, MiLink, Router};
use embedded_testrig::symbols::{StaticSymbols, SymbolLookup};
use embedded_testrig::target::Target;
use embedded_testrig::utils::Value;
use futures::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

type Handler = dyn Fn(u64, &str) -> Vec<String> + Send + Sync;

/// Spawn a fake debugger on the far side of a duplex pipe.
///
/// The handler maps each received command line to response lines (results
/// and/or notifications); the returned sender injects spontaneous
/// notification lines at any time.
fn spawn_fake_debugger(handler: Arc<Handler>) -> (MiLink, mpsc::UnboundedSender<String>) {
    let (host_side, debugger_side) = tokio::io::duplex(64 * 1024);
    let (dbg_read, mut dbg_write) = tokio::io::split(debugger_side);
    let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let mut lines = BufReader::new(dbg_read).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        _ => break,
                    };
                    let (token, cmd) = split_token(&line);
                    for out in handler(token, cmd) {
                        if dbg_write.write_all(format!("{}\n", out).as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    let _ = dbg_write.flush().await;
                }
                inj = inject_rx.recv() => {
                    let Some(line) = inj else { break };
                    if dbg_write.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                        return;
                    }
                    let _ = dbg_write.flush().await;
                }
            }
        }
    });

    let (host_read, host_write) = tokio::io::split(host_side);
    (MiLink::new(host_read, host_write), inject_tx)
}

fn split_token(line: &str) -> (u64, &str) {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    let token = line[..digits].parse().unwrap_or(0);
    (token, &line[digits..])
}

fn ack(token: u64) -> Vec<String> {
    vec![format!("{}^done", token)]
}

async fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Handler covering run control: continue/interrupt/step answer with the
/// matching notifications, `$xpsr` reads back clean of IT bits, everything
/// else is acknowledged.
fn run_control_handler() -> Arc<Handler> {
    Arc::new(|token, cmd| {
        if cmd.contains("-exec-continue") {
            return vec![
                format!("{}^running", token),
                "*running,thread-id=\"all\"".to_string(),
            ];
        }
        if cmd.contains("-exec-interrupt") {
            return vec![
                format!("{}^done", token),
                "*stopped,reason=\"signal-received\"".to_string(),
            ];
        }
        if cmd.contains("-exec-next") {
            return vec![
                format!("{}^running", token),
                "*running,thread-id=\"all\"".to_string(),
                "*stopped,reason=\"end-stepping-range\"".to_string(),
            ];
        }
        if cmd.contains("$xpsr") {
            return vec![format!("{}^done,value=\"16777216\"", token)];
        }
        ack(token)
    })
}

///////////////////////////////////////////////////////////////////////////
// Router

#[tokio::test]
async fn test_token_exact_delivery_under_concurrency() {
    let handler: Arc<Handler> = Arc::new(|token, cmd| {
        // echo the command's trailing number back as the result value
        let n = cmd.rsplit(' ').next().unwrap_or("?");
        vec![format!("{}^done,value=\"{}\"", token, n)]
    });
    let (link, _inject) = spawn_fake_debugger(handler);
    let router = Router::spawn(link, Arc::new(ContextGuard::new()), None, false);

    let mut tasks = Vec::new();
    for n in 0..32 {
        let router = router.clone();
        tasks.push(tokio::spawn(async move {
            let payload = router
                .send_sync(&format!("-echo {}", n), Some(Duration::from_secs(5)))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(payload.get_str("value"), Some(n.to_string().as_str()));
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_send_sync_timeout_then_late_result_discarded() {
    let handler: Arc<Handler> = Arc::new(|token, cmd| {
        if cmd.contains("-slow") {
            return vec![]; // never answered directly
        }
        ack(token)
    });
    let (link, inject) = spawn_fake_debugger(handler);
    let router = Router::spawn(link, Arc::new(ContextGuard::new()), None, false);

    let err = router
        .send_sync("-slow", Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, RigError::Timeout(_)));

    // the late result for the first token arrives with nothing awaiting it
    inject.send("1000^done".to_string()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the router survives and keeps serving fresh commands
    assert!(router.is_alive());
    assert!(router.send_sync("-ok", Some(Duration::from_secs(1))).await.is_ok());
}

#[tokio::test]
async fn test_send_sync_rejected_outside_normal_context() {
    let handler: Arc<Handler> = Arc::new(|token, _| ack(token));
    let (link, _inject) = spawn_fake_debugger(handler);
    let context = Arc::new(ContextGuard::new());
    let router = Router::spawn(link, Arc::clone(&context), None, false);

    context.acquire("bp-x", MiContext::BpIntercept).unwrap();
    let err = router
        .send_sync("-cmd", Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, RigError::ContextViolation(_)));

    context.release("bp-x").unwrap();
    assert!(router.send_sync("-cmd", Some(Duration::from_secs(1))).await.is_ok());
}

#[tokio::test]
async fn test_command_errors_and_benign_downgrades() {
    let handler: Arc<Handler> = Arc::new(|token, cmd| {
        if cmd.contains("-bad") {
            vec![format!("{}^error,msg=\"No symbol foo in current context.\"", token)]
        } else if cmd.contains("-benign") {
            vec![format!("{}^error,msg=\"Unknown remote qXfer reply: OK\"", token)]
        } else {
            ack(token)
        }
    });
    let (link, _inject) = spawn_fake_debugger(handler);
    let router = Router::spawn(link, Arc::new(ContextGuard::new()), None, false);

    let err = router
        .send_sync("-bad", Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    match err {
        RigError::Command(msg) => assert!(msg.contains("No symbol foo")),
        other => panic!("unexpected error: {:?}", other),
    }

    // known-benign pattern degrades to a warning and an empty result
    let res = router
        .send_sync("-benign", Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert!(res.is_none());
}

#[tokio::test]
async fn test_notification_fanout_and_unclaimed_retention() {
    let handler: Arc<Handler> = Arc::new(|token, _| ack(token));
    let (link, inject) = spawn_fake_debugger(handler);
    let router = Router::spawn(link, Arc::new(ContextGuard::new()), None, false);

    let mut specific = router.subscribe("stopped", Some("breakpoint-hit"));
    let mut wildcard = router.subscribe("stopped", None);

    inject
        .send("*stopped,reason=\"breakpoint-hit\",bkptno=\"3\"".to_string())
        .unwrap();
    let n1 = specific.recv().await.unwrap();
    assert_eq!(n1.reason.as_deref(), Some("breakpoint-hit"));
    assert_eq!(n1.payload.get_str("bkptno"), Some("3"));
    // a wildcard subscriber is distinct from the specific one and gets its
    // own copy
    let n2 = wildcard.recv().await.unwrap();
    assert_eq!(n2.event, "stopped");

    // a reason nobody specifically subscribed to still reaches the wildcard
    inject
        .send("*stopped,reason=\"watchpoint-trigger\"".to_string())
        .unwrap();
    let n3 = wildcard.recv().await.unwrap();
    assert_eq!(n3.reason.as_deref(), Some("watchpoint-trigger"));

    // events without any subscriber are retained for later retrieval
    inject.send("=thread-group-added,id=\"i1\"".to_string()).unwrap();
    assert!(
        wait_until(
            || router.take_unclaimed("thread-group-added", None).is_some(),
            Duration::from_secs(1)
        )
        .await
    );
}

///////////////////////////////////////////////////////////////////////////
// Run-state machine

#[tokio::test]
async fn test_run_state_follows_notifications() {
    let handler: Arc<Handler> = Arc::new(|token, _| ack(token));
    let (link, inject) = spawn_fake_debugger(handler);
    let target = Target::connect(link, Config::default(), None).await.unwrap();

    // notifications in order [stopped, running, stopped]
    inject
        .send("*stopped,reason=\"signal-received\"".to_string())
        .unwrap();
    assert!(wait_until(|| !target.is_running(), Duration::from_secs(2)).await);

    inject.send("*running,thread-id=\"all\"".to_string()).unwrap();
    assert!(wait_until(|| target.is_running(), Duration::from_secs(2)).await);

    inject
        .send("*stopped,reason=\"signal-received\"".to_string())
        .unwrap();
    assert!(wait_until(|| !target.is_running(), Duration::from_secs(2)).await);

    target.disconnect().await;
}

#[tokio::test]
async fn test_cont_halt_and_step() {
    let (link, _inject) = spawn_fake_debugger(run_control_handler());
    let target = Target::connect(link, Config::default(), None).await.unwrap();

    // halted -> cont() issues continue and returns once running is seen
    target.cont().await.unwrap();
    assert!(target.is_running());

    // running -> halt() interrupts, confirms halted, finds no IT bits set
    target.halt().await.unwrap();
    assert!(!target.is_running());

    // step completion surfaces as an ordinary stop
    target.step().await.unwrap();
    assert!(!target.is_running());
    target.step_inst().await.unwrap();
    assert!(!target.is_running());

    target.disconnect().await;
}

///////////////////////////////////////////////////////////////////////////
// Halting breakpoints and dispatch

#[tokio::test]
async fn test_halt_point_wait_and_single_slot_signal() {
    let handler: Arc<Handler> = Arc::new(|token, cmd| {
        if cmd.contains("-break-insert") {
            return vec![format!(
                "{}^done,bkpt={{number=\"1\",type=\"breakpoint\",addr=\"0x08000100\",func=\"func_a\"}}",
                token
            )];
        }
        ack(token)
    });
    let (link, inject) = spawn_fake_debugger(handler);
    let symbols: Arc<dyn SymbolLookup> = Arc::new(StaticSymbols::new(["func_a"]));
    let target = Target::connect(link, Config::default(), Some(symbols))
        .await
        .unwrap();

    let bp = HaltPoint::new(&target, "func_a").await.unwrap();
    assert_eq!(bp.number(), 1);
    assert_eq!(bp.address(), "0x08000100");

    // never hit: wait_complete times out after about the deadline
    let start = Instant::now();
    let err = bp
        .wait_complete(Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(err, RigError::Timeout(_)));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(180) && elapsed < Duration::from_secs(2));

    // hit: the handler runs and one waiter is released
    inject
        .send("*stopped,reason=\"breakpoint-hit\",bkptno=\"1\"".to_string())
        .unwrap();
    bp.wait_complete(Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(bp.hits(), 1);

    // two unconsumed hits collapse into a single pending signal
    inject
        .send("*stopped,reason=\"breakpoint-hit\",bkptno=\"1\"".to_string())
        .unwrap();
    inject
        .send("*stopped,reason=\"breakpoint-hit\",bkptno=\"1\"".to_string())
        .unwrap();
    assert!(wait_until(|| bp.hits() == 3, Duration::from_secs(2)).await);
    bp.wait_complete(Some(Duration::from_secs(1))).await.unwrap();
    let err = bp
        .wait_complete(Some(Duration::from_millis(150)))
        .await
        .unwrap_err();
    assert!(matches!(err, RigError::Timeout(_)));

    bp.delete().await.unwrap();
    assert!(target.dispatch().is_empty());
    target.disconnect().await;
}

#[tokio::test]
async fn test_dispatch_ignores_unknown_numbers() {
    let handler: Arc<Handler> = Arc::new(|token, cmd| {
        if cmd.contains("-break-insert") {
            return vec![format!(
                "{}^done,bkpt={{number=\"7\",addr=\"0x08000200\",func=\"func_b\"}}",
                token
            )];
        }
        ack(token)
    });
    let (link, inject) = spawn_fake_debugger(handler);
    let symbols: Arc<dyn SymbolLookup> = Arc::new(StaticSymbols::new(["func_b"]));
    let target = Target::connect(link, Config::default(), Some(symbols))
        .await
        .unwrap();

    // a hit for a number nobody registered is logged and dropped
    inject
        .send("*stopped,reason=\"breakpoint-hit\",bkptno=\"7\"".to_string())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // registering that number afterwards works for new hits
    let bp = HaltPoint::new(&target, "func_b").await.unwrap();
    assert_eq!(bp.number(), 7);
    inject
        .send("*stopped,reason=\"breakpoint-hit\",bkptno=\"7\"".to_string())
        .unwrap();
    bp.wait_complete(Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(bp.hits(), 1);

    target.disconnect().await;
}

#[tokio::test]
async fn test_barrier_rejects_party_count_before_io() {
    let inserts = Arc::new(AtomicUsize::new(0));
    let handler: Arc<Handler> = Arc::new({
        let inserts = Arc::clone(&inserts);
        move |token, cmd| {
            if cmd.contains("-break-insert") {
                inserts.fetch_add(1, Ordering::SeqCst);
                return vec![format!(
                    "{}^done,bkpt={{number=\"2\",addr=\"0x08000300\",func=\"sync_point\"}}",
                    token
                )];
            }
            ack(token)
        }
    });
    let (link, _inject) = spawn_fake_debugger(handler);
    let symbols: Arc<dyn SymbolLookup> = Arc::new(StaticSymbols::new(["sync_point"]));
    let target = Target::connect(link, Config::default(), Some(symbols))
        .await
        .unwrap();

    let err = BarrierPoint::new(&target, "sync_point", 2).await.unwrap_err();
    assert!(matches!(err, RigError::Unsupported(_)));
    assert_eq!(inserts.load(Ordering::SeqCst), 0);

    let barrier = BarrierPoint::new(&target, "sync_point", 1).await.unwrap();
    assert_eq!(inserts.load(Ordering::SeqCst), 1);
    assert_eq!(barrier.location(), "sync_point");

    target.disconnect().await;
}

#[tokio::test]
async fn test_barrier_resumes_target_when_reached() {
    let handler: Arc<Handler> = Arc::new(|token, cmd| {
        if cmd.contains("-break-insert") {
            return vec![format!(
                "{}^done,bkpt={{number=\"4\",addr=\"0x08000400\",func=\"sync_point\"}}",
                token
            )];
        }
        if cmd.contains("-exec-continue") {
            return vec![
                format!("{}^running", token),
                "*running,thread-id=\"all\"".to_string(),
            ];
        }
        ack(token)
    });
    let (link, inject) = spawn_fake_debugger(handler);
    let symbols: Arc<dyn SymbolLookup> = Arc::new(StaticSymbols::new(["sync_point"]));
    let target = Target::connect(link, Config::default(), Some(symbols))
        .await
        .unwrap();

    let barrier = BarrierPoint::new(&target, "sync_point", 1).await.unwrap();

    inject
        .send("*stopped,reason=\"breakpoint-hit\",bkptno=\"4\"".to_string())
        .unwrap();
    barrier
        .cont_when_reached(Some(Duration::from_secs(2)))
        .await
        .unwrap();

    // the hit hook resumed the target
    assert!(wait_until(|| target.is_running(), Duration::from_secs(2)).await);

    target.disconnect().await;
}

///////////////////////////////////////////////////////////////////////////
// Intercept breakpoints

/// Fake companion: connects to the rig's listener, serves `turns` full
/// turns, then holds the socket open until the host tears it down.
fn spawn_fake_companion(port: u16, turns: usize) {
    tokio::spawn(async move {
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        use embedded_testrig::wire::{Frame, FrameType};

        for _ in 0..turns {
            Frame::new(FrameType::Hit).write_to(&mut stream).await.unwrap();
            loop {
                let frame = match Frame::read_from(&mut stream).await {
                    Ok(frame) => frame,
                    Err(_) => return,
                };
                match frame.frame_type() {
                    FrameType::FinishCont => break,
                    FrameType::Exec => {
                        Frame::new(FrameType::Resp).write_to(&mut stream).await.unwrap();
                    }
                    FrameType::Eval => {
                        let resp = if frame.payload_text().contains("bad_var") {
                            Frame::with_payload(FrameType::Except, "No symbol bad_var".as_bytes())
                        } else {
                            Frame::with_payload(FrameType::Resp, "42".as_bytes())
                        };
                        resp.write_to(&mut stream).await.unwrap();
                    }
                    other => panic!("companion got unexpected frame {:?}", other),
                }
            }
        }
        // keep the connection up until the host closes it
        let _ = Frame::read_from(&mut stream).await;
    });
}

#[tokio::test]
async fn test_intercept_turn_sequence() {
    let port = 23171;
    let handler: Arc<Handler> = Arc::new(move |token, cmd| {
        if cmd.contains("testrig-bp-intercept-tcp") {
            spawn_fake_companion(port, 1);
        }
        ack(token)
    });
    let (link, _inject) = spawn_fake_debugger(handler);
    let symbols: Arc<dyn SymbolLookup> = Arc::new(StaticSymbols::new(["isr_handler"]));
    let mut config = Config::default();
    config.intercept.port = port;
    let target = Target::connect(link, config, Some(symbols)).await.unwrap();

    let evaluated = Arc::new(Mutex::new(None::<Value>));
    let hook: InterceptHook = Arc::new({
        let evaluated = Arc::clone(&evaluated);
        move |bp: Arc<InterceptPoint>| {
            let evaluated = Arc::clone(&evaluated);
            async move {
                bp.exec("set var counter = 0").await?;
                let value = bp.eval("counter_limit").await?;
                *evaluated.lock().unwrap() = Some(value);
                Ok(())
            }
            .boxed()
        }
    });

    let bp = InterceptPoint::new(&target, "isr_handler", Some(hook))
        .await
        .unwrap();
    assert_eq!(target.intercepts().live_count(), 1);

    // exactly one waiter returns per turn
    bp.wait_complete(Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(bp.hits(), 1);
    assert_eq!(*evaluated.lock().unwrap(), Some(Value::Int(42)));

    // the turn left the context guard at normal
    assert_eq!(target.context().current(), MiContext::Normal);

    // a second wait without a new hit times out
    let err = bp
        .wait_complete(Some(Duration::from_millis(150)))
        .await
        .unwrap_err();
    assert!(matches!(err, RigError::Timeout(_)));

    // exec outside a turn is rejected without touching the channel
    let err = bp.exec("set var x = 1").await.unwrap_err();
    assert!(matches!(err, RigError::ContextViolation(_)));

    bp.delete().await.unwrap();
    assert_eq!(target.intercepts().live_count(), 0);
    // deleting again is a no-op
    bp.delete().await.unwrap();

    target.disconnect().await;
}

#[tokio::test]
async fn test_intercept_hook_failure_still_resumes() {
    let port = 23173;
    let handler: Arc<Handler> = Arc::new(move |token, cmd| {
        if cmd.contains("testrig-bp-intercept-tcp") {
            spawn_fake_companion(port, 1);
        }
        ack(token)
    });
    let (link, _inject) = spawn_fake_debugger(handler);
    let symbols: Arc<dyn SymbolLookup> = Arc::new(StaticSymbols::new(["fault_handler"]));
    let mut config = Config::default();
    config.intercept.port = port;
    let target = Target::connect(link, config, Some(symbols)).await.unwrap();

    let hook: InterceptHook = Arc::new(|bp: Arc<InterceptPoint>| {
        async move {
            // the companion refuses this one
            bp.eval("bad_var").await?;
            Ok(())
        }
        .boxed()
    });

    let bp = InterceptPoint::new(&target, "fault_handler", Some(hook))
        .await
        .unwrap();

    // the turn completes despite the failing handler and releases the
    // context guard
    bp.wait_complete(Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(target.context().current(), MiContext::Normal);

    target.disconnect().await;
    assert_eq!(target.intercepts().live_count(), 0);
}

#[tokio::test]
async fn test_intercept_registration_fails_without_companion() {
    let port = 23175;
    // companion never connects back
    let handler: Arc<Handler> = Arc::new(|token, _| ack(token));
    let (link, _inject) = spawn_fake_debugger(handler);
    let symbols: Arc<dyn SymbolLookup> = Arc::new(StaticSymbols::new(["isr_handler"]));
    let mut config = Config::default();
    config.intercept.port = port;
    config.intercept.accept_timeout_ms = 200;
    let target = Target::connect(link, config, Some(symbols)).await.unwrap();

    let err = InterceptPoint::new(&target, "isr_handler", None)
        .await
        .unwrap_err();
    assert!(matches!(err, RigError::Registration(_)));
    assert_eq!(target.intercepts().live_count(), 0);

    target.disconnect().await;
}

#[tokio::test]
async fn test_intercept_cmds_variant() {
    let registered = Arc::new(Mutex::new(String::new()));
    let handler: Arc<Handler> = Arc::new({
        let registered = Arc::clone(&registered);
        move |token, cmd| {
            if cmd.contains("testrig-bp-intercept-cmds") {
                *registered.lock().unwrap() = cmd.to_string();
            }
            ack(token)
        }
    });
    let (link, _inject) = spawn_fake_debugger(handler);
    let symbols: Arc<dyn SymbolLookup> = Arc::new(StaticSymbols::new(["tick_handler"]));
    let target = Target::connect(link, Config::default(), Some(symbols))
        .await
        .unwrap();

    let bp = InterceptPointCmds::new(
        &target,
        "tick_handler",
        &["set var ticks = ticks + 1", "continue"],
    )
    .await
    .unwrap();

    let sent = registered.lock().unwrap().clone();
    assert!(sent.contains("tick_handler"));
    assert!(sent.contains("ticks + 1"));

    // unsupported capabilities warn and do nothing
    bp.wait_complete(Some(Duration::from_millis(10))).await.unwrap();
    bp.exec("ignored").await.unwrap();
    assert!(bp.eval("ignored").await.is_err());
    assert_eq!(bp.hits(), 0);

    bp.delete().await.unwrap();
    target.disconnect().await;
}

///////////////////////////////////////////////////////////////////////////
// Symbol validation and companion probe

#[tokio::test]
async fn test_unknown_symbol_rejected_before_insert() {
    let inserts = Arc::new(AtomicUsize::new(0));
    let handler: Arc<Handler> = Arc::new({
        let inserts = Arc::clone(&inserts);
        move |token, cmd| {
            if cmd.contains("-break-insert") {
                inserts.fetch_add(1, Ordering::SeqCst);
            }
            ack(token)
        }
    });
    let (link, _inject) = spawn_fake_debugger(handler);
    let symbols: Arc<dyn SymbolLookup> = Arc::new(StaticSymbols::new(["known_func"]));
    let target = Target::connect(link, Config::default(), Some(symbols))
        .await
        .unwrap();

    let err = HaltPoint::new(&target, "missing_func").await.unwrap_err();
    assert!(matches!(err, RigError::Registration(_)));
    assert_eq!(inserts.load(Ordering::SeqCst), 0);

    target.disconnect().await;
}

#[tokio::test]
async fn test_companion_liveness_probe() {
    let handler: Arc<Handler> = Arc::new(|token, cmd| {
        if cmd.contains("testrig-is-running") {
            // the command line carries the response id as its last argument
            let id = cmd
                .trim_end_matches('"')
                .rsplit(' ')
                .next()
                .unwrap_or("0")
                .to_string();
            return vec![
                format!("{}^done", token),
                format!(
                    "~\"TESTRIG_RESP, {}, testrig-is-running, NO, TESTRIG_RESP_END\\n\"",
                    id
                ),
            ];
        }
        ack(token)
    });
    let (link, _inject) = spawn_fake_debugger(handler);
    let target = Target::connect(link, Config::default(), None).await.unwrap();

    assert!(!target.probe_target_running().await.unwrap());
    target.disconnect().await;
}
