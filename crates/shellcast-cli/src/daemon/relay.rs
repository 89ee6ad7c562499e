//! Session relay: one driven process, one primary transport, many observers.
//!
//! A driver connection spawns the process and runs three loops until either
//! side is done:
//!
//! - keepalive: pings the primary transport on a fixed period
//! - inbound: primary transport frames to process input
//! - fan-out: process output to the primary transport, observers and the
//!   active recording
//!
//! Two [`DoneSignal`]s, one per side, are the only cancellation primitives.
//! Every loop waits on both, and the first failure wins. Teardown runs once
//! all three loops have returned. Daemon shutdown fires the transport side,
//! so a stopping daemon tears sessions down the same way a hang-up does.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use shellcast_core::error::ApiError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::daemon::observers::ObserverSet;
use crate::daemon::pty::{PtyIo, PtyProcess, TermSize, Termination};
use crate::daemon::recorder::{RecordCommand, SessionRecorder};
use crate::daemon::registry::{SessionHandle, SessionRegistry};
use crate::daemon::transport::{
    with_deadline, FrameSink, FrameSource, Inbound, Observer, Transport,
};

/// Deadlines and periods used by a relay.
#[derive(Debug, Clone)]
pub struct RelayTiming {
    /// Deadline for writes to the primary transport.
    pub write_wait: Duration,
    /// Deadline for writes to an observer. Shorter than `write_wait`.
    pub observer_wait: Duration,
    /// Longest silence tolerated from the primary transport.
    pub pong_wait: Duration,
    /// Keepalive period. Must be less than `pong_wait`.
    pub ping_period: Duration,
    /// How long an interrupted process gets before it is killed.
    pub interrupt_grace: Duration,
    /// Deadline for sending a close frame.
    pub close_wait: Duration,
}

impl Default for RelayTiming {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(10);
        Self {
            write_wait: Duration::from_secs(10),
            observer_wait: Duration::from_secs(3),
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            interrupt_grace: Duration::from_secs(1),
            close_wait: Duration::from_secs(1),
        }
    }
}

/// Daemon-wide relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub records_dir: PathBuf,
    pub size: TermSize,
    pub timing: RelayTiming,
}

impl RelayConfig {
    pub fn new(records_dir: impl Into<PathBuf>) -> Self {
        Self {
            records_dir: records_dir.into(),
            size: TermSize::default(),
            timing: RelayTiming::default(),
        }
    }
}

/// Shared state every connection handler needs.
#[derive(Clone)]
pub struct RelayContext {
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<RelayConfig>,
    /// Fired once when the daemon stops. Refuses new drivers and ends
    /// running sessions through their normal teardown.
    pub shutdown: DoneSignal,
}

impl RelayContext {
    pub fn new(registry: Arc<SessionRegistry>, config: RelayConfig) -> Self {
        Self {
            registry,
            config: Arc::new(config),
            shutdown: DoneSignal::new(),
        }
    }
}

/// One-shot, level-triggered termination notice.
///
/// Firing is idempotent; only the first call has an effect. Waiters that
/// arrive after the signal fired return immediately.
#[derive(Clone)]
pub struct DoneSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for DoneSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl DoneSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Returns true only for the call that fired it.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as self, so this cannot fail.
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// What teardown did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Loops that returned normally (three when nothing panicked).
    pub loops_joined: usize,
    /// Observers still attached at teardown and closed by it.
    pub observers_closed: usize,
    pub termination: Termination,
    /// Recording finalized by teardown, if one was active.
    pub recording: Option<PathBuf>,
}

/// Outcome of [`connect`].
#[derive(Debug)]
pub enum Connection {
    /// The observer now belongs to the session's fan-out loop.
    Attached,
    /// The connection was refused and its transport closed.
    Refused(ApiError),
    /// The driven session ran to completion.
    Finished(TeardownReport),
}

/// Create-or-attach entry point for an accepted transport.
///
/// Drivers spawn `command` and run the session until it ends; observers are
/// dispatched to the running session named `name` and return immediately.
pub async fn connect(
    ctx: &RelayContext,
    transport: Transport,
    is_observer: bool,
    name: &str,
    command: &[String],
) -> Connection {
    if is_observer {
        attach_observer(ctx, transport, name).await
    } else {
        drive(ctx, transport, name, command).await
    }
}

async fn attach_observer(ctx: &RelayContext, transport: Transport, name: &str) -> Connection {
    let peer = transport.peer().to_string();
    match ctx
        .registry
        .dispatch_observer(name, transport.into_observer())
        .await
    {
        Ok(()) => {
            info!("Observer {} attached to session {}", peer, name);
            Connection::Attached
        }
        Err(observer) => {
            warn!("No session {} for observer {}, closing", name, peer);
            observer.close().await;
            Connection::Refused(ApiError::session_not_found(name))
        }
    }
}

async fn drive(
    ctx: &RelayContext,
    transport: Transport,
    name: &str,
    command: &[String],
) -> Connection {
    let timing = &ctx.config.timing;

    if ctx.shutdown.is_fired() {
        let err = ApiError::internal("Daemon is shutting down");
        transport.reject(&err.message, timing.close_wait).await;
        return Connection::Refused(err);
    }

    if let Err(e) = ctx.registry.check_available(name).await {
        warn!("Refusing driver {} for {}: {}", transport.peer(), name, e);
        transport.reject(&e.message, timing.close_wait).await;
        return Connection::Refused(e);
    }

    let mut process = match PtyProcess::spawn(command, ctx.config.size) {
        Ok(process) => process,
        Err(e) => {
            let err = ApiError::spawn_failed(command, &format!("{:#}", e));
            error!("{}", err);
            transport
                .reject("Failed to start process", timing.close_wait)
                .await;
            return Connection::Refused(err);
        }
    };

    let io = match process.start_io() {
        Ok(io) => io,
        Err(e) => {
            error!("Failed to start PTY I/O for {}: {:#}", name, e);
            process.terminate(timing.interrupt_grace).await;
            process.close();
            transport
                .reject("Failed to start process", timing.close_wait)
                .await;
            return Connection::Refused(ApiError::internal(format!("{:#}", e)));
        }
    };

    claim(ctx, transport, name, process, io).await
}

/// Register a spawned process under `name` and run it, or release it when
/// another driver claimed the name while it was spawning.
async fn claim(
    ctx: &RelayContext,
    transport: Transport,
    name: &str,
    mut process: PtyProcess,
    io: PtyIo,
) -> Connection {
    let timing = &ctx.config.timing;
    let (observer_tx, observer_rx) = mpsc::unbounded_channel();
    let (record_tx, record_rx) = mpsc::unbounded_channel();
    let handle = SessionHandle::new(
        name,
        transport.peer(),
        process.command(),
        observer_tx,
        record_tx,
    );

    if let Err(e) = ctx.registry.register(handle).await {
        drop(io);
        let termination = process.terminate(timing.interrupt_grace).await;
        process.close();
        debug!("Released losing process for {}: {:?}", name, termination);
        transport.reject(&e.message, timing.close_wait).await;
        return Connection::Refused(e);
    }

    let session = Session {
        ctx: ctx.clone(),
        name: name.to_string(),
        process,
    };
    let channels = Channels {
        input: io.input,
        output: io.output,
        observer_rx,
        record_rx,
    };
    Connection::Finished(session.run(transport, channels).await)
}

type SharedSink = Arc<Mutex<Box<dyn FrameSink>>>;

struct Channels {
    input: mpsc::Sender<Vec<u8>>,
    output: mpsc::Receiver<Vec<u8>>,
    observer_rx: mpsc::UnboundedReceiver<Observer>,
    record_rx: mpsc::UnboundedReceiver<RecordCommand>,
}

struct Session {
    ctx: RelayContext,
    name: String,
    process: PtyProcess,
}

impl Session {
    async fn run(mut self, transport: Transport, channels: Channels) -> TeardownReport {
        let timing = self.ctx.config.timing.clone();
        let (peer, sink, source) = transport.into_parts();
        let primary: SharedSink = Arc::new(Mutex::new(sink));
        let transport_done = DoneSignal::new();
        let process_done = DoneSignal::new();

        info!(
            "Session {} running {:?} for {} (pid {:?})",
            self.name,
            self.process.command(),
            peer,
            self.process.pid()
        );

        let stop = tokio::spawn(watch_shutdown(
            self.ctx.shutdown.clone(),
            transport_done.clone(),
            process_done.clone(),
        ));
        let keepalive = tokio::spawn(keepalive_loop(
            primary.clone(),
            timing.clone(),
            transport_done.clone(),
            process_done.clone(),
        ));
        let inbound = tokio::spawn(inbound_loop(
            source,
            channels.input,
            timing.pong_wait,
            transport_done.clone(),
            process_done.clone(),
        ));
        let fan_out = tokio::spawn(
            FanOut {
                name: self.name.clone(),
                primary: primary.clone(),
                output: channels.output,
                observer_rx: channels.observer_rx,
                record_rx: channels.record_rx,
                observers: ObserverSet::new(),
                recorder: SessionRecorder::new(
                    self.name.clone(),
                    self.ctx.config.records_dir.clone(),
                ),
                timing: timing.clone(),
                transport_done: transport_done.clone(),
                process_done: process_done.clone(),
            }
            .run(),
        );

        let (keepalive, inbound, fan_out) = tokio::join!(keepalive, inbound, fan_out);
        stop.abort();
        let mut loops_joined = 0;
        for (loop_name, result) in [("keepalive", keepalive), ("inbound", inbound)] {
            match result {
                Ok(()) => loops_joined += 1,
                Err(e) => error!("{} loop of {} failed: {}", loop_name, self.name, e),
            }
        }
        let fan_out = match fan_out {
            Ok(state) => {
                loops_joined += 1;
                Some(state)
            }
            Err(e) => {
                error!("fan-out loop of {} failed: {}", self.name, e);
                None
            }
        };
        info!(
            "Session {} closing (transport done: {}, process done: {})",
            self.name,
            transport_done.is_fired(),
            process_done.is_fired()
        );

        let (observers_closed, recording) = match fan_out {
            Some(state) => state.release().await,
            None => (0, None),
        };

        self.ctx.registry.deregister(&self.name).await;

        let termination = self.process.terminate(timing.interrupt_grace).await;
        self.process.close();

        primary.lock().await.shutdown().await;
        info!("Session {} closed ({:?})", self.name, termination);

        TeardownReport {
            loops_joined,
            observers_closed,
            termination,
            recording,
        }
    }
}

/// Turns a daemon shutdown into a transport-side termination.
async fn watch_shutdown(
    shutdown: DoneSignal,
    transport_done: DoneSignal,
    process_done: DoneSignal,
) {
    tokio::select! {
        _ = shutdown.wait() => {
            if transport_done.fire() {
                info!("Daemon shutting down, closing session");
            }
        }
        _ = transport_done.wait() => {}
        _ = process_done.wait() => {}
    }
}

async fn keepalive_loop(
    primary: SharedSink,
    timing: RelayTiming,
    transport_done: DoneSignal,
    process_done: DoneSignal,
) {
    debug!("Keepalive loop started");
    let mut ticker = interval_at(Instant::now() + timing.ping_period, timing.ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sent = with_deadline(timing.write_wait, async {
                    primary.lock().await.send_ping().await
                })
                .await;
                if let Err(e) = sent {
                    warn!("Failed to send ping: {}", e);
                    break;
                }
            }
            _ = transport_done.wait() => break,
            _ = process_done.wait() => break,
        }
    }
    debug!("Keepalive loop exited");
}

async fn inbound_loop(
    source: Box<dyn FrameSource>,
    input: mpsc::Sender<Vec<u8>>,
    pong_wait: Duration,
    transport_done: DoneSignal,
    process_done: DoneSignal,
) {
    debug!("Inbound loop started");
    let (frames_tx, mut frames_rx) = mpsc::channel::<Vec<u8>>(16);
    let reader = tokio::spawn(read_primary(
        source,
        frames_tx,
        pong_wait,
        transport_done.clone(),
        process_done.clone(),
    ));

    loop {
        tokio::select! {
            frame = frames_rx.recv() => {
                let Some(data) = frame else {
                    break;
                };
                tokio::select! {
                    sent = input.send(data) => {
                        if sent.is_err() {
                            warn!("Process input closed");
                            break;
                        }
                    }
                    _ = transport_done.wait() => break,
                    _ = process_done.wait() => break,
                }
            }
            _ = transport_done.wait() => break,
            _ = process_done.wait() => break,
        }
    }

    // Unblocks a reader waiting to hand over a frame.
    drop(frames_rx);
    if let Err(e) = reader.await {
        error!("Primary reader failed: {}", e);
    }
    debug!("Inbound loop exited");
}

/// Dedicated reader for the primary transport. Any read failure or clean
/// close fires `transport_done`.
async fn read_primary(
    mut source: Box<dyn FrameSource>,
    frames: mpsc::Sender<Vec<u8>>,
    pong_wait: Duration,
    transport_done: DoneSignal,
    process_done: DoneSignal,
) {
    loop {
        let frame = tokio::select! {
            frame = with_deadline(pong_wait, source.recv()) => frame,
            _ = transport_done.wait() => break,
            _ = process_done.wait() => break,
        };

        match frame {
            Ok(Some(Inbound::Data(data))) => {
                if frames.send(data).await.is_err() {
                    break;
                }
            }
            Ok(Some(Inbound::Pong)) => {}
            Ok(None) => {
                info!("Primary transport closed by peer");
                transport_done.fire();
                break;
            }
            Err(e) => {
                warn!("Failed to read from primary transport: {}", e);
                transport_done.fire();
                break;
            }
        }
    }
}

/// Owner of process output, observers and the recording.
struct FanOut {
    name: String,
    primary: SharedSink,
    output: mpsc::Receiver<Vec<u8>>,
    observer_rx: mpsc::UnboundedReceiver<Observer>,
    record_rx: mpsc::UnboundedReceiver<RecordCommand>,
    observers: ObserverSet,
    recorder: SessionRecorder,
    timing: RelayTiming,
    transport_done: DoneSignal,
    process_done: DoneSignal,
}

impl FanOut {
    async fn run(mut self) -> Self {
        debug!("Fan-out loop started for {}", self.name);

        loop {
            // Control messages first so an observer queued before a block sees it.
            tokio::select! {
                biased;

                _ = self.transport_done.wait() => break,
                _ = self.process_done.wait() => break,
                Some(observer) = self.observer_rx.recv() => {
                    info!("Session {} received observer {}", self.name, observer.peer());
                    self.observers.attach(observer);
                }
                Some(command) = self.record_rx.recv() => {
                    self.recorder.apply(command);
                }
                block = self.output.recv() => match block {
                    Some(data) => {
                        if !self.deliver(&data).await {
                            break;
                        }
                    }
                    None => {
                        info!("Process output of {} closed", self.name);
                        self.process_done.fire();
                        let closed = with_deadline(self.timing.close_wait, async {
                            self.primary.lock().await.send_close("Pty closed").await
                        })
                        .await;
                        if let Err(e) = closed {
                            debug!("Failed to send close frame: {}", e);
                        }
                        break;
                    }
                },
            }
        }

        debug!("Fan-out loop exited for {}", self.name);
        self
    }

    /// Returns false when the primary transport failed.
    async fn deliver(&mut self, data: &[u8]) -> bool {
        let sent = with_deadline(self.timing.write_wait, async {
            self.primary.lock().await.send_data(data).await
        })
        .await;
        if let Err(e) = sent {
            warn!("Failed to write to primary transport of {}: {}", self.name, e);
            self.transport_done.fire();
            return false;
        }

        self.observers
            .broadcast(data, self.timing.observer_wait)
            .await;
        self.recorder.record(data);
        true
    }

    /// Close the control channels, every observer, and the recording.
    async fn release(mut self) -> (usize, Option<PathBuf>) {
        self.observer_rx.close();
        while let Ok(observer) = self.observer_rx.try_recv() {
            self.observers.attach(observer);
        }
        self.record_rx.close();

        let closed = self.observers.close_all().await;
        let recording = self.recorder.finish();
        (closed, recording)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::transport::mock::{pair, MockPeer, Sent};
    use shellcast_core::error::ErrorCode;
    use shellcast_core::recording::read_all;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_context(records_dir: &std::path::Path) -> RelayContext {
        let mut config = RelayConfig::new(records_dir);
        config.timing.interrupt_grace = Duration::from_millis(300);
        RelayContext::new(Arc::new(SessionRegistry::default()), config)
    }

    fn command(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    async fn wait_registered(ctx: &RelayContext, name: &str) {
        tokio::time::timeout(WAIT, async {
            while !ctx.registry.contains(name).await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session never registered");
    }

    fn start_driver(
        ctx: &RelayContext,
        name: &str,
        cmd: &[&str],
    ) -> (tokio::task::JoinHandle<Connection>, MockPeer) {
        let (transport, peer) = pair("127.0.0.1:40000");
        let ctx = ctx.clone();
        let name = name.to_string();
        let cmd = command(cmd);
        let task = tokio::spawn(async move { connect(&ctx, transport, false, &name, &cmd).await });
        (task, peer)
    }

    async fn attach(ctx: &RelayContext, name: &str, peer_addr: &str) -> MockPeer {
        let (transport, peer) = pair(peer_addr);
        let outcome = connect(ctx, transport, true, name, &[]).await;
        assert!(matches!(outcome, Connection::Attached));
        peer
    }

    async fn finished(task: tokio::task::JoinHandle<Connection>) -> TeardownReport {
        match tokio::time::timeout(WAIT, task).await {
            Ok(Ok(Connection::Finished(report))) => report,
            other => panic!("session did not finish: {:?}", other.map(|r| r.is_ok())),
        }
    }

    fn text(data: &[u8]) -> String {
        String::from_utf8_lossy(data).into_owned()
    }

    #[tokio::test]
    async fn test_done_signal_fires_once_and_wakes_late_waiters() {
        let signal = DoneSignal::new();
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.wait().await }
        });

        assert!(!signal.is_fired());
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(signal.is_fired());

        tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap();
        tokio::time::timeout(WAIT, signal.wait()).await.unwrap();
    }

    #[test]
    fn test_default_timing() {
        let timing = RelayTiming::default();
        assert_eq!(timing.ping_period, Duration::from_secs(9));
        assert!(timing.observer_wait < timing.write_wait);
        assert!(timing.ping_period < timing.pong_wait);
    }

    #[tokio::test]
    async fn test_observers_see_output_from_attach_onwards() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let (task, mut primary) = start_driver(&ctx, "demo", &["cat"]);
        wait_registered(&ctx, "demo").await;

        let mut early = attach(&ctx, "demo", "127.0.0.1:40001").await;
        primary.type_input(b"first\n");

        let primary_first = primary.data_until("first\r\nfirst", WAIT).await;
        let early_first = early.data_until("first\r\nfirst", WAIT).await;
        assert!(text(&primary_first).contains("first\r\nfirst"));
        assert_eq!(early_first, primary_first);

        let mut late = attach(&ctx, "demo", "127.0.0.1:40002").await;
        primary.type_input(b"second\n");

        let late_data = late.data_until("second\r\nsecond", WAIT).await;
        let early_second = early.data_until("second\r\nsecond", WAIT).await;
        let primary_second = primary.data_until("second\r\nsecond", WAIT).await;
        assert!(text(&late_data).contains("second"));
        assert!(!text(&late_data).contains("first"));
        assert_eq!(early_second, primary_second);
        assert_eq!(late_data, primary_second);

        primary.hang_up();
        let report = finished(task).await;

        assert_eq!(report.loops_joined, 3);
        assert_eq!(report.observers_closed, 2);
        assert!(!ctx.registry.contains("demo").await);
        assert!(early.until_shutdown(WAIT).await.is_some());
        assert!(late.until_shutdown(WAIT).await.is_some());
    }

    #[tokio::test]
    async fn test_failed_observer_does_not_disturb_others() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let (task, mut primary) = start_driver(&ctx, "iso", &["cat"]);
        wait_registered(&ctx, "iso").await;

        let mut broken = attach(&ctx, "iso", "127.0.0.1:40003").await;
        let mut healthy = attach(&ctx, "iso", "127.0.0.1:40004").await;
        broken.break_writes();

        primary.type_input(b"hello\n");
        assert!(text(&primary.data_until("hello\r\nhello", WAIT).await).contains("hello"));
        assert!(text(&healthy.data_until("hello\r\nhello", WAIT).await).contains("hello"));
        assert!(broken.until_shutdown(WAIT).await.is_some());

        primary.type_input(b"again\n");
        assert!(text(&primary.data_until("again\r\nagain", WAIT).await).contains("again"));
        assert!(text(&healthy.data_until("again\r\nagain", WAIT).await).contains("again"));

        primary.hang_up();
        let report = finished(task).await;
        assert_eq!(report.observers_closed, 1);
    }

    #[tokio::test]
    async fn test_primary_eof_interrupts_then_kills() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let (task, mut primary) =
            start_driver(&ctx, "stubborn", &["sh", "-c", "trap '' INT; exec cat"]);
        wait_registered(&ctx, "stubborn").await;
        let mut observer = attach(&ctx, "stubborn", "127.0.0.1:40005").await;

        primary.type_input(b"ready\n");
        primary.data_until("ready\r\nready", WAIT).await;

        let started = std::time::Instant::now();
        primary.hang_up();
        let report = finished(task).await;

        assert_eq!(report.termination, Termination::Killed);
        assert!(started.elapsed() >= ctx.config.timing.interrupt_grace);
        assert_eq!(report.loops_joined, 3);
        assert_eq!(report.observers_closed, 1);
        assert!(ctx.registry.is_empty().await);
        assert!(observer.until_shutdown(WAIT).await.is_some());
        assert!(primary.until_shutdown(WAIT).await.is_some());
    }

    #[tokio::test]
    async fn test_primary_read_error_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let (task, primary) = start_driver(&ctx, "faulty", &["cat"]);
        wait_registered(&ctx, "faulty").await;

        primary.fail_read(crate::daemon::transport::TransportError::Oversized {
            size: 5000,
            limit: 4096,
        });
        let report = finished(task).await;

        assert_eq!(report.loops_joined, 3);
        assert_eq!(report.termination, Termination::Interrupted);
        assert!(ctx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_process_exit_sends_close_frame() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let (task, mut primary) = start_driver(&ctx, "short", &["sh", "-c", "echo bye"]);

        let report = finished(task).await;
        assert_eq!(report.loops_joined, 3);
        assert_ne!(report.termination, Termination::Killed);

        let frames = primary.until_shutdown(WAIT).await.unwrap();
        let output: Vec<u8> = frames
            .iter()
            .filter_map(|frame| match frame {
                Sent::Data(data) => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert!(text(&output).contains("bye"));
        assert_eq!(frames.last(), Some(&Sent::Close("Pty closed".to_string())));
    }

    #[tokio::test]
    async fn test_primary_write_failure_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let (task, primary) = start_driver(&ctx, "deaf", &["cat"]);
        wait_registered(&ctx, "deaf").await;

        primary.break_writes();
        primary.type_input(b"anyone\n");

        let report = finished(task).await;
        assert_eq!(report.loops_joined, 3);
        assert!(ctx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_driver_is_refused_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let (task, mut primary) = start_driver(&ctx, "main", &["cat"]);
        wait_registered(&ctx, "main").await;

        let (transport, mut loser) = pair("127.0.0.1:40006");
        let outcome = connect(&ctx, transport, false, "main", &command(&["cat"])).await;
        match outcome {
            Connection::Refused(err) => assert_eq!(err.code, ErrorCode::SessionExists),
            other => panic!("expected refusal, got {:?}", other),
        }
        let frames = loser.until_shutdown(WAIT).await.unwrap();
        assert!(matches!(frames.as_slice(), [Sent::Close(_)]));
        assert_eq!(ctx.registry.len().await, 1);

        // The original session is untouched.
        primary.type_input(b"still here\n");
        assert!(text(&primary.data_until("still here\r\nstill here", WAIT).await)
            .contains("still here"));

        primary.hang_up();
        finished(task).await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_refused_before_registration() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let (transport, mut peer) = pair("127.0.0.1:40007");

        let outcome = connect(
            &ctx,
            transport,
            false,
            "broken",
            &command(&["/definitely/not/a/real/program"]),
        )
        .await;

        match outcome {
            Connection::Refused(err) => assert_eq!(err.code, ErrorCode::CommandFailed),
            other => panic!("expected refusal, got {:?}", other),
        }
        assert!(peer.until_shutdown(WAIT).await.is_some());
        assert!(ctx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_observer_for_unknown_session_is_closed() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let (transport, mut peer) = pair("127.0.0.1:40008");

        let outcome = connect(&ctx, transport, true, "nobody", &[]).await;
        match outcome {
            Connection::Refused(err) => assert_eq!(err.code, ErrorCode::SessionNotFound),
            other => panic!("expected refusal, got {:?}", other),
        }
        assert_eq!(peer.drain(), vec![Sent::Shutdown]);
    }

    #[tokio::test]
    async fn test_recording_is_finalized_at_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let (task, mut primary) = start_driver(&ctx, "taped", &["cat"]);
        wait_registered(&ctx, "taped").await;

        primary.type_input(b"before\n");
        primary.data_until("before\r\nbefore", WAIT).await;

        assert!(
            ctx.registry
                .send_record_command("taped", RecordCommand::Start)
                .await
        );
        primary.type_input(b"during\n");
        primary.data_until("during\r\nduring", WAIT).await;

        primary.hang_up();
        let report = finished(task).await;

        let path = report.recording.expect("recording should be finalized");
        assert!(path.starts_with(dir.path()));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("taped_"));

        let recorded: Vec<u8> = read_all(&path)
            .unwrap()
            .into_iter()
            .flat_map(|chunk| chunk.payload)
            .collect();
        assert!(text(&recorded).contains("during"));
        assert!(!text(&recorded).contains("before"));
    }

    #[tokio::test]
    async fn test_stop_recording_closes_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let (task, mut primary) = start_driver(&ctx, "clip", &["cat"]);
        wait_registered(&ctx, "clip").await;

        ctx.registry
            .send_record_command("clip", RecordCommand::Start)
            .await;
        primary.type_input(b"kept\n");
        primary.data_until("kept\r\nkept", WAIT).await;
        ctx.registry
            .send_record_command("clip", RecordCommand::Stop)
            .await;
        // Commands are processed in order with output; a round trip makes
        // sure the stop has been applied.
        primary.type_input(b"after\n");
        primary.data_until("after\r\nafter", WAIT).await;

        primary.hang_up();
        let report = finished(task).await;
        assert_eq!(report.recording, None);

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        let recorded: Vec<u8> = read_all(&files[0])
            .unwrap()
            .into_iter()
            .flat_map(|chunk| chunk.payload)
            .collect();
        assert!(text(&recorded).contains("kept"));
        assert!(!text(&recorded).contains("after"));
    }

    #[tokio::test]
    async fn test_daemon_shutdown_finalizes_active_recording() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let (task, mut primary) = start_driver(&ctx, "live", &["cat"]);
        wait_registered(&ctx, "live").await;
        let mut observer = attach(&ctx, "live", "127.0.0.1:40009").await;

        ctx.registry
            .send_record_command("live", RecordCommand::Start)
            .await;
        primary.type_input(b"hello\n");
        primary.data_until("hello\r\nhello", WAIT).await;

        ctx.shutdown.fire();
        let report = finished(task).await;

        assert_eq!(report.loops_joined, 3);
        assert_eq!(report.observers_closed, 1);
        assert!(ctx.registry.is_empty().await);
        assert!(observer.until_shutdown(WAIT).await.is_some());
        assert!(primary.until_shutdown(WAIT).await.is_some());

        let path = report.recording.expect("recording should be finalized");
        let recorded: Vec<u8> = read_all(&path)
            .unwrap()
            .into_iter()
            .flat_map(|chunk| chunk.payload)
            .collect();
        assert!(text(&recorded).contains("hello"));
    }

    #[tokio::test]
    async fn test_driver_refused_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        ctx.shutdown.fire();

        let (transport, mut peer) = pair("127.0.0.1:40010");
        let outcome = connect(&ctx, transport, false, "late", &command(&["cat"])).await;
        match outcome {
            Connection::Refused(err) => assert_eq!(err.code, ErrorCode::InternalError),
            other => panic!("expected refusal, got {:?}", other),
        }
        let frames = peer.until_shutdown(WAIT).await.unwrap();
        assert!(matches!(frames.as_slice(), [Sent::Close(_)]));
        assert!(ctx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_losing_registration_race_releases_process() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());

        let process = PtyProcess::spawn(&command(&["cat"]), ctx.config.size).unwrap();
        let io = process.start_io().unwrap();
        let pid = process.pid().unwrap() as libc::pid_t;

        // Another driver registers the name while this one was spawning.
        let (observer_tx, _observer_rx) = mpsc::unbounded_channel();
        let (record_tx, _record_rx) = mpsc::unbounded_channel();
        ctx.registry
            .register(SessionHandle::new(
                "race",
                "127.0.0.1:40011",
                &command(&["cat"]),
                observer_tx,
                record_tx,
            ))
            .await
            .unwrap();

        let (transport, mut loser) = pair("127.0.0.1:40012");
        let outcome = claim(&ctx, transport, "race", process, io).await;
        match outcome {
            Connection::Refused(err) => assert_eq!(err.code, ErrorCode::SessionExists),
            other => panic!("expected refusal, got {:?}", other),
        }

        let frames = loser.until_shutdown(WAIT).await.unwrap();
        assert!(matches!(frames.as_slice(), [Sent::Close(_)]));
        assert_eq!(ctx.registry.len().await, 1);
        // Reaped: the pid no longer names a process.
        assert_eq!(unsafe { libc::kill(pid, 0) }, -1);
    }
}
