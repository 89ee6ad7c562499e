//! PTY-backed child process using portable-pty.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Terminal size in columns and rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermSize {
    /// Browser terminals are created one cell larger in each direction;
    /// giving the child the full viewport makes some programs misbehave.
    fn default() -> Self {
        Self {
            cols: 120,
            rows: 36,
        }
    }
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Output is read from the PTY in blocks of this size.
pub const READ_BLOCK_SIZE: usize = 1024;

/// Interval between exit checks while waiting out the interrupt grace period.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long to wait for the kernel to reap a killed child.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// How a child process ended during teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process had already exited before teardown asked it to.
    AlreadyExited,
    /// The process exited within the grace period after the interrupt.
    Interrupted,
    /// The process ignored the interrupt and was force-killed.
    Killed,
}

/// Channels connecting the relay to the PTY I/O threads.
pub struct PtyIo {
    /// Bytes sent here are written to the child's terminal input.
    pub input: mpsc::Sender<Vec<u8>>,
    /// Output blocks in the order the child produced them. Closes on EOF
    /// or read error.
    pub output: mpsc::Receiver<Vec<u8>>,
}

/// A child process attached to a pseudo-terminal.
pub struct PtyProcess {
    master: Option<Box<dyn MasterPty + Send>>,
    child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
    command: Vec<String>,
    reaped: bool,
}

impl PtyProcess {
    /// Spawn `command` on a new PTY of the given size.
    pub fn spawn(command: &[String], size: TermSize) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            anyhow::bail!("Command cannot be empty");
        };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size.into())
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .context("Failed to spawn command")?;
        let pid = child.process_id();

        info!("Created process {:?} (pid {:?})", command, pid);

        Ok(Self {
            master: Some(pair.master),
            child,
            pid,
            command: command.to_vec(),
            reaped: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Start the blocking reader and writer threads.
    ///
    /// The reader forwards blocks of at most [`READ_BLOCK_SIZE`] bytes; its
    /// channel closes when the PTY reports EOF or an error. The writer exits
    /// when the input sender is dropped or a write fails.
    pub fn start_io(&self) -> Result<PtyIo> {
        let master = self
            .master
            .as_ref()
            .context("PTY master already closed")?;
        let reader = master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = master.take_writer().context("Failed to take PTY writer")?;

        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(64);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(64);

        std::thread::spawn(move || reader_loop(reader, output_tx));
        std::thread::spawn(move || writer_loop(writer, input_rx));

        Ok(PtyIo {
            input: input_tx,
            output: output_rx,
        })
    }

    /// Non-blocking exit check. Reaps the child when it has exited.
    pub fn has_exited(&mut self) -> bool {
        if self.reaped {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("Process {:?} exited: {:?}", self.pid, status);
                self.reaped = true;
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to query process {:?}: {}", self.pid, e);
                false
            }
        }
    }

    /// Stop the child: interrupt, wait up to `grace`, force-kill, reap.
    pub async fn terminate(&mut self, grace: Duration) -> Termination {
        if self.has_exited() {
            return Termination::AlreadyExited;
        }

        if let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) {
            // SAFETY: kill(2) has no memory-safety preconditions; pid is our own child.
            let rc = unsafe { libc::kill(pid, libc::SIGINT) };
            if rc != 0 {
                warn!(
                    "Failed to interrupt process {}: {}",
                    pid,
                    std::io::Error::last_os_error()
                );
            }
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            if self.has_exited() {
                info!("Process {:?} exited after interrupt", self.pid);
                return Termination::Interrupted;
            }
        }

        info!("Killing process {:?}", self.pid);
        if let Err(e) = self.child.kill() {
            debug!("Failed to kill process (may have already exited): {}", e);
        }

        let deadline = Instant::now() + REAP_TIMEOUT;
        while !self.has_exited() {
            if Instant::now() >= deadline {
                warn!("Process {:?} not reaped after kill", self.pid);
                break;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
        Termination::Killed
    }

    /// Close the controlling side of the PTY.
    pub fn close(&mut self) {
        if self.master.take().is_some() {
            debug!("Closed PTY master for process {:?}", self.pid);
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        // Dropped without teardown (session aborted at shutdown)
        if let Err(e) = self.child.kill() {
            debug!(
                "Failed to kill child on drop (may have already exited): {}",
                e
            );
        }
        if let Err(e) = self.child.try_wait() {
            debug!("Failed to collect child exit status on drop: {}", e);
        }
    }
}

fn reader_loop(mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_BLOCK_SIZE];

    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                debug!("PTY reader EOF");
                break;
            }
            Ok(n) => {
                if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                    debug!("PTY output channel closed");
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO once the child side is gone
                debug!("PTY read ended: {}", e);
                break;
            }
        }
    }
}

fn writer_loop(mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = input_rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data) {
            error!("PTY write error: {}", e);
            break;
        }
        if let Err(e) = writer.flush() {
            error!("PTY flush error: {}", e);
            break;
        }
    }
    debug!("PTY writer exiting");
}
