//! CLI argument parsing with clap derive macros.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Share a terminal session over WebSockets.
///
/// The daemon runs a command on a PTY for every driver connecting to
/// /ws_new/<id> and mirrors its output to viewers on /ws_view/<id>.
/// Sessions can be recorded, replayed and merged.
#[derive(Debug, Parser)]
#[command(name = "shellcast", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the daemon in the foreground
    #[command(after_help = "\
Examples:
  shellcast daemon                          # bash on 0.0.0.0:8080
  shellcast daemon --port 9000 -- zsh -l    # Custom port and command
  shellcast daemon --origin-host example.com")]
    Daemon(DaemonArgs),

    /// List active sessions
    ListSessions,

    /// Start recording a session
    Record(SessionArgs),

    /// Stop recording a session
    StopRecord(SessionArgs),

    /// Replay a recording to the terminal
    #[command(after_help = "\
Recordings are captured on a 120x36 terminal and look best at that size.

Examples:
  shellcast replay records/main_6543a1b2.rec
  shellcast replay -w 200 demo.scr          # Cap pauses at 200ms")]
    Replay(ReplayArgs),

    /// Concatenate recordings into one file
    Merge(MergeArgs),

    /// List, delete or rename recordings on disk
    #[command(after_help = "\
Examples:
  shellcast recordings                      # List recordings
  shellcast recordings rm main_6543a1b2.rec
  shellcast recordings rename main_6543a1b2.rec demo   # Saved as demo.scr")]
    Recordings(RecordingsArgs),

    /// Stop the daemon
    Stop,
}

#[derive(Debug, clap::Args)]
pub struct DaemonArgs {
    /// TCP port for WebSocket connections
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Address to bind the WebSocket listener to
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Only accept upgrades whose Origin header names this host
    #[arg(long, value_name = "HOST")]
    pub origin_host: Option<String>,

    /// Directory recordings are written to [env: SHELLCAST_RECORDS_DIR, default: ./records]
    #[arg(long, value_name = "DIR")]
    pub records_dir: Option<PathBuf>,

    /// Maximum number of concurrently driven sessions
    #[arg(long, default_value_t = 100)]
    pub max_sessions: usize,

    /// Command run for every session
    #[arg(
        last = true,
        num_args = 1..,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    pub command: Vec<String>,
}

#[derive(Debug, clap::Args)]
pub struct SessionArgs {
    /// Session identifier
    pub session: String,
}

#[derive(Debug, clap::Args)]
pub struct ReplayArgs {
    /// Recording file
    pub file: PathBuf,

    /// Longest pause between chunks, in milliseconds
    #[arg(short, long, default_value_t = 1000, value_name = "MS")]
    pub wait: u64,
}

#[derive(Debug, clap::Args)]
pub struct MergeArgs {
    /// Output file [default: merged_<hex timestamp>.scr]
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Recordings to concatenate, in order
    #[arg(required = true, num_args = 2..)]
    pub files: Vec<PathBuf>,
}

#[derive(Debug, clap::Args)]
pub struct RecordingsArgs {
    /// Recordings directory [env: SHELLCAST_RECORDS_DIR, default: ./records]
    #[arg(long, value_name = "DIR", global = true)]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub action: Option<RecordingsAction>,
}

#[derive(Debug, Subcommand)]
pub enum RecordingsAction {
    /// List recordings (the default)
    List,

    /// Delete a recording
    Rm {
        /// File name inside the recordings directory
        name: String,
    },

    /// Rename a recording; `.scr` is appended when missing
    Rename {
        /// Current file name
        old: String,
        /// New file name; an existing file is never replaced
        new: String,
    },
}
