//! shellcast CLI and daemon entry point.

mod args;
mod daemon;
mod offline;

use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use clap::Parser;
use shellcast_core::protocol::{Command, ResponseData};
use shellcast_core::{merge, replay};
use tracing::{error, info};

use crate::args::{
    Cli, Commands, DaemonArgs, MergeArgs, RecordingsAction, RecordingsArgs, ReplayArgs,
};
use crate::daemon::client::DaemonClient;
use crate::daemon::paths;
use crate::daemon::pty::TermSize;
use crate::daemon::server::{DaemonConfig, DaemonServer};

fn main() {
    // stderr keeps stdout clean for replay output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Daemon(args) => {
            run_daemon(args);
            return;
        }
        Commands::Replay(args) => run_replay(args),
        Commands::Merge(args) => run_merge(args),
        Commands::Recordings(args) => run_recordings(args),
        command => run_client_command(command),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Convert CLI args to a protocol Command.
///
/// Returns None for commands that don't talk to the daemon.
fn cli_to_command(command: &Commands) -> Option<Command> {
    match command {
        Commands::ListSessions => Some(Command::ListSessions),
        Commands::Record(args) => Some(Command::StartRecording {
            session: args.session.clone(),
        }),
        Commands::StopRecord(args) => Some(Command::StopRecording {
            session: args.session.clone(),
        }),
        Commands::Stop => Some(Command::Shutdown),
        Commands::Daemon(_)
        | Commands::Replay(_)
        | Commands::Merge(_)
        | Commands::Recordings(_) => None,
    }
}

/// Run a client command by connecting to the daemon.
fn run_client_command(command: Commands) -> anyhow::Result<()> {
    let Some(command) = cli_to_command(&command) else {
        return Ok(());
    };

    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        let mut client = DaemonClient::connect().await?;
        let response = client.send(command).await?;

        if response.success {
            match response.data {
                Some(ResponseData::Ok { message }) => println!("{}", message),
                Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
                None => {}
            }
        } else if let Some(err) = response.error {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }

        Ok(())
    })
}

fn run_replay(args: ReplayArgs) -> anyhow::Result<()> {
    let expected = TermSize::default();
    if let Some((cols, rows)) = offline::terminal_size() {
        if (cols, rows) != (expected.cols, expected.rows) {
            eprintln!(
                "Warning: terminal is {}x{}; recordings are captured at {}x{}",
                cols, rows, expected.cols, expected.rows
            );
        }
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let stats = replay::replay(&args.file, Duration::from_millis(args.wait), &mut out)
        .with_context(|| format!("Failed to replay {}", args.file.display()))?;

    info!(
        "Replayed {} chunks ({} bytes, {} skipped)",
        stats.chunks, stats.bytes, stats.skipped
    );
    Ok(())
}

fn run_merge(args: MergeArgs) -> anyhow::Result<()> {
    let output = offline::merge_output_path(args.output.as_deref(), SystemTime::now());
    let summary = merge::merge(&args.files, &output)
        .with_context(|| format!("Failed to merge into {}", output.display()))?;

    println!(
        "Merged {} recordings ({} chunks) into {}",
        summary.inputs,
        summary.chunks,
        summary.output.display()
    );
    Ok(())
}

fn run_recordings(args: RecordingsArgs) -> anyhow::Result<()> {
    let dir = paths::get_records_dir(args.dir.as_deref());
    match args.action {
        None | Some(RecordingsAction::List) => list_recordings(&dir),
        Some(RecordingsAction::Rm { name }) => {
            let path = offline::delete_recording(&dir, &name)?;
            println!("Deleted {}", path.display());
            Ok(())
        }
        Some(RecordingsAction::Rename { old, new }) => {
            let path = offline::rename_recording(&dir, &old, &new)?;
            println!("Renamed {} to {}", old, path.display());
            Ok(())
        }
    }
}

fn list_recordings(dir: &Path) -> anyhow::Result<()> {
    let recordings = offline::list_recordings(dir)?;

    if recordings.is_empty() {
        println!("No recordings in {}", dir.display());
        return Ok(());
    }

    println!("{:<40} {:>10} {:>10}  MODIFIED", "NAME", "SIZE", "DURATION");
    for entry in recordings {
        let name = entry
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let duration = entry
            .seconds
            .map(|s| format!("{}s", s))
            .unwrap_or_else(|| "?".to_string());
        let modified = entry
            .modified
            .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "{:<40} {:>10} {:>10}  {}",
            name,
            format!("{} KiB", entry.size_kib()),
            duration,
            modified
        );
    }
    Ok(())
}

/// Run the daemon server with graceful signal handling.
///
/// SIGINT (Ctrl+C) and SIGTERM trigger the same graceful shutdown as
/// `shellcast stop`. The DaemonServer's Drop impl cleans up socket and PID files.
fn run_daemon(args: DaemonArgs) {
    let command = if args.command.is_empty() {
        vec!["bash".to_string()]
    } else {
        args.command
    };
    let config = DaemonConfig {
        listen: SocketAddr::new(args.bind, args.port),
        origin_host: args.origin_host,
        command,
        records_dir: paths::get_records_dir(args.records_dir.as_deref()),
        max_sessions: args.max_sessions,
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        let server = match DaemonServer::bind(config).await {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to start daemon: {:#}", e);
                std::process::exit(1);
            }
        };

        // Signals stop the run loop the same way the shutdown command does.
        let shutdown = server.shutdown_handle();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down gracefully");
                }
                _ = sigterm() => {
                    info!("Received SIGTERM, shutting down gracefully");
                }
            }
            shutdown.notify_one();
        });

        if let Err(e) = server.run().await {
            error!("Daemon error: {}", e);
            std::process::exit(1);
        }
        // Server is dropped here, which removes the socket and PID files
    });
}

/// Wait for SIGTERM.
///
/// If the handler cannot be registered, waits forever so SIGINT still works.
#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(
                "Failed to register SIGTERM handler: {}, daemon will only respond to SIGINT",
                e
            );
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
