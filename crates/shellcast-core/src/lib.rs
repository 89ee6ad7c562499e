//! Core types and logic for shellcast.
//!
//! This crate holds everything that does not touch a socket or a PTY: the
//! control protocol spoken between the CLI and the daemon, the API error
//! type, and the offline side of session recording.
//!
//! # Modules
//!
//! - [`error`]: API error types with actionable suggestions
//! - [`protocol`]: JSON-line request/response protocol for the control socket
//! - [`recording`]: streaming codec for recorded `(elapsed, bytes)` chunks
//! - [`replay`]: paced playback of a recording to a terminal-like sink
//! - [`merge`]: concatenation of several recordings into one
//!
//! # Recording format
//!
//! A recording is a JSON array written one element at a time:
//!
//! ```text
//! [{"Duration":1200000,"Data":"aGVsbG8NCg=="},{"Duration":35000000,"Data":"JCA="}]
//! ```
//!
//! `Duration` is the time since the previous chunk in nanoseconds and `Data`
//! is the raw output block in standard base64. A file that was never closed
//! (missing the final `]`) is rejected by every reader.

pub mod error;
pub mod merge;
pub mod protocol;
pub mod recording;
pub mod replay;
