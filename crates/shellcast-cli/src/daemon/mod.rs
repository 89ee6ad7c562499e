//! Daemon process hosting relayed PTY sessions.

pub mod client;
pub mod observers;
pub mod paths;
pub mod pty;
pub mod recorder;
pub mod registry;
pub mod relay;
pub mod server;
pub mod transport;
pub mod websocket;
