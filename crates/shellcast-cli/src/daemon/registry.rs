//! Registry of live driven sessions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shellcast_core::error::ApiError;
use shellcast_core::protocol::SessionInfo;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::daemon::recorder::RecordCommand;
use crate::daemon::transport::Observer;

/// Default cap on concurrently driven sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 100;

/// What the registry knows about a session: identity plus the two control
/// channels into its fan-out loop. It owns none of the session's resources.
pub struct SessionHandle {
    pub name: String,
    pub peer: String,
    pub command: Vec<String>,
    pub created_at: DateTime<Utc>,
    observers: mpsc::UnboundedSender<Observer>,
    records: mpsc::UnboundedSender<RecordCommand>,
}

impl SessionHandle {
    pub fn new(
        name: impl Into<String>,
        peer: impl Into<String>,
        command: &[String],
        observers: mpsc::UnboundedSender<Observer>,
        records: mpsc::UnboundedSender<RecordCommand>,
    ) -> Self {
        Self {
            name: name.into(),
            peer: peer.into(),
            command: command.to_vec(),
            created_at: Utc::now(),
            observers,
            records,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            name: self.name.clone(),
            peer_addr: self.peer.clone(),
            command: self.command.clone(),
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

/// Maps session identifiers to their handles.
///
/// Collision policy: the first session under an identifier wins. A second
/// registration is refused and the caller is responsible for releasing
/// whatever it already started.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    max_sessions: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS)
    }
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    fn admission(
        sessions: &HashMap<String, SessionHandle>,
        name: &str,
        max_sessions: usize,
    ) -> Result<(), ApiError> {
        if sessions.contains_key(name) {
            return Err(ApiError::duplicate_session_name(name));
        }
        if sessions.len() >= max_sessions {
            return Err(ApiError::session_limit_reached(max_sessions));
        }
        Ok(())
    }

    /// Whether a new session under `name` would be admitted right now.
    ///
    /// Lets callers refuse before spawning anything; [`register`](Self::register)
    /// repeats the check atomically.
    pub async fn check_available(&self, name: &str) -> Result<(), ApiError> {
        let sessions = self.sessions.read().await;
        Self::admission(&sessions, name, self.max_sessions)
    }

    pub async fn register(&self, handle: SessionHandle) -> Result<(), ApiError> {
        let mut sessions = self.sessions.write().await;
        if let Err(e) = Self::admission(&sessions, &handle.name, self.max_sessions) {
            warn!("Refusing to register session {}: {}", handle.name, e.message);
            return Err(e);
        }

        info!("Registered session {} for {}", handle.name, handle.peer);
        sessions.insert(handle.name.clone(), handle);
        Ok(())
    }

    /// Remove `name`. Returns whether it was present.
    pub async fn deregister(&self, name: &str) -> bool {
        let removed = self.sessions.write().await.remove(name).is_some();
        if removed {
            info!("Deregistered session {}", name);
        } else {
            debug!("Session {} was not registered", name);
        }
        removed
    }

    #[cfg(test)]
    pub async fn contains(&self, name: &str) -> bool {
        self.sessions.read().await.contains_key(name)
    }

    /// Hand an observer to the session's fan-out loop.
    ///
    /// On failure (unknown session, or one already tearing down) the
    /// observer is handed back so the caller can close it.
    pub async fn dispatch_observer(&self, name: &str, observer: Observer) -> Result<(), Observer> {
        let sessions = self.sessions.read().await;
        match sessions.get(name) {
            Some(handle) => handle.observers.send(observer).map_err(|e| e.0),
            None => Err(observer),
        }
    }

    /// Deliver a recording command. Returns false if the session is gone.
    pub async fn send_record_command(&self, name: &str, command: RecordCommand) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(name) {
            Some(handle) => handle.records.send(command).is_ok(),
            None => false,
        }
    }

    /// Visit every live session while holding the registry lock.
    pub async fn for_each(&self, mut visitor: impl FnMut(&SessionHandle)) {
        let sessions = self.sessions.read().await;
        for handle in sessions.values() {
            visitor(handle);
        }
    }

    /// Sessions sorted by name, for status listings.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos = Vec::new();
        self.for_each(|handle| infos.push(handle.info())).await;
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
