//! Protocol types for CLI-daemon communication over the control socket.

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// A request from CLI to daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub command: Command,
}

/// Commands the daemon can execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    /// List all active driven sessions.
    ListSessions,
    /// Start recording the output of a session.
    StartRecording { session: String },
    /// Stop recording and finalize the file.
    StopRecording { session: String },
    /// Shutdown the daemon gracefully.
    Shutdown,
}

/// A response from daemon to CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl Response {
    pub fn success(id: impl Into<String>, data: ResponseData) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ApiError) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Response payload variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    /// List of active sessions.
    Sessions { sessions: Vec<SessionInfo> },
    /// Generic success message.
    Ok { message: String },
}

/// Information about an active session, as shown on a status listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    pub peer_addr: String,
    pub command: Vec<String>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let request = Request {
            id: "1".to_string(),
            command: Command::StartRecording {
                session: "main".to_string(),
            },
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"id":"1","command":{"action":"start_recording","session":"main"}}"#
        );
    }

    #[test]
    fn test_unit_command_parses() {
        let request: Request =
            serde_json::from_str(r#"{"id":"7","command":{"action":"list_sessions"}}"#).unwrap();
        assert_eq!(request.command, Command::ListSessions);
    }

    #[test]
    fn test_error_response_omits_data() {
        let response = Response::error("x", ApiError::session_not_found("gone"));
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("\"data\""));
        assert!(json.contains("SESSION_NOT_FOUND"));
    }
}
