//! API error types with suggestions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for protocol responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SessionNotFound,
    SessionExists,
    CommandFailed,
    InvalidInput,
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::SessionNotFound => write!(f, "SESSION_NOT_FOUND"),
            ErrorCode::SessionExists => write!(f, "SESSION_EXISTS"),
            ErrorCode::CommandFailed => write!(f, "COMMAND_FAILED"),
            ErrorCode::InvalidInput => write!(f, "INVALID_INPUT"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

/// An error response with operator-facing context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (hint: {})", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn session_not_found(session: &str) -> Self {
        Self {
            code: ErrorCode::SessionNotFound,
            message: format!("Session '{}' not found", session),
            suggestion: Some("Run 'shellcast list-sessions' to see active sessions".into()),
        }
    }

    /// A driver tried to open a session whose identifier is already live.
    pub fn duplicate_session_name(name: &str) -> Self {
        Self {
            code: ErrorCode::SessionExists,
            message: format!("Session '{}' already exists", name),
            suggestion: Some(format!(
                "Connect as a viewer via /ws_view/{} or pick another identifier",
                name
            )),
        }
    }

    /// Create an error when the session limit is reached.
    pub fn session_limit_reached(max: usize) -> Self {
        Self {
            code: ErrorCode::CommandFailed,
            message: format!("Maximum session limit ({}) reached", max),
            suggestion: Some(
                "Close an existing terminal or restart the daemon with a higher --max-sessions"
                    .into(),
            ),
        }
    }

    /// Create a spawn failed error with context about what went wrong.
    pub fn spawn_failed(command: &[String], error: &str) -> Self {
        let cmd_str = if command.is_empty() {
            "(empty command)".to_string()
        } else {
            command.join(" ")
        };
        Self {
            code: ErrorCode::CommandFailed,
            message: format!("Failed to spawn '{}': {}", cmd_str, error),
            suggestion: Some(format!(
                "Verify '{}' exists in the daemon's PATH and is executable",
                command.first().map_or("the command", |s| s.as_str())
            )),
        }
    }

    /// Create an invalid input error with a custom suggestion.
    pub fn invalid_input_with_suggestion(
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InternalError,
            message: message.into(),
            suggestion: Some("This is an internal error. Please report it if it persists.".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_has_suggestion(err: &ApiError, context: &str) {
        assert!(
            err.suggestion.is_some(),
            "{} should have a suggestion, but got None",
            context
        );
    }

    #[test]
    fn test_session_not_found_has_suggestion() {
        let err = ApiError::session_not_found("abc123");
        assert_has_suggestion(&err, "session_not_found");
        assert!(err.suggestion.as_ref().unwrap().contains("list-sessions"));
        assert!(err.message.contains("abc123"));
    }

    #[test]
    fn test_duplicate_session_points_at_viewer_route() {
        let err = ApiError::duplicate_session_name("main");
        assert_eq!(err.code, ErrorCode::SessionExists);
        assert!(err.message.contains("main"));
        assert!(err.suggestion.as_ref().unwrap().contains("/ws_view/main"));
    }

    #[test]
    fn test_session_limit_reached() {
        let err = ApiError::session_limit_reached(4);
        assert_has_suggestion(&err, "session_limit_reached");
        assert!(err.message.contains('4'));
    }

    #[test]
    fn test_spawn_failed_has_suggestion() {
        let cmd = vec!["zsh".to_string(), "-l".to_string()];
        let err = ApiError::spawn_failed(&cmd, "No such file or directory");
        assert_has_suggestion(&err, "spawn_failed");
        assert!(err.message.contains("zsh -l"));
        assert!(err.suggestion.as_ref().unwrap().contains("zsh"));
    }

    #[test]
    fn test_spawn_failed_empty_command() {
        let err = ApiError::spawn_failed(&[], "no command");
        assert!(err.message.contains("(empty command)"));
    }

    #[test]
    fn test_display_format_with_suggestion() {
        let err = ApiError::session_not_found("abc");
        let display = format!("{}", err);
        assert!(display.contains("[SESSION_NOT_FOUND]"));
        assert!(display.contains("abc"));
        assert!(display.contains("(hint:"));
    }

    #[test]
    fn test_json_deserialization() {
        let json =
            r#"{"code":"SESSION_EXISTS","message":"Session 'x' already exists","suggestion":null}"#;
        let err: ApiError = serde_json::from_str(json).unwrap();
        assert_eq!(err.code, ErrorCode::SessionExists);
        assert_eq!(err.suggestion, None);
    }
}
