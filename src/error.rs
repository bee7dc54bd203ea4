use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("external tool is missing: {tool}")]
    ToolNotFound { tool: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("failed to launch {tool}: {message}")]
    ProcessLaunchFailed { tool: String, message: String },

    #[error("source unavailable or restricted: {0}")]
    UnavailableOrRestrictedSource(String),

    #[error("unsupported source: {0}")]
    UnsupportedSource(String),

    #[error("requested format unavailable: {0}")]
    FormatUnavailable(String),

    #[error("no artifact produced: {0}")]
    NoArtifactProduced(String),

    #[error("artifact too small: {path} ({bytes} bytes)")]
    ArtifactTooSmall { path: PathBuf, bytes: u64 },

    #[error("external tool failed: {tool} (code={code:?}) {detail}")]
    ExternalToolError {
        tool: String,
        code: Option<i32>,
        detail: String,
    },

    #[error("download cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tool install failed: {0}")]
    InstallFailed(String),
}

impl EngineError {
    /// Maps a spawn failure for `tool` onto the launch taxonomy.
    pub fn from_spawn(tool: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => EngineError::ToolNotFound {
                tool: tool.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => EngineError::PermissionDenied(format!(
                "{tool} could not be started: {err}"
            )),
            _ => EngineError::ProcessLaunchFailed {
                tool: tool.to_string(),
                message: err.to_string(),
            },
        }
    }

    /// I/O failures during a run: access problems keep their own kind so the
    /// user is pointed at folder permissions.
    pub fn from_io(context: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => {
                EngineError::PermissionDenied(format!("{context}: {err}"))
            }
            _ => EngineError::Io(err),
        }
    }

    /// Non-technical explanation shown to the user. The raw diagnostic stays in
    /// `Display` and goes to the diagnostic log.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::ToolNotFound { tool } => format!(
                "{tool} was not found. Make sure it is installed and available on PATH."
            ),
            EngineError::PermissionDenied(_) => {
                "Permission error while accessing files. Check the permissions of the destination folder."
                    .to_string()
            }
            EngineError::ProcessLaunchFailed { tool, .. } => {
                format!("The download process ({tool}) could not be started.")
            }
            EngineError::UnavailableOrRestrictedSource(msg)
            | EngineError::UnsupportedSource(msg)
            | EngineError::FormatUnavailable(msg)
            | EngineError::NoArtifactProduced(msg) => msg.clone(),
            EngineError::ArtifactTooSmall { .. } => {
                "The downloaded file is too small. The requested quality may not be available for this video."
                    .to_string()
            }
            EngineError::ExternalToolError { code: Some(code), .. } => {
                format!("The download process failed with error code {code}.")
            }
            EngineError::ExternalToolError { detail, .. } => {
                format!("The download process failed: {detail}")
            }
            EngineError::Cancelled => "Download cancelled.".to_string(),
            other => format!("Unexpected error: {other}. See the diagnostic log for details."),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_not_found_maps_to_tool_not_found() {
        let err = EngineError::from_spawn(
            "yt-dlp",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(matches!(err, EngineError::ToolNotFound { ref tool } if tool == "yt-dlp"));
        assert!(err.user_message().contains("yt-dlp was not found"));
    }

    #[test]
    fn spawn_permission_error_is_distinct_from_launch_failure() {
        let denied = EngineError::from_spawn(
            "yt-dlp",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
        );
        assert!(matches!(denied, EngineError::PermissionDenied(_)));

        let other = EngineError::from_spawn("yt-dlp", std::io::Error::other("boom"));
        assert!(matches!(other, EngineError::ProcessLaunchFailed { .. }));
    }

    #[test]
    fn io_permission_error_is_reported_as_permission() {
        let err = EngineError::from_io(
            "create /out",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(matches!(err, EngineError::PermissionDenied(ref m) if m.starts_with("create /out")));
        assert!(err.user_message().starts_with("Permission error"));

        let other = EngineError::from_io("create /out", std::io::Error::other("disk gone"));
        assert!(matches!(other, EngineError::Io(_)));
    }

    #[test]
    fn user_message_hides_raw_diagnostic_for_tool_errors() {
        let err = EngineError::ExternalToolError {
            tool: "yt-dlp".to_string(),
            code: Some(2),
            detail: "Traceback (most recent call last)".to_string(),
        };
        assert!(!err.user_message().contains("Traceback"));
        assert!(err.to_string().contains("Traceback"));
    }
}
