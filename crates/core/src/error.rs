use std::fmt;
use thiserror::Error;

/// What the remote service said when it rejected a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStatus {
    /// Non-2xx HTTP status.
    Http(u16),
    /// Error code carried inside the batch response envelope.
    Rpc(i64),
    /// Envelope contained an error entry without a usable code.
    Rejected,
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(code) => write!(f, "HTTP {}", code),
            Self::Rpc(code) => write!(f, "RPC error {}", code),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Profile not found: {profile_name}")]
    ProfileNotFound { profile_name: String },

    #[error(
        "Account mismatch for profile '{profile_name}': stored account is '{stored_email}' \
         but received credentials for '{new_email}'"
    )]
    AccountMismatch {
        stored_email: String,
        new_email: String,
        profile_name: String,
    },

    #[error("Login for profile '{profile_name}' not completed within {timeout_secs}s")]
    AuthenticationTimeout {
        profile_name: String,
        timeout_secs: u64,
    },

    #[error("Authentication failed for profile '{profile_name}' calling {operation_id}: {message}")]
    Authentication {
        profile_name: String,
        operation_id: String,
        message: String,
    },

    #[error("Transport error calling {operation_id} after {attempts} attempt(s): {message}")]
    Transport {
        operation_id: String,
        attempts: u32,
        message: String,
    },

    #[error("Malformed response for {operation_id}: {detail}")]
    MalformedResponse { operation_id: String, detail: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("RPC {operation_id} failed: {status}")]
    Rpc {
        operation_id: String,
        status: RpcStatus,
    },

    #[error("Artifact not found: {artifact_id}")]
    ArtifactNotFound { artifact_id: String },

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn malformed(operation_id: &str, detail: impl Into<String>) -> Self {
        Self::MalformedResponse {
            operation_id: operation_id.to_string(),
            detail: detail.into(),
        }
    }

    /// Short suggestion a presentation layer can show next to the message.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ProfileNotFound { .. } => {
                Some("Run `nlmkit login --profile <name>` to create the profile.")
            }
            Self::AccountMismatch { .. } => {
                Some("Use `nlmkit login --force` to overwrite the profile with the new account.")
            }
            Self::AuthenticationTimeout { .. } => {
                Some("Finish signing in within the browser window, or raise --timeout.")
            }
            Self::Authentication { .. } => {
                Some("Your session may have expired. Run `nlmkit login` to re-authenticate.")
            }
            Self::Transport { .. } => Some("Check your network connection and try again."),
            Self::MalformedResponse { .. } => {
                Some("The service response format may have changed; try updating nlmkit.")
            }
            Self::Rpc {
                status: RpcStatus::Http(429),
                ..
            } => Some("Rate limited; wait a moment and try again."),
            _ => None,
        }
    }

    /// True for errors that say the credentials were refused.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
