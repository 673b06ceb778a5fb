use thiserror::Error;

/// Core error types for vipkeeper
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// iptables command execution failed
    #[error("iptables error: {message}")]
    Iptables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// The chain or rule addressed by an executor call does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Firewall dump could not be parsed
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Cluster directory query failed
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// HTTP transport to the cluster directory failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Process configuration is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Builds an executor failure from a finished iptables invocation.
    pub fn iptables(program: &str, stderr: &str, exit_code: Option<i32>) -> Self {
        let stderr = stderr.trim().to_string();
        Error::Iptables {
            message: format!("{program} exited with {exit_code:?}: {stderr}"),
            stderr: Some(stderr),
            exit_code,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Operator-facing hint for executor failures, if one applies.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Error::Iptables {
                stderr, exit_code, ..
            } => IptablesErrorPattern::classify(stderr.as_deref().unwrap_or_default(), *exit_code)
                .hint(),
            _ => None,
        }
    }
}

/// Structural errors in an `iptables-save` dump
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected table line before COMMIT: {0}")]
    UnexpectedTable(String),

    #[error("failed to find the COMMIT line")]
    MissingCommit,
}

/// What an iptables failure means for the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    LockContention,
    Other,
}

impl ErrorKind {
    pub fn hint(self) -> Option<&'static str> {
        match self {
            ErrorKind::PermissionDenied => {
                Some("run as root, or set VIPKEEPER_ELEVATION_METHOD=sudo with a NOPASSWD rule")
            }
            ErrorKind::LockContention => {
                Some("another process holds the xtables lock; the next tick retries")
            }
            ErrorKind::NotFound => Some("the nat chain may have been flushed by another manager"),
            ErrorKind::AlreadyExists | ErrorKind::Other => None,
        }
    }
}

/// Database of iptables stderr patterns
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Classifies iptables stderr output.
    ///
    /// iptables reports "does not exist" conditions with exit status 1 and one
    /// of a handful of fixed messages; anything else is a real failure.
    pub fn classify(stderr: &str, exit_code: Option<i32>) -> ErrorKind {
        let lower = stderr.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorKind::PermissionDenied;
        }

        if lower.contains("another app is currently holding the xtables lock")
            || lower.contains("resource temporarily unavailable")
        {
            return ErrorKind::LockContention;
        }

        if exit_code != Some(1) {
            return ErrorKind::Other;
        }

        if lower.contains("chain already exists") {
            return ErrorKind::AlreadyExists;
        }

        if lower.contains("no chain/target/match by that name")
            || lower.contains("index of deletion too big")
            || lower.contains("bad rule (does a matching rule exist in that chain?)")
            || lower.contains("does not exist")
        {
            return ErrorKind::NotFound;
        }

        ErrorKind::Other
    }
}

pub type Result<T> = std::result::Result<T, Error>;
