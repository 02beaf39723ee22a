use thiserror::Error;

/// Why the repository could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryErrorKind {
    /// Network or ssh level failure. Worth retrying.
    Unreachable,
    /// Wrong or missing passphrase, or the key was rejected.
    AuthFailed,
    /// Still corrupted after one repair pass.
    Corrupted,
    /// `borg init` or `borg check --repair` itself failed.
    Tool,
}

impl RepositoryErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RepositoryErrorKind::Unreachable => "unreachable",
            RepositoryErrorKind::AuthFailed => "auth_failed",
            RepositoryErrorKind::Corrupted => "corrupted",
            RepositoryErrorKind::Tool => "tool",
        }
    }

    pub fn retryable(self) -> bool {
        matches!(self, RepositoryErrorKind::Unreachable)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("ssh identity error: {0}")]
    Identity(String),

    #[error("repository {}: {message}", kind.as_str())]
    Repository {
        kind: RepositoryErrorKind,
        message: String,
    },

    #[error("execution error: {0}")]
    Execution(String),

    #[error("status reporting error: {0}")]
    Reporting(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::Config(msg.into())
    }

    pub fn identity<M: Into<String>>(msg: M) -> Self {
        Self::Identity(msg.into())
    }

    pub fn repository<M: Into<String>>(kind: RepositoryErrorKind, msg: M) -> Self {
        Self::Repository {
            kind,
            message: msg.into(),
        }
    }

    pub fn execution<M: Into<String>>(msg: M) -> Self {
        Self::Execution(msg.into())
    }

    pub fn reporting<M: Into<String>>(msg: M) -> Self {
        Self::Reporting(msg.into())
    }

    /// Stable identifier published in the failure status event.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::Identity(_) => "identity_error",
            Error::Repository { .. } => "repository_error",
            Error::Execution(_) => "execution_error",
            Error::Reporting(_) => "reporting_error",
            Error::Io(_) => "io_error",
        }
    }

    pub fn repository_kind(&self) -> Option<RepositoryErrorKind> {
        match self {
            Error::Repository { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 2,
            Error::Identity(_) => 3,
            Error::Repository { .. } => 4,
            Error::Execution(_) => 5,
            Error::Reporting(_) | Error::Io(_) => 1,
        }
    }

    /// Message without the category prefix Display adds.
    pub fn detail(&self) -> String {
        match self {
            Error::Config(m)
            | Error::Identity(m)
            | Error::Execution(m)
            | Error::Reporting(m) => m.clone(),
            Error::Repository { message, .. } => message.clone(),
            Error::Io(e) => e.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::execution(format!("json decode error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
