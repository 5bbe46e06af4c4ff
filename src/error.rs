use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("quality gates failed: {}", .0.join("; "))]
    QualityGates(Vec<String>),

    #[error("state error: {0}")]
    State(String),

    #[error("config file is not valid JSON: {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("process error: {0}")]
    Process(String),

    #[error("agent '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("agent '{0}' is already running")]
    AlreadyRunning(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),
}

impl Error {
    /// Permanent errors are never retried: malformed input, protected-branch
    /// refusals, and registry misuse.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::Permanent(_)
                | Error::AlreadyRegistered(_)
                | Error::AlreadyRunning(_)
                | Error::UnknownAgent(_)
        )
    }

    /// Rate-limit responses are surfaced distinctly so callers can back off
    /// instead of retrying immediately.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
