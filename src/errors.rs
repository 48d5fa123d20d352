use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by every core component. The facade surfaces these
/// unchanged; the CLI boundary wraps them in `anyhow`.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input: unknown provider id, malformed transition, missing field.
    #[error("{0}")]
    Validation(String),

    /// An agent, task, session, or skill id that does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// An assignment/transition the actor is not allowed to make.
    #[error("{0}")]
    AuthorityDenied(String),

    /// An OpenClaw create/delete/config step failed. `rolled_back` records
    /// whether local state was undone before raising.
    #[error("runtime sync failed: {message}")]
    RuntimeSync { message: String, rolled_back: bool },

    /// Spawn ENOENT, unparsable runtime output, or another condition with a
    /// fallback path.
    #[error("{0}")]
    Transient(String),

    /// The run's abort signal fired. Converted to a non-zero exit result
    /// before it reaches callers of `run`.
    #[error("run aborted")]
    Cancelled,

    /// Filesystem unavailable or similarly unrecoverable.
    #[error(transparent)]
    Fatal(#[from] std::io::Error),

    /// Corrupt persisted state.
    #[error("invalid persisted state: {0}")]
    State(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn authority(msg: impl Into<String>) -> Self {
        Error::AuthorityDenied(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    pub fn runtime_sync(msg: impl Into<String>, rolled_back: bool) -> Self {
        Error::RuntimeSync {
            message: msg.into(),
            rolled_back,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(e) => e,
            Err(err) => match err.downcast::<std::io::Error>() {
                Ok(io) => Error::Fatal(io),
                Err(err) => Error::Validation(err.to_string()),
            },
        }
    }
}
