use std::path::PathBuf;
use std::process::ExitCode;

/// Errors that cause colony to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    /// Conditions under which the daemon must stop rather than risk
    /// uncontrolled spawning: corrupt state, unreadable kill switch.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn code(&self) -> u8 {
        match self {
            ExitError::Config(_) => 2,
            ExitError::ToolNotFound { .. } => 3,
            ExitError::Timeout { .. } => 5,
            ExitError::Fatal(_) => 7,
            ExitError::Other(_) => 1,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }
}

/// Failures of the persistence layer shared by every store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt state in {}: {detail}", path.display())]
    Corrupt { path: PathBuf, detail: String },

    #[error("lock on {} not acquired within {waited_ms}ms", path.display())]
    LockTimeout { path: PathBuf, waited_ms: u64 },
}

impl StoreError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }

    /// Corruption is never recoverable locally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Corrupt { .. })
    }
}

/// Errors surfaced by the mailbox delivery contract.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("invalid cell name {0:?}: must match [a-z0-9][a-z0-9_-]*, max 64 chars")]
    InvalidCell(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("mailbox for {cell} is busy")]
    MailboxBusy { cell: String },

    #[error("no message {id} in {cell}")]
    UnknownMessage { cell: String, id: u64 },

    #[error("message {id} in {cell} is archived")]
    Archived { cell: String, id: u64 },

    #[error("message {id} in {cell}: cannot move from {from} to {to}")]
    InvalidTransition {
        cell: String,
        id: u64,
        from: String,
        to: String,
    },

    #[error(transparent)]
    Store(StoreError),
}

impl MailboxError {
    /// Transient conditions the caller retries with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, MailboxError::MailboxBusy { .. })
            || matches!(self, MailboxError::Store(StoreError::Io { .. }))
    }
}

impl From<StoreError> for MailboxError {
    fn from(err: StoreError) -> Self {
        MailboxError::Store(err)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no error with fingerprint {0}")]
    UnknownFingerprint(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
