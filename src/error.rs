/// The five error kinds from the design: misuse, resource, storage, policy, network.
/// Each maps to a distinct SQLSTATE-ish code so host-side tooling (and tests) can
/// assert on the kind without string-matching the message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloudSyncError {
    /// Invalid arguments, unknown table, schema sanity-check failure, disallowed
    /// vtab write, payload signature/schema_hash rejection.
    #[error("cloudsync misuse: {0}")]
    Misuse(String),
    /// Allocation failure surfaced with a distinct code so tests can assert it.
    #[error("cloudsync resource error: {0}")]
    Resource(String),
    /// The underlying store returned a non-OK result for a prepared statement.
    #[error("cloudsync storage error: {0}")]
    Storage(String),
    /// A payload-apply callback vetoed a row. Not fatal for the batch.
    #[error("cloudsync policy veto on {table} pk={pk_hex}: {reason}")]
    Policy { table: String, pk_hex: String, reason: String },
    /// The HTTP collaborator failed. Cursors are not advanced.
    #[error("cloudsync network error: {0}")]
    Network(String),
}

impl CloudSyncError {
    pub fn misuse(msg: impl Into<String>) -> Self {
        Self::Misuse(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    /// Short tag used in log lines and in the SQLSTATE-style code surfaced to SQL.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            Self::Misuse(_) => "misuse",
            Self::Resource(_) => "resource",
            Self::Storage(_) => "storage",
            Self::Policy { .. } => "policy",
            Self::Network(_) => "network",
        }
    }
}

pub type Result<T> = std::result::Result<T, CloudSyncError>;

/// Raise `err` as a Postgres ERROR. This is the only place a `CloudSyncError`
/// should be unwrapped into an `ereport!` — internal functions propagate with `?`.
pub fn raise(err: CloudSyncError) -> ! {
    pgrx::error!("{}", err);
}
