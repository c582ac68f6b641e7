use thiserror::Error;

/// Errors surfaced by the deployment core to its callers.
///
/// Anything raised inside a background deploy is never returned to a caller;
/// it ends up as a `failed` status plus message on the application record.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("failed to decrypt {what}: {source}")]
    Decryption {
        what: &'static str,
        #[source]
        source: CipherError,
    },

    #[error("failed to encrypt {what}: {source}")]
    Encryption {
        what: &'static str,
        #[source]
        source: CipherError,
    },

    #[error("failed to connect to cluster: {0}")]
    Connection(String),

    #[error("cluster request failed: {0}")]
    Cluster(#[from] ClusterApiError),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("store failure: {0:#}")]
    Store(#[source] anyhow::Error),
}

impl DeployError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        DeployError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        DeployError::Validation(message.into())
    }
}

/// Failures reported by a cluster API adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterApiError {
    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Request(String),
}

impl ClusterApiError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterApiError::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterApiError::NotFound(_))
    }
}

/// Failures of the authenticated encryption collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("encryption key must be 32 bytes (64 hex characters): {0}")]
    InvalidKey(String),

    #[error("ciphertext too short")]
    TooShort,

    #[error("ciphertext authentication failed (tampered data or wrong key)")]
    Authentication,
}

/// Failures of the persistent store collaborator.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<RepositoryError> for DeployError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Duplicate(what) => DeployError::Conflict(what),
            RepositoryError::Backend(err) => DeployError::Store(err),
        }
    }
}

pub type Result<T, E = DeployError> = std::result::Result<T, E>;
