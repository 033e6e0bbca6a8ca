use thiserror::Error;

/// Errors surfaced by the [`crate::store::Store`] layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("blocking task join: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// The only error type the [`crate::repository::Repository`] surfaces upward.
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Uniform transient failure from a [`crate::gateway::RemoteGateway`] call.
///
/// Every gateway failure is transient from the core's perspective; the
/// engine counts retries rather than branching on failure kind.
#[derive(Error, Debug, Clone)]
#[error("remote gateway: {0}")]
pub struct GatewayError(pub String);

impl GatewayError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
