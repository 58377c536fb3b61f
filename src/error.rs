// Request-level error taxonomy shared by the catalog and dashboard services

use thiserror::Error;

use crate::document_store::StoreError;
use crate::kv_store::KvError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // Cache unavailable. Reads and fills recover from this locally; it only
    // reaches the caller when an invalidation could not be delivered.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<KvError> for CatalogError {
    fn from(err: KvError) -> Self {
        CatalogError::UpstreamUnavailable(err.to_string())
    }
}

impl CatalogError {
    // Errors that a handler should answer with a 5xx
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            CatalogError::UpstreamUnavailable(_) | CatalogError::Store(_) | CatalogError::Codec(_)
        )
    }
}
