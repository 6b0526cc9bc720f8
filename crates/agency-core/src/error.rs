use thiserror::Error;

/// Errors surfaced by the persistence port.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found")]
    NotFound,
    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the trustee IPC client.
#[derive(Debug, Error)]
pub enum TrusteeError {
    #[error("transient trustee failure, node should be inspected")]
    Transient,
    #[error("permanent trustee failure: {0}")]
    Permanent(String),
}

impl TrusteeError {
    pub fn disable_retry(&self) -> bool {
        matches!(self, TrusteeError::Permanent(_))
    }

    pub fn inspect(&self) -> bool {
        matches!(self, TrusteeError::Transient)
    }
}

/// GPU placement failure: requested devices could not all be satisfied.
#[derive(Debug, Error)]
#[error("insufficient GPU capacity: {0} of the requested devices could not be matched")]
pub struct InsufficientGpu(pub usize);
