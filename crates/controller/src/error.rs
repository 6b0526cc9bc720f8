use thiserror::Error;

/// A failure classified per spec §7: permanent failures carry
/// `disable_retry=true` regardless of the experiment's retry setting;
/// transient ones go through the ordinary §4.3 retry policy.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),
}

impl ActionError {
    pub fn debug_info(&self) -> String {
        match self {
            ActionError::Transient(s) | ActionError::Permanent(s) => s.clone(),
        }
    }
}

impl From<agency_core::TrusteeError> for ActionError {
    fn from(e: agency_core::TrusteeError) -> Self {
        if e.disable_retry() {
            ActionError::Permanent(e.to_string())
        } else {
            ActionError::Transient(e.to_string())
        }
    }
}

impl From<agency_core::StoreError> for ActionError {
    fn from(e: agency_core::StoreError) -> Self {
        ActionError::Transient(e.to_string())
    }
}

impl From<crate::host_driver::DriverError> for ActionError {
    fn from(e: crate::host_driver::DriverError) -> Self {
        ActionError::Transient(e.diagnostic().to_string())
    }
}
