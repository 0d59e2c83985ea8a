use charter_core::UnknownOperation;
use charter_release::ReleaseError;
use serde::{Deserialize, Serialize};

/// Errors surfaced to protocol callers. Everything other than the
/// precondition cases collapses into a description string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum BrokerError {
    #[error("this service plan requires client support for asynchronous service operations")]
    AsyncRequired,
    #[error("unknown operation data: {0:?}")]
    UnknownOperation(String),
    #[error("bind requires an app_guid when a credential store is configured")]
    MissingAppGuid,
    #[error("internal: {0}")]
    Internal(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

impl BrokerError {
    pub fn internal(msg: impl Into<String>) -> Self { BrokerError::Internal(msg.into()) }
}

impl From<anyhow::Error> for BrokerError {
    fn from(e: anyhow::Error) -> Self { BrokerError::Internal(format!("{:#}", e)) }
}

impl From<ReleaseError> for BrokerError {
    fn from(e: ReleaseError) -> Self {
        match e {
            ReleaseError::Other(inner) => inner.into(),
            other => BrokerError::Internal(other.to_string()),
        }
    }
}

impl From<UnknownOperation> for BrokerError {
    fn from(e: UnknownOperation) -> Self { BrokerError::UnknownOperation(e.0) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn internal_errors_keep_the_context_chain() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("connection refused")).context("reading cluster credentials");
        let b: BrokerError = err.unwrap_err().into();
        assert_eq!(b, BrokerError::Internal("reading cluster credentials: connection refused".into()));
    }

    #[test]
    fn release_errors_become_descriptions() {
        let b: BrokerError = ReleaseError::NotFound("r-x".into()).into();
        assert_eq!(b.to_string(), "internal: release r-x not found");
    }
}
