//! Maps live release status onto the three-state operation lifecycle.
//!
//! Nothing is remembered between polls: the answer is derived from the
//! release status (and for installs, resource readiness) every time.

use charter_core::{LastOperation, OperationKind, OperationState};
use charter_release::{Readiness, ReleaseStatus};

use crate::error::{BrokerError, BrokerResult};

/// First stage: release status alone.
pub fn map_release_status(kind: OperationKind, status: ReleaseStatus) -> LastOperation {
    use OperationState::*;
    use ReleaseStatus as S;
    match kind {
        OperationKind::Provision => match status {
            S::Deployed => LastOperation::new(Succeeded, "service deployment succeeded"),
            S::PendingInstall | S::PendingUpgrade => LastOperation::new(InProgress, "deploy in progress"),
            other => LastOperation::new(Failed, format!("provision failed {}", other)),
        },
        OperationKind::Deprovision => match status {
            S::Deleted => LastOperation::new(Succeeded, "gone"),
            S::Deployed | S::Deleting => LastOperation::new(InProgress, "delete in progress"),
            other => LastOperation::new(Failed, format!("deprovision failed {}", other)),
        },
        OperationKind::Update => match status {
            S::Deployed => LastOperation::new(Succeeded, "updated"),
            other => LastOperation::new(Failed, format!("update failed {}", other)),
        },
    }
}

/// Whether a mapped result still has to pass the readiness probe.
pub fn needs_readiness(kind: OperationKind, mapped: &LastOperation) -> bool {
    kind != OperationKind::Deprovision && mapped.state == OperationState::Succeeded
}

/// Second stage: fold a readiness probe into a `Succeeded` result.
pub fn apply_readiness(mapped: LastOperation, readiness: Readiness) -> BrokerResult<LastOperation> {
    if readiness.status == ReleaseStatus::Unknown {
        return Err(BrokerError::internal(format!(
            "resource readiness unknown: {}",
            readiness.message.as_deref().unwrap_or("no detail")
        )));
    }
    let description = readiness.message.unwrap_or(mapped.description);
    if readiness.status == ReleaseStatus::PendingInstall {
        return Ok(LastOperation::new(OperationState::InProgress, description));
    }
    Ok(LastOperation::new(OperationState::Succeeded, description))
}
