//! Validating-admission rules for Live objects. Webhook transport is the
//! embedder's concern; these are the rules it enforces on the API boundary,
//! before a spec change ever reaches the reconciler.

use thiserror::Error;

use crate::api::Live;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("previous apply is not complete")]
    ApplyInProgress,
    #[error("not allowed to change serviceAccountName")]
    ServiceAccountChanged,
}

pub fn validate_create(_live: &Live) -> Result<(), AdmissionError> {
    Ok(())
}

/// A mid-apply Live only takes spec updates when the old or the new spec
/// opts into interruption. The service account is immutable outright.
pub fn validate_update(old: &Live, new: &Live) -> Result<(), AdmissionError> {
    if !old.can_interrupt() && !new.can_interrupt() {
        return Err(AdmissionError::ApplyInProgress);
    }
    if old.spec.service_account_name != new.spec.service_account_name {
        return Err(AdmissionError::ServiceAccountChanged);
    }
    Ok(())
}

/// Deletion is always permitted; cleanup is the destroy finalizer's job.
pub fn validate_delete(_live: &Live) -> Result<(), AdmissionError> {
    Ok(())
}
