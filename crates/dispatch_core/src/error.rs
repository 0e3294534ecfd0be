use shared::{
    domain::{DeliveryId, DeliveryStatus},
    error::{ApiError, ErrorCode, ErrorDisposition},
};
use thiserror::Error;

/// Failure taxonomy of the lifecycle controller. Every variant is
/// recoverable by the caller; a failed transition never leaves a partial
/// write behind.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("delivery {0} not found")]
    NotFound(DeliveryId),

    #[error("delivery was already claimed (status is {status})")]
    AlreadyClaimed { status: DeliveryStatus },

    #[error("courier already has active delivery {delivery_id}")]
    AlreadyHasActiveDelivery { delivery_id: DeliveryId },

    #[error("pickup code does not match")]
    InvalidPickupCode,

    #[error("cannot {action} a delivery in status {from}")]
    InvalidTransition {
        from: DeliveryStatus,
        action: &'static str,
    },

    #[error("{0}")]
    Forbidden(String),

    #[error("store unavailable: {0}")]
    Store(#[source] anyhow::Error),
}

impl DispatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DispatchError::Validation(_) => ErrorCode::Validation,
            DispatchError::NotFound(_) => ErrorCode::NotFound,
            DispatchError::AlreadyClaimed { .. } => ErrorCode::AlreadyClaimed,
            DispatchError::AlreadyHasActiveDelivery { .. } => ErrorCode::AlreadyHasActiveDelivery,
            DispatchError::InvalidPickupCode => ErrorCode::InvalidPickupCode,
            DispatchError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            DispatchError::Forbidden(_) => ErrorCode::Forbidden,
            DispatchError::Store(_) => ErrorCode::StoreUnavailable,
        }
    }

    pub fn disposition(&self) -> ErrorDisposition {
        self.code().disposition()
    }
}

impl From<anyhow::Error> for DispatchError {
    fn from(err: anyhow::Error) -> Self {
        DispatchError::Store(err)
    }
}

impl From<&DispatchError> for ApiError {
    fn from(err: &DispatchError) -> Self {
        ApiError::new(err.code(), err.to_string())
    }
}
