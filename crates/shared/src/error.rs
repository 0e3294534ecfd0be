use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable machine-readable failure codes surfaced to the role portals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    NotFound,
    AlreadyClaimed,
    AlreadyHasActiveDelivery,
    InvalidPickupCode,
    InvalidTransition,
    Forbidden,
    StoreUnavailable,
}

/// What a portal should do with the failure. None of these are fatal; every
/// failure leaves the delivery record in its prior state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDisposition {
    /// The opportunity is gone; navigate back to a safe default view.
    RedirectToSafeView,
    /// Keep the current view; the caller may retry once conditions change.
    KeepView,
    /// Surface inline next to the input; the caller may retry immediately.
    RetryInline,
}

impl ErrorCode {
    pub fn disposition(self) -> ErrorDisposition {
        match self {
            ErrorCode::NotFound | ErrorCode::AlreadyClaimed => {
                ErrorDisposition::RedirectToSafeView
            }
            ErrorCode::InvalidPickupCode | ErrorCode::Validation => ErrorDisposition::RetryInline,
            ErrorCode::AlreadyHasActiveDelivery
            | ErrorCode::InvalidTransition
            | ErrorCode::Forbidden
            | ErrorCode::StoreUnavailable => ErrorDisposition::KeepView,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn disposition(&self) -> ErrorDisposition {
        self.code.disposition()
    }
}
