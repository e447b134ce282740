use std::any::Any;

use thiserror::Error;

/// Failures surfaced on a derived stream's error channel or from a fallible read
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("projection panicked: {message}")]
    ProjectionPanicked { message: String },
    #[error("derived stream terminated before producing a value")]
    Terminated,
}

/// Best-effort extraction of a panic payload's message
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
