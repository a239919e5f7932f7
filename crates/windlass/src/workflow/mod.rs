//! Workflow-side primitives
//!
//! Everything in this module runs inside the deterministic single-threaded
//! scheduler of one workflow task. Futures and channels here are logical:
//! they resolve from durable history, never from real I/O.

pub mod channel;
pub mod context;
pub mod futures;
pub mod select;
pub(crate) mod state;

pub use self::channel::{Channel, SignalChannel};
pub use self::context::{ActivityOptions, SubWorkflowOptions, WorkflowContext};
pub use self::futures::{CancelScope, WorkflowFuture};
pub use self::select::{select, Select};

use serde::{Deserialize, Serialize};

use crate::activity::ActivityError;
use crate::payload::ConversionError;

/// Error code recorded when an execution is canceled
pub const CANCELED_ERROR_CODE: &str = "canceled";

/// Error observed by workflow code and recorded in history.
///
/// This is the only error class that ever reaches workflow code; everything
/// else (lease loss, backend failures, replay divergence) is handled at the
/// worker layer before any user observation is produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Whether the failed operation may be retried
    #[serde(default)]
    pub retryable: bool,
}

impl WorkflowError {
    /// Create a new non-retryable error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    /// The error recorded when a future is rejected by cancellation
    pub fn canceled() -> Self {
        Self {
            message: "canceled".to_string(),
            code: Some(CANCELED_ERROR_CODE.to_string()),
            retryable: false,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Whether this error came from cancellation
    pub fn is_canceled(&self) -> bool {
        self.code.as_deref() == Some(CANCELED_ERROR_CODE)
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

impl From<ConversionError> for WorkflowError {
    fn from(err: ConversionError) -> Self {
        Self::new(err.to_string()).with_code("conversion")
    }
}

impl From<ActivityError> for WorkflowError {
    fn from(err: ActivityError) -> Self {
        Self {
            message: err.message.clone(),
            code: err.error_type,
            retryable: err.retryable,
        }
    }
}
