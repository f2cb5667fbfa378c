use cove_proto::ErrorCode;
use thiserror::Error;

use crate::pipeline::PipelineError;

/// Gateway-level failure classes. Pipeline errors pass through verbatim;
/// everything else originates here.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("unknown method {0}")]
    UnknownMethod(String),
    #[error("workspace is upgrading")]
    Upgrading,
    #[error("workspace is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Unauthorized(_) => ErrorCode::Unauthorized,
            GatewayError::UnknownMethod(_) => ErrorCode::UnknownMethod,
            GatewayError::Upgrading => ErrorCode::Upgrading,
            GatewayError::ShuttingDown => ErrorCode::ShuttingDown,
            GatewayError::Pipeline(_) => ErrorCode::PipelineError,
            GatewayError::Transport(_) => ErrorCode::TransportError,
        }
    }
}
