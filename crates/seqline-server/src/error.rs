use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use seqline_shared::ErrorCode;

use crate::db::DbError;
use crate::fanout::SendError;
use crate::sequencer::SequencerError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not a member of this chat")]
    NotAMember,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Muted in this group")]
    ForbiddenMuted,

    #[error("Storage error: {0}")]
    Store(#[from] DbError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BadRequest(_) => ErrorCode::BadRequest,
            Self::NotAMember => ErrorCode::NotAMember,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::ForbiddenMuted => ErrorCode::ForbiddenMuted,
            Self::Store(_) | Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<SendError> for ServerError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::BadRequest(m) => Self::BadRequest(m),
            SendError::GroupNotFound => Self::NotFound("group".into()),
            SendError::NotAMember => Self::NotAMember,
            SendError::ForbiddenMuted => Self::ForbiddenMuted,
            SendError::Store(e) => Self::Store(e),
            SendError::Sequencer(e) => e.into(),
        }
    }
}

impl From<SequencerError> for ServerError {
    fn from(e: SequencerError) -> Self {
        match e {
            SequencerError::Unavailable(e) => Self::Store(e),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::NotAMember | ServerError::ForbiddenMuted => {
                (StatusCode::FORBIDDEN, self.to_string())
            }
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Store(e) => {
                tracing::error!(error = %e, "Storage failure while serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            ServerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
            "code": self.code(),
        });

        (status, axum::Json(body)).into_response()
    }
}
