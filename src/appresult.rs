use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;

use crate::{live::LiveError, session::IdentityError, signaling::SignalError};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn status(&self) -> StatusCode {
        if let Some(err) = self.0.downcast_ref::<LiveError>() {
            return live_status(err);
        }
        if let Some(IdentityError::Unidentified) = self.0.downcast_ref::<IdentityError>() {
            return StatusCode::UNAUTHORIZED;
        }
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn live_status(err: &LiveError) -> StatusCode {
    use LiveError::*;
    match err {
        InvalidSessionId(_) => StatusCode::BAD_REQUEST,
        RoomNotFound(_) => StatusCode::NOT_FOUND,
        RoomExists(_) | RoomFull { .. } | HostCannotOffer => StatusCode::CONFLICT,
        RoomEnded(_) => StatusCode::GONE,
        NotParticipant | NotHost => StatusCode::FORBIDDEN,
        EmptyMessage | MessageTooLong { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        Signal(SignalError::InvalidPayload(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        Signal(SignalError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        Signal(SignalError::UnknownPeer(_)) => StatusCode::NOT_FOUND,
        Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(err = ?self.0, "request failed");
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{NegotiationState, SignalAction};

    #[test]
    fn domain_errors_keep_their_status_through_anyhow() {
        let cases = [
            (LiveError::RoomNotFound("s1".to_owned()), StatusCode::NOT_FOUND),
            (LiveError::RoomExists("s1".to_owned()), StatusCode::CONFLICT),
            (LiveError::RoomEnded("s1".to_owned()), StatusCode::GONE),
            (LiveError::NotHost, StatusCode::FORBIDDEN),
            (
                LiveError::Signal(SignalError::InvalidTransition {
                    state: NegotiationState::Idle,
                    action: SignalAction::Answer,
                }),
                StatusCode::CONFLICT,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(AppError::from(err).status(), status);
        }
    }

    #[test]
    fn missing_identity_is_unauthorized() {
        assert_eq!(
            AppError::from(IdentityError::Unidentified).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::from(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
