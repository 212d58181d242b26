use axum::{extract::FromRequestParts, http::request::Parts};
use tower_sessions::Session;

use crate::{model::Identity, AppError};

pub const USER_ID: &str = "user_id";
pub const USER_NAME: &str = "user_name";

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("no identity on this session, POST /identify first")]
    Unidentified,
}

pub(crate) async fn remember(session: &Session, identity: &Identity) -> Result<(), AppError> {
    session.insert(USER_ID, &identity.user_id).await?;
    session.insert(USER_NAME, &identity.name).await?;
    Ok(())
}

pub(crate) async fn recall(session: &Session) -> Result<Option<Identity>, AppError> {
    let Some(user_id) = session.get::<String>(USER_ID).await? else {
        return Ok(None);
    };
    let name = session
        .get::<String>(USER_NAME)
        .await?
        .unwrap_or_else(|| "Anonymous".to_owned());

    Ok(Some(Identity { user_id, name }))
}

/// Handlers taking an [`Identity`] answer 401 until the caller has identified.
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = Session::from_request_parts(parts, state)
            .await
            .map_err(|(_, msg)| anyhow::anyhow!(msg))?;

        recall(&session)
            .await?
            .ok_or_else(|| IdentityError::Unidentified.into())
    }
}
