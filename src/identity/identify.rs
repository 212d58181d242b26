use axum::{debug_handler, Json};
use serde::Deserialize;
use tower_sessions::Session;
use uuid::Uuid;

use crate::{model::Identity, session, AppResult};

#[derive(Debug, Default, Deserialize)]
pub(crate) struct IdentifyQuery {
    #[serde(default)]
    name: Option<String>,
}

/// Gives the cookie session an identity. Calling again keeps the id and only renames.
#[debug_handler]
pub(crate) async fn identify(
    session: Session,
    query: Option<Json<IdentifyQuery>>,
) -> AppResult<Json<Identity>> {
    let Json(IdentifyQuery { name }) = query.unwrap_or_default();
    let name = super::display_name(name.as_deref());

    let identity = match session::recall(&session).await? {
        Some(existing) => Identity { name, ..existing },
        None => Identity {
            user_id: Uuid::now_v7().simple().to_string(),
            name,
        },
    };
    session::remember(&session, &identity).await?;

    tracing::info!(user_id = %identity.user_id, name = %identity.name, "identified");
    Ok(Json(identity))
}

#[debug_handler]
pub(crate) async fn me(identity: Identity) -> Json<Identity> {
    Json(identity)
}
