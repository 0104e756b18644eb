//! Acting user extractor.
//!
//! Internal callers identify the staff member behind a request with the
//! `X-Actor-ID` header. Mutating loan endpoints require it.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

pub const ACTOR_ID_HEADER: &str = "X-Actor-ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorContext {
    pub actor_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for ActorContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(ACTOR_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Missing X-Actor-ID header")))?;

        let actor_id = Uuid::parse_str(raw.trim()).map_err(|_| {
            AppError::BadRequest(anyhow::anyhow!("X-Actor-ID must be a UUID"))
        })?;

        tracing::Span::current().record("actor_id", tracing::field::display(actor_id));

        Ok(Self { actor_id })
    }
}
