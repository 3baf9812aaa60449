use axum::{extract::FromRequestParts, http::request::Parts};

use crate::error::ApiError;

pub mod episodes;
pub mod ingest;
pub mod liveness;
pub mod readiness;
pub mod search;

/// Caller identity injected by the upstream authentication layer. The
/// router trusts these headers; session and API-key verification happen
/// outside this service.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub workspace_id: Option<String>,
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("missing x-user-id header".into()))?;

        let workspace_id = parts
            .headers
            .get("x-workspace-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .filter(|value| !value.is_empty());

        Ok(Identity {
            user_id,
            workspace_id,
        })
    }
}
