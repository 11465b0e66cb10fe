//! HTTP-facing error type and caller identity extractor.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Request},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::batch::BatchError;

/// Header carrying the authenticated user id, set by the auth proxy in front of us.
pub const USER_HEADER: &str = "x-user-id";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing x-user-id header")]
    Unauthenticated,
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Batch(#[from] BatchError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Batch(e) => match e {
                BatchError::BatchNotFound(_) | BatchError::JobNotFound(_) => StatusCode::NOT_FOUND,
                BatchError::Forbidden(_) => StatusCode::FORBIDDEN,
                BatchError::Validation(_) => StatusCode::BAD_REQUEST,
                BatchError::InvalidTransition { .. } => StatusCode::CONFLICT,
                BatchError::Export(_) | BatchError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        let body = json!({
            "status": "ERROR",
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Parse an id taken from the URL path.
pub fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::Validation(format!("malformed {} id: {}", what, raw)))
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

/// JSON request body whose rejections use the regular error body.
#[derive(Debug)]
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(JsonBody(value))
    }
}

/// Id of the user making the request.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub String);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| CurrentUser(v.to_string()))
            .ok_or(ApiError::Unauthenticated)
    }
}
