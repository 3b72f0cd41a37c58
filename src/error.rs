use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::stops::DataUnavailable;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Failures that surface to HTTP callers. Upstream provider failures never
/// land here; those degrade to an empty arrival list inside the providers.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Catalog(#[from] DataUnavailable),
    #[error("failed to save monitored stops: {0}")]
    Persistence(#[from] std::io::Error),
    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}
