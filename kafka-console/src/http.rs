//! Conversions of this crate's errors into HTTP responses.

use crate::error::RegistryError;
use axum::http::header::WWW_AUTHENTICATE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

/// Wraps any error as a 500 response of the observability interface.
pub(crate) struct HttpServerError(pub anyhow::Error);

impl IntoResponse for HttpServerError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("HTTP 500 error: {}", self.0),
        )
            .into_response()
    }
}

// Allows `?` on anything convertible into `anyhow::Error` within handlers.
impl<E> From<E> for HttpServerError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Responds with the status of the error's category.
/// Authentication failures carry a `WWW-Authenticate` challenge for the scheme the cluster expects.
impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let category = self.category();
        let status =
            StatusCode::from_u16(category.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (
            status,
            format!("{} ({}): {self}", category.title, category.code),
        )
            .into_response();
        if let Some(scheme) = self.challenge() {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static(scheme));
        }
        response
    }
}
