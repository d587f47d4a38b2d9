//! The beacon-API error envelope served to validator clients.
//!
//! Non-2xx responses carry `{"code": <status>, "message": <text>}` with a
//! JSON content type, matching what validator clients expect from a beacon
//! node.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub code: u16,
    pub message: String,
}

impl ApiError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            code: code.as_u16(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "endpoint not found")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn invalid_uint_path(name: &str, raw: &str) -> Self {
        Self::bad_request(format!("invalid uint path parameter {name} [{raw}]"))
    }

    pub fn missing_query(name: &str) -> Self {
        Self::bad_request(format!("missing 0x-hex query parameter {name}"))
    }

    pub fn invalid_hex_query(name: &str, raw: &str) -> Self {
        Self::bad_request(format!("invalid 0x-hex query parameter {name} [{raw}]"))
    }

    pub fn invalid_hex_length(name: &str, expect_bytes: usize) -> Self {
        Self::bad_request(format!(
            "invalid length for 0x-hex query parameter {name}, expect {expect_bytes} bytes"
        ))
    }

    pub fn invalid_uint_query(name: &str, raw: &str) -> Self {
        Self::bad_request(format!("invalid uint query parameter {name} [{raw}]"))
    }

    pub fn missing_uint_query(name: &str) -> Self {
        Self::bad_request(format!("missing uint query parameter {name}"))
    }

    pub fn empty_body() -> Self {
        Self::bad_request("empty request body")
    }

    pub fn invalid_body() -> Self {
        Self::bad_request("failed parsing json request body")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}
