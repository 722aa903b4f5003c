//! 统一的 API 错误类型与转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::io::ErrorKind;
use tracing::warn;

use crate::storage::StorageError;

const UNDER_ATTACK_MESSAGE: &str = "服务器正在被攻击，将暂时停止服务/Server is under attack and will temporarily suspend service.";

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// 带自定义 404 页面内容的未找到响应。
    NotFoundPage(Vec<u8>),
    Internal(String),
    RangeNotSatisfiable(u64),
    Forbidden(String),
    Conflict(String),
    PayloadTooLarge,
    TooManyRequests(u64),
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::NotFoundPage(page) => (
                StatusCode::NOT_FOUND,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/html"))],
                page,
            )
                .into_response(),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
            ApiError::RangeNotSatisfiable(size) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    headers,
                    "range not satisfiable",
                )
                    .into_response()
            }
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::PayloadTooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, "File too large").into_response()
            }
            ApiError::TooManyRequests(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                (StatusCode::TOO_MANY_REQUESTS, headers, "Too many requests").into_response()
            }
            ApiError::ServiceUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, UNDER_ATTACK_MESSAGE).into_response()
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::BadRequest("invalid path".into()),
            StorageError::OutOfRange { size } => ApiError::RangeNotSatisfiable(size),
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
                _ => {
                    warn!(error = %err, "storage operation failed");
                    ApiError::Internal("Internal Server Error".into())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn range_error_carries_content_range() {
        let response = ApiError::RangeNotSatisfiable(100).into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */100"
        );
    }

    #[test]
    fn storage_errors_map_to_status_codes() {
        let missing = ApiError::from(StorageError::Io(io::Error::from(ErrorKind::NotFound)));
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);

        let denied = ApiError::from(StorageError::Io(io::Error::from(
            ErrorKind::PermissionDenied,
        )));
        assert_eq!(
            denied.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn custom_not_found_page_is_html() {
        let response = ApiError::NotFoundPage(b"<h1>gone</h1>".to_vec()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/html"
        );
    }
}
