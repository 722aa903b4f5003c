//! HTTP 辅助工具：客户端标识、请求头解析、CORS 与安全头。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::{middleware, response::Response};
use std::net::IpAddr;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::error::ApiError;

pub const UNKNOWN_CLIENT: &str = "unknown";

/// 构建 CORS Layer（支持逗号分隔的来源列表）。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

/// 读取请求头的字符串值，忽略空值与非 ASCII 值。
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// 计算用于限流的客户端标识。
///
/// 依次取 `CF-Connecting-IP`、`X-Forwarded-For` 的第一项、`X-Real-IP`，
/// 都缺失时退回连接对端地址，仍无法确定则为 `unknown`。
pub fn client_identifier(headers: &HeaderMap, connect_ip: Option<IpAddr>) -> String {
    if let Some(value) = header_str(headers, "cf-connecting-ip") {
        return value.to_string();
    }
    if let Some(first) = header_str(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return first.to_string();
    }
    if let Some(value) = header_str(headers, "x-real-ip") {
        return value.to_string();
    }
    connect_ip
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// 解析请求声明的 `Content-Length`；无法解析时视为错误请求。
pub fn declared_content_length(headers: &HeaderMap) -> Result<Option<u64>, ApiError> {
    match header_str(headers, header::CONTENT_LENGTH.as_str()) {
        Some(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ApiError::BadRequest("invalid content-length".into())),
        None => Ok(None),
    }
}

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}
