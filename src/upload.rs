//! 上传处理：multipart 表单、原始请求体与 PUT 上传，统一经临时文件原子落盘。

use axum::body::{Body as AxumBody, Bytes};
use axum::extract::{Extension, FromRequest, Multipart, Path, Query};
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{Stream, StreamExt};
use http_body_util::BodyExt;
use std::fmt::Display;
use std::pin::pin;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::admin::{AdminConfig, AdminQuery};
use crate::atomic::AtomicFile;
use crate::error::ApiError;
use crate::http::header_str;
use crate::path::{PathResolver, SafePath};
use crate::storage::FileStore;

const MULTIPART_FILE_FIELD: &str = "file";

/// `param=upload`：把 multipart 的 `file` 字段或原始请求体写入目录 `dir`。
pub async fn upload_into(
    resolver: &PathResolver,
    store: &FileStore,
    admin: &AdminConfig,
    dir: SafePath,
    request: Request<AxumBody>,
) -> Result<Response, ApiError> {
    store.create_dir(&dir).await?;

    if is_multipart(request.headers()) {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|err| ApiError::BadRequest(err.body_text()))?;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| ApiError::BadRequest(err.body_text()))?
        {
            if field.name() != Some(MULTIPART_FILE_FIELD) {
                continue;
            }
            let name = field
                .file_name()
                .and_then(sanitize_file_name)
                .unwrap_or_else(default_upload_name);
            let target = resolver.join(&dir, &name);
            let size = write_stream(&target, field, admin.max_upload_size).await?;
            info!(path = %target, size, "multipart upload stored");
            return Ok(upload_succeeded(&name));
        }
        return Err(ApiError::BadRequest("No file provided in form data".into()));
    }

    let name = default_upload_name();
    let target = resolver.join(&dir, &name);
    let body = BodyExt::into_data_stream(request.into_body());
    let size = write_stream(&target, body, admin.max_upload_size).await?;
    info!(path = %target, size, "raw upload stored");
    Ok(upload_succeeded(&name))
}

/// PUT 上传：文件名取自 `Content-Disposition`，缺失时使用 `upload_<unix 秒>`。
pub async fn put_upload(
    path: Option<Path<String>>,
    Query(query): Query<AdminQuery>,
    headers: HeaderMap,
    Extension(resolver): Extension<Arc<PathResolver>>,
    Extension(store): Extension<Arc<FileStore>>,
    Extension(admin): Extension<Arc<AdminConfig>>,
    body: AxumBody,
) -> Result<Response, ApiError> {
    admin.check_password(query.password.as_deref())?;

    let dir = resolver.resolve(path.as_ref().map_or("", |Path(path)| path.as_str()));
    let name = header_str(&headers, header::CONTENT_DISPOSITION.as_str())
        .and_then(filename_from_disposition)
        .unwrap_or_else(default_upload_name);
    store.create_dir(&dir).await?;

    let target = resolver.join(&dir, &name);
    let size = write_stream(
        &target,
        BodyExt::into_data_stream(body),
        admin.max_upload_size,
    )
    .await?;
    info!(path = %target, size, "put upload stored");
    Ok(upload_succeeded(&name))
}

/// 把字节流写入临时文件，结束后原子替换到 `target`。
///
/// 超过 `max_size`（0 表示不限制）返回 413，空内容返回 400，两种情况都不会留下目标文件。
pub async fn write_stream<S, E>(target: &SafePath, stream: S, max_size: u64) -> Result<u64, ApiError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut stream = pin!(stream);
    let mut atomic = AtomicFile::create(target.as_path())
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(path = %target, error = %err, "upload body interrupted");
                atomic.discard().await;
                return Err(ApiError::BadRequest("upload body interrupted".into()));
            }
        };
        if chunk.is_empty() {
            continue;
        }
        if max_size > 0 && atomic.written() + chunk.len() as u64 > max_size {
            warn!(path = %target, limit = max_size, "upload over size limit");
            atomic.discard().await;
            return Err(ApiError::PayloadTooLarge);
        }
        if let Err(err) = atomic.write_chunk(&chunk).await {
            atomic.discard().await;
            return Err(ApiError::Internal(err.to_string()));
        }
    }

    if atomic.written() == 0 {
        atomic.discard().await;
        return Err(ApiError::BadRequest("No file content provided".into()));
    }
    let size = atomic
        .commit()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    debug!(path = %target, size, "upload committed");
    Ok(size)
}

/// 从 `Content-Disposition` 中取出 `filename=` 的值，去掉引号与目录部分。
pub fn filename_from_disposition(value: &str) -> Option<String> {
    let (_, rest) = value.split_once("filename=")?;
    let raw = rest.split(';').next().unwrap_or(rest).trim();
    let raw = raw
        .strip_prefix('"')
        .and_then(|raw| raw.strip_suffix('"'))
        .unwrap_or(raw);
    sanitize_file_name(raw)
}

pub fn default_upload_name() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    format!("upload_{secs}")
}

/// 只保留最后一个路径段；空名、`.` 与 `..` 视为无效。
fn sanitize_file_name(raw: &str) -> Option<String> {
    let name = raw.rsplit(['/', '\\']).next()?.trim();
    match name {
        "" | "." | ".." => None,
        name => Some(name.to_string()),
    }
}

fn is_multipart(headers: &HeaderMap) -> bool {
    header_str(headers, header::CONTENT_TYPE.as_str())
        .is_some_and(|value| value.to_ascii_lowercase().starts_with("multipart/form-data"))
}

fn upload_succeeded(name: &str) -> Response {
    (StatusCode::OK, format!("Upload successful: {name}")).into_response()
}
