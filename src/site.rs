//! 站点文件服务：目录首页、云盘页面、自定义 404 与访问计数。

use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{CLOUD_DRIVE_MARKER, CLOUD_DRIVE_PAGE, INDEX_FILE, NOT_FOUND_PAGE};
use crate::counter::PersistentCounter;
use crate::error::ApiError;
use crate::http::header_str;
use crate::path::PathResolver;
use crate::storage::FileStore;
use crate::transfer::TransferEngine;

/// GET 请求入口。
pub async fn serve(
    path: Option<Path<String>>,
    headers: HeaderMap,
    Extension(resolver): Extension<Arc<PathResolver>>,
    Extension(store): Extension<Arc<FileStore>>,
    Extension(engine): Extension<Arc<TransferEngine>>,
    Extension(counter): Extension<Arc<PersistentCounter>>,
) -> Result<Response, ApiError> {
    let request_path = request_path(path);
    respond(&resolver, &store, &engine, &counter, &request_path, &headers).await
}

/// 返回当前访问计数（纯文本十进制）。
pub async fn visits(Extension(counter): Extension<Arc<PersistentCounter>>) -> String {
    counter.get().to_string()
}

/// 把通配路由捕获的路径还原为以 `/` 开头的请求路径。
pub fn request_path(path: Option<Path<String>>) -> String {
    match path {
        Some(Path(path)) => format!("/{}", path.trim_start_matches('/')),
        None => "/".to_string(),
    }
}

pub async fn respond(
    resolver: &PathResolver,
    store: &FileStore,
    engine: &TransferEngine,
    counter: &PersistentCounter,
    request_path: &str,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let mut target = resolver.resolve(request_path);

    // 云盘目录及其所有子目录都交给前端页面处理
    if request_path.contains(CLOUD_DRIVE_MARKER) && store.is_dir(&target).await {
        let visits = counter.increment();
        info!(path = request_path, visits, "cloud drive directory, serving app page");
        target = resolver.resolve(CLOUD_DRIVE_PAGE);
    }

    if store.is_dir(&target).await {
        let index = resolver.join(&target, INDEX_FILE);
        if !store.exists(&index).await {
            return Err(ApiError::NotFound("Directory listing disabled here".into()));
        }
        let visits = counter.increment();
        debug!(path = %index, visits, "serving directory index");
        target = index;
    }

    if !store.exists(&target).await {
        return Err(not_found(resolver, store).await);
    }

    let descriptor = engine
        .describe(target, header_str(headers, header::RANGE.as_str()))
        .await?;
    engine
        .respond(
            descriptor,
            header_str(headers, header::ACCEPT_ENCODING.as_str()),
        )
        .await
}

async fn not_found(resolver: &PathResolver, store: &FileStore) -> ApiError {
    match store.read(&resolver.resolve(NOT_FOUND_PAGE)).await {
        Ok(page) => ApiError::NotFoundPage(page),
        Err(_) => ApiError::NotFound("404 Not Found".into()),
    }
}
