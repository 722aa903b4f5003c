//! 文件传输：整体读取、单区间切片与分块懒加载流三种发送策略。
//!
//! 文件大小在请求开始时读取一次，分块发送过程中不再校验；文件在传输途中被截断时，
//! 流在短读处自然结束而不是向客户端返回错误（响应头此时已经发出）。

use axum::body::{Body as AxumBody, Bytes};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{self, Stream};
use httpdate::fmt_http_date;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::compression;
use crate::error::ApiError;
use crate::path::SafePath;
use crate::storage::FileStore;

/// 闭区间 `start..=end` 的字节范围。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    fn content_range(&self, total_size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total_size)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// 整个文件读入内存，可压缩。
    Whole,
    /// 仅读取请求的切片。
    Slice(ByteRange),
    /// 超过阈值的文件按分块懒加载发送。
    Chunked(Option<ByteRange>),
}

pub fn choose_strategy(size: u64, range: Option<ByteRange>, threshold: u64) -> Strategy {
    match range {
        _ if size > threshold => Strategy::Chunked(range),
        Some(range) => Strategy::Slice(range),
        None => Strategy::Whole,
    }
}

/// 解析单区间 `bytes=<start>-<end>`，两端均可省略。
///
/// 省略起点按 0 处理、省略终点按 `size-1` 处理（不是 RFC 的后缀区间）。多区间、
/// 非数字边界与越界范围一律视为不可满足。
pub fn parse_range(value: &str, size: u64) -> Result<ByteRange, ApiError> {
    let unsatisfiable = || ApiError::RangeNotSatisfiable(size);
    let spec = value
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(unsatisfiable)?;
    if spec.contains(',') || size == 0 {
        return Err(unsatisfiable());
    }
    // 没有 `-` 时两端都取默认值
    let (start_part, end_part) = spec.split_once('-').unwrap_or(("", ""));
    let bound = |part: &str, default: u64| -> Result<u64, ApiError> {
        let part = part.trim();
        if part.is_empty() {
            Ok(default)
        } else {
            part.parse::<u64>().map_err(|_| unsatisfiable())
        }
    };
    let start = bound(start_part, 0)?;
    let end = bound(end_part, size - 1)?;

    if start >= size || end >= size || start > end {
        return Err(unsatisfiable());
    }
    Ok(ByteRange { start, end })
}

pub fn content_type_for(path: &SafePath) -> String {
    mime_guess::from_path(path.as_path())
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// 单次请求的传输描述，响应结束后即丢弃。
#[derive(Clone, Debug)]
pub struct TransferDescriptor {
    pub path: SafePath,
    pub total_size: u64,
    pub range: Option<ByteRange>,
    pub content_type: String,
    pub modified: Option<SystemTime>,
}

/// 从偏移量开始可重放的有限分块序列；内存中同一时间只保留一个分块。
#[derive(Clone, Debug)]
pub struct ChunkSource {
    store: Arc<FileStore>,
    path: SafePath,
    span: ByteRange,
    chunk_size: u64,
}

impl ChunkSource {
    pub fn new(store: Arc<FileStore>, path: SafePath, span: ByteRange, chunk_size: u64) -> Self {
        Self {
            store,
            path,
            span,
            chunk_size: chunk_size.max(1),
        }
    }

    fn bounds_at(&self, offset: u64) -> Option<(u64, u64)> {
        if offset >= self.span.length() {
            return None;
        }
        let read_start = self.span.start + offset;
        let read_end = read_start
            .saturating_add(self.chunk_size - 1)
            .min(self.span.end);
        Some((read_start, read_end))
    }

    /// 读取区间内偏移 `offset` 处的分块；越界、读失败或零读都返回 `None`。
    pub async fn chunk_at(&self, offset: u64) -> Option<Bytes> {
        let (read_start, read_end) = self.bounds_at(offset)?;
        match self.store.read_range(&self.path, read_start, read_end).await {
            Ok(data) if !data.is_empty() => Some(Bytes::from(data)),
            Ok(_) => None,
            Err(err) => {
                debug!(path = %self.path, offset, error = ?err, "chunked transfer ended early");
                None
            }
        }
    }

    /// 从 `offset` 开始按需拉取分块；短读后的下一次拉取即结束。
    pub fn into_stream(self, offset: u64) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        stream::unfold((self, Some(offset)), |(source, offset)| async move {
            let offset = offset?;
            let (read_start, read_end) = source.bounds_at(offset)?;
            let chunk = source.chunk_at(offset).await?;
            let wanted = read_end - read_start + 1;
            let next = if (chunk.len() as u64) < wanted {
                None
            } else {
                Some(offset + wanted)
            };
            Some((Ok::<_, io::Error>(chunk), (source, next)))
        })
    }
}

#[derive(Debug)]
pub struct TransferEngine {
    store: Arc<FileStore>,
    chunk_size: u64,
    cache_max_age: u64,
}

impl TransferEngine {
    pub fn new(store: Arc<FileStore>, chunk_size: u64, cache_max_age: u64) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
            cache_max_age,
        }
    }

    /// 读取文件元数据并校验 Range 头，生成传输描述。
    pub async fn describe(
        &self,
        path: SafePath,
        range_header: Option<&str>,
    ) -> Result<TransferDescriptor, ApiError> {
        let metadata = self.store.metadata(&path).await?;
        if metadata.is_dir() {
            return Err(ApiError::BadRequest("path is not a file".into()));
        }
        let total_size = self.store.size(&path).await?;
        let range = range_header
            .map(|value| parse_range(value, total_size))
            .transpose()?;
        Ok(TransferDescriptor {
            content_type: content_type_for(&path),
            modified: metadata.modified().ok(),
            path,
            total_size,
            range,
        })
    }

    /// 按传输策略构建响应。
    pub async fn respond(
        &self,
        descriptor: TransferDescriptor,
        accept_encoding: Option<&str>,
    ) -> Result<Response, ApiError> {
        let strategy = choose_strategy(descriptor.total_size, descriptor.range, self.chunk_size);
        info!(
            path = %descriptor.path,
            size = descriptor.total_size,
            strategy = ?strategy,
            "serve file"
        );

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, header_value(&descriptor.content_type)?);
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        if let Some(modified) = descriptor.modified {
            headers.insert(header::LAST_MODIFIED, header_value(&fmt_http_date(modified))?);
        }

        match strategy {
            Strategy::Whole => {
                let content = self.store.read(&descriptor.path).await?;
                let body = if compression::should_compress(
                    &descriptor.content_type,
                    content.len() as u64,
                    self.chunk_size,
                    accept_encoding,
                ) {
                    match gzip_off_thread(content).await? {
                        (_, Ok(compressed)) => {
                            headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                            headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
                            debug!(compressed = compressed.len(), "gzip enabled");
                            compressed
                        }
                        (original, Err(err)) => {
                            warn!(error = %err, "gzip failed, sending uncompressed body");
                            original
                        }
                    }
                } else {
                    content
                };
                headers.insert(header::CONTENT_LENGTH, header_value(&body.len().to_string())?);
                Ok((StatusCode::OK, headers, body).into_response())
            }
            Strategy::Slice(range) => {
                let content = self
                    .store
                    .read_range(&descriptor.path, range.start, range.end)
                    .await?;
                headers.insert(
                    header::CONTENT_RANGE,
                    header_value(&range.content_range(descriptor.total_size))?,
                );
                headers.insert(header::CONTENT_LENGTH, header_value(&content.len().to_string())?);
                Ok((StatusCode::PARTIAL_CONTENT, headers, content).into_response())
            }
            Strategy::Chunked(range) => {
                let span = range.unwrap_or(ByteRange {
                    start: 0,
                    end: descriptor.total_size - 1,
                });
                let status = match range {
                    Some(range) => {
                        headers.insert(
                            header::CONTENT_RANGE,
                            header_value(&range.content_range(descriptor.total_size))?,
                        );
                        StatusCode::PARTIAL_CONTENT
                    }
                    None => StatusCode::OK,
                };
                if self.cache_max_age != 0 {
                    headers.insert(
                        header::CACHE_CONTROL,
                        header_value(&format!("public, max-age={}", self.cache_max_age))?,
                    );
                }
                headers.insert(header::CONTENT_LENGTH, header_value(&span.length().to_string())?);

                let source =
                    ChunkSource::new(self.store.clone(), descriptor.path, span, self.chunk_size);
                Ok((status, headers, AxumBody::from_stream(source.into_stream(0))).into_response())
            }
        }
    }
}

async fn gzip_off_thread(content: Vec<u8>) -> Result<(Vec<u8>, io::Result<Vec<u8>>), ApiError> {
    tokio::task::spawn_blocking(move || {
        let compressed = compression::gzip(&content);
        (content, compressed)
    })
    .await
    .map_err(|err| ApiError::Internal(err.to_string()))
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("响应头构建失败".into()))
}
