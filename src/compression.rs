//! gzip 压缩策略：仅对白名单文本类型、且不超过分块阈值的整体响应压缩。

use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::{self, Write};

/// 允许压缩的内容类型；`text/javascript` 与 `text/xml` 是 MIME 表中的等价写法。
const COMPRESSIBLE_TYPES: &[&str] = &[
    "text/html",
    "text/css",
    "application/javascript",
    "text/javascript",
    "application/json",
    "application/xml",
    "text/xml",
    "text/plain",
    "image/svg+xml",
];

pub fn is_compressible(content_type: &str) -> bool {
    COMPRESSIBLE_TYPES.contains(&content_type)
}

/// 客户端是否声明支持 gzip 或 deflate。
pub fn accepts_gzip(accept_encoding: Option<&str>) -> bool {
    accept_encoding.is_some_and(|value| {
        let value = value.to_ascii_lowercase();
        value.contains("gzip") || value.contains("deflate")
    })
}

pub fn should_compress(
    content_type: &str,
    size: u64,
    threshold: u64,
    accept_encoding: Option<&str>,
) -> bool {
    is_compressible(content_type) && size <= threshold && accepts_gzip(accept_encoding)
}

pub fn gzip(input: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(input.len() / 2), Compression::default());
    encoder.write_all(input)?;
    encoder.finish()
}
