//! TLS 证书加载与自签名生成。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::generate_simple_self_signed;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use crate::config::Args;

const SELF_SIGNED_CERT_FILE: &str = "tohttps-cert.pem";
const SELF_SIGNED_KEY_FILE: &str = "tohttps-key.pem";

/// 构建 Rustls 配置；未同时提供证书与私钥时生成自签名证书。
pub async fn build_rustls_config(
    args: &Args,
    host: IpAddr,
    runtime_dir: &Path,
) -> Result<RustlsConfig, std::io::Error> {
    let (cert_path, key_path) = if let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) {
        (PathBuf::from(cert), PathBuf::from(key))
    } else {
        generate_self_signed_paths(host, runtime_dir).await?
    };

    let cert = fs::read(&cert_path).await?;
    let key = fs::read(&key_path).await?;
    RustlsConfig::from_pem(cert, key).await
}

/// 生成自签名证书写入运行目录，并返回文件路径。
async fn generate_self_signed_paths(
    host: IpAddr,
    runtime_dir: &Path,
) -> Result<(PathBuf, PathBuf), std::io::Error> {
    let mut names = vec!["localhost".to_string()];
    if !host.is_unspecified() {
        names.push(host.to_string());
    }
    let cert = generate_simple_self_signed(names)
        .map_err(|err| std::io::Error::other(err.to_string()))?;

    fs::create_dir_all(runtime_dir).await?;
    let cert_path = runtime_dir.join(SELF_SIGNED_CERT_FILE);
    let key_path = runtime_dir.join(SELF_SIGNED_KEY_FILE);
    fs::write(&cert_path, cert.cert.pem()).await?;
    fs::write(&key_path, cert.key_pair.serialize_pem()).await?;
    info!(cert = ?cert_path, "generated self-signed cert");
    Ok((cert_path, key_path))
}
