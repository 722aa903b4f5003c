//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;
pub const DEFAULT_CACHE_MAX_AGE: u64 = 14_400;
pub const DEFAULT_ADMIN_PASSWORD: &str = "123456";
pub const DEFAULT_MAX_REQUESTS_PER_SECOND: u64 = 1000;
pub const DEFAULT_ATTACK_THRESHOLD: u64 = 10_000;

pub const VISITS_DB_FILE: &str = ".visitors.db";
pub const COUNTER_SIZE: usize = 8;
pub const GUARD_RESET_PATH: &str = "/api/guard/reset";
pub const CLOUD_DRIVE_MARKER: &str = "/cloud-drive";
pub const CLOUD_DRIVE_PAGE: &str = "/cloud-drive.html";
pub const NOT_FOUND_PAGE: &str = "/404.html";
pub const INDEX_FILE: &str = "index.html";
pub const GUARD_PRUNE_INTERVAL_SECS: u64 = 60;
pub const COUNTER_SYNC_INTERVAL_SECS: u64 = 60;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "tohttps", version = VERSION_INFO, about = "Static site and file drop server")]
pub struct Args {
    #[arg(
        short = 'r',
        long,
        env = "TOHTTPS_ROOT_DIR",
        default_value = "www",
        help = "Site root; every file operation is confined to it"
    )]
    pub root_dir: String,
    #[arg(
        long,
        env = "TOHTTPS_TRASH_DIR",
        default_value = "trashfiles",
        help = "Directory that receives deleted files"
    )]
    pub trash_dir: String,
    #[arg(
        long,
        env = "TOHTTPS_RUNTIME_DIR",
        default_value = ".",
        help = "Directory for the visit counter and generated certificates"
    )]
    pub runtime_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "TOHTTPS_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "TOHTTPS_HTTP_PORT",
        default_value_t = 8080,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "TOHTTPS_HTTPS_PORT",
        help = "HTTPS port; HTTPS is disabled when unset"
    )]
    pub https_port: Option<u16>,
    #[arg(short = 'c', long, env = "TOHTTPS_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "TOHTTPS_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "TOHTTPS_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "TOHTTPS_CHUNK_SIZE",
        default_value_t = DEFAULT_CHUNK_SIZE,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Files larger than this are streamed in chunks of this size"
    )]
    pub chunk_size: u64,
    #[arg(
        long,
        env = "TOHTTPS_MAX_FILE_SIZE",
        default_value_t = DEFAULT_MAX_FILE_SIZE,
        help = "Max upload size in bytes (0 to disable)"
    )]
    pub max_file_size: u64,
    #[arg(
        long,
        env = "TOHTTPS_CACHE_MAX_AGE",
        default_value_t = DEFAULT_CACHE_MAX_AGE,
        help = "Cache-Control max-age for streamed files (0 to omit)"
    )]
    pub cache_max_age: u64,
    #[arg(
        long,
        env = "TOHTTPS_ADMIN_PASSWORD",
        default_value = DEFAULT_ADMIN_PASSWORD,
        hide_env_values = true,
        help = "Password for upload, delete, mkdir and guard reset"
    )]
    pub admin_password: String,
    #[arg(
        long,
        env = "TOHTTPS_MAX_REQUESTS_PER_SECOND",
        default_value_t = DEFAULT_MAX_REQUESTS_PER_SECOND,
        help = "Per-client requests per second before the aggregate check runs"
    )]
    pub max_requests_per_second: u64,
    #[arg(
        long,
        env = "TOHTTPS_ATTACK_THRESHOLD",
        default_value_t = DEFAULT_ATTACK_THRESHOLD,
        help = "Aggregate request count that switches on attack mode"
    )]
    pub attack_threshold: u64,
    #[arg(
        long,
        env = "TOHTTPS_LOG_LEVEL",
        default_value = "info",
        help = "Default log filter when RUST_LOG is unset"
    )]
    pub log_level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let args = Args::try_parse_from(["tohttps"]).expect("parse defaults");
        assert_eq!(args.root_dir, "www");
        assert_eq!(args.trash_dir, "trashfiles");
        assert_eq!(args.http_port, 8080);
        assert_eq!(args.https_port, None);
        assert_eq!(args.chunk_size, 5 * 1024 * 1024);
        assert_eq!(args.max_file_size, 2 * 1024 * 1024 * 1024);
        assert_eq!(args.cache_max_age, 14_400);
        assert_eq!(args.admin_password, "123456");
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert!(Args::try_parse_from(["tohttps", "--chunk-size", "0"]).is_err());
        let args = Args::try_parse_from(["tohttps", "--chunk-size", "1", "-P", "8443"])
            .expect("parse");
        assert_eq!(args.chunk_size, 1);
        assert_eq!(args.https_port, Some(8443));
    }

    #[test]
    fn server_conf_keys_all_have_flags() {
        // server.conf is not read; each of its keys has a flag instead.
        let args = Args::try_parse_from([
            "tohttps",
            "--http-port",
            "9000",
            "--root-dir",
            "site",
            "--trash-dir",
            "bin",
            "--tls-cert",
            "cert.pem",
            "--tls-key",
            "key.pem",
            "--chunk-size",
            "4096",
            "--max-file-size",
            "0",
            "--cache-max-age",
            "0",
            "--admin-password",
            "hunter2",
        ])
        .expect("parse");
        assert_eq!(args.http_port, 9000);
        assert_eq!(args.root_dir, "site");
        assert_eq!(args.trash_dir, "bin");
        assert_eq!(args.tls_cert.as_deref(), Some("cert.pem"));
        assert_eq!(args.tls_key.as_deref(), Some("key.pem"));
        assert_eq!(args.chunk_size, 4096);
        assert_eq!(args.max_file_size, 0);
        assert_eq!(args.cache_max_age, 0);
        assert_eq!(args.admin_password, "hunter2");
    }
}
