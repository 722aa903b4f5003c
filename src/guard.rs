//! 请求频率守卫：按客户端的一秒窗口计数，以及全局“攻击模式”熔断。
//!
//! 单个客户端超过每秒上限本身不会被拦截，只会触发对全部客户端请求总量的检查；
//! 总量超过阈值时进入攻击模式，之后所有请求都被拒绝，直到管理员显式重置。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::{Method, Request};
use axum::{middleware, response::Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::admin::AdminConfig;
use crate::config::GUARD_RESET_PATH;
use crate::error::ApiError;
use crate::http::{client_identifier, declared_content_length};

pub const CLIENT_WINDOW: Duration = Duration::from_secs(1);
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct RateGuard {
    clients: Mutex<HashMap<String, ClientWindow>>,
    attack_mode: AtomicBool,
    max_requests_per_second: u64,
    attack_threshold: u64,
}

#[derive(Debug)]
pub struct ClientWindow {
    pub last_request: Instant,
    pub request_count: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    /// 本次请求触发了攻击模式，或在攻击模式下重置接口超过单客户端上限。
    Limited,
    /// 攻击模式已开启。
    UnderAttack,
}

impl RateGuard {
    pub fn new(max_requests_per_second: u64, attack_threshold: u64) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            attack_mode: AtomicBool::new(false),
            max_requests_per_second,
            attack_threshold,
        }
    }

    pub fn is_under_attack(&self) -> bool {
        self.attack_mode.load(Ordering::Acquire)
    }

    /// 记录一次来自 `client` 的请求并给出放行结论。
    pub async fn check(&self, client: &str) -> Verdict {
        self.check_at(client, Instant::now()).await
    }

    async fn check_at(&self, client: &str, now: Instant) -> Verdict {
        if self.is_under_attack() {
            return Verdict::UnderAttack;
        }

        let mut clients = self.clients.lock().await;
        if record_request(&mut clients, client, now) <= self.max_requests_per_second {
            return Verdict::Allow;
        }

        let total: u64 = clients.values().map(|window| window.request_count).sum();
        if total > self.attack_threshold {
            self.attack_mode.store(true, Ordering::Release);
            warn!(client, total, "aggregate request volume over threshold, attack mode on");
            return Verdict::Limited;
        }
        Verdict::Allow
    }

    /// 重置接口的检查：攻击模式下仍计入客户端窗口，但只按单客户端上限限流，
    /// 不会返回 [`Verdict::UnderAttack`]。
    pub async fn check_reset(&self, client: &str) -> Verdict {
        self.check_reset_at(client, Instant::now()).await
    }

    async fn check_reset_at(&self, client: &str, now: Instant) -> Verdict {
        if !self.is_under_attack() {
            return self.check_at(client, now).await;
        }

        let mut clients = self.clients.lock().await;
        if record_request(&mut clients, client, now) <= self.max_requests_per_second {
            Verdict::Allow
        } else {
            Verdict::Limited
        }
    }

    /// 退出攻击模式并清空全部客户端窗口。
    pub async fn reset(&self) {
        let mut clients = self.clients.lock().await;
        clients.clear();
        self.attack_mode.store(false, Ordering::Release);
        info!("attack mode cleared");
    }

    /// 清理超过一分钟没有请求的客户端窗口，返回清理数量。
    pub async fn prune_idle(&self) -> usize {
        self.prune_idle_at(Instant::now()).await
    }

    async fn prune_idle_at(&self, now: Instant) -> usize {
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|_, window| {
            now.saturating_duration_since(window.last_request) <= CLIENT_IDLE_TIMEOUT
        });
        before - clients.len()
    }

    pub async fn tracked_clients(&self) -> usize {
        self.clients.lock().await.len()
    }
}

/// 把一次请求计入 `client` 的窗口，返回窗口内的请求数。
fn record_request(
    clients: &mut HashMap<String, ClientWindow>,
    client: &str,
    now: Instant,
) -> u64 {
    let window = clients
        .entry(client.to_string())
        .or_insert(ClientWindow {
            last_request: now,
            request_count: 0,
        });
    if now.saturating_duration_since(window.last_request) > CLIENT_WINDOW {
        window.request_count = 0;
    }
    window.last_request = now;
    window.request_count = window.request_count.saturating_add(1);
    window.request_count
}

/// 路由前的守卫中间件：频率检查与上传大小预检。
pub async fn guard_middleware(
    Extension(guard): Extension<Arc<RateGuard>>,
    Extension(admin): Extension<Arc<AdminConfig>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let connect_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let client = client_identifier(req.headers(), connect_ip);
    // 重置接口必须在攻击模式下仍可访问
    let verdict = if req.uri().path() == GUARD_RESET_PATH {
        guard.check_reset(&client).await
    } else {
        guard.check(&client).await
    };
    match verdict {
        Verdict::Allow => {}
        Verdict::Limited => return Err(ApiError::TooManyRequests(CLIENT_WINDOW.as_secs())),
        Verdict::UnderAttack => return Err(ApiError::ServiceUnavailable),
    }

    if matches!(*req.method(), Method::POST | Method::PUT)
        && let Some(length) = declared_content_length(req.headers())?
        && admin.max_upload_size > 0
        && length > admin.max_upload_size
    {
        warn!(client = %client, length, "declared upload size over limit");
        return Err(ApiError::PayloadTooLarge);
    }

    Ok(next.run(req).await)
}
