//! 主动健康检查
//!
//! 每个配置了探测间隔的后端池对应一个 `Checker`。周期任务并行探测
//! 池内全部服务器，状态变化（含首次观测）时同步回调引擎注册的闭包，
//! 由其转发给对应的负载均衡器。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ActiveHealthCheck;

/// 状态变化回调：(服务器地址, 是否健康)
pub type StatusCallback = Box<dyn Fn(&str, bool) + Send + Sync>;

struct CheckerInner {
    backend_name: String,
    servers: Vec<String>,
    config: ActiveHealthCheck,
    /// 服务器地址 -> 最近一次观测的健康状态
    status: Mutex<HashMap<String, bool>>,
    on_status_change: StatusCallback,
    http_client: reqwest::Client,
}

/// 单个后端池的健康检查器
pub struct Checker {
    inner: Arc<CheckerInner>,
    cancel: CancellationToken,
}

impl Checker {
    pub fn new(
        backend_name: &str,
        servers: &[String],
        config: ActiveHealthCheck,
        on_status_change: StatusCallback,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .context("failed to build health check HTTP client")?;

        Ok(Self {
            inner: Arc::new(CheckerInner {
                backend_name: backend_name.to_string(),
                servers: servers.to_vec(),
                config,
                status: Mutex::new(HashMap::new()),
                on_status_change,
                http_client,
            }),
            cancel: CancellationToken::new(),
        })
    }

    /// 启动周期探测任务
    ///
    /// 首次探测发生在一个完整间隔之后，而非启动时。
    pub fn start(&self) -> Result<()> {
        if !self.inner.config.enabled() {
            return Ok(());
        }

        let interval = self.inner.config.interval()?;
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            info!(
                "health check started for {} every {:?}",
                inner.backend_name, interval
            );

            let mut ticker = time::interval(interval);
            // interval 的第一个 tick 立即到期，跳过它
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("health check stopped for {}", inner.backend_name);
                        return;
                    }
                    _ = ticker.tick() => {
                        check_all(&inner).await;
                    }
                }
            }
        });

        Ok(())
    }

    /// 通知探测任务退出
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Checker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 并行探测池内全部服务器
async fn check_all(inner: &Arc<CheckerInner>) {
    let mut probes = JoinSet::new();

    for server in &inner.servers {
        let inner = Arc::clone(inner);
        let addr = server.clone();
        probes.spawn(async move {
            let healthy = probe(&inner, &addr).await;
            (addr, healthy)
        });
    }

    while let Some(result) = probes.join_next().await {
        if let Ok((addr, healthy)) = result {
            update_status(inner, &addr, healthy);
        }
    }
}

async fn probe(inner: &CheckerInner, addr: &str) -> bool {
    match inner.config.check_type.as_str() {
        "http" => check_http(inner, addr).await,
        _ => check_tcp(addr, inner.config.timeout()).await,
    }
}

/// TCP 探测：限时建连成功即健康
async fn check_tcp(addr: &str, timeout: Duration) -> bool {
    matches!(
        time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// HTTP 探测：GET 返回 [200, 400) 即健康
async fn check_http(inner: &CheckerInner, addr: &str) -> bool {
    let url = format!("http://{}{}", addr, inner.config.path);
    match inner.http_client.get(&url).send().await {
        Ok(resp) => {
            let code = resp.status().as_u16();
            (200..400).contains(&code)
        }
        Err(_) => false,
    }
}

fn update_status(inner: &Arc<CheckerInner>, addr: &str, healthy: bool) {
    let mut status = inner.status.lock();

    let changed = match status.get(addr) {
        Some(old) => *old != healthy,
        None => true,
    };

    if changed {
        info!(
            "server {}/{} is now {}",
            inner.backend_name,
            addr,
            if healthy { "UP" } else { "DOWN" }
        );
        status.insert(addr.to_string(), healthy);
        (inner.on_status_change)(addr, healthy);
    }
}
