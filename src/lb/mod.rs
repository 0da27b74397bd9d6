//! 负载均衡策略
//!
//! 每个后端池持有一个 `Balancer`，连接处理器通过 `next()` 选取服务器，
//! 健康检查器通过 `update_status()` 维护可用集合。

mod least_conn;
mod random;
mod round_robin;

pub use least_conn::LeastConn;
pub use random::Random;
pub use round_robin::RoundRobin;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

/// 为新连接选取后端服务器
///
/// 所有实现必须线程安全：`next` 会被多个连接任务并发调用，
/// `update_status` 来自健康检查任务。
pub trait Balancer: Send + Sync {
    /// 返回下一个应当接收连接的服务器地址
    fn next(&self) -> Result<String>;

    /// 连接建立通知（leastconn 用）
    fn on_connect(&self, server: &str);

    /// 连接关闭通知（leastconn 用）
    fn on_disconnect(&self, server: &str);

    /// 更新服务器健康状态
    fn update_status(&self, server: &str, healthy: bool);
}

/// 按算法名创建负载均衡器，未知算法回落到 roundrobin
pub fn new_balancer(algorithm: &str, servers: &[String]) -> Arc<dyn Balancer> {
    match algorithm {
        "leastconn" => Arc::new(LeastConn::new(servers)),
        "random" => Arc::new(Random::new(servers)),
        _ => Arc::new(RoundRobin::new(servers)),
    }
}

/// 全量服务器列表 + 健康状态 + 派生的可用列表
///
/// 可用列表始终是全量列表保持原序的子序列。
pub(crate) struct ServerSet {
    all: Vec<String>,
    status: HashMap<String, bool>,
    healthy: Vec<String>,
}

impl ServerSet {
    pub(crate) fn new(servers: &[String]) -> Self {
        let all: Vec<String> = servers.to_vec();
        let status = all.iter().map(|s| (s.clone(), true)).collect();
        Self {
            healthy: all.clone(),
            all,
            status,
        }
    }

    /// 更新单个服务器状态并重建可用列表
    pub(crate) fn update(&mut self, server: &str, healthy: bool) {
        self.status.insert(server.to_string(), healthy);
        self.healthy = self
            .all
            .iter()
            .filter(|s| self.status.get(*s).copied().unwrap_or(false))
            .cloned()
            .collect();
    }

    pub(crate) fn healthy(&self) -> &[String] {
        &self.healthy
    }
}
