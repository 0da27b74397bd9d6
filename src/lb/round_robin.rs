use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::{Balancer, ServerSet};
use crate::error::{ProxyError, Result};

/// 轮询策略
///
/// 64 位单调计数器，每次 `next` 原子递增；返回下标为
/// `(n-1) mod healthy.len()`。健康状态变化后计数器不重置，
/// 选取序列在新的可用列表长度上继续取模。
pub struct RoundRobin {
    set: RwLock<ServerSet>,
    current: AtomicU64,
}

impl RoundRobin {
    pub fn new(servers: &[String]) -> Self {
        Self {
            set: RwLock::new(ServerSet::new(servers)),
            current: AtomicU64::new(0),
        }
    }
}

impl Balancer for RoundRobin {
    fn next(&self) -> Result<String> {
        let set = self.set.read();
        let healthy = set.healthy();
        if healthy.is_empty() {
            return Err(ProxyError::NoHealthyServers);
        }

        // 计数器在读锁之外递增也是安全的；此处持锁只为保证列表快照一致
        let n = self.current.fetch_add(1, Ordering::Relaxed);
        let idx = (n % healthy.len() as u64) as usize;
        Ok(healthy[idx].clone())
    }

    fn on_connect(&self, _server: &str) {}

    fn on_disconnect(&self, _server: &str) {}

    fn update_status(&self, server: &str, healthy: bool) {
        self.set.write().update(server, healthy);
    }
}
