use std::collections::HashMap;

use parking_lot::RwLock;

use super::{Balancer, ServerSet};
use crate::error::{ProxyError, Result};

struct LeastConnState {
    set: ServerSet,
    /// 每个服务器的在途连接数
    conns: HashMap<String, i64>,
}

/// 最少连接策略
///
/// `next` 返回在途连接数最小的可用服务器，计数相同时
/// 取可用列表中靠前者。`on_connect`/`on_disconnect` 维护计数。
pub struct LeastConn {
    state: RwLock<LeastConnState>,
}

impl LeastConn {
    pub fn new(servers: &[String]) -> Self {
        let conns = servers.iter().map(|s| (s.clone(), 0)).collect();
        Self {
            state: RwLock::new(LeastConnState {
                set: ServerSet::new(servers),
                conns,
            }),
        }
    }
}

impl Balancer for LeastConn {
    fn next(&self) -> Result<String> {
        let state = self.state.read();
        let healthy = state.set.healthy();
        if healthy.is_empty() {
            return Err(ProxyError::NoHealthyServers);
        }

        let mut best = &healthy[0];
        let mut min = state.conns.get(best).copied().unwrap_or(0);

        for s in &healthy[1..] {
            let c = state.conns.get(s).copied().unwrap_or(0);
            if c < min {
                best = s;
                min = c;
            }
        }

        Ok(best.clone())
    }

    fn on_connect(&self, server: &str) {
        let mut state = self.state.write();
        *state.conns.entry(server.to_string()).or_insert(0) += 1;
    }

    fn on_disconnect(&self, server: &str) {
        let mut state = self.state.write();
        *state.conns.entry(server.to_string()).or_insert(0) -= 1;
    }

    fn update_status(&self, server: &str, healthy: bool) {
        self.state.write().set.update(server, healthy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_prefers_fewest_connections() {
        let lb = LeastConn::new(&servers(&["s1", "s2"]));

        let first = lb.next().unwrap();
        assert_eq!(first, "s1"); // 全 0，平局取靠前者
        lb.on_connect(&first);

        // s1=1, s2=0
        let second = lb.next().unwrap();
        assert_eq!(second, "s2");
        lb.on_connect(&second);

        // 两者都是 1，再压一个到 s1
        lb.on_connect("s1");

        // s1=2, s2=1
        assert_eq!(lb.next().unwrap(), "s2");

        lb.on_disconnect("s1");
        lb.on_disconnect("s1");

        // s1=0, s2=1
        assert_eq!(lb.next().unwrap(), "s1");
    }

    #[test]
    fn test_tie_breaks_on_list_order() {
        let lb = LeastConn::new(&servers(&["s1", "s2", "s3"]));
        lb.on_connect("s1");
        // s2 与 s3 同为 0，取列表靠前的 s2
        assert_eq!(lb.next().unwrap(), "s2");
    }

    #[test]
    fn test_skips_unhealthy_minimum() {
        let lb = LeastConn::new(&servers(&["s1", "s2"]));
        lb.update_status("s1", false);
        lb.on_connect("s2");

        // s1 计数为 0 但不健康，仍然返回 s2
        assert_eq!(lb.next().unwrap(), "s2");
    }

    #[test]
    fn test_all_unhealthy() {
        let lb = LeastConn::new(&servers(&["s1"]));
        lb.update_status("s1", false);
        assert!(lb.next().unwrap_err().is_no_healthy_servers());
    }
}
