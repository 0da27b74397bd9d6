use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Balancer, ServerSet};
use crate::error::{ProxyError, Result};

/// 随机策略
///
/// 在可用列表上均匀随机选取。PRNG 在构造时播种，
/// 之后独立于系统随机源。
pub struct Random {
    set: RwLock<ServerSet>,
    rng: Mutex<StdRng>,
}

impl Random {
    pub fn new(servers: &[String]) -> Self {
        Self {
            set: RwLock::new(ServerSet::new(servers)),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl Balancer for Random {
    fn next(&self) -> Result<String> {
        let set = self.set.read();
        let healthy = set.healthy();
        if healthy.is_empty() {
            return Err(ProxyError::NoHealthyServers);
        }

        let idx = self.rng.lock().gen_range(0..healthy.len());
        Ok(healthy[idx].clone())
    }

    fn on_connect(&self, _server: &str) {}

    fn on_disconnect(&self, _server: &str) {}

    fn update_status(&self, server: &str, healthy: bool) {
        self.set.write().update(server, healthy);
    }
}
