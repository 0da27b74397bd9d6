use super::{Backend, Config, Listener, LoggingConfig, Protocol};

/// 以代码方式构造配置（测试与嵌入场景用）
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config {
                version: "2".to_string(),
                ..Default::default()
            },
        }
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    pub fn listener(mut self, listener: Listener) -> Self {
        self.config.listeners.push(listener);
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backends.push(backend);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 监听器的便捷构造
pub struct ListenerBuilder {
    listener: Listener,
}

impl ListenerBuilder {
    pub fn new(name: &str, bind: &str) -> Self {
        Self {
            listener: Listener {
                name: name.to_string(),
                bind: bind.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.listener.protocol = protocol;
        self
    }

    pub fn default_backend(mut self, backend: &str) -> Self {
        self.listener.default_backend = backend.to_string();
        self
    }

    pub fn build(self) -> Listener {
        self.listener
    }
}

/// 后端池的便捷构造
pub struct BackendBuilder {
    backend: Backend,
}

impl BackendBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            backend: Backend {
                name: name.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn balance(mut self, balance: &str) -> Self {
        self.backend.balance = balance.to_string();
        self
    }

    pub fn server(mut self, addr: &str) -> Self {
        self.backend.servers.push(addr.to_string());
        self
    }

    pub fn send_proxy_v2(mut self, enabled: bool) -> Self {
        self.backend.send_proxy_v2 = enabled;
        self
    }

    pub fn build(self) -> Backend {
        self.backend
    }
}
