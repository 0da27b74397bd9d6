// 配置管理模块 - 使用模块化设计

mod builder;
mod validator;

// 重新导出 builder 和 validator
pub use builder::{BackendBuilder, ConfigBuilder, ListenerBuilder};
pub use validator::ConfigValidator;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// 监听器传输协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// 面向连接的字节流
    #[default]
    Tcp,
    /// 数据报
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// 顶层配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 配置格式版本，必须为 "2"
    #[serde(default)]
    pub version: String,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,

    /// 附加配置文件的 glob 模式，匹配文件的 listeners/backends 并入根配置
    #[serde(default)]
    pub include: Option<String>,

    #[serde(default)]
    pub listeners: Vec<Listener>,

    #[serde(default)]
    pub backends: Vec<Backend>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// debug / info / warning / error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 访问日志路径，未配置时输出到 stdout
    #[serde(default)]
    pub access_log: Option<String>,
    /// 错误日志路径，未配置时仅输出到 stderr
    #[serde(default)]
    pub error_log: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            access_log: None,
            error_log: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// 前端监听器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Listener {
    /// 监听器名称
    pub name: String,
    /// 绑定地址："host:port" 或 "host:start-end"
    pub bind: String,
    /// 传输协议，默认 tcp
    #[serde(default)]
    pub protocol: Protocol,
    /// 默认后端池名称
    #[serde(default)]
    pub default_backend: String,
    /// 零拷贝提示（建议性，当前实现不区分）
    #[serde(default)]
    pub zero_copy: bool,
}

/// 后端服务器池
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Backend {
    /// 池名称，全局唯一
    pub name: String,
    /// roundrobin / leastconn / random，未知值回落到 roundrobin
    #[serde(default)]
    pub balance: String,
    /// 建连后先向后端发送 PROXY Protocol v2 头
    #[serde(default)]
    pub send_proxy_v2: bool,
    /// 服务器地址列表："host:port"，或裸 host（1:1 端口映射）
    #[serde(default)]
    pub servers: Vec<String>,

    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

/// 健康检查配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub active: ActiveHealthCheck,
}

/// 主动健康检查
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveHealthCheck {
    /// tcp 或 http，默认 tcp
    #[serde(default, rename = "type")]
    pub check_type: String,
    /// HTTP 探测路径
    #[serde(default)]
    pub path: String,
    /// 探测间隔（"10s"、"500ms"……），为空表示不启用
    #[serde(default)]
    pub interval: String,
    /// 单次探测超时，为空时取 1s
    #[serde(default)]
    pub timeout: String,
}

impl ActiveHealthCheck {
    /// 是否启用了主动检查
    pub fn enabled(&self) -> bool {
        !self.interval.is_empty()
    }

    /// 解析探测间隔
    pub fn interval(&self) -> Result<Duration> {
        humantime::parse_duration(&self.interval)
            .with_context(|| format!("invalid health check interval '{}'", self.interval))
    }

    /// 解析探测超时，未配置时取 1s
    pub fn timeout(&self) -> Duration {
        if self.timeout.is_empty() {
            return Duration::from_secs(1);
        }
        humantime::parse_duration(&self.timeout).unwrap_or(Duration::from_secs(1))
    }
}

impl Config {
    /// 从文件加载配置
    ///
    /// 处理 include 展开与默认值，并做结构校验。
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let mut cfg: Config =
            serde_yaml::from_str(&data).context("failed to parse config file")?;

        // 处理 include
        if let Some(pattern) = cfg.include.clone() {
            let matches =
                glob::glob(&pattern).with_context(|| format!("bad include glob '{}'", pattern))?;

            for entry in matches {
                let sub_path = entry.context("failed to resolve include entry")?;
                let sub_data = std::fs::read_to_string(&sub_path).with_context(|| {
                    format!("failed to read included config {}", sub_path.display())
                })?;
                let sub_cfg: Config = serde_yaml::from_str(&sub_data).with_context(|| {
                    format!("failed to parse included config {}", sub_path.display())
                })?;

                cfg.listeners.extend(sub_cfg.listeners);
                cfg.backends.extend(sub_cfg.backends);
            }
        }

        // 补默认值
        if cfg.logging.level.is_empty() {
            cfg.logging.level = default_log_level();
        }

        ConfigValidator::validate(&cfg)?;
        Ok(cfg)
    }
}

/// 展开后的单端口监听描述
///
/// 端口范围绑定展开为每端口一个条目，名称为 `<name>-<port>`。
/// 启动后不再变化。
#[derive(Debug, Clone)]
pub struct ListenerSpec {
    pub name: String,
    /// 绑定主机，空串或 "*" 表示所有地址
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub default_backend: String,
    pub zero_copy: bool,
}

impl ListenerSpec {
    /// 可用于绑定的 "host:port" 地址
    pub fn bind_addr(&self) -> String {
        let host = match self.host.as_str() {
            "" | "*" => "0.0.0.0",
            h => h,
        };
        format!("{}:{}", host, self.port)
    }
}

/// 展开所有监听器的端口范围
///
/// 无法解析的 bind 地址记录告警后跳过，不影响其余监听器。
pub fn expand_listeners(listeners: &[Listener]) -> Vec<ListenerSpec> {
    let mut specs = Vec::new();

    for l in listeners {
        let (host, port_str) = match split_host_port(&l.bind) {
            Some(parts) => parts,
            None => {
                warn!("invalid bind address '{}': missing port", l.bind);
                continue;
            }
        };

        if let Some((start_str, end_str)) = port_str.split_once('-') {
            // 端口范围
            let (start, end) = match (start_str.parse::<u16>(), end_str.parse::<u16>()) {
                (Ok(s), Ok(e)) if s <= e => (s, e),
                _ => {
                    warn!("invalid bind address '{}': bad port range", l.bind);
                    continue;
                }
            };
            for port in start..=end {
                specs.push(ListenerSpec {
                    name: format!("{}-{}", l.name, port),
                    host: host.to_string(),
                    port,
                    protocol: l.protocol,
                    default_backend: l.default_backend.clone(),
                    zero_copy: l.zero_copy,
                });
            }
        } else {
            let port = match port_str.parse::<u16>() {
                Ok(p) => p,
                Err(_) => {
                    warn!("invalid bind address '{}': bad port", l.bind);
                    continue;
                }
            };
            specs.push(ListenerSpec {
                name: l.name.clone(),
                host: host.to_string(),
                port,
                protocol: l.protocol,
                default_backend: l.default_backend.clone(),
                zero_copy: l.zero_copy,
            });
        }
    }

    specs
}

/// 按最后一个冒号拆分 host 与 port 部分
pub fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    let idx = addr.rfind(':')?;
    Some((&addr[..idx], &addr[idx + 1..]))
}
