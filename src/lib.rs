/// Nvelox 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod lb;
pub mod logging;
pub mod proxy_protocol;

// 重新导出常用类型
pub use config::{Config, ConfigBuilder, Listener, ListenerSpec, Protocol};
pub use engine::Engine;
pub use error::{ProxyError, Result};
pub use lb::{new_balancer, Balancer};
pub use logging::AccessLog;
