//! 命令行入口
//!
//! 参数解析、日志初始化、引擎装配与信号处理。

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{self, Config};
use crate::engine::Engine;
use crate::logging::{self, AccessLog};

/// Layer-4 (TCP/UDP) reverse proxy and load balancer
#[derive(Parser, Debug)]
#[command(name = "nvelox", version)]
pub struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "nvelox.yaml")]
    pub config: String,

    /// 仅校验配置文件然后退出
    #[arg(short = 't', long = "check")]
    pub check: bool,
}

/// 加载配置并运行引擎，直到收到退出信号
pub async fn run(cli: Cli) -> Result<()> {
    let cfg = Config::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config))?;

    if cli.check {
        println!("configuration file {} is valid", cli.config);
        return Ok(());
    }

    logging::init(&cfg.logging.level, cfg.logging.error_log.as_deref())?;
    info!("nvelox server {} starting...", env!("CARGO_PKG_VERSION"));
    info!("loaded configuration from {}", cli.config);

    let listeners = config::expand_listeners(&cfg.listeners);
    let access_log = Arc::new(AccessLog::new(cfg.logging.access_log.as_deref())?);
    let engine = Arc::new(Engine::new(&cfg, listeners, access_log)?);

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutting down...");
        signal_shutdown.cancel();
    });

    engine.run(shutdown).await
}

/// 等待 SIGINT / SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
