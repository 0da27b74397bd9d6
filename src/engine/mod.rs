//! 数据面引擎
//!
//! 启动时绑定全部监听器、为每个后端池构造负载均衡器并接上健康检查，
//! 之后每个监听器一个接收循环，每条连接一个任务。

mod tcp;
mod udp;

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Backend, Config, ListenerSpec, Protocol};
use crate::health::Checker;
use crate::lb::{self, Balancer};
use crate::logging::AccessLog;

/// 监听器表：(协议, 端口) -> 描述
///
/// 连接事件按本地端口与协议匹配归属监听器，忽略绑定 IP：
/// 绑定在 `0.0.0.0:9090` 的监听器要能匹配内核上报的 `127.0.0.1:9090`。
pub struct ListenerTable {
    entries: HashMap<(Protocol, u16), Arc<ListenerSpec>>,
}

impl ListenerTable {
    pub fn new(specs: &[Arc<ListenerSpec>]) -> Self {
        let entries = specs
            .iter()
            .map(|s| ((s.protocol, s.port), Arc::clone(s)))
            .collect();
        Self { entries }
    }

    pub fn lookup(&self, protocol: Protocol, port: u16) -> Option<Arc<ListenerSpec>> {
        self.entries.get(&(protocol, port)).cloned()
    }
}

/// 代理引擎
pub struct Engine {
    listeners: Vec<Arc<ListenerSpec>>,
    table: ListenerTable,
    balancers: HashMap<String, Arc<dyn Balancer>>,
    backends: HashMap<String, Backend>,
    checkers: Vec<Checker>,
    access_log: Arc<AccessLog>,
}

impl Engine {
    /// 构造引擎：初始化每个后端池的均衡器与健康检查器
    pub fn new(
        cfg: &Config,
        listeners: Vec<ListenerSpec>,
        access_log: Arc<AccessLog>,
    ) -> Result<Self> {
        let mut balancers: HashMap<String, Arc<dyn Balancer>> = HashMap::new();
        let mut backends = HashMap::new();
        let mut checkers = Vec::new();

        for be in &cfg.backends {
            let balancer = lb::new_balancer(&be.balance, &be.servers);
            info!(
                "initialized backend {} with {} balancing",
                be.name,
                if be.balance.is_empty() {
                    "roundrobin"
                } else {
                    be.balance.as_str()
                }
            );

            if be.health_check.active.enabled() {
                let pool = be.name.clone();
                let balancer_cb = Arc::clone(&balancer);
                let checker = Checker::new(
                    &be.name,
                    &be.servers,
                    be.health_check.active.clone(),
                    Box::new(move |server, healthy| {
                        info!(
                            "health status change for backend {}, server {}: healthy={}",
                            pool, server, healthy
                        );
                        balancer_cb.update_status(server, healthy);
                    }),
                )
                .with_context(|| format!("failed to create health checker for {}", be.name))?;
                checkers.push(checker);
            }

            balancers.insert(be.name.clone(), balancer);
            backends.insert(be.name.clone(), be.clone());
        }

        let listeners: Vec<Arc<ListenerSpec>> = listeners.into_iter().map(Arc::new).collect();
        let table = ListenerTable::new(&listeners);

        Ok(Self {
            listeners,
            table,
            balancers,
            backends,
            checkers,
            access_log,
        })
    }

    pub fn table(&self) -> &ListenerTable {
        &self.table
    }

    pub fn balancer(&self, name: &str) -> Option<Arc<dyn Balancer>> {
        self.balancers.get(name).cloned()
    }

    pub fn backend(&self, name: &str) -> Option<&Backend> {
        self.backends.get(name)
    }

    pub fn access_log(&self) -> &AccessLog {
        &self.access_log
    }

    /// 绑定全部监听器并运行，直到 `shutdown` 被取消
    ///
    /// 任何一个监听器绑定失败都会使整个引擎启动失败。
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        for checker in &self.checkers {
            checker.start()?;
        }

        // 先全部绑定，全部成功后才开始服务
        let mut tcp_listeners = Vec::new();
        let mut udp_sockets = Vec::new();

        for spec in &self.listeners {
            match spec.protocol {
                Protocol::Tcp => {
                    let listener = bind_tcp(&spec.bind_addr()).with_context(|| {
                        format!("failed to bind listener {} on {}", spec.name, spec.bind_addr())
                    })?;
                    tcp_listeners.push((Arc::clone(spec), listener));
                }
                Protocol::Udp => {
                    let socket = bind_udp(&spec.bind_addr()).with_context(|| {
                        format!("failed to bind listener {} on {}", spec.name, spec.bind_addr())
                    })?;
                    udp_sockets.push((Arc::clone(spec), socket));
                }
            }
        }

        let mut tasks = JoinSet::new();

        for (spec, listener) in tcp_listeners {
            info!("starting listener {} on tcp://{}", spec.name, spec.bind_addr());
            tasks.spawn(tcp::run_listener(
                Arc::clone(&self),
                listener,
                shutdown.clone(),
            ));
        }
        for (spec, socket) in udp_sockets {
            info!("starting listener {} on udp://{}", spec.name, spec.bind_addr());
            tasks.spawn(udp::run_listener(
                Arc::clone(&self),
                Arc::new(socket),
                shutdown.clone(),
            ));
        }

        shutdown.cancelled().await;

        for checker in &self.checkers {
            checker.stop();
        }
        while tasks.join_next().await.is_some() {}

        info!("engine stopped");
        Ok(())
    }
}

fn resolve_bind_addr(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .with_context(|| format!("invalid bind address {}", addr))?
        .next()
        .with_context(|| format!("bind address {} resolved to nothing", addr))
}

/// 绑定 TCP 监听器，平台支持时开启 SO_REUSEPORT
fn bind_tcp(addr: &str) -> Result<TcpListener> {
    let addr = resolve_bind_addr(addr)?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

/// 绑定 UDP 套接字，平台支持时开启 SO_REUSEPORT
fn bind_udp(addr: &str) -> Result<UdpSocket> {
    let addr = resolve_bind_addr(addr)?;
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// 裸 host 走 1:1 端口映射：补上监听端口
///
/// 已带端口的地址原样返回；IPv6 字面量需要用方括号书写。
pub(crate) fn ensure_port(target: String, listener_port: u16) -> String {
    match crate::config::split_host_port(&target) {
        Some((host, port))
            if !host.is_empty() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            target
        }
        _ => format!("{}:{}", target, listener_port),
    }
}
