//! UDP 会话层
//!
//! 以客户端地址为键维护会话表。首个数据报触发后端选取与连接型
//! UDP 套接字的建立，之后同一客户端的数据报固定走同一后端。
//! 每个会话一个回程读任务，读空闲超过期限即销毁会话。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::Engine;
use crate::config::{ListenerSpec, Protocol};
use crate::proxy_protocol::{self, Transport};

/// 数据报读缓冲大小
const UDP_BUFFER_SIZE: usize = 4096;

/// 回程读空闲期限，超时即销毁会话
const UDP_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// 客户端地址 -> 后端套接字
type SessionTable = Arc<DashMap<String, Arc<UdpSocket>>>;

/// 单个 UDP 监听器的数据报循环
pub(crate) async fn run_listener(
    engine: Arc<Engine>,
    socket: Arc<UdpSocket>,
    shutdown: CancellationToken,
) {
    let local = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("failed to read local address: {}", e);
            return;
        }
    };

    let sessions: SessionTable = Arc::new(DashMap::new());
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];

    loop {
        let (n, peer) = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = socket.recv_from(&mut buf) => match result {
                Ok(pair) => pair,
                Err(e) => {
                    error!("udp receive error: {}", e);
                    continue;
                }
            },
        };

        // 按 (协议, 端口) 定位监听器；绑定 IP 不参与匹配
        let spec = match engine.table().lookup(Protocol::Udp, local.port()) {
            Some(spec) => spec,
            None => {
                error!("unknown listener for datagram on {}", local);
                continue;
            }
        };

        let key = peer.to_string();
        let backend = match sessions.get(&key) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                match create_session(&engine, &spec, &sessions, &socket, peer, local, &shutdown)
                    .await
                {
                    Some(backend) => backend,
                    // 选取、解析或拨号失败：丢弃该数据报，不建会话
                    None => continue,
                }
            }
        };

        if let Err(e) = backend.send(&buf[..n]).await {
            debug!("udp forward failed for {}: {}", peer, e);
        }
    }
}

/// 建立新会话：选后端、建连接型套接字、入表、起回程任务
async fn create_session(
    engine: &Arc<Engine>,
    spec: &Arc<ListenerSpec>,
    sessions: &SessionTable,
    front: &Arc<UdpSocket>,
    peer: SocketAddr,
    local: SocketAddr,
    shutdown: &CancellationToken,
) -> Option<Arc<UdpSocket>> {
    let balancer = match engine.balancer(&spec.default_backend) {
        Some(b) => b,
        None => {
            error!("backend not found: {}", spec.default_backend);
            return None;
        }
    };

    let target = match balancer.next() {
        Ok(t) => t,
        Err(e) => {
            error!("failed to pick backend: {}", e);
            return None;
        }
    };
    let target = super::ensure_port(target, spec.port);

    let resolved = match tokio::net::lookup_host(&target).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr,
            None => {
                debug!("udp target {} resolved to nothing", target);
                return None;
            }
        },
        Err(e) => {
            debug!("udp resolve failed for {}: {}", target, e);
            return None;
        }
    };

    let bind_any = if resolved.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let backend = match UdpSocket::bind(bind_any).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!("udp socket bind failed: {}", e);
            return None;
        }
    };
    if let Err(e) = backend.connect(resolved).await {
        debug!("udp dial failed for {}: {}", target, e);
        return None;
    }

    let backend = Arc::new(backend);
    let key = peer.to_string();
    sessions.insert(key.clone(), Arc::clone(&backend));

    debug!(
        "udp session {} -> {} (listener: {})",
        peer, target, spec.name
    );

    tokio::spawn(return_path(
        Arc::clone(sessions),
        key,
        Arc::clone(&backend),
        Arc::clone(front),
        peer,
        UDP_READ_TIMEOUT,
        shutdown.clone(),
    ));

    // PROXY v2 头作为该会话发往后端的首个载荷
    let send_header = engine
        .backend(&spec.default_backend)
        .map(|b| b.send_proxy_v2)
        .unwrap_or(false);
    if send_header {
        match proxy_protocol::encode_v2(peer, local, Transport::Udp) {
            Ok(header) => {
                if let Err(e) = backend.send(&header).await {
                    debug!("proxy v2 header send failed for {}: {}", peer, e);
                }
            }
            Err(e) => warn!("proxy v2 header skipped: {}", e),
        }
    }

    Some(backend)
}

/// 会话回程：后端数据报写回客户端，空闲超时或出错即销毁会话
///
/// 会话表条目恰好在本任务退出时移除。
async fn return_path(
    sessions: SessionTable,
    key: String,
    backend: Arc<UdpSocket>,
    front: Arc<UdpSocket>,
    peer: SocketAddr,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = time::timeout(idle_timeout, backend.recv(&mut buf)) => result,
        };

        match received {
            Ok(Ok(n)) => {
                if let Err(e) = front.send_to(&buf[..n], peer).await {
                    debug!("udp return to {} failed: {}", peer, e);
                    break;
                }
            }
            Ok(Err(e)) => {
                debug!("udp session read error for {}: {}", peer, e);
                break;
            }
            Err(_) => {
                debug!("udp session for {} expired", peer);
                break;
            }
        }
    }

    sessions.remove(&key);
}
