//! TCP 连接处理
//!
//! 每条连接的状态机：接入 → 异步拨号后端（期间入流写入缓冲）→
//! 建连时冲刷缓冲 → 双向转发 → 任一侧结束即关闭。
//!
//! 客户端读循环与拨号任务共享 `Upstream` 状态；两个方向各自持有
//! 套接字的类型化半边，半边随任务结束而失效，因此不存在向已复用
//! 连接写入的可能。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Engine;
use crate::config::{ListenerSpec, Protocol};
use crate::error::{ProxyError, Result};
use crate::lb::Balancer;
use crate::proxy_protocol::{self, Transport};

/// 后端拨号超时
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// 转发读缓冲大小
const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// 拨号期间客户端入流缓冲上限，超限即关闭连接
const INGRESS_BUFFER_LIMIT: usize = 1024 * 1024;

/// 拨号完成前后的上游状态
///
/// Dialing → Connected 的转换只发生一次，由拨号任务在持锁状态下
/// 完成缓冲冲刷后执行；进入 Closed 后不再有任何后端写入。
enum Upstream {
    /// 拨号进行中，客户端入流暂存于缓冲
    Dialing { buffer: BytesMut },
    /// 已建连，后续字节直写后端
    Connected(OwnedWriteHalf),
    /// 任一侧已关闭
    Closed,
}

type SharedUpstream = Arc<Mutex<Upstream>>;

/// 单个 TCP 监听器的接收循环
pub(crate) async fn run_listener(
    engine: Arc<Engine>,
    listener: TcpListener,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = listener.accept() => result,
        };

        match accepted {
            Ok((stream, peer)) => {
                let engine = Arc::clone(&engine);
                let conn_shutdown = shutdown.child_token();
                tokio::spawn(async move {
                    handle_connection(engine, stream, peer, conn_shutdown).await;
                });
            }
            Err(e) => {
                error!("accept error: {}", e);
                // 避免持续性错误下的忙循环
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(
    engine: Arc<Engine>,
    stream: TcpStream,
    peer: SocketAddr,
    closed: CancellationToken,
) {
    let start = Instant::now();
    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("failed to read local address: {}", e);
            return;
        }
    };

    // 按 (协议, 端口) 定位监听器；绑定 IP 不参与匹配
    let spec = match engine.table().lookup(Protocol::Tcp, local.port()) {
        Some(spec) => spec,
        None => {
            error!("unknown listener for connection on {}", local);
            return;
        }
    };

    info!(
        "new connection from {} on {} (listener: {})",
        peer, local, spec.name
    );

    let (client_read, client_write) = stream.into_split();
    let state: SharedUpstream = Arc::new(Mutex::new(Upstream::Dialing {
        buffer: BytesMut::new(),
    }));

    // 异步拨号并承担后端→客户端方向
    let dial = tokio::spawn(dial_and_pump(
        Arc::clone(&engine),
        Arc::clone(&spec),
        Arc::clone(&state),
        client_write,
        peer,
        local,
        closed.clone(),
    ));

    // 客户端→后端方向在当前任务执行
    if let Err(e) = client_to_upstream(client_read, &state, &closed).await {
        error!("connection from {} failed: {}", peer, e);
    }

    // 客户端侧结束：置 Closed，让迟到的拨号结果丢弃其套接字
    close_upstream(&state).await;
    closed.cancel();

    let target = dial.await.unwrap_or(None);
    let duration = start.elapsed();

    info!(
        "closed connection from {} (duration: {:?})",
        peer, duration
    );
    engine.access_log().log(&format!(
        "tcp client={} listener={} backend={} duration_ms={}",
        peer,
        spec.name,
        target.as_deref().unwrap_or("-"),
        duration.as_millis()
    ));
}

/// 客户端→后端读循环
///
/// 拨号期间字节进缓冲（有上限），建连后直写后端，关闭后丢弃。
async fn client_to_upstream(
    mut client_read: OwnedReadHalf,
    state: &SharedUpstream,
    closed: &CancellationToken,
) -> Result<()> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = closed.cancelled() => return Ok(()),
            result = client_read.read(&mut buf) => result?,
        };
        if n == 0 {
            // 客户端 EOF
            return Ok(());
        }

        let mut guard = state.lock().await;
        match &mut *guard {
            Upstream::Dialing { buffer } => {
                if buffer.len() + n > INGRESS_BUFFER_LIMIT {
                    return Err(ProxyError::BufferOverflow(buffer.len() + n));
                }
                buffer.extend_from_slice(&buf[..n]);
            }
            Upstream::Connected(backend) => {
                if let Err(e) = backend.write_all(&buf[..n]).await {
                    *guard = Upstream::Closed;
                    return Err(e.into());
                }
            }
            Upstream::Closed => return Ok(()),
        }
    }
}

/// 拨号后端；成功后冲刷缓冲并进入后端→客户端读循环
///
/// 返回选中的后端地址（访问日志用）。
async fn dial_and_pump(
    engine: Arc<Engine>,
    spec: Arc<ListenerSpec>,
    state: SharedUpstream,
    mut client_write: OwnedWriteHalf,
    peer: SocketAddr,
    local: SocketAddr,
    closed: CancellationToken,
) -> Option<String> {
    let (balancer, target) = match pick_backend(&engine, &spec) {
        Ok(picked) => picked,
        Err(e) => {
            error!("failed to pick backend: {}", e);
            abort_client(&state, &mut client_write, &closed).await;
            return None;
        }
    };

    let backend = match time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            error!("backend connect failed: {}: {}", target, e);
            abort_client(&state, &mut client_write, &closed).await;
            return Some(target);
        }
        Err(_) => {
            error!("backend connect failed: {}: timeout after {:?}", target, DIAL_TIMEOUT);
            abort_client(&state, &mut client_write, &closed).await;
            return Some(target);
        }
    };

    let (mut backend_read, mut backend_write) = backend.into_split();

    // 发布连接：持锁检查 Closed、冲刷缓冲、转入 Connected
    {
        let mut guard = state.lock().await;
        match std::mem::replace(&mut *guard, Upstream::Closed) {
            Upstream::Dialing { buffer } => {
                let send_header = engine
                    .backend(&spec.default_backend)
                    .map(|b| b.send_proxy_v2)
                    .unwrap_or(false);
                if send_header {
                    match proxy_protocol::encode_v2(peer, local, Transport::Tcp) {
                        Ok(header) => {
                            if let Err(e) = backend_write.write_all(&header).await {
                                error!("failed to send proxy header: {}", e);
                                closed.cancel();
                                let _ = client_write.shutdown().await;
                                return Some(target);
                            }
                        }
                        Err(e) => warn!("proxy v2 header skipped: {}", e),
                    }
                }

                if !buffer.is_empty() {
                    if let Err(e) = backend_write.write_all(&buffer).await {
                        error!("failed to flush buffer: {}", e);
                        closed.cancel();
                        let _ = client_write.shutdown().await;
                        return Some(target);
                    }
                }
                // 缓冲随本作用域释放
                *guard = Upstream::Connected(backend_write);
            }
            Upstream::Closed => {
                // 客户端已先行关闭：丢弃刚拨通的后端连接
                debug!("client gone before dial completed, dropping {}", target);
                return Some(target);
            }
            connected @ Upstream::Connected(_) => {
                // 转换只发生一次，此分支不可达；原样放回
                *guard = connected;
                return Some(target);
            }
        }
    }

    balancer.on_connect(&target);

    // 后端→客户端
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            _ = closed.cancelled() => break,
            result = backend_read.read(&mut buf) => match result {
                Ok(0) => break, // 后端 EOF，正常收尾
                Ok(n) => n,
                Err(e) => {
                    error!("backend read error: {}", e);
                    break;
                }
            },
        };

        // 写失败意味着客户端已关闭，由关闭事件一侧负责记录
        if client_write.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }

    close_upstream(&state).await;
    closed.cancel();
    let _ = client_write.shutdown().await;
    balancer.on_disconnect(&target);

    Some(target)
}

/// 选取后端服务器；裸 host 按 1:1 映射补监听端口
fn pick_backend(
    engine: &Engine,
    spec: &ListenerSpec,
) -> Result<(Arc<dyn Balancer>, String)> {
    let balancer = engine
        .balancer(&spec.default_backend)
        .ok_or_else(|| ProxyError::BackendNotFound(spec.default_backend.clone()))?;

    let target = balancer.next()?;
    let target = super::ensure_port(target, spec.port);
    Ok((balancer, target))
}

async fn close_upstream(state: &SharedUpstream) {
    let mut guard = state.lock().await;
    *guard = Upstream::Closed;
}

/// 拨号失败时的客户端关闭路径
async fn abort_client(
    state: &SharedUpstream,
    client_write: &mut OwnedWriteHalf,
    closed: &CancellationToken,
) {
    close_upstream(state).await;
    closed.cancel();
    let _ = client_write.shutdown().await;
}
