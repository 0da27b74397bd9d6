/// End-to-end tests: engine + listeners + balancer + UDP sessions
mod common;

use std::time::Duration;

use nvelox::config::{BackendBuilder, ConfigBuilder, ListenerBuilder, Protocol};
use nvelox::proxy_protocol;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_basic_tcp_proxy() {
    let backend_port = common::get_available_port();
    let front_port = common::get_available_port();

    let _echo = common::start_echo_server("127.0.0.1", backend_port).await;

    let cfg = ConfigBuilder::new()
        .backend(
            BackendBuilder::new("b1")
                .server(&format!("127.0.0.1:{}", backend_port))
                .build(),
        )
        .listener(
            ListenerBuilder::new("fe", &format!("127.0.0.1:{}", front_port))
                .default_backend("b1")
                .build(),
        )
        .build();

    let shutdown = common::spawn_engine(cfg);
    sleep(Duration::from_millis(150)).await;

    let mut client = TcpStream::connect(("127.0.0.1", front_port)).await.unwrap();
    // 写入发生在后端拨号完成之前，走的是拨号期缓冲路径
    client.write_all(b"Hello Nvelox").await.unwrap();

    let mut buf = vec![0u8; 64];
    let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"Hello Nvelox");

    shutdown.cancel();
}

#[tokio::test]
async fn test_basic_udp_proxy() {
    let backend_port = common::get_available_udp_port();
    let front_port = common::get_available_udp_port();

    let _echo = common::start_udp_echo_server(backend_port).await;

    let cfg = ConfigBuilder::new()
        .backend(
            BackendBuilder::new("b1")
                .server(&format!("127.0.0.1:{}", backend_port))
                .build(),
        )
        .listener(
            ListenerBuilder::new("fe", &format!("127.0.0.1:{}", front_port))
                .protocol(Protocol::Udp)
                .default_backend("b1")
                .build(),
        )
        .build();

    let shutdown = common::spawn_engine(cfg);
    sleep(Duration::from_millis(150)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"Hello UDP", ("127.0.0.1", front_port))
        .await
        .unwrap();

    let mut buf = vec![0u8; 64];
    let (n, _) = timeout(WAIT, client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"Hello UDP");

    shutdown.cancel();
}

#[tokio::test]
async fn test_dead_backend_closes_client() {
    let dead_port = common::get_available_port();
    let front_port = common::get_available_port();

    // 错误日志落到临时文件，便于断言日志内容
    let log_path = std::env::temp_dir().join(format!(
        "nvelox-error-{}.log",
        std::process::id()
    ));
    nvelox::logging::init("error", log_path.to_str()).unwrap();

    let cfg = ConfigBuilder::new()
        .backend(
            BackendBuilder::new("b1")
                .server(&format!("127.0.0.1:{}", dead_port))
                .build(),
        )
        .listener(
            ListenerBuilder::new("fe", &format!("127.0.0.1:{}", front_port))
                .default_backend("b1")
                .build(),
        )
        .build();

    let shutdown = common::spawn_engine(cfg);
    sleep(Duration::from_millis(150)).await;

    let mut client = TcpStream::connect(("127.0.0.1", front_port)).await.unwrap();
    let _ = client.write_all(b"x").await;

    // 拨号被拒后客户端连接应当被关闭，读到 EOF 而非数据
    let mut buf = vec![0u8; 16];
    let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);

    // 错误日志应包含拨号失败记录
    sleep(Duration::from_millis(100)).await;
    let log = std::fs::read_to_string(&log_path).unwrap();
    assert!(
        log.contains("backend connect failed"),
        "error log missing dial failure entry: {}",
        log
    );

    shutdown.cancel();
    let _ = std::fs::remove_file(&log_path);
}

#[tokio::test]
async fn test_udp_session_stickiness() {
    let tag_a = common::get_available_udp_port();
    let tag_b = common::get_available_udp_port();
    let front_port = common::get_available_udp_port();

    let _a = common::start_udp_tag_server(tag_a).await;
    let _b = common::start_udp_tag_server(tag_b).await;

    let cfg = ConfigBuilder::new()
        .backend(
            BackendBuilder::new("pool")
                .balance("roundrobin")
                .server(&format!("127.0.0.1:{}", tag_a))
                .server(&format!("127.0.0.1:{}", tag_b))
                .build(),
        )
        .listener(
            ListenerBuilder::new("fe", &format!("127.0.0.1:{}", front_port))
                .protocol(Protocol::Udp)
                .default_backend("pool")
                .build(),
        )
        .build();

    let shutdown = common::spawn_engine(cfg);
    sleep(Duration::from_millis(150)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut replies = Vec::new();
    let mut buf = vec![0u8; 64];

    for _ in 0..3 {
        client
            .send_to(b"ping", ("127.0.0.1", front_port))
            .await
            .unwrap();
        let (n, _) = timeout(WAIT, client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        replies.push(String::from_utf8_lossy(&buf[..n]).to_string());
    }

    // 同一客户端的所有数据报固定走会话建立时选中的后端
    assert_eq!(replies[0], replies[1]);
    assert_eq!(replies[1], replies[2]);

    shutdown.cancel();
}

#[tokio::test]
async fn test_proxy_v2_header_sent_to_tcp_backend() {
    let backend_port = common::get_available_port();
    let front_port = common::get_available_port();

    // PROXY 头 (28 字节) + 载荷
    let (_server, mut captured) = common::start_capture_server(backend_port, 28 + 7).await;

    let cfg = ConfigBuilder::new()
        .backend(
            BackendBuilder::new("b1")
                .server(&format!("127.0.0.1:{}", backend_port))
                .send_proxy_v2(true)
                .build(),
        )
        .listener(
            ListenerBuilder::new("fe", &format!("127.0.0.1:{}", front_port))
                .default_backend("b1")
                .build(),
        )
        .build();

    let shutdown = common::spawn_engine(cfg);
    sleep(Duration::from_millis(150)).await;

    let mut client = TcpStream::connect(("127.0.0.1", front_port)).await.unwrap();
    let client_addr = client.local_addr().unwrap();
    client.write_all(b"payload").await.unwrap();

    let bytes = timeout(WAIT, captured.recv()).await.unwrap().unwrap();
    let (src, dst, transport, consumed) = proxy_protocol::decode_v2(&bytes).unwrap();

    assert_eq!(consumed, 28);
    assert_eq!(src, client_addr);
    assert_eq!(dst.port(), front_port);
    assert_eq!(transport, proxy_protocol::Transport::Tcp);
    assert_eq!(&bytes[consumed..], b"payload");

    shutdown.cancel();
}

#[tokio::test]
async fn test_port_range_one_to_one_mapping() {
    // 1:1 端口映射：裸 host 后端补监听端口。
    // 后端侧用 127.0.0.2，避免与前端监听端口冲突。
    let (p1, p2) = contiguous_port_pair();

    let _echo1 = common::start_echo_server("127.0.0.2", p1).await;
    let _echo2 = common::start_echo_server("127.0.0.2", p2).await;

    let cfg = ConfigBuilder::new()
        .backend(BackendBuilder::new("pool").server("127.0.0.2").build())
        .listener(
            ListenerBuilder::new("range", &format!("127.0.0.1:{}-{}", p1, p2))
                .default_backend("pool")
                .build(),
        )
        .build();

    let shutdown = common::spawn_engine(cfg);
    sleep(Duration::from_millis(150)).await;

    for port in [p1, p2] {
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"pass-through").await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"pass-through", "port {}", port);
    }

    shutdown.cancel();
}

#[tokio::test]
async fn test_health_check_removes_dead_server() {
    let dead_port = common::get_available_port();
    let alive_port = common::get_available_port();
    let front_port = common::get_available_port();

    let _echo = common::start_echo_server("127.0.0.1", alive_port).await;

    let mut backend = BackendBuilder::new("pool")
        .balance("roundrobin")
        .server(&format!("127.0.0.1:{}", dead_port))
        .server(&format!("127.0.0.1:{}", alive_port))
        .build();
    backend.health_check.active.check_type = "tcp".to_string();
    backend.health_check.active.interval = "50ms".to_string();
    backend.health_check.active.timeout = "100ms".to_string();

    let cfg = ConfigBuilder::new()
        .backend(backend)
        .listener(
            ListenerBuilder::new("fe", &format!("127.0.0.1:{}", front_port))
                .default_backend("pool")
                .build(),
        )
        .build();

    let shutdown = common::spawn_engine(cfg);

    // 等健康检查把死后端标记为 DOWN
    sleep(Duration::from_millis(500)).await;

    // 此后轮询只会命中存活的后端
    for _ in 0..4 {
        let mut client = TcpStream::connect(("127.0.0.1", front_port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let mut buf = vec![0u8; 16];
        let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let backend_port = common::get_available_port();
    let front_port = common::get_available_port();

    let _echo = common::start_echo_server("127.0.0.1", backend_port).await;

    let cfg = ConfigBuilder::new()
        .backend(
            BackendBuilder::new("b1")
                .server(&format!("127.0.0.1:{}", backend_port))
                .build(),
        )
        .listener(
            ListenerBuilder::new("fe", &format!("127.0.0.1:{}", front_port))
                .default_backend("b1")
                .build(),
        )
        .build();

    let shutdown = common::spawn_engine(cfg);
    sleep(Duration::from_millis(150)).await;

    // 正常服务中
    let probe = TcpStream::connect(("127.0.0.1", front_port)).await;
    assert!(probe.is_ok());

    shutdown.cancel();
    sleep(Duration::from_millis(200)).await;

    // 监听器退出后不再接受新连接
    let refused = TcpStream::connect(("127.0.0.1", front_port)).await;
    assert!(refused.is_err());
}

/// 找一对相邻的空闲端口（范围监听测试用）
fn contiguous_port_pair() -> (u16, u16) {
    for _ in 0..50 {
        let p = common::get_available_port();
        if p == u16::MAX {
            continue;
        }
        let next_free = std::net::TcpListener::bind(("127.0.0.1", p + 1)).is_ok()
            && std::net::TcpListener::bind(("127.0.0.2", p)).is_ok()
            && std::net::TcpListener::bind(("127.0.0.2", p + 1)).is_ok();
        if next_free {
            return (p, p + 1);
        }
    }
    panic!("could not find contiguous free ports");
}
