//! PROXY Protocol v2 头编码
//!
//! 连接建立后作为首个载荷发往后端，向其告知原始客户端地址。
//! 线格式（HAProxy PROXY protocol 规范）：
//! - 12 字节签名
//! - 1 字节版本与命令
//! - 1 字节地址族与传输协议
//! - 2 字节地址块长度（大端）
//! - 地址块：src-ip、dst-ip、src-port、dst-port

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{ProxyError, Result};

/// PROXY protocol v2 签名（12 字节）
const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// 版本 2 + PROXY 命令（高 4 位版本，低 4 位命令）
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// 地址族：AF_INET (IPv4)
const AF_INET: u8 = 0x10;

/// 地址族：AF_INET6 (IPv6)
const AF_INET6: u8 = 0x20;

/// 传输协议：STREAM (TCP)
const TRANSPORT_STREAM: u8 = 0x01;

/// 传输协议：DGRAM (UDP)
const TRANSPORT_DGRAM: u8 = 0x02;

/// IPv4 地址块长度（4 + 4 + 2 + 2 = 12 字节）
const IPV4_ADDR_LEN: u16 = 12;

/// IPv6 地址块长度（16 + 16 + 2 + 2 = 36 字节）
const IPV6_ADDR_LEN: u16 = 36;

/// 头所针对的传输协议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    fn wire_byte(self) -> u8 {
        match self {
            Transport::Tcp => TRANSPORT_STREAM,
            Transport::Udp => TRANSPORT_DGRAM,
        }
    }
}

/// 编码 PROXY v2 头
///
/// `src` 为原始客户端地址，`dst` 为代理侧监听地址。
/// 两个地址必须属于同一地址族，否则返回 `FamilyMismatch`。
pub fn encode_v2(src: SocketAddr, dst: SocketAddr, transport: Transport) -> Result<Vec<u8>> {
    match (src.ip(), dst.ip()) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            Ok(encode_v4(src_ip, dst_ip, src.port(), dst.port(), transport))
        }
        (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => {
            Ok(encode_v6(src_ip, dst_ip, src.port(), dst.port(), transport))
        }
        _ => Err(ProxyError::FamilyMismatch),
    }
}

fn encode_v4(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    transport: Transport,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + IPV4_ADDR_LEN as usize);
    buf.extend_from_slice(&PROXY_V2_SIGNATURE);
    buf.push(VERSION_COMMAND_PROXY);
    buf.push(AF_INET | transport.wire_byte());
    buf.extend_from_slice(&IPV4_ADDR_LEN.to_be_bytes());
    buf.extend_from_slice(&src_ip.octets());
    buf.extend_from_slice(&dst_ip.octets());
    buf.extend_from_slice(&src_port.to_be_bytes());
    buf.extend_from_slice(&dst_port.to_be_bytes());
    buf
}

fn encode_v6(
    src_ip: Ipv6Addr,
    dst_ip: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    transport: Transport,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + IPV6_ADDR_LEN as usize);
    buf.extend_from_slice(&PROXY_V2_SIGNATURE);
    buf.push(VERSION_COMMAND_PROXY);
    buf.push(AF_INET6 | transport.wire_byte());
    buf.extend_from_slice(&IPV6_ADDR_LEN.to_be_bytes());
    buf.extend_from_slice(&src_ip.octets());
    buf.extend_from_slice(&dst_ip.octets());
    buf.extend_from_slice(&src_port.to_be_bytes());
    buf.extend_from_slice(&dst_port.to_be_bytes());
    buf
}

/// 解析 PROXY v2 头，返回 (src, dst, transport, 消费字节数)
///
/// 仅供测试与调试工具使用；数据面只发不收。
pub fn decode_v2(data: &[u8]) -> Option<(SocketAddr, SocketAddr, Transport, usize)> {
    if data.len() < 16 {
        return None;
    }
    if data[..12] != PROXY_V2_SIGNATURE {
        return None;
    }
    if data[12] != VERSION_COMMAND_PROXY {
        return None;
    }

    let family = data[13] & 0xF0;
    let transport = match data[13] & 0x0F {
        TRANSPORT_STREAM => Transport::Tcp,
        TRANSPORT_DGRAM => Transport::Udp,
        _ => return None,
    };
    let addr_len = u16::from_be_bytes([data[14], data[15]]) as usize;
    if data.len() < 16 + addr_len {
        return None;
    }

    let (src, dst) = match family {
        AF_INET => {
            if addr_len < IPV4_ADDR_LEN as usize {
                return None;
            }
            let src_ip = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
            let dst_ip = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
            let src_port = u16::from_be_bytes([data[24], data[25]]);
            let dst_port = u16::from_be_bytes([data[26], data[27]]);
            (
                SocketAddr::new(IpAddr::V4(src_ip), src_port),
                SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
            )
        }
        AF_INET6 => {
            if addr_len < IPV6_ADDR_LEN as usize {
                return None;
            }
            let src_octets: [u8; 16] = data[16..32].try_into().ok()?;
            let dst_octets: [u8; 16] = data[32..48].try_into().ok()?;
            let src_port = u16::from_be_bytes([data[48], data[49]]);
            let dst_port = u16::from_be_bytes([data[50], data[51]]);
            (
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src_octets)), src_port),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst_octets)), dst_port),
            )
        }
        _ => return None,
    };

    Some((src, dst, transport, 16 + addr_len))
}
