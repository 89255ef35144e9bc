/// SOCKS5 协议实现
///
/// RFC 1928: https://www.rfc-editor.org/rfc/rfc1928
///
/// 只支持无认证 + CONNECT，目标地址支持 IPv4 和域名。

use std::fmt;
use std::io;
use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use super::dialer::Dialer;
use super::relay::relay;

/// SOCKS5 版本号
const SOCKS5_VERSION: u8 = 0x05;

/// 认证方法：无需认证
const AUTH_NO_AUTH: u8 = 0x00;

/// CONNECT 命令
const CMD_CONNECT: u8 = 0x01;

/// 地址类型
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// 回复状态
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// 握手失败时应回给客户端的状态；`None` 表示直接断开
    fn for_error(err: &Error) -> Option<Reply> {
        match err {
            Error::UnsupportedCommand(_) => Some(Reply::CommandNotSupported),
            Error::UnsupportedAddressFamily | Error::InvalidAddressType(_) => {
                Some(Reply::AddressTypeNotSupported)
            }
            Error::DestinationUnreachable { source, .. } => Some(match source.kind() {
                io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
                io::ErrorKind::TimedOut | io::ErrorKind::HostUnreachable => Reply::HostUnreachable,
                io::ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
                _ => Reply::GeneralFailure,
            }),
            _ => None,
        }
    }
}

/// 目标地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// IPv4 地址
    Ipv4(Ipv4Addr, u16),
    /// 域名（由出站拨号时解析）
    Domain(String, u16),
}

impl TargetAddr {
    /// 从 host + port 构造，能解析为 IPv4 的 host 视为地址
    pub fn from_host_port(host: &str, port: u16) -> Self {
        match host.parse::<Ipv4Addr>() {
            Ok(ip) => TargetAddr::Ipv4(ip, port),
            Err(_) => TargetAddr::Domain(host.to_string(), port),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// 处理 SOCKS5 连接
///
/// 握手、拨号、回复成功，然后进入转发，直到转发结束才返回。
pub async fn handle_socks5<S>(mut client: S, dialer: &Dialer) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // 1. 协商认证方法
    negotiate(&mut client).await?;

    // 2. 读取请求
    let target = match read_request(&mut client).await {
        Ok(target) => target,
        Err(e) => return Err(reject(&mut client, e).await),
    };
    debug!("SOCKS5 CONNECT {}", target);

    // 3. 建立出站连接
    let remote = match dialer.dial(&target).await {
        Ok(remote) => remote,
        Err(e) => return Err(reject(&mut client, e).await),
    };

    // 4. 回复成功，BND.ADDR/BND.PORT 固定为 0
    send_reply(&mut client, Reply::Succeeded).await?;
    info!("SOCKS5 tunnel established to {}", target);

    // 5. 双向转发
    let (up, down) = relay(client, remote).await;
    info!("SOCKS5 connection to {} closed: ↑ {} bytes, ↓ {} bytes", target, up, down);

    Ok(())
}

/// 读取客户端问候并选择无认证
///
/// 客户端提供的方法列表不做检查。
pub async fn negotiate<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await.map_err(Error::on_read("greeting version"))?;
    if version != SOCKS5_VERSION {
        return Err(Error::ProtocolVersionMismatch(version));
    }

    let nmethods = stream.read_u8().await.map_err(Error::on_read("method count"))?;
    let mut methods = vec![0u8; nmethods as usize];
    stream
        .read_exact(&mut methods)
        .await
        .map_err(Error::on_read("methods"))?;
    trace!("SOCKS5 client methods: {:?}", methods);

    stream.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await?;
    stream.flush().await?;
    Ok(())
}

/// 读取 CONNECT 请求中的目标地址
pub async fn read_request<S>(stream: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(Error::on_read("request header"))?;
    let [version, cmd, _rsv, atyp] = header;

    if version != SOCKS5_VERSION {
        return Err(Error::ProtocolVersionMismatch(version));
    }
    if cmd != CMD_CONNECT {
        return Err(Error::UnsupportedCommand(cmd));
    }

    let target = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream
                .read_exact(&mut octets)
                .await
                .map_err(Error::on_read("IPv4 address"))?;
            let port = read_port(stream).await?;
            TargetAddr::Ipv4(Ipv4Addr::from(octets), port)
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await.map_err(Error::on_read("domain length"))?;
            let mut domain = vec![0u8; len as usize];
            stream
                .read_exact(&mut domain)
                .await
                .map_err(Error::on_read("domain name"))?;
            let port = read_port(stream).await?;
            TargetAddr::Domain(String::from_utf8_lossy(&domain).into_owned(), port)
        }
        ATYP_IPV6 => return Err(Error::UnsupportedAddressFamily),
        other => return Err(Error::InvalidAddressType(other)),
    };

    Ok(target)
}

async fn read_port<S>(stream: &mut S) -> Result<u16>
where
    S: AsyncRead + Unpin,
{
    // Big-Endian
    stream.read_u16().await.map_err(Error::on_read("port"))
}

/// 发送 SOCKS5 响应（总是返回 0.0.0.0:0）
async fn send_reply<S>(stream: &mut S, reply: Reply) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = [
        SOCKS5_VERSION,
        reply as u8,
        0x00, // Reserved
        ATYP_IPV4,
        0, 0, 0, 0, // 0.0.0.0
        0, 0, // Port 0
    ];

    stream.write_all(&response).await?;
    stream.flush().await
}

/// 尽力回复失败状态，返回原始错误
async fn reject<S>(stream: &mut S, err: Error) -> Error
where
    S: AsyncWrite + Unpin,
{
    if let Some(reply) = Reply::for_error(&err) {
        if let Err(e) = send_reply(stream, reply).await {
            trace!("Failed to send SOCKS5 reply {:?}: {}", reply, e);
        }
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    use crate::egress::EgressSelector;

    const SUCCESS_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

    fn loopback_dialer() -> Arc<Dialer> {
        let egress = EgressSelector::new(vec![IpAddr::from([127, 0, 0, 1])]).unwrap();
        Arc::new(Dialer::new(egress, Duration::from_secs(10)))
    }

    #[tokio::test]
    async fn test_parse_domain_request() {
        let (mut client, mut server) = duplex(1024);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[
                0x05, 0x01, 0x00, 0x03, 0x09, 0x6c, 0x6f, 0x63, 0x61, 0x6c, 0x68, 0x6f, 0x73,
                0x74, 0x00, 0x50,
            ])
            .await
            .unwrap();

        negotiate(&mut server).await.unwrap();
        let target = read_request(&mut server).await.unwrap();
        assert_eq!(target, TargetAddr::Domain("localhost".into(), 80));

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_parse_ipv4_request() {
        let (mut client, mut server) = duplex(1024);
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 1, 2, 3, 0x01, 0xBB])
            .await
            .unwrap();

        let target = read_request(&mut server).await.unwrap();
        assert_eq!(target, TargetAddr::Ipv4(Ipv4Addr::new(10, 1, 2, 3), 443));
        assert_eq!(target.to_string(), "10.1.2.3:443");
    }

    #[tokio::test]
    async fn test_any_method_set_accepted() {
        let (mut client, mut server) = duplex(1024);
        // 只提供用户名密码认证，同样选择无认证
        client.write_all(&[0x05, 0x02, 0x01, 0x02]).await.unwrap();

        negotiate(&mut server).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_greeting_version_mismatch() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

        let err = negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolVersionMismatch(0x04)));
    }

    #[tokio::test]
    async fn test_request_version_mismatch() {
        let (mut client, mut server) = duplex(1024);
        client
            .write_all(&[0x04, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        let err = read_request(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolVersionMismatch(0x04)));
    }

    #[tokio::test]
    async fn test_truncated_frames() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[0x05, 0x03, 0x00]).await.unwrap();
        drop(client);
        let err = negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::MalformedFrame("methods")));

        let (mut client, mut server) = duplex(1024);
        client
            .write_all(&[0x05, 0x01, 0x00, 0x03, 0x0b, b'e', b'x'])
            .await
            .unwrap();
        drop(client);
        let err = read_request(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::MalformedFrame("domain name")));

        let (mut client, mut server) = duplex(1024);
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00])
            .await
            .unwrap();
        drop(client);
        let err = read_request(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::MalformedFrame("port")));
    }

    #[tokio::test]
    async fn test_ipv6_rejected_without_dial() {
        let (mut client, server) = duplex(1024);
        let dialer = loopback_dialer();
        let engine = tokio::spawn(async move { handle_socks5(server, &dialer).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut request = vec![0x05, 0x01, 0x00, 0x04];
        request.extend_from_slice(&[0u8; 15]);
        request.push(1); // ::1
        request.extend_from_slice(&[0x00, 0x50]);
        client.write_all(&request).await.unwrap();

        let err = engine.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::UnsupportedAddressFamily));

        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..2], [0x05, 0x00]);
        assert_eq!(reply[2..4], [0x05, Reply::AddressTypeNotSupported as u8]);
    }

    #[tokio::test]
    async fn test_unsupported_commands() {
        for cmd in [0x02u8, 0x03] {
            let (mut client, server) = duplex(1024);
            let dialer = loopback_dialer();
            let engine = tokio::spawn(async move { handle_socks5(server, &dialer).await });

            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            client
                .write_all(&[0x05, cmd, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
                .await
                .unwrap();

            let err = engine.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::UnsupportedCommand(c) if c == cmd));

            let mut reply = [0u8; 4];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply, [0x05, 0x00, 0x05, Reply::CommandNotSupported as u8]);
        }
    }

    #[tokio::test]
    async fn test_invalid_address_type() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[0x05, 0x01, 0x00, 0x02]).await.unwrap();

        let err = read_request(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::InvalidAddressType(0x02)));
    }

    #[tokio::test]
    async fn test_connect_and_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (mut client, server) = duplex(1024);
        let dialer = loopback_dialer();
        let engine = tokio::spawn(async move { handle_socks5(server, &dialer).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let [hi, lo] = port.to_be_bytes();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, hi, lo])
            .await
            .unwrap();

        let (mut upstream, peer) = listener.accept().await.unwrap();
        assert_eq!(peer.ip(), IpAddr::from([127, 0, 0, 1]));

        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..2], [0x05, 0x00]);
        assert_eq!(reply[2..], SUCCESS_REPLY);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // 只拨号一次
        let second = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(second.is_err());

        drop(upstream);
        tokio::time::timeout(Duration::from_secs(5), engine)
            .await
            .expect("engine did not finish")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure_reply() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (mut client, server) = duplex(1024);
        let dialer = loopback_dialer();
        let engine = tokio::spawn(async move { handle_socks5(server, &dialer).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let [hi, lo] = port.to_be_bytes();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, hi, lo])
            .await
            .unwrap();

        let err = engine.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::DestinationUnreachable { .. }));

        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[2..4], [0x05, Reply::ConnectionRefused as u8]);
    }

    #[test]
    fn test_target_from_host_port() {
        assert_eq!(
            TargetAddr::from_host_port("192.168.1.1", 8080),
            TargetAddr::Ipv4(Ipv4Addr::new(192, 168, 1, 1), 8080)
        );
        assert_eq!(
            TargetAddr::from_host_port("example.com", 443),
            TargetAddr::Domain("example.com".into(), 443)
        );
        assert_eq!(TargetAddr::from_host_port("[::1]", 80).to_string(), "[::1]:80");
    }

    #[tokio::test]
    async fn test_invalid_address_type_reply() {
        let (mut client, server) = duplex(1024);
        let dialer = loopback_dialer();
        let engine = tokio::spawn(async move { handle_socks5(server, &dialer).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x02, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();

        let err = engine.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::InvalidAddressType(0x02)));

        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..2], [0x05, 0x00]);
        assert_eq!(
            reply[2..],
            [0x05, Reply::AddressTypeNotSupported as u8, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }
}
