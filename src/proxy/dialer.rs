/// 出站拨号
///
/// 拨号前把本地端绑定到选中的出口 IP（端口交给系统），
/// 整个过程（含 DNS 解析）受超时约束。

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::{debug, trace};

use crate::egress::EgressSelector;
use crate::error::{Error, Result};
use super::socks5::TargetAddr;

/// 带出口选择的拨号器
#[derive(Debug)]
pub struct Dialer {
    egress: EgressSelector,
    timeout: Duration,
}

impl Dialer {
    pub fn new(egress: EgressSelector, timeout: Duration) -> Self {
        Self { egress, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 选取出口 IP 并拨号
    pub async fn dial(&self, target: &TargetAddr) -> Result<TcpStream> {
        let local_ip = self.egress.pick();
        debug!("Dialing {} via egress {}", target, local_ip);

        dial_tcp(target, self.timeout, Some(local_ip))
            .await
            .map_err(|source| Error::DestinationUnreachable {
                target: target.to_string(),
                source,
            })
    }
}

/// 建立 TCP 连接
///
/// `local_ip` 为 `None` 时由系统选择本地地址。
pub async fn dial_tcp(
    target: &TargetAddr,
    timeout: Duration,
    local_ip: Option<IpAddr>,
) -> io::Result<TcpStream> {
    match tokio::time::timeout(timeout, connect(target, local_ip)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("dial tcp {}: i/o timeout", target),
        )),
    }
}

async fn connect(target: &TargetAddr, local_ip: Option<IpAddr>) -> io::Result<TcpStream> {
    let mut last_err = None;

    for addr in lookup_host(target.to_string()).await? {
        // 出口地址族必须与目标一致
        if let Some(ip) = local_ip {
            if ip.is_ipv4() != addr.is_ipv4() {
                trace!("Skipping {}: family differs from egress {}", addr, ip);
                continue;
            }
        }

        let socket = match new_socket(addr, local_ip) {
            Ok(socket) => socket,
            Err(e) => {
                trace!("Cannot prepare socket for {}: {}", addr, e);
                last_err = Some(e);
                continue;
            }
        };

        match socket.connect(addr).await {
            Ok(stream) => {
                trace!("Connected to {} from {:?}", addr, stream.local_addr().ok());
                return Ok(stream);
            }
            Err(e) => {
                trace!("Connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address of {} matches the egress address family", target),
        )
    }))
}

fn new_socket(addr: SocketAddr, local_ip: Option<IpAddr>) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(ip) = local_ip {
        socket.bind(SocketAddr::new(ip, 0))?;
    }
    Ok(socket)
}
