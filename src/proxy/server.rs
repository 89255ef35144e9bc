/// 代理服务器主逻辑

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::{Config, Mode};
use crate::egress::EgressSelector;
use crate::error::{Error, Result};
use super::dialer::Dialer;
use super::http::serve_http;
use super::socks5::handle_socks5;

/// 监听一个端口，按配置的模式处理每个连接
pub struct Server {
    listener: TcpListener,
    mode: Mode,
    dialer: Arc<Dialer>,
}

impl Server {
    /// 校验配置并绑定监听地址
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;
        let addr = config.resolve_listen_addr().await?;
        let egress = EgressSelector::new(config.ip_list)?;
        Self::bind_with(addr, config.mode, Dialer::new(egress, config.dial_timeout)).await
    }

    /// 使用现成的拨号器绑定
    pub async fn bind_with(addr: SocketAddr, mode: Mode, dialer: Dialer) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            mode,
            dialer: Arc::new(dialer),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 接受连接，每个连接一个任务；只有监听本身出错才返回
    pub async fn run(self) -> Result<()> {
        info!("🚀 Proxy server listening on {} ({})", self.local_addr()?, self.mode);
        info!("   Dial timeout: {:?}", self.dialer.timeout());

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("📥 New connection from {}", addr);
                    let dialer = self.dialer.clone();
                    let mode = self.mode;

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, mode, dialer).await {
                            log_connection_error(addr, &e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// 处理单个连接
async fn handle_connection(stream: TcpStream, mode: Mode, dialer: Arc<Dialer>) -> Result<()> {
    match mode {
        Mode::Socks5 => handle_socks5(stream, &dialer).await,
        Mode::Http => serve_http(stream, dialer).await,
        Mode::Mixed => {
            // 检测协议类型（peek 第一个字节）
            let mut buf = [0u8; 1];
            let n = stream.peek(&mut buf).await?;
            if n == 0 {
                return Err(Error::MalformedFrame("first byte"));
            }

            match buf[0] {
                0x05 => {
                    debug!("Detected SOCKS5 protocol");
                    handle_socks5(stream, &dialer).await
                }
                b'A'..=b'Z' => {
                    debug!("Detected HTTP protocol");
                    serve_http(stream, dialer).await
                }
                other => Err(Error::Protocol(format!("Unknown protocol, first byte: 0x{:02x}", other))),
            }
        }
    }
}

fn log_connection_error(addr: SocketAddr, e: &Error) {
    match e {
        Error::MalformedFrame(_) | Error::Io(_) => debug!("Connection from {} ended: {}", addr, e),
        _ => warn!("Connection error from {}: {}", addr, e),
    }
}
