/// 上游 TLS
///
/// 转发 `https://` 绝对 URI 时，在拨号得到的 TCP 连接上先完成 TLS 握手，
/// 证书用 webpki 内置根校验。

use std::sync::{Arc, OnceLock};

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{Error, Result};

static CLIENT_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

/// 创建客户端 TLS 配置
fn create_tls_config() -> Result<Arc<ClientConfig>> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// 进程内共用一份配置
fn tls_config() -> Result<Arc<ClientConfig>> {
    if let Some(config) = CLIENT_CONFIG.get() {
        return Ok(config.clone());
    }
    let config = create_tls_config()?;
    Ok(CLIENT_CONFIG.get_or_init(|| config).clone())
}

/// SNI 名称；IPv6 字面量去掉方括号
fn server_name(host: &str) -> Result<ServerName<'static>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|e| Error::Tls(format!("Invalid server name {}: {}", host, e)))
}

/// 在已建立的 TCP 连接上完成 TLS 握手
pub async fn connect_tls(tcp: TcpStream, host: &str) -> Result<TlsStream<TcpStream>> {
    debug!("Establishing TLS connection to {}", host);

    let connector = TlsConnector::from(tls_config()?);
    let domain = server_name(host)?;

    connector
        .connect(domain, tcp)
        .await
        .map_err(|e| Error::Tls(format!("TLS handshake with {} failed: {}", host, e)))
}
