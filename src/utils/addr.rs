/// 地址解析工具

use crate::error::{Error, Result};

/// 拆分 `host:port`
///
/// 支持 `[v6]:port` 形式；缺少端口时使用 `default_port`，
/// 两者都没有时返回错误。返回的 host 保留 IPv6 的方括号。
pub fn split_host_port(addr: &str, default_port: Option<u16>) -> Result<(String, u16)> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(Error::Protocol("empty address".into()));
    }

    // 方括号内的冒号不是端口分隔符
    let port_sep = match addr.rfind(']') {
        Some(end) => addr[end..].rfind(':').map(|i| end + i),
        None => addr.rfind(':'),
    };

    let (host, port) = match port_sep {
        Some(pos) => {
            let port = addr[pos + 1..]
                .parse::<u16>()
                .map_err(|_| Error::Protocol(format!("Invalid port in {}", addr)))?;
            (&addr[..pos], port)
        }
        None => {
            let port = default_port
                .ok_or_else(|| Error::Protocol(format!("Missing port in {}", addr)))?;
            (addr, port)
        }
    };

    if host.is_empty() {
        return Err(Error::Protocol(format!("Missing host in {}", addr)));
    }

    Ok((host.to_string(), port))
}
