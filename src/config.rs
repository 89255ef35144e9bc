/// 配置管理
///
/// 配置只在启动时构造一次，之后以值的形式传给 `Server`，运行期不再读取。

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 默认拨号超时
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// 代理协议模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// HTTP/HTTPS 代理（含 CONNECT）
    #[default]
    Http,
    /// SOCKS5 代理
    Socks5,
    /// 同一端口同时提供两种协议（按首字节区分）
    Mixed,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Http => f.write_str("http"),
            Mode::Socks5 => f.write_str("socks5"),
            Mode::Mixed => f.write_str("mixed"),
        }
    }
}

/// 运行配置
#[derive(Debug, Clone)]
pub struct Config {
    /// 本地监听地址
    pub listen_addr: String,

    /// 协议模式
    pub mode: Mode,

    /// 出口 IP 池（非空）
    pub ip_list: Vec<IpAddr>,

    /// 出站拨号超时
    pub dial_timeout: Duration,
}

impl Config {
    /// 检查配置是否可用
    pub fn validate(&self) -> Result<()> {
        if self.ip_list.is_empty() {
            return Err(Error::Config("ip_list must contain at least one address".into()));
        }
        if self.dial_timeout.is_zero() {
            return Err(Error::Config("dial timeout must be greater than zero".into()));
        }
        Ok(())
    }

    /// 解析监听地址（允许主机名）
    pub async fn resolve_listen_addr(&self) -> Result<SocketAddr> {
        tokio::net::lookup_host(&self.listen_addr)
            .await
            .map_err(|e| Error::Config(format!("invalid listen address {}: {}", self.listen_addr, e)))?
            .next()
            .ok_or_else(|| Error::Config(format!("listen address {} did not resolve", self.listen_addr)))
    }
}

/// 配置文件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub app: AppConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 监听地址
    #[serde(default = "default_listen_addr")]
    pub listen: String,

    /// 协议模式
    #[serde(default)]
    pub mode: Mode,

    /// 出口 IP 列表（字符串形式，加载时解析）
    #[serde(default)]
    pub ip_list: Vec<String>,

    /// 拨号超时（秒）
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
            mode: Mode::default(),
            ip_list: Vec::new(),
            dial_timeout_secs: default_dial_timeout_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_dial_timeout_secs() -> u64 {
    DEFAULT_DIAL_TIMEOUT.as_secs()
}

impl FileConfig {
    /// 从 TOML 文本解析
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// 从文件加载
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// 转换为运行配置并校验
    pub fn into_config(self) -> Result<Config> {
        let app = self.app;
        let ip_list = parse_ip_list(&app.ip_list)?;
        let config = Config {
            listen_addr: app.listen,
            mode: app.mode,
            ip_list,
            dial_timeout: Duration::from_secs(app.dial_timeout_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

/// 解析 IP 字符串列表，保持原有顺序
pub fn parse_ip_list<S: AsRef<str>>(list: &[S]) -> Result<Vec<IpAddr>> {
    list.iter()
        .map(|s| {
            let s = s.as_ref().trim();
            s.parse::<IpAddr>()
                .map_err(|_| Error::Config(format!("invalid egress IP: {:?}", s)))
        })
        .collect()
}
