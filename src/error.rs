use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Unsupported SOCKS version: {0}")]
    ProtocolVersionMismatch(u8),

    #[error("Unsupported SOCKS command: {0}")]
    UnsupportedCommand(u8),

    #[error("IPv6 destinations are not supported")]
    UnsupportedAddressFamily,

    #[error("Invalid address type: {0}")]
    InvalidAddressType(u8),

    #[error("Malformed frame: truncated {0}")]
    MalformedFrame(&'static str),

    #[error("Dial {target} failed: {source}")]
    DestinationUnreachable {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Hijacking not supported: {0}")]
    HijackUnsupported(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// 把握手阶段的读错误归类：短读视为帧不完整，其余保留为 IO 错误
    pub fn on_read(field: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::MalformedFrame(field)
            } else {
                Error::Io(e)
            }
        }
    }
}

impl From<tokio_rustls::rustls::Error> for Error {
    fn from(e: tokio_rustls::rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
