/// 代理模块

pub mod dialer;
pub mod http;
pub mod relay;
pub mod server;
pub mod socks5;
pub mod tls;

pub use server::Server;
