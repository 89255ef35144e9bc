/// 工具函数

pub mod addr;

pub use addr::split_host_port;
