/// 出口 IP 选择
///
/// 每次出站拨号前从 IP 池中均匀随机取一个地址，不记忆历史选择。

use std::net::IpAddr;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

/// 出口 IP 选择器
///
/// 池在构造后不再修改；随机数发生器只在单次抽取期间加锁。
#[derive(Debug)]
pub struct EgressSelector {
    pool: Vec<IpAddr>,
    rng: Mutex<StdRng>,
}

impl EgressSelector {
    /// 使用系统熵初始化的发生器
    pub fn new(pool: Vec<IpAddr>) -> Result<Self> {
        Self::with_rng(pool, StdRng::from_entropy())
    }

    /// 注入发生器（测试中使用固定种子）
    pub fn with_rng(pool: Vec<IpAddr>, rng: StdRng) -> Result<Self> {
        if pool.is_empty() {
            return Err(Error::Config("egress pool is empty".into()));
        }
        Ok(Self {
            pool,
            rng: Mutex::new(rng),
        })
    }

    /// 随机选取一个出口 IP
    pub fn pick(&self) -> IpAddr {
        let idx = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            rng.gen_range(0..self.pool.len())
        };
        self.pool[idx]
    }
}
