//! 限速器
//!
//! 按读入字节数计算目标耗时，落后于目标节奏时补一段 sleep。
//! 多段下载时把总限速均分给各 worker，单 worker 下限 1 KB/s。

use std::time::{Duration, Instant};

/// 每个 worker 的最低限速
const MIN_PER_WORKER_LIMIT: i64 = 1024;

/// 字节级限速器（每个 worker 各持一个，无共享状态）
#[derive(Debug)]
pub struct RateLimiter {
    /// bytes/s，0 为不限速
    limit: i64,
    last_update: Instant,
}

impl RateLimiter {
    pub fn new(limit_bytes_per_sec: i64) -> Self {
        Self {
            limit: limit_bytes_per_sec.max(0),
            last_update: Instant::now(),
        }
    }

    /// 未启用限速的空限速器
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// 记录一次读取，需要时 sleep 到目标节奏
    ///
    /// `target_ms = n * 1000 / limit`，与上次更新的实际间隔取差补偿
    pub async fn consume(&mut self, bytes: usize) {
        if self.limit <= 0 || bytes == 0 {
            return;
        }

        let target_ms = bytes as f64 * 1000.0 / self.limit as f64;
        let elapsed_ms = self.last_update.elapsed().as_secs_f64() * 1000.0;
        if target_ms > elapsed_ms {
            tokio::time::sleep(Duration::from_millis((target_ms - elapsed_ms) as u64)).await;
        }
        self.last_update = Instant::now();
    }
}

/// 把总限速均分给 worker
///
/// 返回每个 worker 的限速（bytes/s），不低于 1 KB/s；总限速为 0
/// 时仍返回 0（不限速）
pub fn per_worker_limit(total_limit: i64, workers: usize) -> i64 {
    if total_limit <= 0 || workers == 0 {
        return 0;
    }
    (total_limit / workers as i64).max(MIN_PER_WORKER_LIMIT)
}
