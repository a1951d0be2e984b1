//! 上传事件与进度节流
//!
//! 调度器通过 broadcast 通道发布事件，进度事件按时间间隔节流，避免事件风暴

use crate::uploader::SessionState;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 200;

/// 上传会话事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 会话状态变更
    StateChanged {
        old_state: SessionState,
        new_state: SessionState,
    },
    /// 进度更新
    Progress {
        completed_units: u64,
        total_units: u64,
        fraction: f64,
    },
    /// 单个文件全部分片上传完成
    FileCompleted { file_index: usize, remote_id: String },
    /// 会话完成
    Completed { transfer_id: String },
    /// 会话失败
    Failed { error: String },
}

/// 进度事件节流器
///
/// 使用原子时间戳，多个分片任务共享时无锁
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 起始时间
    origin: Instant,
    /// 上次发布时间（相对 origin 的纳秒数 + 1，0 表示从未发布）
    last_emit: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距离上次发布超过间隔时返回 true 并占用本次发布
    pub fn should_emit(&self) -> bool {
        let now = self.origin.elapsed().as_nanos() as u64 + 1;
        let last = self.last_emit.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }
        // 被其他任务抢先更新时本次不发布
        self.last_emit
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 忽略间隔强制发布（用于最后一次更新）
    pub fn force_emit(&self) -> bool {
        let now = self.origin.elapsed().as_nanos() as u64 + 1;
        self.last_emit.store(now, Ordering::Relaxed);
        true
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_PROGRESS_INTERVAL_MS)
    }
}
