//! 分层进度计数器
//!
//! 分片 → 文件 → 整个会话 组成一棵进度树：
//! - 子节点挂载时把自己的总量计入父节点（父节点可预先分配总量）
//! - 叶子节点上报的增量通过原子操作逐级累加到所有祖先
//! - 已完成量只增不减：重新上传同一分片复用原节点，不会重复计数
//!
//! 读取 `fraction_completed` 不加锁，可在任意线程轮询

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct ProgressInner {
    /// 已完成单位数
    completed: AtomicU64,
    /// 总单位数
    total: AtomicU64,
    /// 已挂载子节点占用的单位数
    attached: AtomicU64,
    /// 父节点
    parent: Option<Arc<ProgressInner>>,
}

impl ProgressInner {
    fn new(total: u64, parent: Option<Arc<ProgressInner>>) -> Self {
        Self {
            completed: AtomicU64::new(0),
            total: AtomicU64::new(total),
            attached: AtomicU64::new(0),
            parent,
        }
    }

    /// 为子节点预留 `units` 个单位，预留超出当前总量时扩容并向上传播
    fn reserve(&self, units: u64) {
        let attached = self.attached.fetch_add(units, Ordering::SeqCst) + units;
        let previous = self.total.fetch_max(attached, Ordering::SeqCst);
        if attached > previous {
            if let Some(parent) = &self.parent {
                parent.reserve(attached - previous);
            }
        }
    }

    fn add_completed(&self, delta: u64) {
        self.completed.fetch_add(delta, Ordering::SeqCst);
        if let Some(parent) = &self.parent {
            parent.add_completed(delta);
        }
    }
}

/// 进度节点（克隆共享同一节点）
#[derive(Debug, Clone)]
pub struct ProgressNode {
    inner: Arc<ProgressInner>,
}

impl ProgressNode {
    /// 创建根节点，`total_units` 为预分配总量（可为 0，由子节点挂载时扩容）
    pub fn new(total_units: u64) -> Self {
        Self {
            inner: Arc::new(ProgressInner::new(total_units, None)),
        }
    }

    /// 挂载子节点
    pub fn make_child(&self, total_units: u64) -> ProgressNode {
        self.inner.reserve(total_units);
        Self {
            inner: Arc::new(ProgressInner::new(
                total_units,
                Some(Arc::clone(&self.inner)),
            )),
        }
    }

    /// 上报叶子节点的已完成量（绝对值）
    ///
    /// 超过总量的部分被截断；小于已上报值时忽略
    pub fn report(&self, completed_units: u64) {
        let total = self.total_units();
        let target = completed_units.min(total);
        let previous = self.inner.completed.fetch_max(target, Ordering::SeqCst);
        if target > previous {
            if let Some(parent) = &self.inner.parent {
                parent.add_completed(target - previous);
            }
        }
    }

    /// 标记为全部完成
    pub fn complete(&self) {
        self.report(self.total_units());
    }

    pub fn completed_units(&self) -> u64 {
        self.inner.completed.load(Ordering::SeqCst)
    }

    pub fn total_units(&self) -> u64 {
        self.inner.total.load(Ordering::SeqCst)
    }

    /// 完成比例，范围 [0, 1]
    pub fn fraction_completed(&self) -> f64 {
        let total = self.total_units();
        if total == 0 {
            return 0.0;
        }
        (self.completed_units() as f64 / total as f64).clamp(0.0, 1.0)
    }

    pub fn is_finished(&self) -> bool {
        let total = self.total_units();
        total > 0 && self.completed_units() >= total
    }
}
