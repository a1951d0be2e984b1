//! 宿主生命周期信号
//!
//! 宿主（前后台切换、后台任务即将过期）通过 [`LifecycleBridge`] 广播信号，
//! 调度器订阅后在即将过期时挂起，回到前台时恢复。

use crate::uploader::{RunOutcome, SessionState, UploadScheduler};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const LIFECYCLE_CHANNEL_CAPACITY: usize = 16;

/// 生命周期信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    EnteredBackground,
    EnteredForeground,
    /// 后台执行时间即将耗尽
    TaskExpiring,
}

/// 生命周期信号源
#[derive(Debug, Clone)]
pub struct LifecycleBridge {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleBridge {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// 发布信号，返回收到信号的订阅者数量
    pub fn emit(&self, event: LifecycleEvent) -> usize {
        debug!("生命周期信号: {:?}", event);
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for LifecycleBridge {
    fn default() -> Self {
        Self::new()
    }
}

/// 生命周期观察者
///
/// 只恢复由自己挂起的会话，调用方主动挂起的会话不受前台信号影响
pub struct LifecycleObserver {
    scheduler: Arc<UploadScheduler>,
    suspended_by_lifecycle: bool,
}

impl LifecycleObserver {
    /// 启动观察任务，信号通道关闭时结束
    pub fn spawn(
        scheduler: Arc<UploadScheduler>,
        mut events: broadcast::Receiver<LifecycleEvent>,
    ) -> JoinHandle<()> {
        let mut observer = Self {
            scheduler,
            suspended_by_lifecycle: false,
        };
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => observer.handle(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("生命周期信号积压，跳过 {} 条", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("生命周期信号源已关闭，观察结束");
                        break;
                    }
                }
            }
        })
    }

    async fn handle(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::TaskExpiring => self.suspend("后台任务即将过期").await,
            LifecycleEvent::EnteredBackground
                if self.scheduler.config().suspend_on_background =>
            {
                self.suspend("进入后台").await
            }
            LifecycleEvent::EnteredBackground => {}
            LifecycleEvent::EnteredForeground => self.resume(),
        }
    }

    async fn suspend(&mut self, reason: &str) {
        if self.scheduler.state() != SessionState::Running {
            return;
        }
        match self.scheduler.suspend().await {
            Ok(()) => {
                info!("{}，已挂起上传", reason);
                self.suspended_by_lifecycle = true;
            }
            Err(e) => debug!("{}，挂起未生效: {}", reason, e),
        }
    }

    fn resume(&mut self) {
        if !std::mem::take(&mut self.suspended_by_lifecycle) {
            return;
        }

        // 在处理下一条信号之前同步切回 Running，紧随其后的 TaskExpiring 才能再次挂起
        let token = match self.scheduler.begin_resume() {
            Ok(token) => token,
            Err(e) => {
                debug!("回到前台，恢复未生效: {}", e);
                return;
            }
        };

        info!("回到前台，恢复上传");
        // 恢复的运行可能持续很久，不阻塞后续信号；结果通过状态/事件通道发布
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            match scheduler.drive(token).await {
                Ok(RunOutcome::Completed { transfer_id }) => {
                    debug!("恢复后上传完成: {}", transfer_id)
                }
                Ok(outcome) => debug!("恢复后的运行结束: {:?}", outcome),
                Err(e) => warn!("恢复上传失败: {}", e),
            }
        });
    }
}

impl UploadScheduler {
    /// 订阅生命周期信号，参见 [`LifecycleObserver`]
    pub fn observe_lifecycle(
        self: &Arc<Self>,
        events: broadcast::Receiver<LifecycleEvent>,
    ) -> JoinHandle<()> {
        LifecycleObserver::spawn(self.clone(), events)
    }
}
