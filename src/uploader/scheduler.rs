// 上传分片调度器
//
// 功能：
// - 会话级全局并发控制（信号量在所有文件间共享，而不是每个文件一个）
// - 按注册顺序派发分片，不同文件的分片可以交错
// - 末尾分片严格排在同文件其余分片全部确认之后
// - 挂起/恢复：在途分片被取消后回到待上传集合，已确认分片不会重传
// - 失败时取消其余在途分片，会话进入 Failed，可在同一实例上重新 run()
//
// 所有簿记状态由一把互斥锁串行修改，分片上传本身作为独立任务并发执行

use crate::config::UploadConfig;
use crate::error::{Result, UploadError};
use crate::uploader::{
    Chunk, ChunkExecutor, ChunkId, ChunkPlanner, ChunkReader, ChunkState, CredentialRefresher,
    FileDescriptor, FileState, FileStatus, HttpChunkExecutor, ProgressNode, ProgressThrottler,
    SessionApi, SessionState, SizingPolicy, UploadEvent, UploadFile, UploadOutcome,
    DEFAULT_PROGRESS_INTERVAL_MS,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// 默认全局最大并发分片数
pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 4;

/// 事件通道容量
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 调度器配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 整个会话同时在途的分片上限
    pub max_concurrent_chunks: usize,
    /// 分片策略
    pub sizing: SizingPolicy,
    /// 进入后台时是否挂起
    pub suspend_on_background: bool,
    /// 进度事件节流间隔（毫秒）
    pub progress_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
            sizing: SizingPolicy::default(),
            suspend_on_background: false,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
        }
    }
}

impl From<&UploadConfig> for SchedulerConfig {
    fn from(config: &UploadConfig) -> Self {
        Self {
            max_concurrent_chunks: config.max_concurrent_chunks,
            sizing: config.sizing,
            suspend_on_background: config.suspend_on_background,
            progress_interval_ms: config.progress_interval_ms,
        }
    }
}

/// 一次 run()/resume() 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// 所有文件完成，会话已结束
    Completed { transfer_id: String },
    /// 被挂起，可调用 resume() 继续
    Suspended,
    /// 被 cancel() 终止
    Cancelled,
}

/// 文件注册结果
#[derive(Debug)]
pub struct RegistrationReport {
    /// 远端会话 ID
    pub session_id: String,
    /// 注册成功的文件（按注册顺序）
    pub registered: Vec<FileStatus>,
    /// 被拒绝的文件及原因
    pub rejected: Vec<(PathBuf, UploadError)>,
}

/// 单个文件的分片簿记
struct FileEntry {
    file: UploadFile,
    pending: BTreeSet<usize>,
    dispatched: BTreeSet<usize>,
    completed: BTreeSet<usize>,
    progress: ProgressNode,
    chunk_progress: Vec<ProgressNode>,
}

impl FileEntry {
    fn new(file: UploadFile, parent: &ProgressNode) -> Self {
        let progress = parent.make_child(0);
        let chunk_progress = file
            .chunks()
            .iter()
            .map(|chunk| progress.make_child(chunk.size().max(1)))
            .collect();
        Self {
            pending: (0..file.chunk_count()).collect(),
            dispatched: BTreeSet::new(),
            completed: BTreeSet::new(),
            file,
            progress,
            chunk_progress,
        }
    }

    fn terminal_index(&self) -> usize {
        self.file.chunk_count().saturating_sub(1)
    }

    fn is_done(&self) -> bool {
        self.pending.is_empty() && self.dispatched.is_empty()
    }

    /// 下一个可派发的分片
    ///
    /// 非末尾分片优先；末尾分片只有在其余分片全部确认后才可派发
    fn next_dispatchable(&self) -> Option<usize> {
        let terminal = self.terminal_index();
        let first = *self.pending.iter().next()?;
        if first != terminal {
            return Some(first);
        }
        (self.completed.len() == terminal).then_some(terminal)
    }

    fn state(&self) -> FileState {
        if self.is_done() {
            FileState::Done
        } else if self.completed.is_empty() && self.dispatched.is_empty() {
            FileState::Registered
        } else if self.completed.len() == self.terminal_index() {
            FileState::UploadingTerminalChunk
        } else {
            FileState::UploadingChunks
        }
    }

    /// 标记分片已确认，返回文件是否因此全部完成
    fn complete_chunk(&mut self, index: usize) -> bool {
        self.completed.insert(index);
        if let Some(node) = self.chunk_progress.get(index) {
            node.complete();
        }
        self.is_done()
    }

    fn chunk_state(&self, index: usize) -> Option<ChunkState> {
        if self.completed.contains(&index) {
            Some(ChunkState::Uploaded)
        } else if self.dispatched.contains(&index) {
            Some(ChunkState::Dispatched)
        } else if self.pending.contains(&index) {
            Some(ChunkState::Planned)
        } else {
            None
        }
    }

    fn status(&self, index: usize) -> FileStatus {
        FileStatus {
            index,
            local_path: self.file.local_path.clone(),
            remote_id: self.file.remote_id.clone(),
            total_size: self.file.total_size,
            state: self.state(),
            total_chunks: self.file.chunk_count(),
            completed_chunks: self.completed.len(),
            fraction_completed: self.progress.fraction_completed(),
        }
    }
}

/// 会话簿记（仅在锁内修改）
struct SchedulerState {
    status: SessionState,
    session_id: Option<String>,
    files: Vec<FileEntry>,
    transfer_id: Option<String>,
    /// 是否已经调用过 register_files
    registered: bool,
    /// 当前运行是否仍有任务未收尾
    run_active: bool,
    /// 当前运行的取消令牌
    run_token: Option<CancellationToken>,
    /// 运行代数，每次 run()/resume() 加一，用于识别上一次运行遗留的任务
    generation: u64,
    /// 本次运行的第一个失败
    failure: Option<UploadError>,
    /// 正在调用 finish_session
    finalizing: bool,
}

impl SchedulerState {
    /// 记录运行失败并取消本次运行，只保留第一个错误
    fn fail_run(&mut self, e: UploadError) {
        if self.failure.is_some() {
            debug!("忽略后续错误: {}", e);
            return;
        }
        error!("上传运行失败，取消其余分片: {}", e);
        self.failure = Some(e);
        if let Some(token) = &self.run_token {
            token.cancel();
        }
    }

    /// 把已派发但未确认的分片退回待上传集合
    fn requeue_dispatched(&mut self) {
        for entry in self.files.iter_mut() {
            let stale = std::mem::take(&mut entry.dispatched);
            entry.pending.extend(stale);
        }
    }
}

/// 调度器与分片任务共享的部分
struct Shared {
    api: Arc<dyn SessionApi>,
    executor: Arc<dyn ChunkExecutor>,
    state: Mutex<SchedulerState>,
    progress: ProgressNode,
    state_tx: watch::Sender<SessionState>,
    event_tx: broadcast::Sender<UploadEvent>,
    throttler: ProgressThrottler,
    /// 运行收尾时通知等待者
    drained: Notify,
}

impl Shared {
    fn set_status(&self, state: &mut SchedulerState, new_state: SessionState) {
        let old_state = std::mem::replace(&mut state.status, new_state);
        if old_state == new_state {
            return;
        }
        info!("上传会话状态变更: {:?} -> {:?}", old_state, new_state);
        self.state_tx.send_replace(new_state);
        let _ = self.event_tx.send(UploadEvent::StateChanged {
            old_state,
            new_state,
        });
    }

    fn publish_progress(&self, force: bool) {
        let emit = if force {
            self.throttler.force_emit()
        } else {
            self.throttler.should_emit()
        };
        if emit {
            let _ = self.event_tx.send(UploadEvent::Progress {
                completed_units: self.progress.completed_units(),
                total_units: self.progress.total_units(),
                fraction: self.progress.fraction_completed(),
            });
        }
    }

    fn emit_file_completed(&self, file_index: usize, entry: &FileEntry) {
        info!(
            "文件上传完成: {:?} ({} 个分片)",
            entry.file.local_path,
            entry.file.chunk_count()
        );
        let _ = self.event_tx.send(UploadEvent::FileCompleted {
            file_index,
            remote_id: entry.file.remote_id.clone(),
        });
    }

    /// 记录分片任务结果
    ///
    /// 只有执行器确认成功的分片才进入已完成集合，取消和失败的分片都回到待上传集合。
    /// 失败会立即取消本次运行，调度循环不会再派发新分片
    fn settle_chunk(&self, id: ChunkId, generation: u64, result: Result<()>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let current = state.generation == generation;
        let Some(entry) = state.files.get_mut(id.file) else {
            // cancel() 已丢弃会话状态
            return;
        };

        if !current {
            // 上一次运行遗留的任务：只接收仍待上传分片的成功结果
            if result.is_ok() && entry.pending.remove(&id.index) {
                debug!("[分片 {}#{}] 遗留任务上传完成", id.file, id.index);
                if entry.complete_chunk(id.index) {
                    self.emit_file_completed(id.file, entry);
                }
            }
            return;
        }

        entry.dispatched.remove(&id.index);
        match result {
            Ok(()) => {
                debug!("[分片 {}#{}] 上传完成", id.file, id.index);
                if entry.complete_chunk(id.index) {
                    self.emit_file_completed(id.file, entry);
                }
                drop(guard);
                self.publish_progress(false);
            }
            Err(UploadError::Cancelled) => {
                entry.pending.insert(id.index);
                debug!("[分片 {}#{}] 已取消，退回待上传", id.file, id.index);
            }
            Err(e) => {
                entry.pending.insert(id.index);
                warn!("[分片 {}#{}] 上传失败: {}", id.file, id.index, e);
                state.fail_run(e);
            }
        }
    }

    /// 收割分片任务，任务 panic 视为运行失败
    fn reap(&self, joined: std::result::Result<(), JoinError>) {
        if let Err(e) = joined {
            self.state
                .lock()
                .fail_run(UploadError::InvalidState(format!("chunk task panicked: {}", e)));
        }
    }
}

/// 运行收尾守卫
///
/// drive() 正常返回或其 future 被调用方丢弃时都会执行：取消本次运行，
/// 退回未确认分片，仍处于 Running 的会话转为 Suspended，并唤醒等待收尾的调用
struct RunGuard<'a> {
    shared: &'a Shared,
    token: CancellationToken,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.token.cancel();
        let mut state = self.shared.state.lock();
        state.requeue_dispatched();
        if state.status == SessionState::Running {
            warn!("上传运行被中途丢弃，会话转为挂起");
            self.shared.set_status(&mut state, SessionState::Suspended);
        }
        state.finalizing = false;
        state.run_active = false;
        drop(state);
        self.shared.drained.notify_waiters();
    }
}

/// 派发给分片任务的工作单元
struct ChunkJob {
    chunk: Chunk,
    local_path: PathBuf,
    session_id: String,
    remote_id: String,
    progress: ProgressNode,
    generation: u64,
}

/// 上传分片调度器
pub struct UploadScheduler {
    shared: Arc<Shared>,
    planner: ChunkPlanner,
    config: SchedulerConfig,
    /// 全局分片并发许可
    semaphore: Arc<Semaphore>,
}

impl UploadScheduler {
    /// 创建调度器
    pub fn new(
        api: Arc<dyn SessionApi>,
        executor: Arc<dyn ChunkExecutor>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        if config.max_concurrent_chunks == 0 {
            return Err(UploadError::Config(
                "max_concurrent_chunks must be at least 1".to_string(),
            ));
        }
        let planner = ChunkPlanner::new(config.sizing)?;
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            "创建上传调度器: 全局并发={}, 目标分片数={}",
            config.max_concurrent_chunks, config.sizing.target_chunk_count
        );

        Ok(Self {
            shared: Arc::new(Shared {
                api,
                executor,
                state: Mutex::new(SchedulerState {
                    status: SessionState::Idle,
                    session_id: None,
                    files: Vec::new(),
                    transfer_id: None,
                    registered: false,
                    run_active: false,
                    run_token: None,
                    generation: 0,
                    failure: None,
                    finalizing: false,
                }),
                progress: ProgressNode::new(0),
                state_tx,
                event_tx,
                throttler: ProgressThrottler::with_millis(config.progress_interval_ms),
                drained: Notify::new(),
            }),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_chunks)),
            planner,
            config,
        })
    }

    /// 按上传配置创建使用 HTTP 执行器的调度器
    pub fn with_http(api: Arc<dyn SessionApi>, config: &UploadConfig) -> Result<Self> {
        let executor = Arc::new(HttpChunkExecutor::new(config)?);
        Self::new(api, executor, SchedulerConfig::from(config))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// 注册待上传文件并向远端登记会话
    ///
    /// 每个会话只能调用一次。无法读取元数据的文件被拒绝并记录在报告中，
    /// 不影响其他文件；没有任何文件可注册时返回 `EmptySession`
    pub async fn register_files(&self, paths: Vec<PathBuf>) -> Result<RegistrationReport> {
        {
            let mut state = self.shared.state.lock();
            if state.registered || state.status != SessionState::Idle {
                return Err(UploadError::InvalidState(
                    "files can only be registered once, before run()".to_string(),
                ));
            }
            state.registered = true;
        }

        let result = self.register_inner(paths).await;
        if result.is_err() {
            self.shared.state.lock().registered = false;
        }
        result
    }

    async fn register_inner(&self, paths: Vec<PathBuf>) -> Result<RegistrationReport> {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for path in paths {
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => {
                    warn!("跳过非普通文件: {:?}", path);
                    let source = std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "not a regular file",
                    );
                    rejected.push((path.clone(), UploadError::FileUnavailable { path, source }));
                    continue;
                }
                Err(source) => {
                    warn!("无法读取文件元数据: {:?}, 错误: {}", path, source);
                    rejected.push((path.clone(), UploadError::FileUnavailable { path, source }));
                    continue;
                }
            };

            let size = metadata.len();
            let ranges = self.planner.plan(size);
            debug!("文件分片规划: {:?}, 大小={}, 分片数={}", path, size, ranges.len());
            accepted.push((path, size, ranges));
        }

        if accepted.is_empty() {
            return Err(UploadError::EmptySession);
        }

        let descriptors: Vec<FileDescriptor> = accepted
            .iter()
            .map(|(path, size, _)| FileDescriptor {
                local_path: path.clone(),
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                size: *size,
            })
            .collect();

        let handle = self
            .shared
            .api
            .begin_session(&descriptors)
            .await
            .map_err(|e| e.into_upload_error(UploadError::Session))?;

        if handle.file_ids.len() != accepted.len() {
            return Err(UploadError::Session(format!(
                "begin_session returned {} file ids for {} files",
                handle.file_ids.len(),
                accepted.len()
            )));
        }

        let mut state = self.shared.state.lock();
        let entries: Vec<FileEntry> = accepted
            .into_iter()
            .zip(handle.file_ids)
            .enumerate()
            .map(|(index, ((path, size, ranges), remote_id))| {
                let file = UploadFile::new(index, path, remote_id, size, ranges);
                FileEntry::new(file, &self.shared.progress)
            })
            .collect();

        let registered = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| entry.status(index))
            .collect();

        info!(
            "上传会话已登记: session_id={}, 文件数={}, 拒绝={}, 总分片数={}",
            handle.session_id,
            entries.len(),
            rejected.len(),
            entries.iter().map(|e| e.file.chunk_count()).sum::<usize>()
        );

        state.files = entries;
        state.session_id = Some(handle.session_id.clone());

        Ok(RegistrationReport {
            session_id: handle.session_id,
            registered,
            rejected,
        })
    }

    /// 上传所有未确认的分片
    ///
    /// 可从 Idle 或 Failed 调用；会话已完成时直接返回保存的传输 ID
    pub async fn run(&self) -> Result<RunOutcome> {
        let token = {
            let mut state = self.shared.state.lock();
            match state.status {
                SessionState::Idle | SessionState::Failed => {}
                SessionState::Completed => {
                    if let Some(transfer_id) = state.transfer_id.clone() {
                        return Ok(RunOutcome::Completed { transfer_id });
                    }
                }
                SessionState::Running => {
                    return Err(UploadError::InvalidState("session is already running".into()))
                }
                SessionState::Suspended => {
                    return Err(UploadError::InvalidState(
                        "session is suspended, use resume()".into(),
                    ))
                }
                SessionState::Cancelled => {
                    return Err(UploadError::InvalidState("session was cancelled".into()))
                }
            }
            self.start_run(&mut state)?
        };
        self.drive(token).await
    }

    /// 从挂起状态继续，只派发仍在待上传集合中的分片
    pub async fn resume(&self) -> Result<RunOutcome> {
        let token = self.begin_resume()?;
        self.drive(token).await
    }

    /// 同步地把挂起的会话切回 Running，返回的令牌交给 drive()
    pub(crate) fn begin_resume(&self) -> Result<CancellationToken> {
        let mut state = self.shared.state.lock();
        if state.status != SessionState::Suspended {
            return Err(UploadError::InvalidState(format!(
                "resume() requires a suspended session, current state is {:?}",
                state.status
            )));
        }
        self.start_run(&mut state)
    }

    /// 运行，凭证过期时刷新后重试（最多 `max_refreshes` 次），已确认进度保留
    pub async fn run_with_reauth(
        &self,
        refresher: &dyn CredentialRefresher,
        max_refreshes: u32,
    ) -> Result<RunOutcome> {
        let mut refreshes = 0;
        loop {
            match self.run().await {
                Err(e) if e.is_auth_expired() && refreshes < max_refreshes => {
                    refreshes += 1;
                    warn!("凭证已过期，刷新后重试 ({}/{})", refreshes, max_refreshes);
                    refresher.refresh().await.map_err(|e| {
                        UploadError::AuthenticationExpired(format!("credential refresh failed: {:#}", e))
                    })?;
                }
                other => return other,
            }
        }
    }

    /// 挂起：取消所有在途分片并等待它们退回待上传集合
    pub async fn suspend(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.status != SessionState::Running {
                return Err(UploadError::InvalidState(format!(
                    "suspend() requires a running session, current state is {:?}",
                    state.status
                )));
            }
            if state.finalizing {
                return Err(UploadError::InvalidState(
                    "session is finishing and can no longer be suspended".into(),
                ));
            }
            self.shared.set_status(&mut state, SessionState::Suspended);
            if let Some(token) = &state.run_token {
                token.cancel();
            }
        }
        self.wait_drained().await;
        info!("上传会话已挂起");
        Ok(())
    }

    /// 终止会话：停止在途分片并丢弃全部会话状态
    pub async fn cancel(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.status == SessionState::Cancelled {
                return;
            }
            self.shared.set_status(&mut state, SessionState::Cancelled);
            if let Some(token) = &state.run_token {
                token.cancel();
            }
        }
        self.wait_drained().await;

        let mut state = self.shared.state.lock();
        state.files.clear();
        state.session_id = None;
        state.transfer_id = None;
        state.run_token = None;
        info!("上传会话已取消，状态已丢弃");
    }

    /// 当前会话状态
    pub fn state(&self) -> SessionState {
        self.shared.state.lock().status
    }

    /// 订阅会话状态变化
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// 订阅会话事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.shared.event_tx.subscribe()
    }

    /// 会话根进度节点
    pub fn progress(&self) -> ProgressNode {
        self.shared.progress.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.state.lock().session_id.clone()
    }

    pub fn transfer_id(&self) -> Option<String> {
        self.shared.state.lock().transfer_id.clone()
    }

    /// 所有文件的状态快照
    pub fn file_statuses(&self) -> Vec<FileStatus> {
        let state = self.shared.state.lock();
        state
            .files
            .iter()
            .enumerate()
            .map(|(index, entry)| entry.status(index))
            .collect()
    }

    /// 单个分片的状态
    pub fn chunk_state(&self, id: ChunkId) -> Option<ChunkState> {
        let state = self.shared.state.lock();
        state.files.get(id.file)?.chunk_state(id.index)
    }

    fn start_run(&self, state: &mut SchedulerState) -> Result<CancellationToken> {
        if state.session_id.is_none() {
            return Err(UploadError::InvalidState(
                "no files registered, call register_files() first".into(),
            ));
        }
        if state.run_active {
            return Err(UploadError::InvalidState(
                "previous run is still shutting down".into(),
            ));
        }

        state.requeue_dispatched();

        let token = CancellationToken::new();
        state.run_token = Some(token.clone());
        state.generation += 1;
        state.failure = None;
        state.finalizing = false;
        state.run_active = true;
        self.shared.set_status(state, SessionState::Running);
        Ok(token)
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.shared.drained.notified();
            if !self.shared.state.lock().run_active {
                return;
            }
            notified.await;
        }
    }

    /// 驱动一次运行直到完成、挂起、取消或失败
    pub(crate) async fn drive(&self, token: CancellationToken) -> Result<RunOutcome> {
        let _guard = RunGuard {
            shared: &self.shared,
            token: token.clone(),
        };
        let run_id = Uuid::new_v4();
        let span = info_span!("upload_run", %run_id);
        self.drive_inner(token).instrument(span).await
    }

    async fn drive_inner(&self, token: CancellationToken) -> Result<RunOutcome> {
        info!("开始上传: 全局并发={}", self.config.max_concurrent_chunks);

        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        self.shared
                            .state
                            .lock()
                            .fail_run(UploadError::InvalidState("worker pool closed".into()));
                        break;
                    }
                },
            };

            while let Some(joined) = tasks.try_join_next() {
                self.shared.reap(joined);
            }

            // 失败、挂起、取消都会先取消令牌，claim_next_chunk 在锁内检查令牌
            match self.claim_next_chunk() {
                Some(job) => {
                    let shared = self.shared.clone();
                    tasks.spawn(run_chunk(shared, job, token.clone(), permit));
                }
                None => {
                    drop(permit);
                    if token.is_cancelled() {
                        break;
                    }
                    // 暂无可派发分片，等一个在途分片结束（可能解锁某个末尾分片）
                    match tasks.join_next().await {
                        Some(joined) => self.shared.reap(joined),
                        None => break,
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            self.shared.reap(joined);
        }

        self.conclude().await
    }

    /// 挑选下一个可派发分片并标记为已派发
    fn claim_next_chunk(&self) -> Option<ChunkJob> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if state
            .run_token
            .as_ref()
            .map_or(true, CancellationToken::is_cancelled)
        {
            return None;
        }
        let session_id = state.session_id.clone()?;
        let generation = state.generation;

        for entry in state.files.iter_mut() {
            if let Some(index) = entry.next_dispatchable() {
                entry.pending.remove(&index);
                entry.dispatched.insert(index);
                let chunk = entry.file.chunks()[index].clone();
                debug!(
                    "[分片 {}#{}] 派发: range={:?}, 末尾={}",
                    chunk.id.file, index, chunk.range, chunk.is_last
                );
                return Some(ChunkJob {
                    local_path: entry.file.local_path.clone(),
                    remote_id: entry.file.remote_id.clone(),
                    progress: entry.chunk_progress[index].clone(),
                    session_id,
                    chunk,
                    generation,
                });
            }
        }
        None
    }

    async fn conclude(&self) -> Result<RunOutcome> {
        let session_id = {
            let mut state = self.shared.state.lock();
            let failure = state.failure.take();
            match state.status {
                SessionState::Cancelled => return Ok(RunOutcome::Cancelled),
                SessionState::Suspended => {
                    let completed: usize = state.files.iter().map(|f| f.completed.len()).sum();
                    info!("上传已挂起，已确认分片数={}", completed);
                    return Ok(RunOutcome::Suspended);
                }
                _ => {}
            }

            if let Some(e) = failure {
                self.shared.set_status(&mut state, SessionState::Failed);
                let _ = self.shared.event_tx.send(UploadEvent::Failed {
                    error: e.to_string(),
                });
                return Err(e);
            }

            if !state.files.iter().all(FileEntry::is_done) {
                let e = UploadError::InvalidState("run ended with chunks still pending".into());
                self.shared.set_status(&mut state, SessionState::Failed);
                return Err(e);
            }

            state.finalizing = true;
            state.session_id.clone().unwrap_or_default()
        };

        let finished = self.shared.api.finish_session(&session_id).await;

        let mut state = self.shared.state.lock();
        state.finalizing = false;
        if state.status == SessionState::Cancelled {
            info!("结束会话期间会话被取消，丢弃结果");
            return Ok(RunOutcome::Cancelled);
        }

        match finished {
            Ok(transfer_id) => {
                state.transfer_id = Some(transfer_id.clone());
                self.shared.set_status(&mut state, SessionState::Completed);
                drop(state);

                self.shared.publish_progress(true);
                let _ = self.shared.event_tx.send(UploadEvent::Completed {
                    transfer_id: transfer_id.clone(),
                });
                info!("上传会话完成: transfer_id={}", transfer_id);
                Ok(RunOutcome::Completed { transfer_id })
            }
            Err(e) => {
                let e = e.into_upload_error(UploadError::Session);
                error!("结束会话失败: {}", e);
                self.shared.set_status(&mut state, SessionState::Failed);
                let _ = self.shared.event_tx.send(UploadEvent::Failed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

/// 分片任务：持有一个全局许可直到结束
async fn run_chunk(
    shared: Arc<Shared>,
    job: ChunkJob,
    token: CancellationToken,
    permit: OwnedSemaphorePermit,
) {
    let _permit = permit;
    let result = upload_chunk(&shared, &job, &token).await;
    shared.settle_chunk(job.chunk.id, job.generation, result);
}

/// 解析上传地址并读取分片数据
async fn prepare_chunk(shared: &Shared, job: &ChunkJob) -> Result<(String, Vec<u8>)> {
    let destination = shared
        .api
        .chunk_destination(
            &job.session_id,
            &job.remote_id,
            job.chunk.index(),
            job.chunk.is_last,
        )
        .await
        .map_err(|e| e.into_upload_error(UploadError::Session))?;

    let reader = ChunkReader::open(&job.local_path).await?;
    let data = reader.read(job.chunk.range.clone()).await?;
    Ok((destination, data))
}

async fn upload_chunk(shared: &Shared, job: &ChunkJob, token: &CancellationToken) -> Result<()> {
    let (destination, data) = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(UploadError::Cancelled),
        prepared = prepare_chunk(shared, job) => prepared?,
    };

    // 执行器自行响应取消令牌并返回 Cancelled
    match shared
        .executor
        .upload(&job.chunk, data, &destination, &job.progress, token)
        .await
    {
        UploadOutcome::Success => Ok(()),
        UploadOutcome::ServerRejected(status) => Err(UploadError::ServerRejected { status }),
        UploadOutcome::TransportFailure(cause) => Err(UploadError::Transport(cause)),
        UploadOutcome::Cancelled => Err(UploadError::Cancelled),
    }
}
