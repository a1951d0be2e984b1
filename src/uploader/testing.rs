//! 调度器测试用的协作方替身

use crate::uploader::{
    Chunk, ChunkExecutor, ChunkId, FileDescriptor, ProgressNode, SessionApi, SessionApiError,
    SessionHandle, SizingPolicy, UploadOutcome,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// 100 字节一片的小策略，450 字节文件切成 5 片
pub fn small_policy() -> SizingPolicy {
    SizingPolicy {
        min_chunk_size: 100,
        max_chunk_size_client: 100,
        max_chunk_size_server: 100,
        target_chunk_count: 1000,
        max_total_chunks: 10_000,
        min_total_chunks: 1,
    }
}

/// 在临时目录中创建指定大小的文件
pub fn write_file(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

#[derive(Default)]
pub struct FakeSessionApi {
    pub begin_calls: AtomicUsize,
    pub finish_calls: AtomicUsize,
    pub destination_calls: AtomicUsize,
    /// 剩余多少次 chunk_destination 返回凭证过期
    pub auth_failures: AtomicU32,
    pub registered: Mutex<Vec<FileDescriptor>>,
    /// finish_session 返回前的延迟
    pub finish_delay: Duration,
}

impl FakeSessionApi {
    pub fn with_auth_failures(count: u32) -> Self {
        let api = Self::default();
        api.auth_failures.store(count, Ordering::SeqCst);
        api
    }

    pub fn with_finish_delay(delay: Duration) -> Self {
        Self {
            finish_delay: delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl SessionApi for FakeSessionApi {
    async fn begin_session(
        &self,
        files: &[FileDescriptor],
    ) -> Result<SessionHandle, SessionApiError> {
        self.begin_calls.fetch_add(1, Ordering::SeqCst);
        self.registered.lock().extend_from_slice(files);
        Ok(SessionHandle {
            session_id: "session-1".to_string(),
            file_ids: (0..files.len()).map(|i| format!("file-{}", i)).collect(),
        })
    }

    async fn chunk_destination(
        &self,
        session_id: &str,
        file_remote_id: &str,
        chunk_index: usize,
        is_last_chunk: bool,
    ) -> Result<String, SessionApiError> {
        self.destination_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.auth_failures.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .auth_failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(SessionApiError::AuthenticationExpired(
                "attestation token expired".to_string(),
            ));
        }
        Ok(format!(
            "mock://{}/{}/{}?last={}",
            session_id, file_remote_id, chunk_index, is_last_chunk
        ))
    }

    async fn finish_session(&self, session_id: &str) -> Result<String, SessionApiError> {
        self.finish_calls.fetch_add(1, Ordering::SeqCst);
        if !self.finish_delay.is_zero() {
            tokio::time::sleep(self.finish_delay).await;
        }
        Ok(format!("transfer-of-{}", session_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Started,
    Succeeded,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub id: ChunkId,
    pub is_last: bool,
    pub kind: LogKind,
}

/// 记录派发顺序和并发峰值的执行器
pub struct FakeExecutor {
    pub log: Mutex<Vec<LogEntry>>,
    in_flight: AtomicUsize,
    pub peak: AtomicUsize,
    delay: Duration,
    /// 设置后每个分片需要拿到一个许可才能完成
    gate: Option<Semaphore>,
    /// 对这些分片返回 ServerRejected
    reject: Mutex<HashMap<ChunkId, u16>>,
}

impl FakeExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay,
            gate: None,
            reject: Mutex::new(HashMap::new()),
        }
    }

    pub fn gated() -> Self {
        let mut executor = Self::new(Duration::ZERO);
        executor.gate = Some(Semaphore::new(0));
        executor
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn reject(&self, id: ChunkId, status: u16) {
        self.reject.lock().insert(id, status);
    }

    pub fn clear_rejections(&self) {
        self.reject.lock().clear();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.log.lock().clone()
    }

    pub fn count(&self, kind: LogKind) -> usize {
        self.log.lock().iter().filter(|e| e.kind == kind).count()
    }

    fn record(&self, chunk: &Chunk, kind: LogKind) {
        self.log.lock().push(LogEntry {
            id: chunk.id,
            is_last: chunk.is_last,
            kind,
        });
    }

    async fn wait_turn(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }
}

#[async_trait]
impl ChunkExecutor for FakeExecutor {
    async fn upload(
        &self,
        chunk: &Chunk,
        data: Vec<u8>,
        _destination: &str,
        progress: &ProgressNode,
        cancel: &CancellationToken,
    ) -> UploadOutcome {
        assert_eq!(data.len() as u64, chunk.size());
        self.record(chunk, LogKind::Started);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        progress.report(chunk.size() / 2);

        // 被拒绝的分片立即返回，不等待放行
        let rejected = self.reject.lock().get(&chunk.id).copied();
        let outcome = match rejected {
            Some(status) => UploadOutcome::ServerRejected(status),
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => UploadOutcome::Cancelled,
                _ = self.wait_turn() => UploadOutcome::Success,
            },
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match &outcome {
            UploadOutcome::Success => {
                progress.complete();
                self.record(chunk, LogKind::Succeeded);
            }
            UploadOutcome::Cancelled => self.record(chunk, LogKind::Cancelled),
            _ => self.record(chunk, LogKind::Rejected),
        }
        outcome
    }
}

/// 断言每个文件的末尾分片都在其余分片全部成功之后才开始上传
pub fn assert_terminal_ordering(entries: &[LogEntry]) {
    for (pos, entry) in entries.iter().enumerate() {
        if entry.kind != LogKind::Started || !entry.is_last {
            continue;
        }
        let terminal = entry.id;
        for body_index in 0..terminal.index {
            let succeeded_before = entries[..pos].iter().any(|e| {
                e.kind == LogKind::Succeeded
                    && e.id
                        == ChunkId {
                            file: terminal.file,
                            index: body_index,
                        }
            });
            assert!(
                succeeded_before,
                "terminal chunk {:?} started before chunk {} succeeded",
                terminal, body_index
            );
        }
        // 末尾分片开始时同文件不应有其他分片在途
        let others_in_flight = entries[..pos].iter().filter(|e| {
            e.id.file == terminal.file && e.id != terminal && e.kind == LogKind::Started
        });
        for started in others_in_flight {
            assert!(entries[..pos]
                .iter()
                .any(|e| e.id == started.id && e.kind != LogKind::Started));
        }
    }
}

/// 轮询等待条件成立
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
