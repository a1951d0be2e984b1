// 分片上传引擎模块
//
// - chunk：分片规划（按策略把文件切成连续、不重叠的字节区间）
// - reader：按需读取单个分片，不加载整个文件
// - progress：分层进度树（分片 → 文件 → 会话）
// - executor：单个分片的网络传输
// - scheduler：全局调度器（会话级并发上限、末尾分片排序、挂起/恢复）
// - lifecycle：宿主前后台/过期信号
// - session：远端会话协作接口

pub mod chunk;
pub mod events;
pub mod executor;
pub mod lifecycle;
pub mod progress;
pub mod reader;
pub mod scheduler;
pub mod session;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use chunk::{
    Chunk, ChunkId, ChunkPlanner, SizingPolicy, UploadFile, DEFAULT_MAX_CHUNK_SIZE_CLIENT,
    DEFAULT_MAX_CHUNK_SIZE_SERVER, DEFAULT_MAX_TOTAL_CHUNKS, DEFAULT_MIN_CHUNK_SIZE,
    DEFAULT_MIN_TOTAL_CHUNKS, DEFAULT_TARGET_CHUNK_COUNT,
};
pub use events::{ProgressThrottler, UploadEvent, DEFAULT_PROGRESS_INTERVAL_MS};
pub use executor::{ChunkExecutor, HttpChunkExecutor, UploadOutcome, BODY_SLICE_SIZE};
pub use lifecycle::{LifecycleBridge, LifecycleEvent, LifecycleObserver};
pub use progress::ProgressNode;
pub use reader::ChunkReader;
pub use scheduler::{
    RegistrationReport, RunOutcome, SchedulerConfig, UploadScheduler,
    DEFAULT_MAX_CONCURRENT_CHUNKS,
};
pub use session::{
    CredentialRefresher, FileDescriptor, SessionApi, SessionApiError, SessionHandle,
};
pub use task::{ChunkState, FileState, FileStatus, SessionState};
