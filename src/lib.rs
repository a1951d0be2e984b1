// Chunked Upload Library
// 可挂起/恢复的多文件分片上传引擎

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::{AppConfig, LogConfig, UploadConfig};
pub use error::{ErrorKind, Result, UploadError};
pub use logging::{init_logging, LogGuard};
pub use uploader::{
    Chunk, ChunkExecutor, ChunkId, ChunkPlanner, ChunkReader, ChunkState, CredentialRefresher,
    FileDescriptor, FileState, FileStatus, HttpChunkExecutor, LifecycleBridge, LifecycleEvent,
    ProgressNode, RegistrationReport, RunOutcome, SchedulerConfig, SessionApi, SessionApiError,
    SessionHandle, SessionState, SizingPolicy, UploadEvent, UploadOutcome, UploadScheduler,
};
