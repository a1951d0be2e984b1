//! 远端会话协作接口
//!
//! 上传引擎只依赖这三个操作，会话的创建/结束、分片上传地址的获取由外部实现：
//! - `begin_session`：分片开始前向远端登记本次传输，获得会话 ID 和每个文件的远端 ID
//! - `chunk_destination`：解析单个分片的上传地址（可能因凭证过期失败）
//! - `finish_session`：所有文件完成后调用一次，返回调用方可见的传输 ID

use crate::error::UploadError;
use async_trait::async_trait;
use std::path::PathBuf;

/// 注册到会话的文件描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub local_path: PathBuf,
    /// 文件名（不含目录）
    pub name: String,
    pub size: u64,
}

/// `begin_session` 的返回值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: String,
    /// 与传入文件一一对应的远端文件 ID
    pub file_ids: Vec<String>,
}

/// 协作方错误
#[derive(Debug, thiserror::Error)]
pub enum SessionApiError {
    /// 凭证（如 attestation token）过期，调用方刷新后可重试
    #[error("authentication expired: {0}")]
    AuthenticationExpired(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SessionApiError {
    /// 转换为引擎错误，非凭证类错误归入 `fallback`
    pub(crate) fn into_upload_error(self, fallback: fn(String) -> UploadError) -> UploadError {
        match self {
            SessionApiError::AuthenticationExpired(msg) => UploadError::AuthenticationExpired(msg),
            SessionApiError::Other(e) => fallback(format!("{:#}", e)),
        }
    }
}

/// 远端会话生命周期操作
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn begin_session(&self, files: &[FileDescriptor])
        -> Result<SessionHandle, SessionApiError>;

    async fn chunk_destination(
        &self,
        session_id: &str,
        file_remote_id: &str,
        chunk_index: usize,
        is_last_chunk: bool,
    ) -> Result<String, SessionApiError>;

    async fn finish_session(&self, session_id: &str) -> Result<String, SessionApiError>;
}

/// 凭证刷新（用于 `AuthenticationExpired` 后透明重试）
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self) -> anyhow::Result<()>;
}
