// 上传状态定义
//
// 分片：Planned → Dispatched → Uploaded（失败或取消时回到 Planned）
// 文件：Registered → UploadingChunks → UploadingTerminalChunk → Done
// 会话：Idle → Running → Suspended / Completed / Failed（cancel 后为 Cancelled）

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 分片状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    /// 已规划，等待调度
    Planned,
    /// 已派发，正在上传
    Dispatched,
    /// 服务器已确认
    Uploaded,
}

/// 文件状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// 已注册，尚无分片开始上传
    Registered,
    /// 正在上传非末尾分片
    UploadingChunks,
    /// 非末尾分片全部完成，正在上传末尾分片
    UploadingTerminalChunk,
    /// 全部分片完成
    Done,
}

/// 会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// 等待中
    Idle,
    /// 上传中
    Running,
    /// 已挂起
    Suspended,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消（会话状态已丢弃）
    Cancelled,
}

impl SessionState {
    /// 是否为终态（不会再有分片上传）
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Cancelled)
    }
}

/// 文件状态快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileStatus {
    /// 注册序号
    pub index: usize,
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 远端文件 ID
    pub remote_id: String,
    /// 文件大小
    pub total_size: u64,
    /// 文件状态
    pub state: FileState,
    /// 总分片数
    pub total_chunks: usize,
    /// 已完成分片数
    pub completed_chunks: usize,
    /// 完成比例 [0, 1]
    pub fraction_completed: f64,
}

impl FileStatus {
    /// 是否全部完成
    pub fn is_done(&self) -> bool {
        self.state == FileState::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_terminal() {
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Cancelled.is_terminal());
        assert!(!SessionState::Failed.is_terminal());
        assert!(!SessionState::Suspended.is_terminal());
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&FileState::UploadingTerminalChunk).unwrap(),
            "\"uploading_terminal_chunk\""
        );
        assert_eq!(
            serde_json::to_string(&ChunkState::Dispatched).unwrap(),
            "\"dispatched\""
        );
    }
}
