// 上传引擎错误类型
//
// 错误分类：
// - Planning：分片策略或文件元数据非法
// - FileAccess：文件被移动/删除/不可读
// - Transport：网络连接失败或服务器返回非 2xx
// - Cancelled：协作式取消（挂起时产生，不对外暴露为失败）
// - AuthenticationExpired：凭证过期，调用方刷新后可重新 run()

use std::path::PathBuf;

/// 上传引擎统一错误
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid sizing policy: {0}")]
    InvalidPolicy(String),

    #[error("file unavailable: {path:?}: {source}")]
    FileUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("range {start}..{end} out of bounds for {path:?} (length {len})")]
    RangeOutOfBounds {
        path: PathBuf,
        start: u64,
        end: u64,
        len: u64,
    },

    #[error("server rejected chunk upload: HTTP {status}")]
    ServerRejected { status: u16 },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("cancelled")]
    Cancelled,

    #[error("authentication expired: {0}")]
    AuthenticationExpired(String),

    #[error("session collaborator failed: {0}")]
    Session(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("no file could be registered for upload")]
    EmptySession,

    #[error("configuration error: {0}")]
    Config(String),
}

/// 错误大类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Planning,
    FileAccess,
    Transport,
    Cancelled,
    AuthenticationExpired,
    Session,
    State,
}

impl UploadError {
    /// 错误所属大类
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::InvalidPolicy(_) | UploadError::Config(_) => ErrorKind::Planning,
            UploadError::FileUnavailable { .. } | UploadError::RangeOutOfBounds { .. } => {
                ErrorKind::FileAccess
            }
            UploadError::ServerRejected { .. } | UploadError::Transport(_) => ErrorKind::Transport,
            UploadError::Cancelled => ErrorKind::Cancelled,
            UploadError::AuthenticationExpired(_) => ErrorKind::AuthenticationExpired,
            UploadError::Session(_) => ErrorKind::Session,
            UploadError::InvalidState(_) | UploadError::EmptySession => ErrorKind::State,
        }
    }

    /// 是否为凭证过期（调用方刷新凭证后可直接重新 run）
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, UploadError::AuthenticationExpired(_))
    }
}

pub type Result<T, E = UploadError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            UploadError::InvalidPolicy("x".into()).kind(),
            ErrorKind::Planning
        );
        assert_eq!(
            UploadError::RangeOutOfBounds {
                path: PathBuf::from("/tmp/a"),
                start: 0,
                end: 10,
                len: 5,
            }
            .kind(),
            ErrorKind::FileAccess
        );
        assert_eq!(
            UploadError::ServerRejected { status: 503 }.kind(),
            ErrorKind::Transport
        );
        assert_eq!(UploadError::Cancelled.kind(), ErrorKind::Cancelled);
        assert!(UploadError::AuthenticationExpired("token".into()).is_auth_expired());
        assert!(!UploadError::Transport("reset".into()).is_auth_expired());
    }

    #[test]
    fn test_error_display() {
        let err = UploadError::ServerRejected { status: 413 };
        assert_eq!(err.to_string(), "server rejected chunk upload: HTTP 413");
    }
}
