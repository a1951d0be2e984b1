// 分片上传执行器
//
// 单个分片一次请求：
// - 请求体按 64KB 切片流式发送，每交给传输层一片就上报一次进度
// - 2xx 视为成功，其余最终状态码视为服务器拒绝
// - 连接级错误视为传输失败
// - 取消令牌触发时立即放弃请求，返回 Cancelled（调度器将其视为“尚未尝试”）

use crate::config::UploadConfig;
use crate::error::{Result, UploadError};
use crate::uploader::{Chunk, ProgressNode};
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 流式请求体切片大小: 64KB
pub const BODY_SLICE_SIZE: usize = 64 * 1024;

/// 单个分片的上传结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// 服务器确认接收
    Success,
    /// 服务器返回错误状态码
    ServerRejected(u16),
    /// 连接级错误
    TransportFailure(String),
    /// 上传过程中被取消
    Cancelled,
}

/// 分片上传执行器
#[async_trait]
pub trait ChunkExecutor: Send + Sync {
    /// 上传一个分片，进度上报到该分片的叶子节点
    async fn upload(
        &self,
        chunk: &Chunk,
        data: Vec<u8>,
        destination: &str,
        progress: &ProgressNode,
        cancel: &CancellationToken,
    ) -> UploadOutcome;
}

/// 基于 reqwest 的 HTTP 执行器（PUT 原始字节）
#[derive(Debug, Clone)]
pub struct HttpChunkExecutor {
    client: Client,
    slice_size: usize,
}

impl HttpChunkExecutor {
    /// 按上传配置创建 HTTP 客户端
    pub fn new(config: &UploadConfig) -> Result<Self> {
        let mut builder =
            Client::builder().connect_timeout(Duration::from_secs(config.connect_timeout_secs));
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder
            .build()
            .map_err(|e| UploadError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self::with_client(client))
    }

    /// 复用外部 HTTP 客户端
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            slice_size: BODY_SLICE_SIZE,
        }
    }

    fn streaming_body(&self, data: Vec<u8>, progress: &ProgressNode) -> Body {
        if data.is_empty() {
            return Body::from(data);
        }

        let slice_size = self.slice_size;
        let progress = progress.clone();
        let slices = futures::stream::unfold((data, 0usize), move |(data, offset)| {
            let progress = progress.clone();
            async move {
                if offset >= data.len() {
                    return None;
                }
                let end = (offset + slice_size).min(data.len());
                let slice = data[offset..end].to_vec();
                progress.report(end as u64);
                Some((Ok::<_, std::io::Error>(slice), (data, end)))
            }
        });
        Body::wrap_stream(slices)
    }
}

#[async_trait]
impl ChunkExecutor for HttpChunkExecutor {
    async fn upload(
        &self,
        chunk: &Chunk,
        data: Vec<u8>,
        destination: &str,
        progress: &ProgressNode,
        cancel: &CancellationToken,
    ) -> UploadOutcome {
        let len = data.len();
        let request = self
            .client
            .put(destination)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, len)
            .body(self.streaming_body(data, progress));

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("[分片 {}#{}] 请求已取消", chunk.id.file, chunk.index());
                return UploadOutcome::Cancelled;
            }
            response = request.send() => response,
        };

        match response {
            Ok(resp) if resp.status().is_success() => {
                progress.complete();
                UploadOutcome::Success
            }
            Ok(resp) => {
                let status = resp.status().as_u16();
                warn!(
                    "[分片 {}#{}] 服务器拒绝: HTTP {}",
                    chunk.id.file,
                    chunk.index(),
                    status
                );
                UploadOutcome::ServerRejected(status)
            }
            Err(e) => {
                warn!(
                    "[分片 {}#{}] 传输失败: {}",
                    chunk.id.file,
                    chunk.index(),
                    e
                );
                UploadOutcome::TransportFailure(e.to_string())
            }
        }
    }
}
