// 上传分片规划
//
// 分片规则：
// - 分片大小尽量使分片数量接近 target_chunk_count
// - 分片大小限制在 [min_chunk_size, min(max_chunk_size_client, max_chunk_size_server)]
// - 分片总数限制在 [min_total_chunks, max_total_chunks]（数量约束优先于大小约束）
// - 最后一个分片吸收余数，所有分片首尾相接恰好覆盖 [0, file_len)
// - 空文件规划为一个长度为 0 的末尾分片

use crate::error::{Result, UploadError};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::PathBuf;
use tracing::debug;

const MIB: u64 = 1024 * 1024;

/// 默认最小分片大小: 50MB
pub const DEFAULT_MIN_CHUNK_SIZE: u64 = 50 * MIB;

/// 默认客户端分片上限: 50MB
pub const DEFAULT_MAX_CHUNK_SIZE_CLIENT: u64 = 50 * MIB;

/// 默认服务端分片上限: 50MB
pub const DEFAULT_MAX_CHUNK_SIZE_SERVER: u64 = 50 * MIB;

/// 默认目标分片数
pub const DEFAULT_TARGET_CHUNK_COUNT: u64 = 200;

/// 默认分片总数上限
pub const DEFAULT_MAX_TOTAL_CHUNKS: u64 = 10_000;

/// 默认分片总数下限
pub const DEFAULT_MIN_TOTAL_CHUNKS: u64 = 1;

/// 分片大小策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingPolicy {
    /// 最小分片大小（字节）
    pub min_chunk_size: u64,
    /// 客户端允许的最大分片大小（字节）
    pub max_chunk_size_client: u64,
    /// 服务端允许的最大分片大小（字节）
    pub max_chunk_size_server: u64,
    /// 目标分片数
    pub target_chunk_count: u64,
    /// 分片总数上限
    pub max_total_chunks: u64,
    /// 分片总数下限
    pub min_total_chunks: u64,
}

impl Default for SizingPolicy {
    fn default() -> Self {
        Self {
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            max_chunk_size_client: DEFAULT_MAX_CHUNK_SIZE_CLIENT,
            max_chunk_size_server: DEFAULT_MAX_CHUNK_SIZE_SERVER,
            target_chunk_count: DEFAULT_TARGET_CHUNK_COUNT,
            max_total_chunks: DEFAULT_MAX_TOTAL_CHUNKS,
            min_total_chunks: DEFAULT_MIN_TOTAL_CHUNKS,
        }
    }
}

impl SizingPolicy {
    /// 客户端与服务端上限中较小者
    pub fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size_client.min(self.max_chunk_size_server)
    }

    /// 校验策略
    pub fn validate(&self) -> Result<()> {
        if self.min_chunk_size == 0 {
            return Err(UploadError::InvalidPolicy(
                "min_chunk_size must be positive".to_string(),
            ));
        }
        if self.min_chunk_size > self.max_chunk_size_client {
            return Err(UploadError::InvalidPolicy(format!(
                "min_chunk_size {} exceeds max_chunk_size_client {}",
                self.min_chunk_size, self.max_chunk_size_client
            )));
        }
        if self.min_chunk_size > self.max_chunk_size_server {
            return Err(UploadError::InvalidPolicy(format!(
                "min_chunk_size {} exceeds max_chunk_size_server {}",
                self.min_chunk_size, self.max_chunk_size_server
            )));
        }
        if self.target_chunk_count == 0 {
            return Err(UploadError::InvalidPolicy(
                "target_chunk_count must be positive".to_string(),
            ));
        }
        if self.max_total_chunks == 0 || self.min_total_chunks > self.max_total_chunks {
            return Err(UploadError::InvalidPolicy(format!(
                "chunk count bounds [{}, {}] are empty",
                self.min_total_chunks, self.max_total_chunks
            )));
        }
        Ok(())
    }
}

/// 分片规划器（纯函数，结果只取决于文件长度和策略）
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkPlanner {
    policy: SizingPolicy,
}

impl ChunkPlanner {
    pub fn new(policy: SizingPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self { policy })
    }

    pub fn policy(&self) -> &SizingPolicy {
        &self.policy
    }

    /// 计算分片大小
    ///
    /// 先按目标分片数求理想大小并夹到允许范围，
    /// 再按分片总数上下限调整：数量不足时缩小分片，数量超限时增大分片。
    /// 上下限无法同时满足时以上限为准
    pub fn chunk_size_for(&self, file_len: u64) -> u64 {
        let p = &self.policy;
        if file_len == 0 {
            return 0;
        }

        let ideal = file_len.div_ceil(p.target_chunk_count);
        let mut chunk_size = ideal.clamp(p.min_chunk_size, p.max_chunk_size());

        if file_len.div_ceil(chunk_size) < p.min_total_chunks {
            // 仍能切出 min_total_chunks 片的最大分片
            chunk_size = (file_len.div_ceil(p.min_total_chunks - 1) - 1).max(1);
        }
        if file_len.div_ceil(chunk_size) > p.max_total_chunks {
            chunk_size = file_len.div_ceil(p.max_total_chunks);
        }

        chunk_size
    }

    /// 规划分片字节范围
    pub fn plan(&self, file_len: u64) -> Vec<Range<u64>> {
        if file_len == 0 {
            return vec![0..0];
        }

        let chunk_size = self.chunk_size_for(file_len);
        let mut ranges = Vec::with_capacity(file_len.div_ceil(chunk_size) as usize);
        let mut offset = 0u64;
        while offset < file_len {
            let end = offset.saturating_add(chunk_size).min(file_len);
            ranges.push(offset..end);
            offset = end;
        }

        debug!(
            "分片规划: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            file_len,
            chunk_size,
            ranges.len()
        );
        ranges
    }
}

/// 分片唯一标识（文件 + 分片索引）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId {
    /// 文件在会话中的注册序号
    pub file: usize,
    /// 分片索引
    pub index: usize,
}

/// 上传分片（规划后不可变）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: ChunkId,
    /// 字节范围 [start, end)
    pub range: Range<u64>,
    /// 是否为文件的末尾分片
    pub is_last: bool,
}

impl Chunk {
    pub fn index(&self) -> usize {
        self.id.index
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// 已注册的上传文件
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 远端分配的文件 ID
    pub remote_id: String,
    /// 文件大小
    pub total_size: u64,
    chunks: Vec<Chunk>,
}

impl UploadFile {
    /// 按规划结果构造文件，最后一个分片标记为末尾分片
    pub fn new(
        file_index: usize,
        local_path: PathBuf,
        remote_id: String,
        total_size: u64,
        ranges: Vec<Range<u64>>,
    ) -> Self {
        let last = ranges.len().saturating_sub(1);
        let chunks = ranges
            .into_iter()
            .enumerate()
            .map(|(index, range)| Chunk {
                id: ChunkId {
                    file: file_index,
                    index,
                },
                range,
                is_last: index == last,
            })
            .collect();
        Self {
            local_path,
            remote_id,
            total_size,
            chunks,
        }
    }

    /// 所有分片（按索引排序）
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// 非末尾分片
    pub fn body_chunks(&self) -> &[Chunk] {
        &self.chunks[..self.chunks.len().saturating_sub(1)]
    }

    /// 末尾分片
    pub fn terminal_chunk(&self) -> Option<&Chunk> {
        self.chunks.last()
    }

    /// 分片数量
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}
