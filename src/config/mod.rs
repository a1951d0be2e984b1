// 配置管理模块

use crate::uploader::{SizingPolicy, DEFAULT_MAX_CONCURRENT_CHUNKS, DEFAULT_PROGRESS_INTERVAL_MS};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 全局最大并发分片数（整个会话共享，不按文件计算）
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
    /// 分片策略
    #[serde(default)]
    pub sizing: SizingPolicy,
    /// 进入后台时是否挂起上传（即将过期时总是挂起）
    #[serde(default)]
    pub suspend_on_background: bool,
    /// 单个分片请求超时（秒），不设置则不限制
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 进度事件节流间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_max_concurrent_chunks() -> usize {
    DEFAULT_MAX_CONCURRENT_CHUNKS
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_progress_interval_ms() -> u64 {
    DEFAULT_PROGRESS_INTERVAL_MS
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: default_max_concurrent_chunks(),
            sizing: SizingPolicy::default(),
            suspend_on_background: false,
            request_timeout_secs: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl UploadConfig {
    /// 校验并发上限和分片策略
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_chunks == 0 {
            anyhow::bail!("max_concurrent_chunks 必须大于 0");
        }
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("connect_timeout_secs 必须大于 0");
        }
        self.sizing.validate().context("分片策略无效")?;
        Ok(())
    }
}

impl AppConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        self.upload.validate().context("上传配置验证失败")
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载配置，失败时使用默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.upload.max_concurrent_chunks, 4);
        assert_eq!(config.upload.sizing.min_chunk_size, 50 * 1024 * 1024);
        assert_eq!(config.upload.sizing.target_chunk_count, 200);
        assert_eq!(config.upload.connect_timeout_secs, 30);
        assert_eq!(config.upload.request_timeout_secs, None);
        assert_eq!(config.log.retention_days, 7);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.upload.max_concurrent_chunks = 8;
        config.upload.request_timeout_secs = Some(120);
        config.log.level = "debug".to_string();
        config.save_to_file(&path).await.unwrap();

        let loaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.upload.max_concurrent_chunks, 8);
        assert_eq!(loaded.upload.request_timeout_secs, Some(120));
        assert_eq!(loaded.upload.sizing, config.upload.sizing);
        assert_eq!(loaded.log.level, "debug");
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[upload]\nmax_concurrent_chunks = 2\n\n[upload.sizing]\nmin_chunk_size = 1048576\n",
        )
        .unwrap();

        let loaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.upload.max_concurrent_chunks, 2);
        assert_eq!(loaded.upload.sizing.min_chunk_size, 1024 * 1024);
        assert_eq!(loaded.upload.sizing.target_chunk_count, 200);
        assert_eq!(loaded.upload.progress_interval_ms, 200);
        assert!(loaded.log.enabled);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[upload]\nmax_concurrent_chunks = 0\n").unwrap();

        assert!(AppConfig::load_from_file(&path).await.is_err());
        let fallback = AppConfig::load_or_default(&path).await;
        assert_eq!(fallback.upload.max_concurrent_chunks, 4);
    }

    #[test]
    fn test_invalid_sizing_rejected() {
        let mut config = UploadConfig::default();
        config.sizing.min_total_chunks = config.sizing.max_total_chunks + 1;
        assert!(config.validate().is_err());
    }
}
