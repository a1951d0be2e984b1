//! 日志系统
//!
//! 控制台输出 + 可选的文件持久化。日志文件按启动时间命名、按大小滚动：
//! `chunked-upload.YYYY-MM-DD-HHMMSS.log`、`chunked-upload.YYYY-MM-DD-HHMMSS_N.log`，
//! 启动时清理超过保留天数的旧文件。

use crate::config::LogConfig;
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// 日志文件名前缀
pub const LOG_FILE_PREFIX: &str = "chunked-upload.";

const LOG_FILE_SUFFIX: &str = ".log";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

type FileLayer = Option<Box<dyn Layer<Registry> + Send + Sync>>;

/// 按大小滚动的日志文件
struct RotatingFile {
    /// 启动时间戳（YYYY-MM-DD-HHMMSS）
    start_timestamp: String,
    log_dir: PathBuf,
    file: Option<File>,
    /// 0 为基础文件，之后每次滚动加一
    index: u32,
    max_file_size: u64,
    written: u64,
}

impl RotatingFile {
    fn open(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let mut rotating = Self {
            start_timestamp: Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
            log_dir,
            file: None,
            index: 0,
            max_file_size,
            written: 0,
        };
        rotating.open_current()?;
        Ok(rotating)
    }

    fn path_for(&self, index: u32) -> PathBuf {
        let name = if index == 0 {
            format!("{}{}{}", LOG_FILE_PREFIX, self.start_timestamp, LOG_FILE_SUFFIX)
        } else {
            format!(
                "{}{}_{}{}",
                LOG_FILE_PREFIX, self.start_timestamp, index, LOG_FILE_SUFFIX
            )
        };
        self.log_dir.join(name)
    }

    fn open_current(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(self.index))?;
        self.file = Some(file);
        self.written = 0;
        Ok(())
    }

    fn write_record(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件总是接收第一条记录，避免超大单条记录导致无限滚动
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            if let Some(mut file) = self.file.take() {
                file.flush()?;
            }
            self.index += 1;
            self.open_current()?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "日志文件未打开"))?;
        let written = file.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 日志文件写入器，可在线程间共享
#[derive(Clone)]
pub struct LogFileWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl LogFileWriter {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RotatingFile::open(log_dir, max_file_size)?)),
        })
    }

    /// 当前写入的文件路径
    pub fn current_path(&self) -> PathBuf {
        let inner = self.inner.lock();
        inner.path_for(inner.index)
    }
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_record(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

/// 日志系统守卫
/// 必须保持存活，否则后台写入线程会退出并丢失未落盘的日志
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

impl LogGuard {
    /// 是否启用了文件输出
    pub fn has_file_output(&self) -> bool {
        self._file_guard.is_some()
    }
}

/// 初始化日志系统
///
/// `RUST_LOG` 优先于配置中的级别。宿主已安装全局订阅器时保留宿主的订阅器
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(true);

    let (file_layer, file_guard): (FileLayer, Option<WorkerGuard>) = if config.enabled {
        match open_file_writer(config) {
            Ok(writer) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(writer);
                let layer = fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
                    .with_ansi(false)
                    .with_writer(non_blocking);
                (Some(layer.boxed()), Some(guard))
            }
            Err(e) => {
                eprintln!(
                    "创建日志文件失败: {:?}, 错误: {}, 回退到仅控制台输出",
                    config.log_dir, e
                );
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let installed = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(env_filter)
        .try_init();

    if installed.is_err() {
        // 已有全局订阅器，本次配置的输出不会生效
        return LogGuard { _file_guard: None };
    }

    if file_guard.is_some() {
        info!(
            "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
            config.log_dir,
            config.retention_days,
            config.level,
            config.max_file_size as f64 / 1024.0 / 1024.0
        );
        let deleted = cleanup_old_logs(&config.log_dir, config.retention_days);
        if deleted > 0 {
            info!("已清理 {} 个过期日志文件", deleted);
        }
    } else {
        info!("日志系统初始化完成（仅控制台输出）");
    }

    LogGuard {
        _file_guard: file_guard,
    }
}

fn open_file_writer(config: &LogConfig) -> io::Result<LogFileWriter> {
    fs::create_dir_all(&config.log_dir)?;
    LogFileWriter::new(config.log_dir.clone(), config.max_file_size)
}

/// 清理过期日志文件，返回删除数量
///
/// 优先按文件名中的日期判断，无法解析时按修改时间判断
pub fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut deleted = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !name.starts_with(LOG_FILE_PREFIX) || !name.ends_with(LOG_FILE_SUFFIX) {
            continue;
        }

        let expired = match date_from_filename(name) {
            Some(date) => today.signed_duration_since(date) > retention,
            None => expired_by_mtime(&entry, retention),
        };

        if expired {
            match fs::remove_file(&path) {
                Ok(()) => {
                    deleted += 1;
                    tracing::debug!("已删除过期日志文件: {:?}", path);
                }
                Err(e) => tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }
    deleted
}

/// 从 `chunked-upload.YYYY-MM-DD[-HHMMSS[_N]].log` 中解析日期
fn date_from_filename(name: &str) -> Option<chrono::NaiveDate> {
    let stem = name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let date = stem.get(..10)?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn expired_by_mtime(entry: &fs::DirEntry, retention: chrono::Duration) -> bool {
    let modified = match entry.metadata().and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(_) => return false,
    };
    let modified: chrono::DateTime<chrono::Utc> = modified.into();
    chrono::Utc::now().signed_duration_since(modified) > retention
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_date_from_filename() {
        let expected = chrono::NaiveDate::from_ymd_opt(2024, 3, 9);
        assert_eq!(date_from_filename("chunked-upload.2024-03-09.log"), expected);
        assert_eq!(
            date_from_filename("chunked-upload.2024-03-09-101500.log"),
            expected
        );
        assert_eq!(
            date_from_filename("chunked-upload.2024-03-09-101500_3.log"),
            expected
        );
        assert_eq!(date_from_filename("chunked-upload.garbage.log"), None);
        assert_eq!(date_from_filename("other.2024-03-09.log"), None);
    }

    #[test]
    fn test_writer_rotates_by_size() {
        let dir = TempDir::new().unwrap();
        let mut writer = LogFileWriter::new(dir.path().to_path_buf(), 64).unwrap();
        let first = writer.current_path();

        writer.write_all(&[b'a'; 40]).unwrap();
        writer.write_all(&[b'b'; 40]).unwrap();
        writer.flush().unwrap();

        let second = writer.current_path();
        assert_ne!(first, second);
        assert!(second
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap()
            .ends_with("_1.log"));
        assert_eq!(fs::metadata(&first).unwrap().len(), 40);
        assert_eq!(fs::metadata(&second).unwrap().len(), 40);
    }

    #[test]
    fn test_oversized_record_written_to_fresh_file() {
        let dir = TempDir::new().unwrap();
        let mut writer = LogFileWriter::new(dir.path().to_path_buf(), 8).unwrap();
        writer.write_all(&[b'x'; 32]).unwrap();
        writer.flush().unwrap();
        assert_eq!(fs::metadata(writer.current_path()).unwrap().len(), 32);
    }

    #[test]
    fn test_cleanup_old_logs() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("chunked-upload.2000-01-01-000000.log");
        let old_rotated = dir.path().join("chunked-upload.2000-01-01-000000_2.log");
        let today = dir.path().join(format!(
            "chunked-upload.{}.log",
            Local::now().format("%Y-%m-%d-%H%M%S")
        ));
        let unrelated = dir.path().join("notes.2000-01-01.log");
        for path in [&old, &old_rotated, &today, &unrelated] {
            fs::write(path, b"log").unwrap();
        }

        assert_eq!(cleanup_old_logs(dir.path(), 7), 2);
        assert!(!old.exists());
        assert!(!old_rotated.exists());
        assert!(today.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn test_cleanup_missing_dir() {
        let dir = TempDir::new().unwrap();
        assert_eq!(cleanup_old_logs(&dir.path().join("missing"), 7), 0);
    }
}
