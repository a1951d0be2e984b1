// 分片数据读取
//
// 按字节范围按需读取本地文件，不会一次性加载整个文件。
// 文件句柄由 ChunkReader 持有，读取器被丢弃时句柄随之释放（成功、失败、取消均如此）。
// 同一个读取器上的并发读取通过内部锁串行化（seek + read 需要独占句柄）。

use crate::error::{Result, UploadError};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::debug;

/// 分片读取器
#[derive(Debug, Clone)]
pub struct ChunkReader {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl ChunkReader {
    /// 打开文件
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let open_path = path.clone();
        let file = tokio::task::spawn_blocking(move || File::open(&open_path))
            .await
            .map_err(|e| task_failed(&path, e))?
            .map_err(|source| UploadError::FileUnavailable {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取指定字节范围
    ///
    /// 范围超出文件当前长度时返回 `RangeOutOfBounds`
    pub async fn read(&self, range: Range<u64>) -> Result<Vec<u8>> {
        let file = Arc::clone(&self.file);
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || read_range_blocking(&file, &path, range))
            .await
            .map_err(|e| task_failed(&self.path, e))?
    }
}

/// 读取任务本身异常（panic 或被取消）按文件不可读处理
fn task_failed(path: &Path, e: JoinError) -> UploadError {
    UploadError::FileUnavailable {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::Other, format!("读取任务异常: {}", e)),
    }
}

fn read_range_blocking(file: &Mutex<File>, path: &Path, range: Range<u64>) -> Result<Vec<u8>> {
    let unavailable = |source| UploadError::FileUnavailable {
        path: path.to_path_buf(),
        source,
    };

    let mut file = file.lock();
    let len = file.metadata().map_err(unavailable)?.len();
    if range.start > range.end || range.end > len {
        return Err(UploadError::RangeOutOfBounds {
            path: path.to_path_buf(),
            start: range.start,
            end: range.end,
            len,
        });
    }

    let size = (range.end - range.start) as usize;
    let mut buffer = vec![0u8; size];
    if size > 0 {
        file.seek(SeekFrom::Start(range.start))
            .map_err(unavailable)?;
        file.read_exact(&mut buffer).map_err(unavailable)?;
    }

    debug!(
        "读取分片数据: {:?} bytes={}..{}, 大小={} bytes",
        path, range.start, range.end, size
    );
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_file(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_read_exact_range() {
        let file = sample_file(1000);
        let reader = ChunkReader::open(file.path()).await.unwrap();

        let data = reader.read(100..110).await.unwrap();
        let expected: Vec<u8> = (100..110).map(|i| (i % 251) as u8).collect();
        assert_eq!(data, expected);

        let empty = reader.read(1000..1000).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_reads_on_same_reader() {
        let file = sample_file(4096);
        let reader = ChunkReader::open(file.path()).await.unwrap();

        let (a, b, c) = tokio::join!(
            reader.read(0..1024),
            reader.read(1024..2048),
            reader.read(3000..4096)
        );
        assert_eq!(a.unwrap()[0], 0);
        assert_eq!(b.unwrap()[0], (1024 % 251) as u8);
        assert_eq!(c.unwrap().len(), 1096);
    }

    #[tokio::test]
    async fn test_range_out_of_bounds() {
        let file = sample_file(100);
        let reader = ChunkReader::open(file.path()).await.unwrap();

        let err = reader.read(50..150).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::RangeOutOfBounds { len: 100, end: 150, .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_file_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = ChunkReader::open(dir.path().join("gone.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::FileUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_task_failure_is_file_access_error() {
        let join_error = tokio::task::spawn_blocking(|| panic!("read worker died"))
            .await
            .unwrap_err();
        let err = task_failed(Path::new("/tmp/a.bin"), join_error);
        assert_eq!(err.kind(), crate::error::ErrorKind::FileAccess);
        assert!(matches!(err, UploadError::FileUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_truncated_after_open() {
        let file = sample_file(1000);
        let reader = ChunkReader::open(file.path()).await.unwrap();

        // 规划之后文件被截断
        std::fs::OpenOptions::new()
            .write(true)
            .open(file.path())
            .unwrap()
            .set_len(10)
            .unwrap();

        let err = reader.read(0..500).await.unwrap_err();
        assert!(matches!(err, UploadError::RangeOutOfBounds { len: 10, .. }));
    }
}
