use chrono::{DateTime, Local};
use serde::Serialize;
use std::cmp::Ordering;
use std::fs::Metadata;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, ErrorKind};
use tracing::info;

use crate::atomic::AtomicFile;
use crate::path::SafePath;

/// 根目录内的文件增删改查。调用方只传入 [`SafePath`]，这里不再做越界检查。
#[derive(Clone, Debug)]
pub struct FileStore {
    trash: PathBuf,
}

impl FileStore {
    pub fn new(trash: PathBuf) -> Self {
        Self { trash }
    }

    pub fn trash_path(&self) -> &Path {
        &self.trash
    }

    pub async fn ensure_dirs(&self, root: &Path) -> io::Result<()> {
        fs::create_dir_all(root).await?;
        fs::create_dir_all(&self.trash).await
    }

    pub async fn exists(&self, path: &SafePath) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    pub async fn is_dir(&self, path: &SafePath) -> bool {
        fs::metadata(path)
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false)
    }

    pub async fn metadata(&self, path: &SafePath) -> Result<Metadata, StorageError> {
        Ok(fs::metadata(path).await?)
    }

    pub async fn size(&self, path: &SafePath) -> Result<u64, StorageError> {
        Ok(self.metadata(path).await?.len())
    }

    pub async fn read(&self, path: &SafePath) -> Result<Vec<u8>, StorageError> {
        Ok(fs::read(path).await?)
    }

    /// 读取闭区间 `start..=end`，`end` 截断到当前文件长度，文件变短时返回较短的内容。
    pub async fn read_range(
        &self,
        path: &SafePath,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, StorageError> {
        let mut file = File::open(path).await?;
        let size = file.metadata().await?.len();
        if start >= size || start > end {
            return Err(StorageError::OutOfRange { size });
        }
        let end = end.min(size - 1);
        let length = end - start + 1;

        file.seek(SeekFrom::Start(start)).await?;
        let mut content = Vec::with_capacity(usize::try_from(length).unwrap_or(0));
        file.take(length).read_to_end(&mut content).await?;
        Ok(content)
    }

    pub async fn write(&self, path: &SafePath, content: &[u8]) -> Result<(), StorageError> {
        self.ensure_parent(path).await?;
        let mut atomic = AtomicFile::create(path.as_path()).await?;
        if let Err(err) = atomic.write_chunk(content).await {
            atomic.discard().await;
            return Err(err.into());
        }
        atomic.commit().await?;
        Ok(())
    }

    pub async fn append(&self, path: &SafePath, content: &[u8]) -> Result<(), StorageError> {
        self.ensure_parent(path).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(content).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn create_dir(&self, path: &SafePath) -> Result<(), StorageError> {
        fs::create_dir_all(path).await?;
        Ok(())
    }

    /// 移入回收站而不是直接删除，返回回收站中的路径。
    pub async fn delete(&self, path: &SafePath) -> Result<PathBuf, StorageError> {
        if path.is_root() {
            return Err(StorageError::InvalidPath);
        }
        fs::symlink_metadata(path).await?;
        let name = path.file_name().ok_or(StorageError::InvalidPath)?;
        fs::create_dir_all(&self.trash).await?;
        let destination = self.trash_destination(name, Local::now()).await;
        fs::rename(path, &destination).await?;
        info!(path = %path, trash = ?destination, "moved to trash");
        Ok(destination)
    }

    pub async fn rename(&self, from: &SafePath, to: &SafePath) -> Result<(), StorageError> {
        fs::symlink_metadata(from).await?;
        self.ensure_parent(to).await?;
        fs::rename(from, to).await?;
        Ok(())
    }

    pub async fn list_dir(&self, dir: &SafePath) -> Result<Vec<FileEntry>, StorageError> {
        let mut reader = fs::read_dir(dir).await?;
        let prefix = dir.relative();
        let mut entries = Vec::new();

        while let Some(entry) = reader.next_entry().await? {
            let metadata = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().to_string();
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            let is_dir = metadata.is_dir();

            entries.push(FileEntry {
                name,
                path,
                is_dir,
                size: if metadata.is_file() { metadata.len() } else { 0 },
                modified: metadata.modified().ok().map(format_timestamp),
            });
        }

        entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });

        Ok(entries)
    }

    async fn ensure_parent(&self, path: &SafePath) -> io::Result<()> {
        match path.as_path().parent() {
            Some(parent) => fs::create_dir_all(parent).await,
            None => Ok(()),
        }
    }

    async fn trash_destination(&self, name: &str, now: DateTime<Local>) -> PathBuf {
        let stamp = now.format("%Y%m%d_%H%M%S_").to_string();
        let candidate = self.trash.join(format!("{stamp}{name}"));
        if !fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        let mut attempt = 1u32;
        loop {
            let candidate = self.trash.join(format!("{stamp}{attempt}_{name}"));
            if !fs::try_exists(&candidate).await.unwrap_or(false) {
                return candidate;
            }
            attempt += 1;
        }
    }
}

fn format_timestamp(time: SystemTime) -> String {
    let datetime: DateTime<Local> = time.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    OutOfRange { size: u64 },
    Io(io::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::Io(err) if err.kind() == ErrorKind::NotFound)
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<String>,
}
