//! 临时写入与原子替换：上传与整文件写入都先落到同目录的临时文件。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// 写满后通过 rename 替换目标的临时文件。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
    written: u64,
}

impl AtomicFile {
    /// 在目标路径的同一目录下创建临时文件，父目录需已存在。
    pub async fn create(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_path = parent.join(format!(".{base}.part.{}", Uuid::new_v4().simple()));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
            written: 0,
        })
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// 放弃写入并删除临时文件。
    pub async fn discard(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 同步数据后替换目标文件，返回写入的字节数。
    pub async fn commit(self) -> io::Result<u64> {
        let AtomicFile {
            target,
            temp_path,
            file,
            written,
        } = self;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = replace(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }
        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(written)
    }
}

#[cfg(not(windows))]
async fn replace(from: &Path, to: &Path) -> io::Result<()> {
    fs::rename(from, to).await
}

#[cfg(windows)]
async fn replace(from: &Path, to: &Path) -> io::Result<()> {
    let Err(err) = fs::rename(from, to).await else {
        return Ok(());
    };
    if fs::remove_file(to).await.is_err() {
        return Err(err);
    }
    tracing::debug!(error = %err, "retrying rename after removing target");
    fs::rename(from, to).await
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn commit_replaces_existing_target() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("page.html");
        std::fs::write(&target, b"old").expect("seed target");

        let mut atomic = AtomicFile::create(&target).await.expect("create");
        atomic.write_chunk(b"new ").await.expect("write");
        atomic.write_chunk(b"content").await.expect("write");
        assert_eq!(atomic.written(), 11);
        assert_eq!(atomic.commit().await.expect("commit"), 11);

        assert_eq!(std::fs::read(&target).expect("read"), b"new content");
        let leftovers = std::fs::read_dir(temp.path()).expect("read dir").count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn discard_leaves_target_untouched() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("data.bin");

        let mut atomic = AtomicFile::create(&target).await.expect("create");
        atomic.write_chunk(b"partial").await.expect("write");
        atomic.discard().await;

        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(temp.path()).expect("read dir").count(), 0);
    }
}
