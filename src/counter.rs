//! 基于内存映射文件的持久化访问计数器。
//!
//! 计数值以小端序 `u64` 存放在映射区域的前 8 个字节。递增只是一次内存写入，
//! 持久化依赖 [`PersistentCounter::flush`]（后台定时调用、正常退出时调用）。

use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

const COUNTER_WIDTH: usize = std::mem::size_of::<u64>();

#[derive(Debug)]
pub struct PersistentCounter {
    region: Mutex<Option<MmapMut>>,
}

impl PersistentCounter {
    /// 打开（必要时创建并扩展）`size` 字节的后备文件并映射到内存。
    ///
    /// `size` 小于 8 或映射失败时返回禁用状态的计数器，所有操作均为空操作。
    pub fn open(path: &Path, size: usize) -> Self {
        match map_region(path, size) {
            Ok(region) => {
                debug!(path = ?path, enabled = region.is_some(), "visit counter opened");
                Self {
                    region: Mutex::new(region),
                }
            }
            Err(err) => {
                warn!(path = ?path, error = %err, "visit counter disabled");
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self {
            region: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.region().is_some()
    }

    pub fn get(&self) -> u64 {
        self.region().as_deref().map(read_value).unwrap_or(0)
    }

    /// 加一并返回新值；禁用时返回 0。
    pub fn increment(&self) -> u64 {
        let mut region = self.region();
        let Some(map) = region.as_mut() else {
            return 0;
        };
        let next = read_value(map).wrapping_add(1);
        map[..COUNTER_WIDTH].copy_from_slice(&next.to_le_bytes());
        next
    }

    /// 同步刷盘映射区域。
    pub fn flush(&self) -> io::Result<()> {
        match self.region().as_ref() {
            Some(map) => map.flush(),
            None => Ok(()),
        }
    }

    /// 解除映射。`flush == false` 时跳过刷盘，仅用于错误恢复路径。
    pub fn close(mut self, flush: bool) -> io::Result<()> {
        let region = self
            .region
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match region {
            Some(map) if flush => map.flush(),
            _ => Ok(()),
        }
    }

    fn region(&self) -> MutexGuard<'_, Option<MmapMut>> {
        self.region.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PersistentCounter {
    fn drop(&mut self) {
        let region = self
            .region
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(map) = region
            && let Err(err) = map.flush()
        {
            warn!(error = %err, "failed to flush visit counter on close");
        }
    }
}

fn map_region(path: &Path, size: usize) -> io::Result<Option<MmapMut>> {
    if size < COUNTER_WIDTH {
        return Ok(None);
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    if file.metadata()?.len() < size as u64 {
        file.set_len(size as u64)?;
    }
    // SAFETY: 映射只经由本结构体的互斥锁访问；其他进程并发截断同一文件不在支持范围内。
    let map = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
    Ok(Some(map))
}

fn read_value(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; COUNTER_WIDTH];
    raw.copy_from_slice(&bytes[..COUNTER_WIDTH]);
    u64::from_le_bytes(raw)
}
