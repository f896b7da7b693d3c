//! 内存映射文件写入
//!
//! Range 下载的目标文件在任何 worker 写入之前整体映射进内存，
//! worker 按各自分片的绝对偏移直接写入映射区，避免多线程对同一
//! 文件句柄的 seek / 锁竞争。各分片区间由划分保证互不重叠，因此
//! 并发写入不同区间不构成数据竞争。
//!
//! 完成时 `finalize`：msync 刷盘、截断到精确大小、解除映射并关闭
//! 文件。出错或停止时直接 drop，保留部分写入的文件用于续传。

use memmap2::MmapMut;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use tracing::debug;

/// 映射到内存的目标文件
#[derive(Debug)]
pub struct MappedFile {
    file: File,
    map: MmapMut,
    ptr: *mut u8,
    len: u64,
}

// 安全性：`write_at` 的调用方保证不同线程写入的字节区间互不重叠
// （由分片划分保证），映射区生命周期与 self 绑定。
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// 创建（或打开）目标文件，预分配到 `len` 字节并整体映射
    pub fn create(path: &Path, len: u64) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "不能映射零长度文件",
            ));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        // 预分配文件空间，保证映射区覆盖整个目标区间
        file.set_len(len)?;

        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let ptr = map.as_mut_ptr();

        debug!("已映射目标文件: {:?} ({} bytes)", path, len);

        Ok(Self {
            file,
            map,
            ptr,
            len,
        })
    }

    /// 映射区长度（字节）
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 将 `data` 写入映射区的绝对偏移 `offset`
    ///
    /// 允许从不同线程并发调用，前提是写入区间互不重叠。
    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "写入偏移溢出"))?;
        if end > self.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("写入越界: {}..{} 超出映射区 {}", offset, end, self.len),
            ));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// 刷写映射区到磁盘（msync 等价）
    pub fn flush(&self) -> io::Result<()> {
        self.map.flush()
    }

    /// 完成下载：刷盘、截断到精确大小、解除映射并关闭文件
    pub fn finalize(self) -> io::Result<()> {
        self.map.flush()?;
        let MappedFile {
            file,
            map,
            ptr: _,
            len,
        } = self;
        // 截断前必须先解除映射
        drop(map);
        file.set_len(len)?;
        debug!("目标文件已定稿 ({} bytes)", len);
        Ok(())
    }
}
