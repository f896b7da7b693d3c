//! 检查点 sidecar 文件
//!
//! 每个 Range 下载在 `<path>.meta` 维护一份紧凑二进制（bincode）
//! 检查点，记录各分片的恢复进度。sidecar 的存在即表示有可续传的
//! 下载；下载成功后删除。写入采用临时文件 + 原子重命名，防止写入
//! 中断损坏文件。
//!
//! 加载失败（文件损坏 / 版本不匹配 / 校验不过）一律退回全新下载，
//! 只记日志不向调用方抛错——可用性优先于严格续传。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 检查点格式版本，结构变化时递增；版本不匹配的 sidecar 直接丢弃
pub const CHECKPOINT_VERSION: u32 = 1;

/// 分片的持久化形式
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartState {
    /// 起始偏移（含）
    pub start: u64,
    /// 结束偏移（含）
    pub end: u64,
    /// 相对起始偏移已写入的字节数
    pub downloaded: u64,
    /// 保存时刻的速度 (bytes/s)，仅展示用
    pub speed: f64,
}

impl PartState {
    /// 分片总长度（字节）
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.len()
    }
}

/// 一次可续传下载的恢复状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// 格式版本
    pub version: u32,
    /// 下载地址（恢复时校验用，非加密验证）
    pub url: String,
    /// 预期文件总大小
    pub file_size: u64,
    /// 探测到的服务器 ETag（用于恢复校验与 If-Range）
    pub etag: Option<String>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 最后保存时间
    pub updated_at: DateTime<Utc>,
    /// 有序分片列表，恰好覆盖 `[0, file_size-1]`
    pub parts: Vec<PartState>,
}

impl Checkpoint {
    /// 为一次全新下载构建检查点，按分片数均分字节区间
    pub fn new(url: String, file_size: u64, etag: Option<String>, part_count: usize) -> Self {
        let now = Utc::now();
        Self {
            version: CHECKPOINT_VERSION,
            url,
            file_size,
            etag,
            created_at: now,
            updated_at: now,
            parts: Self::split_parts(file_size, part_count),
        }
    }

    /// 均分 `[0, file_size-1]` 为 part_count 个连续分片，余数并入最后一个
    fn split_parts(file_size: u64, part_count: usize) -> Vec<PartState> {
        if file_size == 0 {
            return Vec::new();
        }
        let count = (part_count.max(1) as u64).min(file_size);
        let part_size = file_size / count;

        (0..count)
            .map(|i| {
                let start = i * part_size;
                let end = if i == count - 1 {
                    file_size - 1
                } else {
                    start + part_size - 1
                };
                PartState {
                    start,
                    end,
                    downloaded: 0,
                    speed: 0.0,
                }
            })
            .collect()
    }

    /// 所有分片累计已下载字节数
    pub fn total_downloaded(&self) -> u64 {
        self.parts.iter().map(|p| p.downloaded).sum()
    }

    /// 分片是否无缝覆盖整个文件区间
    fn parts_cover_file(&self) -> bool {
        if self.parts.is_empty() {
            return self.file_size == 0;
        }
        let mut expected_start = 0u64;
        for part in &self.parts {
            if part.start != expected_start || part.start > part.end {
                return false;
            }
            if part.downloaded > part.len() {
                return false;
            }
            expected_start = part.end + 1;
        }
        expected_start == self.file_size
    }

    /// 判断检查点是否适用于当前服务器状态
    ///
    /// 地址、文件大小、分片结构必须一致；服务器提供 ETag 时要求
    /// 与记录一致，仅当检查点尚无任何进度时容忍缺失的记录。
    pub fn is_valid_for(&self, url: &str, file_size: u64, server_etag: Option<&str>) -> bool {
        if self.version != CHECKPOINT_VERSION {
            return false;
        }
        if self.url != url {
            debug!("检查点地址不匹配: {} != {}", self.url, url);
            return false;
        }
        if self.file_size != file_size {
            debug!(
                "检查点文件大小不匹配: {} != {}",
                self.file_size, file_size
            );
            return false;
        }
        if !self.parts_cover_file() {
            debug!("检查点分片区间不完整，放弃恢复");
            return false;
        }
        match (server_etag, self.etag.as_deref()) {
            (Some(server), Some(saved)) => {
                if server.trim_matches('"') != saved {
                    debug!("检查点 ETag 不匹配: {} != {}", saved, server);
                    return false;
                }
                true
            }
            // 服务器有 ETag 而检查点没有：有进度时不敢续传
            (Some(_), None) => self.total_downloaded() == 0,
            (None, _) => true,
        }
    }

    /// 更新保存时间戳
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn tmp_path(meta_path: &Path) -> PathBuf {
    let mut s = OsString::from(meta_path.as_os_str());
    s.push(".tmp");
    PathBuf::from(s)
}

/// 保存检查点到 sidecar 文件
///
/// 先写入临时文件，再原子重命名，防止写入中断导致文件损坏。
pub fn save(meta_path: &Path, checkpoint: &Checkpoint) -> io::Result<()> {
    if let Some(parent) = meta_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp_path = tmp_path(meta_path);
    let file = File::create(&temp_path)?;
    let writer = BufWriter::new(file);

    bincode::serialize_into(writer, checkpoint).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("序列化检查点失败: {}", e),
        )
    })?;

    fs::rename(&temp_path, meta_path)?;

    debug!(
        "已保存检查点: {:?} (已下载 {} / {} bytes)",
        meta_path,
        checkpoint.total_downloaded(),
        checkpoint.file_size
    );

    Ok(())
}

/// 加载检查点
///
/// 文件不存在、无法解析或版本不匹配时返回 `None`；损坏的 sidecar
/// 会被删除，下一次保存重建。
pub fn load(meta_path: &Path) -> Option<Checkpoint> {
    if !meta_path.exists() {
        return None;
    }

    let checkpoint: Option<Checkpoint> = File::open(meta_path)
        .ok()
        .and_then(|file| bincode::deserialize_from(BufReader::new(file)).ok());

    match checkpoint {
        Some(cp) if cp.version == CHECKPOINT_VERSION => {
            debug!("已加载检查点: {:?} ({} 个分片)", meta_path, cp.parts.len());
            Some(cp)
        }
        Some(cp) => {
            warn!(
                "检查点版本不匹配 ({} != {})，重新开始下载: {:?}",
                cp.version, CHECKPOINT_VERSION, meta_path
            );
            let _ = fs::remove_file(meta_path);
            None
        }
        None => {
            warn!("检查点文件损坏，重新开始下载: {:?}", meta_path);
            let _ = fs::remove_file(meta_path);
            None
        }
    }
}

/// 删除检查点文件
///
/// 返回是否实际删除了文件。
pub fn delete(meta_path: &Path) -> io::Result<bool> {
    if meta_path.exists() {
        fs::remove_file(meta_path)?;
        debug!("已删除检查点文件: {:?}", meta_path);
        Ok(true)
    } else {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn checkpoint_with_parts(file_size: u64, part_count: usize) -> Checkpoint {
        Checkpoint::new(
            "https://example.com/file.bin".to_string(),
            file_size,
            None,
            part_count,
        )
    }

    #[test]
    fn test_split_parts_evenly() {
        let cp = checkpoint_with_parts(8_000_000, 4);
        let ranges: Vec<(u64, u64)> = cp.parts.iter().map(|p| (p.start, p.end)).collect();
        assert_eq!(
            ranges,
            vec![
                (0, 1_999_999),
                (2_000_000, 3_999_999),
                (4_000_000, 5_999_999),
                (6_000_000, 7_999_999)
            ]
        );
    }

    #[test]
    fn test_split_parts_remainder_goes_to_last() {
        let cp = checkpoint_with_parts(105, 10);
        assert_eq!(cp.parts.len(), 10);
        assert_eq!(cp.parts[9].start, 90);
        assert_eq!(cp.parts[9].end, 104);
        assert_eq!(cp.parts[9].len(), 15);
    }

    #[test]
    fn test_split_tiny_file_shrinks_part_count() {
        // 文件比请求的分片数还小：每字节一个分片，不出现零长度区间
        let cp = checkpoint_with_parts(3, 8);
        assert_eq!(cp.parts.len(), 3);
        for part in &cp.parts {
            assert_eq!(part.len(), 1);
        }
    }

    proptest! {
        #[test]
        fn prop_parts_partition_exactly(
            file_size in 1u64..10_000_000,
            part_count in 1usize..=64,
        ) {
            let cp = checkpoint_with_parts(file_size, part_count);

            prop_assert!(!cp.parts.is_empty());
            prop_assert_eq!(cp.parts[0].start, 0);
            prop_assert_eq!(cp.parts.last().unwrap().end, file_size - 1);

            let mut expected_start = 0u64;
            let mut covered = 0u64;
            for part in &cp.parts {
                prop_assert!(part.start <= part.end);
                prop_assert_eq!(part.start, expected_start);
                covered += part.len();
                expected_start = part.end + 1;
            }
            prop_assert_eq!(covered, file_size);
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let meta = temp.path().join("file.bin.meta");

        let mut cp = checkpoint_with_parts(1000, 4);
        cp.parts[1].downloaded = 120;
        cp.parts[3].downloaded = 250;
        cp.etag = Some("abc123".to_string());

        save(&meta, &cp).unwrap();
        let loaded = load(&meta).unwrap();

        assert_eq!(loaded.url, cp.url);
        assert_eq!(loaded.file_size, cp.file_size);
        assert_eq!(loaded.etag, cp.etag);
        assert_eq!(loaded.parts, cp.parts);
        assert_eq!(loaded.total_downloaded(), 370);
    }

    #[test]
    fn test_load_corrupt_file_returns_none_and_removes() {
        let temp = TempDir::new().unwrap();
        let meta = temp.path().join("broken.meta");
        fs::write(&meta, b"definitely not bincode").unwrap();

        assert!(load(&meta).is_none());
        // 损坏的 sidecar 已被清理
        assert!(!meta.exists());
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        assert!(load(&temp.path().join("absent.meta")).is_none());
    }

    #[test]
    fn test_delete() {
        let temp = TempDir::new().unwrap();
        let meta = temp.path().join("file.meta");

        assert!(!delete(&meta).unwrap());

        save(&meta, &checkpoint_with_parts(10, 2)).unwrap();
        assert!(delete(&meta).unwrap());
        assert!(!meta.exists());
    }

    #[test]
    fn test_validation_url_and_size() {
        let cp = checkpoint_with_parts(1000, 4);
        assert!(cp.is_valid_for("https://example.com/file.bin", 1000, None));
        assert!(!cp.is_valid_for("https://example.com/other.bin", 1000, None));
        assert!(!cp.is_valid_for("https://example.com/file.bin", 2000, None));
    }

    #[test]
    fn test_validation_etag() {
        let mut cp = checkpoint_with_parts(1000, 4);
        cp.etag = Some("v1".to_string());

        assert!(cp.is_valid_for("https://example.com/file.bin", 1000, Some("v1")));
        // 服务器返回带引号的 ETag 也能匹配
        assert!(cp.is_valid_for("https://example.com/file.bin", 1000, Some("\"v1\"")));
        assert!(!cp.is_valid_for("https://example.com/file.bin", 1000, Some("v2")));

        // 检查点无 ETag：没有进度时可以接受服务器新出现的 ETag
        cp.etag = None;
        assert!(cp.is_valid_for("https://example.com/file.bin", 1000, Some("v1")));
        cp.parts[0].downloaded = 10;
        assert!(!cp.is_valid_for("https://example.com/file.bin", 1000, Some("v1")));
    }

    #[test]
    fn test_validation_rejects_broken_part_layout() {
        let mut cp = checkpoint_with_parts(1000, 4);
        cp.parts[2].start += 1; // 制造空洞
        assert!(!cp.is_valid_for("https://example.com/file.bin", 1000, None));
    }
}
