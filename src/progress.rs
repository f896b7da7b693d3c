//! 分片进度计数与速度采样
//!
//! 每个分片的 `downloaded` 是一个无锁单调递增计数器（`ProgressCell`）：
//! 写入方只有持有该分片的 worker，读取方（状态查询、检查点持久化）
//! 接受最终一致的读数。这是刻意保留的设计而非疏漏——计数器在活跃
//! 下载期间只会前进，崩溃恢复最坏情况是重复下载最后一小段数据，
//! 不会造成数据损坏。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::checkpoint::PartState;
use crate::status::PartSnapshot;

/// 速度采样的最小间隔（毫秒），避免高频轮询时除以过小的时间差
pub const SPEED_SAMPLE_INTERVAL_MS: u64 = 200;

/// 无锁单调进度计数器
#[derive(Debug)]
pub struct ProgressCell(AtomicU64);

impl ProgressCell {
    pub fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::AcqRel);
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Release);
    }
}

/// 速度采样点
#[derive(Debug)]
struct SpeedSample {
    last_at: Instant,
    last_bytes: u64,
    bytes_per_sec: f64,
}

/// 单个分片的运行时进度
///
/// `start`/`end` 为闭区间字节偏移。下载中仅由持有它的 worker 推进
/// `downloaded`；速度采样由状态查询方和持久化定时任务共同触发，
/// 在最小采样间隔内幂等。
#[derive(Debug)]
pub struct PartProgress {
    start: u64,
    end: u64,
    downloaded: ProgressCell,
    sample: Mutex<SpeedSample>,
}

impl PartProgress {
    pub fn new(start: u64, end: u64, downloaded: u64) -> Self {
        Self {
            start,
            end,
            downloaded: ProgressCell::new(downloaded),
            sample: Mutex::new(SpeedSample {
                last_at: Instant::now(),
                last_bytes: downloaded,
                bytes_per_sec: 0.0,
            }),
        }
    }

    /// 无上界的单流进度（chunked 回退路径专用，不进入分片快照）
    pub fn open_ended() -> Self {
        Self::new(0, u64::MAX, 0)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// 分片总长度（字节）
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.get()
    }

    pub fn add_downloaded(&self, n: u64) {
        self.downloaded.add(n);
    }

    /// 清零进度（非 Range 模式整体重传时使用）
    pub fn reset_downloaded(&self) {
        self.downloaded.set(0);
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded() >= self.len()
    }

    /// 当前平滑速度 (bytes/s)
    pub fn speed(&self) -> f64 {
        self.sample.lock().bytes_per_sec
    }

    /// 重新计算瞬时速度
    ///
    /// 距上次采样不足最小间隔时不更新采样点，快速连续调用之间幂等。
    pub fn refresh_speed(&self) {
        let now = Instant::now();
        let mut sample = self.sample.lock();
        let elapsed = now.duration_since(sample.last_at);
        if elapsed.as_millis() as u64 >= SPEED_SAMPLE_INTERVAL_MS {
            let downloaded = self.downloaded();
            let delta = downloaded.saturating_sub(sample.last_bytes);
            sample.bytes_per_sec = delta as f64 / elapsed.as_secs_f64();
            sample.last_at = now;
            sample.last_bytes = downloaded;
        }
    }

    /// 速度归零并重置采样点（暂停 / 停止 / 恢复时调用，
    /// 避免恢复后第一次采样出现虚高）
    pub fn reset_speed(&self) {
        let mut sample = self.sample.lock();
        sample.bytes_per_sec = 0.0;
        sample.last_at = Instant::now();
        sample.last_bytes = self.downloaded();
    }

    /// 冻结为不可变快照
    pub fn snapshot(&self) -> PartSnapshot {
        PartSnapshot {
            start: self.start,
            end: self.end,
            downloaded: self.downloaded(),
            speed: self.speed(),
        }
    }

    /// 转换为检查点中的持久化形式
    pub fn to_state(&self) -> PartState {
        PartState {
            start: self.start,
            end: self.end,
            downloaded: self.downloaded(),
            speed: self.speed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_progress_cell() {
        let cell = ProgressCell::new(0);
        assert_eq!(cell.get(), 0);
        cell.add(100);
        cell.add(28);
        assert_eq!(cell.get(), 128);
        cell.set(5);
        assert_eq!(cell.get(), 5);
    }

    #[test]
    fn test_part_completion() {
        let part = PartProgress::new(0, 999, 0);
        assert_eq!(part.len(), 1000);
        assert!(!part.is_complete());

        part.add_downloaded(1000);
        assert!(part.is_complete());
    }

    #[test]
    fn test_resume_offset_bookkeeping() {
        let part = PartProgress::new(2000, 3999, 500);
        assert_eq!(part.downloaded(), 500);
        assert_eq!(part.start() + part.downloaded(), 2500);

        part.reset_downloaded();
        assert_eq!(part.downloaded(), 0);
    }

    #[test]
    fn test_speed_sampling_min_interval() {
        let part = PartProgress::new(0, 1_000_000, 0);
        part.add_downloaded(4096);

        // 间隔不足：采样点不动，速度保持 0
        part.refresh_speed();
        assert_eq!(part.speed(), 0.0);

        std::thread::sleep(Duration::from_millis(250));
        part.refresh_speed();
        let speed = part.speed();
        assert!(speed > 0.0);

        // 紧接着再刷新一次：间隔不足，读数不变（幂等）
        part.refresh_speed();
        assert_eq!(part.speed(), speed);
    }

    #[test]
    fn test_reset_speed() {
        let part = PartProgress::new(0, 1_000_000, 0);
        part.add_downloaded(4096);
        std::thread::sleep(Duration::from_millis(250));
        part.refresh_speed();
        assert!(part.speed() > 0.0);

        part.reset_speed();
        assert_eq!(part.speed(), 0.0);
    }

    #[test]
    fn test_snapshot_is_detached_copy() {
        let part = PartProgress::new(0, 99, 10);
        let snap = part.snapshot();
        part.add_downloaded(50);
        // 快照不跟随后续变化
        assert_eq!(snap.downloaded, 10);
        assert_eq!(part.downloaded(), 60);
    }
}
