//! 会话状态与状态快照
//!
//! `DownloadStatus` 是不可变的值对象：分片信息在构造时深拷贝，
//! 调用方拿不到调度器内部的可变引用。

use serde::{Deserialize, Serialize};

/// 下载会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    /// 等待中
    Pending,
    /// 下载中
    Downloading,
    /// 已暂停
    Paused,
    /// 已停止
    Stopped,
    /// 已完成
    Completed,
    /// 失败
    Error,
}

impl DownloadState {
    /// 是否为终态（停止、完成或失败）
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Error)
    }

    /// 是否为活跃状态（正在传输）
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Downloading)
    }
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Downloading => write!(f, "downloading"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// 单个分片的进度快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartSnapshot {
    /// 起始偏移（含）
    pub start: u64,
    /// 结束偏移（含）
    pub end: u64,
    /// 相对起始偏移已写入的字节数
    pub downloaded: u64,
    /// 平滑后的瞬时速度 (bytes/s)
    pub speed: f64,
}

/// 会话状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadStatus {
    /// 完成百分比（总大小未知时为 0）
    pub percent: u32,
    /// 所有分片累计已下载字节数
    pub total_downloaded: u64,
    /// 各分片进度的深拷贝（chunked 路径无分片列表，为空）
    pub parts: Vec<PartSnapshot>,
    /// 聚合速度 (bytes/s)
    pub speed: f64,
    /// 会话状态
    pub state: DownloadState,
    /// 预期总大小（chunked 传输期间未知）
    pub total_size: Option<u64>,
    /// 最近一次错误信息
    pub error_message: Option<String>,
}

/// 计算完成百分比：总大小未知或为 0 时返回 0，否则向下取整
pub(crate) fn percent_of(downloaded: u64, total: Option<u64>) -> u32 {
    match total {
        Some(total) if total > 0 => {
            let pct = (downloaded as u128 * 100 / total as u128) as u32;
            pct.min(100)
        }
        _ => 0,
    }
}
