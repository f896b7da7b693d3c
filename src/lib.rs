// parget
// 可断点续传的多线程 HTTP 下载核心库

// 会话配置
pub mod config;

// 错误类型
pub mod error;

// 服务器能力探测
pub mod probe;

// 内存映射文件写入
pub mod mapped_file;

// 检查点 sidecar 持久化
pub mod checkpoint;

// 分片进度与速度采样
pub mod progress;

// 状态与快照
pub mod status;

// 事件监听
pub mod listener;

// 分片下载 worker
mod worker;

// chunked 顺序回退路径
mod chunked;

// 下载会话门面
pub mod session;

// 文件哈希工具
pub mod hashing;

// 导出常用类型
pub use checkpoint::{Checkpoint, PartState};
pub use config::{SessionConfig, DEFAULT_THREAD_COUNT, MAX_THREAD_COUNT};
pub use error::DownloadError;
pub use hashing::{file_hash, HashKind};
pub use listener::DownloadListener;
pub use probe::ServerFileInfo;
pub use session::DownloadSession;
pub use status::{DownloadState, DownloadStatus, PartSnapshot};
