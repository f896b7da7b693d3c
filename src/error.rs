//! 下载会话错误类型
//!
//! 会话级错误分为四类：探测失败、文件 IO 失败、网络传输失败、
//! 以及重复启动。检查点文件损坏不属于会话级错误：加载失败时
//! 会退回全新下载（见 `checkpoint::load`），仅记录日志。

use thiserror::Error;

/// 下载错误
#[derive(Debug, Error)]
pub enum DownloadError {
    /// 探测请求失败，或服务器既非 chunked 传输又未给出文件大小
    #[error("探测失败: {0}")]
    Probe(String),

    /// 文件创建 / 映射 / 写入 / 截断失败
    #[error("文件 IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 连接失败或分片传输返回非成功状态码
    #[error("网络错误: {0}")]
    Network(String),

    /// 会话已处于下载中或暂停状态，不允许重复启动
    #[error("下载已在进行中")]
    AlreadyRunning,
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        DownloadError::Network(e.to_string())
    }
}
