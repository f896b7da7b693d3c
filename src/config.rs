//! 会话配置
//!
//! 构造参数：下载地址、保存路径、自定义请求头、并发线程数。
//! 线程数会被钳制在合法区间，且不会超过文件字节数（避免产生
//! 零长度分片）。

use reqwest::Client;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// 默认并发线程数
pub const DEFAULT_THREAD_COUNT: usize = 8;

/// 最大并发线程数
pub const MAX_THREAD_COUNT: usize = 64;

/// 默认 User-Agent（调用方可通过自定义请求头覆盖）
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// 检查点 sidecar 文件路径：`<path>.meta`
pub fn meta_path(path: &Path) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(".meta");
    PathBuf::from(s)
}

/// chunked 回退路径的临时文件：`<path>.tmp_chunked`
pub fn chunked_tmp_path(path: &Path) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(".tmp_chunked");
    PathBuf::from(s)
}

/// 下载会话配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 下载地址
    pub url: String,
    /// 本地保存路径
    pub path: PathBuf,
    /// 附加请求头（与默认请求头合并，调用方优先）
    pub headers: HashMap<String, String>,
    /// 并发线程数
    pub thread_count: usize,
    /// 自定义 HTTP 客户端（超时等策略由调用方配置）
    pub client: Option<Client>,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
            headers: HashMap::new(),
            thread_count: DEFAULT_THREAD_COUNT,
            client: None,
        }
    }

    /// 设置附加请求头
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// 设置并发线程数（钳制到 1..=MAX_THREAD_COUNT）
    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count.clamp(1, MAX_THREAD_COUNT);
        self
    }

    /// 使用自定义 HTTP 客户端
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// 计算实际分片数
    ///
    /// 线程数至少为 1；文件小于线程数时收缩到文件字节数，
    /// 保证不产生零长度分片。
    pub fn effective_part_count(&self, file_size: u64) -> usize {
        let threads = self.thread_count.clamp(1, MAX_THREAD_COUNT) as u64;
        threads.min(file_size.max(1)) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_count_clamped() {
        let config = SessionConfig::new("http://example.com/f", "/tmp/f").with_thread_count(0);
        assert_eq!(config.thread_count, 1);

        let config = SessionConfig::new("http://example.com/f", "/tmp/f").with_thread_count(10_000);
        assert_eq!(config.thread_count, MAX_THREAD_COUNT);
    }

    #[test]
    fn test_default_thread_count() {
        let config = SessionConfig::new("http://example.com/f", "/tmp/f");
        assert_eq!(config.thread_count, DEFAULT_THREAD_COUNT);
    }

    #[test]
    fn test_effective_part_count() {
        let config = SessionConfig::new("http://example.com/f", "/tmp/f").with_thread_count(8);
        assert_eq!(config.effective_part_count(8_000_000), 8);
        // 文件小于线程数：收缩到文件字节数
        assert_eq!(config.effective_part_count(3), 3);
        assert_eq!(config.effective_part_count(1), 1);
        // 空文件也不产生零个分片
        assert_eq!(config.effective_part_count(0), 1);
    }

    #[test]
    fn test_meta_path() {
        assert_eq!(
            meta_path(Path::new("/data/movie.mp4")),
            PathBuf::from("/data/movie.mp4.meta")
        );
        assert_eq!(
            chunked_tmp_path(Path::new("/data/movie.mp4")),
            PathBuf::from("/data/movie.mp4.tmp_chunked")
        );
    }
}
