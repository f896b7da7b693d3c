//! 服务器能力探测
//!
//! 在每次 start() 时发送一次仅取响应头的探测请求（HEAD 优先，
//! 失败则退回 GET），判定三件事：是否支持 Range、文件总大小、
//! 以及 ETag。结果不跨启动缓存——服务器能力可能变化。
//!
//! 判定规则：
//! - `Transfer-Encoding: chunked` → 强制走顺序回退路径，大小未知；
//! - 否则必须有数字 `Content-Length`，缺失视为探测失败；
//! - `Accept-Ranges: bytes` 且大小已知非零 → 支持 Range 并行下载。

use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, ETAG, TRANSFER_ENCODING};
use reqwest::Client;
use tracing::{debug, warn};

use crate::error::DownloadError;

/// 探测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFileInfo {
    /// 服务器是否支持字节 Range 请求
    pub supports_range: bool,
    /// 文件总大小；chunked 传输时未知
    pub file_size: Option<u64>,
    /// 服务器 ETag（去除引号）
    pub etag: Option<String>,
}

impl ServerFileInfo {
    /// 从响应头判定服务器能力
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, DownloadError> {
        let etag = headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_matches('"').to_string());

        let is_chunked = headers
            .get(TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);

        if is_chunked {
            // 大小未知，只能整体顺序下载
            return Ok(Self {
                supports_range: false,
                file_size: None,
                etag,
            });
        }

        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let Some(file_size) = content_length else {
            return Err(DownloadError::Probe(
                "响应既无 Content-Length 也非 chunked 传输，无法确定文件大小".to_string(),
            ));
        };

        let accept_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        Ok(Self {
            supports_range: accept_ranges && file_size > 0,
            file_size: Some(file_size),
            etag,
        })
    }
}

/// 探测服务器：HEAD 优先，非 2xx 或请求失败时退回 GET（只读响应头）
pub async fn probe_server(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
) -> Result<ServerFileInfo, DownloadError> {
    let head_result = client.head(url).headers(headers.clone()).send().await;

    let response = match head_result {
        Ok(resp) if resp.status().is_success() => resp,
        other => {
            match &other {
                Ok(resp) => debug!("HEAD 探测返回 {}，退回 GET", resp.status()),
                Err(e) => warn!("HEAD 探测失败，退回 GET: {}", e),
            }
            let resp = client
                .get(url)
                .headers(headers.clone())
                .send()
                .await
                .map_err(|e| DownloadError::Probe(format!("探测请求失败: {}", e)))?;
            if !resp.status().is_success() {
                return Err(DownloadError::Probe(format!(
                    "探测返回 HTTP 状态码 {}",
                    resp.status()
                )));
            }
            resp
        }
    };

    let info = ServerFileInfo::from_headers(response.headers())?;
    debug!(
        "探测完成: supports_range={}, file_size={:?}, etag={:?}",
        info.supports_range, info.file_size, info.etag
    );
    // 响应体（GET 回退时存在）随 response 一起丢弃
    Ok(info)
}
