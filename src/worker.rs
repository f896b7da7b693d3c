//! 分片下载 worker 与暂停 / 停止信号
//!
//! 每个分片由一个 worker 任务负责：从恢复偏移发起 Range 请求，
//! 把响应流写入映射文件中属于自己的区间。worker 在两个挂起点
//! 响应控制信号——等待下一段网络数据、以及暂停等待，两处都能被
//! 停止信号立刻唤醒。

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, IF_RANGE, RANGE};
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DownloadError;
use crate::mapped_file::MappedFile;
use crate::progress::PartProgress;

/// 暂停 / 停止控制信号
///
/// 暂停让 worker 挂起在条件等待上（不轮询、不断开连接），恢复时
/// 立即唤醒；停止信号同样会唤醒暂停中的 worker，避免只在恢复时
/// 才能退出的死等。每次 start() 使用全新实例（停止信号不可复位）。
#[derive(Debug)]
pub(crate) struct ControlSignal {
    paused: AtomicBool,
    resume_notify: Notify,
    cancel: CancellationToken,
}

impl ControlSignal {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            resume_notify: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.resume_notify.notify_waiters();
    }

    /// 发出停止信号：清除暂停位并唤醒所有等待者
    pub fn stop(&self) {
        self.paused.store(false, Ordering::Release);
        self.cancel.cancel();
        self.resume_notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 停止信号触发时完成
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// 暂停期间阻塞；返回 `false` 表示等待中收到了停止信号
    pub async fn wait_while_paused(&self) -> bool {
        loop {
            if self.is_stopped() {
                return false;
            }
            // 先注册唤醒，再检查标志，避免丢失 resume 通知
            let notified = self.resume_notify.notified();
            if !self.is_paused() {
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.cancel.cancelled() => return false,
            }
        }
    }
}

/// 下载单个分片，流式写入映射文件
///
/// 恢复偏移为 `start + downloaded`；超过 `end` 说明分片已完成，
/// 不发请求直接返回（重复启动幂等）。任何非 2xx 响应或 IO 错误
/// 都向上传播，由调度方终止整个会话。停止信号导致的提前退出
/// 返回 `Ok`，由会话层根据停止标志判定终态。
#[allow(clippy::too_many_arguments)]
pub(crate) async fn download_part(
    index: usize,
    client: Client,
    url: String,
    headers: HeaderMap,
    etag: Option<String>,
    supports_range: bool,
    file: Arc<MappedFile>,
    part: Arc<PartProgress>,
    control: Arc<ControlSignal>,
) -> Result<(), DownloadError> {
    let end = part.end();
    let mut offset = part.start() + part.downloaded();

    if offset > end {
        debug!("分片 #{} ({}-{}) 已完成，跳过", index, part.start(), end);
        return Ok(());
    }
    if control.is_stopped() {
        return Ok(());
    }

    let mut request = client.get(&url).headers(headers);
    if supports_range {
        request = request.header(RANGE, format!("bytes={}-{}", offset, end));
        // 续传时带上 If-Range，服务器内容变化则返回完整文件而非错误区间
        if part.downloaded() > 0 {
            if let Some(tag) = etag.as_deref() {
                if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", tag)) {
                    request = request.header(IF_RANGE, value);
                }
            }
        }
    }

    debug!(
        "分片 #{} 发起请求: bytes={}-{} (已下载 {})",
        index,
        offset,
        end,
        part.downloaded()
    );

    let response = tokio::select! {
        _ = control.cancelled() => {
            debug!("分片 #{} 在建立连接时收到停止信号", index);
            return Ok(());
        }
        result = request.send() => result
            .map_err(|e| DownloadError::Network(format!("分片 #{} 请求失败: {}", index, e)))?,
    };

    if !response.status().is_success() {
        return Err(DownloadError::Network(format!(
            "分片 #{} HTTP 错误: {} (range {}-{})",
            index,
            response.status(),
            offset,
            end
        )));
    }

    let mut stream = response.bytes_stream();

    loop {
        // 每次读取前检查暂停 / 停止；暂停挂起消费循环，不挂起 socket
        if !control.wait_while_paused().await {
            debug!("分片 #{} 收到停止信号，退出", index);
            return Ok(());
        }

        let chunk = tokio::select! {
            _ = control.cancelled() => {
                debug!("分片 #{} 在等待数据时收到停止信号", index);
                return Ok(());
            }
            item = stream.next() => match item {
                None => break,
                Some(result) => result.map_err(|e| {
                    DownloadError::Network(format!("分片 #{} 读取数据流失败: {}", index, e))
                })?,
            },
        };

        // 写入不越过本分片的区间上界（防止异常服务器多发数据撑破映射区）
        let remaining = end.saturating_add(1).saturating_sub(offset);
        let take = remaining.min(chunk.len() as u64) as usize;
        if take > 0 {
            file.write_at(offset, &chunk[..take])?;
            offset += take as u64;
            part.add_downloaded(take as u64);
        }
        if (take as u64) < chunk.len() as u64 {
            warn!("分片 #{} 收到超出区间的数据，已截断", index);
            break;
        }
        if offset > end {
            break;
        }
    }

    if offset <= end && !control.is_stopped() {
        return Err(DownloadError::Network(format!(
            "分片 #{} 数据流提前结束 ({} / {} bytes)",
            index,
            part.downloaded(),
            part.len()
        )));
    }

    debug!("分片 #{} 下载完成 ({} bytes)", index, part.downloaded());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_wait_passes_when_not_paused() {
        let control = ControlSignal::new();
        assert!(control.wait_while_paused().await);
    }

    #[tokio::test]
    async fn test_pause_blocks_and_resume_wakes() {
        let control = Arc::new(ControlSignal::new());
        control.pause();

        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.wait_while_paused().await });

        // 暂停期间保持阻塞
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        control.resume();
        let resumed = timeout(Duration::from_secs(1), handle)
            .await
            .expect("恢复后应立即唤醒")
            .unwrap();
        assert!(resumed);
    }

    #[tokio::test]
    async fn test_stop_wakes_paused_waiter() {
        let control = Arc::new(ControlSignal::new());
        control.pause();

        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.wait_while_paused().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        control.stop();

        let result = timeout(Duration::from_secs(1), handle)
            .await
            .expect("停止信号应唤醒暂停中的等待者")
            .unwrap();
        assert!(!result);
    }

    #[tokio::test]
    async fn test_stop_clears_pause_flag() {
        let control = ControlSignal::new();
        control.pause();
        assert!(control.is_paused());

        control.stop();
        assert!(!control.is_paused());
        assert!(control.is_stopped());
        assert!(!control.wait_while_paused().await);
    }
}
