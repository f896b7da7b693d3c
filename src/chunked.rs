//! chunked 回退路径
//!
//! 服务器无法预告文件大小时的顺序单流下载：数据先写入
//! `<path>.tmp_chunked`，成功后重命名到目标路径；停止或出错时删除
//! 临时文件。该路径不写检查点——无法断点续传，停止后只能从零
//! 重新下载。

use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::Client;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::DownloadError;
use crate::progress::PartProgress;
use crate::worker::ControlSignal;

/// chunked 下载的结束方式
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ChunkedOutcome {
    /// 数据流正常结束，文件已就位
    Completed,
    /// 被停止信号中断，临时文件已删除
    Stopped,
}

/// 顺序下载整个响应流
pub(crate) async fn download_chunked(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    dest: &Path,
    tmp: &Path,
    progress: Arc<PartProgress>,
    control: Arc<ControlSignal>,
) -> Result<ChunkedOutcome, DownloadError> {
    let outcome = stream_into_tmp(client, url, headers, dest, tmp, progress, control).await;

    if !matches!(outcome, Ok(ChunkedOutcome::Completed)) {
        // 停止 / 出错：不保留无法续传的半成品
        let _ = fs::remove_file(tmp).await;
    }
    outcome
}

async fn stream_into_tmp(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    dest: &Path,
    tmp: &Path,
    progress: Arc<PartProgress>,
    control: Arc<ControlSignal>,
) -> Result<ChunkedOutcome, DownloadError> {
    let response = tokio::select! {
        _ = control.cancelled() => return Ok(ChunkedOutcome::Stopped),
        result = client.get(url).headers(headers).send() => result
            .map_err(|e| DownloadError::Network(format!("chunked 请求失败: {}", e)))?,
    };

    if !response.status().is_success() {
        return Err(DownloadError::Network(format!(
            "chunked 下载 HTTP 错误: {}",
            response.status()
        )));
    }

    if let Some(parent) = tmp.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let mut file = File::create(tmp).await?;
    let mut stream = response.bytes_stream();

    loop {
        if !control.wait_while_paused().await {
            debug!("chunked 下载收到停止信号");
            return Ok(ChunkedOutcome::Stopped);
        }

        let chunk = tokio::select! {
            _ = control.cancelled() => return Ok(ChunkedOutcome::Stopped),
            item = stream.next() => match item {
                None => break,
                Some(result) => result.map_err(|e| {
                    DownloadError::Network(format!("chunked 读取数据流失败: {}", e))
                })?,
            },
        };

        file.write_all(&chunk).await?;
        progress.add_downloaded(chunk.len() as u64);
    }

    file.flush().await?;
    drop(file);
    fs::rename(tmp, dest).await?;

    info!(
        "chunked 下载完成: {:?} ({} bytes)",
        dest,
        progress.downloaded()
    );
    Ok(ChunkedOutcome::Completed)
}
