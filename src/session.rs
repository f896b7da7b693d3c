//! 下载会话门面
//!
//! 会话是对外的控制与身份单元：构造 → start() 跑到终态，期间可
//! 从任意线程 pause / resume / stop / 查询状态。start() 每次都重新
//! 探测服务器能力，按结果走 Range 并行路径或 chunked 顺序回退。
//!
//! 状态机：`PENDING → DOWNLOADING → {PAUSED, STOPPED, COMPLETED,
//! ERROR}`，`PAUSED → DOWNLOADING`。STOPPED / ERROR 后可再次
//! start()，磁盘上尚存的检查点会被校验后复用。

use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checkpoint::{self, Checkpoint};
use crate::chunked::{self, ChunkedOutcome};
use crate::config::{self, SessionConfig, DEFAULT_USER_AGENT};
use crate::error::DownloadError;
use crate::listener::{DownloadListener, ListenerBus};
use crate::mapped_file::MappedFile;
use crate::probe::{self, ServerFileInfo};
use crate::progress::PartProgress;
use crate::status::{percent_of, DownloadState, DownloadStatus};
use crate::worker::{self, ControlSignal};

/// 检查点持久化周期
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(1);

/// 会话各任务（worker / 持久化 / 外部调用方）共享的运行时状态
struct Shared {
    meta_path: PathBuf,
    state: RwLock<DownloadState>,
    error_message: RwLock<Option<String>>,
    total_size: RwLock<Option<u64>>,
    supports_range: AtomicBool,
    /// Range 路径的运行时分片；chunked 路径为空
    parts: RwLock<Vec<Arc<PartProgress>>>,
    /// chunked 路径的单流计数器
    stream_progress: RwLock<Option<Arc<PartProgress>>>,
    /// 检查点骨架（url / 大小 / etag / 创建时间），保存时填充分片进度
    base_checkpoint: RwLock<Option<Checkpoint>>,
    listeners: ListenerBus,
    /// 当前 start() 轮次的控制信号
    control: RwLock<Arc<ControlSignal>>,
}

impl Shared {
    /// 构建不可变状态快照，任意线程可调用
    fn build_status(&self) -> DownloadStatus {
        let state = *self.state.read();
        let parts = self.parts.read().clone();

        let (total_downloaded, speed, snapshots) = if !parts.is_empty() {
            let mut snapshots = Vec::with_capacity(parts.len());
            let mut downloaded = 0u64;
            let mut speed = 0.0f64;
            for part in &parts {
                part.refresh_speed();
                let snapshot = part.snapshot();
                downloaded += snapshot.downloaded;
                speed += snapshot.speed;
                snapshots.push(snapshot);
            }
            (downloaded, speed, snapshots)
        } else if let Some(stream) = self.stream_progress.read().clone() {
            stream.refresh_speed();
            (stream.downloaded(), stream.speed(), Vec::new())
        } else {
            (0, 0.0, Vec::new())
        };

        let total_size = *self.total_size.read();
        DownloadStatus {
            percent: percent_of(total_downloaded, total_size),
            total_downloaded,
            parts: snapshots,
            speed: speed.max(0.0),
            state,
            total_size,
            error_message: self.error_message.read().clone(),
        }
    }

    /// 保存检查点（仅 Range 路径；chunked 路径从不落盘）
    ///
    /// 持久化任务与 worker 对 `downloaded` 的竞争是良性的：计数器
    /// 单调前进，落后的读数最多导致恢复时重下最后一小段。
    fn save_checkpoint_if_ranged(&self) -> std::io::Result<()> {
        if !self.supports_range.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut guard = self.base_checkpoint.write();
        let Some(cp) = guard.as_mut() else {
            return Ok(());
        };
        {
            let parts = self.parts.read();
            cp.parts = parts.iter().map(|p| p.to_state()).collect();
        }
        cp.touch();
        checkpoint::save(&self.meta_path, cp)
    }

    /// 所有速度读数归零并重置采样点
    fn reset_speeds(&self) {
        for part in self.parts.read().iter() {
            part.reset_speed();
        }
        if let Some(stream) = self.stream_progress.read().as_ref() {
            stream.reset_speed();
        }
    }

    /// 进入 ERROR 终态并通知监听器
    fn fail(&self, reason: &str) {
        *self.state.write() = DownloadState::Error;
        *self.error_message.write() = Some(reason.to_string());
        self.reset_speeds();
        let status = self.build_status();
        self.listeners.emit(|l| l.on_error(&status, reason));
    }
}

/// 下载会话
///
/// 所有方法接收 `&self`，会话可放进 `Arc` 在线程间共享；
/// start() 进行期间从其他线程调用控制方法是预期用法。
pub struct DownloadSession {
    id: String,
    config: SessionConfig,
    client: Client,
    headers: HeaderMap,
    shared: Arc<Shared>,
}

impl DownloadSession {
    pub fn new(config: SessionConfig) -> Self {
        let client = config.client.clone().unwrap_or_else(default_client);
        let headers = build_headers(&config);
        let meta_path = config::meta_path(&config.path);

        Self {
            id: Uuid::new_v4().to_string(),
            client,
            headers,
            shared: Arc::new(Shared {
                meta_path,
                state: RwLock::new(DownloadState::Pending),
                error_message: RwLock::new(None),
                total_size: RwLock::new(None),
                supports_range: AtomicBool::new(false),
                parts: RwLock::new(Vec::new()),
                stream_progress: RwLock::new(None),
                base_checkpoint: RwLock::new(None),
                listeners: ListenerBus::new(),
                control: RwLock::new(Arc::new(ControlSignal::new())),
            }),
            config,
        }
    }

    /// 会话 ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 下载地址
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// 本地保存路径
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// 从下载地址推断的文件名，推断不出时返回 "unknown"
    pub fn file_name(&self) -> String {
        let base = self.config.url.split(['?', '#']).next().unwrap_or("");
        let without_scheme = base.split_once("://").map(|(_, rest)| rest).unwrap_or(base);
        match without_scheme.split_once('/') {
            Some((_, path)) => {
                let name = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
                if name.is_empty() {
                    "unknown".to_string()
                } else {
                    name.to_string()
                }
            }
            None => "unknown".to_string(),
        }
    }

    /// 预期总大小（探测之前以及 chunked 传输期间未知）
    pub fn total_size(&self) -> Option<u64> {
        *self.shared.total_size.read()
    }

    /// 当前状态
    pub fn state(&self) -> DownloadState {
        *self.shared.state.read()
    }

    /// 状态快照，任意线程可调用
    pub fn status(&self) -> DownloadStatus {
        self.shared.build_status()
    }

    pub fn add_listener(&self, listener: Arc<dyn DownloadListener>) {
        self.shared.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn DownloadListener>) {
        self.shared.listeners.remove(listener);
    }

    /// 启动下载并运行到终态
    ///
    /// 设计上阻塞到所有分片结束（成功 / 停止 / 出错），调用方应在
    /// 后台执行上下文中调用。下载中或暂停中重复调用返回
    /// [`DownloadError::AlreadyRunning`]。
    pub async fn start(&self) -> Result<(), DownloadError> {
        {
            let mut state = self.shared.state.write();
            if matches!(
                *state,
                DownloadState::Downloading | DownloadState::Paused
            ) {
                warn!("[会话 {}] 已在进行中，拒绝重复启动", self.id);
                return Err(DownloadError::AlreadyRunning);
            }
            *state = DownloadState::Pending;
        }
        *self.shared.error_message.write() = None;
        *self.shared.parts.write() = Vec::new();
        *self.shared.stream_progress.write() = None;
        *self.shared.base_checkpoint.write() = None;

        // 停止信号不可复位，每轮启动换新的控制信号
        let control = Arc::new(ControlSignal::new());
        *self.shared.control.write() = control.clone();

        info!(
            "[会话 {}] 开始下载: {} -> {:?}",
            self.id, self.config.url, self.config.path
        );

        // 每次启动都重新探测，服务器能力可能变化
        let server_info =
            match probe::probe_server(&self.client, &self.config.url, &self.headers).await {
                Ok(info) => info,
                Err(e) => {
                    let reason = e.to_string();
                    error!("[会话 {}] 探测失败: {}", self.id, reason);
                    self.shared.fail(&reason);
                    return Err(e);
                }
            };

        *self.shared.total_size.write() = server_info.file_size;
        self.shared
            .supports_range
            .store(server_info.supports_range, Ordering::Release);

        match server_info.file_size {
            None => self.run_chunked(control).await,
            Some(size) => self.run_ranged(size, server_info, control).await,
        }
    }

    /// Range / 已知大小路径：并行分片写入映射文件
    async fn run_ranged(
        &self,
        file_size: u64,
        server_info: ServerFileInfo,
        control: Arc<ControlSignal>,
    ) -> Result<(), DownloadError> {
        let supports_range = server_info.supports_range;
        let etag = server_info.etag.clone();

        // 恢复磁盘上的检查点，校验不过则丢弃重来
        let restored = if supports_range {
            checkpoint::load(&self.shared.meta_path).and_then(|cp| {
                if cp.is_valid_for(&self.config.url, file_size, etag.as_deref()) {
                    info!(
                        "[会话 {}] 检查点已加载: 已下载 {} / {} bytes",
                        self.id,
                        cp.total_downloaded(),
                        file_size
                    );
                    Some(cp)
                } else {
                    warn!("[会话 {}] 检查点与服务器状态不符，重新开始", self.id);
                    let _ = checkpoint::delete(&self.shared.meta_path);
                    None
                }
            })
        } else {
            None
        };

        let base = restored.unwrap_or_else(|| {
            let part_count = if supports_range {
                self.config.effective_part_count(file_size)
            } else {
                1
            };
            Checkpoint::new(self.config.url.clone(), file_size, etag.clone(), part_count)
        });

        let parts: Vec<Arc<PartProgress>> = base
            .parts
            .iter()
            .map(|p| Arc::new(PartProgress::new(p.start, p.end, p.downloaded)))
            .collect();
        if !supports_range {
            // 非 Range 模式只能整体重传，历史进度作废
            for part in &parts {
                part.reset_downloaded();
            }
        }
        *self.shared.parts.write() = parts.clone();
        *self.shared.base_checkpoint.write() = if supports_range { Some(base) } else { None };

        // 空文件无需传输，直接落盘
        if file_size == 0 {
            if let Err(e) = std::fs::File::create(&self.config.path) {
                let err = DownloadError::Io(e);
                self.shared.fail(&err.to_string());
                return Err(err);
            }
            let _ = checkpoint::delete(&self.shared.meta_path);
            self.finish_complete();
            return Ok(());
        }

        // 在任何 worker 写入之前完成映射
        let file = match MappedFile::create(&self.config.path, file_size) {
            Ok(f) => Arc::new(f),
            Err(e) => {
                let err = DownloadError::Io(e);
                let reason = err.to_string();
                error!("[会话 {}] 映射目标文件失败: {}", self.id, reason);
                self.shared.fail(&reason);
                return Err(err);
            }
        };

        *self.shared.state.write() = DownloadState::Downloading;

        let persister = self.spawn_persister(control.clone(), true);

        // 一个分片一个任务；permit 在任务内部获取，信号量限制实际并发
        // （恢复的检查点分片数可能多于当前线程数）
        let semaphore = Arc::new(Semaphore::new(self.config.thread_count.max(1)));
        let mut tasks: JoinSet<Result<(), DownloadError>> = JoinSet::new();
        for (index, part) in parts.iter().enumerate() {
            let semaphore = semaphore.clone();
            let client = self.client.clone();
            let url = self.config.url.clone();
            let headers = self.headers.clone();
            let etag = etag.clone();
            let file = file.clone();
            let part = part.clone();
            let control = control.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| DownloadError::Network("分片线程池已关闭".to_string()))?;
                worker::download_part(
                    index,
                    client,
                    url,
                    headers,
                    etag,
                    supports_range,
                    file,
                    part,
                    control,
                )
                .await
            });
        }

        // 等待所有分片结束；首个错误生效并立即叫停其余分片
        let mut first_error: Option<DownloadError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(r) => r,
                Err(e) => Err(DownloadError::Network(format!("分片任务异常: {}", e))),
            };
            if let Err(e) = result {
                if first_error.is_none() {
                    error!("[会话 {}] 分片失败，终止其余分片: {}", self.id, e);
                    control.stop();
                    first_error = Some(e);
                }
            }
        }

        persister.abort();

        if let Some(e) = first_error {
            // 释放映射（不截断），保留部分文件与检查点用于下次续传
            drop(file);
            self.persist_checkpoint_best_effort();
            self.shared.fail(&e.to_string());
            return Err(e);
        }

        if control.is_stopped() {
            // stop() 已同步保存过一次；worker 全部退出后再补存一次，
            // 把停止信号发出之后写入的字节也计入恢复进度
            drop(file);
            self.shared.reset_speeds();
            self.persist_checkpoint_best_effort();
            info!("[会话 {}] 下载已停止", self.id);
            return Ok(());
        }

        let all_complete = parts.iter().all(|p| p.is_complete());
        if !all_complete {
            drop(file);
            self.persist_checkpoint_best_effort();
            let err = DownloadError::Network("部分分片未完整下载".to_string());
            self.shared.fail(&err.to_string());
            return Err(err);
        }

        // 刷盘、截断到精确大小、解除映射
        let mapped = match Arc::try_unwrap(file) {
            Ok(m) => m,
            Err(_) => {
                let err = DownloadError::Network("映射文件仍被占用".to_string());
                self.shared.fail(&err.to_string());
                return Err(err);
            }
        };
        if let Err(e) = mapped.finalize() {
            self.persist_checkpoint_best_effort();
            let err = DownloadError::Io(e);
            self.shared.fail(&err.to_string());
            return Err(err);
        }

        if supports_range {
            if let Err(e) = checkpoint::delete(&self.shared.meta_path) {
                warn!("[会话 {}] 删除检查点失败: {}", self.id, e);
            }
        }

        self.finish_complete();
        Ok(())
    }

    /// chunked 回退路径：顺序单流，不写检查点
    async fn run_chunked(&self, control: Arc<ControlSignal>) -> Result<(), DownloadError> {
        info!(
            "[会话 {}] 服务器未提供文件大小，顺序下载（不支持断点续传）",
            self.id
        );
        let progress = Arc::new(PartProgress::open_ended());
        *self.shared.stream_progress.write() = Some(progress.clone());
        *self.shared.state.write() = DownloadState::Downloading;

        let persister = self.spawn_persister(control.clone(), false);
        let tmp = config::chunked_tmp_path(&self.config.path);

        let outcome = chunked::download_chunked(
            &self.client,
            &self.config.url,
            self.headers.clone(),
            &self.config.path,
            &tmp,
            progress.clone(),
            control.clone(),
        )
        .await;

        persister.abort();

        match outcome {
            Ok(ChunkedOutcome::Completed) => {
                // 流结束后总大小才确定
                *self.shared.total_size.write() = Some(progress.downloaded());
                self.finish_complete();
                Ok(())
            }
            Ok(ChunkedOutcome::Stopped) => {
                self.shared.reset_speeds();
                info!("[会话 {}] chunked 下载已停止，重启将从头开始", self.id);
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                error!("[会话 {}] chunked 下载失败: {}", self.id, reason);
                self.shared.fail(&reason);
                Err(e)
            }
        }
    }

    /// 暂停：worker 挂起在条件等待上，连接保持
    pub fn pause(&self) {
        {
            let mut state = self.shared.state.write();
            if *state != DownloadState::Downloading {
                return;
            }
            *state = DownloadState::Paused;
        }
        let control = self.shared.control.read().clone();
        control.pause();
        self.shared.reset_speeds();
        self.persist_checkpoint_best_effort();
        info!("[会话 {}] 已暂停", self.id);
        let status = self.shared.build_status();
        self.shared.listeners.emit(|l| l.on_pause(&status));
    }

    /// 从暂停恢复；未暂停时除状态写入外无副作用
    pub fn resume(&self) {
        {
            let mut state = self.shared.state.write();
            if *state != DownloadState::Paused {
                return;
            }
            *state = DownloadState::Downloading;
        }
        *self.shared.error_message.write() = None;
        // 重置采样点，恢复后第一次测速不出现虚高
        self.shared.reset_speeds();
        let control = self.shared.control.read().clone();
        control.resume();
        info!("[会话 {}] 已恢复", self.id);
        let status = self.shared.build_status();
        let path = self.config.path.clone();
        self.shared
            .listeners
            .emit(|l| l.on_resume(&status, &path));
    }

    /// 停止：唤醒所有 worker（包括暂停中的）并同步保存检查点
    ///
    /// 不保证 worker 立刻退出，只保证它们在下一次信号检查点
    /// （至多一次缓冲读取的延迟）观察到并尽快退出。
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.write();
            if matches!(
                *state,
                DownloadState::Stopped | DownloadState::Completed
            ) {
                return;
            }
            *state = DownloadState::Stopped;
        }
        let control = self.shared.control.read().clone();
        control.stop();
        self.shared.reset_speeds();
        self.persist_checkpoint_best_effort();
        info!("[会话 {}] 停止信号已发出", self.id);
    }

    /// 停止并删除目标文件、检查点与临时文件；返回实际删除的文件数。
    /// 调用后会话不应再复用。
    pub async fn remove(&self) -> usize {
        self.stop();
        // 给 worker 一个观察停止信号的窗口
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut deleted = 0;
        let candidates = [
            self.config.path.clone(),
            self.shared.meta_path.clone(),
            config::chunked_tmp_path(&self.config.path),
        ];
        for path in candidates {
            if path.exists() {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        deleted += 1;
                        debug!("[会话 {}] 已删除 {:?}", self.id, path);
                    }
                    Err(e) => {
                        error!("[会话 {}] 删除文件失败 {:?}: {}", self.id, path, e);
                    }
                }
            }
        }

        *self.shared.parts.write() = Vec::new();
        *self.shared.stream_progress.write() = None;
        *self.shared.base_checkpoint.write() = None;
        *self.shared.total_size.write() = None;
        *self.shared.error_message.write() = None;
        *self.shared.state.write() = DownloadState::Pending;
        info!("[会话 {}] 会话已移除", self.id);
        deleted
    }

    /// 周期任务：每秒保存检查点（Range 路径）并上报进度
    fn spawn_persister(&self, control: Arc<ControlSignal>, save_enabled: bool) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let session_id = self.id.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CHECKPOINT_INTERVAL);
            // interval 的第一次 tick 立即完成，跳过
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = control.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let state = *shared.state.read();
                if state != DownloadState::Downloading {
                    continue;
                }
                if save_enabled {
                    if let Err(e) = shared.save_checkpoint_if_ranged() {
                        warn!("[会话 {}] 周期保存检查点失败: {}", session_id, e);
                    }
                }
                let status = shared.build_status();
                shared.listeners.emit(|l| l.on_progress(&status));
            }
            debug!("[会话 {}] 持久化任务退出", session_id);
        })
    }

    fn persist_checkpoint_best_effort(&self) {
        if let Err(e) = self.shared.save_checkpoint_if_ranged() {
            warn!("[会话 {}] 保存检查点失败: {}", self.id, e);
        }
    }

    fn finish_complete(&self) {
        *self.shared.state.write() = DownloadState::Completed;
        self.shared.reset_speeds();
        let status = self.shared.build_status();
        info!(
            "[会话 {}] 下载完成 ({} bytes)",
            self.id, status.total_downloaded
        );
        self.shared.listeners.emit(|l| l.on_complete(&status));
    }
}

/// 默认 HTTP 客户端
///
/// 不设请求级超时：有界延迟要求由调用方注入配置好超时的客户端
/// 来满足。
fn default_client() -> Client {
    Client::builder()
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .tcp_nodelay(true)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .expect("构建 HTTP 客户端失败")
}

/// 合并默认请求头与调用方请求头，调用方优先
fn build_headers(config: &SessionConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    for (key, value) in &config.headers {
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("忽略非法请求头: {}", key),
        }
    }
    headers
}
