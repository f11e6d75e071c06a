//! 下载引擎
//!
//! 单个下载的完整编排：探测 → 选连接数 → 分段或单流 → 整体重试 →
//! 收尾。每个启动的下载占一个 tokio 任务；running 集合保证同一任务
//! 不会被启动两次。所有重试路径都是显式循环，不递归。

use crate::downloader::chunk::{self, choose_connections, Chunk};
use crate::downloader::fetcher;
use crate::downloader::task::{ChecksumKind, DownloadStatus, DownloadTask};
use crate::downloader::throttle::RateLimiter;
use crate::downloader::{CompletionCallback, ProgressCallback};
use crate::error::DownloadError;
use crate::transport::{validate_content_range, SessionConfig, Transport};
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, error, info, warn};

/// 整体下载重试的基础延迟
const BASE_DOWNLOAD_RETRY_MS: u64 = 2000;

/// 429 的固定重试延迟
const RETRY_429_DELAY_MS: u64 = 5000;

/// wait_finish 的轮询间隔
const WAIT_POLL_MS: u64 = 50;

/// 单流路径的速度刷新间隔
const SPEED_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// 下载引擎
pub struct DownloadEngine {
    transport: Arc<Transport>,
    /// 正在运行的任务 id 集合（双重启动守卫）
    running: Arc<DashMap<u64, ()>>,
    /// 配置的最大连接数（1-8）
    max_connections: AtomicUsize,
    /// 总限速 bytes/s，0 为不限速
    speed_limit: AtomicI64,
    progress_cb: parking_lot::Mutex<Option<ProgressCallback>>,
    completion_cb: parking_lot::Mutex<Option<CompletionCallback>>,
}

/// 任务退出时从 running 集合摘除 id
struct RunningGuard {
    running: Arc<DashMap<u64, ()>>,
    id: u64,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.remove(&self.id);
    }
}

impl DownloadEngine {
    pub fn new(session: SessionConfig, max_connections: usize) -> Result<Self, DownloadError> {
        Ok(Self {
            transport: Arc::new(Transport::new(session)?),
            running: Arc::new(DashMap::new()),
            max_connections: AtomicUsize::new(max_connections.clamp(1, 8)),
            speed_limit: AtomicI64::new(0),
            progress_cb: parking_lot::Mutex::new(None),
            completion_cb: parking_lot::Mutex::new(None),
        })
    }

    pub fn transport(&self) -> Arc<Transport> {
        self.transport.clone()
    }

    pub fn set_max_connections(&self, value: usize) {
        self.max_connections.store(value.clamp(1, 8), Ordering::Release);
    }

    pub fn set_speed_limit(&self, bytes_per_sec: i64) {
        self.speed_limit.store(bytes_per_sec.max(0), Ordering::Release);
    }

    pub fn set_progress_callback(&self, cb: ProgressCallback) {
        *self.progress_cb.lock() = Some(cb);
    }

    pub fn set_completion_callback(&self, cb: CompletionCallback) {
        *self.completion_cb.lock() = Some(cb);
    }

    pub fn is_running(&self, id: u64) -> bool {
        self.running.contains_key(&id)
    }

    /// 等待某个任务的下载退出
    ///
    /// 50ms 轮询 running 集合；超时返回 false
    pub async fn wait_finish(&self, id: u64, timeout_ms: u64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if !self.running.contains_key(&id) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(WAIT_POLL_MS)).await;
        }
    }

    /// 启动一个下载
    ///
    /// 同一 id 已在运行时是空操作，返回 false
    pub fn start(self: &Arc<Self>, task: Arc<DownloadTask>) -> bool {
        let id = task.id();

        // 双重启动守卫：先占坑再干活
        if self.running.insert(id, ()).is_some() {
            debug!("任务 {} 已在运行，忽略重复启动", id);
            return false;
        }

        task.reset_speed();
        task.set_status(DownloadStatus::Downloading);
        task.update_last_try_time();

        let engine = self.clone();
        tokio::spawn(async move {
            let _guard = RunningGuard {
                running: engine.running.clone(),
                id,
            };
            engine.run_download(task).await;
            engine.transport.drop_token(id);
        });

        true
    }

    /// 暂停：置状态并掐断在途请求
    pub fn pause(&self, task: &DownloadTask) {
        task.set_status(DownloadStatus::Paused);
        self.transport.cancel_requests(task.id());
    }

    /// 取消：置状态并掐断在途请求
    pub fn cancel(&self, task: &DownloadTask) {
        task.set_status(DownloadStatus::Cancelled);
        self.transport.cancel_requests(task.id());
    }

    /// 恢复下载
    ///
    /// 只允许从 Paused/Error/Queued/Cancelled 恢复；恢复前清掉错误
    /// 信息和重试计数
    pub fn resume(self: &Arc<Self>, task: Arc<DownloadTask>) -> bool {
        match task.status() {
            DownloadStatus::Completed | DownloadStatus::Downloading => false,
            DownloadStatus::Paused
            | DownloadStatus::Error
            | DownloadStatus::Queued
            | DownloadStatus::Cancelled => {
                task.reset_retry();
                task.set_error_message("");
                self.start(task)
            }
        }
    }

    // ========================================================================
    // 主流程
    // ========================================================================

    /// 整体下载流程：带重试的循环
    async fn run_download(self: &Arc<Self>, task: Arc<DownloadTask>) {
        let id = task.id();

        loop {
            match self.run_attempt(&task).await {
                Ok(()) => {
                    task.set_status(DownloadStatus::Completed);
                    task.reset_retry();
                    task.set_speed(0.0);
                    info!("✓ 任务 {} 下载完成", id);
                    self.fire_completion(id, true, "");
                    return;
                }
                Err(DownloadError::Aborted) => {
                    // 状态已由 pause/cancel 设置，这里不再改
                    info!("任务 {} 被用户中止（状态: {:?}）", id, task.status());
                    self.fire_completion(id, false, "User Aborted");
                    return;
                }
                Err(e) if e.is_retryable() => {
                    let retry_count = task.retry_count();
                    if retry_count >= task.max_retries() {
                        error!("✗ 任务 {} 重试 {} 次后放弃: {}", id, retry_count, e);
                        self.fail(&task, &e);
                        return;
                    }

                    let delay_ms = match &e {
                        DownloadError::HttpServer(429) => RETRY_429_DELAY_MS,
                        _ => BASE_DOWNLOAD_RETRY_MS * (1u64 << retry_count.min(4)),
                    };
                    task.increment_retry();
                    warn!(
                        "任务 {} 第 {}/{} 次整体重试，{}ms 后重来: {}",
                        id,
                        retry_count + 1,
                        task.max_retries(),
                        delay_ms,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                    // 等待期间被暂停/取消则不再重试
                    match task.status() {
                        DownloadStatus::Paused | DownloadStatus::Cancelled => {
                            self.fire_completion(id, false, "User Aborted");
                            return;
                        }
                        _ => {}
                    }
                    task.set_status(DownloadStatus::Downloading);
                    task.update_last_try_time();
                    // 循环重来（不递归）
                }
                Err(e) => {
                    error!("✗ 任务 {} 失败（不重试）: {}", id, e);
                    self.fail(&task, &e);
                    return;
                }
            }
        }
    }

    /// 单次完整尝试：探测 → 分段/单流 → 校验
    async fn run_attempt(self: &Arc<Self>, task: &Arc<DownloadTask>) -> Result<(), DownloadError> {
        let url = task.url();
        let referer = task.referer();

        // 1. 探测大小与 Range 支持
        let probe = self.transport.probe(&url, &referer).await?;
        task.set_total_size(probe.total_size);
        debug!(
            "任务 {} 探测: total={}, range={}, status={}",
            task.id(),
            probe.total_size,
            probe.range_supported,
            probe.status
        );

        // 2. 选连接数
        let configured = self.max_connections.load(Ordering::Acquire);
        let connections =
            choose_connections(configured, probe.total_size, probe.range_supported);

        // 3. 保存目录必须存在
        let save_path = task.save_path();
        tokio::fs::create_dir_all(&save_path).await?;

        // 4. 初始化或沿用分段：数量与模式匹配时沿用（续传），否则重建
        let existing = task.chunks_copy();
        let want_multi = connections > 1;
        let reinit = existing.is_empty()
            || (want_multi && existing.len() != connections)
            || (!want_multi && existing.len() != 1);
        if reinit {
            task.initialize_chunks(connections);
        }

        if connections > 1 {
            match self.run_segmented(task, connections).await? {
                SegmentedEnd::Done => return self.verify_checksum(task).await,
                SegmentedEnd::FallbackToSingle => {
                    // 降级：分段已重建为单段，直接走单流
                }
            }
        }

        self.run_single_stream(task).await?;
        self.verify_checksum(task).await
    }

    /// 分段路径（内含降级与减半重试的循环）
    async fn run_segmented(
        self: &Arc<Self>,
        task: &Arc<DownloadTask>,
        mut connections: usize,
    ) -> Result<SegmentedEnd, DownloadError> {
        let final_path = task.final_path();

        loop {
            // 与磁盘上的 part 文件对账（断点续传）
            {
                let mut chunks = task.chunks_copy();
                chunk::reconcile_with_part_files(&mut chunks, &final_path).await;
                task.set_chunks(chunks);
            }

            let progress_cb = self.progress_cb.lock().clone();
            let outcome = fetcher::fetch_segmented(
                self.transport.clone(),
                task.clone(),
                self.speed_limit.load(Ordering::Acquire),
                progress_cb,
            )
            .await;

            // 暂停/取消：保留 part 文件，无错误退出
            if outcome.aborted
                || matches!(
                    task.status(),
                    DownloadStatus::Paused | DownloadStatus::Cancelled
                )
            {
                return Err(DownloadError::Aborted);
            }

            if outcome.all_success {
                let count = task.chunk_count();
                fetcher::merge_parts(&final_path, count, task.total_size()).await?;
                return Ok(SegmentedEnd::Done);
            }

            if outcome.any_range_unsupported {
                // 服务器食言：清掉所有 part，重建单段，落回单流
                warn!("任务 {} 的服务器不支持分段，降级为单流", task.id());
                chunk::remove_part_files(&final_path, task.chunk_count()).await;
                task.initialize_chunks(1);
                task.set_downloaded_size(0);
                return Ok(SegmentedEnd::FallbackToSingle);
            }

            if outcome.any_throttled && connections > 1 {
                // 服务器限流：连接数减半再试
                chunk::remove_part_files(&final_path, task.chunk_count()).await;
                connections = (connections / 2).max(1);
                warn!("任务 {} 被限流，连接数减半至 {}", task.id(), connections);
                task.initialize_chunks(connections);
                task.set_downloaded_size(0);
                continue;
            }

            // 网络类失败：part 保留，交给整体重试
            return Err(DownloadError::Transport(
                "segmented download failed".to_string(),
            ));
        }
    }

    /// 单流路径
    ///
    /// 续传与否只看磁盘上的文件大小和已知总大小，与任务状态无关：
    /// 文件存在且小于总大小 → 带 Range 续传，要求 206 且起点吻合，
    /// 不吻合就从零重来
    async fn run_single_stream(
        self: &Arc<Self>,
        task: &Arc<DownloadTask>,
    ) -> Result<(), DownloadError> {
        let id = task.id();
        let url = task.url();
        let referer = task.referer();
        let final_path = task.final_path();
        let total = task.total_size();
        let token = self.transport.token_for(id);

        let existing_size = match tokio::fs::metadata(&final_path).await {
            Ok(meta) => meta.len() as i64,
            Err(_) => 0,
        };
        let mut resume = existing_size > 0 && (total <= 0 || existing_size < total);
        let mut offset = if resume { existing_size } else { 0 };

        let mut response = self
            .transport
            .get(&url, &referer, resume.then_some((offset, -1)))
            .await?;

        if resume {
            let status = response.status().as_u16();
            let valid = status == 206 && validate_content_range(&response, offset).is_ok();
            if !valid {
                // 服务器不认这个区间：丢弃响应，从零重来
                info!("任务 {} 续传被拒（status {}），从头下载", id, status);
                drop(response);
                resume = false;
                offset = 0;
                response = self.transport.get(&url, &referer, None).await?;
            } else {
                info!("任务 {} 从字节 {} 处续传", id, offset);
            }
        }

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(DownloadError::from_status(status));
        }

        // 单段记账：current 从续传偏移开始
        let end = if total > 0 { total - 1 } else { -1 };
        let mut chunk = Chunk::new(0, end);
        chunk.current = offset;
        task.set_chunks(vec![chunk]);

        let file = if resume {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&final_path)
                .await?
        } else {
            tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&final_path)
                .await?
        };
        let mut writer = BufWriter::with_capacity(64 * 1024, file);

        let mut limiter = RateLimiter::new(self.speed_limit.load(Ordering::Acquire));
        let mut stream = response.bytes_stream();
        let mut received: i64 = 0;
        let mut last_speed_at = tokio::time::Instant::now();
        let mut last_bytes: i64 = offset;

        loop {
            match task.status() {
                DownloadStatus::Paused | DownloadStatus::Cancelled => {
                    let _ = writer.flush().await;
                    return Err(DownloadError::Aborted);
                }
                _ => {}
            }

            let next = tokio::select! {
                _ = token.cancelled() => {
                    let _ = writer.flush().await;
                    return Err(DownloadError::Aborted);
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    writer.write_all(&bytes).await?;
                    received += bytes.len() as i64;
                    task.update_chunk(0, offset + received);

                    let elapsed = last_speed_at.elapsed();
                    if elapsed >= SPEED_UPDATE_INTERVAL {
                        let current = offset + received;
                        let speed = (current - last_bytes) as f64 / elapsed.as_secs_f64();
                        task.set_speed(speed);
                        last_speed_at = tokio::time::Instant::now();
                        last_bytes = current;
                        if let Some(cb) = self.progress_cb.lock().clone() {
                            cb(id, current, total, task.speed());
                        }
                    }

                    limiter.consume(bytes.len()).await;
                }
                Some(Err(e)) => {
                    let _ = writer.flush().await;
                    if token.is_cancelled() {
                        return Err(DownloadError::Aborted);
                    }
                    return Err(DownloadError::Transport(format!("read failed: {}", e)));
                }
                None => break,
            }
        }

        writer.flush().await?;
        writer.get_ref().sync_all().await?;

        // 未知大小的流以服务器断流为准，补齐总大小
        let downloaded = offset + received;
        if total <= 0 {
            task.set_total_size(downloaded);
            task.update_chunk(0, downloaded);
            let mut chunks = task.chunks_copy();
            if let Some(c) = chunks.get_mut(0) {
                c.end = downloaded - 1;
                c.completed = true;
            }
            task.set_chunks(chunks);
        } else if downloaded < total {
            // 短读：走整体重试，下次从磁盘大小续传
            return Err(DownloadError::Transport(format!(
                "short read: {} of {} bytes",
                downloaded, total
            )));
        }

        Ok(())
    }

    /// 下载完成后的校验和验证（未设置期望值时跳过）
    async fn verify_checksum(&self, task: &Arc<DownloadTask>) -> Result<(), DownloadError> {
        let Some((kind, expected)) = task.expected_checksum() else {
            return Ok(());
        };

        let path = task.final_path();
        let calculated = compute_checksum(&path, kind).await?;
        task.set_calculated_checksum(&calculated);

        if calculated != expected {
            warn!(
                "任务 {} 校验和不匹配: 期望 {}, 实际 {}",
                task.id(),
                expected,
                calculated
            );
            return Err(DownloadError::ChecksumMismatch);
        }
        info!("任务 {} 校验和验证通过（{:?}）", task.id(), kind);
        Ok(())
    }

    fn fail(&self, task: &Arc<DownloadTask>, error: &DownloadError) {
        let message = error.user_message();
        task.set_status(DownloadStatus::Error);
        task.set_error_message(&message);
        task.set_speed(0.0);
        self.fire_completion(task.id(), false, &message);
    }

    fn fire_completion(&self, id: u64, success: bool, message: &str) {
        if let Some(cb) = self.completion_cb.lock().clone() {
            cb(id, success, message);
        }
    }
}

enum SegmentedEnd {
    Done,
    FallbackToSingle,
}

/// 流式计算文件校验和
async fn compute_checksum(
    path: &std::path::Path,
    kind: ChecksumKind,
) -> Result<String, DownloadError> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut buffer = vec![0u8; 1024 * 1024];

    match kind {
        ChecksumKind::Md5 => {
            let mut context = md5::Context::new();
            loop {
                let n = file.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                context.consume(&buffer[..n]);
            }
            Ok(format!("{:x}", context.compute()))
        }
        ChecksumKind::Sha256 => {
            use sha2::Digest;
            let mut hasher = sha2::Sha256::new();
            loop {
                let n = file.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(to_hex(&hasher.finalize()))
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
