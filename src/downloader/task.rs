//! 下载任务记录
//!
//! 单个下载的全部状态：URL、文件名、分段向量、进度、速度、重试计数。
//! 状态位用原子变量，分段向量和元数据分别上锁，进度更新和 UI 读取
//! 互不阻塞。管理器以 `Arc<DownloadTask>` 共享。

use crate::downloader::chunk::{build_chunks, Chunk};
use crate::urlutil;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// 速度 EMA 平滑系数
const SPEED_EMA_ALPHA: f64 = 0.2;

/// EMA 启动前的简单平均样本数
const SPEED_WARMUP_SAMPLES: u32 = 3;

/// 整体下载重试的基础延迟（记录级退避：1s, 2s, 4s, ...）
const RETRY_BASE_DELAY_MS: u64 = 1000;

/// 整体下载重试延迟上限
const RETRY_MAX_DELAY_MS: u64 = 60_000;

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// 排队中
    Queued,
    /// 下载中
    Downloading,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 出错
    Error,
    /// 已取消
    Cancelled,
}

impl DownloadStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DownloadStatus::Downloading,
            2 => DownloadStatus::Paused,
            3 => DownloadStatus::Completed,
            4 => DownloadStatus::Error,
            5 => DownloadStatus::Cancelled,
            _ => DownloadStatus::Queued,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            DownloadStatus::Queued => 0,
            DownloadStatus::Downloading => 1,
            DownloadStatus::Paused => 2,
            DownloadStatus::Completed => 3,
            DownloadStatus::Error => 4,
            DownloadStatus::Cancelled => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Error => "error",
            DownloadStatus::Cancelled => "cancelled",
        }
    }
}

/// 校验和类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumKind {
    Md5,
    Sha256,
}

/// 元数据（低频读写，与分段进度分开上锁）
#[derive(Debug, Default)]
struct TaskMeta {
    url: String,
    referer: String,
    filename: String,
    save_path: PathBuf,
    category: String,
    error_message: String,
    last_try_time: String,
    next_retry_at: Option<Instant>,
    expected_checksum: Option<(ChecksumKind, String)>,
    calculated_checksum: String,
}

/// 速度状态：EMA 的读-改-写必须在同一把锁内完成
#[derive(Debug, Default)]
struct SpeedState {
    smoothed: f64,
    samples: u32,
}

/// 下载任务
#[derive(Debug)]
pub struct DownloadTask {
    id: u64,
    status: AtomicU8,
    total_size: AtomicI64,
    downloaded_size: AtomicI64,
    retry_count: AtomicU32,
    max_retries: AtomicU32,
    /// 由外部助手驱动时为 true，引擎不接管它的字节
    is_external_helper: AtomicBool,
    /// 助手上报的进度覆盖值，负数表示未启用
    progress_override: Mutex<f64>,
    speed: Mutex<SpeedState>,
    chunks: Mutex<Vec<Chunk>>,
    meta: Mutex<TaskMeta>,
}

impl DownloadTask {
    /// 创建新任务
    ///
    /// 文件名从 URL 推导，Referer 默认为 URL 的来源
    pub fn new(id: u64, url: &str, save_path: PathBuf) -> Self {
        let filename = urlutil::filename_from_url(url, id);
        let referer = urlutil::origin_of(url);

        let task = Self {
            id,
            status: AtomicU8::new(DownloadStatus::Queued.as_u8()),
            total_size: AtomicI64::new(-1),
            downloaded_size: AtomicI64::new(0),
            retry_count: AtomicU32::new(0),
            max_retries: AtomicU32::new(DEFAULT_MAX_RETRIES),
            is_external_helper: AtomicBool::new(false),
            progress_override: Mutex::new(-1.0),
            speed: Mutex::new(SpeedState::default()),
            chunks: Mutex::new(Vec::new()),
            meta: Mutex::new(TaskMeta {
                url: url.to_string(),
                referer,
                filename,
                save_path,
                category: urlutil::CATEGORY_ALL.to_string(),
                ..TaskMeta::default()
            }),
        };
        task.update_last_try_time();
        task
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> String {
        self.meta.lock().url.clone()
    }

    pub fn referer(&self) -> String {
        self.meta.lock().referer.clone()
    }

    pub fn set_referer(&self, referer: &str) {
        self.meta.lock().referer = referer.to_string();
    }

    pub fn filename(&self) -> String {
        self.meta.lock().filename.clone()
    }

    pub fn set_filename(&self, filename: &str) {
        self.meta.lock().filename = filename.to_string();
    }

    pub fn save_path(&self) -> PathBuf {
        self.meta.lock().save_path.clone()
    }

    pub fn set_save_path(&self, path: PathBuf) {
        self.meta.lock().save_path = path;
    }

    /// 最终文件路径：`save_path/filename`
    pub fn final_path(&self) -> PathBuf {
        let meta = self.meta.lock();
        meta.save_path.join(&meta.filename)
    }

    pub fn category(&self) -> String {
        self.meta.lock().category.clone()
    }

    pub fn set_category(&self, category: &str) {
        self.meta.lock().category = category.to_string();
    }

    pub fn status(&self) -> DownloadStatus {
        DownloadStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: DownloadStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    pub fn total_size(&self) -> i64 {
        self.total_size.load(Ordering::Acquire)
    }

    pub fn set_total_size(&self, size: i64) {
        self.total_size.store(size, Ordering::Release);
    }

    pub fn downloaded_size(&self) -> i64 {
        self.downloaded_size.load(Ordering::Acquire)
    }

    pub fn set_downloaded_size(&self, size: i64) {
        self.downloaded_size.store(size, Ordering::Release);
    }

    pub fn error_message(&self) -> String {
        self.meta.lock().error_message.clone()
    }

    pub fn set_error_message(&self, msg: &str) {
        self.meta.lock().error_message = msg.to_string();
    }

    pub fn last_try_time(&self) -> String {
        self.meta.lock().last_try_time.clone()
    }

    pub fn update_last_try_time(&self) {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M").to_string();
        self.meta.lock().last_try_time = now;
    }

    pub fn is_external_helper(&self) -> bool {
        self.is_external_helper.load(Ordering::Acquire)
    }

    pub fn set_external_helper(&self, value: bool) {
        self.is_external_helper.store(value, Ordering::Release);
    }

    // ========================================================================
    // 进度
    // ========================================================================

    /// 初始化分段（清掉旧的）
    pub fn initialize_chunks(&self, connections: usize) {
        let total = self.total_size();
        let mut chunks = self.chunks.lock();
        *chunks = build_chunks(total, connections);
        drop(chunks);
        self.recalculate_from_chunks();
    }

    /// 推进一个分段的进度，越过末尾自动置完成，随后重算总进度
    pub fn update_chunk(&self, index: usize, current: i64) {
        {
            let mut chunks = self.chunks.lock();
            if let Some(chunk) = chunks.get_mut(index) {
                chunk.advance_to(current);
            }
        }
        self.recalculate_from_chunks();
    }

    pub fn chunks_copy(&self) -> Vec<Chunk> {
        self.chunks.lock().clone()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn set_chunks(&self, chunks: Vec<Chunk>) {
        *self.chunks.lock() = chunks;
        self.recalculate_from_chunks();
    }

    /// 从分段向量重算 `downloaded_size`
    ///
    /// 已完成但计数不足整段的分段补齐差额（续传对账后 current 可能
    /// 停在段内，但磁盘上数据是完整的）
    pub fn recalculate_from_chunks(&self) {
        let chunks = self.chunks.lock();
        let mut total: i64 = 0;
        for chunk in chunks.iter() {
            let counted = chunk.downloaded();
            total += counted;
            if chunk.completed && chunk.end >= 0 {
                let full = chunk.end - chunk.start + 1;
                if counted < full {
                    total += full - counted;
                }
            }
        }
        drop(chunks);
        self.downloaded_size.store(total, Ordering::Release);
    }

    /// 进度百分比；助手驱动的任务优先使用覆盖值
    pub fn progress(&self) -> f64 {
        let manual = *self.progress_override.lock();
        if manual >= 0.0 {
            return manual;
        }
        let total = self.total_size();
        if total <= 0 {
            return 0.0;
        }
        self.downloaded_size() as f64 / total as f64 * 100.0
    }

    /// 设置进度覆盖值（外部助手专用），-1 关闭覆盖
    pub fn set_progress_override(&self, progress: f64) {
        *self.progress_override.lock() = progress;
    }

    /// 预计剩余秒数；速度为 0 或大小未知时为 None
    pub fn eta_secs(&self) -> Option<u64> {
        let speed = self.speed();
        let total = self.total_size();
        if speed <= 0.0 || total <= 0 {
            return None;
        }
        let remaining = total - self.downloaded_size();
        if remaining <= 0 {
            return Some(0);
        }
        Some((remaining as f64 / speed) as u64)
    }

    // ========================================================================
    // 速度（EMA 平滑）
    // ========================================================================

    /// 更新速度采样
    ///
    /// 前 3 个样本用简单平均建立基线，之后按 α=0.2 做指数平滑；
    /// 整个读-改-写在 speed 锁内完成
    pub fn set_speed(&self, sample: f64) {
        let mut state = self.speed.lock();
        if state.samples < SPEED_WARMUP_SAMPLES {
            state.smoothed =
                (state.smoothed * state.samples as f64 + sample) / (state.samples + 1) as f64;
            state.samples += 1;
        } else {
            state.smoothed = SPEED_EMA_ALPHA * sample + (1.0 - SPEED_EMA_ALPHA) * state.smoothed;
        }
    }

    pub fn speed(&self) -> f64 {
        self.speed.lock().smoothed
    }

    pub fn reset_speed(&self) {
        let mut state = self.speed.lock();
        state.smoothed = 0.0;
        state.samples = 0;
    }

    // ========================================================================
    // 重试
    // ========================================================================

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Acquire)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.load(Ordering::Acquire)
    }

    pub fn set_max_retries(&self, value: u32) {
        self.max_retries.store(value, Ordering::Release);
    }

    /// 是否允许重试：处于 Error 且次数未用完
    pub fn should_retry(&self) -> bool {
        self.status() == DownloadStatus::Error && self.retry_count() < self.max_retries()
    }

    /// 当前重试档位的延迟：`min(1000 * 2^min(rc, 5), 60000)` ms
    pub fn retry_delay_ms(&self) -> u64 {
        let capped = self.retry_count().min(5);
        (RETRY_BASE_DELAY_MS << capped).min(RETRY_MAX_DELAY_MS)
    }

    /// 递增重试计数并记录下一次允许重试的时刻
    pub fn increment_retry(&self) {
        let previous = self.retry_count.fetch_add(1, Ordering::AcqRel);
        let capped = (previous + 1).min(5);
        let delay = (RETRY_BASE_DELAY_MS << capped).min(RETRY_MAX_DELAY_MS);
        self.meta.lock().next_retry_at = Some(Instant::now() + Duration::from_millis(delay));
    }

    /// 清零重试状态（成功或用户主动恢复时）
    pub fn reset_retry(&self) {
        self.retry_count.store(0, Ordering::Release);
        self.meta.lock().next_retry_at = None;
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.meta.lock().next_retry_at
    }

    // ========================================================================
    // 校验和
    // ========================================================================

    pub fn set_expected_checksum(&self, kind: ChecksumKind, hex: &str) {
        self.meta.lock().expected_checksum = Some((kind, hex.to_ascii_lowercase()));
    }

    pub fn expected_checksum(&self) -> Option<(ChecksumKind, String)> {
        self.meta.lock().expected_checksum.clone()
    }

    pub fn set_calculated_checksum(&self, hex: &str) {
        self.meta.lock().calculated_checksum = hex.to_string();
    }

    pub fn calculated_checksum(&self) -> String {
        self.meta.lock().calculated_checksum.clone()
    }

    // ========================================================================
    // 持久化
    // ========================================================================

    /// 导出为可序列化的快照
    pub fn snapshot(&self) -> TaskSnapshot {
        let meta = self.meta.lock();
        TaskSnapshot {
            id: self.id,
            url: meta.url.clone(),
            referer: meta.referer.clone(),
            filename: meta.filename.clone(),
            save_path: meta.save_path.clone(),
            category: meta.category.clone(),
            status: self.status(),
            total_size: self.total_size(),
            downloaded_size: self.downloaded_size(),
            retry_count: self.retry_count(),
            max_retries: self.max_retries(),
            is_external_helper: self.is_external_helper(),
            error_message: meta.error_message.clone(),
            last_try_time: meta.last_try_time.clone(),
            expected_checksum: meta.expected_checksum.clone(),
            chunks: self.chunks.lock().clone(),
        }
    }

    /// 从快照恢复任务
    pub fn from_snapshot(snapshot: TaskSnapshot) -> Self {
        let task = Self {
            id: snapshot.id,
            status: AtomicU8::new(snapshot.status.as_u8()),
            total_size: AtomicI64::new(snapshot.total_size),
            downloaded_size: AtomicI64::new(snapshot.downloaded_size),
            retry_count: AtomicU32::new(snapshot.retry_count),
            max_retries: AtomicU32::new(snapshot.max_retries),
            is_external_helper: AtomicBool::new(snapshot.is_external_helper),
            progress_override: Mutex::new(-1.0),
            speed: Mutex::new(SpeedState::default()),
            chunks: Mutex::new(snapshot.chunks),
            meta: Mutex::new(TaskMeta {
                url: snapshot.url,
                referer: snapshot.referer,
                filename: snapshot.filename,
                save_path: snapshot.save_path,
                category: snapshot.category,
                error_message: snapshot.error_message,
                last_try_time: snapshot.last_try_time,
                next_retry_at: None,
                expected_checksum: snapshot.expected_checksum,
                calculated_checksum: String::new(),
            }),
        };
        task.recalculate_from_chunks();
        task
    }
}

/// 任务快照（注册表文档中的形态）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: u64,
    pub url: String,
    #[serde(default)]
    pub referer: String,
    pub filename: String,
    pub save_path: PathBuf,
    #[serde(default)]
    pub category: String,
    pub status: DownloadStatus,
    #[serde(default = "default_total_size")]
    pub total_size: i64,
    #[serde(default)]
    pub downloaded_size: i64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub is_external_helper: bool,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub last_try_time: String,
    #[serde(default)]
    pub expected_checksum: Option<(ChecksumKind, String)>,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
}

fn default_total_size() -> i64 {
    -1
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_task() -> DownloadTask {
        DownloadTask::new(1, "https://example.com/file.zip", PathBuf::from("/tmp"))
    }

    #[test]
    fn test_new_task_defaults() {
        let task = make_task();
        assert_eq!(task.status(), DownloadStatus::Queued);
        assert_eq!(task.filename(), "file.zip");
        assert_eq!(task.referer(), "https://example.com/");
        assert_eq!(task.total_size(), -1);
        assert_eq!(task.downloaded_size(), 0);
        assert_eq!(task.progress(), 0.0);
    }

    #[test]
    fn test_progress_identity() {
        let task = make_task();
        task.set_total_size(1000);
        task.initialize_chunks(4);

        // downloaded == Σ max(0, current - start)
        task.update_chunk(0, 100);
        task.update_chunk(1, 300);
        assert_eq!(task.downloaded_size(), 100 + 50);
        assert!(task.downloaded_size() <= 1000);

        // 全部推到末尾后等于 total
        let chunks = task.chunks_copy();
        for (i, c) in chunks.iter().enumerate() {
            task.update_chunk(i, c.end + 1);
        }
        assert_eq!(task.downloaded_size(), 1000);
        assert_eq!(task.progress(), 100.0);
    }

    #[test]
    fn test_completed_chunk_correction() {
        let task = make_task();
        task.set_total_size(200);
        let mut chunks = build_chunks(200, 2);
        // 标记完成但 current 停在段内（续传对账的产物）
        chunks[0].completed = true;
        chunks[0].current = 50;
        task.set_chunks(chunks);
        // 第一段按整段 100 计
        assert_eq!(task.downloaded_size(), 100);
    }

    #[test]
    fn test_speed_ema() {
        let task = make_task();
        // 前 3 个样本是简单平均
        task.set_speed(100.0);
        assert!((task.speed() - 100.0).abs() < 1e-9);
        task.set_speed(200.0);
        assert!((task.speed() - 150.0).abs() < 1e-9);
        task.set_speed(300.0);
        assert!((task.speed() - 200.0).abs() < 1e-9);

        // 之后按 EMA：0.2*400 + 0.8*200 = 240
        task.set_speed(400.0);
        assert!((task.speed() - 240.0).abs() < 1e-9);

        task.reset_speed();
        assert_eq!(task.speed(), 0.0);
    }

    #[test]
    fn test_retry_policy() {
        let task = make_task();
        assert_eq!(task.retry_delay_ms(), 1000);

        task.set_status(DownloadStatus::Error);
        assert!(task.should_retry());

        for _ in 0..5 {
            task.increment_retry();
        }
        assert_eq!(task.retry_count(), 5);
        assert!(!task.should_retry());
        assert!(task.next_retry_at().is_some());

        // 指数封顶在 2^5
        for _ in 0..10 {
            task.increment_retry();
        }
        assert_eq!(task.retry_delay_ms(), 32_000);

        task.reset_retry();
        assert_eq!(task.retry_count(), 0);
        assert!(task.next_retry_at().is_none());
    }

    #[test]
    fn test_progress_override() {
        let task = make_task();
        task.set_total_size(1000);
        task.set_progress_override(42.5);
        assert_eq!(task.progress(), 42.5);
        // -1 关闭覆盖
        task.set_progress_override(-1.0);
        assert_eq!(task.progress(), 0.0);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let task = make_task();
        task.set_total_size(1000);
        task.initialize_chunks(2);
        task.update_chunk(0, 123);
        task.set_status(DownloadStatus::Paused);
        task.set_category("Compressed");
        task.set_error_message("boom");

        let snapshot = task.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: TaskSnapshot = serde_json::from_str(&json).unwrap();
        let restored = DownloadTask::from_snapshot(parsed);

        assert_eq!(restored.id(), 1);
        assert_eq!(restored.status(), DownloadStatus::Paused);
        assert_eq!(restored.total_size(), 1000);
        assert_eq!(restored.downloaded_size(), 123);
        assert_eq!(restored.category(), "Compressed");
        assert_eq!(restored.error_message(), "boom");
        assert_eq!(restored.chunks_copy().len(), 2);
    }

    #[test]
    fn test_snapshot_tolerant_parse() {
        // 缺字段、多字段都能解析
        let json = r#"{
            "id": 7,
            "url": "https://example.com/a.bin",
            "filename": "a.bin",
            "save_path": "/tmp",
            "status": "queued",
            "unknown_field": {"x": 1}
        }"#;
        let snapshot: TaskSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.id, 7);
        assert_eq!(snapshot.total_size, -1);
        assert_eq!(snapshot.max_retries, DEFAULT_MAX_RETRIES);
        assert!(snapshot.chunks.is_empty());
    }
}
