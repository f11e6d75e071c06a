//! 下载管理器
//!
//! 对外的唯一门面：收 URL、建任务、分派给引擎或外部助手、维护
//! 队列与调度窗口、把每次状态迁移写回注册表。持有任务表的就是它，
//! 引擎只认 `Arc<DownloadTask>`。

use crate::config::AppConfig;
use crate::downloader::chunk;
use crate::downloader::engine::DownloadEngine;
use crate::downloader::helper::HelperAdapter;
use crate::downloader::scheduler::{EndAction, Schedule, ScheduleEvent};
use crate::downloader::task::{DownloadStatus, DownloadTask};
use crate::downloader::UpdateCallback;
use crate::error::DownloadError;
use crate::store::RegistryStore;
use crate::transport::SessionConfig;
use crate::urlutil;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// remove 时等待任务收尾的上限
const REMOVE_WAIT_MS: u64 = 5000;

/// 注册表的周期落盘间隔
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// 调度 tick 间隔
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// 窗口结束动作的回调
pub type ScheduleActionCallback = Arc<dyn Fn(EndAction) + Send + Sync>;

/// 下载管理器
pub struct DownloadManager {
    /// 所有任务，按 id 升序（入队顺序）
    tasks: parking_lot::RwLock<BTreeMap<u64, Arc<DownloadTask>>>,
    engine: Arc<DownloadEngine>,
    helper: Arc<HelperAdapter>,
    store: Arc<RegistryStore>,
    default_save_path: parking_lot::RwLock<PathBuf>,
    /// 下一个分配的 id；只增不减，跨进程由注册表设置保证
    next_id: AtomicU64,
    queue_running: AtomicBool,
    max_concurrent: AtomicUsize,
    schedule: parking_lot::Mutex<Schedule>,
    update_cb: parking_lot::Mutex<Option<UpdateCallback>>,
    action_cb: parking_lot::Mutex<Option<ScheduleActionCallback>>,
    /// 后台循环的停机令牌
    shutdown: CancellationToken,
}

impl DownloadManager {
    /// 创建管理器并从注册表恢复任务
    pub fn new(config: &AppConfig, store: Arc<RegistryStore>) -> Result<Arc<Self>, DownloadError> {
        let session = SessionConfig {
            user_agent: config.download.user_agent.clone(),
            proxy: config.proxy_url(),
            verify_tls: config.download.verify_tls,
        };
        let engine = Arc::new(DownloadEngine::new(session, config.download.max_connections)?);
        engine.set_speed_limit(config.download.speed_limit_kb as i64 * 1024);

        // 从注册表恢复（Downloading 在 store 加载时已降为 Paused）
        let doc = store.load();
        let mut tasks = BTreeMap::new();
        let mut max_id: u64 = 0;
        for snapshot in doc.downloads {
            max_id = max_id.max(snapshot.id);
            let task = Arc::new(DownloadTask::from_snapshot(snapshot));
            tasks.insert(task.id(), task);
        }
        let next_id = (store.get_setting_i64("next_id", 1).max(0) as u64).max(max_id + 1);

        info!(
            "下载管理器就绪: 恢复 {} 个任务, next_id={}, 下载目录={:?}",
            tasks.len(),
            next_id,
            config.download.download_dir
        );

        let manager = Arc::new(Self {
            tasks: parking_lot::RwLock::new(tasks),
            engine,
            helper: Arc::new(HelperAdapter::new()),
            store,
            default_save_path: parking_lot::RwLock::new(config.download.download_dir.clone()),
            next_id: AtomicU64::new(next_id),
            queue_running: AtomicBool::new(false),
            max_concurrent: AtomicUsize::new(config.download.max_concurrent_tasks.max(1)),
            schedule: parking_lot::Mutex::new(Schedule::default()),
            update_cb: parking_lot::Mutex::new(None),
            action_cb: parking_lot::Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        manager.ensure_category_folders();
        manager.wire_callbacks();
        manager.spawn_background_loops();
        Ok(manager)
    }

    pub fn engine(&self) -> Arc<DownloadEngine> {
        self.engine.clone()
    }

    pub fn set_update_callback(&self, cb: UpdateCallback) {
        *self.update_cb.lock() = Some(cb);
    }

    pub fn set_schedule_action_callback(&self, cb: ScheduleActionCallback) {
        *self.action_cb.lock() = Some(cb);
    }

    /// 分类子文件夹（不存在则补建）
    fn ensure_category_folders(&self) {
        let base = self.default_save_path.read().clone();
        let _ = std::fs::create_dir_all(&base);
        for category in urlutil::DEFAULT_CATEGORIES {
            let _ = std::fs::create_dir_all(base.join(category));
        }
    }

    /// 引擎/助手的回调接回管理器：落盘、刷 UI、补队列空位
    fn wire_callbacks(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let completion = {
            let weak = weak.clone();
            Arc::new(move |id: u64, _success: bool, _message: &str| {
                let Some(manager) = weak.upgrade() else { return };
                if let Some(task) = manager.get(id) {
                    manager.persist(&task);
                }
                manager.fire_update(id);
                // 无论成败都补位，空出的槽让给下一个排队任务
                manager.process_queue();
            }) as crate::downloader::CompletionCallback
        };
        self.engine.set_completion_callback(completion.clone());
        self.helper.set_completion_callback(completion);

        let weak_progress = weak;
        self.engine.set_progress_callback(Arc::new(
            move |id: u64, _downloaded: i64, _total: i64, _speed: f64| {
                if let Some(manager) = weak_progress.upgrade() {
                    manager.fire_update(id);
                }
            },
        ));
    }

    fn spawn_background_loops(self: &Arc<Self>) {
        // 1 Hz 调度 tick：查窗口 + 补队列
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SCHEDULER_TICK);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(manager) = weak.upgrade() else { break };
                manager.check_schedule();
                if manager.is_queue_running() {
                    manager.process_queue();
                }
            }
        });

        // 周期落盘：把所有任务快照写回注册表
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(manager) = weak.upgrade() else { break };
                manager.persist_all();
                if let Err(e) = manager.store.flush().await {
                    warn!("注册表落盘失败: {}", e);
                }
            }
        });
    }

    fn fire_update(&self, id: u64) {
        if let Some(cb) = self.update_cb.lock().clone() {
            cb(id);
        }
    }

    // ========================================================================
    // 任务生命周期
    // ========================================================================

    /// 新建下载
    ///
    /// URL 过校验后分配 id、推导文件名和分类、按分类路由保存目录；
    /// 视频站点 URL 标记为外部助手任务并固定进 Video 文件夹
    pub fn add(
        &self,
        url: &str,
        referer: Option<&str>,
        save_dir: Option<PathBuf>,
    ) -> Result<u64, DownloadError> {
        urlutil::validate_url(url)?;

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.store.set_setting("next_id", &(id + 1).to_string());

        let default_dir = self.default_save_path.read().clone();
        let task = DownloadTask::new(id, url, default_dir.clone());
        if let Some(referer) = referer {
            if !referer.is_empty() {
                task.set_referer(referer);
            }
        }

        let category = urlutil::classify_filename(&task.filename(), &self.extension_map());
        task.set_category(&category);

        if HelperAdapter::is_video_site_url(url) {
            task.set_external_helper(true);
            task.set_category("Video");
            task.set_save_path(default_dir.join("Video"));
        } else if let Some(dir) = save_dir {
            task.set_save_path(dir);
        } else if category != urlutil::CATEGORY_ALL {
            task.set_save_path(default_dir.join(&category));
        }

        info!(
            "新建任务 {}: {} → {:?}（分类 {}{}）",
            id,
            url,
            task.save_path(),
            task.category(),
            if task.is_external_helper() { ", 外部助手" } else { "" }
        );

        let task = Arc::new(task);
        self.tasks.write().insert(id, task.clone());
        self.persist(&task);
        Ok(id)
    }

    pub fn get(&self, id: u64) -> Option<Arc<DownloadTask>> {
        self.tasks.read().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<DownloadTask>> {
        self.tasks.read().values().cloned().collect()
    }

    pub fn by_status(&self, status: DownloadStatus) -> Vec<Arc<DownloadTask>> {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status() == status)
            .cloned()
            .collect()
    }

    pub fn by_category(&self, category: &str) -> Vec<Arc<DownloadTask>> {
        self.tasks
            .read()
            .values()
            .filter(|t| category == urlutil::CATEGORY_ALL || t.category() == category)
            .cloned()
            .collect()
    }

    /// 启动一个任务
    pub fn start(&self, id: u64) -> bool {
        let Some(task) = self.get(id) else { return false };
        let started = if task.is_external_helper() {
            self.helper.start(task.clone())
        } else {
            self.engine.start(task.clone())
        };
        if started {
            self.persist(&task);
        }
        started
    }

    /// 以指定格式启动（只对助手任务有意义，普通任务等同 start）
    pub fn start_with_format(&self, id: u64, format_id: &str) -> bool {
        let Some(task) = self.get(id) else { return false };
        if !task.is_external_helper() {
            return self.start(id);
        }
        let started = self
            .helper
            .start_with_format(task.clone(), Some(format_id.to_string()));
        if started {
            self.persist(&task);
        }
        started
    }

    pub fn pause(&self, id: u64) {
        let Some(task) = self.get(id) else { return };
        if task.is_external_helper() {
            self.helper.pause(id);
            task.set_status(DownloadStatus::Paused);
        } else {
            self.engine.pause(&task);
        }
        self.persist(&task);
        self.fire_update(id);
    }

    pub fn resume(&self, id: u64) -> bool {
        let Some(task) = self.get(id) else { return false };
        let resumed = if task.is_external_helper() {
            match task.status() {
                DownloadStatus::Completed | DownloadStatus::Downloading => false,
                _ => {
                    task.reset_retry();
                    task.set_error_message("");
                    self.helper.start(task.clone())
                }
            }
        } else {
            self.engine.resume(task.clone())
        };
        if resumed {
            self.persist(&task);
        }
        resumed
    }

    pub fn cancel(&self, id: u64) {
        let Some(task) = self.get(id) else { return };
        if task.is_external_helper() {
            self.helper.cancel(id);
            task.set_status(DownloadStatus::Cancelled);
        } else {
            self.engine.cancel(&task);
        }
        self.persist(&task);
        self.fire_update(id);
    }

    /// 删除任务
    ///
    /// 仍在下载时先取消，最多等 5 秒让任务收尾（文件句柄释放后才能
    /// 删文件）；`delete_file` 时连最终文件和所有 `.partN` 一起删
    pub async fn remove(&self, id: u64, delete_file: bool) {
        let task = self.tasks.write().remove(&id);
        let Some(task) = task else { return };

        if task.status() == DownloadStatus::Downloading {
            if task.is_external_helper() {
                self.helper.cancel(id);
                task.set_status(DownloadStatus::Cancelled);
            } else {
                self.engine.cancel(&task);
            }
        }

        let finished = if task.is_external_helper() {
            self.helper.wait_finish(id, REMOVE_WAIT_MS).await
        } else {
            self.engine.wait_finish(id, REMOVE_WAIT_MS).await
        };
        if !finished {
            warn!("任务 {} 未在 {}ms 内收尾，继续删除", id, REMOVE_WAIT_MS);
        }

        if delete_file {
            let final_path = task.final_path();
            let _ = tokio::fs::remove_file(&final_path).await;
            let count = task.chunk_count().max(chunk::MAX_PARALLEL_SEGMENTS);
            chunk::remove_part_files(&final_path, count).await;
        }

        self.store.delete_download(id);
        if let Err(e) = self.store.flush().await {
            warn!("删除任务后落盘失败: {}", e);
        }
        info!("任务 {} 已删除（delete_file={}）", id, delete_file);
    }

    /// 等待任务的下载/助手退出
    pub async fn wait_finish(&self, id: u64, timeout_ms: u64) -> bool {
        match self.get(id) {
            Some(task) if task.is_external_helper() => {
                self.helper.wait_finish(id, timeout_ms).await
            }
            _ => self.engine.wait_finish(id, timeout_ms).await,
        }
    }

    // ========================================================================
    // 批量操作
    // ========================================================================

    pub fn start_all(&self) {
        let to_start: Vec<_> = self
            .tasks
            .read()
            .values()
            .filter(|t| {
                matches!(
                    t.status(),
                    DownloadStatus::Queued | DownloadStatus::Paused
                )
            })
            .map(|t| t.id())
            .collect();
        for id in to_start {
            self.start(id);
        }
    }

    pub fn pause_all(&self) {
        let to_pause: Vec<_> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.status() == DownloadStatus::Downloading)
            .map(|t| t.id())
            .collect();
        for id in to_pause {
            self.pause(id);
        }
    }

    pub fn cancel_all(&self) {
        let to_cancel: Vec<_> = self
            .tasks
            .read()
            .values()
            .filter(|t| {
                matches!(
                    t.status(),
                    DownloadStatus::Downloading | DownloadStatus::Paused
                )
            })
            .map(|t| t.id())
            .collect();
        for id in to_cancel {
            self.cancel(id);
        }
    }

    // ========================================================================
    // 队列与调度
    // ========================================================================

    pub fn start_queue(&self) {
        self.queue_running.store(true, Ordering::Release);
        info!("队列已启动");
        self.process_queue();
    }

    /// 停止队列：只是不再放新任务，已在跑的不动
    pub fn stop_queue(&self) {
        self.queue_running.store(false, Ordering::Release);
        info!("队列已停止");
    }

    pub fn is_queue_running(&self) -> bool {
        self.queue_running.load(Ordering::Acquire)
    }

    pub fn set_max_concurrent(&self, value: usize) {
        self.max_concurrent.store(value.max(1), Ordering::Release);
    }

    /// 队列准入
    ///
    /// 一次锁内完成「数活跃 + 提升排队任务」，避免数完再启动之间
    /// 的竞态；按 id 顺序提升
    pub fn process_queue(&self) {
        if !self.is_queue_running() {
            return;
        }

        let tasks = self.tasks.read();
        let max = self.max_concurrent.load(Ordering::Acquire);
        let mut active = tasks
            .values()
            .filter(|t| t.status() == DownloadStatus::Downloading)
            .count();

        for task in tasks.values() {
            if active >= max {
                break;
            }
            if task.status() != DownloadStatus::Queued {
                continue;
            }
            let started = if task.is_external_helper() {
                self.helper.start(task.clone())
            } else {
                self.engine.start(task.clone())
            };
            if started {
                debug!("队列提升任务 {}（活跃 {}/{}）", task.id(), active + 1, max);
                active += 1;
            }
        }
    }

    /// 配置调度窗口
    pub fn set_schedule(
        &self,
        start_enabled: bool,
        start_at: chrono::NaiveTime,
        stop_enabled: bool,
        stop_at: chrono::NaiveTime,
        max_concurrent: usize,
        action: EndAction,
    ) {
        self.schedule
            .lock()
            .configure(start_enabled, start_at, stop_enabled, stop_at, action);
        self.set_max_concurrent(max_concurrent);
    }

    /// 每秒调用：窗口沿触发启停
    pub fn check_schedule(&self) {
        let now = chrono::Local::now().time();
        let event = self.schedule.lock().check(now, self.is_queue_running());
        match event {
            Some(ScheduleEvent::StartQueue) => {
                info!("调度窗口到点，启动队列");
                self.start_queue();
            }
            Some(ScheduleEvent::StopQueue(action)) => {
                info!("调度窗口结束，停止队列（动作: {:?}）", action);
                self.stop_queue();
                if action != EndAction::None {
                    if let Some(cb) = self.action_cb.lock().clone() {
                        cb(action);
                    }
                }
            }
            None => {}
        }
    }

    // ========================================================================
    // 统计
    // ========================================================================

    pub fn total_downloads(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn active_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status() == DownloadStatus::Downloading)
            .count()
    }

    /// 所有下载中任务的速度之和（bytes/s）
    pub fn total_speed(&self) -> f64 {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status() == DownloadStatus::Downloading)
            .map(|t| t.speed())
            .sum()
    }

    // ========================================================================
    // 设置与持久化
    // ========================================================================

    /// 把注册表里的运行时设置应用到引擎
    pub fn apply_store_settings(&self) {
        let connections = self.store.get_setting_i64("max_connections", 8);
        self.engine.set_max_connections(connections.max(1) as usize);

        let speed_limit_kb = self.store.get_setting_i64("speed_limit_kb", 0);
        self.engine.set_speed_limit(speed_limit_kb.max(0) * 1024);

        let max_concurrent = self.store.get_setting_i64("max_concurrent_tasks", 3);
        self.set_max_concurrent(max_concurrent.max(1) as usize);
    }

    /// 分类扩展名表：store 设置覆盖默认
    fn extension_map(&self) -> Vec<(String, Vec<String>)> {
        urlutil::default_extension_map()
            .into_iter()
            .map(|(category, default_csv)| {
                let key = format!("file_types_{}", category.to_ascii_lowercase());
                let csv = self.store.get_setting(&key, default_csv);
                (category.to_string(), urlutil::parse_extensions(&csv))
            })
            .collect()
    }

    fn persist(&self, task: &Arc<DownloadTask>) {
        self.store.upsert_download(task.snapshot());
    }

    /// 全量快照写回注册表（不触发写盘）
    pub fn persist_all(&self) {
        let snapshots: Vec<_> = self
            .tasks
            .read()
            .values()
            .map(|t| t.snapshot())
            .collect();
        self.store.replace_all(snapshots);
    }

    /// 有序停机：停掉后台循环，取消活跃下载，最后一次落盘
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.stop_queue();

        let active: Vec<_> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.status() == DownloadStatus::Downloading)
            .map(|t| t.id())
            .collect();
        for id in active {
            self.pause(id);
        }

        self.persist_all();
        if let Err(e) = self.store.force_flush().await {
            warn!("停机落盘失败: {}", e);
        }
        info!("下载管理器已停机");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::task::DownloadStatus;
    use tempfile::TempDir;

    fn make_manager(dir: &TempDir) -> Arc<DownloadManager> {
        let store = Arc::new(RegistryStore::open(dir.path().join("registry.json")).unwrap());
        let mut config = AppConfig::default();
        config.download.download_dir = dir.path().join("downloads");
        DownloadManager::new(&config, store).unwrap()
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_url() {
        let dir = TempDir::new().unwrap();
        let manager = make_manager(&dir);

        assert!(manager.add("ftp:/broken", None, None).is_err());
        assert!(manager
            .add("https://example.com/playlist.m3u8", None, None)
            .is_err());
        assert_eq!(manager.total_downloads(), 0);
    }

    #[tokio::test]
    async fn test_id_monotonicity_across_remove() {
        let dir = TempDir::new().unwrap();
        let manager = make_manager(&dir);

        let id1 = manager.add("https://example.com/a.zip", None, None).unwrap();
        let id2 = manager.add("https://example.com/b.zip", None, None).unwrap();
        assert!(id2 > id1);

        manager.remove(id2, false).await;
        let id3 = manager.add("https://example.com/c.zip", None, None).unwrap();
        // 新 id 严格大于注册表里出现过的最大 id
        assert!(id3 > id2);
    }

    #[tokio::test]
    async fn test_category_routing() {
        let dir = TempDir::new().unwrap();
        let manager = make_manager(&dir);

        let id = manager
            .add("https://example.com/archive.zip", None, None)
            .unwrap();
        let task = manager.get(id).unwrap();
        assert_eq!(task.category(), "Compressed");
        assert!(task.save_path().ends_with("Compressed"));

        // 显式目录优先于分类路由
        let custom = dir.path().join("custom");
        let id = manager
            .add("https://example.com/b.zip", None, Some(custom.clone()))
            .unwrap();
        assert_eq!(manager.get(id).unwrap().save_path(), custom);
    }

    #[tokio::test]
    async fn test_helper_url_routed_to_video() {
        let dir = TempDir::new().unwrap();
        let manager = make_manager(&dir);

        let id = manager
            .add("https://www.youtube.com/watch?v=abc", None, None)
            .unwrap();
        let task = manager.get(id).unwrap();
        assert!(task.is_external_helper());
        assert_eq!(task.category(), "Video");
        assert!(task.save_path().ends_with("Video"));
    }

    #[tokio::test]
    async fn test_referer_threaded_through_add() {
        let dir = TempDir::new().unwrap();
        let manager = make_manager(&dir);

        let id = manager
            .add(
                "https://cdn.example.com/file.zip",
                Some("https://page.example.com/article"),
                None,
            )
            .unwrap();
        assert_eq!(
            manager.get(id).unwrap().referer(),
            "https://page.example.com/article"
        );

        // 未提供时默认为 URL 来源
        let id = manager.add("https://cdn.example.com/b.zip", None, None).unwrap();
        assert_eq!(manager.get(id).unwrap().referer(), "https://cdn.example.com/");
    }

    #[tokio::test]
    async fn test_tasks_restored_from_store() {
        let dir = TempDir::new().unwrap();
        let registry_path = dir.path().join("registry.json");

        {
            let store = Arc::new(RegistryStore::open(&registry_path).unwrap());
            let mut config = AppConfig::default();
            config.download.download_dir = dir.path().join("downloads");
            let manager = DownloadManager::new(&config, store).unwrap();
            manager.add("https://example.com/a.zip", None, None).unwrap();
            manager.add("https://example.com/b.pdf", None, None).unwrap();
            manager.shutdown().await;
        }

        let store = Arc::new(RegistryStore::open(&registry_path).unwrap());
        let mut config = AppConfig::default();
        config.download.download_dir = dir.path().join("downloads");
        let manager = DownloadManager::new(&config, store).unwrap();

        assert_eq!(manager.total_downloads(), 2);
        let id = manager.add("https://example.com/c.txt", None, None).unwrap();
        assert_eq!(id, 3);
    }

    #[tokio::test]
    async fn test_process_queue_bounds_concurrency() {
        use axum::body::Body;
        use axum::extract::Path;
        use axum::http::StatusCode;
        use axum::response::Response;
        use axum::routing::get;
        use axum::Router;

        // 慢速源站：保证任务长时间处于 Downloading
        async fn slow(Path(_name): Path<String>) -> Response {
            let stream = futures::stream::unfold(0u32, |i| async move {
                if i >= 600 {
                    return None;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                Some((Ok::<_, std::io::Error>(vec![0u8; 256]), i + 1))
            });
            Response::builder()
                .status(StatusCode::OK)
                .body(Body::from_stream(stream))
                .unwrap()
        }

        let app = Router::new().route("/:name", get(slow));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = TempDir::new().unwrap();
        let manager = make_manager(&dir);
        manager.set_max_concurrent(2);

        for name in ["a.bin", "b.bin", "c.bin"] {
            manager
                .add(&format!("http://{}/{}", addr, name), None, None)
                .unwrap();
        }

        manager.start_queue();
        // 给 probe 和启动一点时间
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert_eq!(manager.active_count(), 2);
        assert_eq!(manager.by_status(DownloadStatus::Queued).len(), 1);

        manager.cancel_all();
        for task in manager.all() {
            manager.wait_finish(task.id(), 5_000).await;
        }
    }

    #[tokio::test]
    async fn test_status_persisted_on_pause() {
        let dir = TempDir::new().unwrap();
        let manager = make_manager(&dir);

        let id = manager.add("https://example.com/a.zip", None, None).unwrap();
        manager.pause(id);

        let doc = manager.store.load();
        assert_eq!(doc.downloads[0].status, DownloadStatus::Paused);
        assert_eq!(doc.downloads[0].id, id);
    }
}
