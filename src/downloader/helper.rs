//! 外部助手适配器（yt-dlp）
//!
//! 视频站点的 URL 不走引擎的传输层，而是交给 yt-dlp 子进程。
//! 适配器负责：站点识别、拉起子进程、逐行解析 stdout 更新进度、
//! 两分钟无输出的看门狗、杀进程式的暂停/取消。恢复靠 yt-dlp 自己
//! 的 `-c` 续传语义。

use crate::downloader::task::{DownloadStatus, DownloadTask};
use crate::downloader::CompletionCallback;
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 无输出看门狗：超过这个时长没有任何 stdout 行就杀掉子进程
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(120);

/// wait_finish 的轮询间隔
const WAIT_POLL_MS: u64 = 50;

/// 需要交给助手处理的站点（按 host 子串匹配）
const VIDEO_SITE_PATTERNS: &[&str] = &[
    "youtube.com",
    "youtu.be",
    "vimeo.com",
    "dailymotion.com",
    "twitch.tv",
    "tiktok.com",
    "x.com",
    "twitter.com",
    "instagram.com",
    "facebook.com",
    "bilibili.com",
    "soundcloud.com",
];

/// 外部助手适配器
pub struct HelperAdapter {
    /// 助手可执行文件（默认走 PATH 上的 yt-dlp）
    binary: String,
    /// 运行中的助手任务（id → 取消令牌）
    running: Arc<DashMap<u64, CancellationToken>>,
    completion_cb: parking_lot::Mutex<Option<CompletionCallback>>,
}

impl HelperAdapter {
    pub fn new() -> Self {
        Self::with_binary("yt-dlp")
    }

    pub fn with_binary(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
            running: Arc::new(DashMap::new()),
            completion_cb: parking_lot::Mutex::new(None),
        }
    }

    pub fn set_completion_callback(&self, cb: CompletionCallback) {
        *self.completion_cb.lock() = Some(cb);
    }

    /// URL 是否属于视频站点
    pub fn is_video_site_url(url: &str) -> bool {
        let host = match url.find("://") {
            Some(pos) => {
                let rest = &url[pos + 3..];
                let end = rest.find('/').unwrap_or(rest.len());
                &rest[..end]
            }
            None => return false,
        };
        VIDEO_SITE_PATTERNS
            .iter()
            .any(|pattern| host.contains(pattern))
    }

    pub fn is_running(&self, id: u64) -> bool {
        self.running.contains_key(&id)
    }

    /// 启动助手下载
    pub fn start(self: &Arc<Self>, task: Arc<DownloadTask>) -> bool {
        self.start_with_format(task, None)
    }

    /// 以指定格式启动助手下载
    pub fn start_with_format(self: &Arc<Self>, task: Arc<DownloadTask>, format: Option<String>) -> bool {
        let id = task.id();
        let token = CancellationToken::new();
        match self.running.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!("助手任务 {} 已在运行，忽略重复启动", id);
                return false;
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(token.clone());
            }
        }

        task.set_status(DownloadStatus::Downloading);
        task.set_progress_override(0.0);
        task.update_last_try_time();

        let adapter = self.clone();
        tokio::spawn(async move {
            adapter.run_helper(task, format, token).await;
            adapter.running.remove(&id);
        });
        true
    }

    /// 暂停：直接杀进程，靠 `-c` 在下次启动时续传
    pub fn pause(&self, id: u64) {
        if let Some((_, token)) = self.running.remove(&id) {
            token.cancel();
            info!("助手任务 {} 已请求暂停（终止子进程）", id);
        }
    }

    /// 取消：同样杀进程
    pub fn cancel(&self, id: u64) {
        if let Some((_, token)) = self.running.remove(&id) {
            token.cancel();
            info!("助手任务 {} 已请求取消（终止子进程）", id);
        }
    }

    /// 等待助手任务退出，50ms 轮询
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

    /// 子进程全生命周期：拉起 → 逐行读 → 看门狗 → 收尾
    async fn run_helper(
        &self,
        task: Arc<DownloadTask>,
        format: Option<String>,
        token: CancellationToken,
    ) {
        let id = task.id();
        let url = task.url();
        let output_template = task.save_path().join("%(title)s.%(ext)s");

        let mut command = Command::new(&self.binary);
        command
            .arg("-o")
            .arg(&output_template)
            .arg("--newline")
            .arg("-c");
        if let Some(format_id) = &format {
            command.arg("-f").arg(format_id);
        }
        command
            .arg(&url)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("拉起助手失败: {}", e);
                task.set_status(DownloadStatus::Error);
                task.set_error_message("yt-dlp not installed");
                task.set_progress_override(-1.0);
                self.fire_completion(id, false, "yt-dlp not installed");
                return;
            }
        };

        info!("助手任务 {} 已拉起: {} {}", id, self.binary, url);

        let stdout = child.stdout.take();
        let mut lines = stdout.map(|out| BufReader::new(out).lines());
        let mut helper_error = String::new();
        let mut cancelled = false;

        // 读 stdout 直到流关闭；每行之间套看门狗超时
        if let Some(lines) = lines.as_mut() {
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    next = tokio::time::timeout(WATCHDOG_TIMEOUT, lines.next_line()) => next,
                };

                match next {
                    Ok(Ok(Some(line))) => {
                        if let Some(message) = parse_helper_line(&line, &task) {
                            helper_error = message;
                        }
                    }
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        warn!("读取助手输出失败: {}", e);
                        break;
                    }
                    Err(_) => {
                        // 看门狗超时：助手卡死
                        error!("助手任务 {} 超过 2 分钟无输出，终止", id);
                        helper_error = "helper produced no output".to_string();
                        let _ = child.kill().await;
                        break;
                    }
                }
            }
        }

        if cancelled {
            let _ = child.kill().await;
            let _ = child.wait().await;
            // 状态已由 pause/cancel 调用方设置
            info!("助手任务 {} 已终止（状态: {:?}）", id, task.status());
            self.fire_completion(id, false, "User Aborted");
            return;
        }

        let status = child.wait().await;
        match status {
            Ok(status) if status.success() && helper_error.is_empty() => {
                task.set_progress_override(100.0);
                task.set_status(DownloadStatus::Completed);
                task.reset_retry();
                info!("✓ 助手任务 {} 完成", id);
                self.fire_completion(id, true, "");
            }
            Ok(status) => {
                let message = if helper_error.is_empty() {
                    format!("helper exited with {}", status)
                } else {
                    helper_error
                };
                task.set_status(DownloadStatus::Error);
                task.set_error_message(&message);
                task.set_progress_override(-1.0);
                error!("✗ 助手任务 {} 失败: {}", id, message);
                self.fire_completion(id, false, &message);
            }
            Err(e) => {
                task.set_status(DownloadStatus::Error);
                task.set_error_message(&e.to_string());
                task.set_progress_override(-1.0);
                self.fire_completion(id, false, &e.to_string());
            }
        }
    }

    fn fire_completion(&self, id: u64, success: bool, message: &str) {
        if let Some(cb) = self.completion_cb.lock().clone() {
            cb(id, success, message);
        }
    }
}

impl Default for HelperAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// 解析 yt-dlp 的一行输出，返回捕获到的错误信息（如有）
///
/// 认识的前缀：
/// - `[download]  NN.N% of ...` → 进度覆盖值
/// - `[download] Destination: <path>` → 实际文件名
/// - `[Merger] ...` → 合并阶段，进度推到 99
/// - `ERROR: ...` → 错误信息
fn parse_helper_line(line: &str, task: &DownloadTask) -> Option<String> {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix("[download]") {
        let rest = rest.trim();
        if let Some(dest) = rest.strip_prefix("Destination:") {
            let path = dest.trim();
            if let Some(name) = std::path::Path::new(path).file_name() {
                task.set_filename(&name.to_string_lossy());
            }
            return None;
        }
        // 形如 " 42.3% of 10.00MiB at 1.00MiB/s"
        if let Some(percent_token) = rest.split_whitespace().find(|t| t.ends_with('%')) {
            if let Ok(percent) = percent_token.trim_end_matches('%').parse::<f64>() {
                task.set_progress_override(percent.clamp(0.0, 100.0));
            }
        }
        return None;
    }

    if line.starts_with("[Merger]") {
        task.set_progress_override(99.0);
        return None;
    }

    if let Some(message) = line.strip_prefix("ERROR:") {
        let message = message.trim().to_string();
        task.set_error_message(&message);
        return Some(message);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn make_task() -> DownloadTask {
        DownloadTask::new(1, "https://youtube.com/watch?v=abc", PathBuf::from("/tmp"))
    }

    #[test]
    fn test_video_site_detection() {
        assert!(HelperAdapter::is_video_site_url(
            "https://www.youtube.com/watch?v=abc"
        ));
        assert!(HelperAdapter::is_video_site_url("https://youtu.be/abc"));
        assert!(HelperAdapter::is_video_site_url(
            "https://www.bilibili.com/video/BV1"
        ));
        assert!(!HelperAdapter::is_video_site_url(
            "https://example.com/file.zip"
        ));
        assert!(!HelperAdapter::is_video_site_url("not a url"));
        // 站点串出现在路径里不算
        assert!(!HelperAdapter::is_video_site_url(
            "https://example.com/youtube.com/file"
        ));
    }

    #[test]
    fn test_parse_progress_line() {
        let task = make_task();
        task.set_progress_override(0.0);

        assert!(parse_helper_line(
            "[download]  42.3% of 10.00MiB at 1.00MiB/s ETA 00:05",
            &task
        )
        .is_none());
        assert!((task.progress() - 42.3).abs() < 1e-9);

        parse_helper_line("[download] 100% of 10.00MiB in 00:10", &task);
        assert_eq!(task.progress(), 100.0);
    }

    #[test]
    fn test_parse_destination_line() {
        let task = make_task();
        parse_helper_line(
            "[download] Destination: /tmp/Video/My Title.mp4",
            &task,
        );
        assert_eq!(task.filename(), "My Title.mp4");
    }

    #[test]
    fn test_parse_merger_and_error_lines() {
        let task = make_task();
        task.set_progress_override(0.0);

        parse_helper_line("[Merger] Merging formats into \"out.mp4\"", &task);
        assert_eq!(task.progress(), 99.0);

        let err = parse_helper_line("ERROR: Video unavailable", &task);
        assert_eq!(err.as_deref(), Some("Video unavailable"));
        assert_eq!(task.error_message(), "Video unavailable");
    }

    #[tokio::test]
    async fn test_missing_binary_marks_error() {
        let adapter = Arc::new(HelperAdapter::with_binary(
            "definitely-not-a-real-binary-xyz",
        ));
        let task = Arc::new(make_task());

        assert!(adapter.start(task.clone()));
        assert!(adapter.wait_finish(1, 10_000).await);

        assert_eq!(task.status(), DownloadStatus::Error);
        assert_eq!(task.error_message(), "yt-dlp not installed");
    }

    #[tokio::test]
    async fn test_helper_runs_real_subprocess() {
        // 用 /bin/echo 模拟助手输出，验证行解析和正常退出路径
        let adapter = Arc::new(HelperAdapter::with_binary("echo"));
        let task = Arc::new(make_task());

        assert!(adapter.start(task.clone()));
        assert!(adapter.wait_finish(1, 10_000).await);

        // echo 正常退出且没有 ERROR 行 → 完成
        assert_eq!(task.status(), DownloadStatus::Completed);
        assert_eq!(task.progress(), 100.0);
    }

    #[tokio::test]
    async fn test_double_start_is_noop() {
        // 第一次 start 占住 id 后，第二次必须是空操作
        let adapter = Arc::new(HelperAdapter::with_binary("sleep")); // 启动失败也会占住直到收尾
        let task = Arc::new(make_task());

        assert!(adapter.start(task.clone()));
        let second = adapter.start(task.clone());
        // 第一次的任务可能已经收尾（sleep 对参数报错退出极快），
        // 只要没出现两份同时运行即可
        if adapter.is_running(1) {
            assert!(!second);
        }
        assert!(adapter.wait_finish(1, 10_000).await);
    }
}
