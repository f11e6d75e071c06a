//! 注册表持久化
//!
//! 整个注册表（任务 + 分类 + 设置）是一份 JSON 文档，写入走
//! 临时文件 + 原子替换；替换失败时退回「删除再改名」，再失败则把
//! 临时文件拷回目标路径兜底。所有读写经过同一把锁。

use crate::downloader::task::{DownloadStatus, TaskSnapshot};
use crate::urlutil;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 注册表文档
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryDoc {
    /// 所有下载记录（含分段向量）
    #[serde(default)]
    pub downloads: Vec<TaskSnapshot>,
    /// 用户可见的分类名
    #[serde(default)]
    pub categories: Vec<String>,
    /// 键值设置
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

#[derive(Debug)]
struct StoreInner {
    doc: RegistryDoc,
    dirty: bool,
}

/// 注册表存储
#[derive(Debug)]
pub struct RegistryStore {
    path: PathBuf,
    inner: Mutex<StoreInner>,
    /// 写盘互斥：两个并发 flush 不能交错写同一个临时文件
    write_lock: Mutex<()>,
}

impl RegistryStore {
    /// 打开（或初始化）注册表
    ///
    /// 首次运行写入默认分类；磁盘上状态为 Downloading 的记录一律
    /// 降为 Paused：上一个进程死在传输中，必须由用户显式恢复
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut doc = match Self::read_doc(&path) {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                info!("注册表不存在，创建默认文档: {:?}", path);
                RegistryDoc::default()
            }
            Err(e) => {
                warn!("注册表解析失败（使用空文档）: {}", e);
                RegistryDoc::default()
            }
        };

        if doc.categories.is_empty() {
            doc.categories = urlutil::DEFAULT_CATEGORIES
                .iter()
                .map(|s| s.to_string())
                .collect();
        }

        let mut demoted = 0;
        for snapshot in doc.downloads.iter_mut() {
            if snapshot.status == DownloadStatus::Downloading {
                snapshot.status = DownloadStatus::Paused;
                demoted += 1;
            }
        }
        if demoted > 0 {
            info!("加载时将 {} 个中断的任务置为暂停", demoted);
        }

        Ok(Self {
            path,
            inner: Mutex::new(StoreInner { doc, dirty: false }),
            write_lock: Mutex::new(()),
        })
    }

    fn read_doc(path: &Path) -> Result<Option<RegistryDoc>> {
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path).with_context(|| format!("打开注册表失败: {:?}", path))?;
        let reader = BufReader::new(file);
        let doc: RegistryDoc = serde_json::from_reader(reader).context("解析注册表失败")?;
        Ok(Some(doc))
    }

    /// 当前文档的副本
    pub fn load(&self) -> RegistryDoc {
        self.inner.lock().doc.clone()
    }

    /// 写入或更新一条下载记录
    pub fn upsert_download(&self, snapshot: TaskSnapshot) {
        let mut inner = self.inner.lock();
        match inner.doc.downloads.iter().position(|d| d.id == snapshot.id) {
            Some(pos) => inner.doc.downloads[pos] = snapshot,
            None => inner.doc.downloads.push(snapshot),
        }
        inner.dirty = true;
    }

    /// 删除一条下载记录
    pub fn delete_download(&self, id: u64) {
        let mut inner = self.inner.lock();
        let before = inner.doc.downloads.len();
        inner.doc.downloads.retain(|d| d.id != id);
        if inner.doc.downloads.len() != before {
            inner.dirty = true;
        }
    }

    /// 整体替换下载记录列表
    pub fn replace_all(&self, downloads: Vec<TaskSnapshot>) {
        let mut inner = self.inner.lock();
        inner.doc.downloads = downloads;
        inner.dirty = true;
    }

    /// 读取设置，缺失时返回默认值
    pub fn get_setting(&self, key: &str, default: &str) -> String {
        self.inner
            .lock()
            .doc
            .settings
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// 读取整数设置，缺失或格式损坏时落回默认值
    pub fn get_setting_i64(&self, key: &str, default: i64) -> i64 {
        self.get_setting(key, "")
            .trim()
            .parse()
            .unwrap_or(default)
    }

    pub fn set_setting(&self, key: &str, value: &str) {
        let mut inner = self.inner.lock();
        inner
            .doc
            .settings
            .insert(key.to_string(), value.to_string());
        inner.dirty = true;
    }

    /// 分类名列表
    pub fn categories(&self) -> Vec<String> {
        self.inner.lock().doc.categories.clone()
    }

    pub fn add_category(&self, name: &str) {
        let mut inner = self.inner.lock();
        if !inner.doc.categories.iter().any(|c| c == name) {
            inner.doc.categories.push(name.to_string());
            inner.dirty = true;
        }
    }

    pub fn remove_category(&self, name: &str) {
        let mut inner = self.inner.lock();
        let before = inner.doc.categories.len();
        inner.doc.categories.retain(|c| c != name);
        if inner.doc.categories.len() != before {
            inner.dirty = true;
        }
    }

    /// 有未落盘的修改时写盘
    pub async fn flush(self: &Arc<Self>) -> Result<()> {
        let doc = {
            let mut inner = self.inner.lock();
            if !inner.dirty {
                return Ok(());
            }
            inner.dirty = false;
            inner.doc.clone()
        };
        // 序列化和写盘放在锁外，短临界区
        self.write_doc_blocking(doc).await
    }

    /// 无条件写盘
    pub async fn force_flush(self: &Arc<Self>) -> Result<()> {
        let doc = {
            let mut inner = self.inner.lock();
            inner.dirty = false;
            inner.doc.clone()
        };
        self.write_doc_blocking(doc).await
    }

    /// 把阻塞的序列化 + 写文件 + fsync 挪到阻塞线程池执行
    ///
    /// 写失败时恢复 dirty 标记，下一轮 flush 会再试
    async fn write_doc_blocking(self: &Arc<Self>, doc: RegistryDoc) -> Result<()> {
        let store = self.clone();
        let result = tokio::task::spawn_blocking(move || store.write_doc(&doc)).await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.inner.lock().dirty = true;
                Err(e)
            }
            Err(e) => {
                self.inner.lock().dirty = true;
                anyhow::bail!("写盘任务异常退出: {}", e)
            }
        }
    }

    /// 原子写入：全部内容先落临时文件，再替换到目标路径
    fn write_doc(&self, doc: &RegistryDoc) -> Result<()> {
        let _write_guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).context("创建注册表目录失败")?;
            }
        }

        let tmp_path = tmp_path_for(&self.path);
        {
            let file =
                File::create(&tmp_path).with_context(|| format!("创建临时文件失败: {:?}", tmp_path))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, doc).context("序列化注册表失败")?;
            writer.flush().context("写入临时文件失败")?;
            writer.get_ref().sync_all().context("同步临时文件失败")?;
        }

        atomic_replace(&tmp_path, &self.path)?;
        debug!("注册表已写盘: {:?}", self.path);
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// 用临时文件替换目标文件
///
/// 优先 rename（同目录下为原子操作）；失败时删除目标再 rename；
/// 再失败则把临时文件内容拷回目标路径作最后兜底
fn atomic_replace(tmp: &Path, target: &Path) -> Result<()> {
    match fs::rename(tmp, target) {
        Ok(()) => return Ok(()),
        Err(e) => {
            warn!("rename 替换失败（尝试删除后重命名）: {}", e);
        }
    }

    if target.exists() {
        let _ = fs::remove_file(target);
    }
    match fs::rename(tmp, target) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            // 最后兜底：拷贝内容
            warn!("第二次 rename 仍失败（拷贝兜底）: {}", rename_err);
            fs::copy(tmp, target).context("拷贝注册表兜底失败")?;
            let _ = fs::remove_file(tmp);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::task::DownloadTask;
    use tempfile::TempDir;

    fn snapshot(id: u64, status: DownloadStatus) -> TaskSnapshot {
        let task = DownloadTask::new(id, "https://example.com/file.zip", PathBuf::from("/tmp"));
        task.set_status(status);
        task.snapshot()
    }

    #[test]
    fn test_first_run_default_categories() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path().join("registry.json")).unwrap();
        let categories = store.categories();
        assert!(categories.contains(&"Compressed".to_string()));
        assert!(categories.contains(&"Video".to_string()));
        assert_eq!(categories.len(), 6);
    }

    #[tokio::test]
    async fn test_upsert_flush_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");

        let store = Arc::new(RegistryStore::open(&path).unwrap());
        store.upsert_download(snapshot(1, DownloadStatus::Queued));
        store.upsert_download(snapshot(2, DownloadStatus::Completed));
        store.set_setting("next_id", "3");
        store.flush().await.unwrap();

        let reloaded = RegistryStore::open(&path).unwrap();
        let doc = reloaded.load();
        assert_eq!(doc.downloads.len(), 2);
        assert_eq!(reloaded.get_setting_i64("next_id", 1), 3);
    }

    #[test]
    fn test_upsert_replaces_same_id() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path().join("r.json")).unwrap();

        store.upsert_download(snapshot(1, DownloadStatus::Queued));
        store.upsert_download(snapshot(1, DownloadStatus::Paused));
        let doc = store.load();
        assert_eq!(doc.downloads.len(), 1);
        assert_eq!(doc.downloads[0].status, DownloadStatus::Paused);
    }

    #[tokio::test]
    async fn test_downloading_demoted_to_paused_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");

        let store = Arc::new(RegistryStore::open(&path).unwrap());
        store.upsert_download(snapshot(1, DownloadStatus::Downloading));
        store.force_flush().await.unwrap();

        let reloaded = RegistryStore::open(&path).unwrap();
        let doc = reloaded.load();
        assert_eq!(doc.downloads[0].status, DownloadStatus::Paused);
    }

    #[tokio::test]
    async fn test_flush_only_when_dirty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");

        let store = Arc::new(RegistryStore::open(&path).unwrap());
        store.flush().await.unwrap();
        // 没有修改不写盘
        assert!(!path.exists());

        store.set_setting("k", "v");
        store.flush().await.unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_malformed_setting_falls_back() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path().join("r.json")).unwrap();
        store.set_setting("speed_limit", "not-a-number");
        assert_eq!(store.get_setting_i64("speed_limit", 42), 42);
        store.set_setting("speed_limit", " 1024 ");
        assert_eq!(store.get_setting_i64("speed_limit", 42), 1024);
    }

    #[test]
    fn test_corrupt_file_yields_empty_doc() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, "{ not valid json").unwrap();

        let store = RegistryStore::open(&path).unwrap();
        assert!(store.load().downloads.is_empty());
    }

    #[tokio::test]
    async fn test_no_tmp_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");

        let store = Arc::new(RegistryStore::open(&path).unwrap());
        store.upsert_download(snapshot(1, DownloadStatus::Queued));
        store.force_flush().await.unwrap();

        assert!(path.exists());
        assert!(!tmp_path_for(&path).exists());
    }

    #[test]
    fn test_delete_and_replace_all() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path().join("r.json")).unwrap();

        store.upsert_download(snapshot(1, DownloadStatus::Queued));
        store.upsert_download(snapshot(2, DownloadStatus::Queued));
        store.delete_download(1);
        assert_eq!(store.load().downloads.len(), 1);

        store.replace_all(vec![snapshot(9, DownloadStatus::Completed)]);
        let doc = store.load();
        assert_eq!(doc.downloads.len(), 1);
        assert_eq!(doc.downloads[0].id, 9);
    }

    #[test]
    fn test_categories_mutation() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path().join("r.json")).unwrap();

        store.add_category("Ebooks");
        assert!(store.categories().contains(&"Ebooks".to_string()));
        // 重复添加不生效
        store.add_category("Ebooks");
        assert_eq!(
            store.categories().iter().filter(|c| *c == "Ebooks").count(),
            1
        );

        store.remove_category("Ebooks");
        assert!(!store.categories().contains(&"Ebooks".to_string()));
    }
}
