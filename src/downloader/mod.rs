// 下载引擎模块

pub mod chunk;
pub mod engine;
pub mod fetcher;
pub mod helper;
pub mod manager;
pub mod scheduler;
pub mod task;
pub mod throttle;

use std::sync::Arc;

pub use chunk::Chunk;
pub use engine::DownloadEngine;
pub use fetcher::{ChunkOutcome, SegmentedOutcome};
pub use helper::HelperAdapter;
pub use manager::DownloadManager;
pub use scheduler::{EndAction, Schedule, ScheduleEvent};
pub use task::{ChecksumKind, DownloadStatus, DownloadTask, TaskSnapshot};

/// 进度回调：(id, downloaded, total, speed)
pub type ProgressCallback = Arc<dyn Fn(u64, i64, i64, f64) + Send + Sync>;

/// 完成回调：(id, success, message)，每个下载恰好触发一次
pub type CompletionCallback = Arc<dyn Fn(u64, bool, &str) + Send + Sync>;

/// 任务变更回调（UI 刷新用）
pub type UpdateCallback = Arc<dyn Fn(u64) + Send + Sync>;
