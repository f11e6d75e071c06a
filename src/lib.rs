// LDM Rust Library
// 下载管理器核心库

// 配置管理模块
pub mod config;

// 下载引擎模块
pub mod downloader;

// 错误分类
pub mod error;

// 日志系统
pub mod logging;

// 本地回环接口（浏览器扩展集成）
pub mod server;

// 注册表持久化
pub mod store;

// 传输层
pub mod transport;

// URL 与文件名工具
pub mod urlutil;

// 导出常用类型
pub use config::AppConfig;
pub use downloader::{
    Chunk, ChunkOutcome, DownloadEngine, DownloadManager, DownloadStatus, DownloadTask,
    EndAction, HelperAdapter, Schedule, TaskSnapshot,
};
pub use error::DownloadError;
pub use server::{AppState, UrlSink};
pub use store::{RegistryDoc, RegistryStore};
pub use transport::{ProbeResult, SessionConfig, Transport};
