//! 下载错误分类
//!
//! 统一的错误枚举，引擎根据分类决定重试、降级还是直接失败。
//! 用户可见的错误文案集中在这里，避免散落在各处。

use thiserror::Error;

/// 下载过程中可能出现的错误
#[derive(Debug, Error)]
pub enum DownloadError {
    /// URL 校验失败（不重试）
    #[error("invalid url: {0}")]
    Validation(String),

    /// 网络层错误：DNS、连接、TLS、超时（可按整体重试策略重试）
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP 4xx（408/429 除外）：致命，不重试
    #[error("http client error: {0}")]
    HttpClient(u16),

    /// HTTP 5xx 以及 408/429：可重试
    #[error("http server error: {0}")]
    HttpServer(u16),

    /// 服务器返回的 Content-Range 起点与请求不符
    #[error("content-range start mismatch (expected {expected}, got {actual})")]
    RangeMismatch { expected: i64, actual: i64 },

    /// 期望 206 却收到 200/416：降级为单流下载
    #[error("range not supported (status {0})")]
    RangeUnsupported(u16),

    /// 磁盘写入失败（不自动重试，磁盘状态不会自愈）
    #[error("disk write failed: {0}")]
    Disk(#[from] std::io::Error),

    /// 合并失败：保留分片文件，报告错误
    #[error("merge failed: {0}")]
    Merge(String),

    /// 合并后文件大小与声明不符：删除分片和成品，不自动重试
    #[error("merged size mismatch (expected {expected}, got {actual})")]
    SizeMismatch { expected: i64, actual: i64 },

    /// 校验和不匹配
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// 用户暂停/取消，不作为错误上报
    #[error("aborted by user")]
    Aborted,
}

impl DownloadError {
    /// 该错误是否允许按整体下载重试策略重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::Transport(_) | DownloadError::HttpServer(_)
        )
    }

    /// 从 HTTP 状态码分类错误
    ///
    /// 4xx 中 408 和 429 视为服务器侧的临时问题，可重试
    pub fn from_status(status: u16) -> Self {
        if (400..500).contains(&status) && status != 408 && status != 429 {
            DownloadError::HttpClient(status)
        } else {
            DownloadError::HttpServer(status)
        }
    }

    /// 用户可见的错误文案
    ///
    /// 词汇表有界：按分类映射到固定句式，必要时附上状态码
    pub fn user_message(&self) -> String {
        match self {
            DownloadError::Validation(_) => "Invalid URL".to_string(),
            DownloadError::Transport(_) => "Cannot connect to server".to_string(),
            DownloadError::HttpClient(code) | DownloadError::HttpServer(code) => {
                http_status_message(*code)
            }
            DownloadError::RangeMismatch { .. } => {
                "Server returned wrong byte range".to_string()
            }
            DownloadError::RangeUnsupported(_) => {
                "Server does not support resumable downloads".to_string()
            }
            DownloadError::Disk(_) => {
                "Disk write failed - check available disk space".to_string()
            }
            DownloadError::Merge(_) => {
                "Failed to merge download parts - check disk space".to_string()
            }
            DownloadError::SizeMismatch { expected, actual } => {
                format!(
                    "Merged file size mismatch (expected {}, got {})",
                    expected, actual
                )
            }
            DownloadError::ChecksumMismatch => "Checksum mismatch".to_string(),
            DownloadError::Aborted => "User Aborted".to_string(),
        }
    }
}

/// HTTP 状态码对应的用户可见文案
pub fn http_status_message(status: u16) -> String {
    match status {
        400 => "Bad request - URL may be malformed".to_string(),
        401 => "Unauthorized - login required".to_string(),
        403 => "Forbidden - access denied by server".to_string(),
        404 => "File not found (404)".to_string(),
        405 => "Method not allowed".to_string(),
        408 => "Request timeout".to_string(),
        410 => "File no longer available (410 Gone)".to_string(),
        429 => "Too many requests - server is rate limiting".to_string(),
        500 => "Server error (500)".to_string(),
        502 => "Bad gateway (502)".to_string(),
        503 => "Service unavailable - server is overloaded".to_string(),
        504 => "Gateway timeout".to_string(),
        _ => {
            if (400..500).contains(&status) {
                format!("Client error (HTTP {})", status)
            } else if status >= 500 {
                format!("Server error (HTTP {})", status)
            } else {
                format!("HTTP error {}", status)
            }
        }
    }
}
