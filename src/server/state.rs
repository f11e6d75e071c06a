// 本地接口的共享状态

use crate::downloader::DownloadManager;
use rand::RngCore;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

/// URL 投递回调：(url, referer) → 是否接受
///
/// 接口层只认证和转发，真正的建任务逻辑在回调里
pub type UrlSink = Arc<dyn Fn(String, Option<String>) -> bool + Send + Sync>;

/// 接口共享状态
#[derive(Clone)]
pub struct AppState {
    /// 启动时生成的随机令牌（32 字节的十六进制）
    pub token: Arc<String>,
    /// 下载管理器（/status 的数据源）
    pub manager: Arc<DownloadManager>,
    /// URL 投递回调
    pub url_sink: UrlSink,
    /// 当前在处理的请求数
    pub active_requests: Arc<AtomicUsize>,
    /// 并发上限，超出回 503
    pub max_connections: usize,
}

impl AppState {
    pub fn new(manager: Arc<DownloadManager>, url_sink: UrlSink, max_connections: usize) -> Self {
        Self {
            token: Arc::new(generate_token()),
            manager,
            url_sink,
            active_requests: Arc::new(AtomicUsize::new(0)),
            max_connections,
        }
    }
}

/// 生成 32 字节随机令牌
///
/// 只能通过回环套接字上的 GET /token 读到，这构成了浏览器扩展的
/// 信任边界：能拿到令牌的进程必然跑在本机
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(64);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shape() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(generate_token(), generate_token());
    }
}
