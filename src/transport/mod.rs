//! 传输层
//!
//! 封装共享的 HTTP 会话：探测、带 Range 的请求、会话重建、
//! 按任务 id 登记的取消令牌。
//!
//! 会话生命周期：所有请求持有 `Arc<HttpSession>` 作为借用凭证，
//! 重新配置（代理、UA、TLS 开关）时换入新会话，旧会话在最后一个
//! 借用释放时自然销毁，不存在"关闭中 + 活跃计数"这类手工状态。

use crate::error::DownloadError;
use dashmap::DashMap;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE, REFERER};
use reqwest::{Client, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 连接超时
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// 接收超时（读流时两次数据之间的最大间隔）
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// 会话配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub user_agent: String,
    /// host:port，空为不使用代理
    pub proxy: Option<String>,
    pub verify_tls: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("LDM/{}", env!("CARGO_PKG_VERSION")),
            proxy: None,
            verify_tls: true,
        }
    }
}

/// HTTP 会话：一个配置好的客户端实例
#[derive(Debug)]
pub struct HttpSession {
    client: Client,
    config: SessionConfig,
}

impl HttpSession {
    fn build(config: SessionConfig) -> Result<Self, DownloadError> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(RECEIVE_TIMEOUT)
            .danger_accept_invalid_certs(!config.verify_tls)
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(format!("http://{}", proxy))
                .map_err(|e| DownloadError::Transport(format!("invalid proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| DownloadError::Transport(format!("client build failed: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

/// 探测结果
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// 文件总大小，-1 为未知
    pub total_size: i64,
    /// 服务器是否声明支持 Range
    pub range_supported: bool,
    /// 响应状态码
    pub status: u16,
}

/// 传输客户端
#[derive(Debug)]
pub struct Transport {
    session: parking_lot::RwLock<Arc<HttpSession>>,
    /// 每个下载 id 一个取消令牌；取消令牌让所有在途读取立即返回
    tokens: DashMap<u64, CancellationToken>,
}

impl Transport {
    pub fn new(config: SessionConfig) -> Result<Self, DownloadError> {
        let session = HttpSession::build(config)?;
        Ok(Self {
            session: parking_lot::RwLock::new(Arc::new(session)),
            tokens: DashMap::new(),
        })
    }

    /// 借用当前会话（Arc 克隆即借用凭证）
    pub fn session(&self) -> Arc<HttpSession> {
        self.session.read().clone()
    }

    /// 重建会话（代理/UA/TLS 配置变化时）
    ///
    /// 旧会话在最后一个在途请求结束时随 Arc 引用计数归零销毁
    pub fn reconfigure(&self, config: SessionConfig) -> Result<(), DownloadError> {
        let new_session = Arc::new(HttpSession::build(config)?);
        let old = {
            let mut guard = self.session.write();
            std::mem::replace(&mut *guard, new_session)
        };
        info!(
            "会话已重建（旧会话剩余借用: {}）",
            Arc::strong_count(&old).saturating_sub(1)
        );
        Ok(())
    }

    // ========================================================================
    // 取消令牌
    // ========================================================================

    /// 取得某个下载的取消令牌（不存在则创建）
    pub fn token_for(&self, id: u64) -> CancellationToken {
        self.tokens
            .entry(id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// 取消某个下载的所有在途请求
    ///
    /// 令牌被触发后从登记表移除，下次启动拿到的是全新令牌
    pub fn cancel_requests(&self, id: u64) {
        if let Some((_, token)) = self.tokens.remove(&id) {
            token.cancel();
            debug!("已取消下载 {} 的在途请求", id);
        }
    }

    /// 任务收尾时清理令牌
    pub fn drop_token(&self, id: u64) {
        self.tokens.remove(&id);
    }

    // ========================================================================
    // 请求
    // ========================================================================

    /// 探测文件大小与 Range 支持
    ///
    /// 用 GET 而不是 HEAD，不少源站对 HEAD 的应答不可信；
    /// 只读响应头，不消费响应体。状态 ≥ 400 一律视为探测失败
    pub async fn probe(&self, url: &str, referer: &str) -> Result<ProbeResult, DownloadError> {
        let session = self.session();
        let mut request = session.client.get(url);
        if !referer.is_empty() {
            request = request.header(REFERER, referer);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        debug!("探测响应: url={}, status={}", url, status);

        if status >= 400 {
            return Err(DownloadError::from_status(status));
        }

        let total_size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(-1);

        let range_supported = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("bytes"))
            .unwrap_or(false);

        Ok(ProbeResult {
            total_size,
            range_supported,
            status,
        })
    }

    /// 发起 GET 请求
    ///
    /// `range` 为 `(start, end)`，`end < 0` 时发开区间 `bytes=start-`；
    /// 状态码的判定留给调用方
    pub async fn get(
        &self,
        url: &str,
        referer: &str,
        range: Option<(i64, i64)>,
    ) -> Result<Response, DownloadError> {
        let session = self.session();
        let mut request = session.client.get(url);
        if !referer.is_empty() {
            request = request.header(REFERER, referer);
        }
        if let Some((start, end)) = range {
            let value = if end >= 0 {
                format!("bytes={}-{}", start, end)
            } else {
                format!("bytes={}-", start)
            };
            request = request.header(RANGE, value);
        }

        request.send().await.map_err(map_reqwest_error)
    }
}

/// reqwest 错误归入传输错误类
fn map_reqwest_error(e: reqwest::Error) -> DownloadError {
    if e.is_timeout() {
        DownloadError::Transport(format!("timeout: {}", e))
    } else if e.is_connect() {
        DownloadError::Transport(format!("connect failed: {}", e))
    } else {
        DownloadError::Transport(e.to_string())
    }
}

/// 解析 `Content-Range: bytes S-E/T` 的起点 S
///
/// 续传校验用：服务器返回的起点必须等于请求的起点，否则写入
/// 位置会错位
pub fn parse_content_range_start(value: &str) -> Option<i64> {
    let after_unit = value.trim().strip_prefix("bytes")?.trim_start();
    let dash = after_unit.find('-')?;
    after_unit[..dash].trim().parse::<i64>().ok()
}

/// 校验 206 响应的 Content-Range 起点
pub fn validate_content_range(response: &Response, expected_start: i64) -> Result<(), DownloadError> {
    if response.status() != StatusCode::PARTIAL_CONTENT {
        return Ok(());
    }
    let Some(value) = response
        .headers()
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
    else {
        // 没有 Content-Range 头时无从校验，放行
        return Ok(());
    };

    match parse_content_range_start(value) {
        Some(actual) if actual != expected_start => {
            warn!(
                "Content-Range 起点不匹配: 期望 {}, 实际 {}",
                expected_start, actual
            );
            Err(DownloadError::RangeMismatch {
                expected: expected_start,
                actual,
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;

    #[test]
    fn test_parse_content_range_start() {
        assert_eq!(parse_content_range_start("bytes 0-99/1000"), Some(0));
        assert_eq!(
            parse_content_range_start("bytes 1048576-2621439/10485760"),
            Some(1048576)
        );
        assert_eq!(parse_content_range_start("bytes  42-99/100"), Some(42));
        assert_eq!(parse_content_range_start("items 0-9/10"), None);
        assert_eq!(parse_content_range_start("bytes */1000"), None);
        assert_eq!(parse_content_range_start(""), None);
    }

    async fn spawn_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_probe_reads_size_and_ranges() {
        let app = Router::new().route(
            "/file.bin",
            get(|| async {
                (
                    [(header::ACCEPT_RANGES, "bytes")],
                    vec![0u8; 500_000],
                )
                    .into_response()
            }),
        );
        let base = spawn_server(app).await;

        let transport = Transport::new(SessionConfig::default()).unwrap();
        let probe = transport
            .probe(&format!("{}/file.bin", base), "")
            .await
            .unwrap();

        assert_eq!(probe.total_size, 500_000);
        assert!(probe.range_supported);
        assert_eq!(probe.status, 200);
    }

    #[tokio::test]
    async fn test_probe_404_is_client_error() {
        let app = Router::new().route(
            "/missing",
            get(|| async { axum::http::StatusCode::NOT_FOUND }),
        );
        let base = spawn_server(app).await;

        let transport = Transport::new(SessionConfig::default()).unwrap();
        let err = transport
            .probe(&format!("{}/missing", base), "")
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::HttpClient(404)));
    }

    #[tokio::test]
    async fn test_probe_connection_refused_is_transport() {
        let transport = Transport::new(SessionConfig::default()).unwrap();
        // 端口 1 上没有监听者
        let err = transport
            .probe("http://127.0.0.1:1/file", "")
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Transport(_)));
    }

    #[tokio::test]
    async fn test_token_lifecycle() {
        let transport = Transport::new(SessionConfig::default()).unwrap();

        let token = transport.token_for(1);
        assert!(!token.is_cancelled());

        transport.cancel_requests(1);
        assert!(token.is_cancelled());

        // 取消后重新获取是全新令牌
        let fresh = transport.token_for(1);
        assert!(!fresh.is_cancelled());
    }

    #[tokio::test]
    async fn test_reconfigure_swaps_session() {
        let transport = Transport::new(SessionConfig::default()).unwrap();
        let old = transport.session();

        let mut config = SessionConfig::default();
        config.user_agent = "LDM-test/2.0".to_string();
        transport.reconfigure(config).unwrap();

        let new = transport.session();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.config().user_agent, "LDM-test/2.0");
    }
}
