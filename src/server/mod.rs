// 本地回环接口（浏览器扩展集成）

pub mod handlers;
pub mod state;

pub use state::{AppState, UrlSink};

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::future::IntoFuture;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// 每个请求的处理超时（接收超时）
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// 停机时等待在途请求排空的上限
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// 组装路由
///
/// 请求头上限 64KB 在 guard 中间件里校验；请求体只受
/// `Content-Length` 约束，关掉 axum 的默认体积上限
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(handlers::ping))
        .route("/token", get(handlers::token))
        .route("/status", get(handlers::status))
        .route("/download", post(handlers::download))
        .layer(middleware::from_fn_with_state(state.clone(), handlers::guard))
        .layer(DefaultBodyLimit::disable())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 启动本地接口
///
/// 只绑定 127.0.0.1，外部连接到不了 accept。`shutdown` 触发后关闭
/// 监听并等待在途请求排空，最多 30 秒，剩下的请求被遗弃（它们下次
/// 检查时会看到停机状态）
pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!("本地接口已启动: http://127.0.0.1:{}", port);

    let graceful = {
        let shutdown = shutdown.clone();
        async move {
            shutdown.cancelled().await;
        }
    };

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .into_future();

    // 正常情况下 serve 会在停机信号后自己排空连接；这里给排空加一个
    // 30 秒的硬上限
    let forced_drain = async {
        shutdown.cancelled().await;
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while state.active_requests.load(Ordering::Acquire) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "排空超时，遗弃 {} 个在途请求",
                    state.active_requests.load(Ordering::Acquire)
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };

    tokio::select! {
        result = server => result?,
        _ = forced_drain => {}
    }

    info!("本地接口已关闭");
    Ok(())
}
