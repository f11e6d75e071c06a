//! 本地接口的端点与中间件
//!
//! 安全契约：
//! - 只信回环地址上的连接（绑定已经保证）
//! - `Origin` 存在时必须是回环或浏览器扩展来源，否则 403
//! - `POST /download` 必须带启动时生成的令牌，否则 401 且绝不触发
//!   URL 投递
//! - CORS 只回显请求方的 Origin，带鉴权的端点绝不回 `*`

use crate::server::state::AppState;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// 请求头总字节数上限（头名 + 头值）
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// 统一的错误响应体
fn error_body(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "status": "error", "message": message })),
    )
        .into_response()
}

/// Origin 是否在白名单内
///
/// 缺省（非浏览器客户端）放行；回环与三种扩展 scheme 放行
fn is_origin_allowed(origin: &str) -> bool {
    if origin.starts_with("chrome-extension://")
        || origin.starts_with("moz-extension://")
        || origin.starts_with("extension://")
    {
        return true;
    }

    // 回环：http(s)://localhost[:port] 或 http(s)://127.0.0.1[:port]
    let rest = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"));
    if let Some(rest) = rest {
        let host = rest.split(':').next().unwrap_or(rest);
        let host = host.split('/').next().unwrap_or(host);
        return host == "localhost" || host == "127.0.0.1";
    }

    false
}

/// 连接守卫 + Origin 检查 + CORS 回显
///
/// 请求计数在进入时加一、离开时减一（包括被拒绝的路径），超上限
/// 直接 503
pub async fn guard(State(state): State<AppState>, request: Request, next: Next) -> Response {
    struct ActiveGuard(AppState);
    impl Drop for ActiveGuard {
        fn drop(&mut self) {
            self.0.active_requests.fetch_sub(1, Ordering::AcqRel);
        }
    }

    let active = state.active_requests.fetch_add(1, Ordering::AcqRel) + 1;
    let _guard = ActiveGuard(state.clone());

    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    // 只回显白名单内的 Origin
    let cors_origin = origin.as_deref().filter(|o| is_origin_allowed(o)).map(|o| o.to_string());

    if active > state.max_connections {
        warn!("本地接口连接数超限（{} > {}）", active, state.max_connections);
        return with_cors(
            error_body(StatusCode::SERVICE_UNAVAILABLE, "Too many connections"),
            cors_origin.as_deref(),
        );
    }

    // 请求头总量超过 64KB 直接拒掉；体积只受 Content-Length 约束
    let header_bytes: usize = request
        .headers()
        .iter()
        .map(|(name, value)| name.as_str().len() + value.as_bytes().len())
        .sum();
    if header_bytes > MAX_HEADER_BYTES {
        warn!("请求头超限（{} bytes > {}）", header_bytes, MAX_HEADER_BYTES);
        return with_cors(
            error_body(
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                "Headers too large",
            ),
            cors_origin.as_deref(),
        );
    }

    if let Some(origin_value) = &origin {
        if !is_origin_allowed(origin_value) {
            warn!("拒绝非白名单 Origin: {}", origin_value);
            return error_body(StatusCode::FORBIDDEN, "Origin not allowed");
        }
    }

    // CORS 预检
    if request.method() == Method::OPTIONS {
        return with_cors(StatusCode::NO_CONTENT.into_response(), cors_origin.as_deref());
    }

    let response = next.run(request).await;
    with_cors(response, cors_origin.as_deref())
}

/// 给响应补 CORS 头；只回显白名单内的 Origin，不用 `*`
fn with_cors(mut response: Response, origin: Option<&str>) -> Response {
    if let Some(origin) = origin {
        if let Ok(value) = HeaderValue::from_str(origin) {
            response
                .headers_mut()
                .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
            response.headers_mut().insert(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("GET, POST, OPTIONS"),
            );
            response.headers_mut().insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Content-Type, X-Auth-Token"),
            );
        }
    }
    response
}

/// GET /ping
pub async fn ping() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "app": "LDM",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /token
///
/// 不额外鉴权：能连上回环套接字就等于本机进程
pub async fn token(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "token": state.token.as_str() }))
}

/// GET /status — 引擎实时状态
pub async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let manager = &state.manager;
    let downloads: Vec<serde_json::Value> = manager
        .all()
        .iter()
        .map(|task| {
            json!({
                "id": task.id(),
                "filename": task.filename(),
                "status": task.status().as_str(),
                "total_size": task.total_size(),
                "downloaded_size": task.downloaded_size(),
                "progress": task.progress(),
                "speed": task.speed(),
            })
        })
        .collect();

    Json(json!({
        "status": "ok",
        "active": manager.active_count(),
        "total_speed": manager.total_speed(),
        "downloads": downloads,
    }))
}

/// POST /download 的请求体
#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// POST /download
///
/// 令牌可以放 `X-Auth-Token` 头或 body 的 `token` 字段；没对上令牌
/// 时直接 401，URL 投递回调绝不触发
pub async fn download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DownloadRequest>,
) -> Response {
    let header_token = headers
        .get("X-Auth-Token")
        .and_then(|v| v.to_str().ok());
    let body_token = request.token.as_deref();

    let authorized = header_token == Some(state.token.as_str())
        || body_token == Some(state.token.as_str());
    if !authorized {
        warn!("POST /download 令牌校验失败");
        return error_body(StatusCode::UNAUTHORIZED, "Invalid or missing token");
    }

    if request.url.is_empty() {
        return error_body(StatusCode::OK, "Missing url parameter");
    }

    debug!("本地接口收到 URL: {}", request.url);
    let accepted = (state.url_sink)(request.url.clone(), request.referer.clone());
    if accepted {
        info!("浏览器扩展投递成功: {}", request.url);
        Json(json!({ "status": "ok", "message": "Download added" })).into_response()
    } else {
        error_body(StatusCode::OK, "Invalid URL")
    }
}
