use anyhow::Result;
use ldm_rust::{
    config::{AppConfig, LogConfig},
    downloader::DownloadManager,
    logging,
    server::{self, AppState, UrlSink},
    store::RegistryStore,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 配置文件路径
const CONFIG_PATH: &str = "config/app.toml";

/// 注册表路径
const REGISTRY_PATH: &str = "data/registry.json";

/// 加载日志配置
///
/// 先于完整配置加载：日志系统要第一时间可用，失败时退默认配置
async fn load_log_config() -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(CONFIG_PATH).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = load_log_config().await;

    // 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&log_config);

    info!("LDM Rust v{} 启动中...", env!("CARGO_PKG_VERSION"));

    // 加载配置与注册表
    let config = AppConfig::load_or_default(CONFIG_PATH).await;
    config.ensure_download_dir()?;
    let store = Arc::new(RegistryStore::open(REGISTRY_PATH)?);

    // 创建下载管理器并应用注册表里的运行时设置
    let manager = DownloadManager::new(&config, store)?;
    manager.apply_store_settings();
    info!("下载管理器初始化完成");

    // 浏览器扩展投递的 URL 直接入队，由队列决定何时启动
    let url_sink: UrlSink = {
        let manager = manager.clone();
        Arc::new(move |url: String, referer: Option<String>| {
            match manager.add(&url, referer.as_deref(), None) {
                Ok(id) => {
                    if !manager.is_queue_running() {
                        manager.start(id);
                    } else {
                        manager.process_queue();
                    }
                    true
                }
                Err(e) => {
                    warn!("扩展投递的 URL 被拒绝: {} ({})", url, e);
                    false
                }
            }
        })
    };

    // 启动本地接口
    let state = AppState::new(
        manager.clone(),
        url_sink,
        config.server.max_connections,
    );
    info!(
        "浏览器扩展令牌已生成（GET http://127.0.0.1:{}/token 获取）",
        config.server.port
    );

    let shutdown = CancellationToken::new();
    let server_handle = {
        let state = state.clone();
        let shutdown = shutdown.clone();
        let port = config.server.port;
        tokio::spawn(async move {
            if let Err(e) = server::serve(state, port, shutdown).await {
                error!("本地接口异常退出: {}", e);
            }
        })
    };

    // 等待 Ctrl+C，然后有序停机
    tokio::signal::ctrl_c().await?;
    info!("收到 Ctrl+C，开始优雅关闭...");

    shutdown.cancel();
    let _ = server_handle.await;

    manager.shutdown().await;
    info!("应用已安全退出");

    Ok(())
}
