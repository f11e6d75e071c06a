// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 本地接口配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 本地接口配置
///
/// 只监听 127.0.0.1，host 不可配置（安全边界的一部分）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// 最大并发连接数，超出返回 503
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_port() -> u16 {
    45678
}

fn default_max_connections() -> usize {
    16
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_connections: default_max_connections(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 默认下载目录
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 每个下载的最大连接数（1-8）
    #[serde(default = "default_segment_connections")]
    pub max_connections: usize,
    /// 最大同时下载任务数
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// 整体下载最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 速度限制 (KB/s)，0 为不限速
    #[serde(default)]
    pub speed_limit_kb: u64,
    /// User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 是否校验 TLS 证书
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
    /// 代理主机（空为不使用代理）
    #[serde(default)]
    pub proxy_host: String,
    /// 代理端口
    #[serde(default)]
    pub proxy_port: u16,
}

fn default_download_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join("Downloads");
    }
    PathBuf::from("downloads")
}

fn default_segment_connections() -> usize {
    8
}

fn default_max_concurrent_tasks() -> usize {
    3
}

fn default_max_retries() -> u32 {
    5
}

fn default_user_agent() -> String {
    format!("LDM/{}", env!("CARGO_PKG_VERSION"))
}

fn default_verify_tls() -> bool {
    true
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_connections: default_segment_connections(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_retries: default_max_retries(),
            speed_limit_kb: 0,
            user_agent: default_user_agent(),
            verify_tls: default_verify_tls(),
            proxy_host: String::new(),
            proxy_port: 0,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否写日志文件
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 保留天数
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_retention_days() -> u32 {
    7
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
            retention_days: default_retention_days(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置，失败时返回默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load(path).await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("加载配置失败（使用默认配置）: {}", e);
                Self::default()
            }
        }
    }

    /// 从文件加载配置
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {}", path))?;
        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;
        Ok(config)
    }

    /// 确保下载目录存在（不存在则递归创建）
    pub fn ensure_download_dir(&self) -> Result<()> {
        if !self.download.download_dir.exists() {
            std::fs::create_dir_all(&self.download.download_dir)
                .context("创建下载目录失败")?;
            tracing::info!("✓ 下载目录已创建: {:?}", self.download.download_dir);
        }
        Ok(())
    }

    /// 代理地址（host:port），未配置时为 None
    pub fn proxy_url(&self) -> Option<String> {
        if self.download.proxy_host.is_empty() {
            return None;
        }
        if self.download.proxy_port == 0 {
            return None;
        }
        Some(format!(
            "{}:{}",
            self.download.proxy_host, self.download.proxy_port
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 45678);
        assert_eq!(config.server.max_connections, 16);
        assert_eq!(config.download.max_connections, 8);
        assert_eq!(config.download.max_retries, 5);
        assert!(config.download.verify_tls);
        assert!(config.proxy_url().is_none());
    }

    #[test]
    fn test_partial_toml() {
        // 缺失的字段全部落默认值
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [download]
            max_connections = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.max_connections, 16);
        assert_eq!(config.download.max_connections, 4);
        assert_eq!(config.download.max_retries, 5);
        assert_eq!(config.log.retention_days, 7);
    }

    #[test]
    fn test_proxy_url() {
        let mut config = AppConfig::default();
        config.download.proxy_host = "127.0.0.1".to_string();
        config.download.proxy_port = 1080;
        assert_eq!(config.proxy_url().as_deref(), Some("127.0.0.1:1080"));

        config.download.proxy_port = 0;
        assert!(config.proxy_url().is_none());
    }
}
