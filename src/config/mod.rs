// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadSettings,
    /// 合并器配置
    #[serde(default)]
    pub muxer: MuxerConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// 从 JSON 文件加载配置；文件不存在时写出默认配置
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path).await?;
            tracing::info!("配置文件不存在，已生成默认配置: {:?}", path);
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .await
            .context("读取配置文件失败")?;
        let config: Self = serde_json::from_str(&content).context("解析配置文件失败")?;
        Ok(config)
    }

    /// 保存配置到 JSON 文件
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.context("创建配置目录失败")?;
        }
        let content = serde_json::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content).await.context("写入配置文件失败")?;
        Ok(())
    }
}

/// 下载配置（即设置单例记录，由存储层持久化）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadSettings {
    /// 最大同时下载任务数（核心不强制，由外层调度使用）
    pub max_concurrent_downloads: usize,
    /// 新任务的默认并发分片数
    pub default_threads: usize,
    /// 默认输出目录
    pub default_output_path: PathBuf,
    /// 创建任务后是否自动开始
    pub auto_start: bool,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            default_threads: 8,
            default_output_path: PathBuf::from("downloads"),
            auto_start: true,
        }
    }
}

/// 合并器配置
///
/// ffmpeg 的探测路径与宿主机相关，按配置处理而非写死。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxerConfig {
    /// ffmpeg 探测路径，按顺序尝试；最后一项是裸命令名，走 PATH 查找
    pub search_paths: Vec<String>,
    /// 最终容器扩展名
    pub output_extension: String,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            search_paths: vec![
                "/usr/bin/ffmpeg".to_string(),
                "/usr/local/bin/ffmpeg".to_string(),
                "/opt/homebrew/bin/ffmpeg".to_string(),
                // 随应用分发的内置副本
                "bin/ffmpeg".to_string(),
                "ffmpeg".to_string(),
            ],
            output_extension: "mp4".to_string(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否写入日志文件（false 时仅控制台输出）
    pub enabled: bool,
    /// 日志目录
    pub log_dir: PathBuf,
    /// 日志级别（trace/debug/info/warn/error）
    pub level: String,
    /// 单个日志文件最大字节数
    pub max_file_size: u64,
    /// 日志保留天数
    pub retention_days: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: PathBuf::from("logs"),
            level: "info".to_string(),
            max_file_size: 20 * 1024 * 1024,
            retention_days: 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = DownloadSettings::default();
        assert_eq!(settings.default_threads, 8);
        assert!(settings.auto_start);
        assert_eq!(settings.max_concurrent_downloads, 3);
    }

    #[test]
    fn test_muxer_config_ends_with_bare_command() {
        let config = MuxerConfig::default();
        assert_eq!(config.search_paths.last().map(|s| s.as_str()), Some("ffmpeg"));
        assert_eq!(config.output_extension, "mp4");
    }

    #[tokio::test]
    async fn test_load_creates_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = AppConfig::load(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(config.download, DownloadSettings::default());

        // 再次加载读取已写出的文件
        let reloaded = AppConfig::load(&path).await.unwrap();
        assert_eq!(reloaded.download, config.download);
    }
}
