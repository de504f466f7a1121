//! 日志系统
//!
//! 控制台输出始终开启；可选的文件输出按大小滚动，启动时清理过期日志。

use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LogConfig;

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "m3u8-download";

/// 按大小滚动的日志写入器
///
/// 文件名形如 `m3u8-download.2026-01-05-120000.log`，超过大小上限后
/// 追加序号滚动到新文件。
struct RollingWriter {
    log_dir: PathBuf,
    start_timestamp: String,
    max_file_size: u64,
    index: u32,
    written: u64,
    file: Option<File>,
}

impl RollingWriter {
    fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let mut writer = Self {
            log_dir,
            start_timestamp: Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
            max_file_size,
            index: 0,
            written: 0,
            file: None,
        };
        writer.open_next()?;
        Ok(writer)
    }

    fn current_path(&self) -> PathBuf {
        let name = if self.index == 0 {
            format!("{}.{}.log", LOG_FILE_PREFIX, self.start_timestamp)
        } else {
            format!(
                "{}.{}_{}.log",
                LOG_FILE_PREFIX, self.start_timestamp, self.index
            )
        };
        self.log_dir.join(name)
    }

    fn open_next(&mut self) -> io::Result<()> {
        if let Some(mut old) = self.file.take() {
            old.flush()?;
            self.index += 1;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_path())?;
        self.file = Some(file);
        self.written = 0;
        Ok(())
    }
}

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_file_size {
            self.open_next()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "日志文件未打开"))?;
        let written = file.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

/// `tracing_appender` 需要 `Write + Send`，这里做线程安全包装
#[derive(Clone)]
struct SharedWriter(Arc<Mutex<RollingWriter>>);

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

/// 日志守卫：必须保持存活，否则后台写入线程终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// 返回的守卫需要持有到进程结束。文件层初始化失败时回退为仅控制台输出。
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()));

    if !config.enabled {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    }

    let writer = fs::create_dir_all(&config.log_dir)
        .and_then(|_| RollingWriter::new(config.log_dir.clone(), config.max_file_size));

    match writer {
        Ok(writer) => {
            let shared = SharedWriter(Arc::new(Mutex::new(writer)));
            let (non_blocking, guard) = tracing_appender::non_blocking(shared);
            let file_layer = fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
                .with_writer(non_blocking);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .init();

            info!(
                "日志系统初始化完成: 目录={:?}, 级别={}, 保留 {} 天",
                config.log_dir, config.level, config.retention_days
            );
            cleanup_old_logs(config);
            LogGuard {
                _file_guard: Some(guard),
            }
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .init();
            tracing::warn!("日志文件层初始化失败，回退为仅控制台输出: {}", e);
            LogGuard { _file_guard: None }
        }
    }
}

/// 按修改时间清理过期日志文件
fn cleanup_old_logs(config: &LogConfig) {
    let retention = chrono::Duration::days(config.retention_days as i64);
    let now = chrono::Utc::now();

    let entries = match fs::read_dir(&config.log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, {}", config.log_dir, e);
            return;
        }
    };

    let mut deleted = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if !name.starts_with(LOG_FILE_PREFIX) || !name.ends_with(".log") {
            continue;
        }

        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|modified| {
                let modified: chrono::DateTime<chrono::Utc> = modified.into();
                now.signed_duration_since(modified) > retention
            })
            .unwrap_or(false);

        if expired {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("删除过期日志失败: {:?}, {}", path, e);
            } else {
                deleted += 1;
            }
        }
    }

    if deleted > 0 {
        info!("已清理 {} 个过期日志文件", deleted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_writer_rotates_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RollingWriter::new(dir.path().to_path_buf(), 16).unwrap();

        writer.write_all(b"0123456789").unwrap();
        writer.write_all(b"0123456789").unwrap(); // 超出上限，触发滚动
        writer.flush().unwrap();

        let logs: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(logs.len(), 2);
    }

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.level, "info");
        assert_eq!(config.retention_days, 7);
    }
}
