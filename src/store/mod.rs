//! 任务元数据存储
//!
//! 核心通过 [`TaskStore`] 接口读写任务记录与设置单例，不假设具体实现。
//! 提供内存实现（测试、无持久化场景）与嵌入式 SQLite 实现。
//!
//! `update_task` 的语义是"每次调用原子的读-改-写"：实现内部必须在单个
//! 锁/事务内加载记录、应用 [`TaskUpdate`]、写回，并刷新 `updated_at`。

pub mod memory;
pub mod sqlite;

pub use memory::MemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use anyhow::Result;

use crate::config::DownloadSettings;
use crate::downloader::task::{DownloadTask, TaskStatus};

/// 任务记录的部分更新
///
/// 只有 `Some` 的字段会被写入。`output_file` / `duration` / `error_message`
/// 用双层 Option 表达"置空"。
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub downloaded_segments: Option<usize>,
    pub downloaded_bytes: Option<u64>,
    pub file_size: Option<u64>,
    pub progress: Option<f64>,
    pub speed: Option<u64>,
    pub eta: Option<u64>,
    pub output_file: Option<Option<String>>,
    pub duration: Option<Option<f64>>,
    pub error_message: Option<Option<String>>,
}

impl TaskUpdate {
    /// 仅更新状态
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// 应用到任务记录上（两种实现共用）
    pub fn apply(&self, task: &mut DownloadTask) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(v) = self.downloaded_segments {
            task.downloaded_segments = v;
        }
        if let Some(v) = self.downloaded_bytes {
            task.downloaded_bytes = v;
        }
        if let Some(v) = self.file_size {
            task.file_size = v;
        }
        if let Some(v) = self.progress {
            task.progress = v;
        }
        if let Some(v) = self.speed {
            task.speed = v;
        }
        if let Some(v) = self.eta {
            task.eta = v;
        }
        if let Some(ref v) = self.output_file {
            task.output_file = v.clone();
        }
        if let Some(v) = self.duration {
            task.duration = v;
        }
        if let Some(ref v) = self.error_message {
            task.error_message = v.clone();
        }
        task.touch();
    }
}

/// 任务存储接口
pub trait TaskStore: Send + Sync {
    /// 插入新任务记录
    fn insert_task(&self, task: &DownloadTask) -> Result<()>;

    /// 按 ID 读取任务
    fn get_task(&self, id: &str) -> Result<Option<DownloadTask>>;

    /// 列出全部任务
    fn list_tasks(&self) -> Result<Vec<DownloadTask>>;

    /// 部分更新任务（原子读-改-写；任务不存在时返回错误）
    fn update_task(&self, id: &str, update: TaskUpdate) -> Result<()>;

    /// 删除任务记录（不负责删除磁盘上的分片与产物文件）
    fn delete_task(&self, id: &str) -> Result<()>;

    /// 读取设置单例；未保存过时返回默认值
    fn load_settings(&self) -> Result<DownloadSettings>;

    /// 保存设置单例
    fn save_settings(&self, settings: &DownloadSettings) -> Result<()>;
}
