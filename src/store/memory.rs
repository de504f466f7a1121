//! 内存任务存储
//!
//! 无持久化，进程退出即丢失。用于测试与"纯临时下载"场景。

use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::config::DownloadSettings;
use crate::downloader::task::DownloadTask;
use crate::store::{TaskStore, TaskUpdate};

/// 内存存储
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, DownloadTask>>,
    settings: RwLock<Option<DownloadSettings>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryTaskStore {
    fn insert_task(&self, task: &DownloadTask) -> Result<()> {
        self.tasks.write().insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn get_task(&self, id: &str) -> Result<Option<DownloadTask>> {
        Ok(self.tasks.read().get(id).cloned())
    }

    fn list_tasks(&self) -> Result<Vec<DownloadTask>> {
        let mut tasks: Vec<_> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    fn update_task(&self, id: &str, update: TaskUpdate) -> Result<()> {
        // 写锁内完成读-改-写，满足原子性要求
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("任务不存在: {}", id))?;
        update.apply(task);
        Ok(())
    }

    fn delete_task(&self, id: &str) -> Result<()> {
        self.tasks.write().remove(id);
        Ok(())
    }

    fn load_settings(&self) -> Result<DownloadSettings> {
        Ok(self.settings.read().clone().unwrap_or_default())
    }

    fn save_settings(&self, settings: &DownloadSettings) -> Result<()> {
        *self.settings.write() = Some(settings.clone());
        Ok(())
    }
}
