//! SQLite 任务存储
//!
//! 单文件嵌入式数据库。连接由互斥锁保护，`update_task` 在持锁期间完成
//! 读-改-写，天然满足"每次调用原子"的约定。

use anyhow::{anyhow, Context, Result};
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

use crate::config::DownloadSettings;
use crate::downloader::task::{DownloadTask, TaskStatus};
use crate::store::{TaskStore, TaskUpdate};

/// SQLite 存储
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// 打开（或创建）数据库文件
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).context("创建数据库目录失败")?;
        }
        let conn = Connection::open(db_path).context("打开数据库失败")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        info!("任务数据库已就绪: {:?}", db_path);
        Ok(store)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("打开内存数据库失败")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                source_url TEXT NOT NULL,
                playlist_url TEXT NOT NULL,
                filename TEXT NOT NULL,
                status TEXT NOT NULL,
                threads INTEGER NOT NULL,
                output_dir TEXT NOT NULL,
                segments_json TEXT NOT NULL,
                total_segments INTEGER NOT NULL,
                downloaded_segments INTEGER NOT NULL DEFAULT 0,
                file_size INTEGER NOT NULL DEFAULT 0,
                downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                progress REAL NOT NULL DEFAULT 0,
                speed INTEGER NOT NULL DEFAULT 0,
                eta INTEGER NOT NULL DEFAULT 0,
                output_file TEXT,
                duration REAL,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status, created_at)",
            [],
        )?;

        // 设置单例：固定主键 1，内容整体存 JSON
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                settings_json TEXT NOT NULL
            )
            "#,
            [],
        )?;

        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))
    }

    fn row_to_task(row: &Row<'_>) -> rusqlite::Result<DownloadTask> {
        let status_str: String = row.get("status")?;
        let segments_json: String = row.get("segments_json")?;
        let output_dir: String = row.get("output_dir")?;
        let created_at: i64 = row.get("created_at")?;
        let updated_at: i64 = row.get("updated_at")?;

        Ok(DownloadTask {
            id: row.get("id")?,
            source_url: row.get("source_url")?,
            playlist_url: row.get("playlist_url")?,
            filename: row.get("filename")?,
            status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Error),
            threads: row.get::<_, i64>("threads")? as usize,
            output_dir: PathBuf::from(output_dir),
            segments: serde_json::from_str(&segments_json).unwrap_or_default(),
            total_segments: row.get::<_, i64>("total_segments")? as usize,
            downloaded_segments: row.get::<_, i64>("downloaded_segments")? as usize,
            file_size: row.get::<_, i64>("file_size")? as u64,
            downloaded_bytes: row.get::<_, i64>("downloaded_bytes")? as u64,
            progress: row.get("progress")?,
            speed: row.get::<_, i64>("speed")? as u64,
            eta: row.get::<_, i64>("eta")? as u64,
            output_file: row.get("output_file")?,
            duration: row.get("duration")?,
            error_message: row.get("error_message")?,
            created_at: Utc.timestamp_opt(created_at, 0).single().unwrap_or_default(),
            updated_at: Utc.timestamp_opt(updated_at, 0).single().unwrap_or_default(),
        })
    }

    fn write_task(conn: &Connection, task: &DownloadTask) -> Result<()> {
        let segments_json = serde_json::to_string(&task.segments)?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO downloads (
                id, source_url, playlist_url, filename, status, threads,
                output_dir, segments_json, total_segments, downloaded_segments,
                file_size, downloaded_bytes, progress, speed, eta,
                output_file, duration, error_message, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                      ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            "#,
            params![
                task.id,
                task.source_url,
                task.playlist_url,
                task.filename,
                task.status.as_str(),
                task.threads as i64,
                task.output_dir.to_string_lossy().to_string(),
                segments_json,
                task.total_segments as i64,
                task.downloaded_segments as i64,
                task.file_size as i64,
                task.downloaded_bytes as i64,
                task.progress,
                task.speed as i64,
                task.eta as i64,
                task.output_file,
                task.duration,
                task.error_message,
                task.created_at.timestamp(),
                task.updated_at.timestamp(),
            ],
        )?;
        Ok(())
    }
}

impl TaskStore for SqliteTaskStore {
    fn insert_task(&self, task: &DownloadTask) -> Result<()> {
        let conn = self.lock_conn()?;
        Self::write_task(&conn, task).context("写入任务记录失败")
    }

    fn get_task(&self, id: &str) -> Result<Option<DownloadTask>> {
        let conn = self.lock_conn()?;
        let task = conn
            .query_row(
                "SELECT * FROM downloads WHERE id = ?1",
                params![id],
                Self::row_to_task,
            )
            .optional()
            .context("查询任务记录失败")?;
        Ok(task)
    }

    fn list_tasks(&self) -> Result<Vec<DownloadTask>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT * FROM downloads ORDER BY created_at")?;
        let tasks = stmt
            .query_map([], Self::row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("读取任务列表失败")?;
        Ok(tasks)
    }

    fn update_task(&self, id: &str, update: TaskUpdate) -> Result<()> {
        let conn = self.lock_conn()?;
        let mut task = conn
            .query_row(
                "SELECT * FROM downloads WHERE id = ?1",
                params![id],
                Self::row_to_task,
            )
            .optional()
            .context("查询任务记录失败")?
            .ok_or_else(|| anyhow!("任务不存在: {}", id))?;

        update.apply(&mut task);
        Self::write_task(&conn, &task).context("写回任务记录失败")
    }

    fn delete_task(&self, id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM downloads WHERE id = ?1", params![id])
            .context("删除任务记录失败")?;
        Ok(())
    }

    fn load_settings(&self) -> Result<DownloadSettings> {
        let conn = self.lock_conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT settings_json FROM settings WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("读取设置失败")?;

        match json {
            Some(json) => serde_json::from_str(&json).context("解析设置失败"),
            None => Ok(DownloadSettings::default()),
        }
    }

    fn save_settings(&self, settings: &DownloadSettings) -> Result<()> {
        let conn = self.lock_conn()?;
        let json = serde_json::to_string(settings)?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (id, settings_json) VALUES (1, ?1)",
            params![json],
        )
        .context("保存设置失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> DownloadTask {
        DownloadTask::new(
            "https://example.com/page".into(),
            "https://example.com/index.m3u8".into(),
            "movie".into(),
            vec![
                "https://example.com/seg0.ts".into(),
                "https://example.com/seg1.ts".into(),
            ],
            4,
            PathBuf::from("/tmp/dl"),
        )
    }

    #[test]
    fn test_insert_and_get_roundtrip() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let task = sample_task();
        store.insert_task(&task).unwrap();

        let loaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.segments, task.segments);
        assert_eq!(loaded.status, TaskStatus::Queued);
        assert_eq!(loaded.output_dir, PathBuf::from("/tmp/dl"));
        assert_eq!(loaded.total_segments, 2);
    }

    #[test]
    fn test_get_missing_returns_none() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        assert!(store.get_task("ghost").unwrap().is_none());
    }

    #[test]
    fn test_partial_update() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let task = sample_task();
        store.insert_task(&task).unwrap();

        store
            .update_task(
                &task.id,
                TaskUpdate {
                    status: Some(TaskStatus::Downloading),
                    downloaded_segments: Some(1),
                    progress: Some(50.0),
                    speed: Some(4096),
                    ..Default::default()
                },
            )
            .unwrap();

        let loaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Downloading);
        assert_eq!(loaded.downloaded_segments, 1);
        assert_eq!(loaded.progress, 50.0);
        assert_eq!(loaded.speed, 4096);
        // 未更新字段保持原样
        assert_eq!(loaded.downloaded_bytes, 0);
        assert_eq!(loaded.filename, "movie");
    }

    #[test]
    fn test_update_missing_task_errors() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        assert!(store
            .update_task("ghost", TaskUpdate::status(TaskStatus::Paused))
            .is_err());
    }

    #[test]
    fn test_delete_task() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let task = sample_task();
        store.insert_task(&task).unwrap();
        store.delete_task(&task.id).unwrap();
        assert!(store.get_task(&task.id).unwrap().is_none());
        // 删除不存在的任务不报错
        store.delete_task(&task.id).unwrap();
    }

    #[test]
    fn test_settings_roundtrip() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        assert_eq!(store.load_settings().unwrap(), DownloadSettings::default());

        let mut settings = DownloadSettings::default();
        settings.auto_start = false;
        settings.default_output_path = PathBuf::from("/data/media");
        store.save_settings(&settings).unwrap();

        let loaded = store.load_settings().unwrap();
        assert!(!loaded.auto_start);
        assert_eq!(loaded.default_output_path, PathBuf::from("/data/media"));
    }

    #[test]
    fn test_list_tasks_ordered() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let t1 = sample_task();
        let mut t2 = sample_task();
        t2.created_at = t1.created_at + chrono::Duration::seconds(10);
        store.insert_task(&t1).unwrap();
        store.insert_task(&t2).unwrap();

        let tasks = store.list_tasks().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, t1.id);
        assert_eq!(tasks[1].id, t2.id);
    }
}
