//! 下载管理器
//!
//! 进程级单例：持有运行中任务的监督器注册表、事件总线、ffmpeg 探测结果
//! 与共享 HTTP 客户端，对外提供 start / pause / cancel / retry_merge 等
//! 生命周期命令。任务之间互不串行，核心不限制同时运行的任务数，
//! 全局并发上限由外层按设置记录自行实施。

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::{DownloadSettings, MuxerConfig};
use crate::downloader::segment::SegmentFetcher;
use crate::downloader::supervisor::{merge_and_finalize, TaskSupervisor};
use crate::downloader::task::{DownloadTask, TaskStatus};
use crate::events::{EventBus, TaskEvent};
use crate::muxer::{probe_segment_files, MuxerDriver};
use crate::playlist::MediaPlaylist;
use crate::store::{TaskStore, TaskUpdate};

/// 下载管理器
pub struct DownloadManager {
    /// 运行中任务的监督器（任务结束后移除）
    supervisors: Arc<RwLock<HashMap<String, Arc<TaskSupervisor>>>>,
    /// 任务存储
    store: Arc<dyn TaskStore>,
    /// 事件总线
    events: EventBus,
    /// 分片下载器（共享 HTTP 客户端）
    fetcher: SegmentFetcher,
    /// 合并驱动（构造时完成一次性 ffmpeg 探测）
    muxer: Arc<MuxerDriver>,
}

impl DownloadManager {
    /// 创建下载管理器
    ///
    /// HTTP 客户端构建失败与 ffmpeg 探测都在这里完成，初始化问题在
    /// 构造期暴露而不是首次使用时。
    pub fn new(store: Arc<dyn TaskStore>, muxer_config: MuxerConfig) -> Result<Self> {
        let fetcher = SegmentFetcher::new()?;
        let muxer = Arc::new(MuxerDriver::locate(muxer_config));
        Ok(Self {
            supervisors: Arc::new(RwLock::new(HashMap::new())),
            store,
            events: EventBus::new(),
            fetcher,
            muxer,
        })
    }

    /// 事件总线引用（外层订阅用）
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// 创建下载任务
    ///
    /// 分片列表来自已解析的媒体播放列表；threads / output_dir 缺省时
    /// 取设置记录中的默认值。按设置决定是否自动开始。
    pub async fn create_task(
        &self,
        source_url: String,
        playlist_url: String,
        filename: String,
        media: &MediaPlaylist,
        threads: Option<usize>,
        output_dir: Option<PathBuf>,
    ) -> Result<String> {
        let settings = self.store.load_settings()?;

        if media.is_live {
            warn!("播放列表带直播标记，按当前快照下载: {}", playlist_url);
        }

        let mut task = DownloadTask::new(
            source_url,
            playlist_url,
            filename,
            media.segments.clone(),
            threads.unwrap_or(settings.default_threads),
            output_dir.unwrap_or_else(|| settings.default_output_path.clone()),
        );
        if media.total_duration > 0.0 {
            task.duration = Some(media.total_duration);
        }

        let task_id = task.id.clone();
        self.store.insert_task(&task).context("写入任务记录失败")?;
        info!(
            "创建下载任务: id={}, 文件名={}, 分片数={}",
            task_id, task.filename, task.total_segments
        );

        self.events
            .publish(TaskEvent::status(task_id.as_str(), TaskStatus::Queued));

        if settings.auto_start {
            self.start_task(&task_id).await?;
        }

        Ok(task_id)
    }

    /// 开始或恢复下载
    ///
    /// 任务已在下载中时为幂等空操作；任务不存在或没有分片列表时报错。
    pub async fn start_task(&self, task_id: &str) -> Result<()> {
        if self.supervisors.read().await.contains_key(task_id) {
            info!("任务 {} 已在运行，忽略重复启动", task_id);
            return Ok(());
        }

        let task = self
            .store
            .get_task(task_id)?
            .context("任务不存在")?;

        if task.segments.is_empty() {
            anyhow::bail!("任务没有分片列表，无法下载");
        }
        match task.status {
            TaskStatus::Completed => anyhow::bail!("任务已完成"),
            TaskStatus::Cancelled => anyhow::bail!("任务已取消"),
            TaskStatus::Merging => anyhow::bail!("任务正在合并中"),
            _ => {}
        }

        let supervisor = Arc::new(TaskSupervisor::new(
            task_id.to_string(),
            self.store.clone(),
            self.events.clone(),
            self.fetcher.clone(),
            self.muxer.clone(),
        ));

        self.supervisors
            .write()
            .await
            .insert(task_id.to_string(), supervisor.clone());

        info!("启动下载任务: {}", task_id);

        let supervisors = self.supervisors.clone();
        let store = self.store.clone();
        let events = self.events.clone();
        let task_id_owned = task_id.to_string();

        tokio::spawn(async move {
            let result = supervisor.run().await;
            supervisors.write().await.remove(&task_id_owned);

            if let Err(e) = result {
                let message = e.to_string();
                error!("任务 {} 运行失败: {}", task_id_owned, message);
                if let Err(e) = store.update_task(
                    &task_id_owned,
                    TaskUpdate {
                        status: Some(TaskStatus::Error),
                        error_message: Some(Some(message.clone())),
                        ..Default::default()
                    },
                ) {
                    warn!("记录任务失败状态时出错: {}", e);
                }
                events.publish(TaskEvent::DownloadStatus {
                    task_id: task_id_owned.clone(),
                    status: TaskStatus::Error,
                    error_message: Some(message),
                    output_file: None,
                    message: None,
                });
            }
        });

        Ok(())
    }

    /// 暂停下载
    ///
    /// 协作式：清除存活令牌后，在途分片允许完成，未开始的在准入检查处
    /// 放弃。任务未在下载中时为空操作，不报错。磁盘上的分片保留。
    pub async fn pause_task(&self, task_id: &str) -> Result<()> {
        let was_running = match self.supervisors.write().await.remove(task_id) {
            Some(supervisor) => {
                supervisor.cancellation_token().cancel();
                true
            }
            None => false,
        };

        let task = match self.store.get_task(task_id)? {
            Some(task) => task,
            None => {
                warn!("暂停请求的任务不存在: {}", task_id);
                return Ok(());
            }
        };

        // 注册表里没有且记录也不在下载中 → 空操作
        if !was_running && task.status != TaskStatus::Downloading {
            return Ok(());
        }
        if task.status.is_terminal() {
            return Ok(());
        }

        self.store
            .update_task(task_id, TaskUpdate::status(TaskStatus::Paused))?;
        info!("暂停下载任务: {}", task_id);
        self.events
            .publish(TaskEvent::status(task_id, TaskStatus::Paused));
        Ok(())
    }

    /// 取消下载（幂等）
    ///
    /// 从注册表移除并清除存活令牌；分片文件保留在磁盘上，
    /// 同名新任务可以从它们继续。
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        if let Some(supervisor) = self.supervisors.write().await.remove(task_id) {
            supervisor.cancellation_token().cancel();
        }

        if let Some(task) = self.store.get_task(task_id)? {
            if !task.status.is_terminal() {
                self.store
                    .update_task(task_id, TaskUpdate::status(TaskStatus::Cancelled))?;
                info!("取消下载任务: {}", task_id);
                self.events
                    .publish(TaskEvent::status(task_id, TaskStatus::Cancelled));
            }
        }
        Ok(())
    }

    /// 重试合并
    ///
    /// 仅对已完成或失败的任务有效。监督器的分片文件列表在进程重启后
    /// 已不存在，这里按确定性路径重新探测。
    pub async fn retry_merge(&self, task_id: &str) -> Result<()> {
        let task = self
            .store
            .get_task(task_id)?
            .context("任务不存在")?;

        if !matches!(task.status, TaskStatus::Completed | TaskStatus::Error) {
            anyhow::bail!("仅已完成或失败的任务可以重试合并 (当前状态: {})", task.status);
        }

        let files = probe_segment_files(&task.output_dir, &task.filename, task.total_segments);
        if files.is_empty() {
            warn!("任务 {} 重试合并：未找到任何分片文件，跳过", task_id);
            self.events.publish(TaskEvent::DownloadStatus {
                task_id: task_id.to_string(),
                status: task.status,
                error_message: None,
                output_file: task.output_file.clone(),
                message: Some("未找到任何分片文件，跳过合并".to_string()),
            });
            return Ok(());
        }

        info!("任务 {} 重试合并: {} 个分片", task_id, files.len());
        self.store
            .update_task(task_id, TaskUpdate::status(TaskStatus::Merging))?;
        self.events
            .publish(TaskEvent::status(task_id, TaskStatus::Merging));

        merge_and_finalize(&self.store, &self.events, &self.muxer, &task, files).await
    }

    /// 删除任务记录
    ///
    /// 运行中的任务先取消；磁盘上的分片与产物文件不动。
    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        if let Some(supervisor) = self.supervisors.write().await.remove(task_id) {
            supervisor.cancellation_token().cancel();
        }
        self.store.delete_task(task_id)?;
        info!("删除下载任务: {}", task_id);
        Ok(())
    }

    /// 启动恢复：把上个进程遗留的 downloading/merging 任务置为暂停
    ///
    /// 随后对这些任务调用 `start_task` 即可按磁盘对账续传。
    pub async fn recover_stale_tasks(&self) -> Result<usize> {
        let mut recovered = 0;
        for task in self.store.list_tasks()? {
            if matches!(task.status, TaskStatus::Downloading | TaskStatus::Merging) {
                self.store
                    .update_task(&task.id, TaskUpdate::status(TaskStatus::Paused))?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!("恢复了 {} 个上次未结束的任务（置为暂停）", recovered);
        }
        Ok(recovered)
    }

    /// 读取任务
    pub fn get_task(&self, task_id: &str) -> Result<Option<DownloadTask>> {
        self.store.get_task(task_id)
    }

    /// 列出全部任务
    pub fn list_tasks(&self) -> Result<Vec<DownloadTask>> {
        self.store.list_tasks()
    }

    /// 当前运行中的任务数
    pub async fn active_count(&self) -> usize {
        self.supervisors.read().await.len()
    }

    /// 读取设置记录
    pub fn settings(&self) -> Result<DownloadSettings> {
        self.store.load_settings()
    }

    /// 保存设置记录
    pub fn update_settings(&self, settings: &DownloadSettings) -> Result<()> {
        self.store.save_settings(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTaskStore;
    use std::time::Duration;

    fn make_manager() -> (DownloadManager, Arc<dyn TaskStore>) {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        // 空探测列表：测试环境不依赖 ffmpeg
        let manager = DownloadManager::new(
            store.clone(),
            MuxerConfig {
                search_paths: vec![],
                output_extension: "mp4".to_string(),
            },
        )
        .unwrap();
        (manager, store)
    }

    fn media(segments: Vec<String>) -> MediaPlaylist {
        MediaPlaylist {
            segments,
            total_duration: 30.0,
            is_live: false,
        }
    }

    async fn wait_for_status(
        store: &Arc<dyn TaskStore>,
        task_id: &str,
        expected: TaskStatus,
    ) -> DownloadTask {
        for _ in 0..100 {
            let task = store.get_task(task_id).unwrap().unwrap();
            if task.status == expected {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("任务未在限时内达到状态 {}", expected);
    }

    #[tokio::test]
    async fn test_create_task_applies_defaults() {
        let (manager, store) = make_manager();
        let mut settings = DownloadSettings::default();
        settings.auto_start = false;
        settings.default_threads = 6;
        store.save_settings(&settings).unwrap();

        let id = manager
            .create_task(
                "https://example.com/page".into(),
                "https://example.com/index.m3u8".into(),
                "movie".into(),
                &media(vec!["https://example.com/s0.ts".into()]),
                None,
                None,
            )
            .await
            .unwrap();

        let task = store.get_task(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.threads, 6);
        assert_eq!(task.output_dir, settings.default_output_path);
        assert_eq!(task.duration, Some(30.0));
    }

    #[tokio::test]
    async fn test_start_missing_task_errors() {
        let (manager, _store) = make_manager();
        assert!(manager.start_task("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_start_completed_task_errors() {
        let (manager, store) = make_manager();
        let mut settings = DownloadSettings::default();
        settings.auto_start = false;
        store.save_settings(&settings).unwrap();

        let id = manager
            .create_task(
                "s".into(),
                "p".into(),
                "movie".into(),
                &media(vec!["https://example.com/s0.ts".into()]),
                None,
                None,
            )
            .await
            .unwrap();
        store
            .update_task(&id, TaskUpdate::status(TaskStatus::Completed))
            .unwrap();

        assert!(manager.start_task(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_pause_not_downloading_is_noop() {
        let (manager, store) = make_manager();
        let mut settings = DownloadSettings::default();
        settings.auto_start = false;
        store.save_settings(&settings).unwrap();

        let id = manager
            .create_task(
                "s".into(),
                "p".into(),
                "movie".into(),
                &media(vec!["https://example.com/s0.ts".into()]),
                None,
                None,
            )
            .await
            .unwrap();

        manager.pause_task(&id).await.unwrap();
        let task = store.get_task(&id).unwrap().unwrap();
        // 未在下载中：状态不变
        assert_eq!(task.status, TaskStatus::Queued);

        // 不存在的任务也不报错
        manager.pause_task("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_respects_terminal() {
        let (manager, store) = make_manager();
        let mut settings = DownloadSettings::default();
        settings.auto_start = false;
        store.save_settings(&settings).unwrap();

        let id = manager
            .create_task(
                "s".into(),
                "p".into(),
                "movie".into(),
                &media(vec!["https://example.com/s0.ts".into()]),
                None,
                None,
            )
            .await
            .unwrap();

        manager.cancel_task(&id).await.unwrap();
        assert_eq!(
            store.get_task(&id).unwrap().unwrap().status,
            TaskStatus::Cancelled
        );
        // 再次取消：幂等
        manager.cancel_task(&id).await.unwrap();

        // 已完成的任务不会被取消改写
        store
            .update_task(&id, TaskUpdate::status(TaskStatus::Completed))
            .unwrap();
        manager.cancel_task(&id).await.unwrap();
        assert_eq!(
            store.get_task(&id).unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_retry_merge_status_guard() {
        let (manager, store) = make_manager();
        let mut settings = DownloadSettings::default();
        settings.auto_start = false;
        store.save_settings(&settings).unwrap();

        let id = manager
            .create_task(
                "s".into(),
                "p".into(),
                "movie".into(),
                &media(vec!["https://example.com/s0.ts".into()]),
                None,
                None,
            )
            .await
            .unwrap();

        // queued 状态不允许重试合并
        assert!(manager.retry_merge(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_merge_without_segments_is_noop() {
        let (manager, store) = make_manager();
        let dir = tempfile::tempdir().unwrap();
        let mut settings = DownloadSettings::default();
        settings.auto_start = false;
        settings.default_output_path = dir.path().to_path_buf();
        store.save_settings(&settings).unwrap();

        let id = manager
            .create_task(
                "s".into(),
                "p".into(),
                "movie".into(),
                &media(vec!["https://example.com/s0.ts".into()]),
                None,
                None,
            )
            .await
            .unwrap();
        store
            .update_task(&id, TaskUpdate::status(TaskStatus::Error))
            .unwrap();

        // 磁盘上没有分片：空操作，状态保持 error
        manager.retry_merge(&id).await.unwrap();
        assert_eq!(
            store.get_task(&id).unwrap().unwrap().status,
            TaskStatus::Error
        );
    }

    #[tokio::test]
    async fn test_retry_merge_with_segments_completes() {
        let (manager, store) = make_manager();
        let dir = tempfile::tempdir().unwrap();
        let mut settings = DownloadSettings::default();
        settings.auto_start = false;
        settings.default_output_path = dir.path().to_path_buf();
        store.save_settings(&settings).unwrap();

        let id = manager
            .create_task(
                "s".into(),
                "p".into(),
                "movie".into(),
                &media(vec![
                    "https://example.com/s0.ts".into(),
                    "https://example.com/s1.ts".into(),
                ]),
                None,
                None,
            )
            .await
            .unwrap();

        std::fs::write(dir.path().join("movie_segment_0.ts"), b"AA").unwrap();
        std::fs::write(dir.path().join("movie_segment_1.ts"), b"BB").unwrap();
        store
            .update_task(&id, TaskUpdate::status(TaskStatus::Completed))
            .unwrap();

        manager.retry_merge(&id).await.unwrap();

        let task = store.get_task(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let output = task.output_file.expect("应记录产物路径");
        assert_eq!(std::fs::read(&output).unwrap(), b"AABB");
    }

    #[tokio::test]
    async fn test_start_with_all_segments_on_disk_runs_to_completion() {
        let (manager, store) = make_manager();
        let dir = tempfile::tempdir().unwrap();
        let mut settings = DownloadSettings::default();
        settings.auto_start = false;
        settings.default_output_path = dir.path().to_path_buf();
        store.save_settings(&settings).unwrap();

        let id = manager
            .create_task(
                "s".into(),
                "p".into(),
                "movie".into(),
                &media(vec![
                    "https://example.com/s0.ts".into(),
                    "https://example.com/s1.ts".into(),
                ]),
                None,
                None,
            )
            .await
            .unwrap();

        // 分片都已在磁盘上：启动后直接对账并合并，无网络请求
        std::fs::write(dir.path().join("movie_segment_0.ts"), b"XY").unwrap();
        std::fs::write(dir.path().join("movie_segment_1.ts"), b"Z").unwrap();

        manager.start_task(&id).await.unwrap();

        let task = wait_for_status(&store, &id, TaskStatus::Completed).await;
        assert_eq!(task.downloaded_segments, 2);
        assert_eq!(task.progress, 100.0);
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_recover_stale_tasks() {
        let (manager, store) = make_manager();
        let mut settings = DownloadSettings::default();
        settings.auto_start = false;
        store.save_settings(&settings).unwrap();

        let id = manager
            .create_task(
                "s".into(),
                "p".into(),
                "movie".into(),
                &media(vec!["https://example.com/s0.ts".into()]),
                None,
                None,
            )
            .await
            .unwrap();
        store
            .update_task(&id, TaskUpdate::status(TaskStatus::Downloading))
            .unwrap();

        let recovered = manager.recover_stale_tasks().await.unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(
            store.get_task(&id).unwrap().unwrap().status,
            TaskStatus::Paused
        );
    }

    #[tokio::test]
    async fn test_delete_task_removes_record() {
        let (manager, store) = make_manager();
        let mut settings = DownloadSettings::default();
        settings.auto_start = false;
        store.save_settings(&settings).unwrap();

        let id = manager
            .create_task(
                "s".into(),
                "p".into(),
                "movie".into(),
                &media(vec!["https://example.com/s0.ts".into()]),
                None,
                None,
            )
            .await
            .unwrap();

        manager.delete_task(&id).await.unwrap();
        assert!(store.get_task(&id).unwrap().is_none());
    }
}
