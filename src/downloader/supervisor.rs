//! 任务监督器
//!
//! 每个运行中的任务对应一个监督器实例：持有该任务的全部临时状态
//! （磁盘对账结果、失败集合、分片文件列表、速度统计），驱动并发受限的
//! 分片下载，并在全部分片尘埃落定后执行完成判定与合并。
//!
//! 取消是协作式的：`pause`/`cancel` 只清除存活令牌，未开始的分片在准入
//! 检查处放弃，已在途的分片允许完成并照常入账（这会加速后续续传）。

use anyhow::{Context, Result};
use bit_set::BitSet;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::downloader::progress::SessionStats;
use crate::downloader::segment::SegmentFetcher;
use crate::downloader::task::{round2_percent, DownloadTask, TaskStatus};
use crate::events::{EventBus, ProgressThrottler, TaskEvent};
use crate::muxer::{sort_segments, MuxerDriver};
use crate::store::{TaskStore, TaskUpdate};

/// 完成判定阈值：已完成比例达到该值即可收尾
const COMPLETION_RATIO: f64 = 0.98;
/// 允许失败的分片比例
const FAILURE_RATIO: f64 = 0.02;

/// 单次运行的临时状态（不持久化，进程内有效）
struct RunState {
    /// 已存在于磁盘的分片索引
    existing: BitSet,
    /// 本次运行中重试耗尽的分片索引
    failed: HashSet<usize>,
    /// 已落盘的分片文件路径
    segment_files: Vec<PathBuf>,
    /// 累计已下载字节（含之前运行遗留的部分）
    downloaded_bytes: u64,
    /// 速度与 ETA 统计
    stats: SessionStats,
}

/// 任务监督器
pub struct TaskSupervisor {
    task_id: String,
    store: Arc<dyn TaskStore>,
    events: EventBus,
    fetcher: SegmentFetcher,
    muxer: Arc<MuxerDriver>,
    token: CancellationToken,
    throttler: ProgressThrottler,
    state: Mutex<RunState>,
}

impl TaskSupervisor {
    pub fn new(
        task_id: String,
        store: Arc<dyn TaskStore>,
        events: EventBus,
        fetcher: SegmentFetcher,
        muxer: Arc<MuxerDriver>,
    ) -> Self {
        Self {
            task_id,
            store,
            events,
            fetcher,
            muxer,
            token: CancellationToken::new(),
            throttler: ProgressThrottler::default(),
            state: Mutex::new(RunState {
                existing: BitSet::new(),
                failed: HashSet::new(),
                segment_files: Vec::new(),
                downloaded_bytes: 0,
                stats: SessionStats::new(),
            }),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// 存活令牌；pause/cancel 通过它通知工作者
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 启动协议：加载记录 → 磁盘对账 → 并发下载缺失分片 → 完成判定与合并
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let task = self
            .store
            .get_task(&self.task_id)?
            .context("任务不存在")?;

        if task.segments.is_empty() {
            anyhow::bail!("任务没有分片列表，无法下载");
        }

        self.store
            .update_task(&self.task_id, TaskUpdate::status(TaskStatus::Downloading))
            .context("更新任务状态失败")?;

        tokio::fs::create_dir_all(&task.output_dir)
            .await
            .context("创建输出目录失败")?;

        // 磁盘对账：已有的非空分片直接入账，空文件按缺失处理（会被覆盖）
        let (existing, segment_files) = reconcile_segments(&task);
        let existing_count = existing.len();
        {
            let mut state = self.state.lock().await;
            state.existing = existing;
            state.segment_files = segment_files;
            state.downloaded_bytes = task.downloaded_bytes;
            state.failed.clear();
            state.stats = SessionStats::new();
        }

        if existing_count > 0 {
            info!(
                "任务 {} 续传：磁盘上已有 {}/{} 个分片",
                self.task_id, existing_count, task.total_segments
            );
        }

        if let Err(e) = self.store.update_task(
            &self.task_id,
            TaskUpdate {
                downloaded_segments: Some(existing_count),
                progress: Some(round2_percent(existing_count, task.total_segments)),
                ..Default::default()
            },
        ) {
            warn!("持久化对账结果失败: {}", e);
        }

        self.events
            .publish(TaskEvent::status(self.task_id.as_str(), TaskStatus::Downloading));

        // 缺失的分片按提交顺序排队下载
        let missing: Vec<(usize, String)> = {
            let state = self.state.lock().await;
            task.segments
                .iter()
                .enumerate()
                .filter(|(i, _)| !state.existing.contains(*i))
                .map(|(i, url)| (i, url.clone()))
                .collect()
        };

        if !missing.is_empty() {
            info!(
                "任务 {} 开始下载 {} 个分片 (并发 {})",
                self.task_id,
                missing.len(),
                task.threads
            );
            Self::fetch_missing(&self, &task, missing).await;
        }

        self.finish(&task).await
    }

    /// 并发受限地下载缺失分片
    ///
    /// 所有分片立即 spawn，在任务内部等待信号量额度；拿到额度后先过
    /// 准入检查（存活令牌），再发起请求。
    async fn fetch_missing(supervisor: &Arc<Self>, task: &DownloadTask, missing: Vec<(usize, String)>) {
        let semaphore = Arc::new(Semaphore::new(task.threads.max(1)));
        let mut handles = Vec::with_capacity(missing.len());

        for (index, url) in missing {
            let supervisor = Arc::clone(supervisor);
            let semaphore = semaphore.clone();
            let output_dir = task.output_dir.clone();
            let stem = task.filename.clone();
            let total = task.total_segments;

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };

                // 准入检查：暂停/取消后未开始的分片直接放弃
                if supervisor.token.is_cancelled() {
                    debug!("分片 #{} 在准入检查处放弃（任务已暂停/取消）", index);
                    return;
                }

                match supervisor
                    .fetcher
                    .fetch(&url, index, &output_dir, &stem, &supervisor.token)
                    .await
                {
                    Ok((path, size)) => {
                        supervisor.on_segment_done(index, path, size, total).await;
                    }
                    Err(e) => {
                        supervisor.on_segment_failed(index, e).await;
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    /// 分片成功：入账、持久化、按节流发布进度事件
    async fn on_segment_done(&self, index: usize, path: PathBuf, size: u64, total: usize) {
        let mut state = self.state.lock().await;
        if !state.existing.insert(index) {
            // 重复完成（例如对账与在途下载竞争），不重复入账
            return;
        }
        state.segment_files.push(path);
        state.downloaded_bytes += size;
        state.stats.record_segment();

        let downloaded = state.existing.len();
        let failed = state.failed.len();
        let downloaded_bytes = state.downloaded_bytes;
        let progress = round2_percent(downloaded, total);
        let speed = state.stats.speed(downloaded_bytes);
        let eta = state.stats.eta(total, downloaded, failed);

        // 持久化与发布都在锁内完成，保证读侧观察到的进度单调不减
        if let Err(e) = self.store.update_task(
            &self.task_id,
            TaskUpdate {
                downloaded_segments: Some(downloaded),
                downloaded_bytes: Some(downloaded_bytes),
                progress: Some(progress),
                speed: Some(speed),
                eta: Some(eta),
                ..Default::default()
            },
        ) {
            warn!("持久化进度失败: {}", e);
        }

        let is_last = downloaded >= total;
        if is_last {
            self.throttler.force_emit();
        }
        if is_last || self.throttler.should_emit() {
            self.events.publish(TaskEvent::DownloadProgress {
                task_id: self.task_id.clone(),
                progress,
                downloaded_segments: downloaded,
                speed,
                eta,
                downloaded_bytes,
            });
        }
    }

    /// 分片失败：记入失败集合，任务继续
    ///
    /// 因暂停/取消中断的分片不算失败。
    async fn on_segment_failed(&self, index: usize, err: anyhow::Error) {
        if self.token.is_cancelled() {
            debug!("分片 #{} 因任务暂停/取消中断", index);
            return;
        }
        warn!("分片 #{} 重试耗尽: {}", index, err);
        self.state.lock().await.failed.insert(index);
    }

    /// 完成判定与收尾
    async fn finish(&self, task: &DownloadTask) -> Result<()> {
        // 暂停/取消时不做终态判定，状态已由发起方设置
        if self.token.is_cancelled() {
            debug!("任务 {} 已暂停/取消，跳过完成判定", self.task_id);
            return Ok(());
        }

        let (downloaded, failed, segment_files) = {
            let state = self.state.lock().await;
            (
                state.existing.len(),
                state.failed.len(),
                state.segment_files.clone(),
            )
        };
        let total = task.total_segments;

        if !is_complete(downloaded, failed, total) {
            let message = format!(
                "下载失败: {}/{} 个分片完成, {} 个分片失败",
                downloaded, total, failed
            );
            error!("任务 {} {}", self.task_id, message);
            self.store.update_task(
                &self.task_id,
                TaskUpdate {
                    status: Some(TaskStatus::Error),
                    error_message: Some(Some(message.clone())),
                    ..Default::default()
                },
            )?;
            self.events.publish(TaskEvent::DownloadStatus {
                task_id: self.task_id.clone(),
                status: TaskStatus::Error,
                error_message: Some(message),
                output_file: None,
                message: None,
            });
            return Ok(());
        }

        if failed > 0 {
            warn!(
                "任务 {} 在 {} 个分片失败的情况下达到完成阈值 ({}/{})",
                self.task_id, failed, downloaded, total
            );
        }

        // 进入合并阶段
        let ratio = downloaded as f64 / total as f64;
        let progress = (ratio * 100.0).round().min(100.0);
        self.store.update_task(
            &self.task_id,
            TaskUpdate {
                status: Some(TaskStatus::Merging),
                progress: Some(progress),
                ..Default::default()
            },
        )?;
        self.events
            .publish(TaskEvent::status(self.task_id.as_str(), TaskStatus::Merging));

        merge_and_finalize(&self.store, &self.events, &self.muxer, task, segment_files).await?;

        // 清理临时状态
        let mut state = self.state.lock().await;
        state.failed.clear();
        state.segment_files.clear();

        Ok(())
    }
}

/// 磁盘对账：探测 `0..total` 的确定性路径，非空文件视为已完成
fn reconcile_segments(task: &DownloadTask) -> (BitSet, Vec<PathBuf>) {
    let mut existing = BitSet::with_capacity(task.total_segments);
    let mut files = Vec::new();
    for index in 0..task.total_segments {
        let path = task.segment_path(index);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.len() > 0 => {
                existing.insert(index);
                files.push(path);
            }
            _ => {}
        }
    }
    (existing, files)
}

/// 完成判定
///
/// 满足其一即视为完成：
/// 1. 全部分片完成；
/// 2. 完成比例 ≥ 98% 且至少完成一个；
/// 3. 完成 + 失败覆盖全部，且失败数不超过 max(2, ⌈2%⌉)。
fn is_complete(downloaded: usize, failed: usize, total: usize) -> bool {
    if total == 0 {
        return false;
    }
    if downloaded >= total {
        return true;
    }
    let ratio = downloaded as f64 / total as f64;
    if ratio >= COMPLETION_RATIO && downloaded > 0 {
        return true;
    }
    downloaded + failed >= total && failed <= allowed_failures(total)
}

/// 允许失败的分片数：max(2, ⌈总数 × 2%⌉)
fn allowed_failures(total: usize) -> usize {
    ((total as f64 * FAILURE_RATIO).ceil() as usize).max(2)
}

/// 合并并落最终状态
///
/// 失败阶梯：ffmpeg 失败 → 二进制拼接；拼接也失败 → 任务仍记完成，
/// `error_message` 说明合并失败，分片文件保留。
pub(crate) async fn merge_and_finalize(
    store: &Arc<dyn TaskStore>,
    events: &EventBus,
    muxer: &MuxerDriver,
    task: &DownloadTask,
    mut segment_files: Vec<PathBuf>,
) -> Result<()> {
    sort_segments(&mut segment_files);

    let progress_events = events.clone();
    let progress_id = task.id.clone();
    let on_progress = move |progress: f64| {
        progress_events.publish(TaskEvent::MergeProgress {
            task_id: progress_id.clone(),
            progress,
        });
    };

    let mut note: Option<String> = None;
    let merge_result = if muxer.is_available() {
        match muxer
            .merge_with_ffmpeg(
                &task.output_dir,
                &task.filename,
                &segment_files,
                task.duration,
                on_progress,
            )
            .await
        {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!("任务 {} ffmpeg 合并失败，回退为二进制拼接: {}", task.id, e);
                note = Some(format!("ffmpeg 合并失败，已回退为二进制拼接: {}", e));
                muxer
                    .concat_segments(&task.output_dir, &task.filename, &segment_files)
                    .await
            }
        }
    } else {
        note = Some("未找到 ffmpeg，已使用二进制拼接".to_string());
        muxer
            .concat_segments(&task.output_dir, &task.filename, &segment_files)
            .await
    };

    match merge_result {
        Ok(result) => {
            let output_file = result.output_file.to_string_lossy().to_string();
            store.update_task(
                &task.id,
                TaskUpdate {
                    status: Some(TaskStatus::Completed),
                    output_file: Some(Some(output_file.clone())),
                    duration: Some(result.duration.or(task.duration)),
                    error_message: Some(None),
                    ..Default::default()
                },
            )?;
            info!("任务 {} 完成: {}", task.id, output_file);
            events.publish(TaskEvent::DownloadStatus {
                task_id: task.id.clone(),
                status: TaskStatus::Completed,
                error_message: None,
                output_file: Some(output_file),
                message: note,
            });
        }
        Err(e) => {
            // 下载本身成功，合并失败只记录错误信息，分片保留以便重试合并
            let message = format!("合并失败: {}", e);
            error!("任务 {} {}", task.id, message);
            store.update_task(
                &task.id,
                TaskUpdate {
                    status: Some(TaskStatus::Completed),
                    error_message: Some(Some(message.clone())),
                    ..Default::default()
                },
            )?;
            events.publish(TaskEvent::DownloadStatus {
                task_id: task.id.clone(),
                status: TaskStatus::Completed,
                error_message: Some(message),
                output_file: None,
                message: None,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MuxerConfig;
    use crate::store::MemoryTaskStore;
    use std::path::Path;

    fn make_task(dir: &Path, segment_count: usize) -> DownloadTask {
        DownloadTask::new(
            "https://example.com/page".into(),
            "https://example.com/index.m3u8".into(),
            "movie".into(),
            (0..segment_count)
                .map(|i| format!("https://example.com/seg{}.ts", i))
                .collect(),
            4,
            dir.to_path_buf(),
        )
    }

    #[test]
    fn test_allowed_failures_floor() {
        assert_eq!(allowed_failures(10), 2);
        assert_eq!(allowed_failures(100), 2);
        assert_eq!(allowed_failures(150), 3);
        assert_eq!(allowed_failures(1000), 20);
    }

    #[test]
    fn test_completion_rules() {
        // 规则 1：全部完成
        assert!(is_complete(10, 0, 10));
        // 规则 2：达到 98%
        assert!(is_complete(49, 0, 50));
        assert!(is_complete(99, 1, 100));
        // 规则 3：失败数在允许范围内且全部尘埃落定
        assert!(is_complete(98, 2, 100));
        // 失败过多
        assert!(!is_complete(97, 3, 100));
        // 还有分片未定（既未完成也未失败）
        assert!(!is_complete(90, 2, 100));
        // 未完成
        assert!(!is_complete(5, 0, 10));
        assert!(!is_complete(0, 0, 10));
    }

    #[test]
    fn test_reconcile_classifies_empty_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let task = make_task(dir.path(), 4);

        std::fs::write(task.segment_path(0), b"data0").unwrap();
        std::fs::write(task.segment_path(1), b"").unwrap(); // 空文件按缺失处理
        std::fs::write(task.segment_path(3), b"data3").unwrap();

        let (existing, files) = reconcile_segments(&task);
        assert!(existing.contains(0));
        assert!(!existing.contains(1));
        assert!(!existing.contains(2));
        assert!(existing.contains(3));
        assert_eq!(files, vec![task.segment_path(0), task.segment_path(3)]);
    }

    fn offline_supervisor(store: Arc<dyn TaskStore>, task_id: String) -> Arc<TaskSupervisor> {
        // 空搜索列表：合并走二进制拼接，测试不依赖 ffmpeg
        let muxer = Arc::new(MuxerDriver::locate(MuxerConfig {
            search_paths: vec![],
            output_extension: "mp4".to_string(),
        }));
        Arc::new(TaskSupervisor::new(
            task_id,
            store,
            EventBus::new(),
            SegmentFetcher::new().unwrap(),
            muxer,
        ))
    }

    #[tokio::test]
    async fn test_run_with_all_segments_on_disk_completes() {
        let dir = tempfile::tempdir().unwrap();
        let task = make_task(dir.path(), 3);
        let task_id = task.id.clone();

        // 预先写好全部分片，run() 无需任何网络请求
        std::fs::write(task.segment_path(0), b"AAA").unwrap();
        std::fs::write(task.segment_path(1), b"BB").unwrap();
        std::fs::write(task.segment_path(2), b"C").unwrap();

        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        store.insert_task(&task).unwrap();

        let supervisor = offline_supervisor(store.clone(), task_id.clone());
        supervisor.run().await.unwrap();

        let loaded = store.get_task(&task_id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.downloaded_segments, 3);
        assert_eq!(loaded.progress, 100.0);

        // 二进制拼接产物按索引顺序逐字节一致
        let output = loaded.output_file.expect("应记录产物路径");
        let merged = std::fs::read(&output).unwrap();
        assert_eq!(merged, b"AAABBC");

        // 合并成功后分片文件被清理
        for i in 0..3 {
            assert!(!task.segment_path(i).exists());
        }
    }

    #[tokio::test]
    async fn test_run_rejects_empty_segment_list() {
        let dir = tempfile::tempdir().unwrap();
        let task = make_task(dir.path(), 0);
        let task_id = task.id.clone();

        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        store.insert_task(&task).unwrap();

        let supervisor = offline_supervisor(store, task_id);
        assert!(supervisor.run().await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_final_transition() {
        let dir = tempfile::tempdir().unwrap();
        let task = make_task(dir.path(), 2);
        let task_id = task.id.clone();

        std::fs::write(task.segment_path(0), b"AA").unwrap();
        std::fs::write(task.segment_path(1), b"BB").unwrap();

        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        store.insert_task(&task).unwrap();

        let supervisor = offline_supervisor(store.clone(), task_id.clone());
        // 启动前即暂停：run 完成对账后不做终态判定
        supervisor.cancellation_token().cancel();
        supervisor.run().await.unwrap();

        let loaded = store.get_task(&task_id).unwrap().unwrap();
        // 状态保持为 run 开始时设置的 downloading，由发起方负责改写
        assert_ne!(loaded.status, TaskStatus::Completed);
        // 取消不删除已有分片
        assert!(task.segment_path(0).exists());
        assert!(task.segment_path(1).exists());
    }

    #[tokio::test]
    async fn test_merge_failure_keeps_segments_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = make_task(dir.path(), 1);
        // 输出目录指向不存在的位置，二进制拼接必然失败
        task.output_dir = dir.path().join("ghost");
        let task_id = task.id.clone();

        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        store.insert_task(&task).unwrap();

        let muxer = MuxerDriver::locate(MuxerConfig {
            search_paths: vec![],
            output_extension: "mp4".to_string(),
        });
        let events = EventBus::new();
        let files = vec![dir.path().join("movie_segment_0.ts")];
        std::fs::write(&files[0], b"DATA").unwrap();

        merge_and_finalize(&store, &events, &muxer, &task, files.clone())
            .await
            .unwrap();

        let loaded = store.get_task(&task_id).unwrap().unwrap();
        // 下载本身成功：合并失败不改变完成状态，只记录错误信息
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert!(loaded.error_message.unwrap().contains("合并失败"));
        // 分片保留，可重试合并
        assert!(files[0].exists());
    }
}
