use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// 下载任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 排队中（已创建，等待开始）
    Queued,
    /// 下载中
    Downloading,
    /// 已暂停
    Paused,
    /// 合并中（分片下载完毕，muxer 运行中）
    Merging,
    /// 已完成
    Completed,
    /// 失败
    Error,
    /// 已取消
    Cancelled,
}

impl TaskStatus {
    /// 是否为终态（终态后进度字段不再变化）
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// 从字符串解析（用于数据库读取）
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "downloading" => Some(Self::Downloading),
            "paused" => Some(Self::Paused),
            "merging" => Some(Self::Merging),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 下载任务
///
/// 一个任务对应一个媒体播放列表的完整下载。`segments` 在创建时确定，此后不变；
/// 进度字段在单次运行内单调递增。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    /// 任务 ID
    pub id: String,
    /// 原始页面 URL
    pub source_url: String,
    /// 解析后的播放列表 URL
    pub playlist_url: String,
    /// 用户选择的文件名（不含扩展名）
    pub filename: String,
    /// 任务状态
    pub status: TaskStatus,
    /// 本任务的最大并发分片数
    pub threads: usize,
    /// 分片临时文件与最终产物所在目录
    pub output_dir: PathBuf,
    /// 分片 URL 列表（绝对地址，按播放顺序）
    pub segments: Vec<String>,
    /// 分片总数
    pub total_segments: usize,
    /// 已完成的分片数
    pub downloaded_segments: usize,
    /// 预估总字节数
    pub file_size: u64,
    /// 已下载字节数
    pub downloaded_bytes: u64,
    /// 进度百分比 [0, 100]
    pub progress: f64,
    /// 下载速度 (bytes/s)
    pub speed: u64,
    /// 预计剩余时间（秒）
    pub eta: u64,
    /// 最终产物路径
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    /// 媒体时长（秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// 最近一次失败信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 最后更新时间（每次变更刷新）
    pub updated_at: DateTime<Utc>,
}

impl DownloadTask {
    pub fn new(
        source_url: String,
        playlist_url: String,
        filename: String,
        segments: Vec<String>,
        threads: usize,
        output_dir: PathBuf,
    ) -> Self {
        let now = Utc::now();
        let total_segments = segments.len();
        Self {
            id: Uuid::new_v4().to_string(),
            source_url,
            playlist_url,
            filename,
            status: TaskStatus::Queued,
            threads: threads.max(1),
            output_dir,
            segments,
            total_segments,
            downloaded_segments: 0,
            file_size: 0,
            downloaded_bytes: 0,
            progress: 0.0,
            speed: 0,
            eta: 0,
            output_file: None,
            duration: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 刷新最后更新时间
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// 计算进度百分比（保留两位小数）
    pub fn progress_for(&self, downloaded: usize) -> f64 {
        round2_percent(downloaded, self.total_segments)
    }

    /// 第 index 个分片的确定性磁盘路径
    ///
    /// 这是除任务记录外唯一的跨重启续传通道：重启后按该路径探测分片是否已存在。
    pub fn segment_path(&self, index: usize) -> PathBuf {
        segment_path(&self.output_dir, &self.filename, index)
    }

    /// 标记为下载中
    pub fn mark_downloading(&mut self) {
        self.status = TaskStatus::Downloading;
        self.error_message = None;
        self.touch();
    }

    /// 标记为已暂停
    pub fn mark_paused(&mut self) {
        self.status = TaskStatus::Paused;
        self.touch();
    }

    /// 标记为合并中
    pub fn mark_merging(&mut self) {
        self.status = TaskStatus::Merging;
        self.touch();
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.touch();
    }

    /// 标记为失败
    pub fn mark_error(&mut self, message: String) {
        self.status = TaskStatus::Error;
        self.error_message = Some(message);
        self.touch();
    }

    /// 标记为已取消
    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.touch();
    }
}

/// 分片文件名：`<文件名>_segment_<索引>.ts`，索引从 0 开始、不补零
pub fn segment_file_name(stem: &str, index: usize) -> String {
    format!("{}_segment_{}.ts", stem, index)
}

/// 分片文件完整路径
pub fn segment_path(output_dir: &Path, stem: &str, index: usize) -> PathBuf {
    output_dir.join(segment_file_name(stem, index))
}

/// 百分比计算，保留两位小数
pub fn round2_percent(downloaded: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let pct = downloaded as f64 / total as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}
