//! 事件类型定义
//!
//! 所有任务事件组成一个带标签的联合类型，按 `event_type` 区分，
//! 供外部的 WebSocket / SSE 层直接序列化推送。

use serde::{Deserialize, Serialize};

use crate::downloader::task::TaskStatus;

/// 事件优先级
///
/// 进度事件可以在背压下丢弃；状态与完成类事件不可丢。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 低优先级：进度更新
    Low = 0,
    /// 中优先级：状态变更
    Medium = 1,
    /// 高优先级：完成、失败
    High = 2,
}

/// 任务事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// 状态变更
    DownloadStatus {
        #[serde(rename = "id")]
        task_id: String,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output_file: Option<String>,
        /// 提示性文本（如合并回退说明），非错误
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// 下载进度
    DownloadProgress {
        #[serde(rename = "id")]
        task_id: String,
        progress: f64,
        downloaded_segments: usize,
        speed: u64,
        eta: u64,
        downloaded_bytes: u64,
    },
    /// 合并进度
    MergeProgress {
        #[serde(rename = "id")]
        task_id: String,
        progress: f64,
    },
}

impl TaskEvent {
    /// 构造一个只带状态的状态事件
    pub fn status(task_id: impl Into<String>, status: TaskStatus) -> Self {
        Self::DownloadStatus {
            task_id: task_id.into(),
            status,
            error_message: None,
            output_file: None,
            message: None,
        }
    }

    /// 获取任务 ID
    pub fn task_id(&self) -> &str {
        match self {
            Self::DownloadStatus { task_id, .. } => task_id,
            Self::DownloadProgress { task_id, .. } => task_id,
            Self::MergeProgress { task_id, .. } => task_id,
        }
    }

    /// 获取事件优先级
    pub fn priority(&self) -> EventPriority {
        match self {
            Self::DownloadProgress { .. } | Self::MergeProgress { .. } => EventPriority::Low,
            Self::DownloadStatus { status, .. } => match status {
                TaskStatus::Completed | TaskStatus::Error => EventPriority::High,
                _ => EventPriority::Medium,
            },
        }
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            Self::DownloadStatus { .. } => "download_status",
            Self::DownloadProgress { .. } => "download_progress",
            Self::MergeProgress { .. } => "merge_progress",
        }
    }
}
