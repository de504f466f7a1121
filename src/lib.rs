// m3u8 下载管理器核心库
//
// 把 HLS 播放列表解析成分片序列，带断点续传地并发下载，
// 最后用 ffmpeg（或二进制拼接回退）合并为单个容器文件。
// HTTP/WebSocket 接口层与页面抓取不在本库内，分别通过事件总线
// 与任务存储接口对接。

// 配置管理模块
pub mod config;

// 下载引擎模块
pub mod downloader;

// 事件总线模块
pub mod events;

// 日志模块
pub mod logging;

// 合并驱动模块
pub mod muxer;

// 播放列表解析模块
pub mod playlist;

// 任务存储模块
pub mod store;

// 导出常用类型
pub use config::{AppConfig, DownloadSettings, LogConfig, MuxerConfig};
pub use downloader::{DownloadManager, DownloadTask, SegmentFetcher, TaskStatus, TaskSupervisor};
pub use events::{EventBus, EventPriority, ProgressThrottler, TaskEvent};
pub use logging::{init_logging, LogGuard};
pub use muxer::{MergeResult, MuxerDriver};
pub use playlist::{MediaPlaylist, PlaylistResolver, ResolvedPlaylist, VariantStream};
pub use store::{MemoryTaskStore, SqliteTaskStore, TaskStore, TaskUpdate};
