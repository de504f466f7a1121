//! 运行期进度统计
//!
//! 速度与 ETA 在每个分片完成时重算。速度以任务累计字节数计；
//! ETA 以本次运行的平均分片耗时外推。

use std::time::Instant;

/// 单次运行的统计量
///
/// 每次 start 时重建；跨运行保留的只有任务记录中的累计字段。
#[derive(Debug)]
pub struct SessionStats {
    /// 本次运行启动时刻
    started_at: Instant,
    /// 本次运行内完成的分片数
    session_segments: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            session_segments: 0,
        }
    }

    /// 记录一个分片完成
    pub fn record_segment(&mut self) {
        self.session_segments += 1;
    }

    pub fn session_segments(&self) -> u64 {
        self.session_segments
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// 当前速度 (bytes/s)
    pub fn speed(&self, downloaded_bytes: u64) -> u64 {
        compute_speed(downloaded_bytes, self.elapsed_secs())
    }

    /// 预计剩余时间（秒）
    pub fn eta(&self, total: usize, downloaded: usize, failed: usize) -> u64 {
        compute_eta(
            total,
            downloaded,
            failed,
            self.elapsed_secs(),
            self.session_segments,
        )
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// speed = downloaded_bytes / elapsed，elapsed ≤ 0 时为 0
fn compute_speed(downloaded_bytes: u64, elapsed_secs: f64) -> u64 {
    if elapsed_secs <= 0.0 {
        return 0;
    }
    (downloaded_bytes as f64 / elapsed_secs) as u64
}

/// eta = (总数 − 已完成 − 失败数) × 平均分片耗时，结果取整；剩余 ≤ 0 时为 0
fn compute_eta(
    total: usize,
    downloaded: usize,
    failed: usize,
    elapsed_secs: f64,
    session_segments: u64,
) -> u64 {
    let remaining = total as i64 - downloaded as i64 - failed as i64;
    if remaining <= 0 || session_segments == 0 {
        return 0;
    }
    let avg_segment_secs = elapsed_secs / session_segments as f64;
    (remaining as f64 * avg_segment_secs).round() as u64
}
