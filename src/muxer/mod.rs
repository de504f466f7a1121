//! 合并驱动
//!
//! 把下载完成的分片按索引顺序合并为单个容器文件。优先调用外部 ffmpeg
//! （concat demuxer + 流复制）；找不到 ffmpeg 时回退为按序二进制拼接，
//! TS 这类支持朴素拼接的容器格式拼完即可播放。
//!
//! ffmpeg 路径在进程内只探测一次，探测列表来自配置。

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::MuxerConfig;
use crate::downloader::task::segment_file_name;

/// 合并结果
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// 最终产物路径
    pub output_file: PathBuf,
    /// 探测到的媒体时长（秒）
    pub duration: Option<f64>,
}

/// 合并驱动
#[derive(Debug)]
pub struct MuxerDriver {
    config: MuxerConfig,
    /// 探测到的 ffmpeg 路径；None 表示不可用，走二进制拼接
    ffmpeg_path: Option<PathBuf>,
}

impl MuxerDriver {
    /// 按配置的搜索列表探测 ffmpeg，结果在驱动生命周期内固定
    pub fn locate(config: MuxerConfig) -> Self {
        let ffmpeg_path = config.search_paths.iter().find_map(|candidate| {
            if probe_binary(candidate) {
                Some(PathBuf::from(candidate))
            } else {
                None
            }
        });

        match &ffmpeg_path {
            Some(path) => info!("找到 ffmpeg: {:?}", path),
            None => warn!("未找到 ffmpeg，合并将使用二进制拼接回退"),
        }

        Self {
            config,
            ffmpeg_path,
        }
    }

    /// 外部 muxer 是否可用
    pub fn is_available(&self) -> bool {
        self.ffmpeg_path.is_some()
    }

    /// 最终产物路径：`<输出目录>/<文件名>.<扩展名>`，重复扩展名不叠加
    pub fn output_path(&self, output_dir: &Path, stem: &str) -> PathBuf {
        let ext = &self.config.output_extension;
        let suffix = format!(".{}", ext);
        if stem.to_lowercase().ends_with(&suffix.to_lowercase()) {
            output_dir.join(stem)
        } else {
            output_dir.join(format!("{}.{}", stem, ext))
        }
    }

    /// 调用 ffmpeg 合并（要求 `is_available()`）
    ///
    /// `duration_hint` 用于把 ffmpeg 报告的时间换算成百分比；
    /// `on_progress` 在整数百分比变化时回调。
    pub async fn merge_with_ffmpeg<F>(
        &self,
        output_dir: &Path,
        stem: &str,
        segment_paths: &[PathBuf],
        duration_hint: Option<f64>,
        on_progress: F,
    ) -> Result<MergeResult>
    where
        F: Fn(f64),
    {
        let ffmpeg = self
            .ffmpeg_path
            .as_ref()
            .context("ffmpeg 不可用")?;
        let output_path = self.output_path(output_dir, stem);
        let manifest_path = output_dir.join(format!("{}_concat.txt", stem));

        write_manifest(&manifest_path, segment_paths)
            .await
            .context("写入合并清单失败")?;

        let run_result = self
            .run_ffmpeg(ffmpeg, &manifest_path, &output_path, duration_hint, on_progress)
            .await;

        // 清单文件无论成败都删除
        if let Err(e) = tokio::fs::remove_file(&manifest_path).await {
            warn!("删除合并清单失败: {:?}, {}", manifest_path, e);
        }

        run_result?;

        let duration = self.probe_duration(&output_path).await;
        delete_segment_files(segment_paths).await;

        info!("合并完成: {:?}", output_path);
        Ok(MergeResult {
            output_file: output_path,
            duration,
        })
    }

    async fn run_ffmpeg<F>(
        &self,
        ffmpeg: &Path,
        manifest_path: &Path,
        output_path: &Path,
        duration_hint: Option<f64>,
        on_progress: F,
    ) -> Result<()>
    where
        F: Fn(f64),
    {
        let mut child = Command::new(ffmpeg)
            .args(["-y", "-hide_banner", "-loglevel", "error"])
            .args(["-f", "concat", "-safe", "0"])
            .arg("-i")
            .arg(manifest_path)
            // 流复制，修正时间戳
            .args(["-c", "copy"])
            .args(["-avoid_negative_ts", "make_zero"])
            .args(["-fflags", "+genpts"])
            .args(["-progress", "pipe:1", "-nostats"])
            .arg(output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("启动 ffmpeg 失败")?;

        let stdout = child.stdout.take().context("捕获 ffmpeg 输出失败")?;
        let mut stderr = child.stderr.take().context("捕获 ffmpeg 错误输出失败")?;

        // 错误输出单独收集，失败时带进错误信息
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        // 解析 -progress 的 key=value 流，换算成百分比
        let mut lines = BufReader::new(stdout).lines();
        let mut last_percent = -1i64;
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(value) = line.strip_prefix("out_time_ms=") {
                // out_time_ms 实为微秒
                if let (Ok(us), Some(total)) = (value.trim().parse::<i64>(), duration_hint) {
                    if total > 0.0 {
                        let pct = (us as f64 / 1_000_000.0 / total * 100.0).clamp(0.0, 100.0);
                        if pct.floor() as i64 > last_percent {
                            last_percent = pct.floor() as i64;
                            on_progress(pct);
                        }
                    }
                }
            }
        }

        let status = child.wait().await.context("等待 ffmpeg 退出失败")?;
        if !status.success() {
            let stderr_text = stderr_task.await.unwrap_or_default();
            let tail: String = stderr_text
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("; ");
            anyhow::bail!("ffmpeg 退出码 {}: {}", status, tail);
        }

        on_progress(100.0);
        Ok(())
    }

    /// 回退路径：按索引顺序二进制拼接
    pub async fn concat_segments(
        &self,
        output_dir: &Path,
        stem: &str,
        segment_paths: &[PathBuf],
    ) -> Result<MergeResult> {
        use tokio::io::AsyncWriteExt;

        let output_path = self.output_path(output_dir, stem);
        let mut output = tokio::fs::File::create(&output_path)
            .await
            .context("创建输出文件失败")?;

        for path in segment_paths {
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("读取分片失败: {:?}", path))?;
            output
                .write_all(&data)
                .await
                .context("写入输出文件失败")?;
        }
        output.flush().await.context("刷新输出文件失败")?;
        drop(output);

        delete_segment_files(segment_paths).await;

        info!("二进制拼接完成: {:?} ({} 个分片)", output_path, segment_paths.len());
        Ok(MergeResult {
            output_file: output_path,
            duration: None,
        })
    }

    /// 用 ffprobe 探测产物时长；探测失败不视为错误
    async fn probe_duration(&self, path: &Path) -> Option<f64> {
        let candidates = ffprobe_candidates(self.ffmpeg_path.as_deref());
        for probe in candidates {
            match run_ffprobe(&probe, path).await {
                Ok(duration) => return Some(duration),
                Err(e) => debug!("ffprobe {:?} 探测失败: {}", probe, e),
            }
        }
        None
    }
}

/// 按嵌入在文件名里的 `…_segment_<n>.ts` 索引排序
///
/// 不匹配的文件名按索引 0 处理；稳定排序保证同索引时保持传入顺序。
pub fn sort_segments(paths: &mut [PathBuf]) {
    paths.sort_by_key(|p| parse_segment_index(p));
}

/// 从分片文件名解析索引，解析不出时归 0
fn parse_segment_index(path: &Path) -> usize {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return 0,
    };
    let Some(pos) = name.rfind("_segment_") else {
        return 0;
    };
    let rest = &name[pos + "_segment_".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

/// 写 concat 清单：每行 `file '<绝对路径>'`
async fn write_manifest(manifest_path: &Path, segment_paths: &[PathBuf]) -> Result<()> {
    let content = manifest_content(segment_paths);
    tokio::fs::write(manifest_path, content).await?;
    Ok(())
}

fn manifest_content(segment_paths: &[PathBuf]) -> String {
    let mut content = String::new();
    for path in segment_paths {
        content.push_str(&format!("file '{}'\n", path.display()));
    }
    content
}

/// 合并成功后清理分片文件；删除失败只记日志
async fn delete_segment_files(segment_paths: &[PathBuf]) {
    for path in segment_paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("删除分片文件失败: {:?}, {}", path, e);
        }
    }
}

/// 探测某个候选路径是否为可执行的 ffmpeg
fn probe_binary(candidate: &str) -> bool {
    std::process::Command::new(candidate)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// ffprobe 候选路径：优先 ffmpeg 同目录，其次 PATH 上的裸命令
fn ffprobe_candidates(ffmpeg_path: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(ffmpeg) = ffmpeg_path {
        if ffmpeg.parent().map(|p| !p.as_os_str().is_empty()).unwrap_or(false) {
            candidates.push(ffmpeg.with_file_name("ffprobe"));
        }
    }
    candidates.push(PathBuf::from("ffprobe"));
    candidates
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

async fn run_ffprobe(probe: &Path, path: &Path) -> Result<f64> {
    let output = Command::new(probe)
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(path)
        .output()
        .await
        .context("执行 ffprobe 失败")?;

    if !output.status.success() {
        anyhow::bail!("ffprobe 退出码 {}", output.status);
    }

    let parsed: FfprobeOutput =
        serde_json::from_slice(&output.stdout).context("解析 ffprobe 输出失败")?;
    parsed
        .format
        .duration
        .and_then(|d| d.parse::<f64>().ok())
        .context("ffprobe 未报告时长")
}

/// 供调用方重建分片文件列表：探测 `0..total` 的确定性路径，跳过缺失项
pub fn probe_segment_files(output_dir: &Path, stem: &str, total: usize) -> Vec<PathBuf> {
    (0..total)
        .filter_map(|i| {
            let path = output_dir.join(segment_file_name(stem, i));
            match std::fs::metadata(&path) {
                Ok(meta) if meta.len() > 0 => Some(path),
                _ => None,
            }
        })
        .collect()
}
