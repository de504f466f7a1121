//! 分片下载器
//!
//! 单个分片最多尝试三次，每次失败后线性退避（上限 5 秒）。
//! 写盘采用临时文件 + 原子重命名，保证"存在且非空"检查不会把半截文件当成完成。

use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::downloader::task::segment_path;

/// 单个分片的最大尝试次数
pub const MAX_ATTEMPTS: u32 = 3;

/// 单次请求超时（秒）
const REQUEST_TIMEOUT_SECS: u64 = 15;

/// 最大重定向次数
const MAX_REDIRECTS: usize = 5;

/// 浏览器 User-Agent（部分站点会拒绝非浏览器请求）
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// 分片下载器
///
/// 所有分片共用同一个 `Client` 以复用连接池。
#[derive(Debug, Clone)]
pub struct SegmentFetcher {
    client: Client,
}

impl SegmentFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// 下载单个分片到确定性路径，返回写入的字节数
    ///
    /// 取消令牌在每次尝试前检查；取消导致的中断不计入重试。
    pub async fn fetch(
        &self,
        url: &str,
        index: usize,
        output_dir: &Path,
        stem: &str,
        token: &CancellationToken,
    ) -> Result<(PathBuf, u64)> {
        let path = segment_path(output_dir, stem, index);
        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            if token.is_cancelled() {
                anyhow::bail!("任务已被取消");
            }

            match self.fetch_once(url, &path).await {
                Ok(size) => {
                    debug!("分片 #{} 下载完成: {} bytes (第 {} 次尝试)", index, size, attempt);
                    return Ok((path, size));
                }
                Err(e) => {
                    warn!(
                        "分片 #{} 第 {}/{} 次尝试失败: {}",
                        index, attempt, MAX_ATTEMPTS, e
                    );
                    last_error = Some(e);
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(backoff_ms(attempt))).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("分片 #{} 下载失败", index))
            .context(format!("分片 #{} 重试 {} 次后仍失败", index, MAX_ATTEMPTS)))
    }

    /// 单次尝试：GET → 校验状态 → 流式写入临时文件 → 校验非空 → 原子重命名
    async fn fetch_once(&self, url: &str, path: &Path) -> Result<u64> {
        let mut request = self
            .client
            .get(url)
            .header("Accept", "*/*")
            .header("Connection", "keep-alive")
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS));

        // Referer 设为分片所在站点根，部分 CDN 依赖它做防盗链校验
        if let Some(origin) = url_origin(url) {
            request = request.header("Referer", origin);
        }

        let resp = request.send().await.context("发送分片请求失败")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("HTTP 错误: {}", status);
        }

        // 先写临时文件，确认非空后再原子重命名到确定性路径
        let tmp_path = path.with_extension("ts.tmp");
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .context("创建分片临时文件失败")?;

        let mut stream = resp.bytes_stream();
        let mut total_bytes = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("读取分片数据流失败")?;
            file.write_all(&chunk).await.context("写入分片数据失败")?;
            total_bytes += chunk.len() as u64;
        }
        file.flush().await.context("刷新分片文件失败")?;
        drop(file);

        if total_bytes == 0 {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            anyhow::bail!("分片响应为空");
        }

        tokio::fs::rename(&tmp_path, path)
            .await
            .context("重命名分片文件失败")?;

        Ok(total_bytes)
    }
}

/// 第 attempt 次失败后的退避时长（毫秒）：min(1000 × attempt, 5000)
pub fn backoff_ms(attempt: u32) -> u64 {
    (1000 * attempt as u64).min(5000)
}

/// 取 URL 的 scheme + host（含端口），作为 Referer
fn url_origin(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    match parsed.port() {
        Some(port) => Some(format!("{}://{}:{}", parsed.scheme(), host, port)),
        None => Some(format!("{}://{}", parsed.scheme(), host)),
    }
}
