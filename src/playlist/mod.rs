//! 播放列表解析
//!
//! 把一个播放列表 URL 变成有序的分片 URL 列表。主列表（master）暴露全部变体，
//! 由调用方自行选择；媒体列表（media）产出分片序列、累计时长与直播标记。
//!
//! 解析刻意宽松：凡是不以 `#` 开头的非空行都按分片 URL 处理，容忍各种
//! 不规范的生成器产物。

use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::downloader::segment::BROWSER_USER_AGENT;

/// 播放列表请求超时（秒）
const PLAYLIST_TIMEOUT_SECS: u64 = 15;

/// 主列表中的一个变体流
#[derive(Debug, Clone, PartialEq)]
pub struct VariantStream {
    /// 变体媒体列表的绝对 URL
    pub url: String,
    /// `RESOLUTION=WxH` 属性
    pub resolution: Option<String>,
    /// `BANDWIDTH=n` 属性
    pub bandwidth: Option<u64>,
}

/// 媒体播放列表解析结果
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    /// 分片绝对 URL，按播放顺序
    pub segments: Vec<String>,
    /// `#EXTINF` 累计时长（秒）
    pub total_duration: f64,
    /// 是否为直播列表（直播列表照常返回，是否拒绝由调用方决定）
    pub is_live: bool,
}

/// 解析结果：主列表或媒体列表
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedPlaylist {
    Master(Vec<VariantStream>),
    Media(MediaPlaylist),
}

/// 播放列表解析器
#[derive(Debug, Clone)]
pub struct PlaylistResolver {
    client: Client,
}

impl PlaylistResolver {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// 拉取并解析播放列表
    pub async fn resolve(&self, playlist_url: &str) -> Result<ResolvedPlaylist> {
        let resp = self
            .client
            .get(playlist_url)
            // 以自身作为 Referer，绕过部分站点的防盗链
            .header("Referer", playlist_url)
            .timeout(Duration::from_secs(PLAYLIST_TIMEOUT_SECS))
            .send()
            .await
            .context("请求播放列表失败")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("播放列表请求返回 HTTP {}", status);
        }

        let body = resp.text().await.context("读取播放列表内容失败")?;
        if body.trim().is_empty() {
            anyhow::bail!("播放列表内容为空");
        }

        let resolved = parse_playlist(playlist_url, &body)?;
        match &resolved {
            ResolvedPlaylist::Master(variants) => {
                info!("主播放列表: {} 个变体", variants.len());
            }
            ResolvedPlaylist::Media(media) => {
                info!(
                    "媒体播放列表: {} 个分片, 时长 {:.1}s, 直播: {}",
                    media.segments.len(),
                    media.total_duration,
                    media.is_live
                );
            }
        }
        Ok(resolved)
    }
}

/// 解析播放列表文本
///
/// 含 `#EXT-X-STREAM-INF` 的视为主列表，否则按媒体列表处理。
pub fn parse_playlist(base_url: &str, body: &str) -> Result<ResolvedPlaylist> {
    let lines: Vec<&str> = body
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();

    if lines.is_empty() {
        anyhow::bail!("播放列表内容为空");
    }

    let is_master = lines.iter().any(|l| l.starts_with("#EXT-X-STREAM-INF"));
    if is_master {
        Ok(ResolvedPlaylist::Master(parse_master(base_url, &lines)))
    } else {
        Ok(ResolvedPlaylist::Media(parse_media(base_url, &lines)))
    }
}

/// 主列表：收集 (指令行, 下一个 URL 行) 对
fn parse_master(base_url: &str, lines: &[&str]) -> Vec<VariantStream> {
    let mut variants = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if line.starts_with("#EXT-X-STREAM-INF") {
            // 指令后的第一个非注释行是变体 URL
            if let Some(url_line) = lines[i + 1..].iter().find(|l| !l.starts_with('#')) {
                variants.push(VariantStream {
                    url: resolve_url(base_url, url_line),
                    resolution: attribute_value(line, "RESOLUTION").map(|s| s.to_string()),
                    bandwidth: attribute_value(line, "BANDWIDTH").and_then(|s| s.parse().ok()),
                });
            }
        }
        i += 1;
    }
    debug!("解析出 {} 个变体", variants.len());
    variants
}

/// 媒体列表：非注释行即分片；同时累计 EXTINF 时长并判断直播标记
fn parse_media(base_url: &str, lines: &[&str]) -> MediaPlaylist {
    let mut segments = Vec::new();
    let mut total_duration = 0.0f64;
    let mut saw_vod = false;
    let mut saw_live = false;
    let mut saw_target_duration = false;

    for line in lines {
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let duration_part = rest.split(',').next().unwrap_or("");
            if let Ok(d) = duration_part.trim().parse::<f64>() {
                total_duration += d;
            }
        } else if line.starts_with("#EXT-X-PLAYLIST-TYPE") {
            if line.contains("VOD") {
                saw_vod = true;
            } else if line.contains("LIVE") {
                saw_live = true;
            }
        } else if line.starts_with("#EXT-X-TARGETDURATION") {
            saw_target_duration = true;
        } else if !line.starts_with('#') {
            segments.push(resolve_url(base_url, line));
        }
    }

    // 显式 VOD 标记优先；否则有 TARGETDURATION 而无 VOD 标记时按直播处理
    let is_live = saw_live || (saw_target_duration && !saw_vod);

    MediaPlaylist {
        segments,
        total_duration,
        is_live,
    }
}

/// 相对地址按播放列表 URL 的父路径解析
fn resolve_url(base_url: &str, candidate: &str) -> String {
    if Url::parse(candidate).is_ok() {
        return candidate.to_string();
    }
    match Url::parse(base_url).and_then(|base| base.join(candidate)) {
        Ok(joined) => joined.to_string(),
        Err(_) => candidate.to_string(),
    }
}

/// 从属性列表中取值，尊重双引号内的逗号（如 CODECS="avc1.4d401f,mp4a.40.2"）
fn attribute_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let attrs = line.split_once(':')?.1;
    let mut rest = attrs;
    while !rest.is_empty() {
        let (pair, remainder) = split_attribute(rest);
        rest = remainder;
        if let Some((k, v)) = pair.split_once('=') {
            if k.trim() == key {
                return Some(v.trim().trim_matches('"'));
            }
        }
    }
    None
}

/// 切出下一个 `key=value` 属性，引号内的逗号不作为分隔符
fn split_attribute(attrs: &str) -> (&str, &str) {
    let mut in_quotes = false;
    for (i, c) in attrs.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => return (&attrs[..i], &attrs[i + 1..]),
            _ => {}
        }
    }
    (attrs, "")
}
