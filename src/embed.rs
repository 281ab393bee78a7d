//! URL classification for the web page mode.
//!
//! A configured URL is turned into [`EmbedMetadata`] that tells the rendering
//! surface how to show it: a privacy-enhanced YouTube frame, a direct HLS
//! stream, the native player (`mpv`) or a plain frame.

use futures::FutureExt;
use futures::future::BoxFuture;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

use crate::constants::constants;

// --- Metadata ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedType {
  #[default]
  Iframe,
  Youtube,
  Hls,
  Mpv,
}

impl EmbedType {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Iframe => "iframe",
      Self::Youtube => "youtube",
      Self::Hls => "hls",
      Self::Mpv => "mpv",
    }
  }
}

/// How a URL should be embedded. Persisted alongside the display config.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EmbedMetadata {
  #[serde(default)]
  pub embed_type: EmbedType,
  pub original_url: String,
  #[serde(default)]
  pub canonical_url: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub provider: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub content_type: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub video_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub playlist_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub playlist_index: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub channel_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub start_seconds: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub thumbnail_url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub warning: Option<String>,
}

impl EmbedMetadata {
  fn new(embed_type: EmbedType, original_url: &str, canonical_url: &str) -> Self {
    Self {
      embed_type,
      original_url: original_url.to_string(),
      canonical_url: canonical_url.to_string(),
      ..Self::default()
    }
  }

  /// Fills in fields older stored records may lack.
  pub fn normalized(mut self) -> Self {
    if self.canonical_url.trim().is_empty() {
      self.canonical_url = self.original_url.clone();
    }
    self
  }

  /// True when this record was produced for `url`.
  pub fn describes(&self, url: &str) -> bool {
    self.original_url.trim() == url.trim()
  }
}

// --- YouTube URL parsing ---

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct YoutubeUrlDetails {
  pub video_id: Option<String>,
  pub playlist_id: Option<String>,
  pub playlist_index: Option<u32>,
  pub channel_id: Option<String>,
  pub start_seconds: Option<u32>,
}

impl YoutubeUrlDetails {
  fn is_empty(&self) -> bool {
    self.video_id.is_none() && self.playlist_id.is_none() && self.channel_id.is_none()
  }
}

static START_TIME: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").expect("start time pattern is valid"));

/// Parse a start offset written as `NNNhNNmNNs` (any part optional) or plain seconds.
/// Zero and malformed values yield `None`.
pub fn parse_start_time(value: &str) -> Option<u32> {
  let value = value.trim().to_ascii_lowercase();
  if value.is_empty() {
    return None;
  }
  if value.bytes().all(|b| b.is_ascii_digit()) {
    return value.parse::<u32>().ok().filter(|&n| n > 0);
  }
  let caps = START_TIME.captures(&value)?;
  let part = |i: usize| caps.get(i).map_or(Some(0), |m| m.as_str().parse::<u32>().ok());
  let total = part(1)?.checked_mul(3600)?.checked_add(part(2)?.checked_mul(60)?)?.checked_add(part(3)?)?;
  (total > 0).then_some(total)
}

fn sanitize_id(raw: &str) -> Option<String> {
  let id: String = raw.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-').collect();
  (!id.is_empty()).then_some(id)
}

/// Parse a possibly scheme-less URL, assuming https.
pub fn normalize_url(raw: &str) -> Option<Url> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    return None;
  }
  if trimmed.contains("://") { Url::parse(trimmed).ok() } else { Url::parse(&format!("https://{trimmed}")).ok() }
}

pub fn is_youtube_host(host: &str) -> bool {
  let host = host.to_ascii_lowercase();
  host == "youtube.com" || host == "youtu.be" || host.ends_with(".youtube.com") || host.ends_with(".youtu.be")
}

/// Extract video, playlist, channel and start offset from a YouTube URL.
/// Returns `None` for URLs on other hosts.
pub fn parse_youtube_url(raw: &str) -> Option<YoutubeUrlDetails> {
  let url = normalize_url(raw)?;
  let host = url.host_str()?.to_ascii_lowercase();
  if !is_youtube_host(&host) {
    return None;
  }

  let segments: Vec<&str> = url.path_segments().map(|s| s.filter(|p| !p.is_empty()).collect()).unwrap_or_default();
  let mut query: HashMap<String, String> = HashMap::new();
  for (k, v) in url.query_pairs() {
    query.entry(k.into_owned()).or_insert_with(|| v.into_owned());
  }

  let mut details = YoutubeUrlDetails::default();

  if host == "youtu.be" || host.ends_with(".youtu.be") {
    details.video_id = segments.first().and_then(|s| sanitize_id(s));
  }
  if details.video_id.is_none() {
    details.video_id = query.get("v").and_then(|v| sanitize_id(v));
  }
  if details.video_id.is_none()
    && let [kind, id, ..] = segments.as_slice()
    && matches!(*kind, "embed" | "shorts" | "live")
    && *id != "live_stream"
  {
    details.video_id = sanitize_id(id);
  }
  if details.video_id.is_none()
    && let [only] = segments.as_slice()
    && only.len() == 11
  {
    details.video_id = sanitize_id(only);
  }

  details.playlist_id = query.get("list").and_then(|v| sanitize_id(v));
  details.playlist_index = query.get("index").and_then(|v| v.trim().parse().ok());

  details.channel_id = query.get("channel").and_then(|v| sanitize_id(v));
  if details.channel_id.is_none()
    && let Some(pos) = segments.iter().position(|s| *s == "channel")
  {
    details.channel_id = segments.get(pos + 1).and_then(|s| sanitize_id(s));
  }

  details.start_seconds = query.get("t").or_else(|| query.get("start")).and_then(|v| parse_start_time(v));
  if details.start_seconds.is_none()
    && let Some(fragment) = url.fragment()
  {
    details.start_seconds = url::form_urlencoded::parse(fragment.as_bytes())
      .find(|(k, _)| k == "t" || k == "start")
      .and_then(|(_, v)| parse_start_time(&v));
  }

  Some(details)
}

/// Privacy-enhanced embed URL for a video or playlist.
pub fn build_youtube_embed_url(details: &YoutubeUrlDetails) -> Option<String> {
  let base = constants().youtube_embed_base.trim_end_matches('/');
  let path = match (&details.video_id, &details.playlist_id) {
    (Some(id), _) => id.as_str(),
    (None, Some(_)) => "videoseries",
    (None, None) => return None,
  };
  let mut query = url::form_urlencoded::Serializer::new(String::new());
  if let Some(list) = &details.playlist_id {
    query.append_pair("list", list);
  }
  if let Some(index) = details.playlist_index {
    query.append_pair("index", &index.to_string());
  }
  if let Some(start) = details.start_seconds {
    query.append_pair("start", &start.to_string());
  }
  let query = query.finish();
  if query.is_empty() { Some(format!("{base}/{path}")) } else { Some(format!("{base}/{path}?{query}")) }
}

pub fn build_youtube_live_embed_url(channel_id: &str) -> String {
  format!("{}?channel={}", constants().youtube_live_embed_base, channel_id)
}

fn channel_id_from_url(raw: &str) -> Option<String> {
  let url = normalize_url(raw)?;
  let mut segments = url.path_segments()?;
  segments.find(|s| *s == "channel")?;
  segments.next().and_then(sanitize_id)
}

// --- HLS detection ---

/// Cheap manifest heuristics applied before any deep probe.
pub fn looks_like_manifest(url: &str) -> bool {
  let lower = url.to_ascii_lowercase();
  lower.contains(".m3u8") || lower.contains("format=m3u8") || lower.contains("playlist.m3u")
}

/// Pick the best HLS variant from a yt-dlp `-J` document.
/// Variants are scored by `height * 1000 + tbr`; a top-level manifest `url` is the fallback.
pub fn best_manifest_url(info: &Value) -> Option<String> {
  let mut best: Option<(f64, &str)> = None;
  for format in info.get("formats").and_then(Value::as_array).into_iter().flatten() {
    let Some(url) = format.get("url").and_then(Value::as_str) else {
      continue;
    };
    let protocol = format.get("protocol").and_then(Value::as_str).unwrap_or_default();
    let ext = format.get("ext").and_then(Value::as_str).unwrap_or_default();
    if !(protocol.contains("m3u8") || url.contains("m3u8") || ext == "m3u8") {
      continue;
    }
    let height = format.get("height").and_then(Value::as_f64).unwrap_or(0.0);
    let tbr = format.get("tbr").and_then(Value::as_f64).unwrap_or(0.0);
    let score = height * 1000.0 + tbr;
    if best.is_none_or(|(s, _)| score > s) {
      best = Some((score, url));
    }
  }
  best
    .map(|(_, url)| url.to_string())
    .or_else(|| info.get("url").and_then(Value::as_str).filter(|u| u.contains("m3u8")).map(str::to_string))
}

// --- Backend ---

/// Fields read from an oEmbed response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OembedInfo {
  pub title: Option<String>,
  pub author_name: Option<String>,
  pub author_url: Option<String>,
  pub provider_name: Option<String>,
  pub provider_url: Option<String>,
  pub thumbnail_url: Option<String>,
  pub html: Option<String>,
}

/// Network-facing lookups used during classification.
/// Every method degrades to "nothing found" instead of failing.
pub trait EmbedBackend: Send + Sync {
  fn oembed<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Option<OembedInfo>>;
  fn resolve_live_manifest<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Option<String>>;
  fn probe_manifest<'a>(&'a self, url: &'a str) -> BoxFuture<'a, bool>;
}

/// oEmbed over HTTP and manifest resolution through `yt-dlp -J`.
pub struct RemoteEmbedBackend {
  http: Client,
}

impl RemoteEmbedBackend {
  pub fn new(http: Client) -> Self {
    Self { http }
  }

  async fn ytdlp_info(&self, url: &str) -> Option<Value> {
    let c = constants();
    let run = Command::new(&c.ytdlp_binary)
      .args(["-J", "--no-warnings", "--skip-download", "--", url])
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::null())
      .kill_on_drop(true)
      .output();
    let output = match tokio::time::timeout(c.http_timeout() * 5, run).await {
      Ok(Ok(output)) => output,
      Ok(Err(e)) => {
        if e.kind() == std::io::ErrorKind::NotFound {
          warn!("embed: yt-dlp not found, manifest resolution unavailable");
        } else {
          warn!(err = %e, "embed: failed to run yt-dlp");
        }
        return None;
      }
      Err(_) => {
        warn!(url = %url, "embed: yt-dlp timed out");
        return None;
      }
    };
    if !output.status.success() {
      debug!(url = %url, code = ?output.status.code(), "embed: yt-dlp exited non-zero");
      return None;
    }
    serde_json::from_slice(&output.stdout).ok()
  }
}

impl EmbedBackend for RemoteEmbedBackend {
  fn oembed<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Option<OembedInfo>> {
    async move {
      let c = constants();
      let response = self
        .http
        .get(&c.oembed_endpoint)
        .query(&[("url", url), ("format", "json")])
        .timeout(c.http_timeout())
        .send()
        .await;
      match response {
        Ok(r) if r.status().is_success() => r.json::<OembedInfo>().await.ok(),
        Ok(r) => {
          debug!(url = %url, status = %r.status(), "embed: oembed lookup rejected");
          None
        }
        Err(e) => {
          warn!(url = %url, err = %e, "embed: oembed lookup failed");
          None
        }
      }
    }
    .boxed()
  }

  fn resolve_live_manifest<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Option<String>> {
    async move { self.ytdlp_info(url).await.as_ref().and_then(best_manifest_url) }.boxed()
  }

  fn probe_manifest<'a>(&'a self, url: &'a str) -> BoxFuture<'a, bool> {
    async move { self.ytdlp_info(url).await.as_ref().and_then(best_manifest_url).is_some() }.boxed()
  }
}

// --- Classifier ---

/// Classifies URLs, caching oEmbed lookups for a configured TTL.
pub struct EmbedClassifier {
  backend: Arc<dyn EmbedBackend>,
  oembed_cache: Mutex<HashMap<String, (Instant, OembedInfo)>>,
  ttl: Duration,
}

impl EmbedClassifier {
  pub fn new(backend: Arc<dyn EmbedBackend>) -> Self {
    Self::with_ttl(backend, Duration::from_secs(constants().oembed_ttl_secs))
  }

  pub fn with_ttl(backend: Arc<dyn EmbedBackend>, ttl: Duration) -> Self {
    Self { backend, oembed_cache: Mutex::new(HashMap::new()), ttl }
  }

  pub async fn classify(&self, url: &str) -> EmbedMetadata {
    let original = url.trim();
    if original.is_empty() {
      return EmbedMetadata::new(EmbedType::Iframe, original, original);
    }

    if let Some(details) = parse_youtube_url(original)
      && !details.is_empty()
    {
      return self.classify_youtube(original, details).await;
    }

    let normalized = normalize_url(original).map(String::from).unwrap_or_else(|| original.to_string());

    if looks_like_manifest(original) || (is_http(&normalized) && self.backend.probe_manifest(&normalized).await) {
      let mut meta = EmbedMetadata::new(EmbedType::Hls, original, original);
      meta.provider = Some("HLS".to_string());
      meta.content_type = Some("video".to_string());
      info!(url = %original, "embed: classified as hls");
      return meta;
    }

    let mut meta = EmbedMetadata::new(EmbedType::Iframe, original, &normalized);
    meta.content_type = Some("website".to_string());
    meta
  }

  async fn classify_youtube(&self, original: &str, details: YoutubeUrlDetails) -> EmbedMetadata {
    let normalized = normalize_url(original).map(String::from).unwrap_or_else(|| original.to_string());
    let mut meta = EmbedMetadata::new(EmbedType::Youtube, original, &normalized);
    meta.provider = Some("YouTube".to_string());
    meta.video_id = details.video_id.clone();
    meta.playlist_id = details.playlist_id.clone();
    meta.playlist_index = details.playlist_index;
    meta.channel_id = details.channel_id.clone();
    meta.start_seconds = details.start_seconds;

    let oembed = if details.video_id.is_some() || details.playlist_id.is_some() {
      self.lookup_oembed(original).await
    } else {
      None
    };
    let html = oembed.as_ref().and_then(|o| o.html.as_deref()).unwrap_or_default().to_ascii_lowercase();

    if let Some(o) = &oembed {
      meta.title = o.title.clone();
      meta.thumbnail_url = o.thumbnail_url.clone();
      if meta.channel_id.is_none() {
        meta.channel_id = [&o.author_url, &o.provider_url].into_iter().flatten().find_map(|u| channel_id_from_url(u));
      }
    }
    if meta.title.is_none() {
      meta.title = meta.video_id.clone();
    }
    if meta.thumbnail_url.is_none()
      && let Some(id) = &meta.video_id
    {
      meta.thumbnail_url = Some(format!("https://i.ytimg.com/vi/{id}/hqdefault.jpg"));
    }

    let channel_only = details.video_id.is_none() && details.playlist_id.is_none();
    let content_type = if html.contains("live") || html.contains("is_live") || channel_only {
      "live"
    } else if html.contains("playlist") && meta.playlist_id.is_some() {
      "playlist"
    } else if meta.video_id.is_some() {
      "video"
    } else {
      "playlist"
    };
    meta.content_type = Some(content_type.to_string());

    if content_type == "live" {
      match self.backend.resolve_live_manifest(&normalized).await {
        Some(manifest) => {
          info!(url = %original, "embed: resolved live manifest");
          meta.embed_type = EmbedType::Hls;
          meta.canonical_url = manifest;
        }
        None if channel_only => {
          if let Some(channel) = &meta.channel_id {
            meta.canonical_url = build_youtube_live_embed_url(channel);
          }
        }
        None => {
          warn!(url = %original, "embed: live manifest unavailable, falling back to mpv");
          meta.embed_type = EmbedType::Mpv;
          meta.canonical_url = normalized;
          meta.warning = Some("live manifest unavailable; handing the stream to mpv".to_string());
        }
      }
      return meta;
    }

    if let Some(embed) = build_youtube_embed_url(&details) {
      meta.canonical_url = embed;
    }
    meta
  }

  async fn lookup_oembed(&self, url: &str) -> Option<OembedInfo> {
    let key = url.trim().to_string();
    {
      let cache = self.oembed_cache.lock().unwrap_or_else(PoisonError::into_inner);
      if let Some((at, info)) = cache.get(&key)
        && at.elapsed() < self.ttl
      {
        return Some(info.clone());
      }
    }
    let info = self.backend.oembed(&key).await?;
    let mut cache = self.oembed_cache.lock().unwrap_or_else(PoisonError::into_inner);
    cache.retain(|_, (at, _)| at.elapsed() < self.ttl);
    cache.insert(key, (Instant::now(), info.clone()));
    Some(info)
  }
}

fn is_http(url: &str) -> bool {
  url.starts_with("http://") || url.starts_with("https://")
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Default)]
  struct FakeBackend {
    oembed: Option<OembedInfo>,
    manifest: Option<String>,
    probe: bool,
    oembed_calls: AtomicUsize,
    probe_calls: AtomicUsize,
  }

  impl EmbedBackend for FakeBackend {
    fn oembed<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Option<OembedInfo>> {
      self.oembed_calls.fetch_add(1, Ordering::SeqCst);
      futures::future::ready(self.oembed.clone()).boxed()
    }

    fn resolve_live_manifest<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Option<String>> {
      futures::future::ready(self.manifest.clone()).boxed()
    }

    fn probe_manifest<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, bool> {
      self.probe_calls.fetch_add(1, Ordering::SeqCst);
      futures::future::ready(self.probe).boxed()
    }
  }

  fn classifier(backend: FakeBackend) -> (EmbedClassifier, Arc<FakeBackend>) {
    let backend = Arc::new(backend);
    (EmbedClassifier::new(backend.clone()), backend)
  }

  fn oembed_html(html: &str) -> OembedInfo {
    OembedInfo { title: Some("Clip".into()), html: Some(html.into()), ..Default::default() }
  }

  // --- start time ---

  #[test]
  fn start_time_formats() {
    assert_eq!(parse_start_time("1m10s"), Some(70));
    assert_eq!(parse_start_time("90"), Some(90));
    assert_eq!(parse_start_time("1h"), Some(3600));
    assert_eq!(parse_start_time("2h3m4s"), Some(7384));
  }

  #[test]
  fn start_time_rejects_malformed_and_zero() {
    assert_eq!(parse_start_time("1m10"), None);
    assert_eq!(parse_start_time("abc"), None);
    assert_eq!(parse_start_time(""), None);
    assert_eq!(parse_start_time("0"), None);
    assert_eq!(parse_start_time("0m0s"), None);
  }

  #[test]
  fn start_time_overflow_is_rejected() {
    assert_eq!(parse_start_time("2000000h"), None);
    assert_eq!(parse_start_time("1h99999999m"), None);
    assert_eq!(parse_start_time("99999999999"), None);
    let details = parse_youtube_url("https://youtu.be/dQw4w9WgXcQ?t=2000000h").unwrap();
    assert_eq!(details.video_id.as_deref(), Some("dQw4w9WgXcQ"));
    assert_eq!(details.start_seconds, None);
  }

  // --- url parsing ---

  #[test]
  fn short_link_with_playlist() {
    let d = parse_youtube_url("https://youtu.be/dQw4w9WgXcQ?list=PL1&index=3").unwrap();
    assert_eq!(d.video_id.as_deref(), Some("dQw4w9WgXcQ"));
    assert_eq!(d.playlist_id.as_deref(), Some("PL1"));
    assert_eq!(d.playlist_index, Some(3));
  }

  #[test]
  fn watch_embed_shorts_and_bare_forms() {
    let ids = [
      "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
      "https://m.youtube.com/embed/dQw4w9WgXcQ",
      "youtube.com/shorts/dQw4w9WgXcQ",
      "https://music.youtube.com/live/dQw4w9WgXcQ",
      "https://youtube.com/dQw4w9WgXcQ",
    ];
    for url in ids {
      assert_eq!(parse_youtube_url(url).unwrap().video_id.as_deref(), Some("dQw4w9WgXcQ"), "{url}");
    }
  }

  #[test]
  fn start_time_from_query_and_fragment() {
    let d = parse_youtube_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=1m10s").unwrap();
    assert_eq!(d.start_seconds, Some(70));
    let d = parse_youtube_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ#t=90").unwrap();
    assert_eq!(d.start_seconds, Some(90));
  }

  #[test]
  fn channel_from_path_and_query() {
    let d = parse_youtube_url("https://www.youtube.com/channel/UC123abc").unwrap();
    assert_eq!(d.channel_id.as_deref(), Some("UC123abc"));
    assert_eq!(d.video_id, None);
    let d = parse_youtube_url("https://www.youtube.com/embed/live_stream?channel=UC9").unwrap();
    assert_eq!(d.channel_id.as_deref(), Some("UC9"));
  }

  #[test]
  fn other_hosts_are_not_youtube() {
    assert!(parse_youtube_url("https://example.com/watch?v=dQw4w9WgXcQ").is_none());
    assert!(parse_youtube_url("https://notyoutube.com/watch?v=x").is_none());
  }

  #[test]
  fn ids_are_sanitized() {
    let d = parse_youtube_url("https://www.youtube.com/watch?v=abc%3Cscript%3E").unwrap();
    assert_eq!(d.video_id.as_deref(), Some("abcscript"));
  }

  #[test]
  fn embed_url_carries_playlist_and_start() {
    let d = YoutubeUrlDetails {
      video_id: Some("dQw4w9WgXcQ".into()),
      playlist_id: Some("PL1".into()),
      playlist_index: Some(3),
      start_seconds: Some(70),
      ..Default::default()
    };
    assert_eq!(
      build_youtube_embed_url(&d).as_deref(),
      Some("https://www.youtube-nocookie.com/embed/dQw4w9WgXcQ?list=PL1&index=3&start=70")
    );
    assert_eq!(build_youtube_embed_url(&YoutubeUrlDetails::default()), None);
  }

  // --- manifests ---

  #[test]
  fn manifest_heuristics() {
    assert!(looks_like_manifest("https://cdn.example.com/live/ch.M3U8"));
    assert!(looks_like_manifest("https://cdn.example.com/api?format=m3u8"));
    assert!(!looks_like_manifest("https://example.com/index.html"));
  }

  #[test]
  fn best_manifest_prefers_highest_score() {
    let info = serde_json::json!({
      "formats": [
        { "url": "https://a/low.m3u8", "protocol": "m3u8_native", "height": 360, "tbr": 800.0 },
        { "url": "https://a/high.m3u8", "protocol": "m3u8_native", "height": 1080, "tbr": 4500.0 },
        { "url": "https://a/dash.mp4", "protocol": "https", "height": 2160, "tbr": 9000.0 }
      ]
    });
    assert_eq!(best_manifest_url(&info).as_deref(), Some("https://a/high.m3u8"));
  }

  #[test]
  fn best_manifest_falls_back_to_top_level_url() {
    let info = serde_json::json!({ "url": "https://a/master.m3u8", "formats": [] });
    assert_eq!(best_manifest_url(&info).as_deref(), Some("https://a/master.m3u8"));
    assert_eq!(best_manifest_url(&serde_json::json!({ "url": "https://a/v.mp4" })), None);
  }

  // --- classification ---

  #[tokio::test]
  async fn youtube_short_link_classification() {
    let (c, _) = classifier(FakeBackend::default());
    let meta = c.classify("https://youtu.be/dQw4w9WgXcQ?list=PL1&index=3").await;
    assert_eq!(meta.embed_type, EmbedType::Youtube);
    assert_eq!(meta.video_id.as_deref(), Some("dQw4w9WgXcQ"));
    assert_eq!(meta.playlist_id.as_deref(), Some("PL1"));
    assert_eq!(meta.playlist_index, Some(3));
    assert_eq!(meta.title.as_deref(), Some("dQw4w9WgXcQ"));
    assert!(meta.canonical_url.starts_with("https://www.youtube-nocookie.com/embed/dQw4w9WgXcQ"));
  }

  #[tokio::test]
  async fn manifest_url_is_hls_and_unchanged() {
    let (c, backend) = classifier(FakeBackend::default());
    let meta = c.classify("https://example.com/live/ch.m3u8").await;
    assert_eq!(meta.embed_type, EmbedType::Hls);
    assert_eq!(meta.canonical_url, "https://example.com/live/ch.m3u8");
    assert_eq!(meta.provider.as_deref(), Some("HLS"));
    assert_eq!(meta.content_type.as_deref(), Some("video"));
    assert_eq!(backend.probe_calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn deep_probe_detects_manifest() {
    let (c, backend) = classifier(FakeBackend { probe: true, ..Default::default() });
    let meta = c.classify("https://streams.example.com/channel/7").await;
    assert_eq!(meta.embed_type, EmbedType::Hls);
    assert_eq!(backend.probe_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn plain_page_is_iframe() {
    let (c, _) = classifier(FakeBackend::default());
    let meta = c.classify("example.com/dashboard").await;
    assert_eq!(meta.embed_type, EmbedType::Iframe);
    assert_eq!(meta.canonical_url, "https://example.com/dashboard");
    assert_eq!(meta.content_type.as_deref(), Some("website"));
  }

  #[tokio::test]
  async fn empty_url_is_iframe() {
    let (c, _) = classifier(FakeBackend::default());
    let meta = c.classify("   ").await;
    assert_eq!(meta.embed_type, EmbedType::Iframe);
    assert_eq!(meta.original_url, "");
  }

  #[tokio::test]
  async fn live_video_resolves_manifest() {
    let backend = FakeBackend {
      oembed: Some(oembed_html("<iframe data-is_live=\"1\">")),
      manifest: Some("https://manifest.googlevideo.com/x.m3u8".into()),
      ..Default::default()
    };
    let (c, _) = classifier(backend);
    let meta = c.classify("https://www.youtube.com/watch?v=dQw4w9WgXcQ").await;
    assert_eq!(meta.embed_type, EmbedType::Hls);
    assert_eq!(meta.content_type.as_deref(), Some("live"));
    assert_eq!(meta.canonical_url, "https://manifest.googlevideo.com/x.m3u8");
    assert_eq!(meta.title.as_deref(), Some("Clip"));
  }

  #[tokio::test]
  async fn live_video_without_manifest_falls_back_to_mpv() {
    let backend = FakeBackend { oembed: Some(oembed_html("live now")), ..Default::default() };
    let (c, _) = classifier(backend);
    let meta = c.classify("https://www.youtube.com/watch?v=dQw4w9WgXcQ").await;
    assert_eq!(meta.embed_type, EmbedType::Mpv);
    assert_eq!(meta.canonical_url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
    assert!(meta.warning.is_some());
  }

  #[tokio::test]
  async fn playlist_content_type_from_oembed() {
    let backend = FakeBackend { oembed: Some(oembed_html("videoseries playlist")), ..Default::default() };
    let (c, _) = classifier(backend);
    let meta = c.classify("https://www.youtube.com/watch?v=dQw4w9WgXcQ&list=PL9").await;
    assert_eq!(meta.content_type.as_deref(), Some("playlist"));
    assert_eq!(meta.embed_type, EmbedType::Youtube);
  }

  #[tokio::test]
  async fn live_wins_over_playlist() {
    let backend = FakeBackend { oembed: Some(oembed_html("videoseries playlist is_live")), ..Default::default() };
    let (c, _) = classifier(backend);
    let meta = c.classify("https://www.youtube.com/watch?v=dQw4w9WgXcQ&list=PL9").await;
    assert_eq!(meta.content_type.as_deref(), Some("live"));
  }

  #[tokio::test]
  async fn oembed_results_are_cached() {
    let backend = FakeBackend { oembed: Some(oembed_html("<iframe>")), ..Default::default() };
    let (c, backend) = classifier(backend);
    c.classify("https://youtu.be/dQw4w9WgXcQ").await;
    c.classify(" https://youtu.be/dQw4w9WgXcQ ").await;
    assert_eq!(backend.oembed_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn channel_from_oembed_author_url() {
    let backend = FakeBackend {
      oembed: Some(OembedInfo {
        author_url: Some("https://www.youtube.com/channel/UCxyz".into()),
        html: Some("<iframe>".into()),
        ..Default::default()
      }),
      ..Default::default()
    };
    let (c, _) = classifier(backend);
    let meta = c.classify("https://youtu.be/dQw4w9WgXcQ").await;
    assert_eq!(meta.channel_id.as_deref(), Some("UCxyz"));
  }

  // --- persistence ---

  #[test]
  fn unset_fields_are_not_serialized() {
    let meta = EmbedMetadata::new(EmbedType::Hls, "https://a/x.m3u8", "https://a/x.m3u8");
    let value = serde_json::to_value(&meta).unwrap();
    assert_eq!(value["embed_type"], "hls");
    assert!(value.get("title").is_none());
    assert!(value.get("playlist_index").is_none());
  }

  #[test]
  fn stored_record_without_canonical_is_normalized() {
    let meta: EmbedMetadata = serde_json::from_str(r#"{"original_url":"https://a"}"#).unwrap();
    let meta = meta.normalized();
    assert_eq!(meta.embed_type, EmbedType::Iframe);
    assert_eq!(meta.canonical_url, "https://a");
  }
}
