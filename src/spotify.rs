//! Spotify "now playing" tracking.
//!
//! A poll task replaces [`SpotifyState`] wholesale on a `watch` channel. A
//! second, faster task extrapolates playback progress between polls so the
//! progress bar moves smoothly without extra API calls.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::FutureExt;
use futures::future::BoxFuture;
use image::DynamicImage;
use reqwest::{Client, StatusCode, header::AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{DisplayConfig, SpotifyConfig};
use crate::constants::constants;
use crate::error::MediaError;

// --- State ---

/// Snapshot of the last poll. Never partially updated.
#[derive(Debug, Clone, Default)]
pub struct SpotifyState {
  pub track: String,
  pub artist: String,
  pub album: String,
  pub art_url: Option<String>,
  pub album_art: Option<Arc<DynamicImage>>,
  pub progress_ms: u64,
  pub duration_ms: u64,
  pub fetched_at: Option<Instant>,
  pub playing: bool,
}

impl SpotifyState {
  /// Progress at `now`, extrapolated from the last poll while playing.
  pub fn progress_at(&self, now: Instant) -> u64 {
    let elapsed = match (self.playing, self.fetched_at) {
      (true, Some(at)) => now.saturating_duration_since(at).as_millis() as u64,
      _ => 0,
    };
    self.progress_ms.saturating_add(elapsed).min(self.duration_ms)
  }

  pub fn sample(&self, now: Instant) -> ProgressSample {
    let progress_ms = self.progress_at(now);
    let percent = if self.duration_ms == 0 { 0 } else { (progress_ms * 100 / self.duration_ms).min(100) as u8 };
    ProgressSample { progress_ms, duration_ms: self.duration_ms, percent }
  }

  /// Overlay text built from the display's song/artist/album toggles.
  pub fn info_text(&self, display: &DisplayConfig) -> String {
    let parts: Vec<&str> = [
      (display.spotify_show_song, self.track.as_str()),
      (display.spotify_show_artist, self.artist.as_str()),
      (display.spotify_show_album, self.album.as_str()),
    ]
    .into_iter()
    .filter(|(show, text)| *show && !text.is_empty())
    .map(|(_, text)| text)
    .collect();
    let position = display.spotify_info_position.to_ascii_lowercase();
    let separator = if position.contains("left") || position.contains("right") { "\n" } else { " | " };
    parts.join(separator)
  }

  fn inert(previous: &SpotifyState) -> SpotifyState {
    SpotifyState { playing: false, ..previous.clone() }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSample {
  pub progress_ms: u64,
  pub duration_ms: u64,
  pub percent: u8,
}

// --- Playback API ---

/// A track currently playing, as reported by the API.
#[derive(Debug, Clone, PartialEq)]
pub struct Playback {
  pub track: String,
  pub artist: String,
  pub album: String,
  pub art_url: Option<String>,
  pub progress_ms: u64,
  pub duration_ms: u64,
}

#[derive(Deserialize)]
struct PlayerResponse {
  #[serde(default)]
  is_playing: bool,
  progress_ms: Option<u64>,
  item: Option<TrackItem>,
}

#[derive(Deserialize)]
struct TrackItem {
  name: String,
  #[serde(default)]
  duration_ms: u64,
  #[serde(default)]
  artists: Vec<Named>,
  album: Option<AlbumItem>,
}

#[derive(Deserialize)]
struct Named {
  name: String,
}

#[derive(Deserialize)]
struct AlbumItem {
  name: String,
  #[serde(default)]
  images: Vec<ImageRef>,
}

#[derive(Deserialize)]
struct ImageRef {
  url: String,
}

/// Parse a `/v1/me/player` body. Paused or empty players yield `None`.
pub fn parse_playback(body: &str) -> Result<Option<Playback>, MediaError> {
  let response: PlayerResponse =
    serde_json::from_str(body).map_err(|e| MediaError::NetworkFailure(format!("bad player response: {e}")))?;
  let Some(item) = response.item.filter(|_| response.is_playing) else {
    return Ok(None);
  };
  let artist = item.artists.iter().map(|a| a.name.as_str()).collect::<Vec<_>>().join(", ");
  let (album, art_url) = match item.album {
    Some(album) => (album.name, album.images.into_iter().next().map(|i| i.url)),
    None => (String::new(), None),
  };
  Ok(Some(Playback {
    track: item.name,
    artist,
    album,
    art_url,
    progress_ms: response.progress_ms.unwrap_or(0),
    duration_ms: item.duration_ms,
  }))
}

/// Where playback information comes from.
pub trait PlaybackSource: Send + Sync {
  fn current_playback(&self) -> BoxFuture<'_, Result<Option<Playback>, MediaError>>;
  fn album_art<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<DynamicImage, MediaError>>;
}

/// Cached OAuth token, compatible with the common spotipy cache layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenInfo {
  pub access_token: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub refresh_token: Option<String>,
  /// Unix seconds.
  #[serde(default)]
  pub expires_at: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub scope: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub token_type: Option<String>,
}

impl TokenInfo {
  pub fn is_expired(&self, now: i64) -> bool {
    self.expires_at - constants().spotify_token_skew_secs <= now
  }
}

#[derive(Deserialize)]
struct RefreshResponse {
  access_token: String,
  expires_in: i64,
  refresh_token: Option<String>,
  scope: Option<String>,
  token_type: Option<String>,
}

/// The Spotify Web API, authenticated from a token cache file.
pub struct SpotifyWebApi {
  http: Client,
  client_id: String,
  client_secret: String,
  cache_path: PathBuf,
  token: Mutex<Option<TokenInfo>>,
}

impl SpotifyWebApi {
  /// `None` when credentials are not configured.
  pub fn from_config(http: Client, config: &SpotifyConfig) -> Option<Self> {
    if !config.is_configured() {
      return None;
    }
    Some(Self {
      http,
      client_id: config.client_id.trim().to_string(),
      client_secret: config.client_secret.trim().to_string(),
      cache_path: config.token_cache_path()?,
      token: Mutex::new(None),
    })
  }

  async fn load_token(path: &Path) -> Result<TokenInfo, MediaError> {
    let content = tokio::fs::read_to_string(path)
      .await
      .map_err(|e| MediaError::CredentialFailure(format!("no token cache at {}: {e}", path.display())))?;
    serde_json::from_str(&content).map_err(|e| MediaError::CredentialFailure(format!("unreadable token cache: {e}")))
  }

  async fn save_token(&self, token: &TokenInfo) {
    let result = async {
      if let Some(dir) = self.cache_path.parent() {
        tokio::fs::create_dir_all(dir).await?;
      }
      let content = serde_json::to_string_pretty(token).map_err(std::io::Error::other)?;
      tokio::fs::write(&self.cache_path, content).await
    }
    .await;
    if let Err(e) = result {
      warn!(path = %self.cache_path.display(), err = %e, "spotify: failed to write token cache");
    }
  }

  async fn refresh(&self, token: &TokenInfo) -> Result<TokenInfo, MediaError> {
    let refresh_token = token
      .refresh_token
      .as_deref()
      .ok_or_else(|| MediaError::CredentialFailure("token cache has no refresh token".to_string()))?;
    let basic = STANDARD.encode(format!("{}:{}", self.client_id, self.client_secret));
    let response = self
      .http
      .post(&constants().spotify_token_url)
      .header(AUTHORIZATION, format!("Basic {basic}"))
      .form(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
      .timeout(constants().http_timeout())
      .send()
      .await?;
    let status = response.status();
    if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
      return Err(MediaError::CredentialFailure(format!("token refresh rejected ({status})")));
    }
    if !status.is_success() {
      return Err(MediaError::NetworkFailure(format!("token refresh failed ({status})")));
    }
    let body: RefreshResponse = response.json().await?;
    info!("spotify: access token refreshed");
    Ok(TokenInfo {
      access_token: body.access_token,
      refresh_token: body.refresh_token.or_else(|| token.refresh_token.clone()),
      expires_at: chrono::Utc::now().timestamp() + body.expires_in,
      scope: body.scope.or_else(|| token.scope.clone()),
      token_type: body.token_type.or_else(|| token.token_type.clone()),
    })
  }

  async fn access_token(&self) -> Result<String, MediaError> {
    let mut guard = self.token.lock().await;
    let token = match guard.take() {
      Some(token) => token,
      None => Self::load_token(&self.cache_path).await?,
    };
    let token = if token.is_expired(chrono::Utc::now().timestamp()) {
      let refreshed = self.refresh(&token).await?;
      self.save_token(&refreshed).await;
      refreshed
    } else {
      token
    };
    let access = token.access_token.clone();
    *guard = Some(token);
    Ok(access)
  }

  async fn fetch_playback(&self) -> Result<Option<Playback>, MediaError> {
    let token = self.access_token().await?;
    let response = self
      .http
      .get(&constants().spotify_player_url)
      .bearer_auth(token)
      .timeout(constants().http_timeout())
      .send()
      .await?;
    match response.status() {
      StatusCode::NO_CONTENT => Ok(None),
      StatusCode::UNAUTHORIZED => {
        *self.token.lock().await = None;
        Err(MediaError::CredentialFailure("access token rejected".to_string()))
      }
      status if !status.is_success() => Err(MediaError::NetworkFailure(format!("player query failed ({status})"))),
      _ => parse_playback(&response.text().await?),
    }
  }

  async fn fetch_album_art(&self, url: &str) -> Result<DynamicImage, MediaError> {
    let response =
      self.http.get(url).timeout(Duration::from_secs(constants().album_art_timeout_secs)).send().await?;
    if !response.status().is_success() {
      return Err(MediaError::NetworkFailure(format!("album art request failed ({})", response.status())));
    }
    let bytes = response.bytes().await?;
    image::load_from_memory(&bytes).map_err(|e| MediaError::decode(url, e))
  }
}

impl PlaybackSource for SpotifyWebApi {
  fn current_playback(&self) -> BoxFuture<'_, Result<Option<Playback>, MediaError>> {
    self.fetch_playback().boxed()
  }

  fn album_art<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<DynamicImage, MediaError>> {
    self.fetch_album_art(url).boxed()
  }
}

// --- Tracker ---

/// One poll: a new snapshot, or the previous one marked not playing.
pub async fn poll_once(source: &dyn PlaybackSource, previous: &SpotifyState) -> SpotifyState {
  let playback = match source.current_playback().await {
    Ok(Some(playback)) => playback,
    Ok(None) => {
      debug!("spotify: nothing playing");
      return SpotifyState::inert(previous);
    }
    Err(e) => {
      warn!(err = %e, "spotify: poll failed");
      return SpotifyState::inert(previous);
    }
  };

  let album_art = match &playback.art_url {
    Some(url) if previous.art_url.as_ref() == Some(url) && previous.album_art.is_some() => previous.album_art.clone(),
    Some(url) => match source.album_art(url).await {
      Ok(image) => Some(Arc::new(image)),
      Err(e) => {
        warn!(url = %url, err = %e, "spotify: album art unavailable");
        None
      }
    },
    None => None,
  };

  SpotifyState {
    track: playback.track,
    artist: playback.artist,
    album: playback.album,
    art_url: playback.art_url,
    album_art,
    progress_ms: playback.progress_ms,
    duration_ms: playback.duration_ms,
    fetched_at: Some(Instant::now()),
    playing: true,
  }
}

/// Owns the poll task and, optionally, the progress task. Both stop on drop.
pub struct SpotifyTracker {
  state: watch::Receiver<Arc<SpotifyState>>,
  poll: JoinHandle<()>,
  progress: Option<(watch::Receiver<ProgressSample>, JoinHandle<()>)>,
}

impl SpotifyTracker {
  pub fn spawn(source: Arc<dyn PlaybackSource>, interval: Duration) -> Self {
    let (tx, rx) = watch::channel(Arc::new(SpotifyState::default()));
    let poll = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let previous = tx.borrow().clone();
        let next = poll_once(source.as_ref(), &previous).await;
        if tx.send(Arc::new(next)).is_err() {
          break;
        }
      }
    });
    Self { state: rx, poll, progress: None }
  }

  pub fn state(&self) -> Arc<SpotifyState> {
    self.state.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<Arc<SpotifyState>> {
    self.state.clone()
  }

  /// Start (or restart) progress extrapolation at `interval`.
  pub fn start_progress(&mut self, interval: Duration) -> watch::Receiver<ProgressSample> {
    self.stop_progress();
    let (rx, handle) = spawn_progress_ticker(self.state.clone(), interval);
    self.progress = Some((rx.clone(), handle));
    rx
  }

  pub fn stop_progress(&mut self) {
    if let Some((_, handle)) = self.progress.take() {
      handle.abort();
    }
  }

  pub fn progress(&self) -> Option<watch::Receiver<ProgressSample>> {
    self.progress.as_ref().map(|(rx, _)| rx.clone())
  }
}

impl Drop for SpotifyTracker {
  fn drop(&mut self) {
    self.poll.abort();
    self.stop_progress();
  }
}

pub fn spawn_progress_ticker(
  state: watch::Receiver<Arc<SpotifyState>>,
  interval: Duration,
) -> (watch::Receiver<ProgressSample>, JoinHandle<()>) {
  let initial = state.borrow().sample(Instant::now());
  let (tx, rx) = watch::channel(initial);
  let handle = tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
      ticker.tick().await;
      let sample = state.borrow().sample(Instant::now());
      if tx.send(sample).is_err() {
        break;
      }
    }
  });
  (rx, handle)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex as StdMutex;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct FakeSource {
    playback: StdMutex<Result<Option<Playback>, MediaError>>,
    art_calls: AtomicUsize,
  }

  impl FakeSource {
    fn playing(track: &str, art: &str) -> Self {
      Self { playback: StdMutex::new(Ok(Some(playback(track, art)))), art_calls: AtomicUsize::new(0) }
    }

    fn set(&self, value: Result<Option<Playback>, MediaError>) {
      *self.playback.lock().unwrap() = value;
    }
  }

  fn playback(track: &str, art: &str) -> Playback {
    Playback {
      track: track.to_string(),
      artist: "Artist".to_string(),
      album: "Album".to_string(),
      art_url: Some(art.to_string()),
      progress_ms: 1_000,
      duration_ms: 200_000,
    }
  }

  impl PlaybackSource for FakeSource {
    fn current_playback(&self) -> BoxFuture<'_, Result<Option<Playback>, MediaError>> {
      let value = match &*self.playback.lock().unwrap() {
        Ok(p) => Ok(p.clone()),
        Err(e) => Err(MediaError::NetworkFailure(e.to_string())),
      };
      futures::future::ready(value).boxed()
    }

    fn album_art<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<DynamicImage, MediaError>> {
      self.art_calls.fetch_add(1, Ordering::SeqCst);
      futures::future::ready(Ok(DynamicImage::new_rgb8(2, 2))).boxed()
    }
  }

  fn state(progress_ms: u64, duration_ms: u64, at: Instant) -> SpotifyState {
    SpotifyState { progress_ms, duration_ms, fetched_at: Some(at), playing: true, ..Default::default() }
  }

  // --- extrapolation ---

  #[test]
  fn progress_extrapolates_from_fetch_time() {
    let t = Instant::now();
    let s = state(10_000, 200_000, t);
    assert_eq!(s.progress_at(t + Duration::from_millis(2_000)), 12_000);
  }

  #[test]
  fn progress_clamps_to_duration() {
    let t = Instant::now();
    let s = state(199_000, 200_000, t);
    assert_eq!(s.progress_at(t + Duration::from_secs(5)), 200_000);
    assert_eq!(s.sample(t + Duration::from_secs(5)).percent, 100);
  }

  #[test]
  fn paused_state_does_not_advance() {
    let t = Instant::now();
    let s = SpotifyState { playing: false, ..state(10_000, 200_000, t) };
    assert_eq!(s.progress_at(t + Duration::from_secs(3)), 10_000);
  }

  #[test]
  fn percent_is_zero_without_duration() {
    let s = SpotifyState::default();
    assert_eq!(s.sample(Instant::now()).percent, 0);
  }

  // --- text ---

  #[test]
  fn info_text_respects_toggles_and_position() {
    let s = SpotifyState { track: "Song".into(), artist: "A, B".into(), album: "LP".into(), ..Default::default() };
    let mut display = DisplayConfig::default();
    assert_eq!(s.info_text(&display), "Song | A, B | LP");
    display.spotify_show_album = false;
    display.spotify_info_position = "top-left".into();
    assert_eq!(s.info_text(&display), "Song\nA, B");
  }

  // --- parsing ---

  #[test]
  fn playback_json_is_parsed() {
    let body = r#"{
      "is_playing": true,
      "progress_ms": 4200,
      "item": {
        "name": "Song",
        "duration_ms": 180000,
        "artists": [{"name": "A"}, {"name": "B"}],
        "album": {"name": "LP", "images": [{"url": "https://i/big.jpg"}, {"url": "https://i/small.jpg"}]}
      }
    }"#;
    let p = parse_playback(body).unwrap().unwrap();
    assert_eq!(p.artist, "A, B");
    assert_eq!(p.art_url.as_deref(), Some("https://i/big.jpg"));
    assert_eq!(p.progress_ms, 4200);
  }

  #[test]
  fn paused_or_empty_player_is_none() {
    assert!(parse_playback(r#"{"is_playing": false, "item": {"name": "x"}}"#).unwrap().is_none());
    assert!(parse_playback(r#"{"is_playing": true, "item": null}"#).unwrap().is_none());
    assert!(parse_playback("not json").is_err());
  }

  #[test]
  fn token_expiry_includes_skew() {
    let token = TokenInfo {
      access_token: "a".into(),
      refresh_token: Some("r".into()),
      expires_at: 1_000,
      scope: None,
      token_type: None,
    };
    assert!(!token.is_expired(900));
    assert!(token.is_expired(950));
  }

  // --- polling ---

  #[tokio::test]
  async fn album_art_fetched_once_per_track() {
    let source = FakeSource::playing("One", "https://i/1.jpg");
    let first = poll_once(&source, &SpotifyState::default()).await;
    assert!(first.playing && first.album_art.is_some());
    let second = poll_once(&source, &first).await;
    assert_eq!(source.art_calls.load(Ordering::SeqCst), 1);

    source.set(Ok(Some(playback("Two", "https://i/2.jpg"))));
    let third = poll_once(&source, &second).await;
    assert_eq!(third.track, "Two");
    assert_eq!(source.art_calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn failures_leave_stale_but_inert_state() {
    let source = FakeSource::playing("One", "https://i/1.jpg");
    let playing = poll_once(&source, &SpotifyState::default()).await;
    source.set(Err(MediaError::CredentialFailure("expired".into())));
    let failed = poll_once(&source, &playing).await;
    assert!(!failed.playing);
    assert_eq!(failed.track, "One");

    source.set(Ok(None));
    assert!(!poll_once(&source, &playing).await.playing);
  }

  #[tokio::test]
  async fn tracker_publishes_snapshots() {
    let source: Arc<dyn PlaybackSource> = Arc::new(FakeSource::playing("One", "https://i/1.jpg"));
    let mut tracker = SpotifyTracker::spawn(source, Duration::from_millis(20));
    let mut rx = tracker.subscribe();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.playing)).await.unwrap().unwrap();
    assert_eq!(tracker.state().track, "One");

    let mut progress = tracker.start_progress(Duration::from_millis(10));
    tokio::time::timeout(Duration::from_secs(2), progress.wait_for(|p| p.progress_ms >= 1_000)).await.unwrap().unwrap();
    tracker.stop_progress();
    assert!(tracker.progress().is_none());
  }
}
