//! Per-display slideshow engine.
//!
//! The engine owns the playback cursor, both caches, the preloader, the
//! Spotify tracker and the video controller for one display. It publishes
//! what should be on screen as a [`Presentation`] on a `watch` channel; the
//! rendering surface subscribes and paints.

use anyhow::Result;
use image::{DynamicImage, RgbaImage};
use rand::seq::SliceRandom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::aspect::AspectFilter;
use crate::background::{self, BackgroundCache, BackgroundParams};
use crate::config::{ConfigSource, DisplayConfig, GuiConfig, Mode};
use crate::constants::constants;
use crate::embed::{EmbedClassifier, EmbedMetadata, EmbedType};
use crate::error::MediaError;
use crate::library::MediaLibrary;
use crate::media_cache::{MediaCache, MediaEntry};
use crate::preloader::{Preloader, look_ahead};
use crate::spotify::{PlaybackSource, ProgressSample, SpotifyState, SpotifyTracker};
use crate::video::{PlayerLauncher, PlayerOptions, VideoPlaybackController, VideoSessionInfo};

pub const NO_MEDIA: &str = "No media found";
pub const NO_VIDEOS: &str = "No videos found";
pub const NO_WEB_PAGE: &str = "No web page configured";
pub const NOTHING_PLAYING: &str = "Nothing playing";
pub const WEB_LOAD_FAILED: &str = "Web page failed to load";
pub const LOADING_PAGE: &str = "Loading page";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(PoisonError::into_inner)
}

// --- Presentation ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
  Image,
  Spotify,
  Webpage,
  Video,
  Empty,
  Error,
}

/// What the rendering surface should show.
#[derive(Debug, Clone)]
pub enum Presentation {
  Message {
    state: DisplayState,
    text: String,
  },
  Image {
    path: PathBuf,
    media: Arc<MediaEntry>,
    background: Option<Arc<RgbaImage>>,
    rotation: i32,
    foreground_scale_percent: u32,
    /// Shown in place of an idle Spotify player.
    fallback: bool,
  },
  Spotify {
    art: Option<Arc<DynamicImage>>,
    background: Option<Arc<RgbaImage>>,
    text: String,
    show_progress: bool,
    info_position: String,
  },
  Webpage {
    url: String,
    metadata: EmbedMetadata,
  },
  /// A URL the native player should open as a local media stream.
  Stream {
    url: String,
    metadata: EmbedMetadata,
  },
  Video {
    path: PathBuf,
  },
}

impl Presentation {
  fn message(state: DisplayState, text: &str) -> Self {
    Self::Message { state, text: text.to_string() }
  }

  pub fn state(&self) -> DisplayState {
    match self {
      Self::Message { state, .. } => *state,
      Self::Image { fallback: false, .. } => DisplayState::Image,
      Self::Image { fallback: true, .. } | Self::Spotify { .. } => DisplayState::Spotify,
      Self::Webpage { .. } | Self::Stream { .. } => DisplayState::Webpage,
      Self::Video { .. } => DisplayState::Video,
    }
  }
}

// --- Playback state ---

/// The cursor over the current candidate sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackState {
  pub mode: Mode,
  pub sequence: Arc<Vec<PathBuf>>,
  /// `None` before the first advance.
  pub index: Option<usize>,
  pub last_displayed: Option<PathBuf>,
  /// Built on first use while Spotify is idle.
  pub fallback_sequence: Option<Arc<Vec<PathBuf>>>,
  pub fallback_index: Option<usize>,
}

/// Candidate paths for `mode`: gathered, aspect-filtered, then optionally shuffled.
pub fn build_sequence(library: &MediaLibrary, aspect: &AspectFilter, mode: Mode, display: &DisplayConfig) -> Vec<PathBuf> {
  let (candidates, shuffle) = match mode {
    Mode::RandomImage => (library.gather_images(&display.image_category), display.shuffle_mode),
    Mode::Mixed => (library.gather_mixed(&display.mixed_folders), display.shuffle_mode),
    Mode::SpecificImage => {
      (library.specific(&display.image_category, &display.specific_image).into_iter().collect(), false)
    }
    Mode::Videos => (library.gather_videos(&display.video_category), display.shuffle_videos),
    Mode::Spotify | Mode::Webpage => (Vec::new(), false),
  };
  let mut sequence = aspect.retain(candidates, display.aspect_filter);
  if shuffle {
    sequence.shuffle(&mut rand::rng());
  }
  sequence
}

// --- Engine ---

/// Shared collaborators, built once per process and handed to every display.
#[derive(Clone)]
pub struct EngineDeps {
  pub config: Arc<dyn ConfigSource>,
  pub aspect: Arc<AspectFilter>,
  pub embed: Arc<EmbedClassifier>,
  pub launcher: Arc<dyn PlayerLauncher>,
  pub spotify: Option<Arc<dyn PlaybackSource>>,
}

#[derive(Debug, Clone)]
struct RenderSettings {
  gui: GuiConfig,
  preload_count: usize,
}

pub struct SlideshowEngine {
  me: Weak<SlideshowEngine>,
  name: String,
  deps: EngineDeps,
  viewport: Mutex<(u32, u32)>,
  display: RwLock<Arc<DisplayConfig>>,
  settings: RwLock<RenderSettings>,
  library: RwLock<MediaLibrary>,
  playback: Mutex<PlaybackState>,
  media: Arc<MediaCache>,
  backgrounds: Arc<BackgroundCache>,
  preloader: Preloader,
  video: Arc<VideoPlaybackController>,
  video_events: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<crate::video::VideoEvent>>>,
  spotify: Mutex<Option<SpotifyTracker>>,
  presentation: watch::Sender<Presentation>,
  advance_lock: tokio::sync::Mutex<()>,
  ticker: Mutex<Option<JoinHandle<()>>>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
  /// Bumped by every reload; a classification started earlier is not published.
  web_generation: AtomicU64,
  web_task: Mutex<Option<(String, JoinHandle<()>)>>,
}

impl SlideshowEngine {
  /// Build an engine for display `name`. Cache capacities are fixed here.
  pub fn new(name: impl Into<String>, deps: EngineDeps, viewport: (u32, u32)) -> Result<Arc<Self>> {
    let name = name.into();
    let config = deps.config.load()?;
    let media = Arc::new(MediaCache::new(config.cache_capacity));
    let backgrounds = Arc::new(BackgroundCache::new(config.background_cache_capacity));
    let (video, video_events) = VideoPlaybackController::new(deps.launcher.clone());
    let (presentation, _) = watch::channel(Presentation::message(DisplayState::Empty, NO_MEDIA));
    Ok(Arc::new_cyclic(|me| Self {
      me: me.clone(),
      display: RwLock::new(Arc::new(config.display(&name))),
      settings: RwLock::new(RenderSettings { gui: config.gui.clone(), preload_count: config.preload_count }),
      library: RwLock::new(MediaLibrary::new(config.media_root.clone())),
      name,
      deps,
      viewport: Mutex::new(viewport),
      playback: Mutex::new(PlaybackState::default()),
      preloader: Preloader::new(media.clone(), backgrounds.clone()),
      media,
      backgrounds,
      video,
      video_events: Mutex::new(Some(video_events)),
      spotify: Mutex::new(None),
      presentation,
      advance_lock: tokio::sync::Mutex::new(()),
      ticker: Mutex::new(None),
      tasks: Mutex::new(Vec::new()),
      web_generation: AtomicU64::new(0),
      web_task: Mutex::new(None),
    }))
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Spawn the background tasks, load the config and show the first item.
  pub async fn start(self: &Arc<Self>) -> Result<()> {
    if let Some(events) = lock(&self.video_events).take() {
      let chain = self.video.spawn_chain(events);
      let forwarder = self.spawn_video_forwarder();
      lock(&self.tasks).extend([chain, forwarder]);
    }
    self.reload().await?;
    self.advance(true).await;
    Ok(())
  }

  /// Stop every task and the live video session.
  pub async fn shutdown(&self) {
    if let Some(ticker) = lock(&self.ticker).take() {
      ticker.abort();
    }
    for task in lock(&self.tasks).drain(..) {
      task.abort();
    }
    self.cancel_web_task();
    lock(&self.spotify).take();
    self.video.stop(false).await;
    info!(display = %self.name, "engine: shut down");
  }

  // --- Accessors ---

  pub fn subscribe(&self) -> watch::Receiver<Presentation> {
    self.presentation.subscribe()
  }

  pub fn presentation(&self) -> Presentation {
    self.presentation.borrow().clone()
  }

  pub fn display_state(&self) -> DisplayState {
    self.presentation.borrow().state()
  }

  pub fn playback(&self) -> PlaybackState {
    lock(&self.playback).clone()
  }

  pub fn display_config(&self) -> Arc<DisplayConfig> {
    self.display.read().unwrap_or_else(PoisonError::into_inner).clone()
  }

  pub fn spotify_state(&self) -> Option<Arc<SpotifyState>> {
    lock(&self.spotify).as_ref().map(SpotifyTracker::state)
  }

  pub fn spotify_progress(&self) -> Option<watch::Receiver<ProgressSample>> {
    lock(&self.spotify).as_ref().and_then(SpotifyTracker::progress)
  }

  pub fn video_session(&self) -> Option<VideoSessionInfo> {
    self.video.session()
  }

  pub fn media_cache(&self) -> &Arc<MediaCache> {
    &self.media
  }

  pub fn background_cache(&self) -> &Arc<BackgroundCache> {
    &self.backgrounds
  }

  pub fn set_viewport(&self, viewport: (u32, u32)) {
    *lock(&self.viewport) = viewport;
  }

  fn publish(&self, presentation: Presentation) {
    debug!(display = %self.name, state = ?presentation.state(), "engine: presenting");
    self.presentation.send_replace(presentation);
  }

  fn background_params(&self) -> BackgroundParams {
    let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
    BackgroundParams {
      viewport: *lock(&self.viewport),
      blur_radius: settings.gui.background_blur_radius,
      scale_percent: settings.gui.background_scale_percent,
    }
  }

  // --- Reload ---

  /// Re-read the config, rebuild the sequence, rewind the cursor and restart the tick.
  pub async fn reload(self: &Arc<Self>) -> Result<()> {
    let _guard = self.advance_lock.lock().await;
    let config = self.deps.config.load()?;
    let display = Arc::new(config.display(&self.name));
    let library = MediaLibrary::new(config.media_root.clone());

    self.preloader.invalidate();
    self.cancel_web_task();
    let previous_root = self.library.read().unwrap_or_else(PoisonError::into_inner).root().to_path_buf();
    if previous_root.as_path() != library.root() {
      debug!(display = %self.name, root = %library.root().display(), "engine: media root changed, clearing caches");
      self.media.clear();
      self.backgrounds.clear();
    }
    *self.settings.write().unwrap_or_else(PoisonError::into_inner) =
      RenderSettings { gui: config.gui.clone(), preload_count: config.preload_count };
    *self.library.write().unwrap_or_else(PoisonError::into_inner) = library.clone();
    *self.display.write().unwrap_or_else(PoisonError::into_inner) = display.clone();

    let mode = display.mode;
    let sequence = self.gather(library, mode, display.clone()).await;
    info!(display = %self.name, mode = mode.as_str(), items = sequence.len(), "engine: reloaded");

    *lock(&self.playback) = PlaybackState { mode, sequence: sequence.clone(), ..PlaybackState::default() };

    if mode == Mode::Videos {
      self.video.load(sequence.to_vec(), PlayerOptions::from_display(&display)).await;
    } else {
      self.video.stop(false).await;
    }
    self.sync_spotify(&display);

    let period = match mode {
      Mode::Spotify => constants().spotify_tick(),
      _ => Duration::from_secs(display.image_interval),
    };
    self.restart_ticker(period);
    Ok(())
  }

  async fn gather(&self, library: MediaLibrary, mode: Mode, display: Arc<DisplayConfig>) -> Arc<Vec<PathBuf>> {
    let aspect = self.deps.aspect.clone();
    match tokio::task::spawn_blocking(move || build_sequence(&library, &aspect, mode, &display)).await {
      Ok(sequence) => Arc::new(sequence),
      Err(e) => {
        error!(display = %self.name, err = %e, "engine: sequence build failed");
        Arc::new(Vec::new())
      }
    }
  }

  fn sync_spotify(&self, display: &DisplayConfig) {
    let mut slot = lock(&self.spotify);
    if display.mode != Mode::Spotify {
      slot.take();
      return;
    }
    let Some(source) = &self.deps.spotify else {
      warn!(display = %self.name, "engine: spotify mode without credentials");
      slot.take();
      return;
    };
    let tracker = slot.get_or_insert_with(|| SpotifyTracker::spawn(source.clone(), constants().spotify_poll()));
    if display.spotify_show_progress {
      tracker.start_progress(Duration::from_millis(display.spotify_progress_update_interval));
    } else {
      tracker.stop_progress();
    }
  }

  fn restart_ticker(self: &Arc<Self>, period: Duration) {
    let engine = Arc::downgrade(self);
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let Some(engine) = Weak::upgrade(&engine) else {
          break;
        };
        engine.advance(false).await;
      }
    });
    if let Some(previous) = lock(&self.ticker).replace(handle) {
      previous.abort();
    }
  }

  fn spawn_video_forwarder(self: &Arc<Self>) -> JoinHandle<()> {
    let engine = Arc::downgrade(self);
    let mut sessions = self.video.subscribe();
    tokio::spawn(async move {
      while sessions.changed().await.is_ok() {
        let session = sessions.borrow_and_update().clone();
        let Some(engine) = Weak::upgrade(&engine) else {
          break;
        };
        if let Some(session) = session
          && engine.display_config().mode == Mode::Videos
        {
          engine.publish(Presentation::Video { path: session.path });
        }
      }
    })
  }

  // --- Advance ---

  /// Move to the next item for the current mode.
  ///
  /// `force` reloads a web page that is already showing and skips a running video.
  pub async fn advance(&self, force: bool) {
    let _guard = self.advance_lock.lock().await;
    let display = self.display_config();
    match display.mode {
      Mode::RandomImage | Mode::Mixed | Mode::SpecificImage => self.advance_images(&display).await,
      Mode::Spotify => self.show_spotify(&display).await,
      Mode::Webpage => self.show_webpage(&display, force),
      Mode::Videos => self.advance_video(force).await,
    }
  }

  /// Terminate the current item; with `advance` move on to the next one.
  pub async fn stop(&self, advance: bool) {
    if self.display_config().mode == Mode::Videos {
      self.video.stop(advance).await;
    } else if advance {
      self.advance(true).await;
    }
  }

  /// The rendering surface could not load the current page.
  pub fn notify_web_load_failed(&self) {
    if self.display_config().mode == Mode::Webpage {
      warn!(display = %self.name, "engine: web page failed to load");
      self.publish(Presentation::message(DisplayState::Error, WEB_LOAD_FAILED));
    }
  }

  /// Classify `url` without touching the display's state.
  pub async fn classify_url(&self, url: &str) -> EmbedMetadata {
    self.deps.embed.classify(url).await
  }

  async fn advance_images(&self, display: &DisplayConfig) {
    let preload_count = self.settings.read().unwrap_or_else(PoisonError::into_inner).preload_count;
    let (path, window) = {
      let mut playback = lock(&self.playback);
      if playback.sequence.is_empty() {
        drop(playback);
        self.publish(Presentation::message(DisplayState::Empty, NO_MEDIA));
        return;
      }
      if let Some(previous) = playback.last_displayed.take() {
        self.media.invalidate(&previous);
      }
      let next = playback.index.map_or(0, |i| (i + 1) % playback.sequence.len());
      playback.index = Some(next);
      let path = playback.sequence[next].clone();
      playback.last_displayed = Some(path.clone());
      (path, look_ahead(&playback.sequence, Some(next), preload_count))
    };

    self.show_image(path, display, false).await;
    if !window.is_empty() {
      self.preloader.schedule(self.preloader.request(window, self.background_params()));
    }
  }

  async fn show_image(&self, path: PathBuf, display: &DisplayConfig, fallback: bool) {
    let media = self.media.clone();
    let backgrounds = self.backgrounds.clone();
    let params = self.background_params();
    let target = path.clone();
    let loaded = tokio::task::spawn_blocking(move || {
      let entry = media.get(&target)?;
      let background = backgrounds.get_or_compose(&target, &entry.first_frame, params);
      Ok::<_, MediaError>((entry, background))
    })
    .await;

    match loaded {
      Ok(Ok((media, background))) => {
        let foreground_scale_percent =
          self.settings.read().unwrap_or_else(PoisonError::into_inner).gui.foreground_scale_percent;
        self.publish(Presentation::Image {
          path,
          media,
          background,
          rotation: display.rotate,
          foreground_scale_percent,
          fallback,
        });
      }
      Ok(Err(e)) => {
        warn!(display = %self.name, path = %path.display(), err = %e, "engine: cannot show media");
        self.media.invalidate(&path);
        self.backgrounds.invalidate(&path);
        self.publish(Presentation::message(DisplayState::Error, e.display_label()));
      }
      Err(e) => {
        error!(display = %self.name, path = %path.display(), err = %e, "engine: decode task failed");
        self.publish(Presentation::message(DisplayState::Error, MediaError::decode(&path, e).display_label()));
      }
    }
  }

  async fn show_spotify(&self, display: &DisplayConfig) {
    let state = self.spotify_state().filter(|s| s.playing);
    let Some(state) = state else {
      self.show_fallback(display).await;
      return;
    };
    let background = match state.album_art.clone() {
      Some(art) => {
        let params = self.background_params();
        tokio::task::spawn_blocking(move || {
          background::compose(&art, params.viewport, params.blur_radius, params.scale_percent).map(Arc::new)
        })
        .await
        .unwrap_or_default()
      }
      None => None,
    };
    self.publish(Presentation::Spotify {
      art: state.album_art.clone(),
      background,
      text: state.info_text(display),
      show_progress: display.spotify_show_progress,
      info_position: display.spotify_info_position.clone(),
    });
  }

  /// Idle-Spotify fallback. Uses its own sequence and cursor so the primary
  /// playback state is untouched.
  async fn show_fallback(&self, display: &DisplayConfig) {
    let mode = display.fallback_mode;
    if !mode.is_image_family() {
      self.publish(Presentation::message(DisplayState::Empty, NOTHING_PLAYING));
      return;
    }

    let cached = lock(&self.playback).fallback_sequence.clone();
    let sequence = match cached {
      Some(sequence) => sequence,
      None => {
        let library = self.library.read().unwrap_or_else(PoisonError::into_inner).clone();
        let sequence = self.gather(library, mode, Arc::new(display.clone())).await;
        lock(&self.playback).fallback_sequence = Some(sequence.clone());
        sequence
      }
    };
    if sequence.is_empty() {
      self.publish(Presentation::message(DisplayState::Empty, NO_MEDIA));
      return;
    }

    let path = {
      let mut playback = lock(&self.playback);
      let next = playback.fallback_index.map_or(0, |i| (i + 1) % sequence.len());
      playback.fallback_index = Some(next);
      sequence[next].clone()
    };
    self.show_image(path, display, true).await;
  }

  fn show_webpage(&self, display: &DisplayConfig, force: bool) {
    let url = display.web_url.trim();
    if url.is_empty() {
      self.publish(Presentation::message(DisplayState::Empty, NO_WEB_PAGE));
      return;
    }
    if !force
      && let Presentation::Webpage { metadata, .. } | Presentation::Stream { metadata, .. } = &*self.presentation.borrow()
      && metadata.describes(url)
    {
      return;
    }

    if let Some(stored) = display.embed_metadata.as_ref().filter(|m| m.describes(url)) {
      self.present_page(stored.clone());
      return;
    }
    if lock(&self.web_task).as_ref().is_some_and(|(pending, task)| pending == url && !task.is_finished()) {
      return;
    }
    let Some(engine) = self.me.upgrade() else {
      return;
    };

    self.publish(Presentation::message(DisplayState::Webpage, LOADING_PAGE));
    let generation = self.web_generation.load(Ordering::SeqCst);
    let target = url.to_string();
    let task = tokio::spawn(async move {
      let metadata = engine.classify_url(&target).await;
      engine.finish_classification(generation, &target, metadata).await;
    });
    if let Some((_, previous)) = lock(&self.web_task).replace((url.to_string(), task)) {
      previous.abort();
    }
  }

  async fn finish_classification(&self, generation: u64, url: &str, metadata: EmbedMetadata) {
    let _guard = self.advance_lock.lock().await;
    let display = self.display_config();
    if generation != self.web_generation.load(Ordering::SeqCst)
      || display.mode != Mode::Webpage
      || display.web_url.trim() != url
    {
      debug!(display = %self.name, url = %url, "engine: stale classification dropped");
      return;
    }
    self.persist_embed(&metadata).await;
    self.present_page(metadata);
  }

  fn present_page(&self, metadata: EmbedMetadata) {
    info!(display = %self.name, url = %metadata.canonical_url, embed = metadata.embed_type.as_str(), "engine: loading page");
    let url = metadata.canonical_url.clone();
    if metadata.embed_type == EmbedType::Mpv {
      self.publish(Presentation::Stream { url, metadata });
    } else {
      self.publish(Presentation::Webpage { url, metadata });
    }
  }

  fn cancel_web_task(&self) {
    self.web_generation.fetch_add(1, Ordering::SeqCst);
    if let Some((_, task)) = lock(&self.web_task).take() {
      task.abort();
    }
  }

  async fn persist_embed(&self, metadata: &EmbedMetadata) {
    let source = self.deps.config.clone();
    let name = self.name.clone();
    let record = metadata.clone();
    match tokio::task::spawn_blocking(move || source.store_embed_metadata(&name, &record)).await {
      Ok(Ok(())) => {}
      Ok(Err(e)) => warn!(display = %self.name, err = %e, "engine: failed to persist embed metadata"),
      Err(e) => warn!(display = %self.name, err = %e, "engine: persist task failed"),
    }
    let mut slot = self.display.write().unwrap_or_else(PoisonError::into_inner);
    let mut updated = (**slot).clone();
    updated.embed_metadata = Some(metadata.clone());
    *slot = Arc::new(updated);
  }

  async fn advance_video(&self, force: bool) {
    if self.video.session().is_some() && !force {
      return;
    }
    match self.video.play_next().await {
      Some(path) => self.publish(Presentation::Video { path }),
      None => self.publish(Presentation::message(DisplayState::Empty, NO_VIDEOS)),
    }
  }
}
