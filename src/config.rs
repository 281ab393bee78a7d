use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::aspect::AspectPreference;
use crate::constants::constants;
use crate::embed::EmbedMetadata;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "ECHOVIEW_CONFIG";

fn project_dirs() -> Option<ProjectDirs> {
  ProjectDirs::from("", "", &constants().app_name)
}

/// Default location of `viewer.toml`.
pub fn default_config_path() -> Option<PathBuf> {
  if let Ok(path) = std::env::var(CONFIG_ENV)
    && !path.trim().is_empty()
  {
    return Some(PathBuf::from(path));
  }
  project_dirs().map(|p| p.config_dir().join("viewer.toml"))
}

/// Directory for logs and token caches.
pub fn data_dir() -> Option<PathBuf> {
  project_dirs().map(|p| p.data_dir().to_path_buf())
}

// --- Mode ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
  #[default]
  RandomImage,
  Mixed,
  SpecificImage,
  Spotify,
  Webpage,
  Videos,
}

impl Mode {
  pub fn from_config(s: &str) -> Self {
    match s.trim().to_ascii_lowercase().as_str() {
      "random_image" | "" => Self::RandomImage,
      "mixed" => Self::Mixed,
      "specific_image" => Self::SpecificImage,
      "spotify" => Self::Spotify,
      "webpage" | "web_page" => Self::Webpage,
      "videos" | "video" => Self::Videos,
      other => {
        warn!(value = %other, "config: unknown mode, using random_image");
        Self::RandomImage
      }
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::RandomImage => "random_image",
      Self::Mixed => "mixed",
      Self::SpecificImage => "specific_image",
      Self::Spotify => "spotify",
      Self::Webpage => "webpage",
      Self::Videos => "videos",
    }
  }

  /// Modes that walk a sequence of still or animated images.
  pub fn is_image_family(self) -> bool {
    matches!(self, Self::RandomImage | Self::Mixed | Self::SpecificImage)
  }
}

impl Serialize for Mode {
  fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for Mode {
  fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
    String::deserialize(d).map(|s| Self::from_config(&s))
  }
}

// --- Display ---

/// Settings for one monitor. Replaced wholesale on every reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
  pub mode: Mode,
  pub fallback_mode: Mode,
  /// Seconds between slideshow ticks.
  pub image_interval: u64,
  pub image_category: String,
  pub specific_image: String,
  pub mixed_folders: Vec<String>,
  pub shuffle_mode: bool,
  pub rotate: i32,
  pub aspect_filter: AspectPreference,

  pub video_category: String,
  pub shuffle_videos: bool,
  pub video_mute: bool,
  pub video_volume: i32,
  pub video_play_to_end: bool,
  pub video_max_seconds: u64,

  pub spotify_show_song: bool,
  pub spotify_show_artist: bool,
  pub spotify_show_album: bool,
  pub spotify_show_progress: bool,
  /// Milliseconds between progress extrapolations.
  pub spotify_progress_update_interval: u64,
  pub spotify_info_position: String,
  pub spotify_font_size: u32,
  pub spotify_font_color: String,
  pub spotify_negative_font: bool,

  pub web_url: String,
  pub youtube_autoplay: bool,
  pub youtube_mute: bool,
  pub youtube_captions: bool,
  pub youtube_quality: String,
  /// Written back after each successful classification of `web_url`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub embed_metadata: Option<EmbedMetadata>,
}

impl Default for DisplayConfig {
  fn default() -> Self {
    Self {
      mode: Mode::RandomImage,
      fallback_mode: Mode::RandomImage,
      image_interval: 60,
      image_category: String::new(),
      specific_image: String::new(),
      mixed_folders: Vec::new(),
      shuffle_mode: false,
      rotate: 0,
      aspect_filter: AspectPreference::Any,
      video_category: String::new(),
      shuffle_videos: false,
      video_mute: true,
      video_volume: 100,
      video_play_to_end: true,
      video_max_seconds: 120,
      spotify_show_song: true,
      spotify_show_artist: true,
      spotify_show_album: true,
      spotify_show_progress: false,
      spotify_progress_update_interval: constants().spotify_progress_interval_ms,
      spotify_info_position: "bottom-center".to_string(),
      spotify_font_size: 18,
      spotify_font_color: "#FFFFFF".to_string(),
      spotify_negative_font: false,
      web_url: String::new(),
      youtube_autoplay: true,
      youtube_mute: true,
      youtube_captions: false,
      youtube_quality: "default".to_string(),
      embed_metadata: None,
    }
  }
}

impl DisplayConfig {
  /// Clamp numeric fields into their valid ranges.
  pub fn normalized(mut self) -> Self {
    self.image_interval = self.image_interval.max(1);
    self.video_volume = self.video_volume.clamp(0, 100);
    self.video_max_seconds = self.video_max_seconds.max(1);
    self.spotify_progress_update_interval = self.spotify_progress_update_interval.max(50);
    self.rotate = self.rotate.rem_euclid(360);
    self.web_url = self.web_url.trim().to_string();
    self.embed_metadata = self.embed_metadata.map(EmbedMetadata::normalized);
    self
  }
}

// --- Global sections ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuiConfig {
  pub background_blur_radius: u32,
  pub background_scale_percent: u32,
  pub foreground_scale_percent: u32,
}

impl Default for GuiConfig {
  fn default() -> Self {
    Self { background_blur_radius: 20, background_scale_percent: 100, foreground_scale_percent: 100 }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
  pub client_id: String,
  pub client_secret: String,
  pub redirect_uri: String,
  pub scope: String,
  /// Token cache file; defaults to the data directory.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cache_path: Option<PathBuf>,
}

impl SpotifyConfig {
  pub fn is_configured(&self) -> bool {
    !self.client_id.trim().is_empty() && !self.client_secret.trim().is_empty()
  }

  pub fn token_cache_path(&self) -> Option<PathBuf> {
    self.cache_path.clone().or_else(|| data_dir().map(|d| d.join(".spotify_cache")))
  }
}

/// The whole persisted configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
  pub media_root: PathBuf,
  pub cache_capacity: usize,
  pub background_cache_capacity: usize,
  pub preload_count: usize,
  pub gui: GuiConfig,
  pub spotify: SpotifyConfig,
  pub displays: BTreeMap<String, DisplayConfig>,
}

impl Default for ViewerConfig {
  fn default() -> Self {
    let c = constants();
    Self {
      media_root: data_dir().map(|d| d.join("media")).unwrap_or_else(|| PathBuf::from("media")),
      cache_capacity: c.default_cache_capacity,
      background_cache_capacity: c.default_background_cache_capacity,
      preload_count: c.default_preload_count,
      gui: GuiConfig::default(),
      spotify: SpotifyConfig::default(),
      displays: BTreeMap::new(),
    }
  }
}

impl ViewerConfig {
  /// Load from `path`. A missing file yields defaults.
  pub fn load_from(path: &Path) -> Result<Self> {
    if !path.exists() {
      info!(path = %path.display(), "config: no config file, using defaults");
      return Ok(Self::default());
    }
    let content =
      std::fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: Self = toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))?;
    Ok(config.normalized())
  }

  pub fn save_to(&self, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
      std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
    std::fs::write(path, content).with_context(|| format!("Failed to write config {}", path.display()))
  }

  pub fn normalized(mut self) -> Self {
    self.cache_capacity = self.cache_capacity.max(1);
    self.background_cache_capacity = self.background_cache_capacity.max(1);
    self.gui.background_blur_radius = self.gui.background_blur_radius.min(constants().max_blur_radius);
    self.gui.background_scale_percent = self.gui.background_scale_percent.clamp(1, 100);
    self.gui.foreground_scale_percent = self.gui.foreground_scale_percent.clamp(1, 100);
    self.displays = self.displays.into_iter().map(|(k, v)| (k, v.normalized())).collect();
    self
  }

  /// Settings for `name`, or defaults for an unconfigured display.
  pub fn display(&self, name: &str) -> DisplayConfig {
    self.displays.get(name).cloned().unwrap_or_default()
  }
}

// --- Store ---

/// The engine's view of the configuration store.
pub trait ConfigSource: Send + Sync {
  fn load(&self) -> Result<ViewerConfig>;
  fn store_embed_metadata(&self, display: &str, metadata: &EmbedMetadata) -> Result<()>;
}

/// TOML file on disk, re-read on every load.
pub struct FileConfigSource {
  path: PathBuf,
}

impl FileConfigSource {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl ConfigSource for FileConfigSource {
  fn load(&self) -> Result<ViewerConfig> {
    ViewerConfig::load_from(&self.path)
  }

  fn store_embed_metadata(&self, display: &str, metadata: &EmbedMetadata) -> Result<()> {
    let mut config = ViewerConfig::load_from(&self.path)?;
    config.displays.entry(display.to_string()).or_default().embed_metadata = Some(metadata.clone());
    config.save_to(&self.path)
  }
}

/// In-memory store for tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryConfigSource {
  pub config: std::sync::Mutex<ViewerConfig>,
}

#[cfg(test)]
impl MemoryConfigSource {
  pub fn new(config: ViewerConfig) -> Self {
    Self { config: std::sync::Mutex::new(config) }
  }

  pub fn update(&self, f: impl FnOnce(&mut ViewerConfig)) {
    f(&mut self.config.lock().unwrap());
  }
}

#[cfg(test)]
impl ConfigSource for MemoryConfigSource {
  fn load(&self) -> Result<ViewerConfig> {
    Ok(self.config.lock().unwrap().clone().normalized())
  }

  fn store_embed_metadata(&self, display: &str, metadata: &EmbedMetadata) -> Result<()> {
    self.update(|c| c.displays.entry(display.to_string()).or_default().embed_metadata = Some(metadata.clone()));
    Ok(())
  }
}
