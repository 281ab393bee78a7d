//! Tuneables loaded from `constants.ron` at compile time.
//!
//! The RON file is embedded via `include_str!` and parsed once on first
//! access via `LazyLock`.

use serde::Deserialize;
use std::sync::LazyLock;
use std::time::Duration;

/// All tuneable engine constants.
#[derive(Debug, Deserialize)]
pub struct Constants {
  pub app_name: String,

  // Spotify
  pub spotify_token_url: String,
  pub spotify_player_url: String,
  pub spotify_tick_secs: u64,
  pub spotify_poll_secs: u64,
  pub spotify_progress_interval_ms: u64,
  pub spotify_token_skew_secs: i64,

  // HTTP
  pub http_timeout_secs: u64,
  pub album_art_timeout_secs: u64,

  // Embeds
  pub oembed_endpoint: String,
  pub oembed_ttl_secs: u64,
  pub youtube_embed_base: String,
  pub youtube_live_embed_base: String,

  // External tools
  pub mpv_binary: String,
  pub ffprobe_binary: String,
  pub ytdlp_binary: String,

  // Video sessions
  pub video_stop_grace_ms: u64,
  pub video_failure_backoff_ms: u64,

  // Caches
  pub default_cache_capacity: usize,
  pub default_background_cache_capacity: usize,
  pub default_preload_count: usize,

  // Backgrounds
  pub max_blur_radius: u32,

  // Media library
  pub image_extensions: Vec<String>,
  pub video_extensions: Vec<String>,
}

impl Constants {
  pub fn spotify_tick(&self) -> Duration {
    Duration::from_secs(self.spotify_tick_secs)
  }

  pub fn spotify_poll(&self) -> Duration {
    Duration::from_secs(self.spotify_poll_secs)
  }

  pub fn http_timeout(&self) -> Duration {
    Duration::from_secs(self.http_timeout_secs)
  }

  pub fn video_stop_grace(&self) -> Duration {
    Duration::from_millis(self.video_stop_grace_ms)
  }

  pub fn video_failure_backoff(&self) -> Duration {
    Duration::from_millis(self.video_failure_backoff_ms)
  }

  pub fn is_image_extension(&self, ext: &str) -> bool {
    self.image_extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
  }

  pub fn is_video_extension(&self, ext: &str) -> bool {
    self.video_extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
  }
}

static CONSTANTS: LazyLock<Constants> = LazyLock::new(|| {
  // The RON file is embedded at compile time; a malformed file fails on first access in every test run.
  ron::from_str(include_str!("../constants.ron")).expect("constants.ron must be valid RON (embedded at compile time)")
});

/// Returns a reference to the parsed constants.
pub fn constants() -> &'static Constants {
  &CONSTANTS
}
