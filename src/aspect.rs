use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use crate::constants::constants;

const LANDSCAPE_RATIO: f64 = 16.0 / 9.0;
const PORTRAIT_RATIO: f64 = 9.0 / 16.0;

/// Aspect bucket of a media file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AspectLabel {
  Square,
  Landscape,
  Portrait,
  Unknown,
}

impl AspectLabel {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Square => "square",
      Self::Landscape => "landscape",
      Self::Portrait => "portrait",
      Self::Unknown => "unknown",
    }
  }
}

/// Nearest canonical ratio by absolute difference. Zero sides are `Unknown`.
pub fn classify_dimensions(width: u32, height: u32) -> AspectLabel {
  if width == 0 || height == 0 {
    return AspectLabel::Unknown;
  }
  let ratio = width as f64 / height as f64;
  [(AspectLabel::Square, 1.0), (AspectLabel::Landscape, LANDSCAPE_RATIO), (AspectLabel::Portrait, PORTRAIT_RATIO)]
    .into_iter()
    .min_by(|(_, a), (_, b)| (ratio - a).abs().total_cmp(&(ratio - b).abs()))
    .map(|(label, _)| label)
    .unwrap_or(AspectLabel::Unknown)
}

/// Per-display aspect preference. Unknown config values collapse to `Any`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AspectPreference {
  #[default]
  Any,
  Square,
  Landscape,
  Portrait,
}

impl AspectPreference {
  pub fn from_config(s: &str) -> Self {
    match s.trim().to_ascii_lowercase().as_str() {
      "any" | "" => Self::Any,
      "square" => Self::Square,
      "landscape" => Self::Landscape,
      "portrait" => Self::Portrait,
      other => {
        warn!(value = %other, "aspect: unknown aspect_filter, using any");
        Self::Any
      }
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Any => "any",
      Self::Square => "square",
      Self::Landscape => "landscape",
      Self::Portrait => "portrait",
    }
  }

  pub fn accepts(self, label: AspectLabel) -> bool {
    match self {
      Self::Any => true,
      Self::Square => label == AspectLabel::Square,
      Self::Landscape => label == AspectLabel::Landscape,
      Self::Portrait => label == AspectLabel::Portrait,
    }
  }
}

impl Serialize for AspectPreference {
  fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for AspectPreference {
  fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
    String::deserialize(d).map(|s| Self::from_config(&s))
  }
}

// --- Probing ---

/// Reads pixel dimensions of a media file. `None` when unreadable.
pub trait DimensionProbe: Send + Sync {
  fn dimensions(&self, path: &Path) -> Option<(u32, u32)>;
}

/// Decodes image headers with `image` and asks `ffprobe` about videos.
pub struct MediaProbe;

impl MediaProbe {
  fn probe_video(path: &Path) -> Option<(u32, u32)> {
    let output = Command::new(&constants().ffprobe_binary)
      .args(["-v", "error", "-select_streams", "v:0", "-show_entries", "stream=width,height", "-of", "csv=s=x:p=0"])
      .arg(path)
      .stdin(Stdio::null())
      .stderr(Stdio::null())
      .output();
    let output = match output {
      Ok(o) if o.status.success() => o,
      Ok(o) => {
        debug!(path = %path.display(), code = ?o.status.code(), "aspect: ffprobe exited non-zero");
        return None;
      }
      Err(e) => {
        warn!(path = %path.display(), err = %e, "aspect: failed to run ffprobe");
        return None;
      }
    };
    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
  }
}

/// Parse ffprobe's `WIDTHxHEIGHT` line.
fn parse_probe_output(stdout: &str) -> Option<(u32, u32)> {
  let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
  let (w, h) = line.split_once('x')?;
  Some((w.trim().parse().ok()?, h.trim().trim_end_matches(',').parse().ok()?))
}

impl DimensionProbe for MediaProbe {
  fn dimensions(&self, path: &Path) -> Option<(u32, u32)> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let c = constants();
    if c.is_video_extension(&ext) {
      return Self::probe_video(path);
    }
    if c.is_image_extension(&ext) || matches!(ext.as_str(), "bmp" | "webp") {
      return match image::image_dimensions(path) {
        Ok(dims) => Some(dims),
        Err(e) => {
          debug!(path = %path.display(), err = %e, "aspect: unreadable image");
          None
        }
      };
    }
    None
  }
}

// --- Filter ---

/// Memoized classifier shared by all displays of a process.
pub struct AspectFilter {
  probe: Box<dyn DimensionProbe>,
  cache: Mutex<HashMap<PathBuf, AspectLabel>>,
}

impl Default for AspectFilter {
  fn default() -> Self {
    Self::new(Box::new(MediaProbe))
  }
}

impl AspectFilter {
  pub fn new(probe: Box<dyn DimensionProbe>) -> Self {
    Self { probe, cache: Mutex::new(HashMap::new()) }
  }

  /// Classify `path`, probing at most once per path.
  pub fn classify(&self, path: &Path) -> AspectLabel {
    if let Some(label) = self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(path) {
      return *label;
    }
    let label = self.probe.dimensions(path).map_or(AspectLabel::Unknown, |(w, h)| classify_dimensions(w, h));
    self.cache.lock().unwrap_or_else(PoisonError::into_inner).insert(path.to_path_buf(), label);
    label
  }

  /// Keep the paths accepted by `preference`, preserving order.
  pub fn retain(&self, paths: Vec<PathBuf>, preference: AspectPreference) -> Vec<PathBuf> {
    if preference == AspectPreference::Any {
      return paths;
    }
    paths.into_iter().filter(|p| preference.accepts(self.classify(p))).collect()
  }

  pub fn clear(&self) {
    self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
  }
}
