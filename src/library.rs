use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::constants::constants;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaClass {
  Image,
  Video,
}

impl MediaClass {
  fn accepts(self, path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
      return false;
    };
    match self {
      Self::Image => constants().is_image_extension(ext),
      Self::Video => constants().is_video_extension(ext),
    }
  }
}

/// Folders whose name starts with `_` are hidden from every listing.
pub fn is_ignored_folder(name: &str) -> bool {
  name.starts_with('_')
}

/// Category folders under the media root.
#[derive(Debug, Clone)]
pub struct MediaLibrary {
  root: PathBuf,
}

impl MediaLibrary {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn category_dir(&self, category: &str) -> Option<PathBuf> {
    let category = category.trim().trim_matches('/');
    if category.is_empty() {
      return Some(self.root.clone());
    }
    if category.split('/').any(|part| is_ignored_folder(part) || part == "..") {
      return None;
    }
    Some(self.root.join(category))
  }

  /// Sorted files of `class` directly inside `category`.
  pub fn gather(&self, category: &str, class: MediaClass) -> Vec<PathBuf> {
    let Some(dir) = self.category_dir(category) else {
      debug!(category = %category, "library: ignored category");
      return Vec::new();
    };
    let entries = match std::fs::read_dir(&dir) {
      Ok(entries) => entries,
      Err(e) => {
        warn!(dir = %dir.display(), err = %e, "library: cannot read category");
        return Vec::new();
      }
    };
    let mut files: Vec<PathBuf> =
      entries.flatten().map(|e| e.path()).filter(|p| p.is_file() && class.accepts(p)).collect();
    files.sort();
    files
  }

  pub fn gather_images(&self, category: &str) -> Vec<PathBuf> {
    self.gather(category, MediaClass::Image)
  }

  pub fn gather_videos(&self, category: &str) -> Vec<PathBuf> {
    self.gather(category, MediaClass::Video)
  }

  /// Images of several categories, concatenated in the given order.
  pub fn gather_mixed(&self, categories: &[String]) -> Vec<PathBuf> {
    categories.iter().flat_map(|c| self.gather_images(c)).collect()
  }

  /// `root/category/name` when it exists.
  pub fn specific(&self, category: &str, name: &str) -> Option<PathBuf> {
    let name = name.trim();
    if name.is_empty() || name.contains("..") {
      return None;
    }
    let path = self.category_dir(category)?.join(name);
    if path.is_file() {
      Some(path)
    } else {
      warn!(path = %path.display(), "library: specific image not found");
      None
    }
  }

  /// Visible category folder names, sorted.
  pub fn subfolders(&self) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(&self.root) else {
      return Vec::new();
    };
    let mut names: Vec<String> = entries
      .flatten()
      .filter(|e| e.path().is_dir())
      .filter_map(|e| e.file_name().into_string().ok())
      .filter(|name| !is_ignored_folder(name))
      .collect();
    names.sort();
    names
  }

  /// Number of images and videos inside `category`.
  pub fn count_media(&self, category: &str) -> usize {
    self.gather_images(category).len() + self.gather_videos(category).len()
  }
}
