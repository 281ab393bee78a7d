//! Decoded foreground media, bounded by entry count with LRU eviction.
//!
//! Decoding happens outside the lock so readers are never blocked behind a
//! slow file. Two racing decodes of the same path both succeed and the later
//! insert wins.

use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, Frame};
use lru::LruCache;
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
  Static,
  Animated,
}

/// A decoded media file.
///
/// For animations only the first frame is decoded up front; the remaining
/// frames are decoded on demand by [`MediaEntry::frames`].
#[derive(Debug, Clone)]
pub struct MediaEntry {
  pub path: PathBuf,
  pub kind: MediaKind,
  pub first_frame: Arc<DynamicImage>,
}

impl MediaEntry {
  pub fn dimensions(&self) -> (u32, u32) {
    (self.first_frame.width(), self.first_frame.height())
  }

  /// All frames of an animated entry. Static entries yield their single image.
  pub fn frames(&self) -> Result<Vec<Frame>, MediaError> {
    match self.kind {
      MediaKind::Static => Ok(vec![Frame::new(self.first_frame.to_rgba8())]),
      MediaKind::Animated => {
        let decoder = open_gif(&self.path)?;
        decoder.into_frames().collect_frames().map_err(|e| MediaError::decode(&self.path, e))
      }
    }
  }
}

fn open_gif(path: &Path) -> Result<GifDecoder<BufReader<File>>, MediaError> {
  let file = File::open(path).map_err(|e| match e.kind() {
    std::io::ErrorKind::NotFound => MediaError::MissingFile(path.to_path_buf()),
    _ => MediaError::decode(path, e),
  })?;
  GifDecoder::new(BufReader::new(file)).map_err(|e| MediaError::decode(path, e))
}

fn is_gif(path: &Path) -> bool {
  path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case("gif"))
}

/// Decode `path`, extracting the first frame eagerly for animations.
pub fn decode(path: &Path) -> Result<MediaEntry, MediaError> {
  if !path.is_file() {
    return Err(MediaError::MissingFile(path.to_path_buf()));
  }
  if is_gif(path) {
    let mut frames = open_gif(path)?.into_frames();
    let first = match frames.next() {
      Some(Ok(frame)) => frame,
      Some(Err(e)) => return Err(MediaError::decode(path, e)),
      None => return Err(MediaError::decode(path, "animation has no frames")),
    };
    let kind = if frames.next().is_some() { MediaKind::Animated } else { MediaKind::Static };
    return Ok(MediaEntry {
      path: path.to_path_buf(),
      kind,
      first_frame: Arc::new(DynamicImage::ImageRgba8(first.into_buffer())),
    });
  }
  let image = image::open(path).map_err(|e| MediaError::decode(path, e))?;
  Ok(MediaEntry { path: path.to_path_buf(), kind: MediaKind::Static, first_frame: Arc::new(image) })
}

pub struct MediaCache {
  entries: Mutex<LruCache<PathBuf, Arc<MediaEntry>>>,
}

impl MediaCache {
  /// A capacity of zero is treated as one.
  pub fn new(capacity: usize) -> Self {
    let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
    Self { entries: Mutex::new(LruCache::new(capacity)) }
  }

  fn lock(&self) -> MutexGuard<'_, LruCache<PathBuf, Arc<MediaEntry>>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn capacity(&self) -> usize {
    self.lock().cap().get()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  /// Checks membership without touching LRU order.
  pub fn contains(&self, path: &Path) -> bool {
    self.lock().contains(path)
  }

  /// Cached entry for `path`, decoding and inserting it on a miss.
  /// A file deleted since it was cached is dropped and reported missing.
  pub fn get(&self, path: &Path) -> Result<Arc<MediaEntry>, MediaError> {
    if !path.is_file() {
      self.invalidate(path);
      return Err(MediaError::MissingFile(path.to_path_buf()));
    }
    if let Some(entry) = self.lock().get(path) {
      return Ok(entry.clone());
    }
    let entry = Arc::new(decode(path)?);
    if let Some((evicted, _)) = self.lock().push(path.to_path_buf(), entry.clone())
      && evicted != path
    {
      debug!(path = %evicted.display(), "media: evicted");
    }
    Ok(entry)
  }

  pub fn invalidate(&self, path: &Path) {
    self.lock().pop(path);
  }

  /// Drop every entry whose path is not in `keep`.
  pub fn retain_only(&self, keep: &HashSet<PathBuf>) {
    let mut entries = self.lock();
    let stale: Vec<PathBuf> = entries.iter().map(|(k, _)| k).filter(|k| !keep.contains(*k)).cloned().collect();
    for path in stale {
      entries.pop(&path);
    }
  }

  pub fn clear(&self) {
    self.lock().clear();
  }
}
