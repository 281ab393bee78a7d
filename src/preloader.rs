use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::background::{BackgroundCache, BackgroundParams};
use crate::media_cache::MediaCache;

/// The `count` items after `index`, wrapping at the end, without duplicates.
/// `None` means the cursor sits before the first item.
pub fn look_ahead(sequence: &[PathBuf], index: Option<usize>, count: usize) -> Vec<PathBuf> {
  if sequence.is_empty() || count == 0 {
    return Vec::new();
  }
  let start = index.map_or(0, |i| i + 1);
  let mut seen = HashSet::new();
  (0..count.min(sequence.len()))
    .map(|k| &sequence[(start + k) % sequence.len()])
    .filter(|p| seen.insert(*p))
    .cloned()
    .collect()
}

#[derive(Debug, Clone)]
pub struct PreloadRequest {
  pub generation: u64,
  pub ticket: u64,
  pub window: Vec<PathBuf>,
  pub params: BackgroundParams,
}

/// Fills both caches with the look-ahead window off the display path.
///
/// Every reload bumps the generation and every request takes a new ticket.
/// A run that is no longer the latest stops early and leaves the caches alone.
#[derive(Clone)]
pub struct Preloader {
  media: Arc<MediaCache>,
  backgrounds: Arc<BackgroundCache>,
  generation: Arc<AtomicU64>,
  latest: Arc<AtomicU64>,
}

impl Preloader {
  pub fn new(media: Arc<MediaCache>, backgrounds: Arc<BackgroundCache>) -> Self {
    Self { media, backgrounds, generation: Arc::new(AtomicU64::new(0)), latest: Arc::new(AtomicU64::new(0)) }
  }

  pub fn generation(&self) -> u64 {
    self.generation.load(Ordering::SeqCst)
  }

  /// Discard in-flight work; returns the new generation.
  pub fn invalidate(&self) -> u64 {
    self.generation.fetch_add(1, Ordering::SeqCst) + 1
  }

  pub fn request(&self, window: Vec<PathBuf>, params: BackgroundParams) -> PreloadRequest {
    let ticket = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
    PreloadRequest { generation: self.generation(), ticket, window, params }
  }

  fn is_current(&self, request: &PreloadRequest) -> bool {
    request.generation == self.generation() && request.ticket == self.latest.load(Ordering::SeqCst)
  }

  /// Run [`Preloader::populate`] on the blocking pool.
  pub fn schedule(&self, request: PreloadRequest) -> JoinHandle<usize> {
    let this = self.clone();
    tokio::task::spawn_blocking(move || this.populate(&request))
  }

  /// Decode and compose every window entry, then evict everything else.
  /// Returns how many entries are ready.
  pub fn populate(&self, request: &PreloadRequest) -> usize {
    let mut ready = 0;
    for path in &request.window {
      if !self.is_current(request) {
        debug!(generation = request.generation, ticket = request.ticket, "preload: stale run discarded");
        return ready;
      }
      let entry = match self.media.get(path) {
        Ok(entry) => entry,
        Err(e) => {
          debug!(path = %path.display(), err = %e, "preload: skipped");
          continue;
        }
      };
      if self.backgrounds.get_or_compose(path, &entry.first_frame, request.params).is_some() {
        ready += 1;
      }
    }
    if self.is_current(request) {
      let keep: HashSet<PathBuf> = request.window.iter().cloned().collect();
      self.media.retain_only(&keep);
      self.backgrounds.retain_only(&keep);
    }
    ready
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{Rgba, RgbaImage};
  use std::path::Path;

  fn paths(names: &[&str]) -> Vec<PathBuf> {
    names.iter().map(PathBuf::from).collect()
  }

  fn write_images(dir: &Path, count: usize) -> Vec<PathBuf> {
    (0..count)
      .map(|i| {
        let path = dir.join(format!("img{i}.png"));
        RgbaImage::from_pixel(6, 4, Rgba([i as u8, 0, 0, 255])).save(&path).unwrap();
        path
      })
      .collect()
  }

  fn preloader(capacity: usize) -> Preloader {
    Preloader::new(Arc::new(MediaCache::new(capacity)), Arc::new(BackgroundCache::new(capacity)))
  }

  fn params() -> BackgroundParams {
    BackgroundParams { viewport: (8, 8), blur_radius: 1, scale_percent: 100 }
  }

  // --- window ---

  #[test]
  fn window_follows_cursor_and_wraps() {
    let seq = paths(&["a", "b", "c", "d"]);
    assert_eq!(look_ahead(&seq, Some(0), 2), paths(&["b", "c"]));
    assert_eq!(look_ahead(&seq, Some(3), 2), paths(&["a", "b"]));
    assert_eq!(look_ahead(&seq, None, 1), paths(&["a"]));
  }

  #[test]
  fn window_never_repeats() {
    let seq = paths(&["a", "b"]);
    assert_eq!(look_ahead(&seq, Some(0), 5), paths(&["b", "a"]));
    assert!(look_ahead(&[], Some(0), 3).is_empty());
    assert!(look_ahead(&seq, Some(0), 0).is_empty());
  }

  // --- population ---

  #[test]
  fn caches_hold_exactly_the_window() {
    let dir = tempfile::tempdir().unwrap();
    let seq = write_images(dir.path(), 6);
    let pre = preloader(15);
    pre.media.get(&seq[0]).unwrap();

    let request = pre.request(look_ahead(&seq, Some(0), 5), params());
    assert_eq!(pre.populate(&request), 5);

    for path in &seq[1..] {
      assert!(pre.backgrounds.contains(path));
      assert!(pre.media.contains(path));
    }
    assert!(!pre.backgrounds.contains(&seq[0]));
    assert!(!pre.media.contains(&seq[0]));
    assert_eq!(pre.backgrounds.len(), 5);
  }

  #[test]
  fn failures_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let mut seq = write_images(dir.path(), 2);
    seq.insert(1, dir.path().join("gone.png"));
    let pre = preloader(5);
    let request = pre.request(seq.clone(), params());
    assert_eq!(pre.populate(&request), 2);
    assert!(!pre.media.contains(&seq[1]));
  }

  #[test]
  fn stale_generation_leaves_caches_alone() {
    let dir = tempfile::tempdir().unwrap();
    let seq = write_images(dir.path(), 3);
    let pre = preloader(5);
    pre.media.get(&seq[0]).unwrap();

    let request = pre.request(seq[1..].to_vec(), params());
    pre.invalidate();
    assert_eq!(pre.populate(&request), 0);
    assert!(pre.media.contains(&seq[0]));
    assert!(pre.backgrounds.is_empty());
  }

  #[test]
  fn superseded_request_does_not_evict_newer_window() {
    let dir = tempfile::tempdir().unwrap();
    let seq = write_images(dir.path(), 4);
    let pre = preloader(5);
    let older = pre.request(seq[..2].to_vec(), params());
    let newer = pre.request(seq[2..].to_vec(), params());

    assert_eq!(pre.populate(&newer), 2);
    assert_eq!(pre.populate(&older), 0);
    assert!(pre.media.contains(&seq[2]));
    assert!(pre.media.contains(&seq[3]));
    assert!(!pre.media.contains(&seq[0]));
    assert_eq!(pre.backgrounds.len(), 2);
  }

  #[tokio::test]
  async fn scheduled_run_completes_off_thread() {
    let dir = tempfile::tempdir().unwrap();
    let seq = write_images(dir.path(), 3);
    let pre = preloader(5);
    let ready = pre.schedule(pre.request(look_ahead(&seq, Some(0), 2), params())).await.unwrap();
    assert_eq!(ready, 2);
  }
}
