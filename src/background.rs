use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgba, RgbaImage};
use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Inputs that determine a background artifact besides the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackgroundParams {
  pub viewport: (u32, u32),
  pub blur_radius: u32,
  pub scale_percent: u32,
}

/// Cover-fit `source` into `viewport`, center-crop, then blur.
///
/// With `scale_percent < 100` the crop is shrunk before blurring and scaled
/// back up afterwards. Returns `None` for a zero-area viewport or source.
pub fn compose(source: &DynamicImage, viewport: (u32, u32), blur_radius: u32, scale_percent: u32) -> Option<RgbaImage> {
  let (vw, vh) = viewport;
  let (sw, sh) = (source.width(), source.height());
  if vw == 0 || vh == 0 || sw == 0 || sh == 0 {
    return None;
  }

  let scale = f64::max(vw as f64 / sw as f64, vh as f64 / sh as f64);
  let rw = ((sw as f64 * scale).round() as u32).max(vw);
  let rh = ((sh as f64 * scale).round() as u32).max(vh);
  let resized = source.resize_exact(rw, rh, FilterType::Triangle);
  let cropped = resized.crop_imm((rw - vw) / 2, (rh - vh) / 2, vw, vh).to_rgba8();

  let blur_radius = blur_radius.min(vw.max(vh));
  if blur_radius == 0 {
    return Some(cropped);
  }

  let percent = scale_percent.clamp(1, 100);
  if percent == 100 {
    return Some(box_blur(&cropped, blur_radius));
  }
  let dw = (vw * percent / 100).max(1);
  let dh = (vh * percent / 100).max(1);
  let small = imageops::resize(&cropped, dw, dh, FilterType::Nearest);
  let blurred = box_blur(&small, (blur_radius * percent / 100).max(1));
  Some(imageops::resize(&blurred, vw, vh, FilterType::Triangle))
}

/// Separable box blur with clamped edges. The radius is capped at the longer side.
pub fn box_blur(image: &RgbaImage, radius: u32) -> RgbaImage {
  let radius = radius.min(image.width().max(image.height()));
  if radius == 0 {
    return image.clone();
  }
  let horizontal = blur_pass(image, radius, true);
  blur_pass(&horizontal, radius, false)
}

fn blur_pass(src: &RgbaImage, radius: u32, horizontal: bool) -> RgbaImage {
  let (w, h) = src.dimensions();
  let mut out = RgbaImage::new(w, h);
  let (lines, len) = if horizontal { (h, w) } else { (w, h) };
  let r = radius as i64;
  let window = 2 * radius + 1;

  for line in 0..lines {
    let at = |i: i64| -> Rgba<u8> {
      let i = i.clamp(0, len as i64 - 1) as u32;
      if horizontal { *src.get_pixel(i, line) } else { *src.get_pixel(line, i) }
    };
    let mut sum = [0u32; 4];
    for i in -r..=r {
      for (s, v) in sum.iter_mut().zip(at(i).0) {
        *s += v as u32;
      }
    }
    for i in 0..len {
      let value = Rgba(sum.map(|s| ((s + window / 2) / window) as u8));
      if horizontal {
        out.put_pixel(i, line, value);
      } else {
        out.put_pixel(line, i, value);
      }
      let (add, sub) = (at(i as i64 + r + 1), at(i as i64 - r));
      for ((s, a), d) in sum.iter_mut().zip(add.0).zip(sub.0) {
        *s = *s + a as u32 - d as u32;
      }
    }
  }
  out
}

// --- Cache ---

#[derive(Debug, Clone)]
struct CachedBackground {
  params: BackgroundParams,
  artifact: Arc<RgbaImage>,
}

/// Derived backgrounds keyed by source path, separate from the media cache.
pub struct BackgroundCache {
  entries: Mutex<LruCache<PathBuf, CachedBackground>>,
}

impl BackgroundCache {
  pub fn new(capacity: usize) -> Self {
    let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
    Self { entries: Mutex::new(LruCache::new(capacity)) }
  }

  fn lock(&self) -> MutexGuard<'_, LruCache<PathBuf, CachedBackground>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  pub fn contains(&self, path: &Path) -> bool {
    self.lock().contains(path)
  }

  /// Cached artifact for `path`, recomposed when `params` changed.
  pub fn get_or_compose(&self, path: &Path, source: &DynamicImage, params: BackgroundParams) -> Option<Arc<RgbaImage>> {
    if let Some(cached) = self.lock().get(path)
      && cached.params == params
    {
      return Some(cached.artifact.clone());
    }
    let artifact = Arc::new(compose(source, params.viewport, params.blur_radius, params.scale_percent)?);
    self.lock().put(path.to_path_buf(), CachedBackground { params, artifact: artifact.clone() });
    Some(artifact)
  }

  pub fn invalidate(&self, path: &Path) {
    self.lock().pop(path);
  }

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

#[cfg(test)]
mod tests {
  use super::*;

  fn gradient(w: u32, h: u32) -> DynamicImage {
    DynamicImage::ImageRgba8(RgbaImage::from_fn(w, h, |x, y| Rgba([(x * 7 % 256) as u8, (y * 5 % 256) as u8, 90, 255])))
  }

  fn params(radius: u32) -> BackgroundParams {
    BackgroundParams { viewport: (40, 30), blur_radius: radius, scale_percent: 100 }
  }

  // --- compose ---

  #[test]
  fn zero_viewport_is_noop() {
    let src = gradient(20, 10);
    assert!(compose(&src, (0, 100), 5, 100).is_none());
    assert!(compose(&src, (100, 0), 5, 100).is_none());
  }

  #[test]
  fn zero_radius_is_plain_cover_crop() {
    let src = gradient(200, 100);
    let out = compose(&src, (100, 100), 0, 100).unwrap();
    assert_eq!(out.dimensions(), (100, 100));
    let expected = src.resize_exact(200, 100, FilterType::Triangle).crop_imm(50, 0, 100, 100).to_rgba8();
    assert_eq!(out, expected);
  }

  #[test]
  fn output_always_matches_viewport() {
    let src = gradient(37, 91);
    for viewport in [(64, 36), (36, 64), (50, 50)] {
      for percent in [100, 50, 10] {
        let out = compose(&src, viewport, 4, percent).unwrap();
        assert_eq!(out.dimensions(), viewport);
      }
    }
  }

  #[test]
  fn compose_is_deterministic() {
    let src = gradient(64, 48);
    let a = compose(&src, (32, 32), 3, 50).unwrap();
    let b = compose(&src, (32, 32), 3, 50).unwrap();
    assert_eq!(a, b);
  }

  // --- blur ---

  #[test]
  fn blur_keeps_uniform_images_uniform() {
    let img = RgbaImage::from_pixel(9, 7, Rgba([120, 30, 200, 255]));
    assert_eq!(box_blur(&img, 3), img);
  }

  #[test]
  fn blur_spreads_a_single_bright_pixel() {
    let mut img = RgbaImage::from_pixel(9, 9, Rgba([0, 0, 0, 255]));
    img.put_pixel(4, 4, Rgba([255, 255, 255, 255]));
    let out = box_blur(&img, 1);
    assert!(out.get_pixel(4, 4)[0] < 255);
    assert!(out.get_pixel(3, 3)[0] > 0);
    assert_eq!(out.get_pixel(0, 0)[0], 0);
  }

  #[test]
  fn huge_radius_is_capped() {
    let img = RgbaImage::from_pixel(6, 4, Rgba([255, 255, 255, 255]));
    assert_eq!(box_blur(&img, u32::MAX), img);
    for percent in [100, 50] {
      assert_eq!(compose(&gradient(20, 10), (8, 6), u32::MAX, percent).unwrap().dimensions(), (8, 6));
    }
  }

  // --- cache ---

  #[test]
  fn cache_reuses_and_recomposes_on_param_change() {
    let cache = BackgroundCache::new(2);
    let src = gradient(80, 60);
    let path = Path::new("/media/a.png");
    let first = cache.get_or_compose(path, &src, params(2)).unwrap();
    let again = cache.get_or_compose(path, &src, params(2)).unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    let changed = cache.get_or_compose(path, &src, params(5)).unwrap();
    assert!(!Arc::ptr_eq(&first, &changed));
    assert_eq!(cache.len(), 1);
  }

  #[test]
  fn cache_evicts_and_retains() {
    let cache = BackgroundCache::new(2);
    let src = gradient(10, 10);
    for name in ["/a", "/b", "/c"] {
      cache.get_or_compose(Path::new(name), &src, params(1));
    }
    assert_eq!(cache.len(), 2);
    assert!(!cache.contains(Path::new("/a")));

    let keep: HashSet<PathBuf> = [PathBuf::from("/c")].into_iter().collect();
    cache.retain_only(&keep);
    assert!(cache.contains(Path::new("/c")));
    assert_eq!(cache.len(), 1);
  }
}
