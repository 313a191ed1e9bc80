//! Near-duplicate suppression over the capture output directory.
//!
//! Two interchangeable strategies behind one contract: structural pixel
//! similarity (SSIM) and feature-vector cosine distance. The corpus is
//! re-derived from the directory on every sweep; when a duplicate pair is
//! found, the later file is removed so the earliest example of a visual
//! pattern survives.

use crate::config::{DedupConfig, DedupStrategy};
use image::imageops::FilterType;
use image::DynamicImage;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("feature-extraction model not found at {0}")]
    ModelUnavailable(PathBuf),
}

/// Produces a fixed-length vector summarizing an image's visual content
pub trait FeatureExtractor: Send {
    fn embed(&self, image: &DynamicImage) -> Vec<f32>;
}

/// Model-free extractor: a downsampled, L2-normalized luma grid.
///
/// The trait seam is where a trained network plugs in; this built-in keeps
/// the embedding strategy usable without one.
pub struct LumaGridEmbedder {
    grid: u32,
}

impl LumaGridEmbedder {
    pub fn new() -> Self {
        Self { grid: 16 }
    }
}

impl Default for LumaGridEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureExtractor for LumaGridEmbedder {
    fn embed(&self, image: &DynamicImage) -> Vec<f32> {
        let resized = image.resize_exact(self.grid, self.grid, FilterType::Triangle);
        let gray = resized.to_luma8();

        let mut vector: Vec<f32> = gray.pixels().map(|p| p.0[0] as f32 / 255.0).collect();
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

/// Cosine distance in `[0, 2]`: 0 for identical directions
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

// SSIM stabilization constants for 8-bit dynamic range
const SSIM_C1: f64 = 6.5025; // (0.01 * 255)^2
const SSIM_C2: f64 = 58.5225; // (0.03 * 255)^2
const SSIM_WINDOW: u32 = 8;

/// Mean windowed structural similarity between two images, in `[-1, 1]`.
/// The candidate is resized to the reference's dimensions first.
pub fn ssim(candidate: &DynamicImage, reference: &DynamicImage) -> f64 {
    let resized = candidate.resize_exact(reference.width(), reference.height(), FilterType::Triangle);
    let a = resized.to_luma8();
    let b = reference.to_luma8();

    let (w, h) = (b.width(), b.height());
    let win_w = SSIM_WINDOW.min(w);
    let win_h = SSIM_WINDOW.min(h);
    if win_w == 0 || win_h == 0 {
        return 0.0;
    }

    let mut total = 0.0;
    let mut windows = 0u32;
    let mut y = 0;
    while y + win_h <= h {
        let mut x = 0;
        while x + win_w <= w {
            total += window_ssim(&a, &b, x, y, win_w, win_h);
            windows += 1;
            x += win_w;
        }
        y += win_h;
    }

    if windows == 0 {
        0.0
    } else {
        total / windows as f64
    }
}

fn window_ssim(
    a: &image::GrayImage,
    b: &image::GrayImage,
    x0: u32,
    y0: u32,
    w: u32,
    h: u32,
) -> f64 {
    let n = (w * h) as f64;
    let mut sum_a = 0.0;
    let mut sum_b = 0.0;
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            sum_a += a.get_pixel(x, y).0[0] as f64;
            sum_b += b.get_pixel(x, y).0[0] as f64;
        }
    }
    let mu_a = sum_a / n;
    let mu_b = sum_b / n;

    let mut var_a = 0.0;
    let mut var_b = 0.0;
    let mut cov = 0.0;
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            let da = a.get_pixel(x, y).0[0] as f64 - mu_a;
            let db = b.get_pixel(x, y).0[0] as f64 - mu_b;
            var_a += da * da;
            var_b += db * db;
            cov += da * db;
        }
    }
    var_a /= n;
    var_b /= n;
    cov /= n;

    ((2.0 * mu_a * mu_b + SSIM_C1) * (2.0 * cov + SSIM_C2))
        / ((mu_a * mu_a + mu_b * mu_b + SSIM_C1) * (var_a + var_b + SSIM_C2))
}

/// Result of one sweep over the corpus directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub removed: usize,
    pub skipped: usize,
}

/// Duplicate detector over a directory corpus, one strategy at a time
pub enum DuplicateFilter {
    Structural {
        threshold: f64,
    },
    Embedding {
        extractor: Box<dyn FeatureExtractor>,
        threshold: f32,
        cache: HashMap<PathBuf, Vec<f32>>,
    },
}

impl DuplicateFilter {
    pub fn structural(threshold: f64) -> Self {
        Self::Structural { threshold }
    }

    pub fn embedding(extractor: Box<dyn FeatureExtractor>, threshold: f32) -> Self {
        Self::Embedding {
            extractor,
            threshold,
            cache: HashMap::new(),
        }
    }

    /// Build the configured strategy. A failed embedding setup (missing
    /// model) falls back to the structural strategy rather than halting the
    /// pipeline.
    pub fn from_config(config: &DedupConfig) -> Self {
        match config.strategy {
            DedupStrategy::Structural => {
                info!(
                    "Duplicate filter: structural, threshold {}",
                    config.structural_threshold
                );
                Self::structural(config.structural_threshold)
            }
            DedupStrategy::Embedding => match Self::build_embedding(config) {
                Ok(filter) => {
                    info!(
                        "Duplicate filter: embedding, threshold {}",
                        config.embedding_threshold
                    );
                    filter
                }
                Err(e) => {
                    warn!(
                        "Embedding strategy unavailable ({}), falling back to structural",
                        e
                    );
                    Self::structural(config.structural_threshold)
                }
            },
        }
    }

    fn build_embedding(config: &DedupConfig) -> Result<Self, DedupError> {
        if let Some(path) = &config.model_path {
            // External extractors load from model_path; the built-in grid
            // embedder needs none, so a configured-but-missing model is the
            // only init failure.
            if !path.exists() {
                return Err(DedupError::ModelUnavailable(path.clone()));
            }
        }
        Ok(Self::embedding(
            Box::new(LumaGridEmbedder::new()),
            config.embedding_threshold,
        ))
    }

    pub fn strategy_name(&self) -> &'static str {
        match self {
            Self::Structural { .. } => "structural",
            Self::Embedding { .. } => "embedding",
        }
    }

    /// Whether `candidate` is redundant against the retained corpus.
    /// An unreadable candidate is an error; unreadable corpus entries are
    /// skipped with a warning, never deleted.
    ///
    /// Embedding vectors are cached per path, so corpus files must be
    /// immutable once written. Capture files satisfy this: each write gets
    /// a fresh monotonic name and is only ever removed, never rewritten.
    pub fn is_duplicate(
        &mut self,
        candidate: &Path,
        corpus: &[PathBuf],
    ) -> Result<bool, DedupError> {
        let candidate_image = image::open(candidate)?;

        match self {
            Self::Structural { threshold } => {
                for retained in corpus {
                    let reference = match image::open(retained) {
                        Ok(img) => img,
                        Err(e) => {
                            warn!("Unreadable corpus image {:?}: {}, skipping", retained, e);
                            continue;
                        }
                    };
                    let score = ssim(&candidate_image, &reference);
                    trace!(
                        "SSIM {:?} vs {:?}: {:.4}",
                        candidate,
                        retained,
                        score
                    );
                    if score > *threshold {
                        debug!(
                            "Duplicate: {:?} matches {:?} (SSIM {:.4})",
                            candidate, retained, score
                        );
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Embedding {
                extractor,
                threshold,
                cache,
            } => {
                let vector = extractor.embed(&candidate_image);
                for retained in corpus {
                    if !cache.contains_key(retained) {
                        match image::open(retained) {
                            Ok(img) => {
                                cache.insert(retained.clone(), extractor.embed(&img));
                            }
                            Err(e) => {
                                warn!("Unreadable corpus image {:?}: {}, skipping", retained, e);
                                continue;
                            }
                        }
                    }
                    let Some(other) = cache.get(retained) else {
                        continue;
                    };
                    let distance = cosine_distance(&vector, other);
                    if distance < *threshold {
                        debug!(
                            "Duplicate: {:?} matches {:?} (cosine distance {:.4})",
                            candidate, retained, distance
                        );
                        return Ok(true);
                    }
                }
                // Cache the candidate; it is about to join the corpus
                cache.insert(candidate.to_path_buf(), vector);
                Ok(false)
            }
        }
    }

    fn forget(&mut self, path: &Path) {
        if let Self::Embedding { cache, .. } = self {
            cache.remove(path);
        }
    }

    /// One full pass over the directory: scan in capture order, compare
    /// each file against everything retained before it, and remove the
    /// later file of each duplicate pair (first-seen-wins).
    pub fn sweep(&mut self, dir: &Path) -> SweepStats {
        self.sweep_until(dir, None)
    }

    /// Like [`sweep`](Self::sweep), stopping between files once `shutdown`
    /// flips so cancellation never interrupts a comparison mid-unit.
    pub fn sweep_until(
        &mut self,
        dir: &Path,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> SweepStats {
        let mut stats = SweepStats::default();

        let mut files = match list_images(dir) {
            Ok(files) => files,
            Err(e) => {
                warn!("Cannot scan {:?}: {}", dir, e);
                return stats;
            }
        };
        // Capture filenames embed a zero-padded timestamp, so lexicographic
        // order is capture order
        files.sort();

        let mut seen_hashes: HashMap<String, PathBuf> = HashMap::new();
        let mut retained: Vec<PathBuf> = Vec::new();

        for file in files {
            if let Some(rx) = shutdown {
                if *rx.borrow() {
                    debug!("Sweep cancelled after {} files", stats.scanned);
                    break;
                }
            }
            stats.scanned += 1;

            // Exact pre-pass: byte-identical files need no metric
            let hash = match file_sha256(&file) {
                Ok(hash) => hash,
                Err(e) => {
                    warn!("Unreadable file {:?}: {}, skipping", file, e);
                    stats.skipped += 1;
                    continue;
                }
            };
            if let Some(original) = seen_hashes.get(&hash) {
                debug!("Exact duplicate: {:?} matches {:?}", file, original);
                self.remove_duplicate(&file, &mut stats);
                continue;
            }

            match self.is_duplicate(&file, &retained) {
                Ok(true) => {
                    self.remove_duplicate(&file, &mut stats);
                }
                Ok(false) => {
                    seen_hashes.insert(hash, file.clone());
                    retained.push(file);
                }
                Err(e) => {
                    warn!("Unreadable candidate {:?}: {}, skipping", file, e);
                    stats.skipped += 1;
                }
            }
        }

        stats
    }

    fn remove_duplicate(&mut self, file: &Path, stats: &mut SweepStats) {
        match std::fs::remove_file(file) {
            Ok(()) => {
                self.forget(file);
                stats.removed += 1;
            }
            Err(e) => {
                warn!("Failed to remove duplicate {:?}: {}", file, e);
                stats.skipped += 1;
            }
        }
    }
}

/// Image files in a directory, by extension
pub fn list_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
            .unwrap_or(false);
        if is_image {
            files.push(path);
        }
    }
    Ok(files)
}

fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Recurring dedup sweep, independent of the capture tick rate
pub async fn run_sweeper(
    mut filter: DuplicateFilter,
    dir: PathBuf,
    interval: Duration,
    active: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        "Dedup sweeper running ({} strategy, {}s interval)",
        filter.strategy_name(),
        interval.as_secs()
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !active.load(std::sync::atomic::Ordering::Relaxed) {
                    continue;
                }
                let sweep_dir = dir.clone();
                let cancel = shutdown.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let stats = filter.sweep_until(&sweep_dir, Some(&cancel));
                    (filter, stats)
                })
                .await;
                match result {
                    Ok((returned, stats)) => {
                        filter = returned;
                        if stats.removed > 0 {
                            info!(
                                "Dedup sweep: {} scanned, {} removed",
                                stats.scanned, stats.removed
                            );
                        } else {
                            trace!("Dedup sweep: {} scanned, none removed", stats.scanned);
                        }
                    }
                    Err(e) => {
                        error!("Dedup sweep task failed: {}", e);
                        break;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Dedup sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([value, value, value])))
    }

    fn gradient(width: u32, height: u32) -> DynamicImage {
        let mut img = RgbImage::new(width, height);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let v = ((x * 7 + y * 13) % 256) as u8;
            *pixel = Rgb([v, v.wrapping_mul(3), v.wrapping_add(40)]);
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_ssim_identical_images() {
        let img = gradient(64, 64);
        let score = ssim(&img, &img.clone());
        assert!(score > 0.99, "score was {}", score);
    }

    #[test]
    fn test_ssim_contrasting_solid_colors() {
        let black = solid(64, 64, 0);
        let white = solid(64, 64, 255);
        let score = ssim(&black, &white);
        assert!(score < 0.97, "score was {}", score);
    }

    #[test]
    fn test_ssim_resizes_candidate() {
        let small = gradient(32, 32);
        let large = gradient(64, 64);
        // Must not panic on mismatched dimensions
        let score = ssim(&small, &large);
        assert!((-1.0..=1.0).contains(&score));
    }

    #[test]
    fn test_cosine_distance_self_is_zero() {
        let v = vec![0.5, 0.25, 0.75, 0.1];
        assert!(cosine_distance(&v, &v).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_unrelated_vectors() {
        let a = vec![1.0, 0.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0, 0.0];
        assert!(cosine_distance(&a, &b) > 0.03);
    }

    #[test]
    fn test_embedder_vector_is_normalized() {
        let embedder = LumaGridEmbedder::new();
        let vector = embedder.embed(&gradient(100, 60));
        assert_eq!(vector.len(), 16 * 16);
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_structural_flags_identical_copy() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("capture_0000000000000001_seat1.png");
        let copy = dir.path().join("capture_0000000000000002_seat1.png");
        gradient(50, 50).save(&first).unwrap();
        gradient(50, 50).save(&copy).unwrap();

        let mut filter = DuplicateFilter::structural(0.97);
        assert!(filter.is_duplicate(&copy, &[first]).unwrap());
    }

    #[test]
    fn test_structural_passes_unrelated_images() {
        let dir = tempfile::tempdir().unwrap();
        let black = dir.path().join("capture_0000000000000001_seat1.png");
        let white = dir.path().join("capture_0000000000000002_seat1.png");
        solid(50, 50, 0).save(&black).unwrap();
        solid(50, 50, 255).save(&white).unwrap();

        let mut filter = DuplicateFilter::structural(0.97);
        assert!(!filter.is_duplicate(&white, &[black]).unwrap());
    }

    #[test]
    fn test_sweep_first_seen_wins() {
        // Two captures of a static surface: the later file goes
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("capture_0000000000000001_seat1.png");
        let second = dir.path().join("capture_0000000000000002_seat1.png");
        gradient(50, 50).save(&first).unwrap();
        gradient(50, 50).save(&second).unwrap();

        let mut filter = DuplicateFilter::structural(0.97);
        let stats = filter.sweep(dir.path());

        assert_eq!(stats.scanned, 2);
        assert_eq!(stats.removed, 1);
        assert!(first.exists());
        assert!(!second.exists());
    }

    #[test]
    fn test_sweep_keeps_distinct_images() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("capture_0000000000000001_seat1.png");
        let b = dir.path().join("capture_0000000000000002_seat1.png");
        solid(50, 50, 0).save(&a).unwrap();
        solid(50, 50, 255).save(&b).unwrap();

        let mut filter = DuplicateFilter::structural(0.97);
        let stats = filter.sweep(dir.path());

        assert_eq!(stats.removed, 0);
        assert!(a.exists() && b.exists());
    }

    #[test]
    fn test_sweep_skips_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("capture_0000000000000001_seat1.png");
        let corrupt = dir.path().join("capture_0000000000000002_seat1.png");
        gradient(50, 50).save(&good).unwrap();
        std::fs::write(&corrupt, b"not an image").unwrap();

        let mut filter = DuplicateFilter::structural(0.97);
        let stats = filter.sweep(dir.path());

        assert_eq!(stats.skipped, 1);
        // Corrupt files are never deleted
        assert!(corrupt.exists());
        assert!(good.exists());
    }

    #[test]
    fn test_embedding_sweep_removes_identical_copy() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("capture_0000000000000001_seat1.png");
        let second = dir.path().join("capture_0000000000000002_seat1.png");
        gradient(50, 50).save(&first).unwrap();
        gradient(50, 50).save(&second).unwrap();

        let mut filter =
            DuplicateFilter::embedding(Box::new(LumaGridEmbedder::new()), 0.03);
        let stats = filter.sweep(dir.path());

        assert_eq!(stats.removed, 1);
        assert!(first.exists());
        assert!(!second.exists());
    }

    #[test]
    fn test_from_config_falls_back_without_model() {
        let config = DedupConfig {
            strategy: DedupStrategy::Embedding,
            model_path: Some(PathBuf::from("/nonexistent/model.bin")),
            ..DedupConfig::default()
        };
        let filter = DuplicateFilter::from_config(&config);
        assert_eq!(filter.strategy_name(), "structural");
    }

    #[test]
    fn test_from_config_embedding_without_model_path() {
        let config = DedupConfig {
            strategy: DedupStrategy::Embedding,
            ..DedupConfig::default()
        };
        let filter = DuplicateFilter::from_config(&config);
        assert_eq!(filter.strategy_name(), "embedding");
    }
}
