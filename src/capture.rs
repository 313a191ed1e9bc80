//! Full-surface snapshot and per-region crop scheduling.
//!
//! Each tick takes one snapshot of the capture surface, crops it per region
//! under a consistent geometry snapshot, and writes the crops to the output
//! directory with monotonically increasing timestamped names.

use crate::regions::SharedRegionSet;
use crate::types::{Region, SurfaceBounds};
use image::RgbaImage;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

#[cfg(target_os = "macos")]
mod platform {
    use super::*;
    use core_graphics::display::{CGDisplay, CGDisplayBounds};
    use core_graphics::geometry::{CGPoint, CGRect, CGSize};
    use core_graphics::image::CGImage;
    use core_graphics::window::{kCGWindowImageBestResolution, CGWindowListCreateImage};
    use foreign_types_shared::ForeignType;

    /// Extent of the primary display
    pub fn primary_bounds() -> Option<SurfaceBounds> {
        let bounds = unsafe { CGDisplayBounds(CGDisplay::main().id) };
        Some(SurfaceBounds::new(
            bounds.size.width as u32,
            bounds.size.height as u32,
        ))
    }

    /// Capture the entire primary display
    pub fn capture_primary() -> Option<RgbaImage> {
        let bounds = unsafe { CGDisplayBounds(CGDisplay::main().id) };

        let rect = CGRect::new(
            &CGPoint::new(bounds.origin.x, bounds.origin.y),
            &CGSize::new(bounds.size.width, bounds.size.height),
        );

        let cg_image: CGImage = unsafe {
            let image_ref = CGWindowListCreateImage(
                rect,
                0, // kCGWindowListOptionAll
                0, // kCGNullWindowID
                kCGWindowImageBestResolution,
            );
            if image_ref.is_null() {
                return None;
            }
            CGImage::from_ptr(image_ref)
        };

        convert_cgimage_to_rgba(&cg_image)
    }

    fn convert_cgimage_to_rgba(cg_image: &CGImage) -> Option<RgbaImage> {
        let width = cg_image.width();
        let height = cg_image.height();
        let bytes_per_row = cg_image.bytes_per_row();
        let bits_per_pixel = cg_image.bits_per_pixel();

        let data = cg_image.data();
        let bytes = data.bytes();

        if bytes.is_empty() {
            return None;
        }

        // CGImage rows are BGRA on macOS
        let mut rgba_data = Vec::with_capacity((width * height * 4) as usize);

        for y in 0..height {
            let row_start = y * bytes_per_row;
            for x in 0..width {
                let pixel_start = row_start + x * (bits_per_pixel / 8);
                if pixel_start + 3 < bytes.len() {
                    let b = bytes[pixel_start];
                    let g = bytes[pixel_start + 1];
                    let r = bytes[pixel_start + 2];
                    let a = bytes[pixel_start + 3];
                    rgba_data.extend_from_slice(&[r, g, b, a]);
                }
            }
        }

        RgbaImage::from_raw(width as u32, height as u32, rgba_data)
    }
}

#[cfg(not(target_os = "macos"))]
mod platform {
    use super::*;

    pub fn primary_bounds() -> Option<SurfaceBounds> {
        None
    }

    pub fn capture_primary() -> Option<RgbaImage> {
        None
    }
}

/// Source of full-surface snapshots. The screen in production; a fixed
/// frame in tests.
pub trait SurfaceSource: Send {
    fn bounds(&self) -> SurfaceBounds;

    /// One full-surface frame, or `None` when the surface is unavailable
    fn snapshot(&mut self) -> Option<RgbaImage>;
}

/// Primary-display surface source
pub struct ScreenSource {
    bounds: SurfaceBounds,
}

impl ScreenSource {
    pub fn new() -> Self {
        let bounds = match platform::primary_bounds() {
            Some(bounds) => bounds,
            None => {
                warn!("Primary display bounds unavailable, assuming 1920x1080");
                SurfaceBounds::new(1920, 1080)
            }
        };
        Self { bounds }
    }
}

impl Default for ScreenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SurfaceSource for ScreenSource {
    fn bounds(&self) -> SurfaceBounds {
        self.bounds
    }

    fn snapshot(&mut self) -> Option<RgbaImage> {
        let start = std::time::Instant::now();
        let result = platform::capture_primary();
        if result.is_some() {
            trace!("Display captured in {:?}", start.elapsed());
        } else {
            warn!("Failed to capture display");
        }
        result
    }
}

/// Surface source backed by a fixed in-memory frame
pub struct StaticSource {
    frame: RgbaImage,
}

impl StaticSource {
    pub fn new(frame: RgbaImage) -> Self {
        Self { frame }
    }
}

impl SurfaceSource for StaticSource {
    fn bounds(&self) -> SurfaceBounds {
        SurfaceBounds::new(self.frame.width(), self.frame.height())
    }

    fn snapshot(&mut self) -> Option<RgbaImage> {
        Some(self.frame.clone())
    }
}

/// Crop one region out of a full frame. Returns `None` when the region's
/// geometry falls outside the frame or is empty — stale geometry after a
/// resolution change is skipped, never a crash.
pub fn crop_region(frame: &RgbaImage, region: &Region) -> Option<RgbaImage> {
    if region.x < 0 || region.y < 0 || region.width == 0 || region.height == 0 {
        return None;
    }
    let (x, y) = (region.x as u32, region.y as u32);
    if x + region.width > frame.width() || y + region.height > frame.height() {
        return None;
    }
    Some(image::imageops::crop_imm(frame, x, y, region.width, region.height).to_image())
}

/// Build a capture filename embedding a monotonic timestamp and the region
/// label. Zero-padding keeps lexicographic order equal to capture order.
pub fn capture_filename(timestamp_micros: i64, label: &str) -> String {
    format!("capture_{:016}_{}.png", timestamp_micros, label)
}

/// Strictly increasing microsecond timestamps, collision-free even when two
/// captures land in the same clock tick
#[derive(Debug)]
struct MonotonicStamp {
    last: i64,
}

impl MonotonicStamp {
    fn new() -> Self {
        Self { last: 0 }
    }

    fn next(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_micros();
        self.last = now.max(self.last + 1);
        self.last
    }
}

/// Fixed-interval capture loop over the regions of a [`SharedRegionSet`]
pub struct CaptureScheduler {
    regions: SharedRegionSet,
    source: Box<dyn SurfaceSource>,
    output_dir: PathBuf,
    interval: Duration,
    paused: Arc<AtomicBool>,
    stamp: MonotonicStamp,
    captured: u64,
}

impl CaptureScheduler {
    pub fn new(
        regions: SharedRegionSet,
        source: Box<dyn SurfaceSource>,
        output_dir: PathBuf,
        interval: Duration,
        paused: Arc<AtomicBool>,
    ) -> Self {
        Self {
            regions,
            source,
            output_dir,
            interval,
            paused,
            stamp: MonotonicStamp::new(),
            captured: 0,
        }
    }

    /// Run until shutdown. Ticks are not re-entrant: a tick still writing
    /// when the next is due causes the next to be dropped, never queued.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Capture scheduler running with {}s interval",
            self.interval.as_secs()
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.paused.load(Ordering::Relaxed) {
                        trace!("Capture paused, skipping tick");
                        continue;
                    }
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Capture scheduler stopped ({} crops written)", self.captured);
    }

    /// One tick: one snapshot, one crop per region
    pub async fn tick(&mut self) {
        let geometry = self.regions.snapshot().await;
        if geometry.is_empty() {
            trace!("No regions defined, skipping tick");
            return;
        }

        // Recreated per tick; a transient failure skips the tick instead of
        // ending the task
        if let Err(e) = std::fs::create_dir_all(&self.output_dir) {
            warn!(
                "Cannot create output directory {:?}: {}, skipping tick",
                self.output_dir, e
            );
            return;
        }

        let Some(frame) = self.source.snapshot() else {
            warn!("Surface snapshot unavailable, skipping tick");
            return;
        };

        for region in &geometry {
            let Some(crop) = crop_region(&frame, region) else {
                warn!(
                    "Region '{}' is outside the current surface, skipped",
                    region.label
                );
                continue;
            };

            let path = self
                .output_dir
                .join(capture_filename(self.stamp.next(), &region.label));
            let label = region.label.clone();
            let write = tokio::task::spawn_blocking(move || crop.save(&path)).await;
            match write {
                Ok(Ok(())) => {
                    self.captured += 1;
                    debug!("Captured region '{}'", label);
                }
                Ok(Err(e)) => warn!("Failed to write crop for '{}': {}", label, e),
                Err(e) => warn!("Crop write task for '{}' failed: {}", label, e),
            }
        }
    }
}
