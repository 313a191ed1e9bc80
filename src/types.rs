//! Core types used throughout the capture pipeline.
//!
//! This module defines the fundamental data structures for region geometry,
//! the capture surface, and scoped persistence keys.

use serde::{Deserialize, Serialize};

/// Smallest edge a region may be resized down to, in pixels.
pub const MIN_REGION_SIZE: u32 = 30;

/// Default size for interactively added regions.
pub const DEFAULT_REGION_WIDTH: u32 = 100;
pub const DEFAULT_REGION_HEIGHT: u32 = 100;

/// A labeled rectangle of the capture surface whose pixels are extracted
/// each tick.
///
/// Invariant: `width` and `height` are at least [`MIN_REGION_SIZE`] and the
/// bounding box lies inside the capture surface. Mutations go through
/// [`crate::regions::RegionSet`], which clamps rather than rejects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// Unique label within a scope
    pub label: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(label: impl Into<String>, x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            label: label.into(),
            x,
            y,
            width,
            height,
        }
    }

    /// Check if a point is inside this region
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x
            && x < self.x + self.width as i32
            && y >= self.y
            && y < self.y + self.height as i32
    }

    /// Clamp this region so it satisfies the bounds invariant for `surface`.
    ///
    /// Size is clamped first (floor [`MIN_REGION_SIZE`], ceiling the surface
    /// extent), then the origin is pulled back so the rectangle fits.
    pub fn clamp_to(&mut self, surface: SurfaceBounds) {
        self.width = self
            .width
            .clamp(MIN_REGION_SIZE, surface.width.max(MIN_REGION_SIZE));
        self.height = self
            .height
            .clamp(MIN_REGION_SIZE, surface.height.max(MIN_REGION_SIZE));

        let max_x = surface.width.saturating_sub(self.width) as i32;
        let max_y = surface.height.saturating_sub(self.height) as i32;
        self.x = self.x.clamp(0, max_x);
        self.y = self.y.clamp(0, max_y);
    }
}

/// Extent of the capture surface (the full screen)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceBounds {
    pub width: u32,
    pub height: u32,
}

impl SurfaceBounds {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Geometry for a new default-sized region, centered on the surface
    pub fn centered_default(&self) -> (i32, i32, u32, u32) {
        let x = (self.width.saturating_sub(DEFAULT_REGION_WIDTH) / 2) as i32;
        let y = (self.height.saturating_sub(DEFAULT_REGION_HEIGHT) / 2) as i32;
        (x, y, DEFAULT_REGION_WIDTH, DEFAULT_REGION_HEIGHT)
    }
}

/// Composite identifier letting the same label resolve to different
/// geometries per poker-room layout. When absent, regions live in the
/// unscoped namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub site: String,
    pub style: String,
    pub table_id: i64,
}

impl ScopeKey {
    pub fn new(site: impl Into<String>, style: impl Into<String>, table_id: i64) -> Self {
        Self {
            site: site.into(),
            style: style.into(),
            table_id,
        }
    }
}
