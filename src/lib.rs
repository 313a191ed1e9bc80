//! Region Capture - screen-region dataset collection pipeline
//!
//! This crate captures user-defined rectangular screen regions on a fixed
//! cadence, suppresses near-duplicate captures, and routes the survivors
//! into a labeled dataset directory tree:
//!
//! - **Regions**: labeled rectangles, clamped to the surface, persisted to
//!   SQLite and editable while capture is paused
//! - **Capture**: a 1 Hz tick crops every region out of one full-surface
//!   snapshot and writes PNG files with monotonic timestamps
//! - **Dedup**: periodic sweeps remove near-duplicates, keeping the
//!   earliest capture (structural SSIM or feature-vector cosine distance)
//! - **Routing**: an external classifier assigns each survivor a card
//!   label; reject categories are deleted, the rest are filed per label
//!
//! The [`Orchestrator`] wires these together and exposes the pipeline
//! modes (`Stopped`, `Editing`, `Capturing`).

pub mod capture;
pub mod classifier;
pub mod config;
pub mod dedup;
pub mod orchestrator;
pub mod regions;
pub mod router;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use capture::{capture_filename, crop_region, CaptureScheduler, ScreenSource, SurfaceSource};
pub use classifier::{class_labels, is_known_label, Classifier, ClassifyError, CommandClassifier};
pub use config::{Config, ConfigOrigin, DedupStrategy};
pub use dedup::{cosine_distance, ssim, DedupError, DuplicateFilter, FeatureExtractor, SweepStats};
pub use orchestrator::{Mode, Orchestrator, PipelineStatus};
pub use regions::{RegionSet, RegionSetError, SharedRegionSet};
pub use router::{DatasetRouter, RouteError, RouteOutcome, RouteStats};
pub use store::{RegionStore, StoreError};
pub use types::{Region, ScopeKey, SurfaceBounds, MIN_REGION_SIZE};
