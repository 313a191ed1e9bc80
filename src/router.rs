//! Dataset routing: filing retained captures into a label-keyed directory
//! tree, or deleting them when the label is a reject category.

use crate::classifier::Classifier;
use crate::dedup::list_images;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source has no file name: {0}")]
    NoFileName(PathBuf),
}

/// The deterministic fate of a routed image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Label was in the reject set; the file was deleted
    Rejected,
    /// File moved into the dataset tree at this path
    Filed(PathBuf),
}

/// Result of one classify-and-route pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteStats {
    pub filed: usize,
    pub rejected: usize,
    pub skipped: usize,
}

/// Files classified images under `dataset_root/<label>/`
pub struct DatasetRouter {
    dataset_root: PathBuf,
    reject_labels: HashSet<String>,
}

impl DatasetRouter {
    pub fn new(dataset_root: PathBuf, reject_labels: impl IntoIterator<Item = String>) -> Self {
        Self {
            dataset_root,
            reject_labels: reject_labels.into_iter().collect(),
        }
    }

    pub fn is_reject(&self, label: &str) -> bool {
        self.reject_labels.contains(label)
    }

    /// Route one image: delete it when the label is rejected, otherwise
    /// move it into the label's directory (created lazily) under a
    /// collision-free name.
    pub fn route(&self, source: &Path, label: &str) -> Result<RouteOutcome, RouteError> {
        if self.is_reject(label) {
            std::fs::remove_file(source)?;
            debug!("Rejected {:?} ('{}'), deleted", source, label);
            return Ok(RouteOutcome::Rejected);
        }

        let target_dir = self.dataset_root.join(label);
        std::fs::create_dir_all(&target_dir)?;

        let name = source
            .file_name()
            .ok_or_else(|| RouteError::NoFileName(source.to_path_buf()))?;
        let mut dest = target_dir.join(name);
        if dest.exists() {
            dest = target_dir.join(disambiguate(name));
        }

        // rename fails across filesystems; fall back to copy + remove
        if std::fs::rename(source, &dest).is_err() {
            std::fs::copy(source, &dest)?;
            std::fs::remove_file(source)?;
        }

        debug!("Filed {:?} under '{}'", dest, label);
        Ok(RouteOutcome::Filed(dest))
    }

    /// Classify and route every image in `dir`. Classification or routing
    /// failures skip the file with a warning; it stays in place for the
    /// next pass.
    pub async fn process_pending(&self, classifier: &dyn Classifier, dir: &Path) -> RouteStats {
        let mut stats = RouteStats::default();

        let files = match list_images(dir) {
            Ok(files) => files,
            Err(e) => {
                warn!("Cannot scan {:?}: {}", dir, e);
                return stats;
            }
        };

        for file in files {
            let label = match classifier.classify(&file).await {
                Ok(label) => label,
                Err(e) => {
                    warn!("Classification failed for {:?}: {}, skipping", file, e);
                    stats.skipped += 1;
                    continue;
                }
            };

            match self.route(&file, &label) {
                Ok(RouteOutcome::Rejected) => stats.rejected += 1,
                Ok(RouteOutcome::Filed(_)) => stats.filed += 1,
                Err(e) => {
                    warn!("Routing failed for {:?}: {}, skipping", file, e);
                    stats.skipped += 1;
                }
            }
        }

        stats
    }
}

/// Append a short content hash to a file name that already exists at the
/// destination (12 hex chars, as in capture URLs elsewhere in the suite)
fn disambiguate(name: &std::ffi::OsStr) -> String {
    let name = name.to_string_lossy();
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(chrono::Utc::now().timestamp_micros().to_le_bytes());
    let hash = hasher.finalize();
    let suffix = format!(
        "{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        hash[0], hash[1], hash[2], hash[3], hash[4], hash[5]
    );

    match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{}_{}.{}", stem, suffix, ext),
        None => format!("{}_{}", name, suffix),
    }
}

/// Recurring classify-and-route pass over the capture output directory
pub async fn run_router(
    router: DatasetRouter,
    classifier: Box<dyn Classifier>,
    dir: PathBuf,
    interval: Duration,
    active: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Dataset router running ({}s interval)", interval.as_secs());

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !active.load(Ordering::Relaxed) {
                    continue;
                }
                let stats = router.process_pending(classifier.as_ref(), &dir).await;
                if stats.filed > 0 || stats.rejected > 0 {
                    info!(
                        "Routing pass: {} filed, {} rejected, {} skipped",
                        stats.filed, stats.rejected, stats.skipped
                    );
                } else {
                    trace!("Routing pass: nothing to do");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Dataset router stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::FixedClassifier;

    fn reject_labels() -> Vec<String> {
        vec!["non_cartes".to_string(), "cartes_retournees".to_string()]
    }

    fn write_image(path: &Path) {
        image::RgbImage::from_pixel(10, 10, image::Rgb([1, 2, 3]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn test_reject_label_deletes_without_creating_directory() {
        let dir = tempfile::tempdir().unwrap();
        let dataset_root = dir.path().join("dataset");
        let source = dir.path().join("capture_0000000000000001_seat1.png");
        write_image(&source);

        let router = DatasetRouter::new(dataset_root.clone(), reject_labels());
        let outcome = router.route(&source, "non_cartes").unwrap();

        assert_eq!(outcome, RouteOutcome::Rejected);
        assert!(!source.exists());
        // No directory is ever created for a rejected label
        assert!(!dataset_root.exists());
    }

    #[test]
    fn test_accepted_label_files_exactly_one_copy() {
        let dir = tempfile::tempdir().unwrap();
        let dataset_root = dir.path().join("dataset");
        let source = dir.path().join("capture_0000000000000001_seat1.png");
        write_image(&source);

        let router = DatasetRouter::new(dataset_root.clone(), reject_labels());
        let outcome = router.route(&source, "AS").unwrap();

        let RouteOutcome::Filed(dest) = outcome else {
            panic!("expected Filed");
        };
        assert!(!source.exists());
        assert!(dest.exists());
        assert_eq!(dest.parent().unwrap(), dataset_root.join("AS"));
        assert_eq!(
            std::fs::read_dir(dataset_root.join("AS")).unwrap().count(),
            1
        );
    }

    #[test]
    fn test_name_collision_gets_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let dataset_root = dir.path().join("dataset");
        let router = DatasetRouter::new(dataset_root.clone(), reject_labels());

        let source = dir.path().join("capture_0000000000000001_seat1.png");
        write_image(&source);
        router.route(&source, "KH").unwrap();

        // Same name again
        write_image(&source);
        let RouteOutcome::Filed(second) = router.route(&source, "KH").unwrap() else {
            panic!("expected Filed");
        };

        let entries = std::fs::read_dir(dataset_root.join("KH")).unwrap().count();
        assert_eq!(entries, 2);
        assert_ne!(
            second.file_name().unwrap().to_string_lossy(),
            "capture_0000000000000001_seat1.png"
        );
        assert!(second.to_string_lossy().ends_with(".png"));
    }

    #[tokio::test]
    async fn test_process_pending_routes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let captures = dir.path().join("captures");
        std::fs::create_dir_all(&captures).unwrap();
        write_image(&captures.join("capture_0000000000000001_seat1.png"));
        write_image(&captures.join("capture_0000000000000002_seat2.png"));

        let dataset_root = dir.path().join("dataset");
        let router = DatasetRouter::new(dataset_root.clone(), reject_labels());
        let classifier = FixedClassifier::new("QD");

        let stats = router.process_pending(&classifier, &captures).await;

        assert_eq!(stats.filed, 2);
        assert_eq!(stats.rejected, 0);
        assert_eq!(std::fs::read_dir(&captures).unwrap().count(), 0);
        assert_eq!(
            std::fs::read_dir(dataset_root.join("QD")).unwrap().count(),
            2
        );
    }

    #[tokio::test]
    async fn test_process_pending_rejects_to_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let captures = dir.path().join("captures");
        std::fs::create_dir_all(&captures).unwrap();
        write_image(&captures.join("capture_0000000000000001_seat1.png"));

        let dataset_root = dir.path().join("dataset");
        let router = DatasetRouter::new(dataset_root.clone(), reject_labels());
        let classifier = FixedClassifier::new("non_cartes");

        let stats = router.process_pending(&classifier, &captures).await;

        assert_eq!(stats.rejected, 1);
        assert_eq!(std::fs::read_dir(&captures).unwrap().count(), 0);
        assert!(!dataset_root.exists());
    }
}
