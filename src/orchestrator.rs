//! Pipeline orchestration: wires the region set, capture scheduler,
//! duplicate sweeper and dataset router into one running pipeline, and
//! exposes the edit mode that pauses capture while regions are mutated.

use crate::capture::{CaptureScheduler, SurfaceSource};
use crate::classifier::{Classifier, CommandClassifier};
use crate::config::Config;
use crate::dedup::{run_sweeper, DuplicateFilter};
use crate::regions::SharedRegionSet;
use crate::router::{run_router, DatasetRouter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Pipeline mode. `Editing` and `Capturing` are both reachable from
/// `Stopped`; transitions are user-driven and idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Stopped,
    Editing,
    Capturing,
}

/// Snapshot of the pipeline's current state
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub mode: Mode,
    pub regions: usize,
}

/// Owns the lifecycles of the capture/dedup/route cycle
pub struct Orchestrator {
    regions: SharedRegionSet,
    mode: Mode,
    /// Gates the capture tick; set while editing or stopped
    capture_paused: Arc<AtomicBool>,
    /// Gates the background sweeps; cleared only when stopped
    pipeline_active: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Build the pipeline and spawn its background tasks, initially in
    /// `Stopped` mode (nothing captures or sweeps until a mode change).
    pub async fn new(config: Config, source: Box<dyn SurfaceSource>) -> Self {
        let surface = source.bounds();
        let regions = SharedRegionSet::load_or_default(
            surface,
            config.storage.region_db.clone(),
            config.storage.scope.clone(),
        )
        .await;

        let capture_paused = Arc::new(AtomicBool::new(true));
        let pipeline_active = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::new();

        let scheduler = CaptureScheduler::new(
            regions.clone(),
            source,
            config.capture.output_dir.clone(),
            Duration::from_secs(config.capture.interval_seconds.max(1)),
            capture_paused.clone(),
        );
        tasks.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));

        let filter = DuplicateFilter::from_config(&config.dedup);
        tasks.push(tokio::spawn(run_sweeper(
            filter,
            config.capture.output_dir.clone(),
            Duration::from_secs(config.dedup.sweep_interval_seconds.max(1)),
            pipeline_active.clone(),
            shutdown_rx.clone(),
        )));

        match &config.dataset.classifier_command {
            Some(binary) => {
                let classifier = CommandClassifier::new(binary.clone());
                if !classifier.is_available() {
                    warn!(
                        "Classifier binary not found at {:?}; captures will accumulate unrouted",
                        binary
                    );
                }
                let router = DatasetRouter::new(
                    config.dataset.dataset_root.clone(),
                    config.dataset.reject_labels.clone(),
                );
                tasks.push(tokio::spawn(run_router(
                    router,
                    Box::new(classifier) as Box<dyn Classifier>,
                    config.capture.output_dir.clone(),
                    Duration::from_secs(config.dataset.route_interval_seconds.max(1)),
                    pipeline_active.clone(),
                    shutdown_rx,
                )));
            }
            None => {
                info!("No classifier configured, dataset routing disabled");
            }
        }

        Self {
            regions,
            mode: Mode::Stopped,
            capture_paused,
            pipeline_active,
            shutdown_tx,
            tasks,
        }
    }

    /// Handle for the external edit surface; mutations through it are
    /// clamped and persisted, and capture reads stay consistent.
    pub fn regions(&self) -> SharedRegionSet {
        self.regions.clone()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Transition to `mode`. Re-entering the current mode is a no-op.
    pub fn set_mode(&mut self, mode: Mode) {
        if mode == self.mode {
            return;
        }

        match mode {
            Mode::Capturing => {
                self.pipeline_active.store(true, Ordering::Relaxed);
                self.capture_paused.store(false, Ordering::Relaxed);
            }
            Mode::Editing => {
                // Capture pauses while regions are being edited; the
                // background sweeps keep draining the output directory
                self.pipeline_active.store(true, Ordering::Relaxed);
                self.capture_paused.store(true, Ordering::Relaxed);
            }
            Mode::Stopped => {
                self.capture_paused.store(true, Ordering::Relaxed);
                self.pipeline_active.store(false, Ordering::Relaxed);
            }
        }

        info!("Pipeline mode: {:?} -> {:?}", self.mode, mode);
        self.mode = mode;
    }

    pub async fn status(&self) -> PipelineStatus {
        PipelineStatus {
            mode: self.mode,
            regions: self.regions.len().await,
        }
    }

    /// Tear the pipeline down. In-flight units of work (one crop, one
    /// comparison) finish before the tasks exit; nothing is interrupted
    /// mid-write.
    pub async fn shutdown(mut self) {
        self.set_mode(Mode::Stopped);
        if self.shutdown_tx.send(true).is_err() {
            warn!("All pipeline tasks already exited");
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Pipeline task ended abnormally: {}", e);
            }
        }
        info!("Pipeline shut down");
    }
}
