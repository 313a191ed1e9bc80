//! In-memory region collection with clamped mutation and best-effort
//! persistence.
//!
//! [`RegionSet`] is the synchronous core: an insertion-ordered set of named
//! rectangles whose mutations are clamped to the capture surface.
//! [`SharedRegionSet`] wraps it for concurrent use by the edit surface and
//! the capture tick, persisting every successful mutation to a
//! [`RegionStore`] without blocking the caller.

use crate::store::{RegionStore, StoreError};
use crate::types::{Region, ScopeKey, SurfaceBounds, MIN_REGION_SIZE};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RegionSetError {
    #[error("no region with label: {0}")]
    UnknownLabel(String),

    #[error("a region with label {0} already exists")]
    DuplicateLabel(String),
}

/// Mutable collection of named regions, clamped to a capture surface
#[derive(Debug)]
pub struct RegionSet {
    surface: SurfaceBounds,
    regions: Vec<Region>,
    next_id: u32,
}

impl RegionSet {
    pub fn new(surface: SurfaceBounds) -> Self {
        Self {
            surface,
            regions: Vec::new(),
            next_id: 1,
        }
    }

    /// Build a set from loaded regions, clamping each to the surface.
    /// Geometry may predate a surface-resolution change.
    pub fn with_regions(surface: SurfaceBounds, regions: Vec<Region>) -> Self {
        let mut set = Self::new(surface);
        for mut region in regions {
            region.clamp_to(surface);
            set.regions.push(region);
        }
        set
    }

    pub fn surface(&self) -> SurfaceBounds {
        self.surface
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn get(&self, label: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.label == label)
    }

    fn position(&self, label: &str) -> Result<usize, RegionSetError> {
        self.regions
            .iter()
            .position(|r| r.label == label)
            .ok_or_else(|| RegionSetError::UnknownLabel(label.to_string()))
    }

    /// Add a default-sized region centered on the surface, with a generated
    /// unique label
    pub fn add(&mut self) -> &Region {
        let label = loop {
            let candidate = format!("region_{}", self.next_id);
            self.next_id += 1;
            if self.get(&candidate).is_none() {
                break candidate;
            }
        };
        let (x, y, w, h) = self.surface.centered_default();
        let mut region = Region::new(label, x, y, w, h);
        region.clamp_to(self.surface);
        self.regions.push(region);
        &self.regions[self.regions.len() - 1]
    }

    /// Add a region with explicit label and geometry, clamped to the surface
    pub fn add_labeled(
        &mut self,
        label: &str,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> Result<&Region, RegionSetError> {
        if self.get(label).is_some() {
            return Err(RegionSetError::DuplicateLabel(label.to_string()));
        }
        let mut region = Region::new(label, x, y, width, height);
        region.clamp_to(self.surface);
        self.regions.push(region);
        Ok(&self.regions[self.regions.len() - 1])
    }

    pub fn remove(&mut self, label: &str) -> Result<Region, RegionSetError> {
        let idx = self.position(label)?;
        Ok(self.regions.remove(idx))
    }

    /// Move a region by `(dx, dy)`. A move that would push the rectangle
    /// off-surface is clamped, not rejected.
    pub fn translate(&mut self, label: &str, dx: i32, dy: i32) -> Result<&Region, RegionSetError> {
        let idx = self.position(label)?;
        let surface = self.surface;
        let region = &mut self.regions[idx];

        let max_x = surface.width.saturating_sub(region.width) as i64;
        let max_y = surface.height.saturating_sub(region.height) as i64;
        region.x = (region.x as i64 + dx as i64).clamp(0, max_x) as i32;
        region.y = (region.y as i64 + dy as i64).clamp(0, max_y) as i32;

        Ok(&self.regions[idx])
    }

    /// Grow or shrink a region by `(dw, dh)`, clamped to the minimum size
    /// floor and the surface extent.
    pub fn resize(&mut self, label: &str, dw: i32, dh: i32) -> Result<&Region, RegionSetError> {
        let idx = self.position(label)?;
        let surface = self.surface;
        let region = &mut self.regions[idx];

        let max_w = (surface.width as i64 - region.x as i64).max(MIN_REGION_SIZE as i64);
        let max_h = (surface.height as i64 - region.y as i64).max(MIN_REGION_SIZE as i64);
        region.width =
            (region.width as i64 + dw as i64).clamp(MIN_REGION_SIZE as i64, max_w) as u32;
        region.height =
            (region.height as i64 + dh as i64).clamp(MIN_REGION_SIZE as i64, max_h) as u32;

        Ok(&self.regions[idx])
    }

    /// Topmost region containing the point; the most recently added region
    /// sits on top.
    pub fn hit_test(&self, x: i32, y: i32) -> Option<&Region> {
        self.regions.iter().rev().find(|r| r.contains(x, y))
    }

    /// Consistent copy of all region geometry, in insertion order
    pub fn snapshot(&self) -> Vec<Region> {
        self.regions.clone()
    }
}

/// One persistence operation, queued in mutation order
enum PersistOp {
    Save(Region),
    Delete(String),
}

/// Concurrent handle over a [`RegionSet`] with best-effort persistence.
///
/// Mutations take the write lock only for the in-memory change; persistence
/// ops are queued to a dedicated writer task that applies them strictly in
/// mutation order, so the store always converges on the latest geometry. A
/// failed write is logged, never rolled back.
#[derive(Clone)]
pub struct SharedRegionSet {
    inner: Arc<RwLock<RegionSet>>,
    persist_tx: Option<mpsc::UnboundedSender<PersistOp>>,
}

impl SharedRegionSet {
    /// In-memory only, no persistence
    pub fn new(set: RegionSet) -> Self {
        Self {
            inner: Arc::new(RwLock::new(set)),
            persist_tx: None,
        }
    }

    /// Requires a tokio runtime; spawns the writer task owning the store
    pub fn with_store(set: RegionSet, store: RegionStore, scope: Option<ScopeKey>) -> Self {
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(store, scope, persist_rx));
        Self {
            inner: Arc::new(RwLock::new(set)),
            persist_tx: Some(persist_tx),
        }
    }

    /// Open the store and load the scope's regions. Storage unavailability
    /// is non-fatal: the session proceeds with in-memory-only regions.
    pub async fn load_or_default(
        surface: SurfaceBounds,
        db_path: PathBuf,
        scope: Option<ScopeKey>,
    ) -> Self {
        let load_scope = scope.clone();
        let opened = tokio::task::spawn_blocking(move || {
            let store = RegionStore::open(&db_path)?;
            let regions = store.load(load_scope.as_ref())?;
            Ok::<_, StoreError>((store, regions))
        })
        .await;

        match opened {
            Ok(Ok((store, regions))) => {
                info!("Loaded {} regions from store", regions.len());
                Self::with_store(RegionSet::with_regions(surface, regions), store, scope)
            }
            Ok(Err(e)) => {
                warn!("Region store unavailable: {}, editing in memory only", e);
                Self::new(RegionSet::new(surface))
            }
            Err(e) => {
                warn!("Region store task failed: {}, editing in memory only", e);
                Self::new(RegionSet::new(surface))
            }
        }
    }

    pub async fn add(&self) -> Region {
        let region = {
            let mut set = self.inner.write().await;
            set.add().clone()
        };
        self.persist(region.clone());
        region
    }

    pub async fn add_labeled(
        &self,
        label: &str,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> Result<Region, RegionSetError> {
        let region = {
            let mut set = self.inner.write().await;
            set.add_labeled(label, x, y, width, height)?.clone()
        };
        self.persist(region.clone());
        Ok(region)
    }

    pub async fn remove(&self, label: &str) -> Result<Region, RegionSetError> {
        let region = {
            let mut set = self.inner.write().await;
            set.remove(label)?
        };
        self.persist_delete(region.label.clone());
        Ok(region)
    }

    pub async fn translate(&self, label: &str, dx: i32, dy: i32) -> Result<Region, RegionSetError> {
        let region = {
            let mut set = self.inner.write().await;
            set.translate(label, dx, dy)?.clone()
        };
        self.persist(region.clone());
        Ok(region)
    }

    pub async fn resize(&self, label: &str, dw: i32, dh: i32) -> Result<Region, RegionSetError> {
        let region = {
            let mut set = self.inner.write().await;
            set.resize(label, dw, dh)?.clone()
        };
        self.persist(region.clone());
        Ok(region)
    }

    pub async fn hit_test(&self, x: i32, y: i32) -> Option<Region> {
        self.inner.read().await.hit_test(x, y).cloned()
    }

    /// One consistent `(x, y, w, h)` tuple per region, never torn
    pub async fn snapshot(&self) -> Vec<Region> {
        self.inner.read().await.snapshot()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    fn persist(&self, region: Region) {
        if let Some(tx) = &self.persist_tx {
            if tx.send(PersistOp::Save(region)).is_err() {
                warn!("Region writer gone, mutation not persisted");
            }
        }
    }

    fn persist_delete(&self, label: String) {
        if let Some(tx) = &self.persist_tx {
            if tx.send(PersistOp::Delete(label)).is_err() {
                warn!("Region writer gone, deletion not persisted");
            }
        }
    }
}

/// Applies queued persistence ops one at a time, in arrival order. The
/// store moves in and out of a blocking task per op; the task exits when
/// every handle to the set is gone.
async fn run_writer(
    mut store: RegionStore,
    scope: Option<ScopeKey>,
    mut rx: mpsc::UnboundedReceiver<PersistOp>,
) {
    while let Some(op) = rx.recv().await {
        let op_scope = scope.clone();
        let result = tokio::task::spawn_blocking(move || {
            let outcome = match &op {
                PersistOp::Save(region) => store
                    .save(op_scope.as_ref(), region)
                    .map(|()| debug!("Persisted region '{}'", region.label))
                    .map_err(|e| (region.label.clone(), e)),
                PersistOp::Delete(label) => store
                    .delete(op_scope.as_ref(), label)
                    .map(|_| ())
                    .map_err(|e| (label.clone(), e)),
            };
            (store, outcome)
        })
        .await;

        match result {
            Ok((returned, outcome)) => {
                store = returned;
                if let Err((label, e)) = outcome {
                    warn!("Failed to persist region '{}': {}", label, e);
                }
            }
            Err(e) => {
                warn!("Region writer task failed: {}", e);
                break;
            }
        }
    }
    debug!("Region writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface() -> SurfaceBounds {
        SurfaceBounds::new(200, 200)
    }

    #[test]
    fn test_translate_clamps_to_surface() {
        // 200x200 surface, region at (100,100,50,50), translate +200 in x
        let mut set = RegionSet::new(surface());
        set.add_labeled("seat1", 100, 100, 50, 50).unwrap();

        let r = set.translate("seat1", 200, 0).unwrap();
        assert_eq!(r.x, 150);
        assert_eq!(r.y, 100);
    }

    #[test]
    fn test_translate_clamps_at_origin() {
        let mut set = RegionSet::new(surface());
        set.add_labeled("seat1", 10, 10, 50, 50).unwrap();

        let r = set.translate("seat1", -100, -100).unwrap();
        assert_eq!((r.x, r.y), (0, 0));
    }

    #[test]
    fn test_resize_respects_floor_and_surface() {
        let mut set = RegionSet::new(surface());
        set.add_labeled("seat1", 100, 100, 50, 50).unwrap();

        let r = set.resize("seat1", -100, -100).unwrap();
        assert_eq!((r.width, r.height), (MIN_REGION_SIZE, MIN_REGION_SIZE));

        let r = set.resize("seat1", 1000, 1000).unwrap();
        // Cannot extend past the surface from origin (100, 100)
        assert_eq!((r.width, r.height), (100, 100));
    }

    #[test]
    fn test_invariant_holds_after_mutation_sequence() {
        let mut set = RegionSet::new(surface());
        set.add_labeled("seat1", 50, 50, 60, 60).unwrap();

        let moves: [(i32, i32); 5] = [(300, -500), (-40, 25), (0, 999), (-1000, 0), (75, 75)];
        for (dx, dy) in moves {
            set.translate("seat1", dx, dy).unwrap();
            set.resize("seat1", dy, dx).unwrap();

            let r = set.get("seat1").unwrap();
            assert!(r.x >= 0 && r.y >= 0);
            assert!(r.width >= MIN_REGION_SIZE && r.height >= MIN_REGION_SIZE);
            assert!(r.x as u32 + r.width <= 200);
            assert!(r.y as u32 + r.height <= 200);
        }
    }

    #[test]
    fn test_hit_test_last_inserted_wins() {
        let mut set = RegionSet::new(surface());
        set.add_labeled("bottom", 0, 0, 100, 100).unwrap();
        set.add_labeled("top", 50, 50, 100, 100).unwrap();

        // Point inside both: most recently added wins
        assert_eq!(set.hit_test(75, 75).unwrap().label, "top");
        // Point only inside the first
        assert_eq!(set.hit_test(10, 10).unwrap().label, "bottom");
        assert!(set.hit_test(180, 10).is_none());
    }

    #[test]
    fn test_add_generates_unique_labels() {
        let mut set = RegionSet::new(surface());
        let a = set.add().label.clone();
        let b = set.add().label.clone();
        assert_ne!(a, b);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_add_labeled_rejects_duplicate() {
        let mut set = RegionSet::new(surface());
        set.add_labeled("seat1", 0, 0, 50, 50).unwrap();
        assert!(matches!(
            set.add_labeled("seat1", 10, 10, 50, 50),
            Err(RegionSetError::DuplicateLabel(_))
        ));
    }

    #[test]
    fn test_remove_unknown_label() {
        let mut set = RegionSet::new(surface());
        assert!(matches!(
            set.remove("ghost"),
            Err(RegionSetError::UnknownLabel(_))
        ));
    }

    #[test]
    fn test_with_regions_clamps_stale_geometry() {
        // Loaded geometry may predate a resolution change
        let regions = vec![Region::new("seat1", 500, 500, 50, 50)];
        let set = RegionSet::with_regions(surface(), regions);
        let r = set.get("seat1").unwrap();
        assert!(r.x as u32 + r.width <= 200);
        assert!(r.y as u32 + r.height <= 200);
    }

    #[tokio::test]
    async fn test_shared_mutations_and_snapshot() {
        let shared = SharedRegionSet::new(RegionSet::new(surface()));
        shared.add_labeled("seat1", 100, 100, 50, 50).await.unwrap();
        shared.translate("seat1", 200, 0).await.unwrap();

        let snapshot = shared.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].x, 150);

        shared.remove("seat1").await.unwrap();
        assert!(shared.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_shared_persists_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("regions.db");

        {
            let shared =
                SharedRegionSet::load_or_default(surface(), db_path.clone(), None).await;
            shared.add_labeled("seat1", 100, 100, 50, 50).await.unwrap();
            // Wait for the background persist to land
            for _ in 0..50 {
                let store = RegionStore::open(&db_path).unwrap();
                if !store.load(None).unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        }

        let reloaded = SharedRegionSet::load_or_default(surface(), db_path, None).await;
        let snapshot = reloaded.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].label, "seat1");
    }

    #[tokio::test]
    async fn test_burst_of_translates_persists_final_geometry() {
        // A drag is a burst of translates; the store must end at the final
        // position, not whichever write happened to land last
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("regions.db");

        let shared = SharedRegionSet::load_or_default(surface(), db_path.clone(), None).await;
        shared.add_labeled("seat1", 0, 0, 50, 50).await.unwrap();
        for _ in 0..20 {
            shared.translate("seat1", 5, 0).await.unwrap();
        }
        let expected = shared.snapshot().await[0].clone();
        assert_eq!(expected.x, 100);

        let mut stored = Vec::new();
        for _ in 0..100 {
            let store = RegionStore::open(&db_path).unwrap();
            stored = store.load(None).unwrap();
            if stored.first() == Some(&expected) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(stored, vec![expected]);
    }
}
