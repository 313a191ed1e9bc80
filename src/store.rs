//! SQLite storage for region geometry.
//!
//! Regions are keyed by `(scope, label)` where the scope is an optional
//! `(site, style, table_id)` triple; the unscoped namespace is stored under
//! a sentinel scope so scoped and unscoped rows share one table.

use crate::types::{Region, ScopeKey};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One region in the JSON export format: label plus `[x, y, width, height]`
#[derive(Debug, Serialize, Deserialize)]
struct JsonRegion {
    label: String,
    rect: [i64; 4],
}

/// Durable keyed storage of rectangle geometry
pub struct RegionStore {
    conn: Connection,
}

impl RegionStore {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS regions (
                site TEXT NOT NULL DEFAULT '',
                style TEXT NOT NULL DEFAULT '',
                table_id INTEGER NOT NULL DEFAULT 0,
                label TEXT NOT NULL,
                x INTEGER NOT NULL,
                y INTEGER NOT NULL,
                width INTEGER NOT NULL,
                height INTEGER NOT NULL,
                PRIMARY KEY (site, style, table_id, label)
            );
            "#,
        )?;
        Ok(())
    }

    fn scope_columns(scope: Option<&ScopeKey>) -> (String, String, i64) {
        match scope {
            Some(s) => (s.site.clone(), s.style.clone(), s.table_id),
            None => (String::new(), String::new(), 0),
        }
    }

    /// Upsert a region, keyed by `(scope, label)`. An existing label has its
    /// geometry updated in place.
    pub fn save(&self, scope: Option<&ScopeKey>, region: &Region) -> Result<(), StoreError> {
        let (site, style, table_id) = Self::scope_columns(scope);
        self.conn.execute(
            r#"
            INSERT INTO regions (site, style, table_id, label, x, y, width, height)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(site, style, table_id, label) DO UPDATE SET
                x = excluded.x,
                y = excluded.y,
                width = excluded.width,
                height = excluded.height
            "#,
            params![
                site,
                style,
                table_id,
                region.label,
                region.x,
                region.y,
                region.width,
                region.height
            ],
        )?;
        Ok(())
    }

    /// Load all regions in a scope, in insertion order
    pub fn load(&self, scope: Option<&ScopeKey>) -> Result<Vec<Region>, StoreError> {
        let (site, style, table_id) = Self::scope_columns(scope);
        let mut stmt = self.conn.prepare(
            "SELECT label, x, y, width, height FROM regions
             WHERE site = ?1 AND style = ?2 AND table_id = ?3
             ORDER BY rowid",
        )?;

        let rows = stmt.query_map(params![site, style, table_id], |row| {
            Ok(Region {
                label: row.get(0)?,
                x: row.get(1)?,
                y: row.get(2)?,
                width: row.get(3)?,
                height: row.get(4)?,
            })
        })?;

        let mut regions = Vec::new();
        for row in rows {
            regions.push(row?);
        }
        Ok(regions)
    }

    /// Delete a region by label. Returns whether a row was removed.
    pub fn delete(&self, scope: Option<&ScopeKey>, label: &str) -> Result<bool, StoreError> {
        let (site, style, table_id) = Self::scope_columns(scope);
        let affected = self.conn.execute(
            "DELETE FROM regions
             WHERE site = ?1 AND style = ?2 AND table_id = ?3 AND label = ?4",
            params![site, style, table_id, label],
        )?;
        Ok(affected > 0)
    }

    /// Export a scope's regions as an ordered JSON list of labeled
    /// `[x, y, width, height]` tuples.
    pub fn export_json<P: AsRef<Path>>(
        &self,
        scope: Option<&ScopeKey>,
        path: P,
    ) -> Result<(), StoreError> {
        let regions: Vec<JsonRegion> = self
            .load(scope)?
            .into_iter()
            .map(|r| JsonRegion {
                label: r.label,
                rect: [r.x as i64, r.y as i64, r.width as i64, r.height as i64],
            })
            .collect();
        let contents = serde_json::to_string_pretty(&regions)?;
        std::fs::write(path.as_ref(), contents)?;
        info!("Exported {} regions to {:?}", regions.len(), path.as_ref());
        Ok(())
    }

    /// Import regions from the JSON export format, upserting into `scope`.
    /// Returns the imported regions in file order.
    pub fn import_json<P: AsRef<Path>>(
        &self,
        scope: Option<&ScopeKey>,
        path: P,
    ) -> Result<Vec<Region>, StoreError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let entries: Vec<JsonRegion> = serde_json::from_str(&contents)?;

        let mut regions = Vec::with_capacity(entries.len());
        for entry in entries {
            let region = Region::new(
                entry.label,
                entry.rect[0] as i32,
                entry.rect[1] as i32,
                entry.rect[2].max(0) as u32,
                entry.rect[3].max(0) as u32,
            );
            self.save(scope, &region)?;
            regions.push(region);
        }
        info!(
            "Imported {} regions from {:?}",
            regions.len(),
            path.as_ref()
        );
        Ok(regions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_round_trip() {
        let store = RegionStore::open_in_memory().unwrap();
        let region = Region::new("seat1", 100, 100, 50, 50);

        store.save(None, &region).unwrap();
        let loaded = store.load(None).unwrap();

        assert_eq!(loaded, vec![region]);
    }

    #[test]
    fn test_save_is_upsert() {
        let store = RegionStore::open_in_memory().unwrap();
        store
            .save(None, &Region::new("seat1", 0, 0, 50, 50))
            .unwrap();
        store
            .save(None, &Region::new("seat1", 10, 20, 60, 70))
            .unwrap();

        let loaded = store.load(None).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], Region::new("seat1", 10, 20, 60, 70));
    }

    #[test]
    fn test_scopes_are_independent() {
        let store = RegionStore::open_in_memory().unwrap();
        let scope_a = ScopeKey::new("Winamax", "6-Max", 1);
        let scope_b = ScopeKey::new("Winamax", "6-Max", 2);

        store
            .save(Some(&scope_a), &Region::new("carte_1", 10, 10, 100, 150))
            .unwrap();
        store
            .save(Some(&scope_b), &Region::new("carte_1", 500, 10, 100, 150))
            .unwrap();
        store
            .save(None, &Region::new("carte_1", 0, 0, 30, 30))
            .unwrap();

        assert_eq!(store.load(Some(&scope_a)).unwrap()[0].x, 10);
        assert_eq!(store.load(Some(&scope_b)).unwrap()[0].x, 500);
        assert_eq!(store.load(None).unwrap()[0].x, 0);
    }

    #[test]
    fn test_delete() {
        let store = RegionStore::open_in_memory().unwrap();
        store
            .save(None, &Region::new("seat1", 0, 0, 50, 50))
            .unwrap();

        assert!(store.delete(None, "seat1").unwrap());
        assert!(!store.delete(None, "seat1").unwrap());
        assert!(store.load(None).unwrap().is_empty());
    }

    #[test]
    fn test_load_preserves_insertion_order_across_updates() {
        let store = RegionStore::open_in_memory().unwrap();
        store
            .save(None, &Region::new("first", 0, 0, 50, 50))
            .unwrap();
        store
            .save(None, &Region::new("second", 0, 0, 50, 50))
            .unwrap();
        // Updating the first region must not move it to the end
        store
            .save(None, &Region::new("first", 5, 5, 50, 50))
            .unwrap();

        let labels: Vec<_> = store
            .load(None)
            .unwrap()
            .into_iter()
            .map(|r| r.label)
            .collect();
        assert_eq!(labels, vec!["first", "second"]);
    }

    #[test]
    fn test_json_export_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regions.json");

        let store = RegionStore::open_in_memory().unwrap();
        store
            .save(None, &Region::new("seat1", 100, 100, 50, 50))
            .unwrap();
        store
            .save(None, &Region::new("seat2", 10, 20, 30, 40))
            .unwrap();
        store.export_json(None, &path).unwrap();

        let other = RegionStore::open_in_memory().unwrap();
        let imported = other.import_json(None, &path).unwrap();

        assert_eq!(imported, other.load(None).unwrap());
        assert_eq!(imported[0], Region::new("seat1", 100, 100, 50, 50));
        assert_eq!(imported[1], Region::new("seat2", 10, 20, 30, 40));
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("regions.db");

        let store = RegionStore::open(&path).unwrap();
        store
            .save(None, &Region::new("seat1", 0, 0, 50, 50))
            .unwrap();
        assert!(path.exists());
    }
}
