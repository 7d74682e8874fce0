//! Persistent geocode cache.
//!
//! Keyed by (region, normalized query). The region scope is load-bearing:
//! "12 MAIN STREET" exists in most towns, and a cached coordinate from one
//! region must never be reused for another. Not-found results are cached
//! explicitly so repeated misses stay off the network. Entries persist across
//! runs until explicitly invalidated.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::geometry::Coordinate;

/// One cached resolution, found or not.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub coordinate: Option<Coordinate>,
    pub provider: String,
    pub resolved_at: DateTime<Utc>,
}

/// SQLite-backed geocode cache. Shares the store's database file.
pub struct GeocodeCache {
    db_path: PathBuf,
}

impl GeocodeCache {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let cache = Self {
            db_path: db_path.to_path_buf(),
        };
        cache.init_schema()?;
        Ok(cache)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        Connection::open(&self.db_path)
            .map_err(|e| StoreError::Unreachable(format!("{}: {e}", self.db_path.display())))
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS geocode_cache (
                region TEXT NOT NULL,
                query TEXT NOT NULL,
                latitude REAL,
                longitude REAL,
                found INTEGER NOT NULL,
                provider TEXT NOT NULL,
                resolved_at TEXT NOT NULL,
                PRIMARY KEY (region, query)
            );
        "#,
        )?;
        Ok(())
    }

    /// Look up a cached resolution for (region, query).
    pub fn get(&self, region: &str, query: &str) -> Result<Option<CacheEntry>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT latitude, longitude, found, provider, resolved_at
             FROM geocode_cache WHERE region = ?1 AND query = ?2",
        )?;
        let entry = stmt
            .query_row(params![region, query], |row| {
                let found: bool = row.get("found")?;
                let coordinate = if found {
                    Some(Coordinate {
                        latitude: row.get("latitude")?,
                        longitude: row.get("longitude")?,
                    })
                } else {
                    None
                };
                Ok(CacheEntry {
                    coordinate,
                    provider: row.get("provider")?,
                    resolved_at: parse_datetime(&row.get::<_, String>("resolved_at")?),
                })
            })
            .optional()?;
        Ok(entry)
    }

    /// Record a resolution (or explicit not-found) for (region, query).
    pub fn put(
        &self,
        region: &str,
        query: &str,
        coordinate: Option<Coordinate>,
        provider: &str,
    ) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO geocode_cache (region, query, latitude, longitude, found, provider, resolved_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(region, query) DO UPDATE SET
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                found = excluded.found,
                provider = excluded.provider,
                resolved_at = excluded.resolved_at
            "#,
            params![
                region,
                query,
                coordinate.map(|c| c.latitude),
                coordinate.map(|c| c.longitude),
                coordinate.is_some(),
                provider,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Drop every cached entry for one region. Returns the number removed.
    pub fn invalidate_region(&self, region: &str) -> Result<usize, StoreError> {
        let conn = self.connect()?;
        let rows = conn.execute("DELETE FROM geocode_cache WHERE region = ?1", params![region])?;
        Ok(rows)
    }

    /// Cached entry count for one region.
    pub fn count(&self, region: &str) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM geocode_cache WHERE region = ?1",
            params![region],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_round_trip() {
        let dir = tempdir().unwrap();
        let cache = GeocodeCache::open(&dir.path().join("cache.db")).unwrap();

        let coord = Coordinate {
            latitude: 41.8,
            longitude: -72.8,
        };
        cache.put("avon", "12 MAIN STREET", Some(coord), "test").unwrap();

        let entry = cache.get("avon", "12 MAIN STREET").unwrap().unwrap();
        assert_eq!(entry.coordinate, Some(coord));
        assert_eq!(entry.provider, "test");
    }

    #[test]
    fn test_not_found_is_cached() {
        let dir = tempdir().unwrap();
        let cache = GeocodeCache::open(&dir.path().join("cache.db")).unwrap();

        cache.put("avon", "NOWHERE LANE", None, "test").unwrap();
        let entry = cache.get("avon", "NOWHERE LANE").unwrap().unwrap();
        assert_eq!(entry.coordinate, None);
    }

    #[test]
    fn test_region_scoping() {
        let dir = tempdir().unwrap();
        let cache = GeocodeCache::open(&dir.path().join("cache.db")).unwrap();

        let avon = Coordinate {
            latitude: 41.8,
            longitude: -72.8,
        };
        let bethel = Coordinate {
            latitude: 41.37,
            longitude: -73.41,
        };
        cache.put("avon", "12 MAIN STREET", Some(avon), "test").unwrap();
        cache.put("bethel", "12 MAIN STREET", Some(bethel), "test").unwrap();

        let a = cache.get("avon", "12 MAIN STREET").unwrap().unwrap();
        let b = cache.get("bethel", "12 MAIN STREET").unwrap().unwrap();
        assert_eq!(a.coordinate, Some(avon));
        assert_eq!(b.coordinate, Some(bethel));
    }

    #[test]
    fn test_invalidate_region_leaves_others() {
        let dir = tempdir().unwrap();
        let cache = GeocodeCache::open(&dir.path().join("cache.db")).unwrap();

        let coord = Coordinate {
            latitude: 41.0,
            longitude: -72.0,
        };
        cache.put("avon", "A", Some(coord), "test").unwrap();
        cache.put("avon", "B", None, "test").unwrap();
        cache.put("bethel", "A", Some(coord), "test").unwrap();

        assert_eq!(cache.invalidate_region("avon").unwrap(), 2);
        assert_eq!(cache.count("avon").unwrap(), 0);
        assert_eq!(cache.count("bethel").unwrap(), 1);
    }
}
