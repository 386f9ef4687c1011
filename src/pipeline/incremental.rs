//! Incremental build cache
//!
//! Persistent record of what was built from which bytes: per-asset content
//! hashes and collaborator identities, per-asset dependency lists with a
//! reverse index, a mod-time-gated file hash cache, and the mapping from
//! source URIs to the assets they produced. Backed by SQLite in WAL mode
//! with cached prepared statements; one writer at a time.

use std::path::Path;
use std::time::UNIX_EPOCH;

use rusqlite::{params, Connection, OptionalExtension};
use rustc_hash::FxHashSet;

use crate::error::{Error, Result};
use crate::hashing::hash64;
use crate::id::{AssetId, Uuid};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache_entries (
    asset_id BLOB PRIMARY KEY,
    logical_name TEXT NOT NULL,
    variant_key TEXT,
    source_hash INTEGER,
    deps_hash INTEGER,
    intermediate_hash INTEGER,
    cooked_hash INTEGER,
    options_hash INTEGER,
    importer_name TEXT,
    importer_version TEXT,
    cooker_name TEXT,
    cooker_version TEXT,
    timestamp INTEGER DEFAULT (strftime('%s', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_logical_name ON cache_entries(logical_name);

CREATE TABLE IF NOT EXISTS dependencies (
    asset_id BLOB NOT NULL,
    dependency_path TEXT NOT NULL,
    file_hash INTEGER,
    last_modified INTEGER,
    dependency_kind TEXT DEFAULT 'file',
    PRIMARY KEY (asset_id, dependency_path)
);
CREATE INDEX IF NOT EXISTS idx_dep_path ON dependencies(dependency_path);

CREATE TABLE IF NOT EXISTS reverse_dependencies (
    dependency_path TEXT NOT NULL,
    dependent_asset_id BLOB NOT NULL,
    PRIMARY KEY (dependency_path, dependent_asset_id)
);
CREATE INDEX IF NOT EXISTS idx_rev_dep_asset ON reverse_dependencies(dependent_asset_id);

CREATE TABLE IF NOT EXISTS file_hashes (
    file_path TEXT PRIMARY KEY,
    file_hash INTEGER,
    last_modified INTEGER
);

CREATE TABLE IF NOT EXISTS source_assets (
    source_uri TEXT NOT NULL,
    asset_id BLOB NOT NULL,
    PRIMARY KEY (source_uri, asset_id)
);
CREATE INDEX IF NOT EXISTS idx_source_uri ON source_assets(source_uri);
";

/// One asset's build fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheEntryRecord {
    pub asset_id: AssetId,
    pub logical_name: String,
    pub variant_key: String,
    pub source_hash: u64,
    pub deps_hash: u64,
    pub intermediate_hash: u64,
    pub cooked_hash: u64,
    pub options_hash: u64,
    pub importer_name: String,
    pub importer_version: String,
    pub cooker_name: String,
    pub cooker_version: String,
}

/// One recorded dependency of an asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRecord {
    pub path: String,
    pub file_hash: u64,
    pub last_modified: i64,
    pub kind: String,
}

fn sql_err(e: rusqlite::Error) -> Error {
    Error::Io(format!("incremental cache: {e}"))
}

fn mod_time_of(path: &str) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Hash a file's full contents. Missing files hash to zero, which never
/// matches a real content hash.
pub fn hash_file(path: impl AsRef<Path>) -> u64 {
    std::fs::read(path.as_ref()).map(|b| hash64(&b)).unwrap_or(0)
}

/// SQLite-backed build cache.
pub struct IncrementalCache {
    conn: Connection,
}

impl IncrementalCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(sql_err)?;
        Self::init(conn)
    }

    /// Private in-memory cache, mainly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(IncrementalCache { conn })
    }

    // ---- cache entries ----

    pub fn get(&self, id: AssetId) -> Result<Option<CacheEntryRecord>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT logical_name, variant_key, source_hash, deps_hash, intermediate_hash,
                        cooked_hash, options_hash, importer_name, importer_version,
                        cooker_name, cooker_version
                 FROM cache_entries WHERE asset_id = ?1",
            )
            .map_err(sql_err)?;

        stmt.query_row(params![id.0.as_slice()], |row| {
            Ok(CacheEntryRecord {
                asset_id: id,
                logical_name: row.get(0)?,
                variant_key: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                source_hash: row.get::<_, i64>(2)? as u64,
                deps_hash: row.get::<_, i64>(3)? as u64,
                intermediate_hash: row.get::<_, i64>(4)? as u64,
                cooked_hash: row.get::<_, i64>(5)? as u64,
                options_hash: row.get::<_, i64>(6)? as u64,
                importer_name: row.get(7)?,
                importer_version: row.get(8)?,
                cooker_name: row.get(9)?,
                cooker_version: row.get(10)?,
            })
        })
        .optional()
        .map_err(sql_err)
    }

    pub fn put(&self, entry: &CacheEntryRecord) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "INSERT OR REPLACE INTO cache_entries (
                    asset_id, logical_name, variant_key, source_hash, deps_hash,
                    intermediate_hash, cooked_hash, options_hash,
                    importer_name, importer_version, cooker_name, cooker_version
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )
            .map_err(sql_err)?;

        stmt.execute(params![
            entry.asset_id.0.as_slice(),
            entry.logical_name,
            entry.variant_key,
            entry.source_hash as i64,
            entry.deps_hash as i64,
            entry.intermediate_hash as i64,
            entry.cooked_hash as i64,
            entry.options_hash as i64,
            entry.importer_name,
            entry.importer_version,
            entry.cooker_name,
            entry.cooker_version,
        ])
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn remove(&self, id: AssetId) -> Result<()> {
        self.remove_dependencies(id)?;
        self.conn
            .prepare_cached("DELETE FROM cache_entries WHERE asset_id = ?1")
            .map_err(sql_err)?
            .execute(params![id.0.as_slice()])
            .map_err(sql_err)?;
        self.conn
            .prepare_cached("DELETE FROM source_assets WHERE asset_id = ?1")
            .map_err(sql_err)?
            .execute(params![id.0.as_slice()])
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn entry_count(&self) -> Result<u64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as u64)
            .map_err(sql_err)
    }

    // ---- dependencies ----

    pub fn add_dependency(&self, id: AssetId, path: &str, kind: &str) -> Result<()> {
        let file_hash = hash_file(path);
        let last_modified = mod_time_of(path);

        self.conn
            .prepare_cached(
                "INSERT OR REPLACE INTO dependencies
                 (asset_id, dependency_path, file_hash, last_modified, dependency_kind)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .map_err(sql_err)?
            .execute(params![
                id.0.as_slice(),
                path,
                file_hash as i64,
                last_modified,
                kind
            ])
            .map_err(sql_err)?;

        self.conn
            .prepare_cached(
                "INSERT OR IGNORE INTO reverse_dependencies (dependency_path, dependent_asset_id)
                 VALUES (?1, ?2)",
            )
            .map_err(sql_err)?
            .execute(params![path, id.0.as_slice()])
            .map_err(sql_err)?;

        Ok(())
    }

    /// Replace an asset's dependency list.
    pub fn set_dependencies(&self, id: AssetId, paths: &[String], kind: &str) -> Result<()> {
        self.remove_dependencies(id)?;
        for path in paths {
            self.add_dependency(id, path, kind)?;
        }
        Ok(())
    }

    pub fn dependencies(&self, id: AssetId) -> Result<Vec<DependencyRecord>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT dependency_path, file_hash, last_modified, dependency_kind
                 FROM dependencies WHERE asset_id = ?1",
            )
            .map_err(sql_err)?;

        let rows = stmt
            .query_map(params![id.0.as_slice()], |row| {
                Ok(DependencyRecord {
                    path: row.get(0)?,
                    file_hash: row.get::<_, i64>(1)? as u64,
                    last_modified: row.get(2)?,
                    kind: row.get(3)?,
                })
            })
            .map_err(sql_err)?;

        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(sql_err)
    }

    pub fn remove_dependencies(&self, id: AssetId) -> Result<()> {
        self.conn
            .prepare_cached("DELETE FROM reverse_dependencies WHERE dependent_asset_id = ?1")
            .map_err(sql_err)?
            .execute(params![id.0.as_slice()])
            .map_err(sql_err)?;
        self.conn
            .prepare_cached("DELETE FROM dependencies WHERE asset_id = ?1")
            .map_err(sql_err)?
            .execute(params![id.0.as_slice()])
            .map_err(sql_err)?;
        Ok(())
    }

    /// Every asset that recorded `path` as a dependency.
    pub fn dependents_of(&self, path: &str) -> Result<Vec<AssetId>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT dependent_asset_id FROM reverse_dependencies WHERE dependency_path = ?1",
            )
            .map_err(sql_err)?;

        let rows = stmt
            .query_map(params![path], |row| {
                let blob: Vec<u8> = row.get(0)?;
                let mut bytes = [0u8; 16];
                if blob.len() == 16 {
                    bytes.copy_from_slice(&blob);
                }
                Ok(Uuid(bytes))
            })
            .map_err(sql_err)?;

        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(sql_err)
    }

    /// True when any recorded dependency's current content hash differs
    /// from the recorded one, or the dependency vanished.
    pub fn has_dependency_changed(&self, id: AssetId) -> Result<bool> {
        for dep in self.dependencies(id)? {
            if !Path::new(&dep.path).exists() {
                return Ok(true);
            }
            if hash_file(&dep.path) != dep.file_hash {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Order-independent combined hash of an asset's dependencies.
    pub fn dependencies_hash(&self, id: AssetId) -> Result<u64> {
        let mut deps = self.dependencies(id)?;
        if deps.is_empty() {
            return Ok(0);
        }
        deps.sort_by(|a, b| a.path.cmp(&b.path));

        let mut combined: u64 = 0;
        for dep in &deps {
            combined ^= dep.file_hash;
            combined = combined.rotate_left(7);
        }
        Ok(combined)
    }

    pub fn dependency_count(&self) -> Result<u64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM dependencies", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as u64)
            .map_err(sql_err)
    }

    // ---- file hash cache ----

    /// Content hash of a file, served from the cache while the file's
    /// modification time is unchanged.
    pub fn cached_file_hash(&self, path: &str) -> Result<u64> {
        let cached: Option<(i64, i64)> = self
            .conn
            .prepare_cached("SELECT file_hash, last_modified FROM file_hashes WHERE file_path = ?1")
            .map_err(sql_err)?
            .query_row(params![path], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()
            .map_err(sql_err)?;

        let current_mod_time = mod_time_of(path);
        if let Some((hash, last_modified)) = cached {
            if last_modified == current_mod_time && current_mod_time != 0 {
                return Ok(hash as u64);
            }
        }

        let hash = hash_file(path);
        self.conn
            .prepare_cached(
                "INSERT OR REPLACE INTO file_hashes (file_path, file_hash, last_modified)
                 VALUES (?1, ?2, ?3)",
            )
            .map_err(sql_err)?
            .execute(params![path, hash as i64, current_mod_time])
            .map_err(sql_err)?;
        Ok(hash)
    }

    // ---- source to asset mapping ----

    /// Record which assets a source produced; powers append-mode builds
    /// that only re-cook changed sources.
    pub fn record_source_assets(&self, source_uri: &str, ids: &[AssetId]) -> Result<()> {
        self.conn
            .prepare_cached("DELETE FROM source_assets WHERE source_uri = ?1")
            .map_err(sql_err)?
            .execute(params![source_uri])
            .map_err(sql_err)?;
        for id in ids {
            self.conn
                .prepare_cached(
                    "INSERT OR IGNORE INTO source_assets (source_uri, asset_id) VALUES (?1, ?2)",
                )
                .map_err(sql_err)?
                .execute(params![source_uri, id.0.as_slice()])
                .map_err(sql_err)?;
        }
        Ok(())
    }

    pub fn assets_for_source(&self, source_uri: &str) -> Result<Vec<AssetId>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT asset_id FROM source_assets WHERE source_uri = ?1")
            .map_err(sql_err)?;

        let rows = stmt
            .query_map(params![source_uri], |row| {
                let blob: Vec<u8> = row.get(0)?;
                let mut bytes = [0u8; 16];
                if blob.len() == 16 {
                    bytes.copy_from_slice(&blob);
                }
                Ok(Uuid(bytes))
            })
            .map_err(sql_err)?;

        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(sql_err)
    }

    // ---- rebuild decisions ----

    /// True when `candidate` must be rebuilt given the recorded state.
    /// Compares source, dependency and option hashes plus importer and
    /// cooker identity; a dependency content check is separate
    /// ([`IncrementalCache::has_dependency_changed`]).
    pub fn needs_rebuild(candidate: &CacheEntryRecord, recorded: Option<&CacheEntryRecord>) -> bool {
        let Some(old) = recorded else {
            return true;
        };
        candidate.source_hash != old.source_hash
            || candidate.deps_hash != old.deps_hash
            || candidate.options_hash != old.options_hash
            || candidate.importer_name != old.importer_name
            || candidate.importer_version != old.importer_version
            || candidate.cooker_name != old.cooker_name
            || candidate.cooker_version != old.cooker_version
    }

    /// Full rebuild predicate for a known asset: fingerprint comparison
    /// plus on-disk dependency verification.
    pub fn needs_rebuild_with_dependencies(
        &self,
        candidate: &CacheEntryRecord,
    ) -> Result<bool> {
        let recorded = self.get(candidate.asset_id)?;
        if Self::needs_rebuild(candidate, recorded.as_ref()) {
            return Ok(true);
        }
        self.has_dependency_changed(candidate.asset_id)
    }

    /// Drop entries for assets no longer in the live set. Returns how
    /// many were removed.
    pub fn prune_stale(&self, valid_ids: &[AssetId]) -> Result<usize> {
        let valid: FxHashSet<[u8; 16]> = valid_ids.iter().map(|id| id.0).collect();

        let all: Vec<AssetId> = {
            let mut stmt = self
                .conn
                .prepare_cached("SELECT asset_id FROM cache_entries")
                .map_err(sql_err)?;
            let rows = stmt
                .query_map([], |row| {
                    let blob: Vec<u8> = row.get(0)?;
                    let mut bytes = [0u8; 16];
                    if blob.len() == 16 {
                        bytes.copy_from_slice(&blob);
                    }
                    Ok(Uuid(bytes))
                })
                .map_err(sql_err)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(sql_err)?
        };

        let mut removed = 0;
        for id in all {
            if !valid.contains(&id.0) {
                self.remove(id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ---- transactions ----

    pub fn begin_transaction(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN").map_err(sql_err)
    }

    pub fn commit_transaction(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT").map_err(sql_err)
    }

    pub fn rollback_transaction(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK").map_err(sql_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Uuid;
    use std::io::Write;

    fn entry(id: AssetId, source_hash: u64) -> CacheEntryRecord {
        CacheEntryRecord {
            asset_id: id,
            logical_name: "textures/stone".to_string(),
            variant_key: String::new(),
            source_hash,
            deps_hash: 0,
            intermediate_hash: 1,
            cooked_hash: 2,
            options_hash: 3,
            importer_name: "imp".to_string(),
            importer_version: "1.0".to_string(),
            cooker_name: "cook".to_string(),
            cooker_version: "1.0".to_string(),
        }
    }

    #[test]
    fn put_get_remove() {
        let cache = IncrementalCache::open_in_memory().unwrap();
        let id = Uuid::new_v4();

        assert!(cache.get(id).unwrap().is_none());
        cache.put(&entry(id, 42)).unwrap();

        let loaded = cache.get(id).unwrap().unwrap();
        assert_eq!(loaded.source_hash, 42);
        assert_eq!(loaded.logical_name, "textures/stone");
        assert_eq!(cache.entry_count().unwrap(), 1);

        cache.remove(id).unwrap();
        assert!(cache.get(id).unwrap().is_none());
    }

    #[test]
    fn needs_rebuild_matrix() {
        let id = Uuid::new_v4();
        let old = entry(id, 42);

        assert!(IncrementalCache::needs_rebuild(&old, None));
        assert!(!IncrementalCache::needs_rebuild(&old, Some(&old)));

        let mut changed = old.clone();
        changed.source_hash = 43;
        assert!(IncrementalCache::needs_rebuild(&changed, Some(&old)));

        let mut changed = old.clone();
        changed.options_hash = 99;
        assert!(IncrementalCache::needs_rebuild(&changed, Some(&old)));

        let mut changed = old.clone();
        changed.cooker_version = "2.0".to_string();
        assert!(IncrementalCache::needs_rebuild(&changed, Some(&old)));

        let mut changed = old.clone();
        changed.importer_name = "other".to_string();
        assert!(IncrementalCache::needs_rebuild(&changed, Some(&old)));
    }

    #[test]
    fn dependency_tracking_roundtrip() {
        let cache = IncrementalCache::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        cache.put(&entry(id, 1)).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"dependency contents").unwrap();
        file.flush().unwrap();
        let dep_path = file.path().to_string_lossy().to_string();

        cache
            .set_dependencies(id, std::slice::from_ref(&dep_path), "file")
            .unwrap();

        let deps = cache.dependencies(id).unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].file_hash, hash_file(file.path()));

        let dependents = cache.dependents_of(&dep_path).unwrap();
        assert_eq!(dependents, vec![id]);

        assert!(!cache.has_dependency_changed(id).unwrap());

        file.write_all(b" more").unwrap();
        file.flush().unwrap();
        assert!(cache.has_dependency_changed(id).unwrap());
    }

    #[test]
    fn vanished_dependency_forces_rebuild() {
        let cache = IncrementalCache::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        cache.put(&entry(id, 1)).unwrap();

        let file = tempfile::NamedTempFile::new().unwrap();
        let dep_path = file.path().to_string_lossy().to_string();
        cache.set_dependencies(id, &[dep_path], "file").unwrap();

        drop(file);
        assert!(cache.has_dependency_changed(id).unwrap());
        assert!(cache.needs_rebuild_with_dependencies(&entry(id, 1)).unwrap());
    }

    #[test]
    fn dependencies_hash_is_order_independent() {
        let cache = IncrementalCache::open_in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut f1 = tempfile::NamedTempFile::new().unwrap();
        let mut f2 = tempfile::NamedTempFile::new().unwrap();
        f1.write_all(b"one").unwrap();
        f2.write_all(b"two").unwrap();
        f1.flush().unwrap();
        f2.flush().unwrap();
        let p1 = f1.path().to_string_lossy().to_string();
        let p2 = f2.path().to_string_lossy().to_string();

        cache.set_dependencies(a, &[p1.clone(), p2.clone()], "file").unwrap();
        cache.set_dependencies(b, &[p2, p1], "file").unwrap();

        assert_eq!(
            cache.dependencies_hash(a).unwrap(),
            cache.dependencies_hash(b).unwrap()
        );
        assert_ne!(cache.dependencies_hash(a).unwrap(), 0);
    }

    #[test]
    fn file_hash_cache_tracks_mod_time() {
        let cache = IncrementalCache::open_in_memory().unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"cached contents").unwrap();
        file.flush().unwrap();
        let path = file.path().to_string_lossy().to_string();

        let first = cache.cached_file_hash(&path).unwrap();
        assert_eq!(first, hash_file(file.path()));
        assert_eq!(cache.cached_file_hash(&path).unwrap(), first);
    }

    #[test]
    fn source_asset_mapping() {
        let cache = IncrementalCache::open_in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        cache.record_source_assets("src/atlas.png", &[a, b]).unwrap();
        let ids = cache.assets_for_source("src/atlas.png").unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a) && ids.contains(&b));

        // Re-recording replaces the mapping.
        cache.record_source_assets("src/atlas.png", &[a]).unwrap();
        assert_eq!(cache.assets_for_source("src/atlas.png").unwrap(), vec![a]);
        assert!(cache.assets_for_source("src/other.png").unwrap().is_empty());
    }

    #[test]
    fn prune_stale_entries() {
        let cache = IncrementalCache::open_in_memory().unwrap();
        let keep = Uuid::new_v4();
        let stale = Uuid::new_v4();
        cache.put(&entry(keep, 1)).unwrap();
        cache.put(&entry(stale, 2)).unwrap();

        let removed = cache.prune_stale(&[keep]).unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get(keep).unwrap().is_some());
        assert!(cache.get(stale).unwrap().is_none());
    }

    #[test]
    fn transactions_group_writes() {
        let cache = IncrementalCache::open_in_memory().unwrap();
        let id = Uuid::new_v4();

        cache.begin_transaction().unwrap();
        cache.put(&entry(id, 1)).unwrap();
        cache.rollback_transaction().unwrap();
        assert!(cache.get(id).unwrap().is_none());

        cache.begin_transaction().unwrap();
        cache.put(&entry(id, 1)).unwrap();
        cache.commit_transaction().unwrap();
        assert!(cache.get(id).unwrap().is_some());
    }
}
