//! SQLite-backed storage for deployed-file fingerprints.
//!
//! One row per file path, plus an append-only list of build manifests of
//! which exactly one is marked latest. The schema is private to this module;
//! everything else goes through [`BuildCache`].

use std::collections::BTreeMap;

use camino::Utf8Path;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use derive_more::Debug;
use jiff::Timestamp;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::instrument;

use crate::hash::Blake3;

/// Name of the cache directory at the site root.
pub const CACHE_DIR: &str = ".walgo-cache";

/// The durable fingerprint of one file at one point in time.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct FileRecord {
    /// Relative path, forward-slash normalized. Unique per store.
    pub path: String,
    /// Fingerprint of the file's bytes at last finalization.
    pub hash: Blake3,
    /// Size in bytes.
    pub size: u64,
    /// Modification timestamp at last finalization.
    pub mtime: Option<Timestamp>,
    /// Identifier of the uploaded blob, once known.
    pub blob_id: Option<String>,
    /// When the file was last part of a successful deployment.
    pub last_deployed: Option<Timestamp>,
}

impl FileRecord {
    /// Check the path invariants: non-empty, no `..` segments, and not
    /// inside the cache directory itself.
    fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            bail!("file record path is empty");
        }
        if self.path.split('/').any(|segment| segment == "..") {
            bail!("file record path contains a parent traversal: {}", self.path);
        }
        if self.path == CACHE_DIR || self.path.starts_with(&format!("{CACHE_DIR}/")) {
            bail!("file record path is inside the cache directory: {}", self.path);
        }
        Ok(())
    }
}

/// Metadata for one deployed build manifest.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ManifestMeta {
    pub id: i64,
    pub site_root: String,
    pub created_at: Timestamp,
    pub project_id: String,
    pub deployment_id: String,
}

/// SQLite-backed build cache for one site.
#[derive(Debug)]
pub struct BuildCache {
    #[debug("<connection>")]
    conn: Connection,
}

impl BuildCache {
    /// Open or create the cache for the provided site root.
    #[instrument(name = "BuildCache::open", skip(site_root))]
    pub fn open(site_root: impl AsRef<Utf8Path>) -> Result<Self> {
        let dir = site_root.as_ref().join(CACHE_DIR);

        // Use std::fs here since this runs synchronously at startup.
        #[allow(clippy::disallowed_methods)]
        std::fs::create_dir_all(&dir).with_context(|| format!("create cache directory {dir:?}"))?;

        let path = dir.join("cache.db");
        let conn =
            Connection::open(&path).with_context(|| format!("open cache database at {path:?}"))?;

        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Create an in-memory cache for testing.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS files (
                    path TEXT PRIMARY KEY,
                    hash TEXT NOT NULL,
                    size INTEGER NOT NULL,
                    mtime TEXT,
                    blob_id TEXT,
                    last_deployed TEXT
                );

                CREATE TABLE IF NOT EXISTS manifests (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    site_root TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    project_id TEXT NOT NULL,
                    deployment_id TEXT NOT NULL,
                    latest INTEGER NOT NULL DEFAULT 0
                );

                CREATE INDEX IF NOT EXISTS idx_manifests_latest
                ON manifests(latest);
                "#,
            )
            .context("initialize cache schema")?;
        Ok(())
    }

    /// Insert or replace the record for one path.
    ///
    /// Idempotent. A row identical to the stored one is not rewritten, so
    /// write amplification is bounded by the number of files that changed.
    #[instrument(name = "BuildCache::upsert_file", skip(self, record), fields(path = %record.path))]
    pub fn upsert_file(&self, record: &FileRecord) -> Result<()> {
        record.validate()?;
        if self.get_file(&record.path)?.as_ref() == Some(record) {
            return Ok(());
        }

        self.conn
            .execute(
                r#"
                INSERT OR REPLACE INTO files
                (path, hash, size, mtime, blob_id, last_deployed)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    record.path,
                    record.hash.as_str(),
                    record.size as i64,
                    record.mtime.map(|t| t.to_string()),
                    record.blob_id,
                    record.last_deployed.map(|t| t.to_string()),
                ],
            )
            .context("insert file record")?;
        Ok(())
    }

    /// Fetch the record for one path. `None` means not cached.
    #[instrument(name = "BuildCache::get_file", skip(self))]
    pub fn get_file(&self, path: &str) -> Result<Option<FileRecord>> {
        self.conn
            .query_row(
                "SELECT path, hash, size, mtime, blob_id, last_deployed FROM files WHERE path = ?1",
                params![path],
                row_to_record,
            )
            .optional()
            .context("query file record")?
            .map(|record| record.context("parse file record"))
            .transpose()
    }

    /// List every stored record, ordered by path.
    #[instrument(name = "BuildCache::list_files", skip(self))]
    pub fn list_files(&self) -> Result<Vec<FileRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT path, hash, size, mtime, blob_id, last_deployed FROM files ORDER BY path",
            )
            .context("prepare list query")?;
        let rows = stmt.query_map([], row_to_record).context("execute list query")?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("read row")?.context("parse file record")?);
        }
        Ok(records)
    }

    /// The stored fingerprints, keyed by path. This is the previous side of
    /// the tree diff.
    #[instrument(name = "BuildCache::fingerprints", skip(self))]
    pub fn fingerprints(&self) -> Result<BTreeMap<String, Blake3>> {
        Ok(self
            .list_files()?
            .into_iter()
            .map(|record| (record.path, record.hash))
            .collect())
    }

    /// Append a manifest and mark it latest, demoting any previous latest in
    /// the same transaction. Earlier manifests are retained for audit but are
    /// never consulted by the change-set computer.
    #[instrument(name = "BuildCache::append_manifest", skip(self))]
    pub fn append_manifest(
        &mut self,
        site_root: &str,
        project_id: &str,
        deployment_id: &str,
    ) -> Result<ManifestMeta> {
        let created_at = Timestamp::now();
        let tx = self.conn.transaction().context("begin transaction")?;
        tx.execute("UPDATE manifests SET latest = 0 WHERE latest = 1", [])
            .context("demote previous manifest")?;
        tx.execute(
            r#"
            INSERT INTO manifests (site_root, created_at, project_id, deployment_id, latest)
            VALUES (?1, ?2, ?3, ?4, 1)
            "#,
            params![site_root, created_at.to_string(), project_id, deployment_id],
        )
        .context("insert manifest")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("commit manifest")?;

        Ok(ManifestMeta {
            id,
            site_root: site_root.to_string(),
            created_at,
            project_id: project_id.to_string(),
            deployment_id: deployment_id.to_string(),
        })
    }

    /// The manifest currently marked latest, if any.
    #[instrument(name = "BuildCache::latest_manifest", skip(self))]
    pub fn latest_manifest(&self) -> Result<Option<ManifestMeta>> {
        self.conn
            .query_row(
                r#"
                SELECT id, site_root, created_at, project_id, deployment_id
                FROM manifests WHERE latest = 1
                "#,
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("query latest manifest")?
            .map(|(id, site_root, created_at, project_id, deployment_id)| {
                Ok(ManifestMeta {
                    id,
                    site_root,
                    created_at: created_at.parse().context("parse manifest timestamp")?,
                    project_id,
                    deployment_id,
                })
            })
            .transpose()
    }

    /// Atomically replace changed rows, drop stale rows, and mark a new
    /// manifest latest, all in one transaction.
    ///
    /// This is the finalize operation: a deployment cancelled mid-write
    /// leaves the previous manifest latest and the previous rows intact.
    #[instrument(name = "BuildCache::commit_manifest", skip(self, records, remove))]
    pub fn commit_manifest(
        &mut self,
        site_root: &str,
        project_id: &str,
        deployment_id: &str,
        records: &[FileRecord],
        remove: &[String],
    ) -> Result<ManifestMeta> {
        for record in records {
            record.validate()?;
        }
        let created_at = Timestamp::now();

        let tx = self.conn.transaction().context("begin transaction")?;
        for path in remove {
            tx.execute("DELETE FROM files WHERE path = ?1", params![path])
                .context("delete stale row")?;
        }
        for record in records {
            tx.execute(
                r#"
                INSERT OR REPLACE INTO files
                (path, hash, size, mtime, blob_id, last_deployed)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    record.path,
                    record.hash.as_str(),
                    record.size as i64,
                    record.mtime.map(|t| t.to_string()),
                    record.blob_id,
                    record.last_deployed.map(|t| t.to_string()),
                ],
            )
            .context("insert file record")?;
        }
        tx.execute("UPDATE manifests SET latest = 0 WHERE latest = 1", [])
            .context("demote previous manifest")?;
        tx.execute(
            r#"
            INSERT INTO manifests (site_root, created_at, project_id, deployment_id, latest)
            VALUES (?1, ?2, ?3, ?4, 1)
            "#,
            params![site_root, created_at.to_string(), project_id, deployment_id],
        )
        .context("insert manifest")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("commit manifest")?;

        Ok(ManifestMeta {
            id,
            site_root: site_root.to_string(),
            created_at,
            project_id: project_id.to_string(),
            deployment_id: deployment_id.to_string(),
        })
    }

    /// Record the remote blob identifier for one path, stamping
    /// `last_deployed` to now in the same statement.
    #[instrument(name = "BuildCache::set_blob_id", skip(self))]
    pub fn set_blob_id(&self, path: &str, blob_id: &str) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE files SET blob_id = ?2, last_deployed = ?3 WHERE path = ?1",
                params![path, blob_id, Timestamp::now().to_string()],
            )
            .context("update blob id")?;
        if updated == 0 {
            bail!("no cached record for path: {path}");
        }
        Ok(())
    }

    /// Remove every row from the cache.
    #[instrument(name = "BuildCache::clear", skip(self))]
    pub fn clear(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("begin transaction")?;
        tx.execute("DELETE FROM files", []).context("delete files")?;
        tx.execute("DELETE FROM manifests", []).context("delete manifests")?;
        tx.commit().context("commit clear")?;
        Ok(())
    }

    /// Number of cached file records.
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))
            .context("count files")?;
        Ok(count as usize)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<FileRecord>> {
    let path = row.get::<_, String>(0)?;
    let hash = row.get::<_, String>(1)?;
    let size = row.get::<_, i64>(2)?;
    let mtime = row.get::<_, Option<String>>(3)?;
    let blob_id = row.get::<_, Option<String>>(4)?;
    let last_deployed = row.get::<_, Option<String>>(5)?;

    Ok((|| {
        Ok(FileRecord {
            path,
            hash: Blake3::from_hex(hash),
            size: size as u64,
            mtime: mtime.map(|t| t.parse()).transpose().context("parse mtime")?,
            blob_id,
            last_deployed: last_deployed
                .map(|t| t.parse())
                .transpose()
                .context("parse last_deployed")?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    fn record(path: &str, content: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            hash: Blake3::from_buffer(content),
            size: content.len() as u64,
            mtime: None,
            blob_id: None,
            last_deployed: None,
        }
    }

    #[test]
    fn round_trip() {
        let db = BuildCache::in_memory().unwrap();
        let rec = record("index.html", "<html>hi</html>");

        db.upsert_file(&rec).unwrap();
        assert_eq!(db.get_file("index.html").unwrap(), Some(rec));
        assert_eq!(db.get_file("missing.html").unwrap(), None);
    }

    #[test]
    fn upsert_is_idempotent_and_overwrites() {
        let db = BuildCache::in_memory().unwrap();
        db.upsert_file(&record("a.css", "v1")).unwrap();
        db.upsert_file(&record("a.css", "v1")).unwrap();
        db.upsert_file(&record("a.css", "v2")).unwrap();

        assert_eq!(db.count().unwrap(), 1);
        let stored = db.get_file("a.css").unwrap().unwrap();
        assert_eq!(stored.hash, Blake3::from_buffer("v2"));
    }

    #[test_case(""; "empty")]
    #[test_case("../escape.html"; "traversal prefix")]
    #[test_case("nested/../../escape"; "traversal inside")]
    #[test_case(".walgo-cache/cache.db"; "inside cache dir")]
    #[test]
    fn invalid_paths_are_rejected(path: &str) {
        let db = BuildCache::in_memory().unwrap();
        let rec = FileRecord {
            path: path.to_string(),
            ..record("placeholder", "content")
        };
        assert!(db.upsert_file(&rec).is_err());
    }

    #[test]
    fn only_one_manifest_is_latest() {
        let mut db = BuildCache::in_memory().unwrap();
        db.append_manifest("/site", "proj-1", "deploy-1").unwrap();
        let second = db.append_manifest("/site", "proj-1", "deploy-2").unwrap();

        let latest = db.latest_manifest().unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(latest.deployment_id, "deploy-2");
    }

    #[test]
    fn set_blob_id_stamps_last_deployed() {
        let db = BuildCache::in_memory().unwrap();
        db.upsert_file(&record("index.html", "<html>hi</html>")).unwrap();

        db.set_blob_id("index.html", "0xabc123").unwrap();
        let stored = db.get_file("index.html").unwrap().unwrap();
        assert_eq!(stored.blob_id.as_deref(), Some("0xabc123"));
        assert!(stored.last_deployed.is_some());

        assert!(db.set_blob_id("missing.html", "0xabc").is_err());
    }

    #[test]
    fn clear_removes_everything() {
        let mut db = BuildCache::in_memory().unwrap();
        db.upsert_file(&record("index.html", "x")).unwrap();
        db.append_manifest("/site", "p", "d").unwrap();

        db.clear().unwrap();
        assert_eq!(db.count().unwrap(), 0);
        assert_eq!(db.latest_manifest().unwrap(), None);
    }
}
