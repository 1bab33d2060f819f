//! SQLite-backed implementation of the store façade.
//!
//! A single connection behind a mutex is plenty for a gateway whose
//! metadata operations are short point queries; the interesting volume
//! (file bytes) never touches this database.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::warn;
use uuid::Uuid;

use lattice_model::{vpath, FileRecord, ProjectRecord, UserRecord, DIRECTORY_MIME};

use crate::error::{Result, StoreError};
use crate::traits::{ConversionJob, ConversionStore, FileStore, ProjectStore, UserStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    slug          TEXT NOT NULL UNIQUE,
    name          TEXT NOT NULL,
    password_hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS projects (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL,
    slug       TEXT NOT NULL UNIQUE,
    owner_id   INTEGER NOT NULL REFERENCES users(id),
    size       INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS project_members (
    project_id INTEGER NOT NULL REFERENCES projects(id),
    user_id    INTEGER NOT NULL REFERENCES users(id),
    PRIMARY KEY (project_id, user_id)
);

CREATE TABLE IF NOT EXISTS files (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid         TEXT NOT NULL,
    project_id   INTEGER NOT NULL REFERENCES projects(id),
    directory_id INTEGER REFERENCES files(id),
    owner_id     INTEGER NOT NULL REFERENCES users(id),
    name         TEXT NOT NULL,
    path         TEXT,
    mime_type    TEXT NOT NULL,
    size         INTEGER NOT NULL DEFAULT 0,
    checksum     TEXT NOT NULL DEFAULT '',
    is_current   INTEGER NOT NULL DEFAULT 0,
    version      INTEGER NOT NULL DEFAULT 1,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_files_location ON files(project_id, directory_id, name);
CREATE INDEX IF NOT EXISTS idx_files_path ON files(project_id, path);
CREATE INDEX IF NOT EXISTS idx_files_checksum ON files(project_id, checksum);

CREATE TABLE IF NOT EXISTS conversion_jobs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id    INTEGER NOT NULL REFERENCES files(id),
    status     TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL
);
";

const FILE_COLUMNS: &str = "id, uuid, project_id, directory_id, owner_id, name, path, \
                            mime_type, size, checksum, is_current, version, created_at, updated_at";

const PROJECT_COLUMNS: &str = "id, name, slug, owner_id, size, created_at, updated_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the metadata database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// An in-memory database, used by the test suites as the store fake.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("store connection mutex poisoned".to_string()))
    }

    /// Register an account. Bootstrap/fixture operation; the gateway
    /// itself only ever reads users.
    pub fn create_user(&self, slug: &str, name: &str, password_hash: &str) -> Result<UserRecord> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (slug, name, password_hash) VALUES (?1, ?2, ?3)",
            params![slug, name, password_hash],
        )?;
        Ok(UserRecord {
            id: conn.last_insert_rowid(),
            slug: slug.to_string(),
            name: name.to_string(),
            password_hash: password_hash.to_string(),
        })
    }

    /// Register a project together with its root directory row.
    pub fn create_project(&self, name: &str, slug: &str, owner_id: i64) -> Result<ProjectRecord> {
        let now = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO projects (name, slug, owner_id, size, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 0, ?4, ?4)",
            params![name, slug, owner_id, now],
        )?;
        let project_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO files (uuid, project_id, directory_id, owner_id, name, path, \
                                mime_type, is_current, version, created_at, updated_at) \
             VALUES (?1, ?2, NULL, ?3, '/', '/', ?4, 1, 1, ?5, ?5)",
            params![Uuid::new_v4().to_string(), project_id, owner_id, DIRECTORY_MIME, now],
        )?;
        Ok(ProjectRecord {
            id: project_id,
            name: name.to_string(),
            slug: slug.to_string(),
            owner_id,
            size: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn add_project_member(&self, project_id: i64, user_id: i64) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO project_members (project_id, user_id) VALUES (?1, ?2)",
            params![project_id, user_id],
        )?;
        Ok(())
    }

    /// Number of queued conversion jobs; used by the test suites.
    pub fn conversion_job_count(&self) -> Result<i64> {
        Ok(self
            .conn()?
            .query_row("SELECT COUNT(*) FROM conversion_jobs", [], |row| row.get(0))?)
    }

    fn dir_by_path(conn: &Connection, project_id: i64, path: &str) -> Result<Option<FileRecord>> {
        let canonical = vpath::canonicalize(path);
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files \
             WHERE project_id = ?1 AND path = ?2 AND mime_type = ?3 AND is_current = 1"
        );
        Ok(conn
            .query_row(&sql, params![project_id, canonical, DIRECTORY_MIME], file_from_row)
            .optional()?)
    }

    fn file_by_id(conn: &Connection, id: i64) -> Result<FileRecord> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], file_from_row)?)
    }

    fn insert_dir(
        conn: &Connection,
        project_id: i64,
        parent_id: i64,
        owner_id: i64,
        path: &str,
    ) -> Result<FileRecord> {
        let now = Utc::now();
        conn.execute(
            "INSERT INTO files (uuid, project_id, directory_id, owner_id, name, path, \
                                mime_type, is_current, version, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, 1, ?8, ?8)",
            params![
                Uuid::new_v4().to_string(),
                project_id,
                parent_id,
                owner_id,
                vpath::base_name(path),
                path,
                DIRECTORY_MIME,
                now
            ],
        )?;
        Self::file_by_id(conn, conn.last_insert_rowid())
    }
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        uuid: row.get(1)?,
        project_id: row.get(2)?,
        directory_id: row.get(3)?,
        owner_id: row.get(4)?,
        name: row.get(5)?,
        path: row.get(6)?,
        mime_type: row.get(7)?,
        size: row.get::<_, i64>(8)? as u64,
        checksum: row.get(9)?,
        current: row.get::<_, i64>(10)? != 0,
        version: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<ProjectRecord> {
    Ok(ProjectRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        owner_id: row.get(3)?,
        size: row.get::<_, i64>(4)? as u64,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

#[async_trait]
impl ProjectStore for SqliteStore {
    async fn get_project_by_slug(&self, slug: &str) -> Result<ProjectRecord> {
        let conn = self.conn()?;
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE slug = ?1");
        conn.query_row(&sql, params![slug], project_from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("no such project {slug}")))
    }

    async fn user_can_access_project(&self, user_id: i64, project_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let allowed: i64 = conn.query_row(
            "SELECT EXISTS( \
                SELECT 1 FROM projects WHERE id = ?1 AND owner_id = ?2 \
                UNION \
                SELECT 1 FROM project_members WHERE project_id = ?1 AND user_id = ?2)",
            params![project_id, user_id],
            |row| row.get(0),
        )?;
        Ok(allowed != 0)
    }

    async fn projects_for_user(&self, user_id: i64) -> Result<Vec<ProjectRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT DISTINCT p.id, p.name, p.slug, p.owner_id, p.size, p.created_at, p.updated_at \
             FROM projects p \
             LEFT JOIN project_members m ON m.project_id = p.id \
             WHERE p.owner_id = ?1 OR m.user_id = ?1 \
             ORDER BY p.slug"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], project_from_row)?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row?);
        }
        Ok(projects)
    }
}

#[async_trait]
impl FileStore for SqliteStore {
    async fn get_file_by_path(&self, project_id: i64, path: &str) -> Result<FileRecord> {
        let canonical = vpath::canonicalize(path);
        if canonical == "/" {
            return Err(StoreError::NotFound("/ is not a file".to_string()));
        }

        let conn = self.conn()?;
        let dir = Self::dir_by_path(&conn, project_id, &vpath::dir_name(&canonical))?
            .ok_or_else(|| StoreError::NotFound(format!("no such file {canonical}")))?;

        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files \
             WHERE project_id = ?1 AND directory_id = ?2 AND name = ?3 \
               AND mime_type != ?4 AND is_current = 1"
        );
        conn.query_row(
            &sql,
            params![project_id, dir.id, vpath::base_name(&canonical), DIRECTORY_MIME],
            file_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("no such file {canonical}")))
    }

    async fn get_dir_by_path(&self, project_id: i64, path: &str) -> Result<FileRecord> {
        let conn = self.conn()?;
        Self::dir_by_path(&conn, project_id, path)?
            .ok_or_else(|| StoreError::NotFound(format!("no such directory {path}")))
    }

    async fn get_or_create_dir_path(
        &self,
        project_id: i64,
        owner_id: i64,
        path: &str,
    ) -> Result<FileRecord> {
        let canonical = vpath::canonicalize(path);
        let conn = self.conn()?;

        let mut dir = Self::dir_by_path(&conn, project_id, "/")?
            .ok_or_else(|| StoreError::NotFound(format!("project {project_id} has no root")))?;
        if canonical == "/" {
            return Ok(dir);
        }

        let mut walked = String::new();
        for segment in canonical[1..].split('/') {
            walked.push('/');
            walked.push_str(segment);
            dir = match Self::dir_by_path(&conn, project_id, &walked)? {
                Some(existing) => existing,
                None => Self::insert_dir(&conn, project_id, dir.id, owner_id, &walked)?,
            };
        }
        Ok(dir)
    }

    async fn list_directory_by_path(
        &self,
        project_id: i64,
        path: &str,
    ) -> Result<Vec<FileRecord>> {
        let conn = self.conn()?;
        let dir = Self::dir_by_path(&conn, project_id, path)?
            .ok_or_else(|| StoreError::NotFound(format!("no such directory {path}")))?;

        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files \
             WHERE project_id = ?1 AND directory_id = ?2 AND is_current = 1 \
             ORDER BY name"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project_id, dir.id], file_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    async fn create_file(
        &self,
        name: &str,
        project_id: i64,
        directory_id: i64,
        owner_id: i64,
        mime_type: &str,
    ) -> Result<FileRecord> {
        let now = Utc::now();
        let conn = self.conn()?;
        let version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM files \
             WHERE project_id = ?1 AND directory_id = ?2 AND name = ?3 AND mime_type != ?4",
            params![project_id, directory_id, name, DIRECTORY_MIME],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO files (uuid, project_id, directory_id, owner_id, name, path, \
                                mime_type, size, checksum, is_current, version, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, 0, '', 0, ?7, ?8, ?8)",
            params![
                Uuid::new_v4().to_string(),
                project_id,
                directory_id,
                owner_id,
                name,
                mime_type,
                version + 1,
                now
            ],
        )?;
        Self::file_by_id(&conn, conn.last_insert_rowid())
    }

    async fn done_writing_to_file(
        &self,
        file: &FileRecord,
        checksum: &str,
        size: u64,
        conversions: &dyn ConversionStore,
    ) -> Result<bool> {
        let (duplicate, committed) = {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;
            let now = Utc::now();

            // One physical file per distinct checksum per project: if a
            // byte-identical file already exists, point this row at its
            // storage uuid. The caller removes the bytes it just wrote.
            let existing: Option<String> = tx
                .query_row(
                    "SELECT uuid FROM files \
                     WHERE project_id = ?1 AND checksum = ?2 AND id != ?3 \
                       AND mime_type != ?4 \
                     ORDER BY id LIMIT 1",
                    params![file.project_id, checksum, file.id, DIRECTORY_MIME],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(uuid) = &existing {
                tx.execute("UPDATE files SET uuid = ?1 WHERE id = ?2", params![uuid, file.id])?;
            }

            // Flip the current flag over from any earlier version at the
            // same location, then commit this one.
            tx.execute(
                "UPDATE files SET is_current = 0, updated_at = ?1 \
                 WHERE project_id = ?2 AND directory_id = ?3 AND name = ?4 \
                   AND id != ?5 AND mime_type != ?6",
                params![now, file.project_id, file.directory_id, file.name, file.id, DIRECTORY_MIME],
            )?;
            tx.execute(
                "UPDATE files SET is_current = 1, size = ?1, checksum = ?2, updated_at = ?3 \
                 WHERE id = ?4",
                params![size as i64, checksum, now, file.id],
            )?;
            tx.execute(
                "UPDATE projects SET size = size + ?1, updated_at = ?2 WHERE id = ?3",
                params![size as i64, now, file.project_id],
            )?;

            let committed = Self::file_by_id(&tx, file.id)?;
            tx.commit()?;
            (existing.is_some(), committed)
        };

        if committed.is_convertible() {
            if let Err(err) = conversions.add_file_to_convert(&committed).await {
                warn!(file_id = committed.id, %err, "failed to enqueue conversion");
            }
        }

        Ok(duplicate)
    }
}

#[async_trait]
impl ConversionStore for SqliteStore {
    async fn add_file_to_convert(&self, file: &FileRecord) -> Result<ConversionJob> {
        let now = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO conversion_jobs (file_id, status, created_at) VALUES (?1, 'pending', ?2)",
            params![file.id, now],
        )?;
        Ok(ConversionJob {
            id: conn.last_insert_rowid(),
            file_id: file.id,
            status: "pending".to_string(),
            created_at: now,
        })
    }
}

#[async_trait]
impl UserStore for SqliteStore {
    async fn get_user_by_slug(&self, slug: &str) -> Result<UserRecord> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, slug, name, password_hash FROM users WHERE slug = ?1",
            params![slug],
            |row| {
                Ok(UserRecord {
                    id: row.get(0)?,
                    slug: row.get(1)?,
                    name: row.get(2)?,
                    password_hash: row.get(3)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("no such user {slug}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_project() -> (SqliteStore, UserRecord, ProjectRecord) {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = store.create_user("alice", "Alice", "hash").unwrap();
        let project = store.create_project("Alloy 42", "alloy-42", user.id).unwrap();
        (store, user, project)
    }

    #[tokio::test]
    async fn project_lookup_and_access() {
        let (store, user, project) = store_with_project();

        let found = store.get_project_by_slug("alloy-42").await.unwrap();
        assert_eq!(found.id, project.id);
        assert!(matches!(
            store.get_project_by_slug("nope").await,
            Err(StoreError::NotFound(_))
        ));

        assert!(store.user_can_access_project(user.id, project.id).await.unwrap());

        let outsider = store.create_user("bob", "Bob", "hash").unwrap();
        assert!(!store
            .user_can_access_project(outsider.id, project.id)
            .await
            .unwrap());

        store.add_project_member(project.id, outsider.id).unwrap();
        assert!(store
            .user_can_access_project(outsider.id, project.id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn dir_path_creation_is_idempotent() {
        let (store, user, project) = store_with_project();

        let dir = store
            .get_or_create_dir_path(project.id, user.id, "/a/b/c")
            .await
            .unwrap();
        assert_eq!(dir.path.as_deref(), Some("/a/b/c"));

        let again = store
            .get_or_create_dir_path(project.id, user.id, "/a/b/c")
            .await
            .unwrap();
        assert_eq!(again.id, dir.id);

        let b = store.get_dir_by_path(project.id, "/a/b").await.unwrap();
        assert_eq!(dir.directory_id, Some(b.id));
        assert!(b.is_dir());
    }

    #[tokio::test]
    async fn create_file_versions_never_overwrite() {
        let (store, user, project) = store_with_project();
        let root = store.get_dir_by_path(project.id, "/").await.unwrap();

        let v1 = store
            .create_file("run.csv", project.id, root.id, user.id, "text/csv")
            .await
            .unwrap();
        let v2 = store
            .create_file("run.csv", project.id, root.id, user.id, "text/csv")
            .await
            .unwrap();

        assert_ne!(v1.id, v2.id);
        assert_ne!(v1.uuid, v2.uuid);
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert!(!v1.current && !v2.current);
    }

    #[tokio::test]
    async fn done_writing_commits_and_switches_current() {
        let (store, user, project) = store_with_project();
        let root = store.get_dir_by_path(project.id, "/").await.unwrap();

        let v1 = store
            .create_file("run.csv", project.id, root.id, user.id, "text/csv")
            .await
            .unwrap();
        let dup = store
            .done_writing_to_file(&v1, "aaaa", 5, &store)
            .await
            .unwrap();
        assert!(!dup);

        let current = store.get_file_by_path(project.id, "/run.csv").await.unwrap();
        assert_eq!(current.id, v1.id);
        assert_eq!(current.size, 5);
        assert_eq!(current.checksum, "aaaa");

        // Second version stays invisible until its own commit.
        let v2 = store
            .create_file("run.csv", project.id, root.id, user.id, "text/csv")
            .await
            .unwrap();
        let still = store.get_file_by_path(project.id, "/run.csv").await.unwrap();
        assert_eq!(still.id, v1.id);

        store.done_writing_to_file(&v2, "bbbb", 7, &store).await.unwrap();
        let now_current = store.get_file_by_path(project.id, "/run.csv").await.unwrap();
        assert_eq!(now_current.id, v2.id);

        let updated = store.get_project_by_slug("alloy-42").await.unwrap();
        assert_eq!(updated.size, 12);
    }

    #[tokio::test]
    async fn done_writing_deduplicates_by_checksum() {
        let (store, user, project) = store_with_project();
        let root = store.get_dir_by_path(project.id, "/").await.unwrap();

        let a = store
            .create_file("a.bin", project.id, root.id, user.id, "unknown")
            .await
            .unwrap();
        assert!(!store.done_writing_to_file(&a, "cafe", 4, &store).await.unwrap());

        let b = store
            .create_file("b.bin", project.id, root.id, user.id, "unknown")
            .await
            .unwrap();
        assert!(store.done_writing_to_file(&b, "cafe", 4, &store).await.unwrap());

        let a = store.get_file_by_path(project.id, "/a.bin").await.unwrap();
        let b = store.get_file_by_path(project.id, "/b.bin").await.unwrap();
        assert_eq!(a.uuid, b.uuid);
    }

    #[tokio::test]
    async fn convertible_files_enqueue_a_conversion() {
        let (store, user, project) = store_with_project();
        let root = store.get_dir_by_path(project.id, "/").await.unwrap();

        let doc = store
            .create_file(
                "paper.docx",
                project.id,
                root.id,
                user.id,
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            )
            .await
            .unwrap();
        store.done_writing_to_file(&doc, "dddd", 10, &store).await.unwrap();
        assert_eq!(store.conversion_job_count().unwrap(), 1);

        let csv = store
            .create_file("run.csv", project.id, root.id, user.id, "text/csv")
            .await
            .unwrap();
        store.done_writing_to_file(&csv, "eeee", 3, &store).await.unwrap();
        assert_eq!(store.conversion_job_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn listing_returns_direct_children_only() {
        let (store, user, project) = store_with_project();
        store
            .get_or_create_dir_path(project.id, user.id, "/data/deep")
            .await
            .unwrap();
        let data = store.get_dir_by_path(project.id, "/data").await.unwrap();
        let f = store
            .create_file("run.csv", project.id, data.id, user.id, "text/csv")
            .await
            .unwrap();
        store.done_writing_to_file(&f, "ffff", 1, &store).await.unwrap();

        let names: Vec<String> = store
            .list_directory_by_path(project.id, "/data")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["deep".to_string(), "run.csv".to_string()]);

        let root_names: Vec<String> = store
            .list_directory_by_path(project.id, "/")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(root_names, vec!["data".to_string()]);
    }
}
