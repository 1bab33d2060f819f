//! The store façade: the only coupling point between the protocol
//! handlers and the repository's metadata backend. Handlers never see a
//! database; they see these traits.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lattice_model::{FileRecord, ProjectRecord, UserRecord};

use crate::error::Result;

/// Project lookup and access checks.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get_project_by_slug(&self, slug: &str) -> Result<ProjectRecord>;

    async fn user_can_access_project(&self, user_id: i64, project_id: i64) -> Result<bool>;

    /// Every project the user may access, for the synthetic root listing.
    async fn projects_for_user(&self, user_id: i64) -> Result<Vec<ProjectRecord>>;
}

/// File and directory rows within a project. Paths are canonical
/// in-project paths (leading `/`, `/` for the project root).
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn get_file_by_path(&self, project_id: i64, path: &str) -> Result<FileRecord>;

    async fn get_dir_by_path(&self, project_id: i64, path: &str) -> Result<FileRecord>;

    /// Create every missing directory along `path`, returning the final
    /// one. Idempotent.
    async fn get_or_create_dir_path(
        &self,
        project_id: i64,
        owner_id: i64,
        path: &str,
    ) -> Result<FileRecord>;

    /// Direct children (current files and directories) of a directory.
    async fn list_directory_by_path(
        &self,
        project_id: i64,
        path: &str,
    ) -> Result<Vec<FileRecord>>;

    /// Create a new logical file version. The row is never current at
    /// creation and never overwrites an existing row; its version number
    /// is one past the highest existing version at the same location.
    async fn create_file(
        &self,
        name: &str,
        project_id: i64,
        directory_id: i64,
        owner_id: i64,
        mime_type: &str,
    ) -> Result<FileRecord>;

    /// Commit a written file version: record size and checksum, flip the
    /// current flag over from any earlier version at the same location,
    /// fold the size into the project aggregate, and enqueue a
    /// conversion job when the type calls for one.
    ///
    /// Returns `true` when a byte-identical physical file already existed
    /// in the project; the row has then been repointed at the existing
    /// storage uuid and the caller owns removing the bytes it just wrote.
    async fn done_writing_to_file(
        &self,
        file: &FileRecord,
        checksum: &str,
        size: u64,
        conversions: &dyn ConversionStore,
    ) -> Result<bool>;
}

/// Conversion-job intake for file types the repository renders.
#[async_trait]
pub trait ConversionStore: Send + Sync {
    async fn add_file_to_convert(&self, file: &FileRecord) -> Result<ConversionJob>;
}

/// Account lookup for password authentication.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user_by_slug(&self, slug: &str) -> Result<UserRecord>;
}

/// A queued format-conversion job.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub id: i64,
    pub file_id: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Bundle of the façade traits handed to each session. Cloning is cheap;
/// all members are shared.
#[derive(Clone)]
pub struct Stores {
    pub files: Arc<dyn FileStore>,
    pub projects: Arc<dyn ProjectStore>,
    pub users: Arc<dyn UserStore>,
    pub conversions: Arc<dyn ConversionStore>,
}

impl Stores {
    /// Wire every façade role to one backend instance.
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: FileStore + ProjectStore + UserStore + ConversionStore + 'static,
    {
        Stores {
            files: backend.clone(),
            projects: backend.clone(),
            users: backend.clone(),
            conversions: backend,
        }
    }
}
