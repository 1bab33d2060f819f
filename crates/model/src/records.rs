use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// MIME tag that marks a row in the file namespace as a directory.
pub const DIRECTORY_MIME: &str = "directory";

/// MIME types that get a conversion job enqueued once their bytes are
/// committed. These are the office formats the repository renders for
/// in-browser preview.
pub const CONVERTIBLE_MIME_TYPES: &[&str] = &[
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
];

/// An account that may open SSH sessions. The slug doubles as the SSH
/// login name; the password hash is a bcrypt digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub password_hash: String,
}

/// A project owns a directory tree and a set of files. The slug is the
/// only key ever exposed in a virtual path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub owner_id: i64,
    /// Aggregate size of all committed file versions, in bytes.
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row in the file namespace: either a logical file version or a
/// directory (tagged with [`DIRECTORY_MIME`]).
///
/// Several logical files may point at the same `uuid`; that is the
/// deduplication primitive. A file version only becomes visible once
/// `current` is set, which happens after its bytes, size and checksum
/// have all been recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    /// Identifier of the physical file under the storage root.
    pub uuid: String,
    pub project_id: i64,
    /// Parent directory row; `None` only for a project's root directory.
    pub directory_id: Option<i64>,
    pub owner_id: i64,
    pub name: String,
    /// Full in-project path; populated for directories only.
    pub path: Option<String>,
    pub mime_type: String,
    pub size: u64,
    /// Hex encoding of the 128-bit content digest, empty until committed.
    pub checksum: String,
    pub current: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn is_dir(&self) -> bool {
        self.mime_type == DIRECTORY_MIME
    }

    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    /// Whether a conversion job should be enqueued after commit.
    pub fn is_convertible(&self) -> bool {
        CONVERTIBLE_MIME_TYPES.contains(&self.mime_type.as_str())
    }

    /// Directory holding the physical file, two levels of fan-out keyed
    /// by the first four characters of the storage uuid.
    pub fn underlying_dir_path(&self, root: &Path) -> PathBuf {
        root.join(&self.uuid[0..2]).join(&self.uuid[2..4])
    }

    /// Absolute path of the physical file under the storage root.
    pub fn underlying_file_path(&self, root: &Path) -> PathBuf {
        self.underlying_dir_path(root).join(&self.uuid)
    }
}
