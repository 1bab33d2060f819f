//! Per-open file state: the OS handle, the running content hash and the
//! commit-or-dedup close path.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use lattice_model::{FileRecord, ProjectRecord};
use lattice_store::Stores;
use md5::{Digest, Md5};
use tokio::fs::File as OsFile;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::error;

/// One open file on behalf of a protocol client.
///
/// The handle is owned by the protocol session for the duration of the
/// transfer. For writes, every successfully written buffer is fed into
/// the running hash in write-call order; the repository's checksum
/// contract is a digest of the bytes the client sent, as they arrived.
pub struct GatewayFile {
    file: FileRecord,
    dir: FileRecord,
    project: ProjectRecord,
    handle: OsFile,
    physical_path: PathBuf,
    hasher: Md5,
    open_for_write: bool,
    stores: Stores,
}

impl GatewayFile {
    pub fn open_for_read(
        file: FileRecord,
        dir: FileRecord,
        project: ProjectRecord,
        handle: OsFile,
        physical_path: PathBuf,
        stores: Stores,
    ) -> Self {
        GatewayFile {
            file,
            dir,
            project,
            handle,
            physical_path,
            hasher: Md5::new(),
            open_for_write: false,
            stores,
        }
    }

    pub fn open_for_write(
        file: FileRecord,
        dir: FileRecord,
        project: ProjectRecord,
        handle: OsFile,
        physical_path: PathBuf,
        stores: Stores,
    ) -> Self {
        GatewayFile {
            file,
            dir,
            project,
            handle,
            physical_path,
            hasher: Md5::new(),
            open_for_write: true,
            stores,
        }
    }

    pub fn record(&self) -> &FileRecord {
        &self.file
    }

    pub fn parent_dir(&self) -> &FileRecord {
        &self.dir
    }

    pub fn physical_path(&self) -> &Path {
        &self.physical_path
    }

    /// Read from the underlying handle at an arbitrary offset.
    /// End-of-file shows up as a short (or zero) count, not an error.
    pub async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        if let Err(err) = self.handle.seek(SeekFrom::Start(offset)).await {
            error!(file_id = self.file.id, %err, "seek for read failed");
            return Err(err);
        }

        let mut filled = 0;
        while filled < buf.len() {
            match self.handle.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) => {
                    error!(file_id = self.file.id, %err, "read failed");
                    return Err(err);
                }
            }
        }
        Ok(filled)
    }

    /// Write at an arbitrary offset and fold the buffer into the running
    /// hash. A failed write does not touch the hash. Offsets may arrive
    /// in any order; the hash digests in call order regardless.
    pub async fn write_at(&mut self, data: &[u8], offset: u64) -> std::io::Result<usize> {
        if let Err(err) = self.handle.seek(SeekFrom::Start(offset)).await {
            error!(file_id = self.file.id, %err, "seek for write failed");
            return Err(err);
        }
        if let Err(err) = self.handle.write_all(data).await {
            error!(file_id = self.file.id, %err, "write failed");
            return Err(err);
        }

        self.hasher.update(data);
        Ok(data.len())
    }

    /// Close the handle and, for writes, commit the version: record size
    /// and checksum, and when the store reports a byte-identical file
    /// already existed, remove the bytes that were just written.
    ///
    /// Close never fails; there is nothing useful a client can do with a
    /// close error, so problems are logged and swallowed.
    pub async fn close(mut self) {
        if !self.open_for_write {
            return;
        }

        if let Err(err) = self.handle.flush().await {
            error!(file_id = self.file.id, %err, "flush on close failed");
        }

        let size = match self.handle.metadata().await {
            Ok(meta) => meta.len(),
            Err(err) => {
                error!(file_id = self.file.id, %err, "unable to stat written file");
                return;
            }
        };

        let checksum = hex::encode(self.hasher.finalize());
        match self
            .stores
            .files
            .done_writing_to_file(&self.file, &checksum, size, self.stores.conversions.as_ref())
            .await
        {
            Ok(true) => {
                // Superseded by an existing physical file with the same
                // bytes; ours is no longer referenced.
                if let Err(err) = tokio::fs::remove_file(&self.physical_path).await {
                    error!(
                        file_id = self.file.id,
                        path = %self.physical_path.display(),
                        %err,
                        "failed to remove deduplicated file"
                    );
                }
            }
            Ok(false) => {}
            Err(err) => {
                error!(
                    file_id = self.file.id,
                    project_id = self.project.id,
                    %err,
                    "failure committing file metadata"
                );
            }
        }
    }
}
