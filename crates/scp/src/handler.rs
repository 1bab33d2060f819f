//! SCP session callbacks against the repository.
//!
//! One handler exists per connection. The project is loaded lazily from
//! the first path a callback sees and reused for the rest of the
//! session; if that load ever fails the handler goes fatal and every
//! later callback short-circuits without touching the store again.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use lattice_model::{mime, vpath, FileRecord, ProjectRecord, UserRecord};
use lattice_store::{ProjectResolver, StoreError, Stores};
use md5::{Digest, Md5};
use tokio::fs::{File as OsFile, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error};

use crate::entry::{DirEntry, FileEntry};
use crate::error::{Result, ScpError};

/// What the visitor wants the walk to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkFlow {
    Continue,
    /// Skip the just-visited directory's contents; returned from a file
    /// visit it skips the remainder of the containing directory.
    SkipDir,
}

/// Pre-order directory-walk visitor. A lookup failure along the walk is
/// reported through `err` with the record it concerned (or `None` when
/// the walk root itself failed to resolve).
#[async_trait]
pub trait WalkVisitor: Send {
    async fn visit(
        &mut self,
        path: &str,
        entry: Option<&FileRecord>,
        err: Option<&StoreError>,
    ) -> Result<WalkFlow>;
}

pub struct ScpHandler {
    user: UserRecord,
    stores: Stores,
    resolver: Arc<ProjectResolver>,
    fs_root: PathBuf,
    project: Option<ProjectRecord>,
    fatal: bool,
}

impl ScpHandler {
    pub fn new(
        user: UserRecord,
        stores: Stores,
        resolver: Arc<ProjectResolver>,
        fs_root: PathBuf,
    ) -> Self {
        ScpHandler {
            user,
            stores,
            resolver,
            fs_root,
            project: None,
            fatal: false,
        }
    }

    /// The session's project, loaded from the first full virtual path a
    /// callback sees. Later callbacks may hand in already-stripped
    /// paths; they hit the cached record.
    async fn project_for(&mut self, path: &str) -> Result<ProjectRecord> {
        if self.fatal {
            return Err(ScpError::Fatal(
                "session failed project validation".to_string(),
            ));
        }
        if let Some(project) = &self.project {
            return Ok(project.clone());
        }

        match self.resolver.resolve(path).await {
            Ok(project) => {
                self.project = Some(project.clone());
                Ok(project)
            }
            Err(err) => {
                self.fatal = true;
                Err(err.into())
            }
        }
    }

    /// No pattern expansion: the pattern is its own single match.
    pub fn glob(&self, pattern: &str) -> Vec<String> {
        vec![pattern.to_string()]
    }

    /// Pre-order walk over the directory tree at `path`. If the root
    /// lookup fails the visitor is invoked once with the error and the
    /// walk ends.
    pub async fn walk_dir<V>(&mut self, path: &str, visitor: &mut V) -> Result<()>
    where
        V: WalkVisitor + ?Sized,
    {
        let project = self.project_for(path).await?;
        let rest = vpath::strip(path, &project.slug);

        match self.stores.files.get_dir_by_path(project.id, &rest).await {
            Err(err) => {
                visitor.visit(&rest, None, Some(&err)).await?;
                Ok(())
            }
            Ok(dir) => {
                self.walk(&project, rest, dir, visitor).await?;
                Ok(())
            }
        }
    }

    fn walk<'a, V>(
        &'a self,
        project: &'a ProjectRecord,
        path: String,
        entry: FileRecord,
        visitor: &'a mut V,
    ) -> BoxFuture<'a, Result<WalkFlow>>
    where
        V: WalkVisitor + ?Sized,
    {
        Box::pin(async move {
            let flow = visitor.visit(&path, Some(&entry), None).await?;
            if entry.is_file() {
                // SkipDir from a file visit skips the rest of its parent.
                return Ok(flow);
            }
            if flow == WalkFlow::SkipDir {
                return Ok(WalkFlow::Continue);
            }

            let children = match self
                .stores
                .files
                .list_directory_by_path(project.id, &path)
                .await
            {
                Ok(children) => children,
                Err(err) => {
                    visitor.visit(&path, Some(&entry), Some(&err)).await?;
                    Vec::new()
                }
            };

            for child in children {
                let child_path = vpath::join(&path, &child.name);
                if self.walk(project, child_path, child, &mut *visitor).await?
                    == WalkFlow::SkipDir
                {
                    break;
                }
            }
            Ok(WalkFlow::Continue)
        })
    }

    /// Describe a directory for sending. Creates nothing on the server.
    pub async fn new_dir_entry(&mut self, name: &str) -> Result<DirEntry> {
        let project = self.project_for(name).await?;
        let path = vpath::strip(name, &project.slug);
        let dir = self
            .stores
            .files
            .get_dir_by_path(project.id, &path)
            .await
            .map_err(|err| {
                debug!(%path, project_id = project.id, %err, "failed to open dir");
                err
            })?;

        let entry_name = if path == "/" {
            project.slug.clone()
        } else {
            vpath::base_name(&path)
        };
        let mtime = dir.updated_at.timestamp();
        Ok(DirEntry {
            name: entry_name,
            path,
            mode: 0o777,
            mtime,
            atime: mtime,
            children: Vec::new(),
        })
    }

    /// Open a file for sending; the entry carries size, times and the
    /// physical reader, which closes when the entry drops.
    pub async fn new_file_entry(&mut self, name: &str) -> Result<FileEntry> {
        let project = self.project_for(name).await?;
        let path = vpath::strip(name, &project.slug);
        let file = self
            .stores
            .files
            .get_file_by_path(project.id, &path)
            .await
            .map_err(|err| {
                debug!(%path, project_id = project.id, %err, "unable to find file");
                err
            })?;

        let reader = OsFile::open(file.underlying_file_path(&self.fs_root)).await?;
        let mtime = file.updated_at.timestamp();
        Ok(FileEntry {
            name: file.name.clone(),
            path,
            mode: 0o777,
            size: file.size,
            mtime,
            atime: mtime,
            reader,
        })
    }

    /// Create a directory (and any missing parents). Idempotent.
    pub async fn mkdir(&mut self, name: &str) -> Result<FileRecord> {
        let project = self.project_for(name).await?;
        let path = vpath::strip(name, &project.slug);
        Ok(self
            .stores
            .files
            .get_or_create_dir_path(project.id, self.user.id, &path)
            .await?)
    }

    /// Receive one file: a fresh logical version, streamed through a tee
    /// into the physical file and the running hash, committed (or
    /// deduplicated) once the stream ends.
    ///
    /// Returns the bytes written. Streaming errors are logged and the
    /// commit path still runs, mirroring the protocol's best-effort
    /// close semantics.
    pub async fn write<R>(&mut self, name: &str, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let project = self.project_for(name).await?;
        let path = vpath::strip(name, &project.slug);
        let file_name = vpath::base_name(&path);
        if file_name.is_empty() {
            return Err(ScpError::Protocol("cannot write to project root".to_string()));
        }

        // Recursive uploads announce directories through mkdir records,
        // but a single-file upload into a missing directory lands here
        // directly; make sure the chain exists either way.
        let dir = self
            .stores
            .files
            .get_or_create_dir_path(project.id, self.user.id, &vpath::dir_name(&path))
            .await?;

        let file = self
            .stores
            .files
            .create_file(
                &file_name,
                project.id,
                dir.id,
                self.user.id,
                &mime::mime_type(&file_name),
            )
            .await?;

        tokio::fs::create_dir_all(file.underlying_dir_path(&self.fs_root)).await?;
        let physical_path = file.underlying_file_path(&self.fs_root);
        let mut out = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&physical_path)
            .await?;

        let mut hasher = Md5::new();
        let mut written: u64 = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(err) = out.write_all(&buf[..n]).await {
                        error!(file_id = file.id, %err, "failure writing to file");
                        break;
                    }
                    hasher.update(&buf[..n]);
                    written += n as u64;
                }
                Err(err) => {
                    error!(file_id = file.id, %err, "failure reading upload stream");
                    break;
                }
            }
        }
        if let Err(err) = out.flush().await {
            error!(file_id = file.id, %err, "flush failed");
        }
        drop(out);

        let checksum = hex::encode(hasher.finalize());
        match self
            .stores
            .files
            .done_writing_to_file(&file, &checksum, written, self.stores.conversions.as_ref())
            .await
        {
            Ok(true) => {
                if let Err(err) = tokio::fs::remove_file(&physical_path).await {
                    error!(
                        file_id = file.id,
                        path = %physical_path.display(),
                        %err,
                        "failed to remove deduplicated file"
                    );
                }
            }
            Ok(false) => {}
            Err(err) => {
                error!(
                    file_id = file.id,
                    project_id = project.id,
                    %err,
                    "failure committing file metadata"
                );
            }
        }

        Ok(written)
    }
}
