//! SFTP session handler: the protocol callbacks the gateway implements
//! against the repository.
//!
//! The synthetic root `/` lists the projects the authenticated user may
//! access; everything below `/<slug>` is served out of that project's
//! directory tree. The repository is versioned and content-addressed, so
//! every write creates a fresh file version and nothing is ever renamed
//! or removed over this protocol.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use lattice_model::{mime, vpath, FileRecord, ProjectRecord, UserRecord};
use lattice_store::{ProjectResolver, StoreError, Stores};
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::fs::{File as OsFile, OpenOptions};
use tracing::{debug, error};

use crate::file::GatewayFile;
use crate::listing::Listing;

const DIR_PERMISSIONS: u32 = 0o040777;
const FILE_PERMISSIONS: u32 = 0o100777;
const LIST_PAGE_SIZE: usize = 128;

pub struct SftpHandler {
    user: UserRecord,
    stores: Stores,
    resolver: Arc<ProjectResolver>,
    fs_root: PathBuf,
    version: Option<u32>,
    next_handle: u64,
    files: HashMap<String, GatewayFile>,
    listings: HashMap<String, Listing>,
}

impl SftpHandler {
    pub fn new(
        user: UserRecord,
        stores: Stores,
        resolver: Arc<ProjectResolver>,
        fs_root: PathBuf,
    ) -> Self {
        SftpHandler {
            user,
            stores,
            resolver,
            fs_root,
            version: None,
            next_handle: 0,
            files: HashMap::new(),
            listings: HashMap::new(),
        }
    }

    fn next_handle_key(&mut self, prefix: &str) -> String {
        self.next_handle += 1;
        format!("{prefix}-{}", self.next_handle)
    }

    /// Shared open-path setup: resolve the project and the parent
    /// directory of the target, which both open modes need.
    async fn open_setup(
        &self,
        path: &str,
    ) -> Result<(ProjectRecord, String, FileRecord), StatusCode> {
        let project = self
            .resolver
            .resolve(path)
            .await
            .map_err(|_| StatusCode::NoSuchFile)?;
        let rest = vpath::strip(path, &project.slug);
        let dir = self
            .stores
            .files
            .get_dir_by_path(project.id, &vpath::dir_name(&rest))
            .await
            .map_err(|_| StatusCode::NoSuchFile)?;
        Ok((project, rest, dir))
    }

    async fn attrs_for_path(&self, path: &str) -> Result<FileAttributes, StatusCode> {
        let canonical = vpath::canonicalize(path);
        if canonical == "/" {
            return Ok(synthetic_root_attrs());
        }

        let project = self
            .resolver
            .resolve(&canonical)
            .await
            .map_err(|_| StatusCode::NoSuchFile)?;
        let rest = vpath::strip(&canonical, &project.slug);

        if let Ok(file) = self.stores.files.get_file_by_path(project.id, &rest).await {
            return Ok(record_attrs(&file));
        }
        match self.stores.files.get_dir_by_path(project.id, &rest).await {
            Ok(dir) => Ok(record_attrs(&dir)),
            Err(err) => {
                debug!(path = %canonical, %err, "stat target not found");
                Err(status_for(&err))
            }
        }
    }

    async fn listing_for_path(&self, path: &str) -> Result<Vec<File>, StatusCode> {
        let canonical = vpath::canonicalize(path);
        if canonical == "/" {
            // Synthetic root: one pseudo-directory per accessible project.
            let projects = self
                .stores
                .projects
                .projects_for_user(self.user.id)
                .await
                .map_err(|err| {
                    error!(user_id = self.user.id, %err, "project listing failed");
                    status_for(&err)
                })?;
            return Ok(projects.iter().map(project_entry).collect());
        }

        let project = self
            .resolver
            .resolve(&canonical)
            .await
            .map_err(|_| StatusCode::NoSuchFile)?;
        let rest = vpath::strip(&canonical, &project.slug);
        let entries = self
            .stores
            .files
            .list_directory_by_path(project.id, &rest)
            .await
            .map_err(|err| status_for(&err))?;
        Ok(entries.iter().map(record_entry).collect())
    }
}

fn status_for(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound(_) => StatusCode::NoSuchFile,
        StoreError::Invalid(_) => StatusCode::Failure,
        StoreError::Unsupported(_) => StatusCode::OpUnsupported,
        // Store failures surface as "does not exist" unless a call-site
        // has a more specific mapping.
        StoreError::Backend(_) => StatusCode::NoSuchFile,
        StoreError::Io(_) => StatusCode::Failure,
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

fn unsupported(id: u32, name: &str) -> Status {
    Status {
        id,
        status_code: StatusCode::OpUnsupported,
        error_message: format!("unsupported command: '{name}'"),
        language_tag: "en-US".to_string(),
    }
}

fn record_attrs(rec: &FileRecord) -> FileAttributes {
    let mtime = rec.updated_at.timestamp() as u32;
    FileAttributes {
        size: Some(rec.size),
        permissions: Some(if rec.is_dir() {
            DIR_PERMISSIONS
        } else {
            FILE_PERMISSIONS
        }),
        atime: Some(mtime),
        mtime: Some(mtime),
        ..Default::default()
    }
}

fn record_entry(rec: &FileRecord) -> File {
    File::new(rec.name.clone(), record_attrs(rec))
}

fn project_entry(project: &ProjectRecord) -> File {
    let mtime = project.updated_at.timestamp() as u32;
    File::new(
        project.slug.clone(),
        FileAttributes {
            size: Some(project.size),
            permissions: Some(DIR_PERMISSIONS),
            atime: Some(mtime),
            mtime: Some(mtime),
            ..Default::default()
        },
    )
}

fn synthetic_root_attrs() -> FileAttributes {
    FileAttributes {
        size: Some(0),
        permissions: Some(DIR_PERMISSIONS),
        ..Default::default()
    }
}

impl russh_sftp::server::Handler for SftpHandler {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        if self.version.is_some() {
            error!(negotiated = ?self.version, "duplicate SFTP init packet");
            return Err(StatusCode::ConnectionLost);
        }
        self.version = Some(version);
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        if pflags.contains(OpenFlags::WRITE) {
            // A write is a brand-new file version; append/truncate flags
            // are meaningless against a fresh physical file and ignored.
            let (project, rest, dir) = self.open_setup(&filename).await?;
            let name = vpath::base_name(&rest);
            if name.is_empty() {
                return Err(StatusCode::Failure);
            }

            let file = self
                .stores
                .files
                .create_file(&name, project.id, dir.id, self.user.id, &mime::mime_type(&name))
                .await
                .map_err(|_| StatusCode::NoSuchFile)?;

            tokio::fs::create_dir_all(file.underlying_dir_path(&self.fs_root))
                .await
                .map_err(|err| {
                    error!(%err, "unable to materialise storage directory");
                    StatusCode::Failure
                })?;
            let physical_path = file.underlying_file_path(&self.fs_root);
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&physical_path)
                .await
                .map_err(|err| {
                    error!(file_id = file.id, %err, "unable to create physical file");
                    StatusCode::Failure
                })?;

            let key = self.next_handle_key("file");
            self.files.insert(
                key.clone(),
                GatewayFile::open_for_write(
                    file,
                    dir,
                    project,
                    handle,
                    physical_path,
                    self.stores.clone(),
                ),
            );
            return Ok(Handle { id, handle: key });
        }

        if !pflags.contains(OpenFlags::READ) {
            return Err(StatusCode::Failure);
        }

        let (project, rest, dir) = self.open_setup(&filename).await?;
        let file = self
            .stores
            .files
            .get_file_by_path(project.id, &rest)
            .await
            .map_err(|_| StatusCode::NoSuchFile)?;

        let physical_path = file.underlying_file_path(&self.fs_root);
        let handle = OsFile::open(&physical_path).await.map_err(|err| {
            error!(file_id = file.id, %err, "unable to open physical file");
            StatusCode::Failure
        })?;

        let key = self.next_handle_key("file");
        self.files.insert(
            key.clone(),
            GatewayFile::open_for_read(file, dir, project, handle, physical_path, self.stores.clone()),
        );
        Ok(Handle { id, handle: key })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        if let Some(file) = self.files.remove(&handle) {
            file.close().await;
        } else {
            self.listings.remove(&handle);
        }
        Ok(ok_status(id))
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let file = self.files.get_mut(&handle).ok_or(StatusCode::NoSuchFile)?;
        let mut buf = vec![0u8; len as usize];
        let n = file
            .read_at(&mut buf, offset)
            .await
            .map_err(|_| StatusCode::Failure)?;
        if n == 0 && len > 0 {
            return Err(StatusCode::Eof);
        }
        buf.truncate(n);
        Ok(Data { id, data: buf })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let file = self.files.get_mut(&handle).ok_or(StatusCode::NoSuchFile)?;
        file.write_at(&data, offset)
            .await
            .map_err(|_| StatusCode::Failure)?;
        Ok(ok_status(id))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let attrs = self.attrs_for_path(&path).await?;
        Ok(Attrs { id, attrs })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let file = self.files.get(&handle).ok_or(StatusCode::NoSuchFile)?;
        Ok(Attrs {
            id,
            attrs: record_attrs(file.record()),
        })
    }

    async fn setstat(
        &mut self,
        id: u32,
        _path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        Ok(unsupported(id, "Setstat"))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        _handle: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        Ok(unsupported(id, "Setstat"))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let entries = self.listing_for_path(&path).await?;
        let key = self.next_handle_key("dir");
        self.listings.insert(key.clone(), Listing::new(entries));
        Ok(Handle { id, handle: key })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let listing = self.listings.get_mut(&handle).ok_or(StatusCode::NoSuchFile)?;
        match listing.next_page(LIST_PAGE_SIZE) {
            Some(files) => Ok(Name { id, files }),
            None => Err(StatusCode::Eof),
        }
    }

    async fn remove(&mut self, id: u32, _filename: String) -> Result<Status, Self::Error> {
        Ok(unsupported(id, "Remove"))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        // The synthetic root is read-only; a directory can only be made
        // inside a resolved project.
        let project = self
            .resolver
            .resolve(&path)
            .await
            .map_err(|_| StatusCode::NoSuchFile)?;
        let rest = vpath::strip(&path, &project.slug);
        self.stores
            .files
            .get_or_create_dir_path(project.id, self.user.id, &rest)
            .await
            .map_err(|err| status_for(&err))?;
        Ok(ok_status(id))
    }

    async fn rmdir(&mut self, id: u32, _path: String) -> Result<Status, Self::Error> {
        Ok(unsupported(id, "Rmdir"))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        // Canonicalise only; no access check happens here.
        let canonical = vpath::canonicalize(&path);
        Ok(Name {
            id,
            files: vec![File::dummy(canonical)],
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let attrs = self.attrs_for_path(&path).await?;
        Ok(Attrs { id, attrs })
    }

    async fn rename(
        &mut self,
        id: u32,
        _oldpath: String,
        _newpath: String,
    ) -> Result<Status, Self::Error> {
        Ok(unsupported(id, "Rename"))
    }

    async fn readlink(&mut self, id: u32, _path: String) -> Result<Name, Self::Error> {
        Err(StatusCode::OpUnsupported)
    }

    async fn symlink(
        &mut self,
        id: u32,
        _linkpath: String,
        _targetpath: String,
    ) -> Result<Status, Self::Error> {
        Ok(unsupported(id, "Symlink"))
    }
}
