//! Transfer entries handed between the SCP handler and the protocol
//! driver on the copy-to-client path.

use tokio::fs::File as OsFile;

/// A directory to send, with its children collected in walk order. The
/// driver turns this into `D`/`E` record pairs.
pub struct DirEntry {
    pub name: String,
    /// In-project path the entry was resolved from.
    pub path: String,
    pub mode: u32,
    pub mtime: i64,
    pub atime: i64,
    pub children: Vec<Entry>,
}

/// A file to send. The reader streams the physical bytes; dropping the
/// entry closes it.
#[derive(Debug)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    pub atime: i64,
    pub reader: OsFile,
}

pub enum Entry {
    Dir(DirEntry),
    File(FileEntry),
}
