//! SCP front-end for the Lattice gateway.

pub mod entry;
pub mod error;
pub mod handler;
pub mod protocol;

pub use entry::{DirEntry, Entry, FileEntry};
pub use error::{Result, ScpError};
pub use handler::{ScpHandler, WalkFlow, WalkVisitor};
pub use protocol::{ScpCommand, ScpSession};
