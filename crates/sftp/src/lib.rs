//! SFTP front-end for the Lattice gateway.

pub mod file;
pub mod handler;
pub mod listing;

pub use file::GatewayFile;
pub use handler::SftpHandler;
pub use listing::Listing;
