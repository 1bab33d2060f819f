//! Environment-driven configuration.
//!
//! `MC_DOTENV_PATH` names a dotenv file that supplies the remaining
//! keys. Anything missing fails startup immediately.

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of the content-addressed physical file store.
    pub fs_root: PathBuf,
    /// SQLite metadata database file.
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub host_key_path: PathBuf,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let dotenv_path = required("MC_DOTENV_PATH")?;
        dotenvy::from_path(&dotenv_path)
            .with_context(|| format!("loading {dotenv_path} failed"))?;

        let fs_root = PathBuf::from(required("MCFS_DIR")?);
        let db_path = PathBuf::from(required("MCDB_PATH")?);
        let host = required("MCSSHD_HOST")?;
        let port = required("MCSSHD_PORT")?
            .parse::<u16>()
            .context("MCSSHD_PORT is not a valid port number")?;
        let host_key_path = PathBuf::from(required("MCSSHD_HOST_KEY_PATH")?);
        if !host_key_path.exists() {
            bail!("host key {} does not exist", host_key_path.display());
        }

        Ok(Settings {
            fs_root,
            db_path,
            host,
            port,
            host_key_path,
        })
    }
}

fn required(key: &str) -> Result<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => bail!("{key} is not set or blank"),
    }
}
