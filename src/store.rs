use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use bincode::{Decode, Encode, config::Configuration};

use crate::{error::Error, registry::Peer, server::ServerConfig};

const BINCODE_CONFIG: Configuration = bincode::config::standard();
const FORMAT_VERSION: u32 = 1;

/// Everything that has to survive a restart.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Snapshot {
    pub version: u32,
    pub server: ServerConfig,
    pub peers: Vec<Peer>,
    /// Unix time the `run` loop came up, `None` while it is not running.
    pub started_at: Option<u64>,
}

impl Snapshot {
    pub fn new(server: ServerConfig, peers: Vec<Peer>) -> Self {
        Self {
            version: FORMAT_VERSION,
            server,
            peers,
            started_at: None,
        }
    }
}

/// Exclusive hold on the store across processes. Released on drop.
#[derive(Debug)]
pub struct StoreLock {
    _file: File,
}

/// Single-file snapshot store. Writes go to a sibling temp file that is
/// renamed over the old one, so readers see either version in full.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("state"));
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn private_options() -> OpenOptions {
        let mut options = OpenOptions::new();
        options.write(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options
    }

    /// Blocks until no other process holds the store, via an advisory lock
    /// on a sibling `.lock` file. Every read-modify-write of the snapshot
    /// happens under it.
    pub fn lock(&self) -> Result<StoreLock, Error> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let file = Self::private_options().truncate(false).open(self.sibling(".lock"))?;
        file.lock()?;
        log::trace!("locked {}", self.path.display());
        Ok(StoreLock { _file: file })
    }

    pub fn load(&self) -> Result<Snapshot, Error> {
        if !self.exists() {
            return Err(Error::NotInitialized(self.path.clone()));
        }

        let data = fs::read(&self.path)?;
        let (snapshot, _): (Snapshot, usize) = bincode::decode_from_slice(&data, BINCODE_CONFIG)?;

        if snapshot.version != FORMAT_VERSION {
            return Err(Error::Validation(format!(
                "{} has state format {}, expected {FORMAT_VERSION}",
                self.path.display(),
                snapshot.version
            )));
        }

        Ok(snapshot)
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<(), Error> {
        let data = bincode::encode_to_vec(snapshot, BINCODE_CONFIG)?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let tmp = self.sibling(".tmp");
        let mut file = Self::private_options().truncate(true).open(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &self.path)?;
        log::debug!("saved {} peers to {}", snapshot.peers.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn temp_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("wg-fortress-{tag}-{}.bin", uuid::Uuid::new_v4()))
}
