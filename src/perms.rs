//! File modes and ownership for everything the archiver creates.

use std::fs;
use std::io;
use std::path::Path;

/// Mode for archived files: read/write for owner and group, never executable.
pub const FILE_MODE: u32 = 0o660;

/// Mode for archive directories: owner and group only.
pub const DIR_MODE: u32 = 0o770;

/// Optional owner applied to created paths. Unset fields leave that id alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ownership {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Ownership {
    pub fn new(uid: Option<u32>, gid: Option<u32>) -> Self {
        Self { uid, gid }
    }

    pub fn is_configured(&self) -> bool {
        self.uid.is_some() || self.gid.is_some()
    }

    /// Whether `path` already has the configured owner and group.
    #[cfg(unix)]
    pub fn matches(&self, path: &Path) -> io::Result<bool> {
        use std::os::unix::fs::MetadataExt;

        let meta = fs::metadata(path)?;
        Ok(self.uid.is_none_or(|uid| meta.uid() == uid)
            && self.gid.is_none_or(|gid| meta.gid() == gid))
    }

    #[cfg(not(unix))]
    pub fn matches(&self, path: &Path) -> io::Result<bool> {
        fs::metadata(path).map(|_| true)
    }

    #[cfg(unix)]
    fn chown(&self, path: &Path) -> io::Result<()> {
        if !self.is_configured() {
            return Ok(());
        }
        std::os::unix::fs::chown(path, self.uid, self.gid)
    }

    #[cfg(not(unix))]
    fn chown(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
fn chmod(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn chmod(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Restrict a freshly written artifact and hand it to the configured owner.
pub fn secure_file(path: &Path, ownership: &Ownership) -> io::Result<()> {
    chmod(path, FILE_MODE)?;
    ownership.chown(path)
}

/// Restrict an archive directory and hand it to the configured owner.
pub fn secure_dir(path: &Path, ownership: &Ownership) -> io::Result<()> {
    chmod(path, DIR_MODE)?;
    ownership.chown(path)
}
