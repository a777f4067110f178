use crate::error::SyncError;
use crate::perms::FilePermissions;
use crate::principal::Principal;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, error, info, trace};

const LOCK_FILE: &str = ".lock";
const STAGING_PREFIX: &str = ".staging-";
const KEYTAB_EXT: &str = "keytab";
const KVNO_EXT: &str = "kvno";

/// Where keytabs and kvno records for one realm live:
/// `<target_dir>/<REALM>/<host>/<service>.{keytab,kvno}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    realm_dir: PathBuf,
}

impl Layout {
    pub fn new(target_dir: &Path, realm: &str) -> Self {
        Layout {
            realm_dir: target_dir.join(realm),
        }
    }

    pub fn realm_dir(&self) -> &Path {
        &self.realm_dir
    }

    /// Principals without an instance are kept directly in the realm directory.
    pub fn host_dir(&self, principal: &Principal) -> PathBuf {
        match principal.instance() {
            Some(host) => self.realm_dir.join(host),
            None => self.realm_dir.clone(),
        }
    }

    pub fn keytab_path(&self, principal: &Principal) -> PathBuf {
        self.host_dir(principal)
            .join(format!("{}.{KEYTAB_EXT}", principal.service_name()))
    }

    pub fn kvno_path(&self, principal: &Principal) -> PathBuf {
        self.host_dir(principal)
            .join(format!("{}.{KVNO_EXT}", principal.service_name()))
    }
}

/// Exclusive advisory lock over a realm directory, held for the lifetime of a run.
/// The kernel drops the lock when the file is closed.
#[derive(Debug)]
pub struct RealmLock {
    _file: File,
    _path: PathBuf,
}

impl RealmLock {
    pub fn acquire(realm_dir: &Path) -> Result<Self, SyncError> {
        let path = realm_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|err| {
                error!(?err, ?path, "Failed to open lock file");
                SyncError::IoError
            })?;

        let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if res == -1 {
            let res = errno::errno();
            let code = res.0;
            if code == libc::EWOULDBLOCK {
                error!(?path, "Another run holds the realm lock");
                return Err(SyncError::RunLocked);
            }
            error!("Failed to lock {path:?}: {code} ({res})");
            return Err(SyncError::IoError);
        }

        trace!(?path, "realm lock acquired");
        Ok(RealmLock {
            _file: file,
            _path: path,
        })
    }
}

/// The filesystem side of the engine: is a keytab present, where to extract
/// to, and how to move a finished keytab into place.
pub trait KeytabStore {
    fn keytab_exists(&self, principal: &Principal) -> bool;

    /// A fresh path, private to this run, for the admin tool to write into.
    fn staging_path(&self, principal: &Principal) -> Result<PathBuf, SyncError>;

    /// Atomically replace the principal's keytab with the staged file.
    fn place(&self, staged: &Path, principal: &Principal) -> Result<PathBuf, SyncError>;

    /// Remove host directories whose host is not in `hosts`.
    fn purge_except(&self, hosts: &BTreeSet<String>) -> Result<Vec<PathBuf>, SyncError>;
}

#[derive(Debug)]
pub struct FsKeytabStore {
    layout: Layout,
    permissions: FilePermissions,
    staging: Option<TempDir>,
    lock: Option<RealmLock>,
}

impl FsKeytabStore {
    /// Open the realm directory for writing: creates it, takes the realm lock and
    /// creates the run's staging directory on the same filesystem as the keytabs.
    pub fn open(
        target_dir: &Path,
        realm: &str,
        permissions: FilePermissions,
    ) -> Result<Self, SyncError> {
        let layout = Layout::new(target_dir, realm);
        permissions.ensure_dir(layout.realm_dir())?;

        let lock = RealmLock::acquire(layout.realm_dir())?;

        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(layout.realm_dir())
            .map_err(|err| {
                error!(?err, realm_dir = ?layout.realm_dir(), "Failed to create staging directory");
                SyncError::IoError
            })?;
        debug!(staging = ?staging.path(), "staging directory");

        Ok(FsKeytabStore {
            layout,
            permissions,
            staging: Some(staging),
            lock: Some(lock),
        })
    }

    /// Open the realm directory for inspection only. Nothing is created and no lock
    /// is taken, so staging and placement are refused.
    pub fn inspect(target_dir: &Path, realm: &str) -> Self {
        FsKeytabStore {
            layout: Layout::new(target_dir, realm),
            permissions: FilePermissions::default(),
            staging: None,
            lock: None,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }
}

impl KeytabStore for FsKeytabStore {
    fn keytab_exists(&self, principal: &Principal) -> bool {
        self.layout.keytab_path(principal).is_file()
    }

    fn staging_path(&self, principal: &Principal) -> Result<PathBuf, SyncError> {
        let Some(staging) = &self.staging else {
            error!("keytab store was opened read only");
            return Err(SyncError::KeytabPlacement);
        };

        // Mirrors the final layout so no two principals share a staged file.
        let dir = match principal.instance() {
            Some(host) => staging.path().join(host),
            None => staging.path().to_path_buf(),
        };
        std::fs::create_dir_all(&dir).map_err(|err| {
            error!(?err, ?dir, "Failed to create staging directory");
            SyncError::IoError
        })?;

        let path = dir.join(format!("{}.{KEYTAB_EXT}", principal.service_name()));
        // ktadd appends, so whatever an earlier attempt left behind must go.
        if path.exists() {
            std::fs::remove_file(&path).map_err(|err| {
                error!(?err, ?path, "Failed to clear staged keytab");
                SyncError::IoError
            })?;
        }
        Ok(path)
    }

    fn place(&self, staged: &Path, principal: &Principal) -> Result<PathBuf, SyncError> {
        if self.staging.is_none() {
            error!("keytab store was opened read only");
            return Err(SyncError::KeytabPlacement);
        }

        if !staged.is_file() {
            error!(?staged, %principal, "Extraction reported success but wrote no keytab");
            return Err(SyncError::KeytabMissingAfterExtract);
        }

        let host_dir = self.layout.host_dir(principal);
        self.permissions.ensure_dir(&host_dir)?;

        // Permissions are fixed before the rename so the final path never exposes a
        // keytab with the wrong mode.
        self.permissions.apply(staged)?;

        let target = self.layout.keytab_path(principal);
        std::fs::rename(staged, &target).map_err(|err| {
            error!(?err, ?staged, ?target, "Failed to move keytab into place");
            SyncError::KeytabPlacement
        })?;

        info!(?target, %principal, "keytab placed");
        Ok(target)
    }

    fn purge_except(&self, hosts: &BTreeSet<String>) -> Result<Vec<PathBuf>, SyncError> {
        let realm_dir = self.layout.realm_dir();
        let mut removed = Vec::new();

        for entry in std::fs::read_dir(realm_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') || hosts.contains(name) {
                continue;
            }

            let path = entry.path();
            std::fs::remove_dir_all(&path).map_err(|err| {
                error!(?err, ?path, "Failed to purge host directory");
                SyncError::IoError
            })?;
            info!(?path, "purged keytabs of undesired host");
            removed.push(path);
        }

        Ok(removed)
    }
}
