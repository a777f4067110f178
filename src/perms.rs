use crate::error::SyncError;
use std::fs::{DirBuilder, Permissions};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;
use tracing::{error, trace};

pub const DEFAULT_MODE: u32 = 0o640;

/// Mode and ownership applied to every keytab and kvno record once it is in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePermissions {
    mode: u32,
    uid: Option<u32>,
    gid: Option<u32>,
}

impl Default for FilePermissions {
    fn default() -> Self {
        FilePermissions {
            mode: DEFAULT_MODE,
            uid: None,
            gid: None,
        }
    }
}

fn lookup_uid(owner: &str) -> Result<u32, SyncError> {
    if let Ok(uid) = owner.parse::<u32>() {
        return Ok(uid);
    }
    uzers::get_user_by_name(owner)
        .map(|user| user.uid())
        .ok_or_else(|| {
            error!(?owner, "Unknown owner");
            SyncError::UnknownOwner
        })
}

fn lookup_gid(group: &str) -> Result<u32, SyncError> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(gid);
    }
    uzers::get_group_by_name(group)
        .map(|group| group.gid())
        .ok_or_else(|| {
            error!(?group, "Unknown group");
            SyncError::UnknownGroup
        })
}

impl FilePermissions {
    pub fn new(mode: u32, owner: Option<&str>, group: Option<&str>) -> Result<Self, SyncError> {
        if mode > 0o7777 {
            error!(mode = %format!("{mode:o}"), "Invalid file mode");
            return Err(SyncError::ConfigInvalidMode);
        }

        Ok(FilePermissions {
            mode,
            uid: owner.map(lookup_uid).transpose()?,
            gid: group.map(lookup_gid).transpose()?,
        })
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Directories get the file mode plus search permission wherever read is granted.
    pub fn dir_mode(&self) -> u32 {
        self.mode | ((self.mode & 0o444) >> 2)
    }

    fn chown(&self, path: &Path) -> Result<(), SyncError> {
        if self.uid.is_none() && self.gid.is_none() {
            return Ok(());
        }
        std::os::unix::fs::chown(path, self.uid, self.gid).map_err(|err| {
            error!(?err, ?path, uid = ?self.uid, gid = ?self.gid, "Failed to chown");
            SyncError::Permissions
        })
    }

    pub fn apply(&self, path: &Path) -> Result<(), SyncError> {
        trace!(?path, mode = %format!("{:o}", self.mode), "apply permissions");
        std::fs::set_permissions(path, Permissions::from_mode(self.mode)).map_err(|err| {
            error!(?err, ?path, "Failed to set file mode");
            SyncError::Permissions
        })?;
        self.chown(path)
    }

    /// Create `path` (and parents) if needed, then apply directory permissions to it.
    pub fn ensure_dir(&self, path: &Path) -> Result<(), SyncError> {
        if !path.is_dir() {
            DirBuilder::new()
                .recursive(true)
                .mode(self.dir_mode())
                .create(path)
                .map_err(|err| {
                    error!(?err, ?path, "Failed to create directory");
                    SyncError::IoError
                })?;
        }
        std::fs::set_permissions(path, Permissions::from_mode(self.dir_mode())).map_err(|err| {
            error!(?err, ?path, "Failed to set directory mode");
            SyncError::Permissions
        })?;
        self.chown(path)
    }
}

#[cfg(test)]
mod tests {
    use super::FilePermissions;
    use crate::error::SyncError;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    #[test]
    fn test_dir_mode() {
        let perms = FilePermissions::new(0o640, None, None).expect("valid");
        assert_eq!(perms.dir_mode(), 0o750);
        let perms = FilePermissions::new(0o600, None, None).expect("valid");
        assert_eq!(perms.dir_mode(), 0o700);
    }

    #[test]
    fn test_invalid_mode() {
        assert_eq!(
            FilePermissions::new(0o17777, None, None),
            Err(SyncError::ConfigInvalidMode)
        );
    }

    #[test]
    fn test_unknown_owner_and_group() {
        assert_eq!(
            FilePermissions::new(0o640, Some("no-such-user-autokeytab"), None),
            Err(SyncError::UnknownOwner)
        );
        assert_eq!(
            FilePermissions::new(0o640, None, Some("no-such-group-autokeytab")),
            Err(SyncError::UnknownGroup)
        );
    }

    #[test]
    fn test_apply_mode_and_current_owner() {
        let dir = tempfile::tempdir().expect("Failed to create tempdir");
        let path = dir.path().join("host.keytab");
        std::fs::write(&path, b"keytab").expect("Failed to write");

        let uid = uzers::get_effective_uid();
        let gid = uzers::get_effective_gid();
        let perms = FilePermissions::new(0o600, Some(&uid.to_string()), Some(&gid.to_string()))
            .expect("valid");
        perms.apply(&path).expect("Failed to apply permissions");

        let meta = std::fs::metadata(&path).expect("metadata");
        assert_eq!(meta.permissions().mode() & 0o7777, 0o600);
        assert_eq!(meta.uid(), uid);
        assert_eq!(meta.gid(), gid);
    }

    #[test]
    fn test_ensure_dir() {
        let dir = tempfile::tempdir().expect("Failed to create tempdir");
        let path = dir.path().join("TEST.REALM").join("foo.bar.baz");

        let perms = FilePermissions::default();
        perms.ensure_dir(&path).expect("Failed to create dir");

        let meta = std::fs::metadata(&path).expect("metadata");
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o7777, 0o750);
    }
}
