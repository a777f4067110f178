use crate::error::SyncError;
use crate::keytab::Layout;
use crate::perms::FilePermissions;
use crate::principal::Principal;
use std::io::Write;
use tracing::{debug, error, warn};

/// The key version numbers last written into a principal's keytab, in the
/// order the admin tool reported the keys.
pub trait KvnoCache {
    /// A missing or unreadable record is a cache miss, never an error.
    fn read(&self, principal: &Principal) -> Option<Vec<u32>>;

    fn write(&self, principal: &Principal, kvnos: &[u32]) -> Result<(), SyncError>;
}

/// Plain text records, one kvno per line, stored next to the keytab.
#[derive(Debug, Clone)]
pub struct FileKvnoCache {
    layout: Layout,
    permissions: FilePermissions,
}

impl FileKvnoCache {
    pub fn new(layout: Layout, permissions: FilePermissions) -> Self {
        FileKvnoCache {
            layout,
            permissions,
        }
    }
}

pub fn parse_record(content: &str) -> Option<Vec<u32>> {
    let kvnos = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.parse::<u32>().ok())
        .collect::<Option<Vec<u32>>>()?;

    if kvnos.is_empty() {
        None
    } else {
        Some(kvnos)
    }
}

pub fn format_record(kvnos: &[u32]) -> String {
    kvnos.iter().map(|kvno| format!("{kvno}\n")).collect()
}

impl KvnoCache for FileKvnoCache {
    fn read(&self, principal: &Principal) -> Option<Vec<u32>> {
        let path = self.layout.kvno_path(principal);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(?path, "no kvno record");
                return None;
            }
            Err(err) => {
                warn!(?err, ?path, "unreadable kvno record, treating as a miss");
                return None;
            }
        };

        let kvnos = parse_record(&content);
        if kvnos.is_none() {
            warn!(?path, "unparseable kvno record, treating as a miss");
        }
        kvnos
    }

    fn write(&self, principal: &Principal, kvnos: &[u32]) -> Result<(), SyncError> {
        let path = self.layout.kvno_path(principal);
        let host_dir = self.layout.host_dir(principal);
        self.permissions.ensure_dir(&host_dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&host_dir).map_err(|err| {
            error!(?err, ?host_dir, "Failed to create kvno record");
            SyncError::KvnoWrite
        })?;

        tmp.write_all(format_record(kvnos).as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|err| {
                error!(?err, ?path, "Failed to write kvno record");
                SyncError::KvnoWrite
            })?;

        self.permissions.apply(tmp.path())?;

        tmp.persist(&path).map_err(|err| {
            error!(err = ?err.error, ?path, "Failed to move kvno record into place");
            SyncError::KvnoWrite
        })?;

        debug!(?path, ?kvnos, "kvno record written");
        Ok(())
    }
}
