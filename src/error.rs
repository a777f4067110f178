use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    // =========================================================================================
    // Variants carry no data. The details of what went wrong (paths, command output, the
    // principal involved) are reported with the error! macro at the site that raises the
    // error, so nothing from the admin tool's output ends up embedded in a returned value.
    // =========================================================================================
    ConfigParse,
    ConfigNoRealms,
    ConfigNoServices,
    ConfigInvalidService,
    ConfigInvalidMode,
    ConfigInvalidTimeout,
    RealmInvalid,
    TargetDirInvalid,
    AdminBinaryNotFound,
    AdminPrincipalInvalid,
    HostsFileUnreadable,
    UnknownOwner,
    UnknownGroup,
    RunLocked,

    AdminSpawn,
    AdminTimeout,
    AdminExitStatus,
    AdminOutputEncoding,

    PrincipalNameInvalid,
    PrincipalHasNoKeys,
    KeytabNoEntries,

    KeytabMissingAfterExtract,
    KeytabPlacement,
    KvnoWrite,
    Permissions,
    IoError,
}

/// Broad classes of failure. Configuration errors abort a realm run before any
/// mutation; everything else is recorded against a single principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Execution,
    Parse,
    Filesystem,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::ConfigParse
            | SyncError::ConfigNoRealms
            | SyncError::ConfigNoServices
            | SyncError::ConfigInvalidService
            | SyncError::ConfigInvalidMode
            | SyncError::ConfigInvalidTimeout
            | SyncError::RealmInvalid
            | SyncError::TargetDirInvalid
            | SyncError::AdminBinaryNotFound
            | SyncError::AdminPrincipalInvalid
            | SyncError::HostsFileUnreadable
            | SyncError::UnknownOwner
            | SyncError::UnknownGroup
            | SyncError::RunLocked => ErrorKind::Configuration,

            SyncError::AdminSpawn
            | SyncError::AdminTimeout
            | SyncError::AdminExitStatus
            | SyncError::AdminOutputEncoding => ErrorKind::Execution,

            SyncError::PrincipalNameInvalid
            | SyncError::PrincipalHasNoKeys
            | SyncError::KeytabNoEntries => ErrorKind::Parse,

            SyncError::KeytabMissingAfterExtract
            | SyncError::KeytabPlacement
            | SyncError::KvnoWrite
            | SyncError::Permissions
            | SyncError::IoError => ErrorKind::Filesystem,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:?})", self, self.kind())
    }
}

impl std::error::Error for SyncError {}

impl From<std::io::Error> for SyncError {
    fn from(value: std::io::Error) -> Self {
        tracing::error!(?value, "io error");
        SyncError::IoError
    }
}
