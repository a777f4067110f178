use crate::error::SyncError;
use crate::principal::Principal;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, trace};

pub const DEFAULT_ADMIN_BINARY: &str = "kadmin.local";

/// The four logical operations the engine needs from the admin tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    ListPrincipals,
    GetPrincipal(Principal),
    AddPrincipal(Principal),
    ExtractKeys {
        principal: Principal,
        keytab: PathBuf,
    },
}

impl AdminCommand {
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            AdminCommand::AddPrincipal(_) | AdminCommand::ExtractKeys { .. }
        )
    }

    /// The query string passed to `kadmin.local -q`.
    pub fn query(&self) -> String {
        match self {
            AdminCommand::ListPrincipals => "list_principals".to_string(),
            AdminCommand::GetPrincipal(principal) => format!("get_principal {principal}"),
            AdminCommand::AddPrincipal(principal) => format!("add_principal -randkey {principal}"),
            AdminCommand::ExtractKeys { principal, keytab } => {
                format!("ktadd -k {} {principal}", keytab.display())
            }
        }
    }
}

impl fmt::Display for AdminCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.query())
    }
}

#[allow(async_fn_in_trait)]
pub trait AdminSession {
    /// Run one command, authenticating afresh, and return its standard output.
    async fn run(&self, command: &AdminCommand) -> Result<String, SyncError>;
}

/// Drives a local `kadmin.local` binary. Every call is a new process.
#[derive(Debug, Clone)]
pub struct KadminLocal {
    binary: PathBuf,
    realm: String,
    admin_principal: Principal,
    timeout: Duration,
}

impl KadminLocal {
    pub fn new(binary: &Path, realm: &str, admin_principal: Principal, timeout: Duration) -> Self {
        KadminLocal {
            binary: binary.to_path_buf(),
            realm: realm.to_string(),
            admin_principal,
            timeout,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self, query: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-r")
            .arg(&self.realm)
            .arg("-p")
            .arg(self.admin_principal.to_string())
            .arg("-q")
            .arg(query)
            // Each invocation gets a throw away ticket cache, nothing outlives the process.
            .env("KRB5CCNAME", "MEMORY:")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The child is killed when the timeout drops the output future.
            .kill_on_drop(true);
        cmd
    }
}

/// Resolve the admin binary once at startup, either an absolute path or a name on `$PATH`.
pub fn resolve_binary(name: &str) -> Result<PathBuf, SyncError> {
    which::which(name).map_err(|err| {
        error!(?err, ?name, "Unable to locate the kerberos admin binary");
        SyncError::AdminBinaryNotFound
    })
}

impl AdminSession for KadminLocal {
    async fn run(&self, command: &AdminCommand) -> Result<String, SyncError> {
        let query = command.query();
        debug!(binary = ?self.binary, %query, "kadmin");

        let output = tokio::time::timeout(self.timeout, self.command(&query).output())
            .await
            .map_err(|_| {
                error!(%query, timeout = ?self.timeout, "kadmin did not complete in time");
                SyncError::AdminTimeout
            })?
            .map_err(|err| {
                error!(?err, binary = ?self.binary, "Failed to spawn kadmin");
                SyncError::AdminSpawn
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(%query, stderr = %stderr.trim(), "kadmin stderr");
        }

        if !output.status.success() {
            error!(%query, status = ?output.status, stderr = %stderr.trim(), "kadmin failed");
            return Err(SyncError::AdminExitStatus);
        }

        let stdout = String::from_utf8(output.stdout).map_err(|err| {
            error!(?err, %query, "kadmin output is not valid utf-8");
            SyncError::AdminOutputEncoding
        })?;

        trace!(%stdout);
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::{resolve_binary, AdminCommand, AdminSession, KadminLocal};
    use crate::error::SyncError;
    use crate::principal::Principal;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Duration;

    fn host() -> Principal {
        Principal::service("host", "foo.bar.baz", "TEST.REALM")
    }

    fn fake_kadmin(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("kadmin.local");
        let mut f = std::fs::File::create(&path).expect("Failed to create script");
        writeln!(f, "#!/bin/sh\n{body}").expect("Failed to write script");
        drop(f);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("Failed to chmod script");
        path
    }

    fn session(binary: &std::path::Path, timeout: Duration) -> KadminLocal {
        let admin = Principal::parse_in_realm("autokeytab/admin", "TEST.REALM").expect("admin");
        KadminLocal::new(binary, "TEST.REALM", admin, timeout)
    }

    #[test]
    fn test_command_queries() {
        assert_eq!(AdminCommand::ListPrincipals.query(), "list_principals");
        assert_eq!(
            AdminCommand::GetPrincipal(host()).query(),
            "get_principal host/foo.bar.baz@TEST.REALM"
        );
        assert_eq!(
            AdminCommand::AddPrincipal(host()).query(),
            "add_principal -randkey host/foo.bar.baz@TEST.REALM"
        );
        let extract = AdminCommand::ExtractKeys {
            principal: host(),
            keytab: PathBuf::from("/tmp/run/host.keytab"),
        };
        assert_eq!(
            extract.query(),
            "ktadd -k /tmp/run/host.keytab host/foo.bar.baz@TEST.REALM"
        );
        assert!(extract.is_mutation());
        assert!(!AdminCommand::ListPrincipals.is_mutation());
    }

    #[test]
    fn test_resolve_missing_binary() {
        assert_eq!(
            resolve_binary("/nonexistent/kadmin.local").err(),
            Some(SyncError::AdminBinaryNotFound)
        );
    }

    #[tokio::test]
    async fn test_kadmin_passes_arguments() {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = tempfile::tempdir().expect("Failed to create tempdir");
        let bin = fake_kadmin(&dir, "echo \"$@\"");

        let out = session(&bin, Duration::from_secs(10))
            .run(&AdminCommand::ListPrincipals)
            .await
            .expect("kadmin run failed");

        assert_eq!(
            out.trim(),
            "-r TEST.REALM -p autokeytab/admin@TEST.REALM -q list_principals"
        );
    }

    #[tokio::test]
    async fn test_kadmin_exit_status() {
        let dir = tempfile::tempdir().expect("Failed to create tempdir");
        let bin = fake_kadmin(&dir, "echo oops >&2\nexit 3");

        let res = session(&bin, Duration::from_secs(10))
            .run(&AdminCommand::ListPrincipals)
            .await;
        assert_eq!(res, Err(SyncError::AdminExitStatus));
    }

    #[tokio::test]
    async fn test_kadmin_timeout() {
        let dir = tempfile::tempdir().expect("Failed to create tempdir");
        let bin = fake_kadmin(&dir, "sleep 5");

        let res = session(&bin, Duration::from_millis(100))
            .run(&AdminCommand::ListPrincipals)
            .await;
        assert_eq!(res, Err(SyncError::AdminTimeout));
    }

    #[tokio::test]
    async fn test_kadmin_spawn_failure() {
        let res = session(
            std::path::Path::new("/nonexistent/kadmin.local"),
            Duration::from_secs(1),
        )
        .run(&AdminCommand::ListPrincipals)
        .await;
        assert_eq!(res, Err(SyncError::AdminSpawn));
    }
}
