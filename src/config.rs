use crate::admin::{resolve_binary, DEFAULT_ADMIN_BINARY};
use crate::engine::EngineConfig;
use crate::error::SyncError;
use crate::perms::{FilePermissions, DEFAULT_MODE};
use crate::principal::Principal;
use crate::resolve::StaticHosts;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

pub const DEFAULT_ADMIN_PRINCIPAL: &str = "autokeytab/admin";
pub const DEFAULT_COMMAND_TIMEOUT: u64 = 60;

fn default_services() -> Vec<String> {
    vec!["host".to_string(), "nfs".to_string()]
}

fn default_admin_binary() -> String {
    DEFAULT_ADMIN_BINARY.to_string()
}

fn default_admin_principal() -> String {
    DEFAULT_ADMIN_PRINCIPAL.to_string()
}

fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT
}

fn default_mode() -> u32 {
    DEFAULT_MODE
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub realms: Vec<String>,
    pub target_dir: PathBuf,
    #[serde(default)]
    pub all_known: bool,
    #[serde(default = "default_services")]
    pub services: Vec<String>,
    #[serde(default = "default_admin_binary")]
    pub admin_binary: String,
    /// Qualified with each realm unless it names one itself.
    #[serde(default = "default_admin_principal")]
    pub admin_principal: String,
    /// Seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
    #[serde(default)]
    pub hosts: Vec<String>,
    pub hosts_file: Option<PathBuf>,
    #[serde(default)]
    pub purge: bool,
    pub owner: Option<String>,
    pub group: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: u32,
}

impl Config {
    pub fn parse<P: AsRef<Path>>(path: P) -> io::Result<Config> {
        let contents = std::fs::read_to_string(path.as_ref())?;

        toml::from_str(&contents).map_err(|err| {
            error!(?err);
            io::Error::other("toml parse failure")
        })
    }
}

/// Validated, immutable settings for a whole run.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub admin_binary: PathBuf,
    pub command_timeout: Duration,
    pub target_dir: PathBuf,
    pub permissions: FilePermissions,
    pub hosts: StaticHosts,
    pub realms: Vec<EngineConfig>,
}

fn validate_realm(realm: &str) -> Result<(), SyncError> {
    if realm.is_empty() || realm.chars().any(|c| c.is_whitespace() || c == '/' || c == '@') {
        error!(?realm, "Invalid realm");
        return Err(SyncError::RealmInvalid);
    }
    Ok(())
}

fn validate_service(service: &str) -> Result<(), SyncError> {
    if service.is_empty()
        || !service
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        error!(?service, "Invalid service name");
        return Err(SyncError::ConfigInvalidService);
    }
    Ok(())
}

impl TryFrom<&Config> for SyncSettings {
    type Error = SyncError;

    fn try_from(cfg: &Config) -> Result<Self, Self::Error> {
        if cfg.realms.is_empty() {
            error!("No realms are configured");
            return Err(SyncError::ConfigNoRealms);
        }

        if cfg.services.is_empty() {
            error!("No services are configured");
            return Err(SyncError::ConfigNoServices);
        }
        for service in cfg.services.iter() {
            validate_service(service)?;
        }

        if cfg.command_timeout == 0 {
            error!("command_timeout must be at least one second");
            return Err(SyncError::ConfigInvalidTimeout);
        }

        if !cfg.target_dir.is_absolute() {
            error!(target_dir = ?cfg.target_dir, "target_dir must be an absolute path");
            return Err(SyncError::TargetDirInvalid);
        }

        let permissions =
            FilePermissions::new(cfg.mode, cfg.owner.as_deref(), cfg.group.as_deref())?;

        let realms = cfg
            .realms
            .iter()
            .map(|realm| {
                validate_realm(realm)?;
                let admin_principal = Principal::parse_in_realm(&cfg.admin_principal, realm)
                    .map_err(|_| {
                        error!(
                            admin_principal = %cfg.admin_principal,
                            %realm,
                            "Invalid admin principal"
                        );
                        SyncError::AdminPrincipalInvalid
                    })?;

                Ok(EngineConfig {
                    realm: realm.clone(),
                    services: cfg.services.clone(),
                    all_known: cfg.all_known,
                    admin_principal,
                    purge: cfg.purge,
                })
            })
            .collect::<Result<Vec<_>, SyncError>>()?;

        let admin_binary = resolve_binary(&cfg.admin_binary)?;

        Ok(SyncSettings {
            admin_binary,
            command_timeout: Duration::from_secs(cfg.command_timeout),
            target_dir: cfg.target_dir.clone(),
            permissions,
            hosts: StaticHosts::new(cfg.hosts.clone(), cfg.hosts_file.clone()),
            realms,
        })
    }
}
