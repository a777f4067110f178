use crate::error::SyncError;
use crate::principal::Principal;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Exactly the hosts reported by host introspection.
    Explicit,
    /// Every host that already holds a principal of a managed service.
    AllKnown,
}

impl ResolveMode {
    pub fn from_all_known(all_known: bool) -> Self {
        if all_known {
            ResolveMode::AllKnown
        } else {
            ResolveMode::Explicit
        }
    }
}

/// Hostnames end up as directory names, so only plain DNS labels are accepted.
pub fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && !host.starts_with('.')
        && !host.contains("..")
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// Lowercase and trim an introspected hostname.
pub fn normalise_hostname(host: &str) -> Option<String> {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    is_valid_hostname(&host).then_some(host)
}

fn dedup_in_order(hosts: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    hosts
        .into_iter()
        .filter(|host| seen.insert(host.clone()))
        .collect()
}

pub struct DesiredStateResolver<'a> {
    realm: &'a str,
    services: &'a [String],
    admin_principal: &'a Principal,
}

impl<'a> DesiredStateResolver<'a> {
    pub fn new(realm: &'a str, services: &'a [String], admin_principal: &'a Principal) -> Self {
        DesiredStateResolver {
            realm,
            services,
            admin_principal,
        }
    }

    pub fn resolve(
        &self,
        mode: ResolveMode,
        explicit_hosts: &[String],
        listing: &[String],
    ) -> Vec<String> {
        let hosts = match mode {
            ResolveMode::Explicit => dedup_in_order(explicit_hosts.iter().filter_map(|host| {
                let normalised = normalise_hostname(host);
                if normalised.is_none() {
                    warn!(?host, "ignoring invalid hostname");
                }
                normalised
            })),
            ResolveMode::AllKnown => dedup_in_order(self.known_hosts(listing)),
        };

        if hosts.is_empty() {
            debug!(?mode, realm = %self.realm, "no hosts to reconcile");
        }
        hosts
    }

    /// Instances are kept exactly as listed, they name principals that exist.
    fn known_hosts<'l>(&'l self, listing: &'l [String]) -> impl Iterator<Item = String> + 'l {
        listing
            .iter()
            .filter_map(|name| name.parse::<Principal>().ok())
            .filter(|principal| {
                principal.realm() == self.realm
                    && !principal.is_master_key()
                    && principal != self.admin_principal
                    && self
                        .services
                        .iter()
                        .any(|service| service == principal.service_name())
            })
            .filter_map(|principal| {
                let instance = principal.instance()?;
                if !is_valid_hostname(instance) {
                    warn!(%principal, "ignoring principal with an unusable instance");
                    return None;
                }
                Some(instance.to_string())
            })
    }
}

/// The source of hosts that need keytabs.
pub trait HostIntrospection {
    fn introspect_hosts(&self) -> Result<Vec<String>, SyncError>;
}

/// Hosts listed in the configuration file and, optionally, a hosts file with one
/// hostname per line. Blank lines and `#` comments are ignored.
#[derive(Debug, Clone, Default)]
pub struct StaticHosts {
    hosts: Vec<String>,
    hosts_file: Option<PathBuf>,
}

impl StaticHosts {
    pub fn new(hosts: Vec<String>, hosts_file: Option<PathBuf>) -> Self {
        StaticHosts { hosts, hosts_file }
    }
}

impl HostIntrospection for StaticHosts {
    fn introspect_hosts(&self) -> Result<Vec<String>, SyncError> {
        let mut hosts = self.hosts.clone();

        if let Some(path) = &self.hosts_file {
            let content = std::fs::read_to_string(path).map_err(|err| {
                error!(?err, ?path, "Unable to read hosts file");
                SyncError::HostsFileUnreadable
            })?;
            hosts.extend(
                content
                    .lines()
                    .map(|line| line.split('#').next().unwrap_or_default().trim())
                    .filter(|line| !line.is_empty())
                    .map(str::to_string),
            );
        }

        Ok(hosts)
    }
}
