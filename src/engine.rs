use crate::admin::{AdminCommand, AdminSession};
use crate::error::SyncError;
use crate::keytab::KeytabStore;
use crate::kvno::KvnoCache;
use crate::parse::OutputParser;
use crate::principal::Principal;
use crate::resolve::{DesiredStateResolver, ResolveMode};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, error, info, instrument, warn};

/// Immutable per-realm settings handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub realm: String,
    pub services: Vec<String>,
    pub all_known: bool,
    pub admin_principal: Principal,
    pub purge: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Skip,
    Extract,
    CreateAndExtract,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Action::Skip => "up to date",
                Action::Extract => "extract keytab",
                Action::CreateAndExtract => "create principal and extract keytab",
            }
        )
    }
}

#[derive(Debug)]
pub struct Outcome {
    pub principal: Principal,
    /// `None` when the principal failed before an action could be decided.
    pub action: Option<Action>,
    pub result: Result<(), SyncError>,
}

#[derive(Debug)]
pub struct RunReport {
    pub realm: String,
    pub hosts: Vec<String>,
    pub outcomes: Vec<Outcome>,
    /// Set when the realm could not be processed at all.
    pub fatal: Option<SyncError>,
    pub purged: Vec<PathBuf>,
}

impl RunReport {
    fn new(realm: &str) -> Self {
        RunReport {
            realm: realm.to_string(),
            hosts: Vec::new(),
            outcomes: Vec::new(),
            fatal: None,
            purged: Vec::new(),
        }
    }

    pub fn fatal(realm: &str, err: SyncError) -> Self {
        let mut report = RunReport::new(realm);
        report.fatal = Some(err);
        report
    }

    fn count(&self, action: Action) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.action == Some(action) && o.result.is_ok())
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.count(Action::Skip)
    }

    pub fn extracted(&self) -> usize {
        self.count(Action::Extract)
    }

    pub fn created(&self) -> usize {
        self.count(Action::CreateAndExtract)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Principal, SyncError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.err().map(|err| (&o.principal, err)))
    }

    pub fn is_success(&self) -> bool {
        self.fatal.is_none() && self.failures().next().is_none()
    }
}

pub struct ReconciliationEngine<'a, A, P, C, K> {
    config: &'a EngineConfig,
    admin: &'a A,
    parser: &'a P,
    cache: &'a C,
    store: &'a K,
}

impl<'a, A, P, C, K> ReconciliationEngine<'a, A, P, C, K>
where
    A: AdminSession,
    P: OutputParser,
    C: KvnoCache,
    K: KeytabStore,
{
    pub fn new(
        config: &'a EngineConfig,
        admin: &'a A,
        parser: &'a P,
        cache: &'a C,
        store: &'a K,
    ) -> Self {
        ReconciliationEngine {
            config,
            admin,
            parser,
            cache,
            store,
        }
    }

    /// Principal names in listing order.
    async fn list_principals(&self) -> Result<Vec<String>, SyncError> {
        let out = self.admin.run(&AdminCommand::ListPrincipals).await?;
        let listing = self.parser.parse_principal_list(&out);
        debug!(count = listing.len(), "principals listed");
        Ok(listing)
    }

    async fn live_kvnos(&self, principal: &Principal) -> Result<Vec<u32>, SyncError> {
        let out = self
            .admin
            .run(&AdminCommand::GetPrincipal(principal.clone()))
            .await?;
        let kvnos: Vec<u32> = self
            .parser
            .parse_principal_detail(&out)
            .into_iter()
            .map(|key| key.kvno)
            .collect();

        if kvnos.is_empty() {
            error!(%principal, "principal metadata lists no keys");
            return Err(SyncError::PrincipalHasNoKeys);
        }
        Ok(kvnos)
    }

    fn resolve_hosts(&self, explicit_hosts: &[String], listing: &[String]) -> Vec<String> {
        DesiredStateResolver::new(
            &self.config.realm,
            &self.config.services,
            &self.config.admin_principal,
        )
        .resolve(
            ResolveMode::from_all_known(self.config.all_known),
            explicit_hosts,
            listing,
        )
    }

    /// Host by host, service by service, in resolution order.
    fn targets(&self, hosts: &[String]) -> Vec<Principal> {
        hosts
            .iter()
            .flat_map(|host| {
                self.config
                    .services
                    .iter()
                    .map(move |service| Principal::service(service, host, &self.config.realm))
            })
            .collect()
    }

    /// Decide what a principal needs. Only read commands are issued.
    pub async fn decide(
        &self,
        principal: &Principal,
        listing: &BTreeSet<String>,
    ) -> Result<Action, SyncError> {
        if !listing.contains(&principal.to_string()) {
            debug!(%principal, "principal does not exist");
            return Ok(Action::CreateAndExtract);
        }

        let live = self.live_kvnos(principal).await?;
        let keytab_present = self.store.keytab_exists(principal);
        let cached = self.cache.read(principal);

        let action = match (keytab_present, cached) {
            (true, Some(cached)) if cached == live => Action::Skip,
            (true, Some(cached)) => {
                info!(%principal, ?cached, ?live, "kvno record is out of date");
                Action::Extract
            }
            (true, None) => {
                warn!(%principal, "keytab present without a kvno record, regenerating");
                Action::Extract
            }
            (false, Some(_)) => {
                warn!(%principal, "kvno record present without a keytab, regenerating");
                Action::Extract
            }
            (false, None) => Action::Extract,
        };
        Ok(action)
    }

    async fn extract(&self, principal: &Principal) -> Result<(), SyncError> {
        let staged = self.store.staging_path(principal)?;

        let out = self
            .admin
            .run(&AdminCommand::ExtractKeys {
                principal: principal.clone(),
                keytab: staged.clone(),
            })
            .await?;

        let entries = self.parser.parse_keytab_extraction(&out);
        if entries == 0 {
            error!(%principal, "extraction added no entries to the keytab");
            return Err(SyncError::KeytabNoEntries);
        }

        // The KDC keys have already changed, so the keytab goes into place before
        // anything else can fail. A stale or missing record makes the next run
        // extract again.
        self.store.place(&staged, principal)?;

        let live = self.live_kvnos(principal).await?;
        if entries != live.len() {
            warn!(
                %principal,
                entries,
                keys = live.len(),
                "keytab entry count differs from key count"
            );
        }

        self.cache.write(principal, &live)?;

        info!(%principal, kvnos = ?live, "keytab updated");
        Ok(())
    }

    async fn apply(&self, principal: &Principal, action: Action) -> Result<(), SyncError> {
        match action {
            Action::Skip => {
                debug!(%principal, "keytab is current");
                Ok(())
            }
            Action::Extract => self.extract(principal).await,
            Action::CreateAndExtract => {
                self.admin
                    .run(&AdminCommand::AddPrincipal(principal.clone()))
                    .await?;
                info!(%principal, "principal created");
                self.extract(principal).await
            }
        }
    }

    async fn run(&self, explicit_hosts: &[String], mutate: bool) -> RunReport {
        let mut report = RunReport::new(&self.config.realm);

        let listed = match self.list_principals().await {
            Ok(listed) => listed,
            Err(err) => {
                error!(?err, realm = %self.config.realm, "Unable to list principals");
                report.fatal = Some(err);
                return report;
            }
        };

        report.hosts = self.resolve_hosts(explicit_hosts, &listed);
        let listing: BTreeSet<String> = listed.into_iter().collect();
        info!(realm = %self.config.realm, hosts = report.hosts.len(), "reconciling");

        for principal in self.targets(&report.hosts) {
            let (action, result) = match self.decide(&principal, &listing).await {
                Ok(action) if mutate => (Some(action), self.apply(&principal, action).await),
                Ok(action) => (Some(action), Ok(())),
                Err(err) => (None, Err(err)),
            };

            if let Err(err) = result {
                error!(%principal, ?err, ?action, "failed to reconcile principal");
            }

            report.outcomes.push(Outcome {
                principal,
                action,
                result,
            });
        }

        if mutate && self.config.purge {
            self.purge(&mut report);
        }

        report
    }

    fn purge(&self, report: &mut RunReport) {
        if !report.is_success() {
            warn!(realm = %self.config.realm, "not purging after a run with failures");
            return;
        }
        if report.hosts.is_empty() {
            warn!(realm = %self.config.realm, "not purging with an empty host set");
            return;
        }

        let hosts: BTreeSet<String> = report.hosts.iter().cloned().collect();
        match self.store.purge_except(&hosts) {
            Ok(purged) => report.purged = purged,
            Err(err) => {
                error!(?err, realm = %self.config.realm, "purge failed");
                report.fatal = Some(err);
            }
        }
    }

    /// Create missing principals and regenerate out of date keytabs.
    #[instrument(level = "info", skip_all, fields(realm = %self.config.realm))]
    pub async fn reconcile(&self, explicit_hosts: &[String]) -> RunReport {
        self.run(explicit_hosts, true).await
    }

    /// Evaluate every principal without changing anything.
    #[instrument(level = "info", skip_all, fields(realm = %self.config.realm))]
    pub async fn plan(&self, explicit_hosts: &[String]) -> RunReport {
        self.run(explicit_hosts, false).await
    }
}
