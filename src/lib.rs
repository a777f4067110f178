// #![deny(warnings)]

#![warn(unused_extern_crates)]
// Enable some groups of clippy lints.
#![deny(clippy::suspicious)]
#![deny(clippy::perf)]
// Specific lints to enforce.
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]
#![deny(clippy::disallowed_types)]
#![deny(clippy::manual_let_else)]
#![allow(clippy::unreachable)]

pub mod admin;
pub mod config;
pub mod engine;
pub mod error;
pub mod keytab;
pub mod kvno;
pub mod parse;
pub mod perms;
pub mod principal;
pub mod resolve;

use crate::admin::KadminLocal;
use crate::config::SyncSettings;
use crate::engine::{EngineConfig, ReconciliationEngine, RunReport};
use crate::keytab::FsKeytabStore;
use crate::kvno::FileKvnoCache;
use crate::parse::KadminTextParser;
use crate::resolve::HostIntrospection;
use tracing::{error, instrument};

pub use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Create principals and extract keytabs as needed.
    Sync,
    /// Report what `Sync` would do, issuing only read commands.
    Plan,
}

/// Reconcile one realm against `kadmin.local`. The realm lock and staging
/// directory live for the duration of this call.
#[instrument(level = "info", skip_all, fields(realm = %engine_config.realm))]
pub async fn run_realm(
    settings: &SyncSettings,
    engine_config: &EngineConfig,
    hosts: &[String],
    mode: RunMode,
) -> RunReport {
    let admin = KadminLocal::new(
        &settings.admin_binary,
        &engine_config.realm,
        engine_config.admin_principal.clone(),
        settings.command_timeout,
    );
    let parser = KadminTextParser;

    match mode {
        RunMode::Sync => {
            let store = match FsKeytabStore::open(
                &settings.target_dir,
                &engine_config.realm,
                settings.permissions.clone(),
            ) {
                Ok(store) => store,
                Err(err) => {
                    error!(?err, "Unable to open the realm's keytab directory");
                    return RunReport::fatal(&engine_config.realm, err);
                }
            };
            let cache = FileKvnoCache::new(store.layout().clone(), settings.permissions.clone());

            ReconciliationEngine::new(engine_config, &admin, &parser, &cache, &store)
                .reconcile(hosts)
                .await
        }
        RunMode::Plan => {
            let store = FsKeytabStore::inspect(&settings.target_dir, &engine_config.realm);
            let cache = FileKvnoCache::new(store.layout().clone(), settings.permissions.clone());

            ReconciliationEngine::new(engine_config, &admin, &parser, &cache, &store)
                .plan(hosts)
                .await
        }
    }
}

/// Reconcile every configured realm in turn. Hosts are introspected once and
/// shared by all realms.
pub async fn run(settings: &SyncSettings, mode: RunMode) -> Vec<RunReport> {
    let hosts = match settings.hosts.introspect_hosts() {
        Ok(hosts) => hosts,
        Err(err) => {
            error!(?err, "host introspection failed");
            return settings
                .realms
                .iter()
                .map(|engine_config| RunReport::fatal(&engine_config.realm, err))
                .collect();
        }
    };

    let mut reports = Vec::with_capacity(settings.realms.len());
    for engine_config in settings.realms.iter() {
        reports.push(run_realm(settings, engine_config, &hosts, mode).await);
    }
    reports
}
