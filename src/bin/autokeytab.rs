use autokeytab::config::{Config, SyncSettings};
use autokeytab::engine::RunReport;
use autokeytab::RunMode;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Debug, clap::Parser)]
#[clap(about = "Keep Kerberos service keytabs in step with kadmin.local")]
struct OptParser {
    #[clap(subcommand)]
    command: Opt,
}

#[derive(Debug, Subcommand)]
enum Opt {
    /// Create missing principals and regenerate out of date keytabs.
    Sync {
        config: PathBuf,
        /// Reconcile every host that already has a principal of a managed service.
        #[clap(long)]
        all_known: bool,
    },
    /// Show what sync would do without changing anything.
    Plan {
        config: PathBuf,
        #[clap(long)]
        all_known: bool,
    },
}

fn load_settings(path: &Path, all_known: bool) -> Result<SyncSettings, ()> {
    let mut cfg = Config::parse(path).map_err(|err| {
        error!(?err, ?path, "Unable to load configuration");
    })?;

    if all_known {
        cfg.all_known = true;
    }

    SyncSettings::try_from(&cfg).map_err(|err| {
        error!(?err, "Invalid configuration");
    })
}

fn print_plan(report: &RunReport) {
    for outcome in report.outcomes.iter() {
        match (&outcome.result, outcome.action) {
            (Err(err), _) => println!("{}: error {:?}", outcome.principal, err),
            (Ok(()), Some(action)) => println!("{}: {}", outcome.principal, action),
            (Ok(()), None) => {}
        }
    }
}

fn summarise(report: &RunReport) -> bool {
    if let Some(err) = report.fatal {
        error!(realm = %report.realm, ?err, "realm was not reconciled");
        return false;
    }

    for (principal, err) in report.failures() {
        warn!(%principal, ?err, "principal failed");
    }
    for path in report.purged.iter() {
        info!(?path, "purged");
    }

    info!(
        realm = %report.realm,
        hosts = report.hosts.len(),
        created = report.created(),
        extracted = report.extracted(),
        skipped = report.skipped(),
        failed = report.failures().count(),
        "realm complete"
    );
    report.is_success()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), ()> {
    let opt = OptParser::parse();

    tracing_subscriber::fmt::init();

    let (settings, mode) = match opt.command {
        Opt::Sync { config, all_known } => (load_settings(&config, all_known)?, RunMode::Sync),
        Opt::Plan { config, all_known } => (load_settings(&config, all_known)?, RunMode::Plan),
    };

    let reports = autokeytab::run(&settings, mode).await;

    let mut success = true;
    for report in reports.iter() {
        if mode == RunMode::Plan {
            print_plan(report);
        }
        success &= summarise(report);
    }

    if success {
        Ok(())
    } else {
        error!("one or more realms reported failures");
        Err(())
    }
}
