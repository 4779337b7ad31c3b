use std::{path::PathBuf, sync::Arc};

use structopt::StructOpt;
use tracing::info;

use orchestrator::{
    core::InstanceId,
    migration::MigrationEngine,
    pool::PoolManager,
    Settings,
};
use runtime::DockerRuntime;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "migrate",
    about = "Move dedicated trading-bot containers into shared pools"
)]
struct CliArgs {
    /// Discover legacy bots and print the placement plan without touching
    /// the runtime
    #[structopt(long)]
    dry_run: bool,

    /// Migrate every discovered legacy bot into a pool
    #[structopt(long)]
    execute: bool,

    /// Print the migration ledger
    #[structopt(long)]
    status: bool,

    /// Roll one migrated instance back to its dedicated container
    #[structopt(long)]
    rollback: Option<String>,

    /// How long a migrated bot may stabilize before its liveness probe
    #[structopt(long, default_value = "3s")]
    stabilize: humantime::Duration,

    /// Verbose logging
    #[structopt(long, short)]
    verbose: bool,

    /// Data root holding per-user bot and pool directories
    /// (default: POOL_ROOT from the environment)
    #[structopt(long)]
    root: Option<PathBuf>,
}

fn init_tracing(verbose: bool) {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let filter = if verbose { "debug" } else { "info" };
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    let args = CliArgs::from_args();
    init_tracing(args.verbose);

    if let Err(e) = run(args).await {
        eprintln!("migrate: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: CliArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = Settings::from_env();
    if let Some(root) = args.root {
        settings.strategies_dir = root.join("strategies");
        settings.root = root;
    }
    settings.migration_stabilize = args.stabilize.into();
    info!("Using data root '{}'", settings.root.display());

    let runtime = Arc::new(DockerRuntime::connect(settings.exec_timeout)?);
    let manager = PoolManager::init(settings.clone(), runtime.clone());
    let engine =
        MigrationEngine::new(manager.clone(), runtime, settings);

    if args.status {
        let log = engine.status()?;
        println!("{}", serde_json::to_string_pretty(&log)?);
    } else if let Some(instance) = args.rollback {
        let instance = InstanceId::from(instance);
        engine.rollback(&instance).await?;
        println!("Rolled back '{}' to its dedicated container", instance);
    } else if args.execute {
        let report = engine.execute().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        info!(
            "Migration finished: {} migrated, {} failed",
            report.migrated.len(),
            report.failed.len()
        );
    } else if args.dry_run {
        let plan = engine.dry_run().await?;
        println!("{}", serde_json::to_string_pretty(&plan)?);
        info!(
            "Dry run: {} bots would be placed, {} new pools",
            plan.bots.len(),
            plan.new_pools
        );
    } else {
        CliArgs::clap().print_help()?;
        println!();
        std::process::exit(1);
    }

    manager.shutdown().await;
    Ok(())
}
