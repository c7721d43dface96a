use anyhow::Result;
use clap::{Parser, Subcommand};
use omd_sync::config::{self, Config, ProviderKind};
use omd_sync::db;
use omd_sync::feed::{SpFeedClient, ThrottleGate};
use omd_sync::model::RunHooks;
use omd_sync::reconcile::ReconcileEngine;
use omd_sync::submit::SubmissionEngine;
use omd_sync::supplier::bestbuy::BestBuyClient;
use omd_sync::supplier::vitacost::VitacostClient;
use omd_sync::supplier::SupplierClient;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Supplier to marketplace inventory synchronization")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print a canonical example configuration and exit
    #[arg(long)]
    print_example: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sweep supplier APIs and flag changed product rows
    Reconcile {
        /// Restrict to one configured source
        #[arg(long)]
        source: Option<String>,
    },
    /// Submit flagged rows to the marketplace as listing feeds
    Submit {
        #[arg(long)]
        source: Option<String>,
    },
    /// Reconcile, then submit
    Run {
        #[arg(long)]
        source: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://omd-sync.db".to_string());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let hooks = ctrl_c_hooks();
    let result = match args.command.unwrap_or(Command::Run { source: None }) {
        Command::Reconcile { source } => reconcile(&pool, &cfg, source.as_deref(), &hooks).await,
        Command::Submit { source } => submit(&pool, &cfg, source.as_deref(), &hooks).await,
        Command::Run { source } => {
            reconcile(&pool, &cfg, source.as_deref(), &hooks).await?;
            submit(&pool, &cfg, source.as_deref(), &hooks).await
        }
    };

    db::close_pool(&pool).await;
    result
}

/// Hooks whose cancel predicate trips on the first Ctrl-C.
fn ctrl_c_hooks() -> RunHooks {
    let flag = Arc::new(AtomicBool::new(false));
    let watched = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight work then stopping");
            watched.store(true, Ordering::SeqCst);
        }
    });
    RunHooks::default().with_cancel(move || flag.load(Ordering::SeqCst))
}

fn selected<'a>(cfg: &'a Config, source: Option<&'a str>) -> Result<Vec<&'a str>> {
    match source {
        Some(id) => {
            cfg.source(id)?;
            Ok(vec![id])
        }
        None => Ok(cfg.sources.keys().map(String::as_str).collect()),
    }
}

fn supplier_client(source_id: &str, src: &config::SourceConfig) -> Arc<dyn SupplierClient> {
    match src.provider {
        ProviderKind::BestBuy => Arc::new(BestBuyClient::new(source_id, &src.api_base_url)),
        ProviderKind::Vitacost => Arc::new(VitacostClient::new(source_id, &src.api_base_url)),
    }
}

async fn reconcile(
    pool: &db::Pool,
    cfg: &Config,
    source: Option<&str>,
    hooks: &RunHooks,
) -> Result<()> {
    for source_id in selected(cfg, source)? {
        let src = cfg.source(source_id)?.clone();
        let client = supplier_client(source_id, &src);
        let engine = ReconcileEngine::new(pool.clone(), source_id, src, client);
        let summary = engine.reconcile_source(hooks.clone()).await?;
        info!(
            source_id,
            updated = summary.updated,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "reconcile finished"
        );
    }
    Ok(())
}

async fn submit(
    pool: &db::Pool,
    cfg: &Config,
    source: Option<&str>,
    hooks: &RunHooks,
) -> Result<()> {
    let api = Arc::new(SpFeedClient::new(cfg.marketplace.clone()));
    let gate = Arc::new(ThrottleGate::new(Duration::from_secs(
        cfg.app.throttle_backoff_secs,
    )));

    let mut all_done = true;
    for source_id in selected(cfg, source)? {
        let src = cfg.source(source_id)?.clone();
        let engine = SubmissionEngine::new(
            pool.clone(),
            source_id,
            src,
            cfg.marketplace.clone(),
            api.clone(),
            gate.clone(),
            &cfg.app.feeds_dir,
            Duration::from_secs(cfg.app.status_poll_secs),
        );
        let summary = engine.run_submission(hooks.clone()).await?;
        for (i, batch) in summary.batches.iter().enumerate() {
            info!(
                source_id,
                batch = i + 1,
                status = batch.status.as_str(),
                items = batch.item_count,
                "batch outcome"
            );
        }
        if !summary.success {
            all_done = false;
        }
    }
    if !all_done {
        warn!("some batches did not complete; their rows stay flagged for the next run");
    }
    Ok(())
}
