use std::path::PathBuf;

use ahf_api::{ApiClient, ApiContext, AuctionSource};
use ahf_storage::{JsonFileLedger, RunLedger};
use ahf_sync::{
    build_feeder, build_scheduler, FeederConfig, PullPlan, RunSummary, REALM_METADATA_CONCURRENCY,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ahf")]
#[command(about = "Auction House Feeder: pulls auction snapshots into parquet files")]
struct Cli {
    /// YAML config file (defaults to $AHF_CONFIG, then ./ahf.yaml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one pull cycle per realm.
    Pull {
        /// Connected realm id; repeat for several. Overrides configured realms.
        #[arg(long = "realm")]
        realms: Vec<u32>,
        /// Pull every connected realm in the region.
        #[arg(long, conflicts_with = "realms")]
        all: bool,
        /// Also pull region-wide commodities.
        #[arg(long)]
        commodities: bool,
        /// Refresh the connected realm table before pulling.
        #[arg(long)]
        realm_metadata: bool,
        /// Print per-realm outcomes as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Refresh the connected realm table for the configured region.
    Realms {
        /// Only print connected realm ids; fetch no details and write nothing.
        #[arg(long)]
        ids_only: bool,
    },
    /// Show committed runs from the ledger.
    Ledger {
        #[arg(long)]
        realm: Option<u32>,
    },
    /// Pull configured realms on a cron schedule until interrupted.
    Schedule {
        /// Six-field cron expression (with seconds). Overrides `scheduler_cron`.
        #[arg(long)]
        cron: Option<String>,
        #[arg(long)]
        all: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("RUST_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling in-flight pulls");
            trigger.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = FeederConfig::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Pull {
            realms,
            all,
            commodities,
            realm_metadata,
            json,
        } => {
            let mut plan = PullPlan::from_config(&config);
            if !realms.is_empty() {
                plan.realms = realms;
            }
            plan.all_realms = all;
            plan.include_commodities |= commodities;
            plan.include_realm_metadata |= realm_metadata;
            if plan.realms.is_empty() && !plan.all_realms && !plan.include_commodities {
                bail!("no realms to pull: pass --realm, --all or --commodities, or set `realms` in config");
            }

            let feeder = build_feeder(&config).await?;
            let cancel = cancel_on_ctrl_c();
            let results = feeder.run_plan(&plan, &cancel).await?;

            for entry in &results {
                match &entry.result {
                    Ok(outcome) if json => println!("{}", serde_json::to_string(outcome)?),
                    Ok(outcome) => println!(
                        "{}\t{}\tlistings={} skipped={}{}",
                        outcome.key,
                        outcome.location,
                        outcome.listing_count,
                        outcome.skipped_count,
                        if outcome.deduplicated { " (unchanged)" } else { "" }
                    ),
                    Err(failure) => eprintln!("realm {}: {failure}", entry.realm_id),
                }
            }

            let summary = RunSummary::of(&results);
            if summary.failed > 0 {
                bail!("{} of {} realm pulls failed", summary.failed, results.len());
            }
        }
        Commands::Realms { ids_only: true } => {
            let client = ApiClient::new(
                config.api_config(),
                config.credentials()?,
                ApiContext::new(config.rate_limit),
            )?;
            let ids = client
                .connected_realm_ids()
                .await
                .context("fetching connected realm index")?;
            for id in ids {
                println!("{id}");
            }
        }
        Commands::Realms { ids_only: false } => {
            let feeder = build_feeder(&config).await?;
            let cancel = cancel_on_ctrl_c();
            let outcome = feeder
                .refresh_realm_metadata(REALM_METADATA_CONCURRENCY, &cancel)
                .await
                .context("refreshing connected realm metadata")?;
            for realm in &outcome.realms {
                println!(
                    "{}\t{}\t{}\t{}{}",
                    realm.id,
                    realm.realm_names.join(","),
                    realm.status,
                    realm.population,
                    if realm.has_queue { "\tqueue" } else { "" }
                );
            }
            for id in &outcome.missing {
                eprintln!("realm {id}: not found upstream");
            }
            match &outcome.location {
                Some(location) => info!(%location, realms = outcome.realms.len(), "realm table written"),
                None => warn!("no connected realms reported, realm table left unchanged"),
            }
        }
        Commands::Ledger { realm } => {
            let ledger = JsonFileLedger::open(&config.ledger_path)
                .await
                .with_context(|| format!("opening ledger {}", config.ledger_path.display()))?;
            let records = ledger.records().await?;
            for record in records
                .iter()
                .filter(|r| realm.map_or(true, |id| r.key.realm_id == id))
            {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    record.key,
                    record.content_hash.get(..16).unwrap_or(record.content_hash.as_str()),
                    record.listing_count,
                    record.written_at.to_rfc3339(),
                    record.file
                );
            }
        }
        Commands::Schedule { cron, all } => {
            let mut plan = PullPlan::from_config(&config);
            plan.all_realms = all;
            let cron = cron.unwrap_or_else(|| config.scheduler_cron.clone());
            let feeder = build_feeder(&config).await?;
            let cancel = cancel_on_ctrl_c();

            let sched = build_scheduler(feeder, plan, &cron, cancel.clone()).await?;
            sched.start().await?;
            info!(%cron, region = %config.region, "scheduler running");
            cancel.cancelled().await;
            sched.shutdown().await?;
        }
    }

    Ok(())
}
