//! otcpipe - Operational CLI for the OTC transparency ingestion pipeline
//!
//! Thin wrapper over the pipeline's exposed interfaces: run partitions,
//! query readiness and manifests, list and resolve anomalies, apply audited
//! readiness overrides, and reap stale runs.
//!
//! # Usage
//!
//! ```bash
//! otcpipe run --week 2026-01-09 --tier NMS_TIER_1
//! otcpipe run --week 2026-01-09 --all-tiers --force
//! otcpipe readiness --week 2026-01-09 --tier NMS_TIER_1
//! otcpipe anomalies --from 2026-01-02 --to 2026-01-09 --min-severity WARNING
//! ```
//!
//! # Exit Codes
//!
//! - 0: Success (for `readiness`: partition is ready)
//! - 1: `readiness` reported a partition that is not ready
//! - 2: Runtime error (database, conflict, I/O)

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use otcpipe_backend::pipeline::manifest::Stage;
use otcpipe_backend::pipeline::runner::{PipelineRunner, RunOptions};
use otcpipe_backend::pipeline::stages::{FsSourceFetcher, StageLogic};
use otcpipe_backend::pipeline::{Db, Partition, PipelineConfig, Severity, Tier};

#[derive(Parser)]
#[command(name = "otcpipe", about = "Weekly OTC transparency ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline for one week's partitions.
    Run {
        #[arg(long, value_parser = parse_week)]
        week: NaiveDate,
        #[arg(long, value_parser = parse_tier, conflicts_with = "all_tiers")]
        tier: Option<Tier>,
        /// Process every tier for the week.
        #[arg(long)]
        all_tiers: bool,
        /// Re-run downstream stages even when source content is unchanged.
        #[arg(long)]
        force: bool,
        /// Run a single stage (RAW, NORMALIZE or CALC).
        #[arg(long, value_parser = parse_stage)]
        only_stage: Option<Stage>,
    },
    /// Print the readiness verdict for a partition.
    Readiness {
        #[arg(long, value_parser = parse_week)]
        week: NaiveDate,
        #[arg(long, value_parser = parse_tier)]
        tier: Tier,
    },
    /// Print the manifest stage chain for a partition.
    Manifest {
        #[arg(long, value_parser = parse_week)]
        week: NaiveDate,
        #[arg(long, value_parser = parse_tier)]
        tier: Tier,
    },
    /// List unresolved anomalies in a week range.
    Anomalies {
        #[arg(long, value_parser = parse_week)]
        from: NaiveDate,
        #[arg(long, value_parser = parse_week)]
        to: NaiveDate,
        #[arg(long, value_parser = parse_severity, default_value = "INFO")]
        min_severity: Severity,
    },
    /// Resolve an anomaly with an operator note.
    Resolve {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        note: String,
    },
    /// Apply an audited readiness override for a partition.
    Override {
        #[arg(long, value_parser = parse_week)]
        week: NaiveDate,
        #[arg(long, value_parser = parse_tier)]
        tier: Tier,
        /// Pin the partition ready (true) or not ready (false).
        #[arg(long, action = clap::ArgAction::Set)]
        ready: bool,
        #[arg(long, env = "OTCPIPE_OPERATOR")]
        operator: String,
        #[arg(long)]
        note: String,
    },
    /// Reclassify stale RUNNING manifest entries to FAILED.
    Reap,
    /// List expected-but-missing partitions in a week range.
    Gaps {
        #[arg(long, value_parser = parse_week)]
        from: NaiveDate,
        #[arg(long, value_parser = parse_week)]
        to: NaiveDate,
    },
}

fn parse_week(s: &str) -> Result<NaiveDate, String> {
    s.parse()
        .map_err(|_| format!("invalid week date '{}', expected YYYY-MM-DD", s))
}

fn parse_tier(s: &str) -> Result<Tier, String> {
    Tier::parse(s).ok_or_else(|| format!("invalid tier '{}', expected NMS_TIER_1, NMS_TIER_2 or OTCE", s))
}

fn parse_stage(s: &str) -> Result<Stage, String> {
    Stage::parse(s).ok_or_else(|| format!("invalid stage '{}', expected RAW, NORMALIZE or CALC", s))
}

fn parse_severity(s: &str) -> Result<Severity, String> {
    Severity::parse(s)
        .ok_or_else(|| format!("invalid severity '{}', expected INFO, WARNING or CRITICAL", s))
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("error: {:#}", e);
        std::process::exit(2);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = PipelineConfig::from_env();
    let db = Db::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    let fetcher = Arc::new(FsSourceFetcher::new(&config.data_dir));
    let domain = config.domain.clone();
    let runner = Arc::new(PipelineRunner::new(config, db, fetcher, StageLogic::standard()));

    match cli.command {
        Command::Run {
            week,
            tier,
            all_tiers,
            force,
            only_stage,
        } => {
            let tiers: Vec<Tier> = match (tier, all_tiers) {
                (Some(tier), false) => vec![tier],
                (None, true) => Tier::ALL.to_vec(),
                _ => return Err(anyhow!("specify --tier <TIER> or --all-tiers")),
            };
            let partitions: Vec<Partition> = tiers
                .into_iter()
                .map(|tier| Partition::new(&domain, week, tier))
                .collect();
            let options = RunOptions { force, only_stage };
            for (partition, result) in runner.run_many(partitions, options).await {
                match result {
                    Ok(outcome) => {
                        info!(partition = %partition.partition_key(), "run complete");
                        println!("{}", serde_json::to_string_pretty(&outcome)?);
                    }
                    Err(e) => return Err(anyhow!("{}: {}", partition.partition_key(), e)),
                }
            }
        }
        Command::Readiness { week, tier } => {
            let partition = Partition::new(&domain, week, tier);
            let record = runner.get_readiness(&partition)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            if !record.is_ready {
                std::process::exit(1);
            }
        }
        Command::Manifest { week, tier } => {
            let partition = Partition::new(&domain, week, tier);
            let chain = runner.get_manifest(&partition)?;
            println!("{}", serde_json::to_string_pretty(&chain)?);
        }
        Command::Anomalies {
            from,
            to,
            min_severity,
        } => {
            let anomalies = runner.list_unresolved_anomalies((from, to), min_severity)?;
            println!("{}", serde_json::to_string_pretty(&anomalies)?);
        }
        Command::Resolve { id, note } => {
            runner.resolve_anomaly(id, &note)?;
            println!("resolved anomaly {}", id);
        }
        Command::Override {
            week,
            tier,
            ready,
            operator,
            note,
        } => {
            let partition = Partition::new(&domain, week, tier);
            let record = runner.override_readiness(&partition, ready, &operator, &note)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Reap => {
            let reaped = runner.reap_stale()?;
            println!("reaped {} stale running entries", reaped.len());
            for entry in reaped {
                println!("  {} {} (batch {})", entry.partition.partition_key(), entry.stage, entry.batch_id);
            }
        }
        Command::Gaps { from, to } => {
            let missing = runner.missing_partitions((from, to), &Tier::ALL)?;
            if missing.is_empty() {
                println!("no gaps in {}..{}", from, to);
            } else {
                for partition in missing {
                    println!("{}", partition.partition_key());
                }
            }
        }
    }
    Ok(())
}
