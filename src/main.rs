//! snapwarden: snapshot lifecycle automation for AWS
//!
//! Exports Aurora cluster snapshots to S3 through a bounded queue, deletes
//! snapshots once their archive has aged, purges EC2 snapshots against
//! retention rules, and keeps the canonical tag set applied.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use snapwarden::adjudicate::{purge_snapshots, Adjudicator, PurgeConfig, PurgeRules};
use snapwarden::aws::{AwsContext, Gateway, InventoryRequest, SdkInvoker};
use snapwarden::cache::ResponseCache;
use snapwarden::model::ec2::SnapshotInventory;
use snapwarden::model::rds::{delete_archived, DeleteConfig};
use snapwarden::queue::{ExportConfig, ExportQueue, ExportTask, QueueReport};
use snapwarden::report;
use snapwarden::tags::{
    apply_tags, default_tag_config, resolve_tags, resource_arn, sync_snapshot_tags, StdinPrompter,
    TagSyncConfig,
};
use snapwarden::util::parse_timestamp;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "snapwarden")]
#[command(about = "Snapshot lifecycle automation for AWS")]
#[command(version)]
struct Args {
    /// AWS region
    #[arg(long, global = true, default_value = "us-east-1")]
    region: String,

    /// AWS profile to use (overrides AWS_PROFILE env var)
    #[arg(long, global = true)]
    aws_profile: Option<String>,

    /// Directory for cached API responses
    #[arg(long, global = true, default_value = "data/cache")]
    cache_dir: PathBuf,

    /// Cache TTL in seconds for inventory reads (0 disables reuse)
    #[arg(long, global = true, default_value_t = 3600)]
    cache_ttl: u64,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable trace logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the EC2 snapshot inventory, grouped by derived name
    DescribeSnapshots {
        /// Write the listing to a CSV file as well
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// List RDS export tasks and their progress
    DescribeExports {
        /// Write the listing to a CSV file as well
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Queue Aurora cluster snapshot exports to S3, up to the batch limit
    Export {
        /// Destination S3 bucket
        #[arg(long)]
        bucket: String,

        /// IAM role the export runs as
        #[arg(long, env = "SNAPWARDEN_EXPORT_ROLE")]
        iam_role_arn: String,

        /// KMS key the export is encrypted with
        #[arg(long, env = "SNAPWARDEN_EXPORT_KEY")]
        kms_key_id: String,

        /// Plan the queue without starting exports
        #[arg(long)]
        dry_run: bool,

        /// Write the run report to a CSV file as well
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Delete cluster snapshots whose S3 archive has aged past the window
    DeleteArchived {
        /// Bucket holding the archives
        #[arg(long)]
        bucket: String,

        /// Maximum deletions this run (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        limit: usize,

        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,

        /// Write the deletion report to a CSV file as well
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Adjudicate EC2 snapshot groups against retention rules and delete
    /// the losers
    Purge {
        /// Only judge groups whose name matches this pattern
        #[arg(long, default_value = "")]
        name: String,

        /// Remove snapshots created before this date (e.g. 2024-01-01)
        #[arg(long)]
        delete_older_than: Option<String>,

        /// Retain snapshots created after this date
        #[arg(long)]
        retain_newer_than: Option<String>,

        /// Always retain the oldest snapshot of each group
        #[arg(long)]
        retain_oldest: bool,

        /// Always retain the newest snapshot of each group
        #[arg(long)]
        retain_newest: bool,

        /// Retain snapshots marked end-of-life in their description or name
        #[arg(long)]
        retain_eol: bool,

        /// Maximum deletions this run (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        limit: usize,

        /// Show verdicts without deleting
        #[arg(long)]
        dry_run: bool,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,

        /// Don't print the verdict table
        #[arg(long)]
        suppress_output: bool,

        /// Write the verdicts to a CSV file as well
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Interactively resolve and apply the canonical tag set to a resource
    Tag {
        /// Resource id (vol-, snap-, i-, elb-, s3-, redshift-) or full ARN
        resource: String,

        /// Service the resource belongs to, for tag visibility and defaults
        #[arg(long, default_value = "ec2")]
        service: String,

        /// Show the tags without applying them
        #[arg(long)]
        dry_run: bool,
    },

    /// Propagate volume tags to snapshots that are missing them
    TagSync {
        /// Plan the tagging without applying it
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&e);
        std::process::exit(1);
    }
}

/// Print error in a user-friendly way
fn print_error(e: &anyhow::Error) {
    use std::io::Write;

    let mut stderr = std::io::stderr();

    let _ = writeln!(stderr, "\n\x1b[1;31mError:\x1b[0m {e}");

    let mut source = e.source();
    while let Some(cause) = source {
        let _ = writeln!(stderr, "  \x1b[33mCaused by:\x1b[0m {cause}");
        source = cause.source();
    }

    if std::env::var("RUST_BACKTRACE").is_err() {
        let _ = writeln!(
            stderr,
            "\n\x1b[2mSet RUST_BACKTRACE=1 for a detailed backtrace\x1b[0m"
        );
    } else {
        let backtrace = e.backtrace();
        if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            let _ = writeln!(stderr, "\n\x1b[2mBacktrace:\x1b[0m\n{backtrace}");
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug {
        tracing::Level::TRACE
    } else if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .init();

    let ctx = AwsContext::new(&args.region, args.aws_profile.as_deref());
    if let Some(profile) = &args.aws_profile {
        info!(profile = %profile, "Using AWS profile");
    }
    let namespace = ctx
        .session_namespace()
        .await
        .context("failed to resolve caller identity")?;
    let run_id = uuid::Uuid::new_v4().to_string();
    let cache = ResponseCache::new(&args.cache_dir, &run_id);
    let gateway = Gateway::new(SdkInvoker::new(ctx.clone()), cache, namespace);

    match args.command {
        Command::DescribeSnapshots { output } => {
            let inventory = SnapshotInventory::load(&gateway, args.cache_ttl, None).await?;
            info!(snapshots = inventory.snapshots.len(), "inventory loaded");

            let snapshots: Vec<_> = inventory
                .grouped()
                .into_iter()
                .flat_map(|(_, group)| group)
                .collect();
            println!("{}", report::verdict_table(&snapshots));
            if let Some(path) = output {
                report::write_report(&path, &report::verdict_csv(&snapshots))?;
                info!(path = %path.display(), "report written");
            }
        }

        Command::DescribeExports { output } => {
            let records = gateway
                .records(
                    &InventoryRequest::new("rds", "describe_export_tasks")
                        .extraction_key("ExportTasks")
                        .params(json!({"PaginationConfig": {"MaxRecords": 100}})),
                )
                .await?;
            let mut tasks = Vec::new();
            for record in records {
                tasks.push(ExportTask::from_record(record)?);
            }
            if tasks.is_empty() {
                println!("No export tasks");
            } else {
                println!("{}", report::export_tasks_table(&tasks));
            }
            if let Some(path) = output {
                report::write_report(&path, &report::export_tasks_csv(&tasks))?;
                info!(path = %path.display(), "report written");
            }
        }

        Command::Export {
            bucket,
            iam_role_arn,
            kms_key_id,
            dry_run,
            output,
        } => {
            let queue = ExportQueue::new(
                &gateway,
                ExportConfig {
                    bucket,
                    iam_role_arn,
                    kms_key_id,
                    dry_run,
                    cache_ttl: args.cache_ttl,
                    region: None,
                },
            );
            let state = queue.run().await?;
            let summary = QueueReport::from_state(&state);
            println!("{}", report::queue_report_table(&summary));
            if !state.active.is_empty() {
                println!("{}", report::export_tasks_table(&state.active));
            }
            if let Some(path) = output {
                report::write_report(&path, &report::queue_report_csv(&summary))?;
                info!(path = %path.display(), "report written");
            }
        }

        Command::DeleteArchived {
            bucket,
            limit,
            dry_run,
            output,
        } => {
            let outcome = delete_archived(
                &gateway,
                &DeleteConfig {
                    bucket,
                    limit,
                    dry_run,
                    cache_ttl: args.cache_ttl,
                },
            )
            .await?;
            println!("{}", report::delete_rows_table(&outcome.rows));
            println!(
                "deleted: {}  retained: {}  failed: {}",
                outcome.deleted, outcome.retained, outcome.failed
            );
            if let Some(path) = output {
                report::write_report(&path, &report::delete_rows_csv(&outcome.rows))?;
                info!(path = %path.display(), "report written");
            }
        }

        Command::Purge {
            name,
            delete_older_than,
            retain_newer_than,
            retain_oldest,
            retain_newest,
            retain_eol,
            limit,
            dry_run,
            yes,
            suppress_output,
            output,
        } => {
            let rules = PurgeRules {
                name,
                delete_older_than: parse_date_arg(delete_older_than.as_deref())?,
                retain_newer_than: parse_date_arg(retain_newer_than.as_deref())?,
                retain_oldest,
                retain_newest,
                retain_eol,
            };
            // Surface a bad pattern before touching AWS.
            Adjudicator::new(rules.clone())
                .with_context(|| format!("invalid name filter '{}'", rules.name))?;

            if !dry_run && !yes && !confirm_purge()? {
                bail!("purge not confirmed");
            }

            let outcome = purge_snapshots(
                &gateway,
                &PurgeConfig {
                    rules,
                    limit,
                    dry_run,
                    cache_ttl: args.cache_ttl,
                    region: None,
                },
            )
            .await?;

            if !suppress_output {
                println!("{}", report::verdict_table(&outcome.judged));
            }
            println!(
                "deleted: {}  retained: {}  failed: {}  skipped: {}",
                outcome.deleted, outcome.retained, outcome.failed, outcome.skipped
            );
            if let Some(path) = output {
                report::write_report(&path, &report::verdict_csv(&outcome.judged))?;
                info!(path = %path.display(), "report written");
            }
        }

        Command::Tag {
            resource,
            service,
            dry_run,
        } => {
            let identity = ctx.caller_identity().await?;
            let arn = resource_arn(&args.region, &identity.account, &resource)?;
            let tags = resolve_tags(&default_tag_config(), &[], &service, &mut StdinPrompter)?;
            apply_tags(&gateway, Some(&args.region), &arn, &tags, dry_run).await?;
        }

        Command::TagSync { dry_run } => {
            let identity = ctx.caller_identity().await?;
            let outcome = sync_snapshot_tags(
                &gateway,
                &TagSyncConfig {
                    account: identity.account,
                    region: args.region.clone(),
                    dry_run,
                    cache_ttl: args.cache_ttl,
                },
            )
            .await?;
            println!(
                "snapshots planned: {}  tagged: {}  failed: {}",
                outcome.planned.len(),
                outcome.tagged,
                outcome.failed
            );
        }
    }

    Ok(())
}

fn parse_date_arg(raw: Option<&str>) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    match raw {
        None => Ok(None),
        Some(raw) => parse_timestamp(raw)
            .map(Some)
            .with_context(|| format!("unparsable date '{raw}'")),
    }
}

/// One explicit confirmation before deleting snapshots for real.
fn confirm_purge() -> Result<bool> {
    use std::io::{BufRead, Write};

    let mut stderr = std::io::stderr();
    write!(stderr, "Type 'delete' to remove the losing snapshots: ")?;
    stderr.flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim() == "delete")
}
