use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ledger_sync::{load_records, reconciler_from_env, AppendStatus, LedgerConfig};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "ledger-cli")]
#[command(about = "Append scraped tenders into the monthly ledger")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Append a JSON array of producer records to the month of `--date`.
    Append {
        #[arg(long)]
        date: String,
        #[arg(long)]
        input: PathBuf,
        /// Print the rows that would be written without changing the ledger.
        #[arg(long)]
        dry_run: bool,
    },
    /// Show header, last sequence number and identifier count for a month.
    Inspect {
        #[arg(long)]
        date: String,
    },
    /// Print the partition name a date resolves to.
    Partition {
        #[arg(long)]
        date: String,
    },
    /// List the search keywords kept in the workbook.
    Keywords,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = LedgerConfig::from_env();
    info!(backend = %config.backend, "starting");

    match cli.command {
        Commands::Append {
            date,
            input,
            dry_run,
        } => {
            let records = load_records(&input).await?;
            let reconciler = reconciler_from_env()?;
            if dry_run {
                let plan = reconciler.plan(&records, &date).await?;
                println!("{}", serde_json::to_string_pretty(&plan)?);
                return Ok(());
            }
            let report = reconciler
                .append(&records, &date)
                .await
                .with_context(|| format!("appending {}", input.display()))?;
            match &report.status {
                AppendStatus::Appended {
                    count,
                    first_sequence,
                    last_sequence,
                } => println!(
                    "appended {count} rows to {} (sequence {first_sequence}..={last_sequence}, skipped {})",
                    report.partition, report.skipped_duplicates
                ),
                AppendStatus::NothingToAdd(reason) => println!(
                    "nothing to add to {}: {reason:?} (skipped {})",
                    report.partition, report.skipped_duplicates
                ),
            }
            for warning in &report.warnings {
                eprintln!("warning: {warning:?}");
            }
        }
        Commands::Inspect { date } => {
            let snapshot = reconciler_from_env()?.inspect(&date).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Partition { date } => {
            let name = ledger_core::partition_for_date(&date, config.month_locale)?;
            println!("{name}");
        }
        Commands::Keywords => {
            for keyword in reconciler_from_env()?.keywords().await? {
                println!("{keyword}");
            }
        }
    }

    Ok(())
}
