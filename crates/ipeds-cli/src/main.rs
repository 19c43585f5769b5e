use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use ipeds_core::Entity;
use ipeds_sync::{RunOptions, RunSummary};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ipeds-cli")]
#[command(about = "IPEDS survey ETL into the institutional research warehouse")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, transform, and load entities year by year (default).
    Run(RunArgs),
    /// Populate the local snapshot cache only.
    Fetch {
        #[arg(long)]
        dataset: Option<String>,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        refresh: bool,
    },
    /// Apply warehouse migrations.
    Migrate,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// institutions, fall-enrollment, finance, or finance-fields
    #[arg(long)]
    entity: Option<Entity>,
    #[arg(long)]
    year: Option<i32>,
    /// Ignore cached snapshots.
    #[arg(long)]
    refresh: bool,
    /// Transform only; nothing is written to the warehouse.
    #[arg(long)]
    dry_run: bool,
}

fn print_summary(summary: &RunSummary) {
    for unit in &summary.units {
        println!("{unit}");
    }
    println!("{}", summary.total_line());
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let summary = ipeds_sync::run_from_env(RunOptions {
                entity: args.entity,
                year: args.year,
                refresh: args.refresh,
                dry_run: args.dry_run,
            })
            .await?;
            print_summary(&summary);
            if summary.failures() > 0 {
                std::process::exit(2);
            }
        }
        Commands::Fetch {
            dataset,
            year,
            refresh,
        } => {
            let summary = ipeds_sync::fetch_from_env(dataset.as_deref(), year, refresh).await?;
            print_summary(&summary);
        }
        Commands::Migrate => {
            ipeds_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
