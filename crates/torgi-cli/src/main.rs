use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use torgi_db::PgStore;
use torgi_sync::{HarvestConfig, HarvestPipeline, DEFAULT_CATEGORY};

#[derive(Debug, Parser)]
#[command(name = "torgi-cli")]
#[command(about = "torgi.gov.ru open data harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh the dataset catalog from list.json
    Catalog,
    /// Ingest snapshots for the recent days of one category
    Plans {
        /// How many calendar days back from today to cover
        #[arg(long, default_value_t = 1)]
        days: u32,
        /// Catalog identifier of the category to ingest
        #[arg(long, default_value = DEFAULT_CATEGORY)]
        category: String,
    },
    /// Download and flatten the documents referenced by stored details
    Documents,
    /// Create the torgi schema and tables if they are missing
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = HarvestConfig::from_env();
    let store = PgStore::connect(&config.database_url).await?;
    let pipeline = HarvestPipeline::new(config, store)?;

    match cli.command {
        Some(Commands::Catalog) => run_catalog(&pipeline).await?,
        Some(Commands::Plans { days, category }) => run_plans(&pipeline, days, &category).await?,
        Some(Commands::Documents) => run_documents(&pipeline).await?,
        Some(Commands::Migrate) => {
            pipeline.store().ensure_schema().await?;
            println!("migrate complete: schema torgi is in place");
        }
        // No subcommand runs the full harvest, one stage after another.
        None => {
            run_catalog(&pipeline).await?;
            run_plans(&pipeline, 1, DEFAULT_CATEGORY).await?;
            run_documents(&pipeline).await?;
        }
    }

    Ok(())
}

async fn run_catalog(pipeline: &HarvestPipeline<PgStore>) -> Result<()> {
    let summary = pipeline.refresh_catalog().await?;
    println!(
        "catalog refresh complete: run_id={} listed={} stored={} failed={}",
        summary.run_id, summary.listed, summary.stored, summary.failed
    );
    Ok(())
}

async fn run_plans(pipeline: &HarvestPipeline<PgStore>, days: u32, category: &str) -> Result<()> {
    let today = Local::now().date_naive();
    let summary = pipeline.ingest_snapshots(category, days, today).await?;
    println!(
        "snapshot run complete: run_id={} category={} ingested={} skipped={} details={} failed={} via_fallback={}",
        summary.run_id,
        summary.category,
        summary.snapshots_ingested,
        summary.snapshots_skipped,
        summary.details_upserted,
        summary.details_failed,
        summary.via_fallback
    );
    Ok(())
}

async fn run_documents(pipeline: &HarvestPipeline<PgStore>) -> Result<()> {
    let summary = pipeline.ingest_documents().await?;
    println!(
        "document run complete: run_id={} details={} written={} objects={} no_ops={} skipped={}",
        summary.run_id,
        summary.details,
        summary.documents_written,
        summary.objects_written,
        summary.no_ops,
        summary.skipped
    );
    Ok(())
}
