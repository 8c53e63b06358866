use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cli::report::{self, IngestOutcome, IngestSummary};
use futures::{StreamExt, TryStreamExt};
use providers::IndexRecord;
use snapdex_core::config::{self, AppConfig};
use snapdex_core::pipeline::{build_pipeline, open_pipeline};
use snapdex_core::{scanner, IngestionPipeline, StatusError, SubmitError, SubmitRequest};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Ingest { paths, id, json } => {
            // Only the ingesting process owns jobs; it replays and sweeps the journal.
            let pipeline = build_pipeline(&cfg).await.context("build pipeline")?;
            pipeline.sweep().await?;
            run_ingest(&cfg, &pipeline, paths, id, json).await
        }
        Commands::Status { id, json } => {
            let pipeline = open_pipeline(&cfg).await.context("open pipeline")?;
            run_status(&pipeline, &id, json).await
        }
        Commands::Search { query, limit, json } => {
            let pipeline = open_pipeline(&cfg).await.context("open pipeline")?;
            run_search(&pipeline, &query, limit, json).await
        }
    }
}

#[derive(Parser)]
#[command(name = "snapdex")]
#[command(about = "Annotate images and index their labels and colors", long_about = None)]
struct Cli {
    /// Path to config TOML
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit images (files or directories) and wait for them to be indexed
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Explicit id; only valid with a single image
        #[arg(long)]
        id: Option<String>,
        /// Output JSON summary
        #[arg(long)]
        json: bool,
    },
    /// Show the state of a job
    Status {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Query the index by label text
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
}

async fn run_ingest(
    cfg: &AppConfig,
    pipeline: &IngestionPipeline,
    paths: Vec<PathBuf>,
    id: Option<String>,
    json: bool,
) -> Result<()> {
    let files = scanner::discover(&paths, &cfg.scan.include, &cfg.scan.exclude)
        .context("discover media")?;
    if id.is_some() && files.len() != 1 {
        bail!("--id needs exactly one image, found {}", files.len());
    }
    info!(discovered = files.len(), "starting ingest");

    let mut submitted = Vec::with_capacity(files.len());
    let mut summary = IngestSummary {
        discovered: files.len(),
        ..Default::default()
    };
    for file in &files {
        let path = file.to_string_lossy().into_owned();
        let mut request = SubmitRequest::new(path.clone());
        if let Some(id) = &id {
            request = request.with_id(id.clone());
        }
        match pipeline.submit(request).await {
            Ok(job_id) => submitted.push((job_id, path)),
            Err(SubmitError::DuplicateInFlight(job_id)) => {
                info!(path = %path, id = %job_id, "same content already submitted");
                summary.skip_duplicate(job_id, path);
            }
            Err(e) => {
                warn!(path = %path, "not submitted: {e}");
                summary.failed += 1;
            }
        }
    }

    for (job_id, path) in submitted {
        let state = pipeline.wait(&job_id).await?;
        let outcome = IngestOutcome {
            id: job_id,
            path,
            state,
        };
        if !json {
            println!("{}", report::outcome_line(&outcome));
        }
        summary.push(outcome);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", report::summary_line(&summary));
    }
    if summary.failed > 0 {
        bail!("{} of {} item(s) failed", summary.failed, summary.discovered);
    }
    Ok(())
}

async fn run_status(pipeline: &IngestionPipeline, id: &str, json: bool) -> Result<()> {
    let state = match pipeline.status(id).await {
        Ok(state) => state,
        Err(StatusError::NotFound(_)) => bail!("no job with id {id}"),
        Err(e) => return Err(e.into()),
    };
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report::status_json(id, &state))?
        );
    } else {
        println!("{id}  {state}");
    }
    Ok(())
}

async fn run_search(
    pipeline: &IngestionPipeline,
    query: &str,
    limit: usize,
    json: bool,
) -> Result<()> {
    let hits: Vec<IndexRecord> = pipeline
        .query(query)
        .take(limit)
        .try_collect()
        .await
        .context("search index")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
    } else {
        for hit in &hits {
            println!("{}", report::hit_line(hit));
        }
        println!("{} hit(s)", hits.len());
    }
    Ok(())
}
