use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use providers::ingest::{HttpIngestClient, IngestConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use triage_core::config::{self, AppConfig};
use triage_core::curation::{self, CurateOptions};
use triage_core::discovery;
use triage_core::pipeline::{self, FilterOptions, Sink};
use triage_core::upload::Credentials;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    let mut cfg = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Filter(args) => {
            args.loader.apply(&mut cfg);
            run_filter(cfg, args).await
        }
        Commands::Discover(args) => {
            args.loader.apply(&mut cfg);
            run_discover(cfg, args).await
        }
        Commands::Curate(args) => {
            args.loader.apply(&mut cfg);
            run_curate(cfg, args).await
        }
    }
}

#[derive(Parser)]
#[command(name = "mailtriage")]
#[command(about = "Triage a raw email corpus into curated per-project document sets", long_about = None)]
struct Cli {
    /// Path to config TOML
    #[arg(short, long)]
    config: Option<String>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct LoaderArgs {
    /// Emails per batch
    #[arg(long)]
    chunk_size: Option<usize>,
    /// Parse on a worker pool
    #[arg(long)]
    parallel: bool,
}

impl LoaderArgs {
    fn apply(&self, cfg: &mut AppConfig) {
        if let Some(n) = self.chunk_size {
            cfg.loader.chunk_size = n;
        }
        if self.parallel {
            cfg.loader.parallel = true;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Heuristic + embedding filter, then export or upload
    Filter(FilterArgs),
    /// Find candidate projects in the corpus
    Discover(DiscoverArgs),
    /// Extract, rank and export emails for discovered projects
    Curate(CurateArgs),
}

#[derive(Args)]
struct FilterArgs {
    /// Corpus CSV with `file` and `message` columns
    #[arg(long)]
    corpus: PathBuf,
    #[arg(long, default_value = "data/filtered")]
    output_dir: PathBuf,
    #[arg(long)]
    top_k: Option<usize>,
    #[arg(long)]
    heuristic_threshold: Option<f64>,
    /// Stop after this many parsed emails
    #[arg(long)]
    max_emails: Option<usize>,
    /// Rank by heuristic score only
    #[arg(long)]
    skip_embeddings: bool,
    #[command(flatten)]
    loader: LoaderArgs,
    /// Create a project and upload the filtered set
    #[arg(long)]
    upload: bool,
    #[arg(long, default_value = "Email corpus import")]
    project_name: String,
    #[arg(long, default_value = "Emails selected by the triage pipeline")]
    project_description: String,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    auth_token: Option<String>,
    #[arg(long)]
    upload_batch_size: Option<usize>,
    #[arg(long)]
    upload_delay_ms: Option<u64>,
    /// Output JSON summary
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct DiscoverArgs {
    #[arg(long)]
    corpus: PathBuf,
    #[arg(long, default_value = "data/discovery")]
    output_dir: PathBuf,
    #[arg(long)]
    top_n: Option<usize>,
    #[arg(long)]
    min_thread_size: Option<usize>,
    #[command(flatten)]
    loader: LoaderArgs,
    /// Output JSON summary
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct CurateArgs {
    /// Defaults to the corpus recorded in the discovery file
    #[arg(long)]
    corpus: Option<PathBuf>,
    #[arg(long)]
    discovery_file: PathBuf,
    #[arg(long, default_value = "data/curated")]
    output_dir: PathBuf,
    #[arg(long)]
    deep_top_k: Option<usize>,
    #[arg(long)]
    other_top_k: Option<usize>,
    #[arg(long)]
    skip_embeddings: bool,
    #[command(flatten)]
    loader: LoaderArgs,
    /// Output JSON summary
    #[arg(long)]
    json: bool,
}

async fn run_filter(mut cfg: AppConfig, args: FilterArgs) -> Result<()> {
    if let Some(t) = args.heuristic_threshold {
        cfg.heuristic.threshold = t;
    }
    if let Some(k) = args.top_k {
        cfg.embeddings.top_k = k;
    }
    if let Some(url) = args.api_url {
        cfg.upload.api_url = url;
    }
    if let Some(n) = args.upload_batch_size {
        cfg.upload.batch_size = n;
    }
    if let Some(ms) = args.upload_delay_ms {
        cfg.upload.delay_ms = ms;
    }
    cfg.validate()?;

    // Everything that can fail on configuration is resolved before streaming.
    let registry = pipeline::build_registry(&cfg);
    let ranking = pipeline::resolve_ranking(&cfg, &registry, args.skip_embeddings)?;
    let mut opts = FilterOptions::new(&cfg, args.corpus, args.output_dir);
    opts.max_emails = args.max_emails;

    let client;
    let sink = if args.upload {
        let credentials = Credentials::resolve(args.auth_token, args.email, args.password)?;
        client = HttpIngestClient::new(IngestConfig {
            base_url: cfg.upload.api_url.clone(),
            timeout: Duration::from_secs(cfg.upload.timeout_secs),
        })?;
        Sink::Upload {
            api: &client,
            credentials,
            project_name: args.project_name,
            description: args.project_description,
        }
    } else {
        Sink::Export
    };

    let summary = pipeline::run_filter_pipeline(&cfg, &opts, &ranking, sink).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "filter: parsed {}, passed heuristic {}/{}, kept {}",
            summary.load.parsed, summary.heuristic.passed, summary.heuristic.total, summary.kept
        );
        if let Some(e) = &summary.embeddings {
            println!(
                "embeddings: top_avg {}, failed batches {}/{}",
                e.top_avg_score, e.failed_batches, e.batches
            );
        }
        if let Some(l) = &summary.lifecycle {
            println!(
                "upload: project {} ({}), uploaded {}, failed {}",
                l.project_name, l.project_id, l.upload.uploaded, l.upload.failed
            );
        } else if let Some(x) = &summary.export {
            println!("exported {} emails to {}", x.exported, x.output_dir);
        }
    }
    Ok(())
}

async fn run_discover(mut cfg: AppConfig, args: DiscoverArgs) -> Result<()> {
    if let Some(n) = args.top_n {
        cfg.discovery.top_n = n;
    }
    if let Some(n) = args.min_thread_size {
        cfg.discovery.min_thread_size = n;
    }
    cfg.validate()?;

    let (projects, stats) = discovery::discover_projects(&args.corpus, &cfg).await?;
    discovery::save_results(&projects, &stats, &args.output_dir, &args.corpus).await?;

    if args.json {
        let summary_json = serde_json::json!({
            "status": "ok",
            "output_dir": args.output_dir.display().to_string(),
            "projects": projects,
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&summary_json)?);
    } else {
        println!(
            "discover: {} emails, {} junk, {} duplicates, {} candidate threads",
            stats.total_emails,
            stats.junk_skipped,
            stats.duplicates_skipped,
            stats.threads_above_min_size
        );
        for p in &projects {
            println!(
                "{:>3}. {:<50} score {:>10.1}  emails {:>4}  senders {:>3}{}",
                p.rank,
                p.name.chars().take(50).collect::<String>(),
                p.discovery_score,
                p.email_count,
                p.unique_senders,
                if p.is_deep_project { "  [deep]" } else { "" }
            );
        }
    }
    Ok(())
}

async fn run_curate(mut cfg: AppConfig, args: CurateArgs) -> Result<()> {
    if let Some(k) = args.deep_top_k {
        cfg.curation.deep_top_k = k;
    }
    if let Some(k) = args.other_top_k {
        cfg.curation.other_top_k = k;
    }
    cfg.validate()?;

    let registry = pipeline::build_registry(&cfg);
    let ranking = pipeline::resolve_ranking(&cfg, &registry, args.skip_embeddings)?;
    let opts = CurateOptions {
        discovery_path: args.discovery_file,
        csv_path: args.corpus,
        output_dir: args.output_dir,
    };
    let summary = curation::curate_all_projects(&opts, &ranking, &cfg).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{:<40}  {:>8}  {:>9}  {:>6}", "Project", "Matched", "Exported", "Type");
        for p in &summary.projects {
            println!(
                "{:<40}  {:>8}  {:>9}  {:>6}",
                p.project.chars().take(40).collect::<String>(),
                p.matched,
                p.exported,
                if p.is_deep { "DEEP" } else { "light" }
            );
        }
        println!(
            "{:<40}  {:>8}  {:>9}",
            "TOTAL", summary.totals.total_matched, summary.totals.total_exported
        );
        println!("time: {}s", summary.totals.processing_time_seconds);
    }
    Ok(())
}
