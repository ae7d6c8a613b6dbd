use crate::config::AppConfig;
use crate::curation::Ranking;
use crate::embeddings::{rank_by_heuristic, EmbeddingFilter, EmbeddingStats, RankOptions};
use crate::error::TriageError;
use crate::heuristic::{HeuristicScorer, HeuristicStats};
use crate::loader::{CorpusLoader, LoadStats};
use crate::models::{round_to, FilterResult};
use crate::upload::{create_project_and_upload, Credentials, LifecycleStats, UploadOptions};
use providers::gemini::{GeminiConfig, GeminiProvider, DEFAULT_BASE_URL};
use providers::ingest::IngestionApi;
use providers::noop::NoopProvider;
use providers::openai::{OpenAiConfig, OpenAiProvider};
use providers::{EmbeddingProvider, ProviderRegistry};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::models::{ExportStats, ExportedEmail};
use tracing::{info, warn};

pub const STATS_FILE: &str = "_pipeline_stats.json";

pub fn build_registry(config: &AppConfig) -> ProviderRegistry {
    let mut reg = ProviderRegistry::new().with_embedding("noop", Arc::new(NoopProvider));
    let timeout = Duration::from_secs(config.embeddings.timeout_secs);

    if let Some(key) = std::env::var_os("GEMINI_API_KEY").filter(|k| !k.is_empty()) {
        match GeminiProvider::new(GeminiConfig {
            api_key: key.to_string_lossy().into_owned(),
            base_url: DEFAULT_BASE_URL.to_string(),
            embedding_model: config.embeddings.model.clone(),
            timeout,
        }) {
            Ok(provider) => reg = reg.with_embedding("gemini", Arc::new(provider)),
            Err(e) => warn!("Gemini provider unavailable: {}", e),
        }
    }

    if let (Some(key), Some(base)) = (
        std::env::var_os("OPENAI_API_KEY"),
        std::env::var_os("OPENAI_BASE_URL"),
    ) {
        match OpenAiProvider::new(OpenAiConfig {
            api_key: key.to_string_lossy().into_owned(),
            base_url: base.to_string_lossy().into_owned(),
            embedding_model: config.embeddings.model.clone(),
            timeout,
        }) {
            Ok(provider) => reg = reg.with_embedding("openai", Arc::new(provider)),
            Err(e) => warn!("OpenAI provider unavailable: {}", e),
        }
    }

    reg.set_preferred_embedding(&config.embeddings.provider)
}

/// The configured provider, or a credentials error naming what to set.
pub fn embedding_provider(
    config: &AppConfig,
    registry: &ProviderRegistry,
) -> Result<Arc<dyn EmbeddingProvider>, TriageError> {
    registry.embedding(None).map_err(|_| {
        TriageError::MissingCredentials(format!(
            "embedding provider '{}' is not configured (set GEMINI_API_KEY, or OPENAI_API_KEY and OPENAI_BASE_URL)",
            config.embeddings.provider
        ))
    })
}

/// Resolves how to rank before any corpus work starts.
pub fn resolve_ranking(
    config: &AppConfig,
    registry: &ProviderRegistry,
    skip_embeddings: bool,
) -> Result<Ranking, TriageError> {
    if skip_embeddings {
        return Ok(Ranking::HeuristicOnly);
    }
    Ok(Ranking::Embeddings(embedding_provider(config, registry)?))
}

/// Where the filtered set goes.
pub enum Sink<'a> {
    Export,
    Upload {
        api: &'a dyn IngestionApi,
        credentials: Credentials,
        project_name: String,
        description: String,
    },
}

#[derive(Debug, Clone)]
pub struct FilterOptions {
    pub csv_path: PathBuf,
    pub output_dir: PathBuf,
    pub threshold: f64,
    pub top_k: usize,
    /// Stop reading after this many parsed emails.
    pub max_emails: Option<usize>,
}

impl FilterOptions {
    pub fn new(config: &AppConfig, csv_path: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            csv_path,
            output_dir,
            threshold: config.heuristic.threshold,
            top_k: config.embeddings.top_k,
            max_emails: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub csv_path: String,
    pub load: LoadStats,
    pub heuristic: HeuristicStats,
    pub embeddings: Option<EmbeddingStats>,
    pub export: Option<ExportStats>,
    pub lifecycle: Option<LifecycleStats>,
    pub kept: usize,
    pub processing_time_seconds: f64,
}

/// Linear pipeline: stream and score, rank the survivors, then export or upload.
/// Writes `_pipeline_stats.json` into the output directory.
pub async fn run_filter_pipeline(
    config: &AppConfig,
    opts: &FilterOptions,
    ranking: &Ranking,
    sink: Sink<'_>,
) -> anyhow::Result<PipelineSummary> {
    let start = Instant::now();
    let loader = CorpusLoader::open(&opts.csv_path, config.loader.clone())?;
    let scorer = HeuristicScorer::new(config.heuristic.weights.clone());

    info!("Starting heuristic phase...");
    let mut stream = loader.stream();
    let mut passed: Vec<FilterResult> = Vec::new();
    let mut heuristic = HeuristicStats::default();
    let mut seen = 0usize;
    while let Some(mut batch) = stream.next_batch().await {
        if let Some(limit) = opts.max_emails {
            batch.truncate(limit.saturating_sub(seen));
        }
        seen += batch.len();
        let (batch_passed, stats) = scorer.filter(&batch, opts.threshold);
        heuristic.merge(&stats);
        passed.extend(batch_passed);
        if opts.max_emails.is_some_and(|limit| seen >= limit) {
            info!("Reached max_emails={}, stopping early", seen);
            break;
        }
    }
    let load = stream.finish().await?;
    info!(
        "Heuristic phase complete: {}/{} passed",
        heuristic.passed, heuristic.total
    );

    let (ranked, embeddings) = match ranking {
        Ranking::HeuristicOnly => {
            info!("Embeddings skipped, ranking by heuristic score");
            (rank_by_heuristic(passed, opts.top_k), None)
        }
        Ranking::Embeddings(provider) => {
            info!("Starting embedding phase...");
            let filter = EmbeddingFilter::new(Arc::clone(provider), config.embeddings.clone());
            let rank_opts = RankOptions::from_config(&config.embeddings).with_top_k(opts.top_k);
            let (ranked, stats) = filter.apply(passed, &rank_opts).await?;
            (ranked, Some(stats))
        }
    };

    let (export, lifecycle) = match sink {
        Sink::Export => {
            let emails: Vec<ExportedEmail> = ranked.iter().map(ExportedEmail::from).collect();
            let stats = storage::export_to_directory(&emails, &opts.output_dir, true).await?;
            (Some(stats), None)
        }
        Sink::Upload {
            api,
            credentials,
            project_name,
            description,
        } => {
            info!("Starting upload phase...");
            let upload_opts = UploadOptions::from(&config.upload);
            let stats = create_project_and_upload(
                api,
                &credentials,
                &ranked,
                &project_name,
                &description,
                &opts.output_dir,
                &upload_opts,
            )
            .await?;
            (None, Some(stats))
        }
    };

    let summary = PipelineSummary {
        csv_path: opts.csv_path.display().to_string(),
        load,
        heuristic,
        embeddings,
        export,
        lifecycle,
        kept: ranked.len(),
        processing_time_seconds: round_to(start.elapsed().as_secs_f64(), 1),
    };
    storage::write_json(&opts.output_dir.join(STATS_FILE), &summary).await?;
    info!("Pipeline complete. Kept {} emails.", summary.kept);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_is_a_credentials_error() {
        let mut cfg = AppConfig::default();
        cfg.embeddings.provider = "does-not-exist".into();
        let reg = build_registry(&cfg);
        assert!(matches!(
            resolve_ranking(&cfg, &reg, false),
            Err(TriageError::MissingCredentials(_))
        ));
        assert!(matches!(
            resolve_ranking(&cfg, &reg, true),
            Ok(Ranking::HeuristicOnly)
        ));
    }

    #[test]
    fn noop_provider_is_always_registered() {
        let mut cfg = AppConfig::default();
        cfg.embeddings.provider = "noop".into();
        let reg = build_registry(&cfg);
        assert!(embedding_provider(&cfg, &reg).is_ok());
    }
}
