use crate::error::TriageError;
use crate::heuristic::HeuristicWeights;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub loader: LoaderConfig,
    pub heuristic: HeuristicConfig,
    pub embeddings: EmbeddingConfig,
    pub discovery: DiscoveryConfig,
    pub curation: CurationConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub chunk_size: usize,
    pub parallel: bool,
    /// 0 means one less than the number of cores.
    pub workers: usize,
    pub pool_chunk_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5000,
            parallel: false,
            workers: 0,
            pool_chunk_size: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicConfig {
    pub threshold: f64,
    pub weights: HeuristicWeights,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            threshold: 0.15,
            weights: HeuristicWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub max_text_chars: usize,
    pub top_k: usize,
    pub heuristic_weight: f64,
    pub embedding_weight: f64,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: "text-embedding-004".to_string(),
            batch_size: 100,
            max_concurrent: 5,
            max_text_chars: 2000,
            top_k: 2000,
            heuristic_weight: 0.3,
            embedding_weight: 0.7,
            timeout_secs: 60,
            retry: RetryPolicy::default(),
        }
    }
}

/// Retries per embedding batch before the zero-vector fallback kicks in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 2000,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given retry attempt (1-based), capped.
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let ms = self.backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        std::time::Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub top_n: usize,
    pub min_thread_size: usize,
    pub min_unique_senders: usize,
    pub min_avg_words: f64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            top_n: 15,
            min_thread_size: 3,
            min_unique_senders: 2,
            min_avg_words: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CurationConfig {
    pub deep_top_k: usize,
    pub other_top_k: usize,
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            deep_top_k: 30,
            other_top_k: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub api_url: String,
    pub batch_size: usize,
    pub delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".to_string(),
            batch_size: 5,
            delay_ms: 2000,
            timeout_secs: 120,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), TriageError> {
        let invalid = |msg: &str| Err(TriageError::InvalidConfig(msg.to_string()));
        if self.loader.chunk_size == 0 {
            return invalid("loader.chunk_size must be > 0");
        }
        if self.loader.pool_chunk_size == 0 {
            return invalid("loader.pool_chunk_size must be > 0");
        }
        let e = &self.embeddings;
        if e.batch_size == 0 || e.max_concurrent == 0 {
            return invalid("embeddings.batch_size and embeddings.max_concurrent must be > 0");
        }
        if e.top_k == 0 {
            return invalid("embeddings.top_k must be >= 1");
        }
        if !(0.0..=1.0).contains(&e.heuristic_weight) || !(0.0..=1.0).contains(&e.embedding_weight)
        {
            return invalid("embeddings weights must be in [0.0, 1.0]");
        }
        if self.upload.batch_size == 0 {
            return invalid("upload.batch_size must be > 0");
        }
        if self.discovery.top_n == 0 {
            return invalid("discovery.top_n must be >= 1");
        }
        Ok(())
    }
}

/// Loads the optional TOML file, then `TRIAGE__SECTION__KEY` environment overrides.
pub fn load(path: Option<&str>) -> anyhow::Result<AppConfig> {
    let mut settings = config::Config::builder();
    if let Some(p) = path {
        settings = settings.add_source(config::File::with_name(p));
    } else {
        settings = settings.add_source(config::File::with_name("config/default").required(false));
    }
    settings = settings.add_source(
        config::Environment::with_prefix("TRIAGE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );
    let cfg: AppConfig = settings.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}
