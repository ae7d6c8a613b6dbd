//! Pushes ranked emails into the ingestion API in small, spaced-out batches.
//! Batch failures are counted, never raised.

use crate::config::UploadConfig;
use crate::error::TriageError;
use crate::models::EmbeddingResult;
use providers::ingest::{IngestionApi, UploadFile};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use storage::models::{ExportStats, ExportedEmail};
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub batch_size: usize,
    pub delay: Duration,
}

impl From<&UploadConfig> for UploadOptions {
    fn from(cfg: &UploadConfig) -> Self {
        Self {
            batch_size: cfg.batch_size.max(1),
            delay: Duration::from_millis(cfg.delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub batch: usize,
    pub files: usize,
    pub ok: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStats {
    pub uploaded: usize,
    pub failed: usize,
    pub total: usize,
    pub batches: usize,
    pub batch_results: Vec<BatchOutcome>,
}

pub fn upload_file(result: &EmbeddingResult) -> UploadFile {
    let email = ExportedEmail::from(result);
    UploadFile {
        filename: format!("{}.txt", storage::sanitize_subject(&email.subject)),
        content: storage::render_document(&email, false),
    }
}

/// Uploads sequentially, sleeping `delay` between batches (not after the last).
pub async fn upload_results(
    api: &dyn IngestionApi,
    results: &[EmbeddingResult],
    project_id: &str,
    token: Option<&str>,
    opts: &UploadOptions,
) -> UploadStats {
    let batch_size = opts.batch_size.max(1);
    let total_batches = results.len().div_ceil(batch_size);
    let mut stats = UploadStats {
        total: results.len(),
        batches: total_batches,
        ..Default::default()
    };
    info!(
        "Uploading {} emails to project {} in {} batches",
        results.len(),
        project_id,
        total_batches
    );

    for (i, chunk) in results.chunks(batch_size).enumerate() {
        let batch_num = i + 1;
        let files: Vec<UploadFile> = chunk.iter().map(upload_file).collect();
        match api.upload(project_id, &files, token).await {
            Ok(()) => {
                stats.uploaded += chunk.len();
                info!(
                    "  Batch {}/{}: uploaded {} emails ({} total)",
                    batch_num,
                    total_batches,
                    chunk.len(),
                    stats.uploaded
                );
                stats.batch_results.push(BatchOutcome {
                    batch: batch_num,
                    files: chunk.len(),
                    ok: true,
                    error: None,
                });
            }
            Err(e) => {
                stats.failed += chunk.len();
                error!("  Batch {}/{}: error {}", batch_num, total_batches, e);
                stats.batch_results.push(BatchOutcome {
                    batch: batch_num,
                    files: chunk.len(),
                    ok: false,
                    error: Some(e.to_string()),
                });
            }
        }
        if batch_num < total_batches && !opts.delay.is_zero() {
            tokio::time::sleep(opts.delay).await;
        }
    }

    info!(
        "Upload complete: {} succeeded, {} failed ({} batches)",
        stats.uploaded, stats.failed, stats.batches
    );
    stats
}

/// Either a ready token or login credentials.
#[derive(Debug, Clone)]
pub enum Credentials {
    Token(String),
    Login { email: String, password: String },
}

impl Credentials {
    /// Explicit values win; otherwise `PIPELINE_AUTH_TOKEN`, then
    /// `PIPELINE_EMAIL` + `PIPELINE_PASSWORD`.
    pub fn resolve(
        token: Option<String>,
        email: Option<String>,
        password: Option<String>,
    ) -> Result<Self, TriageError> {
        let var = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());
        if let Some(token) = token.filter(|t| !t.is_empty()).or_else(|| var("PIPELINE_AUTH_TOKEN")) {
            return Ok(Self::Token(token));
        }
        let email = email.or_else(|| var("PIPELINE_EMAIL"));
        let password = password.or_else(|| var("PIPELINE_PASSWORD"));
        match (email, password) {
            (Some(email), Some(password)) => Ok(Self::Login { email, password }),
            _ => Err(TriageError::MissingCredentials(
                "set PIPELINE_AUTH_TOKEN or PIPELINE_EMAIL and PIPELINE_PASSWORD".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleStats {
    pub project_id: String,
    pub project_name: String,
    pub export: ExportStats,
    pub upload: UploadStats,
}

/// Authenticates, creates the project, keeps a local copy, then uploads.
pub async fn create_project_and_upload(
    api: &dyn IngestionApi,
    credentials: &Credentials,
    results: &[EmbeddingResult],
    project_name: &str,
    project_description: &str,
    output_dir: &Path,
    opts: &UploadOptions,
) -> anyhow::Result<LifecycleStats> {
    let token = match credentials {
        Credentials::Token(t) => t.clone(),
        Credentials::Login { email, password } => api.login(email, password).await?,
    };
    let project_id = api
        .create_project(project_name, project_description, Some(&token))
        .await?;
    info!("Created project {} ({})", project_name, project_id);

    let emails: Vec<ExportedEmail> = results.iter().map(ExportedEmail::from).collect();
    let export = storage::export_to_directory(&emails, output_dir, true).await?;
    let upload = upload_results(api, results, &project_id, Some(&token), opts).await;

    Ok(LifecycleStats {
        project_id,
        project_name: project_name.to_string(),
        export,
        upload,
    })
}
