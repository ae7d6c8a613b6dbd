//! Per-project curation: one pass over the corpus matches every email against
//! every discovered project, then each project is ranked and exported on its own.

use crate::config::{AppConfig, CurationConfig};
use crate::discovery::is_junk_folder;
use crate::embeddings::{rank_by_heuristic, EmbeddingFilter, RankOptions};
use crate::error::TriageError;
use crate::heuristic::HeuristicScorer;
use crate::loader::{CorpusLoader, LoadStats};
use crate::models::{round_to, DedupeKey, DiscoveryArtifact, EmailRecord, EmbeddingResult, FilterResult};
use crate::subject::normalize_subject;
use providers::EmbeddingProvider;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use storage::models::ExportedEmail;
use tracing::{info, warn};

pub const SUMMARY_FILE: &str = "_curation_summary.json";

const FILLER_WORDS: &[&str] = &[
    "the", "a", "an", "of", "for", "and", "or", "in", "to", "with", "at", "by", "on",
];
const WORD_OVERLAP_RATIO: f64 = 0.6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub slug: String,
    pub keywords: Vec<String>,
    pub seed_queries: Vec<String>,
    pub is_deep: bool,
    pub top_k: usize,
    pub discovery_score: f64,
}

impl ProjectConfig {
    pub fn from_discovered(p: &crate::models::DiscoveredProject, cfg: &CurationConfig) -> Self {
        Self {
            name: p.name.clone(),
            slug: storage::slugify(&p.name),
            keywords: p.keywords.iter().map(|k| k.to_lowercase()).collect(),
            seed_queries: p.seed_queries.clone(),
            is_deep: p.is_deep_project,
            top_k: if p.is_deep_project {
                cfg.deep_top_k
            } else {
                cfg.other_top_k
            },
            discovery_score: p.discovery_score,
        }
    }
}

/// Reads the discovery artifact. A missing file is a configuration error.
pub async fn load_discovery(
    path: &Path,
    cfg: &CurationConfig,
) -> anyhow::Result<(DiscoveryArtifact, Vec<ProjectConfig>)> {
    if !path.is_file() {
        return Err(TriageError::ArtifactNotFound(path.to_path_buf()).into());
    }
    let artifact: DiscoveryArtifact = storage::read_json(path).await?;
    let projects = artifact
        .projects
        .iter()
        .map(|p| ProjectConfig::from_discovered(p, cfg))
        .collect();
    Ok((artifact, projects))
}

fn matches_normalized(subject_lower: &str, project: &ProjectConfig) -> bool {
    let name = project.name.to_lowercase();
    if name.is_empty() {
        return false;
    }
    if subject_lower.contains(&name) || name.contains(subject_lower) {
        return true;
    }
    let name_words: HashSet<&str> = name
        .split_whitespace()
        .filter(|w| !FILLER_WORDS.contains(w))
        .collect();
    if name_words.is_empty() {
        return false;
    }
    let subject_words: HashSet<&str> = subject_lower.split_whitespace().collect();
    let overlap = name_words.intersection(&subject_words).count();
    overlap as f64 / name_words.len() as f64 >= WORD_OVERLAP_RATIO
}

/// Subject-only match: containment either way, or 60% of the name's
/// significant words present in the subject. Bodies are never consulted.
pub fn matches_project(email: &EmailRecord, project: &ProjectConfig) -> bool {
    matches_normalized(&normalize_subject(&email.subject).to_lowercase(), project)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionStats {
    pub scanned: usize,
    pub junk_skipped: usize,
    pub matched: usize,
    pub parse_failures: usize,
}

/// Matches, dedupes (per project) and scores emails for a fixed set of projects.
#[derive(Debug)]
pub struct ProjectCollector {
    projects: Vec<ProjectConfig>,
    scorer: HeuristicScorer,
    matches: Vec<Vec<FilterResult>>,
    seen: Vec<HashSet<DedupeKey>>,
    stats: ExtractionStats,
}

impl ProjectCollector {
    pub fn new(projects: Vec<ProjectConfig>, scorer: HeuristicScorer) -> Self {
        let n = projects.len();
        Self {
            projects,
            scorer,
            matches: vec![Vec::new(); n],
            seen: vec![HashSet::new(); n],
            stats: ExtractionStats::default(),
        }
    }

    pub fn observe(&mut self, email: &EmailRecord) {
        self.stats.scanned += 1;
        if is_junk_folder(&email.folder) {
            self.stats.junk_skipped += 1;
            return;
        }
        let norm = normalize_subject(&email.subject);
        let lower = norm.to_lowercase();
        for (i, project) in self.projects.iter().enumerate() {
            if !matches_normalized(&lower, project) {
                continue;
            }
            if self.seen[i].insert(DedupeKey::with_subject(norm.clone(), email)) {
                self.matches[i].push(self.scorer.score(email));
                self.stats.matched += 1;
            }
        }
    }

    pub fn observe_batch(&mut self, batch: &[EmailRecord]) {
        for email in batch {
            self.observe(email);
        }
    }

    pub fn stats(&self) -> ExtractionStats {
        self.stats
    }

    /// Each project paired with its deduplicated, scored matches.
    pub fn finish(self) -> (Vec<(ProjectConfig, Vec<FilterResult>)>, ExtractionStats) {
        (self.projects.into_iter().zip(self.matches).collect(), self.stats)
    }
}

/// Single streaming pass collecting matches for every project at once.
pub async fn extract_all_projects(
    loader: &CorpusLoader,
    projects: Vec<ProjectConfig>,
    scorer: HeuristicScorer,
) -> anyhow::Result<(Vec<(ProjectConfig, Vec<FilterResult>)>, ExtractionStats)> {
    let mut collector = ProjectCollector::new(projects, scorer);
    let mut stream = loader.stream();
    let mut batches = 0usize;
    while let Some(batch) = stream.next_batch().await {
        collector.observe_batch(&batch);
        batches += 1;
        if batches % 20 == 0 {
            let s = collector.stats();
            info!(
                "  Scanned {} emails, {} matches across all projects",
                s.scanned, s.matched
            );
        }
    }
    let load: LoadStats = stream.finish().await?;
    let (per_project, mut stats) = collector.finish();
    stats.parse_failures = load.failed;

    info!(
        "  Extraction complete: {} scanned, {} total matches",
        stats.scanned, stats.matched
    );
    for (project, matches) in &per_project {
        info!("    {:40} -> {:>5} emails (deduped)", truncate(&project.name, 40), matches.len());
    }
    Ok((per_project, stats))
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// How each project's matches are ordered.
pub enum Ranking {
    /// Heuristic score only; no network calls.
    HeuristicOnly,
    Embeddings(Arc<dyn EmbeddingProvider>),
}

pub async fn rank_project_emails(
    project: &ProjectConfig,
    results: Vec<FilterResult>,
    ranking: &Ranking,
    cfg: &AppConfig,
) -> anyhow::Result<Vec<EmbeddingResult>> {
    if results.is_empty() {
        return Ok(Vec::new());
    }
    match ranking {
        Ranking::HeuristicOnly => Ok(rank_by_heuristic(results, project.top_k)),
        Ranking::Embeddings(provider) => {
            let filter = EmbeddingFilter::new(Arc::clone(provider), cfg.embeddings.clone());
            let opts = RankOptions::from_config(&cfg.embeddings)
                .with_top_k(project.top_k)
                .with_queries(project.seed_queries.clone());
            let (ranked, stats) = filter.apply(results, &opts).await?;
            info!(
                "    {:30} ranked {} -> kept {}",
                truncate(&project.name, 30),
                stats.total,
                stats.kept
            );
            Ok(ranked)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectExport {
    pub project: String,
    pub slug: String,
    pub is_deep: bool,
    pub matched: usize,
    pub exported: usize,
    pub output_dir: Option<String>,
}

/// Writes `<base>/<slug>/` with one file per email and the metadata sidecar.
/// Nothing is written for a project without results.
pub async fn export_project(
    project: &ProjectConfig,
    results: &[EmbeddingResult],
    base_output_dir: &Path,
) -> anyhow::Result<ProjectExport> {
    let mut export = ProjectExport {
        project: project.name.clone(),
        slug: project.slug.clone(),
        is_deep: project.is_deep,
        matched: 0,
        exported: 0,
        output_dir: None,
    };
    if results.is_empty() {
        return Ok(export);
    }
    let dir = base_output_dir.join(&project.slug);
    let emails: Vec<ExportedEmail> = results.iter().map(ExportedEmail::from).collect();
    let stats = storage::export_to_directory(&emails, &dir, true).await?;
    export.exported = stats.exported;
    export.output_dir = Some(stats.output_dir);
    Ok(export)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurationTotals {
    pub total_matched: usize,
    pub total_exported: usize,
    pub scanned: usize,
    pub junk_skipped: usize,
    pub parse_failures: usize,
    pub processing_time_seconds: f64,
}

/// `_curation_summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurationSummary {
    pub csv_path: String,
    pub discovery_file: String,
    pub skip_embeddings: bool,
    pub projects: Vec<ProjectExport>,
    pub totals: CurationTotals,
}

#[derive(Debug, Clone)]
pub struct CurateOptions {
    pub discovery_path: PathBuf,
    /// Falls back to the corpus recorded in the discovery artifact.
    pub csv_path: Option<PathBuf>,
    pub output_dir: PathBuf,
}

/// Load, extract, rank, export. Configuration errors surface before the corpus is read.
pub async fn curate_all_projects(
    opts: &CurateOptions,
    ranking: &Ranking,
    cfg: &AppConfig,
) -> anyhow::Result<CurationSummary> {
    let start = Instant::now();
    let (artifact, projects) = load_discovery(&opts.discovery_path, &cfg.curation).await?;
    let csv_path = opts
        .csv_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(&artifact.csv_path));
    let loader = CorpusLoader::open(&csv_path, cfg.loader.clone())?;

    info!(
        "Found {} projects ({} deep)",
        projects.len(),
        projects.iter().filter(|p| p.is_deep).count()
    );
    for p in &projects {
        info!(
            "  {}  {:45}  top_k={}  keywords={}",
            if p.is_deep { "DEEP" } else { "    " },
            truncate(&p.name, 45),
            p.top_k,
            p.keywords.len()
        );
    }

    let scorer = HeuristicScorer::new(cfg.heuristic.weights.clone());
    let (per_project, extraction) = extract_all_projects(&loader, projects, scorer).await?;

    info!("Ranking emails per project...");
    let mut exports = Vec::with_capacity(per_project.len());
    for (project, matches) in per_project {
        let matched = matches.len();
        if matched == 0 {
            warn!("  No emails found for {}, skipping", project.name);
        }
        let ranked = rank_project_emails(&project, matches, ranking, cfg).await?;
        let mut export = export_project(&project, &ranked, &opts.output_dir).await?;
        export.matched = matched;
        exports.push(export);
    }

    let summary = CurationSummary {
        csv_path: csv_path.display().to_string(),
        discovery_file: opts.discovery_path.display().to_string(),
        skip_embeddings: matches!(ranking, Ranking::HeuristicOnly),
        totals: CurationTotals {
            total_matched: exports.iter().map(|e| e.matched).sum(),
            total_exported: exports.iter().map(|e| e.exported).sum(),
            scanned: extraction.scanned,
            junk_skipped: extraction.junk_skipped,
            parse_failures: extraction.parse_failures,
            processing_time_seconds: round_to(start.elapsed().as_secs_f64(), 1),
        },
        projects: exports,
    };
    storage::write_json(&opts.output_dir.join(SUMMARY_FILE), &summary).await?;
    info!(
        "Curation complete: {} matched, {} exported across {} projects",
        summary.totals.total_matched,
        summary.totals.total_exported,
        summary.projects.len()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DiscoveredProject;

    fn project(name: &str, is_deep: bool) -> ProjectConfig {
        let discovered = DiscoveredProject {
            rank: 1,
            name: name.into(),
            discovery_score: 10.0,
            email_count: 3,
            unique_senders: 2,
            avg_word_count: 40.0,
            date_range: String::new(),
            keywords: vec!["Budget".into()],
            seed_queries: vec!["q".into()],
            is_deep_project: is_deep,
        };
        ProjectConfig::from_discovered(&discovered, &CurationConfig::default())
    }

    fn email(folder: &str, subject: &str) -> EmailRecord {
        EmailRecord {
            file_path: format!("u/{folder}/1."),
            sender: "ken.lay@enron.com".into(),
            subject: subject.into(),
            date: "Mon, 25 Jun 2001 09:00:00 -0700".into(),
            folder: folder.into(),
            body: "budget numbers for the quarter".into(),
            word_count: 5,
            ..Default::default()
        }
    }

    #[test]
    fn subject_containment_matches() {
        let p = project("Q3 Budget Planning", false);
        assert!(matches_project(&email("inbox", "Re: Q3 Budget Planning — action items"), &p));
        assert!(!matches_project(&email("inbox", "lunch plans"), &p));
    }

    #[test]
    fn significant_word_overlap_matches() {
        let p = project("Plan for the Gas Storage Expansion", false);
        // plan, gas, storage, expansion: 3 of 4 present.
        assert!(matches_project(&email("inbox", "Expansion of gas storage tanks"), &p));
        assert!(!matches_project(&email("inbox", "storage tanks expansion"), &p));
    }

    #[test]
    fn deep_projects_get_the_larger_quota() {
        let deep = project("Storage Project", true);
        let light = project("Storage Project", false);
        assert_eq!(deep.top_k, 30);
        assert_eq!(light.top_k, 10);
        assert_eq!(deep.slug, "storage_project");
        assert_eq!(deep.keywords, vec!["budget"]);
    }

    #[test]
    fn collector_dedupes_per_project_and_skips_junk() {
        let projects = vec![project("Q3 Budget Planning", true), project("Budget Planning", false)];
        let mut collector = ProjectCollector::new(projects, HeuristicScorer::default());
        collector.observe(&email("inbox", "Q3 Budget Planning"));
        collector.observe(&email("sent_items", "RE: Q3 Budget Planning"));
        collector.observe(&email("deleted_items", "Q3 Budget Planning"));
        collector.observe(&email("inbox", "Weather"));

        let (per_project, stats) = collector.finish();
        assert_eq!(stats.scanned, 4);
        assert_eq!(stats.junk_skipped, 1);
        // Same email lands in both projects once each.
        assert_eq!(per_project[0].1.len(), 1);
        assert_eq!(per_project[1].1.len(), 1);
        assert_eq!(stats.matched, 2);
    }

    #[tokio::test]
    async fn missing_artifact_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_discovery(&dir.path().join("nope.json"), &CurationConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TriageError>(),
            Some(TriageError::ArtifactNotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_projects_export_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let p = project("Storage Project", false);
        let export = export_project(&p, &[], dir.path()).await.unwrap();
        assert_eq!(export.exported, 0);
        assert!(export.output_dir.is_none());
        assert!(!dir.path().join("storage_project").exists());
    }
}
