//! Tier 2: semantic re-ranking against a set of reference queries.
//!
//! Emails are embedded in provider-sized batches with a bounded number of
//! requests in flight. A batch that still fails after the retry policy is
//! scored with zero vectors, which ranks it purely on its heuristic score.

use crate::config::{EmbeddingConfig, RetryPolicy};
use crate::models::{round_to, EmbeddingResult, FilterResult};
use anyhow::Context;
use futures::stream::{self, StreamExt};
use providers::{EmbeddingProvider, ProviderError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_REFERENCE_QUERIES: [&str; 10] = [
    "project requirements and technical specifications for software development",
    "stakeholder decision on feature prioritization and scope changes",
    "timeline and deadline discussion for project milestones and deliverables",
    "budget allocation, resource planning, and cost estimation for a project",
    "technical architecture decision and system design review",
    "business requirements gathering meeting with stakeholder feedback",
    "risk assessment and mitigation strategy for project delivery",
    "user requirements, acceptance criteria, and functional specifications",
    "project status update with blockers, action items, and next steps",
    "contract negotiation, service level agreement, and compliance requirements",
];

/// Cosine similarity in `[-1, 1]`; `0.0` when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// `"Subject: {s}\n\n{body}"`, cut to `max_chars` characters.
pub fn prepare_email_text(result: &FilterResult, max_chars: usize) -> String {
    let em = &result.email;
    let text = format!("Subject: {}\n\n{}", em.subject, em.body);
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text,
    }
}

#[derive(Debug, Clone)]
pub struct RankOptions {
    pub top_k: usize,
    pub heuristic_weight: f64,
    pub embedding_weight: f64,
    /// `None` or empty means [`DEFAULT_REFERENCE_QUERIES`].
    pub reference_queries: Option<Vec<String>>,
}

impl RankOptions {
    pub fn from_config(cfg: &EmbeddingConfig) -> Self {
        Self {
            top_k: cfg.top_k,
            heuristic_weight: cfg.heuristic_weight,
            embedding_weight: cfg.embedding_weight,
            reference_queries: None,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_queries(mut self, queries: Vec<String>) -> Self {
        self.reference_queries = Some(queries);
        self
    }

    fn queries(&self) -> Vec<String> {
        match &self.reference_queries {
            Some(q) if !q.is_empty() => q.clone(),
            _ => DEFAULT_REFERENCE_QUERIES.iter().map(|q| q.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingStats {
    pub total: usize,
    pub kept: usize,
    pub top_k: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub all_avg_score: f64,
    pub top_avg_score: f64,
    pub top_min_score: f64,
    pub top_max_score: f64,
}

fn mean(scores: &[f64]) -> f64 {
    round_to(scores.iter().sum::<f64>() / scores.len().max(1) as f64, 4)
}

pub struct EmbeddingFilter {
    provider: Arc<dyn EmbeddingProvider>,
    cfg: EmbeddingConfig,
}

impl EmbeddingFilter {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, cfg: EmbeddingConfig) -> Self {
        Self { provider, cfg }
    }

    fn batch_size(&self) -> usize {
        self.cfg.batch_size.min(self.provider.max_batch_size()).max(1)
    }

    async fn embed_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let resp = self.provider.embed(texts).await?;
        if resp.vectors.len() != texts.len() {
            return Err(ProviderError::RequestFailed(format!(
                "expected {} vectors, got {}",
                texts.len(),
                resp.vectors.len()
            )));
        }
        Ok(resp.vectors)
    }

    async fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let policy: &RetryPolicy = &self.cfg.retry;
        let mut attempt = 0;
        loop {
            match self.embed_once(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if attempt < policy.max_retries => {
                    attempt += 1;
                    let delay = policy.delay_for(attempt);
                    warn!(
                        "Embedding batch failed ({}), retry {}/{} in {:?}",
                        e, attempt, policy.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Embeds, scores, fuses and keeps the best `top_k`.
    ///
    /// Only a failure to embed the reference queries is an error. Email batches
    /// that fail degrade to zero vectors and are counted in `failed_batches`.
    pub async fn apply(
        &self,
        results: Vec<FilterResult>,
        opts: &RankOptions,
    ) -> anyhow::Result<(Vec<EmbeddingResult>, EmbeddingStats)> {
        if results.is_empty() {
            return Ok((
                Vec::new(),
                EmbeddingStats {
                    top_k: opts.top_k,
                    ..Default::default()
                },
            ));
        }

        let queries = opts.queries();
        info!("Embedding {} reference queries...", queries.len());
        let query_vectors = self
            .embed_with_retry(&queries)
            .await
            .context("embedding reference queries")?;
        let dimension = query_vectors.first().map(Vec::len).unwrap_or(0);

        let batch_size = self.batch_size();
        info!(
            "Embedding {} emails in batches of {}...",
            results.len(),
            batch_size
        );
        let max_chars = self.cfg.max_text_chars;
        let texts: Vec<String> = results
            .iter()
            .map(|r| prepare_email_text(r, max_chars))
            .collect();
        let batches: Vec<&[String]> = texts.chunks(batch_size).collect();
        let batch_count = batches.len();

        // `buffered` keeps completion order aligned with input order.
        let outcomes: Vec<(usize, Result<Vec<Vec<f32>>, ProviderError>)> = stream::iter(batches)
            .map(|batch| async move { (batch.len(), self.embed_with_retry(batch).await) })
            .buffered(self.cfg.max_concurrent.max(1))
            .collect()
            .await;

        let mut failed_batches = 0;
        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(results.len());
        for (len, outcome) in outcomes {
            match outcome {
                Ok(v) => vectors.extend(v),
                Err(e) => {
                    failed_batches += 1;
                    warn!("Embedding batch failed: {}, returning zeros", e);
                    vectors.extend(std::iter::repeat(vec![0.0f32; dimension]).take(len));
                }
            }
        }
        info!("Embedded {} emails", vectors.len());

        let mut ranked: Vec<EmbeddingResult> = results
            .into_iter()
            .zip(vectors)
            .map(|(fr, emb)| {
                let mut best = 0usize;
                let mut best_sim = f64::NEG_INFINITY;
                for (i, q) in query_vectors.iter().enumerate() {
                    let sim = cosine_similarity(&emb, q);
                    if sim > best_sim {
                        best_sim = sim;
                        best = i;
                    }
                }
                let combined = opts.heuristic_weight * fr.score + opts.embedding_weight * best_sim;
                EmbeddingResult {
                    filter_result: fr,
                    embedding_score: round_to(best_sim, 4),
                    combined_score: round_to(combined, 4),
                    best_matching_query: queries[best].clone(),
                }
            })
            .collect();

        ranked.sort_by(|a, b| b.combined_score.total_cmp(&a.combined_score));
        let all_scores: Vec<f64> = ranked.iter().map(|r| r.combined_score).collect();
        ranked.truncate(opts.top_k);
        let top_scores: Vec<f64> = ranked.iter().map(|r| r.combined_score).collect();

        let stats = EmbeddingStats {
            total: all_scores.len(),
            kept: ranked.len(),
            top_k: opts.top_k,
            batches: batch_count,
            failed_batches,
            all_avg_score: mean(&all_scores),
            top_avg_score: mean(&top_scores),
            top_min_score: top_scores.last().copied().unwrap_or(0.0),
            top_max_score: top_scores.first().copied().unwrap_or(0.0),
        };
        info!(
            "  Embedding filter: kept {}/{} (top_avg={}, min={}, failed_batches={})",
            stats.kept, stats.total, stats.top_avg_score, stats.top_min_score, failed_batches
        );
        Ok((ranked, stats))
    }
}

/// Ordering without embeddings: heuristic score descending, wrapped as heuristic-only results.
pub fn rank_by_heuristic(mut results: Vec<FilterResult>, top_k: usize) -> Vec<EmbeddingResult> {
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    results.truncate(top_k);
    results.into_iter().map(EmbeddingResult::heuristic_only).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmailRecord;
    use providers::EmbedResponse;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const TERMS: [&str; 3] = ["budget", "pipeline", "lunch"];

    /// Bag-of-terms vectors; any text containing "FAIL" fails its whole batch.
    #[derive(Default)]
    struct TermEmbedder {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for TermEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if call < self.fail_first || texts.iter().any(|t| t.contains("FAIL")) {
                return Err(ProviderError::RequestFailed("boom".into()));
            }
            let vectors = texts
                .iter()
                .map(|t| {
                    let lower = t.to_lowercase();
                    TERMS.iter().map(|term| lower.matches(term).count() as f32).collect()
                })
                .collect();
            Ok(EmbedResponse { vectors })
        }

        fn max_batch_size(&self) -> usize {
            2
        }
    }

    fn fr(subject: &str, body: &str, score: f64) -> FilterResult {
        FilterResult {
            email: EmailRecord {
                file_path: format!("u/inbox/{subject}"),
                subject: subject.into(),
                body: body.into(),
                ..Default::default()
            },
            score,
            passed: true,
            signals: vec![],
        }
    }

    fn cfg() -> EmbeddingConfig {
        EmbeddingConfig {
            max_concurrent: 2,
            ..Default::default()
        }
    }

    fn opts(top_k: usize) -> RankOptions {
        RankOptions::from_config(&cfg())
            .with_top_k(top_k)
            .with_queries(vec!["budget".into(), "pipeline".into()])
    }

    fn inputs() -> Vec<FilterResult> {
        vec![
            fr("a", "lunch lunch", 0.5),
            fr("b", "budget numbers", 0.2),
            fr("c", "pipeline capacity", 0.1),
            fr("d", "nothing relevant", 0.9),
            fr("e", "budget and lunch", 0.3),
        ]
    }

    #[tokio::test]
    async fn keeps_top_k_sorted_by_combined_score() {
        let filter = EmbeddingFilter::new(Arc::new(TermEmbedder::default()), cfg());
        let (top, stats) = filter.apply(inputs(), &opts(3)).await.unwrap();

        assert_eq!(top.len(), 3);
        assert_eq!(stats.total, 5);
        assert_eq!(stats.kept, 3);
        assert!(top
            .windows(2)
            .all(|w| w[0].combined_score >= w[1].combined_score));
        // "b": 0.3*0.2 + 0.7*1.0
        assert_eq!(top[0].email().subject, "b");
        assert_eq!(top[0].combined_score, 0.76);
        assert_eq!(top[0].best_matching_query, "budget");
        let c = top.iter().find(|r| r.email().subject == "c").unwrap();
        assert_eq!(c.best_matching_query, "pipeline");
    }

    #[tokio::test]
    async fn top_k_larger_than_input_returns_everything() {
        let filter = EmbeddingFilter::new(Arc::new(TermEmbedder::default()), cfg());
        let (top, _) = filter.apply(inputs(), &opts(50)).await.unwrap();
        assert_eq!(top.len(), 5);
        let mut paths: Vec<_> = top.iter().map(|r| r.email().file_path.clone()).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 5);
    }

    #[tokio::test]
    async fn failed_batch_degrades_to_heuristic_only() {
        let filter = EmbeddingFilter::new(Arc::new(TermEmbedder::default()), cfg());
        let mut items = inputs();
        items.push(fr("FAIL", "budget budget", 0.4));
        let (top, stats) = filter.apply(items, &opts(10)).await.unwrap();

        assert_eq!(stats.batches, 3);
        assert_eq!(stats.failed_batches, 1);
        let failed = top.iter().find(|r| r.email().subject == "FAIL").unwrap();
        assert_eq!(failed.embedding_score, 0.0);
        assert_eq!(failed.combined_score, 0.12);
    }

    #[tokio::test]
    async fn retry_policy_recovers_transient_failures() {
        let embedder = TermEmbedder {
            fail_first: 2,
            ..Default::default()
        };
        let mut config = cfg();
        config.retry = RetryPolicy {
            max_retries: 3,
            backoff_ms: 0,
            max_backoff_ms: 0,
        };
        let filter = EmbeddingFilter::new(Arc::new(embedder), config);
        let (_, stats) = filter.apply(inputs(), &opts(5)).await.unwrap();
        assert_eq!(stats.failed_batches, 0);
    }

    #[tokio::test]
    async fn reference_query_failure_is_an_error() {
        let embedder = TermEmbedder {
            fail_first: 1,
            ..Default::default()
        };
        let filter = EmbeddingFilter::new(Arc::new(embedder), cfg());
        assert!(filter.apply(inputs(), &opts(5)).await.is_err());
    }

    #[tokio::test]
    async fn concurrency_stays_under_cap() {
        let embedder = Arc::new(TermEmbedder::default());
        let filter = EmbeddingFilter::new(embedder.clone(), cfg());
        let many: Vec<FilterResult> = (0..20).map(|i| fr(&i.to_string(), "budget", 0.1)).collect();
        filter.apply(many, &opts(20)).await.unwrap();
        assert!(embedder.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let embedder = Arc::new(TermEmbedder::default());
        let filter = EmbeddingFilter::new(embedder.clone(), cfg());
        let (top, stats) = filter.apply(vec![], &opts(5)).await.unwrap();
        assert!(top.is_empty());
        assert_eq!(stats.total, 0);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn heuristic_ranking_truncates_and_marks_skipped() {
        let ranked = rank_by_heuristic(inputs(), 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].email().subject, "d");
        assert_eq!(ranked[1].email().subject, "a");
        assert!(ranked
            .iter()
            .all(|r| r.best_matching_query == crate::models::EMBEDDINGS_SKIPPED));
    }

    #[test]
    fn text_is_truncated_by_characters() {
        let r = fr("é", &"ü".repeat(50), 0.0);
        let text = prepare_email_text(&r, 12);
        assert_eq!(text.chars().count(), 12);
        assert!(text.starts_with("Subject: é\n\n"));
    }

    #[test]
    fn zero_vectors_have_zero_similarity() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn cosine_is_bounded(
            a in prop::collection::vec(-1e3f32..1e3, 1..16),
            b in prop::collection::vec(-1e3f32..1e3, 1..16),
        ) {
            let sim = cosine_similarity(&a, &b);
            prop_assert!((-1.0..=1.0).contains(&sim));
        }
    }
}
