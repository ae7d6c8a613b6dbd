use crate::subject::normalize_subject;
use serde::{Deserialize, Serialize};
use storage::models::ExportedEmail;

/// One parsed message from the corpus. Never mutated after the loader builds it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailRecord {
    pub file_path: String,
    pub sender: String,
    pub recipients_to: Vec<String>,
    pub recipients_cc: Vec<String>,
    pub recipients_bcc: Vec<String>,
    pub subject: String,
    /// Raw header value; compared as a string, never parsed.
    pub date: String,
    pub body: String,
    pub folder: String,
    pub word_count: usize,
    pub total_recipients: usize,
}

/// Tier-1 output for one email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterResult {
    pub email: EmailRecord,
    pub score: f64,
    pub passed: bool,
    pub signals: Vec<String>,
}

pub const EMBEDDINGS_SKIPPED: &str = "N/A (embeddings skipped)";

/// Tier-2 output. `combined_score` is only comparable within one ranking run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub filter_result: FilterResult,
    pub embedding_score: f64,
    pub combined_score: f64,
    pub best_matching_query: String,
}

impl EmbeddingResult {
    /// Ranking without Tier 2: the heuristic score stands in for the combined score.
    pub fn heuristic_only(filter_result: FilterResult) -> Self {
        let combined_score = filter_result.score;
        Self {
            filter_result,
            embedding_score: 0.0,
            combined_score,
            best_matching_query: EMBEDDINGS_SKIPPED.to_string(),
        }
    }

    pub fn email(&self) -> &EmailRecord {
        &self.filter_result.email
    }
}

impl From<&EmbeddingResult> for ExportedEmail {
    fn from(r: &EmbeddingResult) -> Self {
        let em = r.email();
        ExportedEmail {
            file_path: em.file_path.clone(),
            sender: em.sender.clone(),
            recipients_to: em.recipients_to.clone(),
            recipients_cc: em.recipients_cc.clone(),
            subject: em.subject.clone(),
            date: em.date.clone(),
            folder: em.folder.clone(),
            body: em.body.clone(),
            word_count: em.word_count,
            heuristic_score: r.filter_result.score,
            embedding_score: r.embedding_score,
            combined_score: r.combined_score,
            best_matching_query: r.best_matching_query.clone(),
            signals: r.filter_result.signals.clone(),
        }
    }
}

/// Coarse fingerprint for the same message filed in several folders.
/// Collisions and misses are both possible when date formats differ.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupeKey {
    pub normalized_subject: String,
    pub sender: String,
    pub date_prefix: String,
}

impl DedupeKey {
    pub const DATE_PREFIX_CHARS: usize = 16;

    pub fn for_email(email: &EmailRecord) -> Self {
        Self::with_subject(normalize_subject(&email.subject), email)
    }

    /// Same as [`DedupeKey::for_email`] when the caller already normalized the subject.
    pub fn with_subject(normalized_subject: String, email: &EmailRecord) -> Self {
        Self {
            normalized_subject,
            sender: email.sender.trim().to_lowercase(),
            date_prefix: email.date.chars().take(Self::DATE_PREFIX_CHARS).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredProject {
    pub rank: usize,
    pub name: String,
    pub discovery_score: f64,
    pub email_count: usize,
    pub unique_senders: usize,
    pub avg_word_count: f64,
    pub date_range: String,
    pub keywords: Vec<String>,
    pub seed_queries: Vec<String>,
    #[serde(default)]
    pub is_deep_project: bool,
}

/// `projects_discovered.json`, the only input curation needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryArtifact {
    pub csv_path: String,
    pub projects: Vec<DiscoveredProject>,
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_key_ignores_folder_and_reply_prefix() {
        let a = EmailRecord {
            file_path: "lay-k/inbox/1.".into(),
            sender: "Kenneth.Lay@enron.com ".into(),
            subject: "RE: EOL rollout".into(),
            date: "Tue, 3 Oct 2000 09:13:00 -0700 (PDT)".into(),
            folder: "inbox".into(),
            ..Default::default()
        };
        let b = EmailRecord {
            file_path: "lay-k/sent_items/7.".into(),
            subject: "EOL rollout".into(),
            folder: "sent_items".into(),
            sender: "kenneth.lay@enron.com".into(),
            ..a.clone()
        };
        assert_eq!(DedupeKey::for_email(&a), DedupeKey::for_email(&b));
        assert_eq!(DedupeKey::for_email(&a).date_prefix, "Tue, 3 Oct 2000 ");
    }

    #[test]
    fn heuristic_only_uses_sentinel_query() {
        let fr = FilterResult {
            email: EmailRecord::default(),
            score: 0.42,
            passed: true,
            signals: vec![],
        };
        let r = EmbeddingResult::heuristic_only(fr);
        assert_eq!(r.embedding_score, 0.0);
        assert_eq!(r.combined_score, 0.42);
        assert_eq!(r.best_matching_query, EMBEDDINGS_SKIPPED);
    }
}
