//! Tier 1: rule-based relevance scoring. Pure, no I/O.
//!
//! Every contribution is appended to `signals` as `"{weight:+.2} reason(evidence)"`
//! in the order it is applied, so the trace reproduces exactly for a given
//! weight table.

use crate::models::{round_to, EmailRecord, FilterResult};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::sync::OnceLock;
use tracing::info;

pub const DEFAULT_THRESHOLD: f64 = 0.15;

const BRD_KEYWORDS: &[&str] = &[
    "requirement", "requirements", "specification", "specifications", "scope",
    "deliverable", "deliverables", "milestone", "milestones",
    "decision", "decided", "approved", "approve", "approval", "rejected", "agreed",
    "agreement", "consensus",
    "project", "timeline", "deadline", "schedule", "priority", "priorities", "roadmap",
    "phase", "sprint", "release",
    "stakeholder", "sponsor", "budget", "cost", "resource", "resources", "allocation",
    "funding",
    "architecture", "design", "implementation", "integration", "infrastructure",
    "platform", "system", "feature", "features", "functionality", "interface", "module",
    "component",
    "business case", "proposal", "strategy", "objective", "objectives", "goal", "goals",
    "constraint", "constraints", "risk", "risks", "compliance", "regulation", "policy",
    "action item", "action items", "follow up", "follow-up", "next steps", "todo", "to-do",
    "assigned", "responsible",
];

const NOISE_KEYWORDS: &[&str] = &[
    "lunch", "dinner", "happy hour", "birthday", "potluck", "out of office", "ooo",
    "vacation", "holiday", "unsubscribe", "newsletter", "mailing list",
    "fantasy football", "march madness", "super bowl",
];

const NOISE_FOLDERS: &[&str] = &[
    "deleted_items", "junk", "spam", "_sent_mail", "calendar", "contacts", "drafts",
    "notes", "discussion_threads",
];

const GOOD_FOLDERS: &[&str] = &[
    "inbox", "sent", "sent_items", "business", "projects", "all_documents", "notes_inbox",
];

// Checked in order; only the first match is penalized.
const NOISE_SUBJECT_PATTERNS: &[&str] = &[
    r"^(fw:\s*){3,}",
    r"^(re:\s*){5,}",
    r"out of office",
    r"undeliverable",
    r"delivery status",
    r"auto.?reply",
    r"automatic reply",
    r"calendar:",
    r"invitation:",
];

const ACTION_PATTERNS: &[&str] = &[
    r"\?",
    r"please\s+(review|approve|confirm|update|provide)",
    r"action item",
    r"next step",
    r"follow.?up",
    r"assigned to",
];

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .expect("heuristic pattern must compile")
        })
        .collect()
}

fn noise_subject_res() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| compile_all(NOISE_SUBJECT_PATTERNS))
}

fn action_res() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| compile_all(ACTION_PATTERNS))
}

fn count_keyword_hits(text: &str, keywords: &[&str]) -> usize {
    let lower = text.to_lowercase();
    keywords.iter().filter(|kw| lower.contains(*kw)).count()
}

/// Weight table. Negative signals carry negative weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicWeights {
    pub body_keywords_full: f64,
    pub body_keyword_each: f64,
    pub subject_keywords: f64,
    pub targeted: f64,
    pub substantial_body: f64,
    pub long_body: f64,
    pub action_language: f64,
    pub good_folder: f64,
    pub noise_keywords: f64,
    pub noise_subject: f64,
    pub mass_email: f64,
    pub noise_folder: f64,
    pub too_short: f64,
}

impl Default for HeuristicWeights {
    fn default() -> Self {
        Self {
            body_keywords_full: 0.30,
            body_keyword_each: 0.10,
            subject_keywords: 0.20,
            targeted: 0.15,
            substantial_body: 0.15,
            long_body: 0.10,
            action_language: 0.10,
            good_folder: 0.10,
            noise_keywords: -0.30,
            noise_subject: -0.20,
            mass_email: -0.20,
            noise_folder: -0.15,
            too_short: -0.10,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeuristicScorer {
    weights: HeuristicWeights,
}

struct Tally {
    score: f64,
    signals: Vec<String>,
}

impl Tally {
    fn add(&mut self, weight: f64, reason: &str, evidence: impl std::fmt::Display) {
        self.score += weight;
        self.signals.push(format!("{weight:+.2} {reason}({evidence})"));
    }
}

impl HeuristicScorer {
    pub fn new(weights: HeuristicWeights) -> Self {
        Self { weights }
    }

    /// Scores one email. `passed` is left false; thresholds are applied per batch.
    pub fn score(&self, email: &EmailRecord) -> FilterResult {
        let w = &self.weights;
        let mut t = Tally {
            score: 0.0,
            signals: Vec::new(),
        };
        let combined = format!("{} {}", email.subject, email.body);
        let folder = email.folder.to_lowercase();

        let body_hits = count_keyword_hits(&email.body, BRD_KEYWORDS);
        if body_hits >= 3 {
            t.add(w.body_keywords_full, "body_keywords", format!("{body_hits} hits"));
        } else if body_hits >= 1 {
            let partial = round_to(body_hits as f64 * w.body_keyword_each, 2);
            t.add(partial, "body_keywords", format!("{body_hits} hits"));
        }

        let subject_hits = count_keyword_hits(&email.subject, BRD_KEYWORDS);
        if subject_hits >= 1 {
            t.add(w.subject_keywords, "subject_keywords", format!("{subject_hits} hits"));
        }

        if (1..=10).contains(&email.total_recipients) {
            t.add(
                w.targeted,
                "targeted",
                format!("{} recipients", email.total_recipients),
            );
        }

        if (50..=500).contains(&email.word_count) {
            t.add(
                w.substantial_body,
                "substantial_body",
                format!("{} words", email.word_count),
            );
        } else if email.word_count > 500 {
            t.add(w.long_body, "long_body", format!("{} words", email.word_count));
        }

        let action_count = action_res().iter().filter(|re| re.is_match(&combined)).count();
        if action_count >= 1 {
            t.add(
                w.action_language,
                "action_language",
                format!("{action_count} patterns"),
            );
        }

        if GOOD_FOLDERS.contains(&folder.as_str()) {
            t.add(w.good_folder, "good_folder", &email.folder);
        }

        let noise_hits = count_keyword_hits(&combined, NOISE_KEYWORDS);
        if noise_hits >= 1 {
            t.add(w.noise_keywords, "noise_keywords", format!("{noise_hits} hits"));
        }

        if let Some(re) = noise_subject_res().iter().find(|re| re.is_match(&email.subject)) {
            let pattern: String = re.as_str().chars().take(30).collect();
            t.add(w.noise_subject, "noise_subject", pattern);
        }

        if email.total_recipients > 20 {
            t.add(
                w.mass_email,
                "mass_email",
                format!("{} recipients", email.total_recipients),
            );
        }

        if NOISE_FOLDERS.contains(&folder.as_str()) {
            t.add(w.noise_folder, "noise_folder", &email.folder);
        }

        if email.word_count < 15 {
            t.add(w.too_short, "too_short", format!("{} words", email.word_count));
        }

        FilterResult {
            email: email.clone(),
            score: round_to(t.score.clamp(0.0, 1.0), 3),
            passed: false,
            signals: t.signals,
        }
    }
}

/// Scores with the default weight table.
pub fn score_email(email: &EmailRecord) -> FilterResult {
    HeuristicScorer::default().score(email)
}

/// Aggregate counts for one or more filter passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeuristicStats {
    pub total: usize,
    pub passed: usize,
    pub dropped: usize,
    /// Percentage, 0-100.
    pub pass_rate: f64,
    pub avg_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    #[serde(skip)]
    score_sum: f64,
}

impl HeuristicStats {
    fn from_scores(scores: &[f64], passed: usize) -> Self {
        let mut stats = Self {
            total: scores.len(),
            passed,
            dropped: scores.len() - passed,
            score_sum: scores.iter().sum(),
            min_score: scores.iter().copied().fold(f64::INFINITY, f64::min),
            max_score: scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            ..Default::default()
        };
        stats.refresh();
        stats
    }

    fn refresh(&mut self) {
        if self.total == 0 {
            self.min_score = 0.0;
            self.max_score = 0.0;
        }
        let denom = self.total.max(1) as f64;
        self.pass_rate = round_to(self.passed as f64 / denom * 100.0, 1);
        self.avg_score = round_to(self.score_sum / denom, 3);
    }

    /// Folds another batch's stats into this one.
    pub fn merge(&mut self, other: &HeuristicStats) {
        if other.total == 0 {
            return;
        }
        if self.total == 0 {
            *self = other.clone();
            return;
        }
        self.total += other.total;
        self.passed += other.passed;
        self.dropped += other.dropped;
        self.score_sum += other.score_sum;
        self.min_score = self.min_score.min(other.min_score);
        self.max_score = self.max_score.max(other.max_score);
        self.refresh();
    }
}

impl HeuristicScorer {
    /// Scores every email and keeps those with `score >= threshold`, marked passed.
    pub fn filter<I>(&self, emails: I, threshold: f64) -> (Vec<FilterResult>, HeuristicStats)
    where
        I: IntoIterator,
        I::Item: Borrow<EmailRecord>,
    {
        let mut scores = Vec::new();
        let mut passed = Vec::new();
        for em in emails {
            let mut result = self.score(em.borrow());
            scores.push(result.score);
            if result.score >= threshold {
                result.passed = true;
                passed.push(result);
            }
        }
        let stats = HeuristicStats::from_scores(&scores, passed.len());
        info!(
            "  Heuristic filter: {}/{} passed (threshold={}, avg_score={})",
            stats.passed, stats.total, threshold, stats.avg_score
        );
        (passed, stats)
    }
}

/// [`HeuristicScorer::filter`] with the default weights.
pub fn apply_heuristic_filter(
    emails: &[EmailRecord],
    threshold: f64,
) -> (Vec<FilterResult>, HeuristicStats) {
    HeuristicScorer::default().filter(emails, threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn email(subject: &str, body: &str, folder: &str, recipients: usize) -> EmailRecord {
        let to: Vec<String> = (0..recipients).map(|i| format!("user{i}@enron.com")).collect();
        EmailRecord {
            file_path: format!("test-u/{folder}/1."),
            sender: "sender@enron.com".into(),
            subject: subject.into(),
            body: body.into(),
            folder: folder.into(),
            word_count: body.split_whitespace().count(),
            total_recipients: to.len(),
            recipients_to: to,
            ..Default::default()
        }
    }

    fn phoenix_body() -> String {
        let mut words = vec![
            "The", "budget", "for", "the", "milestone", "needs", "stakeholder", "sign", "off.",
        ];
        let filler = ["we", "met", "with", "the", "team", "on", "tuesday", "and", "went", "over"];
        while words.len() < 200 {
            words.extend_from_slice(&filler);
        }
        words.truncate(200);
        words.join(" ")
    }

    #[test]
    fn targeted_project_email_scores_high() {
        let em = email("Project Phoenix requirements review", &phoenix_body(), "inbox", 4);
        assert_eq!(em.word_count, 200);
        let r = score_email(&em);
        assert!((r.score - 0.90).abs() < 1e-9, "score was {}", r.score);
        assert_eq!(r.signals.len(), 5);
        assert!(r.signals.iter().all(|s| s.starts_with('+')), "{:?}", r.signals);
        assert_eq!(r.signals[0], "+0.30 body_keywords(3 hits)");
        assert_eq!(r.signals[4], "+0.10 good_folder(inbox)");
        assert!(!r.passed);
    }

    #[test]
    fn deep_reply_lunch_chain_is_rejected() {
        let em = email("RE: RE: RE: RE: RE: lunch tomorrow?", "sounds good", "deleted_items", 0);
        let r = score_email(&em);
        assert_eq!(r.score, 0.0);
        assert!(r.signals.iter().any(|s| s.starts_with("-0.15 noise_folder")));
        assert!(r.signals.iter().any(|s| s.starts_with("-0.10 too_short(2 words)")));
        assert!(r.signals.iter().any(|s| s.starts_with("-0.20 noise_subject(^(re:")));

        let (passed, stats) = apply_heuristic_filter(&[em], DEFAULT_THRESHOLD);
        assert!(passed.is_empty());
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn partial_body_keywords_scale_linearly() {
        let body = "the budget is fine, nothing else to add from me today";
        let r = score_email(&email("hello", body, "misc", 0));
        assert_eq!(r.signals[0], "+0.10 body_keywords(1 hits)");
    }

    #[test]
    fn every_fixed_pattern_compiles() {
        assert_eq!(noise_subject_res().len(), NOISE_SUBJECT_PATTERNS.len());
        assert_eq!(action_res().len(), ACTION_PATTERNS.len());
    }

    #[test]
    fn only_first_noise_subject_pattern_applies() {
        let r = score_email(&email("Out of office: automatic reply", "", "inbox", 1));
        let hits = r.signals.iter().filter(|s| s.contains("noise_subject")).count();
        assert_eq!(hits, 1);
    }

    #[test]
    fn stats_merge_matches_single_pass() {
        let batch_a = vec![
            email("Project plan", &phoenix_body(), "inbox", 3),
            email("lunch", "ok", "junk", 0),
        ];
        let batch_b = vec![email("budget review", &phoenix_body(), "sent", 2)];
        let (_, mut merged) = apply_heuristic_filter(&batch_a, 0.15);
        let (_, b) = apply_heuristic_filter(&batch_b, 0.15);
        merged.merge(&b);

        let all: Vec<EmailRecord> = batch_a.into_iter().chain(batch_b).collect();
        let (_, whole) = apply_heuristic_filter(&all, 0.15);
        assert_eq!(merged, whole);
    }

    #[test]
    fn empty_batch_reports_zeroes() {
        let (passed, stats) = apply_heuristic_filter(&[], 0.15);
        assert!(passed.is_empty());
        assert_eq!(stats.total, 0);
        assert_eq!(stats.max_score, 0.0);
        assert_eq!(stats.min_score, 0.0);
    }

    fn arb_email() -> impl Strategy<Value = EmailRecord> {
        let word = prop::sample::select(vec![
            "project", "budget", "lunch", "please review", "?", "the", "risk", "ooo",
            "system", "holiday", "we", "deadline", "RE:", "FW:",
        ]);
        let folder = prop::sample::select(vec!["inbox", "junk", "sent", "notes", "misc"]);
        (
            prop::collection::vec(word.clone(), 0..8),
            prop::collection::vec(word, 0..700),
            folder,
            0usize..40,
        )
            .prop_map(|(s, b, f, n)| email(&s.join(" "), &b.join(" "), f, n))
    }

    proptest! {
        #[test]
        fn score_is_bounded(em in arb_email()) {
            let r = score_email(&em);
            prop_assert!((0.0..=1.0).contains(&r.score));
        }

        #[test]
        fn raising_threshold_never_passes_more(
            emails in prop::collection::vec(arb_email(), 0..20),
            lo in 0.0f64..1.0,
            delta in 0.0f64..0.5,
        ) {
            let (low, _) = apply_heuristic_filter(&emails, lo);
            let (high, _) = apply_heuristic_filter(&emails, lo + delta);
            prop_assert!(high.len() <= low.len());
        }
    }
}
