//! Unsupervised project discovery: group the corpus into threads by
//! normalized subject, score each thread, and keep the best as projects.

use crate::config::{AppConfig, DiscoveryConfig};
use crate::loader::{CorpusLoader, LoadStats};
use crate::models::{round_to, DedupeKey, DiscoveredProject, DiscoveryArtifact, EmailRecord};
use crate::subject::{normalize_subject, NO_SUBJECT};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::info;

pub const PROJECTS_FILE: &str = "projects_discovered.json";
pub const EDA_STATS_FILE: &str = "eda_stats.json";

/// Folders never worth reading. `_sent_mail` is deliberately absent.
pub const JUNK_FOLDERS: &[&str] = &[
    "all_documents", "discussion_threads", "deleted_items", "calendar", "contacts", "drafts",
    "junk", "spam", "notes",
];

const GENERIC_SUBJECTS: &[&str] = &[
    "hi", "hello", "hey", "lunch", "dinner", "fyi", "meeting", "thanks", "thank you", "update",
    "question", "help", "info", "information", "follow up", "followup", "reminder", "request",
    "urgent", "congratulations", "congrats", "welcome", "goodbye", "good morning",
    "happy holidays", "happy birthday", "invitation", "rsvp", "out of office", "vacation",
    "schedule", "calendar", "test", "testing", "draft", "misc", "stuff", "things", "heads up",
    "heads-up", "note", "notes", "memo", "happy hour", "contact info", "attached files",
    "phone list", "phone numbers", "new hire", "goodbye enron",
];

const NOISE_SUBSTRINGS: &[&str] = &[
    "organizational announcement", "organizational changes", "sap", "outage", "unsubscribe",
    "out of office", "energy issues", "enron mentions", "news digest", "program changes",
    "benefits", "holiday", "parking", "conference call", "time sensitive", "all hands",
    "succession plan", "isda master", "master netting", "2002 plan", "2001 plan", "401k",
    "health insurance", "direct deposit", "payroll", "it support", "help desk",
    "password reset", "system maintenance", "server downtime",
];

const NEWSLETTER_PATTERNS: &[&str] = &[
    r"enron mentions",
    r"news\s*(letter|flash|brief)",
    r"daily\s+(report|update|summary|briefing)",
    r"press\s+(release|clipping|review)",
    r"organi[sz]ation(al)?\s+(announcement|changes?)",
    r"(weekly|monthly|quarterly)\s+(report|summary|update)",
    r"market\s+(report|update|commentary)",
    r"confidentiality\s+(agreement|notice)",
    r"enron\s+center\s+garage",
    r"your\s+approval\s+is\s+overdue",
    r"expense\s+report",
    r"action\s+required.{0,5}invoice",
];

const PROJECT_INDICATOR_WORDS: &[&str] = &[
    "project", "implementation", "requirements", "requirement", "specification", "design",
    "phase", "launch", "integration", "migration", "platform", "system", "proposal",
    "architecture", "rollout", "deployment", "prototype", "pilot", "kickoff", "kick-off",
    "deliverable", "milestone", "scope", "model", "infrastructure", "development", "testing",
    "release", "version", "upgrade", "plan", "strategy", "initiative", "program", "analysis",
    "assessment", "simulation", "restructuring", "re-start", "restart",
];

const BRD_SIGNAL_WORDS: &[&str] = &[
    "requirements", "deliverables", "timeline", "milestone", "budget", "scope", "stakeholder",
    "specification", "proposal", "implementation", "rollout", "deployment", "approval",
    "sign-off", "phase", "deadline", "vendor", "contractor", "resource", "risk",
    "architecture", "design", "integration", "migration", "schedule", "cost", "estimate",
    "feasibility", "prototype", "pilot", "capacity", "infrastructure", "regulatory",
    "compliance", "contract", "pricing", "negotiate", "tariff", "pipeline", "turbine",
    "generator", "transmission", "substation", "voltage",
];

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "shall", "can",
    "need", "dare", "ought", "to", "of", "in", "for", "on", "with", "at", "by", "from", "as",
    "into", "through", "during", "before", "after", "above", "below", "between", "out", "off",
    "over", "under", "again", "further", "then", "once", "here", "there", "when", "where",
    "why", "how", "all", "any", "both", "each", "few", "more", "most", "other", "some", "such",
    "no", "nor", "not", "only", "own", "same", "so", "than", "too", "very", "and", "but", "or",
    "if", "while", "that", "this", "these", "those", "it", "its", "i", "me", "my", "we", "our",
    "you", "your", "he", "him", "his", "she", "her", "they", "them", "their", "what", "which",
    "who", "whom", "up", "about", "just", "also", "new", "one", "two",
    "enron", "corp", "ect", "hou", "com", "net", "subject", "message", "email", "sent",
    "please", "thanks", "thank", "hi", "hello", "dear", "regards", "cc", "bcc", "forwarded",
    "original", "attached", "attachment", "meeting", "call", "let", "know", "get", "us",
];

const SEED_QUERY_TEMPLATES: &[&str] = &[
    "project requirements and stakeholder decisions about {topic}",
    "technical specifications and implementation details for {topic}",
    "budget allocation and resource planning for {topic}",
    "risk assessment and compliance requirements for {topic}",
    "status updates, action items, and next steps regarding {topic}",
];

const MIN_SUBJECT_CHARS: usize = 8;
const MIN_SUBJECT_WORDS: usize = 2;
const MAX_SAMPLES: usize = 5;
const SNIPPET_CHARS: usize = 300;
const MAX_KEYWORDS: usize = 10;
const SENDER_CAP: usize = 25;
const WORD_COUNT_CAP: f64 = 500.0;
const SIGNAL_BONUS_CAP: f64 = 3.0;
const TOP_FOLDERS: usize = 20;

fn newsletter_res() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        NEWSLETTER_PATTERNS
            .iter()
            .map(|p| Regex::new(&format!("(?i){p}")).expect("newsletter pattern must compile"))
            .collect()
    })
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-z]{3,}").expect("token regex must compile"))
}

pub(crate) fn is_junk_folder(folder: &str) -> bool {
    JUNK_FOLDERS.contains(&folder.to_lowercase().as_str())
}

/// Rejects the sentinel, generic one-liners, corporate noise, newsletters and
/// anything too short to name a project.
pub fn is_project_worthy_subject(normalized: &str) -> bool {
    if normalized == NO_SUBJECT {
        return false;
    }
    let lower = normalized.trim().to_lowercase();
    if GENERIC_SUBJECTS.contains(&lower.as_str()) {
        return false;
    }
    if NOISE_SUBSTRINGS.iter().any(|n| lower.contains(n)) {
        return false;
    }
    if newsletter_res().iter().any(|re| re.is_match(&lower)) {
        return false;
    }
    lower.chars().count() >= MIN_SUBJECT_CHARS && lower.split_whitespace().count() >= MIN_SUBJECT_WORDS
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadStats {
    pub normalized_subject: String,
    pub email_count: usize,
    pub senders: HashSet<String>,
    /// Lexicographic min/max of raw date strings.
    pub earliest_date: String,
    pub latest_date: String,
    pub total_word_count: usize,
    pub brd_signal_hits: usize,
    pub total_body_words: usize,
    pub sample_subjects: Vec<String>,
    pub sample_body_snippets: Vec<String>,
}

impl ThreadStats {
    pub fn new(normalized_subject: impl Into<String>) -> Self {
        Self {
            normalized_subject: normalized_subject.into(),
            ..Default::default()
        }
    }

    fn absorb(&mut self, email: &EmailRecord, sender: &str) {
        self.email_count += 1;
        self.total_word_count += email.word_count;
        if !sender.is_empty() {
            self.senders.insert(sender.to_string());
        }

        if !email.body.is_empty() {
            let lower = email.body.to_lowercase();
            let words: HashSet<&str> = lower.split_whitespace().collect();
            self.brd_signal_hits += BRD_SIGNAL_WORDS.iter().filter(|w| words.contains(*w)).count();
            self.total_body_words += words.len();
        }

        let date = email.date.as_str();
        if !date.is_empty() {
            if self.earliest_date.is_empty() || date < self.earliest_date.as_str() {
                self.earliest_date = date.to_string();
            }
            if self.latest_date.is_empty() || date > self.latest_date.as_str() {
                self.latest_date = date.to_string();
            }
        }

        if self.sample_subjects.len() < MAX_SAMPLES && !email.subject.is_empty() {
            self.sample_subjects.push(email.subject.clone());
        }
        if self.sample_body_snippets.len() < MAX_SAMPLES && !email.body.is_empty() {
            self.sample_body_snippets
                .push(email.body.chars().take(SNIPPET_CHARS).collect());
        }
    }

    pub fn avg_word_count(&self) -> f64 {
        self.total_word_count as f64 / self.email_count.max(1) as f64
    }

    pub fn signal_density(&self) -> f64 {
        self.brd_signal_hits as f64 / self.total_body_words.max(1) as f64
    }

    fn is_candidate(&self, cfg: &DiscoveryConfig) -> bool {
        self.email_count >= cfg.min_thread_size
            && self.senders.len() >= cfg.min_unique_senders
            && self.avg_word_count() >= cfg.min_avg_words
    }
}

/// `count * min(senders, 25) * log2(min(avg_words, 500) + 1) * project * signal * blast`.
pub fn score_thread(ts: &ThreadStats) -> f64 {
    let capped_wc = ts.avg_word_count().min(WORD_COUNT_CAP);
    let senders = ts.senders.len().min(SENDER_CAP) as f64;
    let base = ts.email_count as f64 * senders * (capped_wc + 1.0).log2();

    let subject_lower = ts.normalized_subject.to_lowercase();
    let has_project_word = subject_lower
        .split_whitespace()
        .any(|w| PROJECT_INDICATOR_WORDS.contains(&w));
    let project_bonus = if has_project_word { 10.0 } else { 1.0 };

    let signal_bonus = 1.0 + (ts.signal_density() * 50.0).min(SIGNAL_BONUS_CAP);

    let sender_ratio = ts.senders.len() as f64 / ts.email_count.max(1) as f64;
    let blast_penalty = if sender_ratio > 0.6 { 0.5 } else { 1.0 };

    base * project_bonus * signal_bonus * blast_penalty
}

/// Most frequent non-stopword tokens of 3+ letters; ties keep first-seen order.
pub fn extract_keywords(ts: &ThreadStats) -> Vec<String> {
    let text = ts
        .sample_subjects
        .iter()
        .chain(ts.sample_body_snippets.iter())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let mut counts: Vec<(&str, usize)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for token in token_re().find_iter(&text).map(|m| m.as_str()) {
        if STOPWORDS.contains(&token) {
            continue;
        }
        match index.get(token) {
            Some(&i) => counts[i].1 += 1,
            None => {
                index.insert(token, counts.len());
                counts.push((token, 1));
            }
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
        .into_iter()
        .take(MAX_KEYWORDS)
        .map(|(w, _)| w.to_string())
        .collect()
}

pub fn generate_seed_queries(project_name: &str, keywords: &[String]) -> Vec<String> {
    let topic = std::iter::once(project_name)
        .chain(keywords.iter().take(3).map(String::as_str))
        .collect::<Vec<_>>()
        .join(", ");
    SEED_QUERY_TEMPLATES
        .iter()
        .map(|t| t.replace("{topic}", &topic))
        .collect()
}

/// What happened to one observed email.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Junk,
    Unworthy,
    Duplicate,
    Accumulated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderCount {
    pub folder: String,
    pub count: usize,
}

/// Counters for one streaming pass, before ranking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorSnapshot {
    pub total_emails: usize,
    pub junk_skipped: usize,
    pub duplicates_skipped: usize,
    /// Subjects rejected by the worthiness filter, including empty ones.
    pub no_subject: usize,
    pub unique_normalized_subjects: usize,
    pub folder_distribution: Vec<FolderCount>,
}

/// Owns every piece of mutable discovery state for one pass.
#[derive(Debug, Default)]
pub struct ThreadAccumulator {
    threads: HashMap<String, ThreadStats>,
    seen: HashSet<DedupeKey>,
    folder_counts: HashMap<String, usize>,
    total_emails: usize,
    junk_skipped: usize,
    duplicates_skipped: usize,
    no_subject: usize,
}

impl ThreadAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, email: &EmailRecord) -> Observation {
        self.total_emails += 1;

        let folder = email.folder.to_lowercase();
        if JUNK_FOLDERS.contains(&folder.as_str()) {
            self.junk_skipped += 1;
            return Observation::Junk;
        }
        *self.folder_counts.entry(folder).or_insert(0) += 1;

        let norm = normalize_subject(&email.subject);
        if !is_project_worthy_subject(&norm) {
            self.no_subject += 1;
            return Observation::Unworthy;
        }

        let key = DedupeKey::with_subject(norm.clone(), email);
        let sender = key.sender.clone();
        if !self.seen.insert(key) {
            self.duplicates_skipped += 1;
            return Observation::Duplicate;
        }

        self.threads
            .entry(norm)
            .or_insert_with_key(|k| ThreadStats::new(k.clone()))
            .absorb(email, &sender);
        Observation::Accumulated
    }

    pub fn observe_batch(&mut self, batch: &[EmailRecord]) {
        for email in batch {
            self.observe(email);
        }
    }

    pub fn thread(&self, normalized_subject: &str) -> Option<&ThreadStats> {
        self.threads.get(normalized_subject)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn snapshot(&self) -> AccumulatorSnapshot {
        let mut folders: Vec<FolderCount> = self
            .folder_counts
            .iter()
            .map(|(folder, &count)| FolderCount {
                folder: folder.clone(),
                count,
            })
            .collect();
        folders.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.folder.cmp(&b.folder)));
        folders.truncate(TOP_FOLDERS);

        AccumulatorSnapshot {
            total_emails: self.total_emails,
            junk_skipped: self.junk_skipped,
            duplicates_skipped: self.duplicates_skipped,
            no_subject: self.no_subject,
            unique_normalized_subjects: self.threads.len(),
            folder_distribution: folders,
        }
    }

    /// Candidate threads ranked by score, best first, and the candidate count.
    pub fn rank(&self, cfg: &DiscoveryConfig) -> (Vec<DiscoveredProject>, usize) {
        let mut scored: Vec<(f64, &ThreadStats)> = self
            .threads
            .values()
            .filter(|ts| ts.is_candidate(cfg))
            .map(|ts| (score_thread(ts), ts))
            .collect();
        let candidates = scored.len();
        // Subject breaks ties so runs are reproducible despite hash ordering.
        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.normalized_subject.cmp(&b.1.normalized_subject))
        });

        let projects = scored
            .into_iter()
            .take(cfg.top_n)
            .enumerate()
            .map(|(i, (score, ts))| build_project(i + 1, score, ts))
            .collect();
        (projects, candidates)
    }
}

fn build_project(rank: usize, score: f64, ts: &ThreadStats) -> DiscoveredProject {
    let keywords = extract_keywords(ts);
    let name = ts.normalized_subject.clone();
    DiscoveredProject {
        rank,
        seed_queries: generate_seed_queries(&name, &keywords),
        name,
        discovery_score: round_to(score, 1),
        email_count: ts.email_count,
        unique_senders: ts.senders.len(),
        avg_word_count: round_to(ts.avg_word_count(), 1),
        date_range: format!("{} to {}", ts.earliest_date, ts.latest_date),
        keywords,
        is_deep_project: rank == 1,
    }
}

/// `eda_stats.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryStats {
    pub total_emails: usize,
    pub junk_skipped: usize,
    pub duplicates_skipped: usize,
    pub no_subject: usize,
    pub processed: usize,
    pub noise_pct: f64,
    pub unique_normalized_subjects: usize,
    pub threads_above_min_size: usize,
    pub folder_distribution: Vec<FolderCount>,
    pub parse_failures: usize,
    pub processing_time_seconds: f64,
}

impl DiscoveryStats {
    fn new(snap: AccumulatorSnapshot, candidates: usize, load: LoadStats, elapsed: f64) -> Self {
        Self {
            processed: snap.total_emails - snap.junk_skipped - snap.no_subject,
            noise_pct: round_to(
                snap.junk_skipped as f64 / snap.total_emails.max(1) as f64 * 100.0,
                1,
            ),
            total_emails: snap.total_emails,
            junk_skipped: snap.junk_skipped,
            duplicates_skipped: snap.duplicates_skipped,
            no_subject: snap.no_subject,
            unique_normalized_subjects: snap.unique_normalized_subjects,
            threads_above_min_size: candidates,
            folder_distribution: snap.folder_distribution,
            parse_failures: load.failed,
            processing_time_seconds: round_to(elapsed, 1),
        }
    }
}

/// Streams the whole corpus once and returns the top projects.
pub async fn discover_projects(
    csv_path: &Path,
    cfg: &AppConfig,
) -> anyhow::Result<(Vec<DiscoveredProject>, DiscoveryStats)> {
    let start = Instant::now();
    let loader = CorpusLoader::open(csv_path, cfg.loader.clone())?;
    info!("Starting discovery over {}", csv_path.display());

    let mut acc = ThreadAccumulator::new();
    let mut stream = loader.stream();
    let mut batches = 0usize;
    while let Some(batch) = stream.next_batch().await {
        acc.observe_batch(&batch);
        batches += 1;
        if batches % 5 == 0 {
            info!(
                "  Processed {} emails, {} unique threads so far...",
                acc.total_emails,
                acc.thread_count()
            );
        }
    }
    let load = stream.finish().await?;

    let (projects, candidates) = acc.rank(&cfg.discovery);
    let stats = DiscoveryStats::new(
        acc.snapshot(),
        candidates,
        load,
        start.elapsed().as_secs_f64(),
    );
    info!(
        "Discovery complete: {} projects from {} candidate threads ({} emails, {} duplicates)",
        projects.len(),
        candidates,
        stats.total_emails,
        stats.duplicates_skipped
    );
    Ok((projects, stats))
}

/// Writes `projects_discovered.json` and `eda_stats.json` under `output_dir`.
pub async fn save_results(
    projects: &[DiscoveredProject],
    stats: &DiscoveryStats,
    output_dir: &Path,
    csv_path: &Path,
) -> anyhow::Result<()> {
    let artifact = DiscoveryArtifact {
        csv_path: csv_path.display().to_string(),
        projects: projects.to_vec(),
    };
    storage::write_json(&output_dir.join(PROJECTS_FILE), &artifact).await?;
    storage::write_json(&output_dir.join(EDA_STATS_FILE), stats).await?;
    info!("Results saved to {}", output_dir.display());
    Ok(())
}
