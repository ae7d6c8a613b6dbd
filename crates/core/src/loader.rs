//! Streams the corpus CSV (`file`, `message` columns) into parsed email batches.
//!
//! Reading is always sequential. Parsing happens inline, or on a rayon pool in
//! the parallel variant. Only one batch of rows is held at a time, and every
//! call to [`CorpusLoader::batches`] starts again from the top of the file.

use crate::config::LoaderConfig;
use crate::error::TriageError;
use crate::models::EmailRecord;
use anyhow::Context;
use mailparse::{MailHeaderMap, ParsedMail};
use rayon::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LoadStats {
    pub parsed: usize,
    pub failed: usize,
}

fn parse_address_list(raw: Option<String>) -> Vec<String> {
    raw.map(|r| {
        r.split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Second path segment, e.g. `allen-p/sent_items/1.` -> `sent_items`.
pub fn folder_from_path(file_path: &str) -> String {
    file_path.split('/').nth(1).unwrap_or("").to_string()
}

fn first_plain_part(mail: &ParsedMail<'_>) -> Option<String> {
    if mail.subparts.is_empty() {
        if !mail.ctype.mimetype.eq_ignore_ascii_case("text/plain") {
            return None;
        }
        return match mail.get_body() {
            Ok(text) => Some(text),
            Err(_) => mail
                .get_body_raw()
                .ok()
                .map(|raw| String::from_utf8_lossy(&raw).into_owned()),
        };
    }
    mail.subparts.iter().find_map(first_plain_part)
}

fn extract_body(mail: &ParsedMail<'_>) -> String {
    if let Some(text) = first_plain_part(mail).filter(|t| !t.is_empty()) {
        return text;
    }
    // Non-text or undecodable payloads: take whatever bytes are there.
    mail.get_body_raw()
        .map(|raw| String::from_utf8_lossy(&raw).into_owned())
        .unwrap_or_default()
}

/// Parses one raw RFC 822 message. `None` means the row is unusable.
pub fn parse_email(file_path: &str, raw_message: &str) -> Option<EmailRecord> {
    if raw_message.trim().is_empty() {
        return None;
    }
    let mail = match mailparse::parse_mail(raw_message.as_bytes()) {
        Ok(m) => m,
        Err(e) => {
            debug!("Failed to parse email {}: {}", file_path, e);
            return None;
        }
    };
    let headers = &mail.headers;
    let header = |name: &str| headers.get_first_value(name).unwrap_or_default();

    let body = extract_body(&mail);
    let recipients_to = parse_address_list(headers.get_first_value("To"));
    let recipients_cc = parse_address_list(headers.get_first_value("Cc"));
    let bcc_raw = headers
        .get_first_value("X-bcc")
        .filter(|v| !v.trim().is_empty())
        .or_else(|| headers.get_first_value("Bcc"));
    let recipients_bcc = parse_address_list(bcc_raw);
    let total_recipients = recipients_to.len() + recipients_cc.len() + recipients_bcc.len();

    Some(EmailRecord {
        file_path: file_path.to_string(),
        sender: header("From"),
        subject: header("Subject"),
        date: header("Date"),
        folder: folder_from_path(file_path),
        word_count: body.split_whitespace().count(),
        body,
        recipients_to,
        recipients_cc,
        recipients_bcc,
        total_recipients,
    })
}

enum Row {
    Message(String, String),
    Empty,
}

/// Sequential CSV row source. Field sizes are unbounded; rows whose field
/// count differs from the header are rejected and counted as failures.
struct RowReader {
    reader: csv::Reader<File>,
    file_col: usize,
    message_col: usize,
    record: csv::ByteRecord,
    done: bool,
}

impl RowReader {
    fn open(path: &Path) -> anyhow::Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .with_context(|| format!("open corpus {}", path.display()))?;
        let headers = reader.byte_headers()?.clone();
        let find = |name: &[u8], fallback: usize| {
            headers
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
                .unwrap_or(fallback)
        };
        Ok(Self {
            file_col: find(b"file", 0),
            message_col: find(b"message", 1),
            reader,
            record: csv::ByteRecord::new(),
            done: false,
        })
    }

    /// `None` once the file is exhausted or unreadable.
    fn next_row(&mut self) -> Option<Row> {
        if self.done {
            return None;
        }
        match self.reader.read_byte_record(&mut self.record) {
            Ok(true) => {
                let field = |i: usize| {
                    self.record
                        .get(i)
                        .map(|b| String::from_utf8_lossy(b).into_owned())
                        .unwrap_or_default()
                };
                let message = field(self.message_col);
                if message.is_empty() {
                    return Some(Row::Empty);
                }
                Some(Row::Message(field(self.file_col), message))
            }
            Ok(false) => {
                self.done = true;
                None
            }
            Err(e) if e.is_io_error() => {
                warn!("Corpus read aborted: {}", e);
                self.done = true;
                None
            }
            Err(e) => {
                debug!("Skipping malformed CSV row: {}", e);
                Some(Row::Empty)
            }
        }
    }
}

enum ParseMode {
    Inline,
    Pool {
        pool: Arc<rayon::ThreadPool>,
        min_len: usize,
    },
}

/// Lazy, finite sequence of email batches. Stats are final once it returns `None`.
pub struct BatchIter {
    rows: RowReader,
    chunk_size: usize,
    mode: ParseMode,
    stats: LoadStats,
    finished: bool,
}

impl BatchIter {
    pub fn stats(&self) -> LoadStats {
        self.stats
    }

    fn next_inline(&mut self) -> Vec<EmailRecord> {
        let mut batch = Vec::with_capacity(self.chunk_size.min(1024));
        while batch.len() < self.chunk_size {
            match self.rows.next_row() {
                Some(Row::Message(path, message)) => match parse_email(&path, &message) {
                    Some(em) => {
                        self.stats.parsed += 1;
                        batch.push(em);
                    }
                    None => self.stats.failed += 1,
                },
                Some(Row::Empty) => self.stats.failed += 1,
                None => break,
            }
        }
        batch
    }

    fn next_pooled(&mut self, pool: &rayon::ThreadPool, min_len: usize) -> Option<Vec<EmailRecord>> {
        let mut raw: Vec<(String, String)> = Vec::with_capacity(self.chunk_size.min(1024));
        while raw.len() < self.chunk_size {
            match self.rows.next_row() {
                Some(Row::Message(path, message)) => raw.push((path, message)),
                Some(Row::Empty) => self.stats.failed += 1,
                None => break,
            }
        }
        if raw.is_empty() {
            return None;
        }
        let parsed: Vec<EmailRecord> = pool.install(|| {
            raw.par_iter()
                .with_min_len(min_len)
                .filter_map(|(path, message)| parse_email(path, message))
                .collect()
        });
        self.stats.parsed += parsed.len();
        self.stats.failed += raw.len() - parsed.len();
        Some(parsed)
    }
}

impl Iterator for BatchIter {
    type Item = Vec<EmailRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let batch = match &self.mode {
            ParseMode::Inline => {
                let batch = self.next_inline();
                if batch.is_empty() {
                    None
                } else {
                    Some(batch)
                }
            }
            ParseMode::Pool { pool, min_len } => {
                let pool = Arc::clone(pool);
                let min_len = *min_len;
                self.next_pooled(&pool, min_len)
            }
        };
        match batch {
            Some(b) => {
                info!("  Loaded {} emails so far...", self.stats.parsed);
                Some(b)
            }
            None => {
                self.finished = true;
                info!(
                    "Corpus loading complete: {} parsed, {} failed/skipped",
                    self.stats.parsed, self.stats.failed
                );
                None
            }
        }
    }
}

/// Async handle over a loader running on the blocking pool.
pub struct LoadStream {
    rx: mpsc::Receiver<Vec<EmailRecord>>,
    handle: JoinHandle<anyhow::Result<LoadStats>>,
}

impl LoadStream {
    pub async fn next_batch(&mut self) -> Option<Vec<EmailRecord>> {
        self.rx.recv().await
    }

    /// Stops the reader (if still running) and returns its counts.
    pub async fn finish(self) -> anyhow::Result<LoadStats> {
        drop(self.rx);
        self.handle.await?
    }
}

#[derive(Debug, Clone)]
pub struct CorpusLoader {
    path: PathBuf,
    cfg: LoaderConfig,
}

impl CorpusLoader {
    /// Fails fast when the corpus is missing, before any work starts.
    pub fn open(path: impl Into<PathBuf>, cfg: LoaderConfig) -> Result<Self, TriageError> {
        let path = path.into();
        if !path.is_file() {
            return Err(TriageError::CorpusNotFound(path));
        }
        if cfg.chunk_size == 0 {
            return Err(TriageError::InvalidConfig(
                "loader.chunk_size must be > 0".into(),
            ));
        }
        Ok(Self { path, cfg })
    }

    pub fn worker_count(&self) -> usize {
        if self.cfg.workers > 0 {
            return self.cfg.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(3)
    }

    fn log_open(&self, label: &str) {
        let size_mb = std::fs::metadata(&self.path)
            .map(|m| m.len() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0);
        info!(
            "Loading corpus ({}): {} ({:.1} MB)",
            label,
            self.path.display(),
            size_mb
        );
    }

    /// Single-threaded batches. Each call re-reads the file from the start.
    pub fn batches(&self) -> anyhow::Result<BatchIter> {
        self.log_open("sequential");
        Ok(BatchIter {
            rows: RowReader::open(&self.path)?,
            chunk_size: self.cfg.chunk_size,
            mode: ParseMode::Inline,
            stats: LoadStats::default(),
            finished: false,
        })
    }

    /// Rows are read sequentially; parsing fans out over a dedicated rayon pool.
    pub fn parallel_batches(&self) -> anyhow::Result<BatchIter> {
        let workers = self.worker_count();
        self.log_open(&format!("parallel, {workers} workers"));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("corpus-parse-{i}"))
            .build()
            .context("build parse pool")?;
        Ok(BatchIter {
            rows: RowReader::open(&self.path)?,
            chunk_size: self.cfg.chunk_size,
            mode: ParseMode::Pool {
                pool: Arc::new(pool),
                min_len: self.cfg.pool_chunk_size.max(1),
            },
            stats: LoadStats::default(),
            finished: false,
        })
    }

    /// Runs the configured variant on the blocking pool and hands batches over a
    /// small bounded channel, so at most a couple of batches are in memory.
    pub fn stream(&self) -> LoadStream {
        let (tx, rx) = mpsc::channel(2);
        let loader = self.clone();
        let handle = task::spawn_blocking(move || {
            let mut iter = if loader.cfg.parallel {
                loader.parallel_batches()?
            } else {
                loader.batches()?
            };
            for batch in iter.by_ref() {
                if tx.blocking_send(batch).is_err() {
                    // Receiver dropped, stop reading.
                    break;
                }
            }
            Ok(iter.stats())
        });
        LoadStream { rx, handle }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "Message-ID: <1.JavaMail.evans@thyme>\n\
Date: Mon, 14 May 2001 16:39:00 -0700 (PDT)\n\
From: phillip.allen@enron.com\n\
To: tim.belden@enron.com, john.lavorato@enron.com,\n\
\tmike.grigsby@enron.com\n\
Subject: Re: Pipeline capacity plan\n\
Mime-Version: 1.0\n\
Content-Type: text/plain; charset=us-ascii\n\
Content-Transfer-Encoding: 7bit\n\
X-From: Phillip K Allen\n\
X-bcc: \n\
\n\
Here is our forecast for the pipeline capacity.\n";

    #[test]
    fn parses_headers_and_body() {
        let em = parse_email("allen-p/_sent_mail/1.", RAW).unwrap();
        assert_eq!(em.sender, "phillip.allen@enron.com");
        assert_eq!(em.subject, "Re: Pipeline capacity plan");
        assert_eq!(em.date, "Mon, 14 May 2001 16:39:00 -0700 (PDT)");
        assert_eq!(
            em.recipients_to,
            vec![
                "tim.belden@enron.com",
                "john.lavorato@enron.com",
                "mike.grigsby@enron.com"
            ]
        );
        assert!(em.recipients_bcc.is_empty());
        assert_eq!(em.total_recipients, 3);
        assert_eq!(em.folder, "_sent_mail");
        assert!(em.body.contains("forecast for the pipeline"));
        assert_eq!(em.word_count, 8);
    }

    #[test]
    fn multipart_prefers_plain_text_part() {
        let raw = "From: a@x.com\n\
Subject: Mixed\n\
MIME-Version: 1.0\n\
Content-Type: multipart/alternative; boundary=\"XYZ\"\n\
\n\
--XYZ\n\
Content-Type: text/html\n\
\n\
<p>html version</p>\n\
--XYZ\n\
Content-Type: text/plain\n\
\n\
plain version\n\
--XYZ--\n";
        let em = parse_email("a/inbox/2.", raw).unwrap();
        assert!(em.body.contains("plain version"));
        assert!(!em.body.contains("<p>"));
    }

    #[test]
    fn empty_messages_are_rejected() {
        assert!(parse_email("a/inbox/3.", "").is_none());
        assert!(parse_email("a/inbox/3.", "   \n").is_none());
    }

    #[test]
    fn folder_comes_from_second_segment() {
        assert_eq!(folder_from_path("allen-p/inbox/12."), "inbox");
        assert_eq!(folder_from_path("orphan"), "");
    }

    fn write_csv(dir: &Path) -> PathBuf {
        let mut csv = String::from("file,message\n");
        for i in 0..5 {
            let msg = if i == 2 {
                String::new()
            } else {
                RAW.replace("Pipeline capacity plan", &format!("Plan {i}"))
            };
            csv.push_str(&format!("\"allen-p/inbox/{i}.\",\"{}\"\n", msg.replace('"', "\"\"")));
        }
        let path = dir.join("corpus.csv");
        std::fs::write(&path, csv).unwrap();
        path
    }

    fn config(parallel: bool) -> LoaderConfig {
        LoaderConfig {
            chunk_size: 2,
            parallel,
            workers: 2,
            pool_chunk_size: 1,
        }
    }

    #[test]
    fn parallel_batches_match_sequential_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path());
        let loader = CorpusLoader::open(&path, config(false)).unwrap();

        let mut seq = loader.batches().unwrap();
        let seq_batches: Vec<Vec<EmailRecord>> = seq.by_ref().collect();
        let mut par = loader.parallel_batches().unwrap();
        let par_batches: Vec<Vec<EmailRecord>> = par.by_ref().collect();

        let subjects = |batches: &[Vec<EmailRecord>]| -> Vec<String> {
            batches.iter().flatten().map(|e| e.subject.clone()).collect()
        };
        assert_eq!(subjects(&seq_batches), subjects(&par_batches));
        assert!(seq_batches.iter().all(|b| b.len() <= 2));
        assert_eq!(seq.stats(), LoadStats { parsed: 4, failed: 1 });
        assert_eq!(par.stats(), seq.stats());
    }

    #[tokio::test]
    async fn stream_reports_counts_when_finished() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path());
        let loader = CorpusLoader::open(&path, config(true)).unwrap();

        let mut stream = loader.stream();
        let mut seen = 0;
        while let Some(batch) = stream.next_batch().await {
            seen += batch.len();
        }
        assert_eq!(seen, 4);
        assert_eq!(stream.finish().await.unwrap().parsed, 4);
    }

    #[test]
    fn rejected_csv_row_is_counted_and_reading_continues() {
        let dir = tempfile::tempdir().unwrap();
        let quoted = |s: &str| format!("\"{}\"", s.replace('"', "\"\""));
        let csv = format!(
            "file,message\n{},{}\n{},{},\"stray\"\n{},{}\n",
            quoted("allen-p/inbox/1."),
            quoted(RAW),
            quoted("allen-p/inbox/2."),
            quoted(RAW),
            quoted("allen-p/inbox/3."),
            quoted(&RAW.replace("Pipeline capacity plan", "Second plan")),
        );
        let path = dir.path().join("ragged.csv");
        std::fs::write(&path, csv).unwrap();

        let loader = CorpusLoader::open(&path, config(false)).unwrap();
        let mut iter = loader.batches().unwrap();
        let batches: Vec<Vec<EmailRecord>> = iter.by_ref().collect();

        let subjects: Vec<&str> = batches.iter().flatten().map(|e| e.subject.as_str()).collect();
        assert_eq!(subjects, vec!["Re: Pipeline capacity plan", "Re: Second plan"]);
        assert_eq!(iter.stats(), LoadStats { parsed: 2, failed: 1 });
    }

    #[test]
    fn missing_corpus_is_a_configuration_error() {
        let err = CorpusLoader::open("/definitely/not/here.csv", LoaderConfig::default());
        assert!(matches!(err, Err(TriageError::CorpusNotFound(_))));
    }
}
