//! Storage layer: on-disk artifacts.
//!
//! Holds the curated export layout and the JSON artifact helpers shared by
//! discovery, curation and the filter pipeline.

pub mod models;

use anyhow::Context;
use models::{ExportStats, ExportedEmail, MetadataEntry};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::info;

pub const METADATA_FILE: &str = "_pipeline_metadata.json";

const SUBJECT_CHARS: usize = 60;
const SLUG_CHARS: usize = 50;

pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    let body = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    let parsed = serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(parsed)
}

/// Keeps alphanumerics, space, `-` and `_`; everything else becomes `_`.
pub fn sanitize_subject(subject: &str) -> String {
    let source = if subject.is_empty() {
        "no_subject"
    } else {
        subject
    };
    let cleaned: String = source
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(SUBJECT_CHARS)
        .collect();
    cleaned.trim().to_string()
}

/// Filesystem-safe directory name for a project.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_underscore = false;
    for c in name.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            slug.push(c);
            last_underscore = false;
        } else if !last_underscore {
            slug.push('_');
            last_underscore = true;
        }
    }
    slug.trim_matches('_').chars().take(SLUG_CHARS).collect()
}

/// Header block, `---` separator, then the body.
pub fn render_document(email: &ExportedEmail, include_folder: bool) -> String {
    let mut out = String::with_capacity(email.body.len() + 256);
    out.push_str(&format!("From: {}\n", email.sender));
    out.push_str(&format!("To: {}\n", email.recipients_to.join(", ")));
    out.push_str(&format!("Cc: {}\n", email.recipients_cc.join(", ")));
    out.push_str(&format!("Date: {}\n", email.date));
    out.push_str(&format!("Subject: {}\n", email.subject));
    if include_folder {
        out.push_str(&format!("Folder: {}\n", email.folder));
    }
    out.push_str("---\n");
    out.push_str(&email.body);
    out
}

pub fn export_filename(index: usize, subject: &str) -> String {
    format!("{:04}_{}.txt", index, sanitize_subject(subject))
}

/// Writes one text file per email plus an optional metadata sidecar.
pub async fn export_to_directory(
    emails: &[ExportedEmail],
    output_dir: &Path,
    include_metadata: bool,
) -> anyhow::Result<ExportStats> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("create {}", output_dir.display()))?;

    let mut exported = 0usize;
    for (i, email) in emails.iter().enumerate() {
        let path = output_dir.join(export_filename(i, &email.subject));
        tokio::fs::write(&path, render_document(email, true))
            .await
            .with_context(|| format!("write {}", path.display()))?;
        exported += 1;
    }

    if include_metadata {
        let metadata: Vec<MetadataEntry> = emails
            .iter()
            .enumerate()
            .map(|(index, e)| MetadataEntry {
                index,
                file_path: e.file_path.clone(),
                subject: e.subject.clone(),
                sender: e.sender.clone(),
                date: e.date.clone(),
                word_count: e.word_count,
                heuristic_score: e.heuristic_score,
                embedding_score: e.embedding_score,
                combined_score: e.combined_score,
                best_matching_query: e.best_matching_query.clone(),
                signals: e.signals.clone(),
            })
            .collect();
        write_json(&output_dir.join(METADATA_FILE), &metadata).await?;
    }

    info!("Exported {} emails to {}", exported, output_dir.display());
    Ok(ExportStats {
        exported,
        output_dir: output_dir.to_string_lossy().into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(subject: &str) -> ExportedEmail {
        ExportedEmail {
            file_path: "allen-p/inbox/1.".into(),
            sender: "phillip.allen@enron.com".into(),
            recipients_to: vec!["a@enron.com".into(), "b@enron.com".into()],
            recipients_cc: vec![],
            subject: subject.into(),
            date: "Mon, 14 May 2001 16:39:00 -0700".into(),
            folder: "inbox".into(),
            body: "Body text here.".into(),
            word_count: 3,
            heuristic_score: 0.5,
            embedding_score: 0.7,
            combined_score: 0.64,
            best_matching_query: "q".into(),
            signals: vec!["+0.15 targeted(2 recipients)".into()],
        }
    }

    #[test]
    fn sanitize_replaces_punctuation_and_truncates() {
        assert_eq!(sanitize_subject("Re: Q3/Q4 plan?"), "Re_ Q3_Q4 plan_");
        assert_eq!(sanitize_subject(""), "no_subject");
        let long = "x".repeat(100);
        assert_eq!(sanitize_subject(&long).len(), 60);
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Q3 Budget -- Planning!"), "q3_budget_planning");
        assert_eq!(slugify("  EOL Phase II  "), "eol_phase_ii");
        assert_eq!(slugify(&"ab ".repeat(40)).len(), 50);
    }

    #[test]
    fn render_places_separator_between_headers_and_body() {
        let doc = render_document(&sample("Hello"), true);
        assert!(doc.starts_with("From: phillip.allen@enron.com\nTo: a@enron.com, b@enron.com\n"));
        assert!(doc.contains("Folder: inbox\n---\nBody text here."));
        let upload = render_document(&sample("Hello"), false);
        assert!(!upload.contains("Folder:"));
    }

    #[tokio::test]
    async fn export_writes_files_and_metadata() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("proj");
        let stats = export_to_directory(&[sample("First"), sample("Second?")], &dir, true)
            .await
            .unwrap();
        assert_eq!(stats.exported, 2);
        assert!(dir.join("0000_First.txt").exists());
        assert!(dir.join("0001_Second_.txt").exists());

        let meta: Vec<MetadataEntry> = read_json(&dir.join(METADATA_FILE)).await.unwrap();
        assert_eq!(meta.len(), 2);
        assert_eq!(meta[1].index, 1);
        assert_eq!(meta[0].signals, vec!["+0.15 targeted(2 recipients)".to_string()]);
    }
}
