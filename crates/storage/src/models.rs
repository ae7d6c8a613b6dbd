use serde::{Deserialize, Serialize};

/// One curated email as it is written to disk, scores included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedEmail {
    pub file_path: String,
    pub sender: String,
    pub recipients_to: Vec<String>,
    pub recipients_cc: Vec<String>,
    pub subject: String,
    pub date: String,
    pub folder: String,
    pub body: String,
    pub word_count: usize,
    pub heuristic_score: f64,
    pub embedding_score: f64,
    pub combined_score: f64,
    pub best_matching_query: String,
    pub signals: Vec<String>,
}

/// Row of `_pipeline_metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub index: usize,
    pub file_path: String,
    pub subject: String,
    pub sender: String,
    pub date: String,
    pub word_count: usize,
    pub heuristic_score: f64,
    pub embedding_score: f64,
    pub combined_score: f64,
    pub best_matching_query: String,
    pub signals: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportStats {
    pub exported: usize,
    pub output_dir: String,
}
