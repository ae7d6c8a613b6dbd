//! Core library: corpus loading, heuristic and embedding ranking, project discovery and curation.

pub mod config;
pub mod curation;
pub mod discovery;
pub mod embeddings;
pub mod error;
pub mod heuristic;
pub mod loader;
pub mod models;
pub mod pipeline;
pub mod subject;
pub mod upload;

pub use error::TriageError;
