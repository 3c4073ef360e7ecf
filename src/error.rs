use std::io;

use thiserror::Error;

/// Error type for selection, collection, checkpoint and assembly failures.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("employer source '{source_name}' is unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },
    #[error("failed to fetch page {page} of employer '{employer_id}': {reason}")]
    PageFetch {
        employer_id: String,
        page: u32,
        reason: String,
    },
    #[error("collection incomplete, {} employer(s) not exhausted: {}", unfinished.len(), unfinished.join(", "))]
    IncompleteCollection { unfinished: Vec<String> },
    #[error("checkpoint conflict for '{employer_id}': stored cursor {stored}, commit cursor {attempted}")]
    CheckpointConflict {
        employer_id: String,
        stored: u32,
        attempted: u32,
    },
    #[error("invalid partition: {0}")]
    InvalidPartition(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("input error: {0}")]
    Input(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_collection_lists_unfinished_employers() {
        let err = HarvestError::IncompleteCollection {
            unfinished: vec!["acme".to_string(), "globex".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "collection incomplete, 2 employer(s) not exhausted: acme, globex"
        );
    }
}
