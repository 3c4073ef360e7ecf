use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type EmployerId = String;

/// One employer as listed by the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employer {
    pub id: EmployerId,
    pub name: String,
    pub score: f64,
    pub review_count: u64,
}

/// Which tail of the score distribution an employer was selected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    /// Score at or above the high percentile; its "pros" feed the corpus.
    Positive,
    /// Score at or below the low percentile; its "cons" feed the corpus.
    Negative,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Positive => write!(f, "positive"),
            Signal::Negative => write!(f, "negative"),
        }
    }
}

/// A selected employer. Flattened so it round-trips through one CSV row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: EmployerId,
    pub name: String,
    pub score: f64,
    pub review_count: u64,
    pub signal: Signal,
}

impl Target {
    pub fn new(employer: Employer, signal: Signal) -> Self {
        Target {
            id: employer.id,
            name: employer.name,
            score: employer.score,
            review_count: employer.review_count,
            signal,
        }
    }
}

/// A single review as committed to a worker's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub employer_id: EmployerId,
    pub review_id: String,
    pub pros: String,
    pub cons: String,
    pub rating: f64,
    /// Cursor value of the page commit that produced this record.
    pub page: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionState {
    Pending,
    Paging,
    Blocked,
    Exhausted,
    Failed,
}

impl fmt::Display for CollectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CollectionState::Pending => "pending",
            CollectionState::Paging => "paging",
            CollectionState::Blocked => "blocked",
            CollectionState::Exhausted => "exhausted",
            CollectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Durable per-employer progress marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub employer_id: EmployerId,
    /// Next page to fetch, zero-based.
    pub cursor: u32,
    pub reviews_collected: u64,
    pub state: CollectionState,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Local>,
}

impl Checkpoint {
    pub fn fresh(employer_id: &str) -> Self {
        Checkpoint {
            employer_id: employer_id.to_string(),
            cursor: 0,
            reviews_collected: 0,
            state: CollectionState::Pending,
            last_error: None,
            updated_at: Local::now(),
        }
    }
}
