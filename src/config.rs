use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::delay_manager::{DelayRange, RetryPolicy};
use crate::error::{HarvestError, Result};

/// Where and how the employer directory is queried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub page_size: u32,
    /// Hard stop for the paged listing, independent of what the source reports.
    pub max_pages: u32,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.example.com/employers".to_string(),
            api_key: None,
            page_size: 100,
            max_pages: 500,
        }
    }
}

/// CSS selectors and markers used to read a review listing page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PageLayout {
    pub review: String,
    pub pros: String,
    pub cons: String,
    pub rating: String,
    /// Attribute on the review container carrying its id.
    pub review_id_attr: String,
    /// Case-insensitive regex; a match in a page without reviews means challenge.
    pub challenge_pattern: String,
}

impl Default for PageLayout {
    fn default() -> Self {
        Self {
            review: "li.empReview".to_string(),
            pros: ".pros".to_string(),
            cons: ".cons".to_string(),
            rating: ".rating".to_string(),
            review_id_attr: "data-review-id".to_string(),
            challenge_pattern:
                r"captcha|verify (?:that )?you are (?:a )?human|are you a robot|unusual traffic|cf-challenge"
                    .to_string(),
        }
    }
}

/// Score-extremity thresholds for target selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub min_reviews: u64,
    pub low_percentile: f64,
    pub high_percentile: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_reviews: 100,
            low_percentile: 5.0,
            high_percentile: 95.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub directory: DirectoryConfig,
    /// `{employer_id}` and `{page}` (one-based) are substituted per request.
    pub review_url_template: String,
    pub layout: PageLayout,
    pub thresholds: Thresholds,
    pub max_pages_per_employer: u32,
    pub retry: RetryPolicy,
    pub page_delay_secs: DelayRange,
    pub employer_delay_secs: DelayRange,
    /// None waits for the operator indefinitely.
    pub gate_timeout_secs: Option<u64>,
    pub output_dir: PathBuf,
    pub worker_count: usize,
    pub request_timeout_secs: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            directory: DirectoryConfig::default(),
            review_url_template:
                "https://www.example.com/Reviews/{employer_id}/page-{page}.htm".to_string(),
            layout: PageLayout::default(),
            thresholds: Thresholds::default(),
            max_pages_per_employer: 200,
            retry: RetryPolicy::default(),
            page_delay_secs: DelayRange::new(8, 30),
            employer_delay_secs: DelayRange::new(16, 45),
            gate_timeout_secs: None,
            output_dir: PathBuf::from("harvest"),
            worker_count: 5,
            request_timeout_secs: 30,
        }
    }
}

impl HarvestConfig {
    /// Loads a JSON config file; missing fields fall back to defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: HarvestConfig = serde_json::from_str(&content)?;
        config.validate()?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let config = HarvestConfig::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.thresholds;
        let pct_ok = |p: f64| (0.0..=100.0).contains(&p);
        if !pct_ok(t.low_percentile) || !pct_ok(t.high_percentile) {
            return Err(HarvestError::Configuration(
                "percentiles must lie within 0..=100".to_string(),
            ));
        }
        if t.low_percentile > t.high_percentile {
            return Err(HarvestError::Configuration(format!(
                "low percentile {} exceeds high percentile {}",
                t.low_percentile, t.high_percentile
            )));
        }
        if self.directory.page_size == 0 {
            return Err(HarvestError::Configuration(
                "directory page_size must be positive".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(HarvestError::Configuration(
                "worker_count must be positive".to_string(),
            ));
        }
        if !self.review_url_template.contains("{employer_id}") {
            return Err(HarvestError::Configuration(
                "review_url_template needs an {employer_id} placeholder".to_string(),
            ));
        }
        self.page_delay_secs.validate("page_delay_secs")?;
        self.employer_delay_secs.validate("employer_delay_secs")?;
        self.retry.validate()?;
        Ok(())
    }

    pub fn gate_timeout(&self) -> Option<Duration> {
        self.gate_timeout_secs.map(Duration::from_secs)
    }

    pub fn targets_path(&self) -> PathBuf {
        self.output_dir.join("targets.csv")
    }

    pub fn partition_dir(&self) -> PathBuf {
        self.output_dir.join("partitions")
    }

    pub fn worker_dir(&self, worker: usize) -> PathBuf {
        self.output_dir.join(format!("worker-{}", worker))
    }

    pub fn corpus_dir(&self) -> PathBuf {
        self.output_dir.join("corpus")
    }

    pub fn resume_flag_dir(&self) -> PathBuf {
        self.output_dir.join("resume")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: HarvestConfig =
            serde_json::from_str(r#"{ "worker_count": 3, "thresholds": { "min_reviews": 50 } }"#)
                .unwrap();
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.thresholds.min_reviews, 50);
        assert_eq!(config.thresholds.high_percentile, 95.0);
        assert_eq!(config.max_pages_per_employer, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn inverted_percentiles_are_rejected() {
        let mut config = HarvestConfig::default();
        config.thresholds.low_percentile = 96.0;
        assert!(matches!(
            config.validate(),
            Err(HarvestError::Configuration(_))
        ));
    }

    #[test]
    fn template_without_employer_placeholder_is_rejected() {
        let mut config = HarvestConfig::default();
        config.review_url_template = "https://example.com/reviews".to_string();
        assert!(config.validate().is_err());
    }
}
