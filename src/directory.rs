use std::time::Duration;

use log::{error, info, warn};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::config::DirectoryConfig;
use crate::delay_manager::RetryPolicy;
use crate::error::{HarvestError, Result};
use crate::types::Employer;

const DIRECTORY_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// A paged listing of employers. Page numbers are zero-based.
pub trait EmployerSource: Send + Sync {
    fn name(&self) -> &str;
    fn fetch_page(&self, page: u32) -> Result<Vec<Employer>>;
}

/// Employer row as the directory API spells it.
#[derive(Debug, Deserialize)]
struct DirectoryEmployer {
    #[serde(alias = "employerId", alias = "employer_id")]
    id: serde_json::Value,
    #[serde(alias = "employerName", alias = "employer_name")]
    name: String,
    #[serde(default, alias = "overallRating", alias = "rating")]
    score: serde_json::Value,
    #[serde(alias = "numberOfRatings", alias = "reviewCount", alias = "review_count")]
    review_count: u64,
}

#[derive(Debug, Deserialize)]
struct EmployerList {
    employers: Vec<DirectoryEmployer>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DirectoryBody {
    Wrapped { response: EmployerList },
    Listed(EmployerList),
    Bare(Vec<DirectoryEmployer>),
}

fn value_to_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_f64(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parses one directory page. Rows without an id or a numeric score are skipped.
pub fn parse_directory_page(body: &str) -> std::result::Result<Vec<Employer>, serde_json::Error> {
    let rows = match serde_json::from_str::<DirectoryBody>(body)? {
        DirectoryBody::Wrapped { response } => response.employers,
        DirectoryBody::Listed(list) => list.employers,
        DirectoryBody::Bare(rows) => rows,
    };
    let mut employers = Vec::with_capacity(rows.len());
    for row in rows {
        match (value_to_string(&row.id), value_to_f64(&row.score)) {
            (Some(id), Some(score)) => employers.push(Employer {
                id,
                name: row.name.trim().to_string(),
                score,
                review_count: row.review_count,
            }),
            _ => warn!("Skipping directory row without usable id/score: {}", row.name),
        }
    }
    Ok(employers)
}

/// Result of a single directory request, before retry policy applies.
#[derive(Debug)]
pub enum Attempt {
    Ok(String),
    /// 403 or a transport failure; worth another try.
    Retryable(String),
    Fatal(String),
}

/// Runs `request` until it succeeds, fails fatally or runs out of retries.
pub fn fetch_with_retry<F>(policy: &RetryPolicy, source_name: &str, page: u32, mut request: F) -> Result<String>
where
    F: FnMut(u32) -> Attempt,
{
    let mut attempt = 0;
    loop {
        match request(page) {
            Attempt::Ok(body) => return Ok(body),
            Attempt::Fatal(reason) => {
                error!("Directory page {} failed: {}", page, reason);
                return Err(HarvestError::SourceUnavailable {
                    source_name: source_name.to_string(),
                    reason,
                });
            }
            Attempt::Retryable(reason) => {
                if attempt >= policy.max_retries {
                    error!(
                        "Directory page {} still failing after {} retries: {}",
                        page, policy.max_retries, reason
                    );
                    return Err(HarvestError::SourceUnavailable {
                        source_name: source_name.to_string(),
                        reason: format!("{} (after {} retries)", reason, policy.max_retries),
                    });
                }
                warn!("Directory page {}: {}", page, reason);
                policy.backoff(attempt, &format!("directory page {}", page));
                attempt += 1;
            }
        }
    }
}

pub struct DirectoryClient {
    client: Client,
    config: DirectoryConfig,
    retry: RetryPolicy,
    name: String,
}

impl DirectoryClient {
    pub fn new(config: DirectoryConfig, retry: RetryPolicy, timeout_secs: u64) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(DIRECTORY_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .default_headers(headers)
            .cookie_store(true)
            .build()?;

        let name = Url::parse(&config.base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| config.base_url.clone());

        Ok(DirectoryClient {
            client,
            config,
            retry,
            name,
        })
    }

    pub fn page_url(&self, page: u32) -> Result<Url> {
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|e| HarvestError::Configuration(format!("directory base_url: {}", e)))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("page", &(page + 1).to_string());
            query.append_pair("page_size", &self.config.page_size.to_string());
            if let Some(key) = &self.config.api_key {
                query.append_pair("api_key", key);
            }
        }
        Ok(url)
    }

    fn request(&self, url: &Url) -> Attempt {
        match self.client.get(url.clone()).send() {
            Ok(resp) => {
                let status = resp.status();
                if status == StatusCode::FORBIDDEN {
                    return Attempt::Retryable("access denied (403)".to_string());
                }
                if !status.is_success() {
                    return Attempt::Fatal(format!("unexpected status {}", status));
                }
                match resp.text() {
                    Ok(text) => Attempt::Ok(text),
                    Err(e) => Attempt::Retryable(format!("failed to read body: {}", e)),
                }
            }
            Err(e) => Attempt::Retryable(format!("request failed: {}", e)),
        }
    }
}

impl EmployerSource for DirectoryClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch_page(&self, page: u32) -> Result<Vec<Employer>> {
        let url = self.page_url(page)?;
        info!("Fetching directory page {}", page + 1);
        let body = fetch_with_retry(&self.retry, &self.name, page, |_| self.request(&url))?;
        parse_directory_page(&body).map_err(|e| HarvestError::SourceUnavailable {
            source_name: self.name.clone(),
            reason: format!("malformed listing on page {}: {}", page + 1, e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wrapped_and_bare_listings() {
        let wrapped = r#"{"response":{"employers":[
            {"id": 42, "name": " Acme ", "overallRating": 3.4, "numberOfRatings": 150},
            {"id": "x", "name": "NoScore", "overallRating": "", "numberOfRatings": 10}
        ]}}"#;
        let employers = parse_directory_page(wrapped).unwrap();
        assert_eq!(employers.len(), 1);
        assert_eq!(employers[0].id, "42");
        assert_eq!(employers[0].name, "Acme");
        assert_eq!(employers[0].review_count, 150);

        let bare = r#"[{"employer_id": "g1", "employer_name": "Globex", "rating": "4.5", "review_count": 900}]"#;
        let employers = parse_directory_page(bare).unwrap();
        assert_eq!(employers[0].score, 4.5);
    }

    #[test]
    fn retries_access_denied_then_succeeds() {
        let mut calls = 0;
        let body = fetch_with_retry(&RetryPolicy::immediate(3), "dir", 0, |_| {
            calls += 1;
            if calls < 3 {
                Attempt::Retryable("access denied (403)".to_string())
            } else {
                Attempt::Ok("[]".to_string())
            }
        })
        .unwrap();
        assert_eq!(body, "[]");
        assert_eq!(calls, 3);
    }

    #[test]
    fn gives_up_after_retry_cap() {
        let mut calls = 0;
        let err = fetch_with_retry(&RetryPolicy::immediate(2), "dir", 4, |_| {
            calls += 1;
            Attempt::Retryable("access denied (403)".to_string())
        })
        .unwrap_err();
        assert_eq!(calls, 3);
        assert!(matches!(err, HarvestError::SourceUnavailable { .. }));
    }

    #[test]
    fn fatal_status_is_not_retried() {
        let mut calls = 0;
        let err = fetch_with_retry(&RetryPolicy::immediate(5), "dir", 0, |_| {
            calls += 1;
            Attempt::Fatal("unexpected status 500".to_string())
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn page_url_is_one_based_with_key() {
        let config = DirectoryConfig {
            base_url: "https://dir.example.com/api/employers".to_string(),
            api_key: Some("k 1".to_string()),
            page_size: 50,
            max_pages: 10,
        };
        let client = DirectoryClient::new(config, RetryPolicy::default(), 5).unwrap();
        let url = client.page_url(0).unwrap();
        assert_eq!(
            url.as_str(),
            "https://dir.example.com/api/employers?page=1&page_size=50&api_key=k+1"
        );
        assert_eq!(client.name(), "dir.example.com");
    }
}
