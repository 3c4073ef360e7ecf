use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, USER_AGENT};
use std::time::Duration;
use log::debug;
use url::Url;

use crate::error::{HarvestError, Result};

/// Status and body of one review listing response.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPage {
    pub status: u16,
    pub body: String,
}

impl RawPage {
    pub fn ok(body: impl Into<String>) -> Self {
        RawPage {
            status: 200,
            body: body.into(),
        }
    }
}

/// Retrieves one page of an employer's reviews. Pages are zero-based.
///
/// Transport failures come back as `HarvestError::PageFetch`; any HTTP
/// response, including error statuses, is returned as a `RawPage`.
pub trait ReviewFetcher {
    fn fetch_page(&self, employer_id: &str, page: u32) -> Result<RawPage>;
}

pub struct HttpReviewFetcher {
    client: Client,
    url_template: String,
}

const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
];

impl HttpReviewFetcher {
    pub fn new(url_template: &str, timeout_secs: u64) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .default_headers(headers)
            .cookie_store(true)
            .build()?;

        Ok(HttpReviewFetcher {
            client,
            url_template: url_template.to_string(),
        })
    }

    fn get_random_user_agent(&self) -> &'static str {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())]
    }

    /// Fills the template; `{page}` is rendered one-based.
    pub fn page_url(&self, employer_id: &str, page: u32) -> Result<Url> {
        let raw = self
            .url_template
            .replace("{employer_id}", employer_id)
            .replace("{page}", &(page + 1).to_string());
        Url::parse(&raw).map_err(|e| HarvestError::Configuration(format!("review url '{}': {}", raw, e)))
    }
}

impl ReviewFetcher for HttpReviewFetcher {
    fn fetch_page(&self, employer_id: &str, page: u32) -> Result<RawPage> {
        let url = self.page_url(employer_id, page)?;
        debug!("GET {}", url);

        let fetch_err = |reason: String| HarvestError::PageFetch {
            employer_id: employer_id.to_string(),
            page,
            reason,
        };

        let resp = self
            .client
            .get(url)
            .header(USER_AGENT, self.get_random_user_agent())
            .send()
            .map_err(|e| fetch_err(format!("request failed: {}", e)))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .map_err(|e| fetch_err(format!("failed to read body: {}", e)))?;
        Ok(RawPage { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_url_substitutes_employer_and_one_based_page() {
        let fetcher =
            HttpReviewFetcher::new("https://reviews.example.com/{employer_id}/page-{page}.htm", 5).unwrap();
        let url = fetcher.page_url("E123", 0).unwrap();
        assert_eq!(url.as_str(), "https://reviews.example.com/E123/page-1.htm");
        let url = fetcher.page_url("E123", 6).unwrap();
        assert!(url.as_str().ends_with("page-7.htm"));
    }
}
