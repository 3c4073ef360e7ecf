use regex::{Regex, RegexBuilder};
use scraper::{ElementRef, Html, Selector};

use crate::config::PageLayout;
use crate::error::{HarvestError, Result};

/// Fields pulled from one review container, before they are tied to a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedReview {
    pub review_id: String,
    pub pros: String,
    pub cons: String,
    pub rating: f64,
}

/// What a fetched review page turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum PageKind {
    Content(Vec<ExtractedReview>),
    Challenge,
    EndOfResults,
}

pub struct Extractor {
    review: Selector,
    pros: Selector,
    cons: Selector,
    rating: Selector,
    review_id_attr: String,
    challenge_regex: Regex,
    number_regex: Regex,
}

fn parse_selector(css: &str) -> Result<Selector> {
    Selector::parse(css)
        .map_err(|e| HarvestError::Configuration(format!("bad selector '{}': {:?}", css, e)))
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: ElementRef<'_>) -> String {
    normalize(&el.text().collect::<Vec<_>>().join(" "))
}

impl Extractor {
    pub fn new(layout: &PageLayout) -> Result<Self> {
        let challenge_regex = RegexBuilder::new(&layout.challenge_pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| HarvestError::Configuration(format!("bad challenge pattern: {}", e)))?;
        Ok(Extractor {
            review: parse_selector(&layout.review)?,
            pros: parse_selector(&layout.pros)?,
            cons: parse_selector(&layout.cons)?,
            rating: parse_selector(&layout.rating)?,
            review_id_attr: layout.review_id_attr.clone(),
            challenge_regex,
            number_regex: Regex::new(r"\d+(?:\.\d+)?").expect("static regex"),
        })
    }

    pub fn is_challenge(&self, body: &str) -> bool {
        self.challenge_regex.is_match(body)
    }

    /// Classifies an HTTP response body. `status` is the numeric HTTP status.
    ///
    /// A successful page with review containers is content even if its
    /// markup mentions a captcha; the challenge pattern only decides pages
    /// that carry no reviews.
    ///
    /// Returns `None` for statuses that are neither content nor a known end
    /// of the listing; the caller treats those as fetch failures.
    pub fn classify(&self, status: u16, body: &str, employer_id: &str, page: u32) -> Option<PageKind> {
        let success = (200..=299).contains(&status);
        if success {
            let reviews = self.extract_reviews(body, employer_id, page);
            if !reviews.is_empty() {
                return Some(PageKind::Content(reviews));
            }
        }
        if self.is_challenge(body) {
            return Some(PageKind::Challenge);
        }
        match status {
            404 | 410 => Some(PageKind::EndOfResults),
            _ if success => Some(PageKind::EndOfResults),
            _ => None,
        }
    }

    pub fn extract_reviews(&self, html: &str, employer_id: &str, page: u32) -> Vec<ExtractedReview> {
        let document = Html::parse_document(html);
        let mut reviews = Vec::new();

        for (n, container) in document.select(&self.review).enumerate() {
            let pros = container
                .select(&self.pros)
                .next()
                .map(element_text)
                .unwrap_or_default();
            let cons = container
                .select(&self.cons)
                .next()
                .map(element_text)
                .unwrap_or_default();
            let rating = container
                .select(&self.rating)
                .next()
                .and_then(|el| self.rating_of(el))
                .unwrap_or(0.0);

            let review_id = container
                .value()
                .attr(&self.review_id_attr)
                .or_else(|| container.value().id())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("{}-p{}-{}", employer_id, page, n));

            reviews.push(ExtractedReview {
                review_id,
                pros,
                cons,
                rating,
            });
        }
        reviews
    }

    fn rating_of(&self, el: ElementRef<'_>) -> Option<f64> {
        if let Some(v) = el.value().attr("data-rating").or_else(|| el.value().attr("title")) {
            if let Some(m) = self.number_regex.find(v) {
                return m.as_str().parse().ok();
            }
        }
        let text = element_text(el);
        self.number_regex
            .find(&text)
            .and_then(|m| m.as_str().parse().ok())
    }
}
