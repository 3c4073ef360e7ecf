//! Per-employer collection state machine.
//!
//! `Pending -> Paging -> (Blocked -> Paging)* -> Exhausted`, with `Failed`
//! when a page keeps failing or a challenge is not cleared in time. Pages are
//! fetched strictly in order and page N+1 is requested only after page N is
//! committed through the checkpoint store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::config::HarvestConfig;
use crate::delay_manager::{self, DelayRange, RetryPolicy};
use crate::error::{HarvestError, Result};
use crate::extractor::{Extractor, PageKind};
use crate::gate::{GateOutcome, InteractionGate};
use crate::resume_manager::CheckpointStore;
use crate::scraper::ReviewFetcher;
use crate::types::{Checkpoint, CollectionState, ReviewRecord};

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub max_pages_per_employer: u32,
    pub retry: RetryPolicy,
    pub page_delay: DelayRange,
    pub gate_timeout: Option<Duration>,
}

impl From<&HarvestConfig> for CollectorSettings {
    fn from(config: &HarvestConfig) -> Self {
        CollectorSettings {
            max_pages_per_employer: config.max_pages_per_employer,
            retry: config.retry,
            page_delay: config.page_delay_secs,
            gate_timeout: config.gate_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EmployerOutcome {
    /// Reached the end of the listing (this run or earlier).
    Exhausted { reviews: u64, pages: u32 },
    /// Already exhausted before this run started.
    Skipped { reviews: u64 },
    Failed { reason: String },
    /// Stopped by the operator at a checkpoint boundary.
    Aborted,
}

pub struct ReviewCollector<F: ReviewFetcher> {
    fetcher: F,
    extractor: Extractor,
    store: CheckpointStore,
    gate: Arc<InteractionGate>,
    stop: Arc<AtomicBool>,
    settings: CollectorSettings,
}

impl<F: ReviewFetcher> ReviewCollector<F> {
    pub fn new(
        fetcher: F,
        extractor: Extractor,
        store: CheckpointStore,
        gate: Arc<InteractionGate>,
        stop: Arc<AtomicBool>,
        settings: CollectorSettings,
    ) -> Self {
        ReviewCollector {
            fetcher,
            extractor,
            store,
            gate,
            stop,
            settings,
        }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn gate(&self) -> &Arc<InteractionGate> {
        &self.gate
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Runs one employer to a terminal state.
    ///
    /// Page failures become `EmployerOutcome::Failed`; only checkpoint store
    /// errors are returned as `Err`.
    pub fn collect_employer(&self, employer_id: &str) -> Result<EmployerOutcome> {
        let mut cp = self.store.open(employer_id)?;
        if cp.state == CollectionState::Exhausted {
            info!("'{}' already exhausted ({} reviews), skipping", employer_id, cp.reviews_collected);
            return Ok(EmployerOutcome::Skipped {
                reviews: cp.reviews_collected,
            });
        }
        if cp.state == CollectionState::Failed {
            info!(
                "Retrying previously failed '{}' from page {}: {}",
                employer_id,
                cp.cursor,
                cp.last_error.as_deref().unwrap_or("unknown error")
            );
        }

        let mut fetched_this_run = 0u32;
        loop {
            if self.stop_requested() {
                info!("Stop requested; leaving '{}' at page {}", employer_id, cp.cursor);
                return Ok(EmployerOutcome::Aborted);
            }
            if cp.cursor >= self.settings.max_pages_per_employer {
                info!("'{}' hit the {} page cap", employer_id, self.settings.max_pages_per_employer);
                return self.finish(&mut cp);
            }
            if cp.state != CollectionState::Paging {
                self.store.set_state(&mut cp, CollectionState::Paging, None)?;
            }
            if fetched_this_run > 0 {
                delay_manager::random_page_delay(self.settings.page_delay);
            }

            let page = cp.cursor;
            fetched_this_run += 1;
            let kind = match self.fetch_classified(employer_id, page) {
                Ok(kind) => kind,
                Err(HarvestError::PageFetch { reason, .. }) => {
                    warn!("Giving up on '{}' at page {}: {}", employer_id, page, reason);
                    self.store
                        .set_state(&mut cp, CollectionState::Failed, Some(reason.clone()))?;
                    return Ok(EmployerOutcome::Failed { reason });
                }
                Err(e) => return Err(e),
            };

            match kind {
                PageKind::Content(reviews) => {
                    let records: Vec<ReviewRecord> = reviews
                        .into_iter()
                        .map(|r| ReviewRecord {
                            employer_id: employer_id.to_string(),
                            review_id: r.review_id,
                            pros: r.pros,
                            cons: r.cons,
                            rating: r.rating,
                            page,
                        })
                        .collect();
                    self.store.commit_page(&mut cp, page, &records)?;
                    info!(
                        "'{}' page {}: {} reviews ({} total)",
                        employer_id,
                        page + 1,
                        records.len(),
                        cp.reviews_collected
                    );
                }
                PageKind::EndOfResults => return self.finish(&mut cp),
                PageKind::Challenge => {
                    self.store.set_state(&mut cp, CollectionState::Blocked, None)?;
                    match self.gate.wait_for_resume(employer_id, self.settings.gate_timeout) {
                        // Same cursor is fetched again on the next pass.
                        GateOutcome::Resumed => {}
                        GateOutcome::TimedOut => {
                            let reason = "challenge not cleared".to_string();
                            self.store
                                .set_state(&mut cp, CollectionState::Failed, Some(reason.clone()))?;
                            return Ok(EmployerOutcome::Failed { reason });
                        }
                        GateOutcome::Aborted => return Ok(EmployerOutcome::Aborted),
                    }
                }
            }
        }
    }

    fn finish(&self, cp: &mut Checkpoint) -> Result<EmployerOutcome> {
        self.store.set_state(cp, CollectionState::Exhausted, None)?;
        info!(
            "'{}' exhausted: {} reviews over {} page(s)",
            cp.employer_id, cp.reviews_collected, cp.cursor
        );
        Ok(EmployerOutcome::Exhausted {
            reviews: cp.reviews_collected,
            pages: cp.cursor,
        })
    }

    /// Fetches and classifies one page, retrying transient failures.
    fn fetch_classified(&self, employer_id: &str, page: u32) -> Result<PageKind> {
        let policy = &self.settings.retry;
        let mut attempt = 0;
        loop {
            let reason = match self.fetcher.fetch_page(employer_id, page) {
                Ok(raw) => match self.extractor.classify(raw.status, &raw.body, employer_id, page) {
                    Some(kind) => return Ok(kind),
                    None => format!("unexpected status {}", raw.status),
                },
                Err(HarvestError::PageFetch { reason, .. }) => reason,
                Err(e) => return Err(e),
            };

            if attempt >= policy.max_retries || self.stop_requested() {
                return Err(HarvestError::PageFetch {
                    employer_id: employer_id.to_string(),
                    page,
                    reason: format!("{} (after {} retries)", reason, attempt),
                });
            }
            warn!("'{}' page {}: {}", employer_id, page + 1, reason);
            policy.backoff(attempt, &format!("'{}' page {}", employer_id, page + 1));
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PageLayout;
    use crate::scraper::RawPage;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Serves scripted responses and records every page requested.
    struct Scripted {
        responses: RefCell<VecDeque<Result<RawPage>>>,
        requested: RefCell<Vec<u32>>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<RawPage>>) -> Self {
            Scripted {
                responses: RefCell::new(responses.into()),
                requested: RefCell::new(Vec::new()),
            }
        }
    }

    impl ReviewFetcher for &Scripted {
        fn fetch_page(&self, _employer_id: &str, page: u32) -> Result<RawPage> {
            self.requested.borrow_mut().push(page);
            self.responses
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Ok(RawPage::ok("<html></html>")))
        }
    }

    fn page_with(ids: &[&str]) -> RawPage {
        let items: String = ids
            .iter()
            .map(|id| {
                format!(
                    r#"<li class="empReview" data-review-id="{id}"><span class="rating">3</span><p class="pros">p {id}</p><p class="cons">c {id}</p></li>"#
                )
            })
            .collect();
        RawPage::ok(format!("<html><ol>{}</ol></html>", items))
    }

    fn settings(max_retries: u32) -> CollectorSettings {
        CollectorSettings {
            max_pages_per_employer: 10,
            retry: RetryPolicy::immediate(max_retries),
            page_delay: DelayRange::none(),
            gate_timeout: Some(Duration::from_millis(20)),
        }
    }

    fn collector<'a>(
        fetcher: &'a Scripted,
        dir: &std::path::Path,
        settings: CollectorSettings,
    ) -> ReviewCollector<&'a Scripted> {
        ReviewCollector::new(
            fetcher,
            Extractor::new(&PageLayout::default()).unwrap(),
            CheckpointStore::new(dir).unwrap(),
            Arc::new(InteractionGate::new()),
            Arc::new(AtomicBool::new(false)),
            settings,
        )
    }

    #[test]
    fn pages_until_empty_page() {
        let dir = tempfile::tempdir().unwrap();
        let script = Scripted::new(vec![Ok(page_with(&["a", "b"])), Ok(page_with(&["c"]))]);
        let c = collector(&script, dir.path(), settings(0));

        let outcome = c.collect_employer("acme").unwrap();
        assert_eq!(outcome, EmployerOutcome::Exhausted { reviews: 3, pages: 2 });
        assert_eq!(*script.requested.borrow(), vec![0, 1, 2]);

        // A second run does not refetch anything.
        assert_eq!(
            c.collect_employer("acme").unwrap(),
            EmployerOutcome::Skipped { reviews: 3 }
        );
        assert_eq!(script.requested.borrow().len(), 3);
    }

    #[test]
    fn transient_errors_are_retried_then_fail_the_employer() {
        let dir = tempfile::tempdir().unwrap();
        let script = Scripted::new(vec![
            Ok(RawPage { status: 503, body: "busy".into() }),
            Ok(page_with(&["a"])),
            Ok(RawPage { status: 500, body: String::new() }),
            Ok(RawPage { status: 500, body: String::new() }),
        ]);
        let c = collector(&script, dir.path(), settings(1));

        let outcome = c.collect_employer("acme").unwrap();
        assert!(matches!(outcome, EmployerOutcome::Failed { .. }));
        let cp = c.store().load("acme").unwrap().unwrap();
        assert_eq!(cp.state, CollectionState::Failed);
        assert_eq!(cp.cursor, 1);
        assert_eq!(cp.reviews_collected, 1);
    }

    #[test]
    fn unanswered_challenge_times_out_into_failed() {
        let dir = tempfile::tempdir().unwrap();
        let script = Scripted::new(vec![
            Ok(page_with(&["a"])),
            Ok(RawPage { status: 403, body: "captcha".into() }),
        ]);
        let c = collector(&script, dir.path(), settings(0));
        let outcome = c.collect_employer("acme").unwrap();
        assert_eq!(
            outcome,
            EmployerOutcome::Failed {
                reason: "challenge not cleared".to_string()
            }
        );
        assert_eq!(c.store().load("acme").unwrap().unwrap().cursor, 1);
    }

    #[test]
    fn page_cap_exhausts_the_employer() {
        let dir = tempfile::tempdir().unwrap();
        let script = Scripted::new(vec![Ok(page_with(&["a"])), Ok(page_with(&["b"])), Ok(page_with(&["c"]))]);
        let mut s = settings(0);
        s.max_pages_per_employer = 2;
        let c = collector(&script, dir.path(), s);
        assert_eq!(
            c.collect_employer("acme").unwrap(),
            EmployerOutcome::Exhausted { reviews: 2, pages: 2 }
        );
        assert_eq!(*script.requested.borrow(), vec![0, 1]);
    }

    #[test]
    fn stop_flag_leaves_checkpoint_intact() {
        let dir = tempfile::tempdir().unwrap();
        let script = Scripted::new(vec![]);
        let c = collector(&script, dir.path(), settings(0));
        c.stop.store(true, Ordering::SeqCst);
        assert_eq!(c.collect_employer("acme").unwrap(), EmployerOutcome::Aborted);
        assert!(script.requested.borrow().is_empty());
    }
}
