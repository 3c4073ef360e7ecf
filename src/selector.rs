//! Employer selection: drain the directory, then keep the score extremes.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::Path;

use log::{info, warn};

use crate::config::Thresholds;
use crate::directory::EmployerSource;
use crate::error::Result;
use crate::types::{Employer, Signal, Target};

/// Selected employers, sorted by id, plus the cutoffs that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSet {
    pub targets: Vec<Target>,
    pub low_cutoff: Option<f64>,
    pub high_cutoff: Option<f64>,
    pub min_reviews: u64,
}

impl TargetSet {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.targets.iter().map(|t| t.id.as_str()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.id == id)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_targets(path, &self.targets)
    }

    /// Reloads a saved set. Cutoffs are not persisted.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let targets = load_targets(path)?;
        Ok(TargetSet::from_targets(targets))
    }

    pub fn from_targets(mut targets: Vec<Target>) -> Self {
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        let mut seen = HashSet::new();
        targets.retain(|t| seen.insert(t.id.clone()));
        TargetSet {
            targets,
            low_cutoff: None,
            high_cutoff: None,
            min_reviews: 0,
        }
    }
}

pub fn save_targets<P: AsRef<Path>>(path: P, targets: &[Target]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_writer(File::create(path)?);
    for target in targets {
        writer.serialize(target)?;
    }
    writer.flush()?;
    info!("Saved {} targets to {:?}", targets.len(), path);
    Ok(())
}

pub fn load_targets<P: AsRef<Path>>(path: P) -> Result<Vec<Target>> {
    let mut reader = csv::Reader::from_path(path.as_ref())?;
    let mut targets = Vec::new();
    for row in reader.deserialize() {
        targets.push(row?);
    }
    Ok(targets)
}

/// Percentile by linear interpolation between closest ranks.
///
/// `sorted` must be ascending. The rank of percentile `p` is
/// `p / 100 * (n - 1)`; fractional ranks interpolate between neighbours.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let p = p.clamp(0.0, 100.0);
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Keeps employers with enough reviews whose score sits in either tail.
///
/// An employer in both tails (all scores equal, say) is treated as
/// negative so it lands in exactly one corpus.
pub fn select_targets(employers: &[Employer], thresholds: &Thresholds) -> TargetSet {
    let mut seen = HashSet::new();
    let eligible: Vec<&Employer> = employers
        .iter()
        .filter(|e| seen.insert(e.id.as_str()))
        .filter(|e| e.review_count >= thresholds.min_reviews)
        .filter(|e| !e.score.is_nan())
        .collect();

    let mut scores: Vec<f64> = eligible.iter().map(|e| e.score).collect();
    scores.sort_by(|a, b| a.total_cmp(b));

    let low = percentile(&scores, thresholds.low_percentile);
    let high = percentile(&scores, thresholds.high_percentile);

    let mut targets = Vec::new();
    if let (Some(low), Some(high)) = (low, high) {
        for employer in eligible {
            let signal = if employer.score <= low {
                Signal::Negative
            } else if employer.score >= high {
                Signal::Positive
            } else {
                continue;
            };
            targets.push(Target::new(employer.clone(), signal));
        }
    }
    targets.sort_by(|a, b| a.id.cmp(&b.id));

    info!(
        "Selected {} of {} employers (min reviews {}, cutoffs {:?} / {:?})",
        targets.len(),
        employers.len(),
        thresholds.min_reviews,
        low,
        high
    );

    TargetSet {
        targets,
        low_cutoff: low,
        high_cutoff: high,
        min_reviews: thresholds.min_reviews,
    }
}

/// Drains a paged source until it returns an empty page or `max_pages`.
pub fn fetch_all_employers(source: &dyn EmployerSource, max_pages: u32) -> Result<Vec<Employer>> {
    let mut all = Vec::new();
    for page in 0..max_pages {
        let batch = source.fetch_page(page)?;
        if batch.is_empty() {
            info!("Directory exhausted after {} page(s)", page);
            return Ok(all);
        }
        all.extend(batch);
    }
    warn!(
        "Stopped directory listing at the {} page cap with {} employers",
        max_pages,
        all.len()
    );
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn employer(id: &str, score: f64, reviews: u64) -> Employer {
        Employer {
            id: id.to_string(),
            name: id.to_uppercase(),
            score,
            review_count: reviews,
        }
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 0.0), Some(1.0));
        assert_eq!(percentile(&sorted, 50.0), Some(3.0));
        assert_eq!(percentile(&sorted, 100.0), Some(5.0));
        let p5 = percentile(&sorted, 5.0).unwrap();
        assert!((p5 - 1.2).abs() < 1e-9);
        assert_eq!(percentile(&[], 5.0), None);
        assert_eq!(percentile(&[4.2], 95.0), Some(4.2));
    }

    #[test]
    fn low_volume_employers_do_not_shift_cutoffs() {
        // The 1.0 employer has too few reviews to count at all.
        let mut employers: Vec<Employer> = (0..20)
            .map(|i| employer(&format!("e{:02}", i), 2.0 + i as f64 * 0.1, 150))
            .collect();
        employers.push(employer("tiny", 1.0, 99));
        let set = select_targets(&employers, &Thresholds::default());
        assert!(set.get("tiny").is_none());
        assert_eq!(set.ids(), vec!["e00", "e19"]);
        assert_eq!(set.get("e00").unwrap().signal, Signal::Negative);
        assert_eq!(set.get("e19").unwrap().signal, Signal::Positive);
    }

    #[test]
    fn duplicate_ids_keep_first_listing() {
        let employers = vec![
            employer("a", 1.0, 200),
            employer("a", 5.0, 200),
            employer("b", 3.0, 200),
            employer("c", 5.0, 200),
        ];
        let set = select_targets(&employers, &Thresholds::default());
        assert_eq!(set.get("a").unwrap().score, 1.0);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn low_volume_first_listing_shadows_later_duplicate() {
        let employers = vec![
            employer("a", 1.0, 20),
            employer("a", 1.0, 900),
            employer("b", 3.0, 200),
            employer("c", 5.0, 200),
        ];
        let set = select_targets(&employers, &Thresholds::default());
        assert!(set.get("a").is_none());
        assert_eq!(set.ids(), vec!["b", "c"]);
    }

    #[test]
    fn identical_scores_are_negative_only() {
        let employers = vec![employer("a", 3.0, 200), employer("b", 3.0, 200)];
        let set = select_targets(&employers, &Thresholds::default());
        assert!(set.targets.iter().all(|t| t.signal == Signal::Negative));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn empty_listing_selects_nothing() {
        let set = select_targets(&[], &Thresholds::default());
        assert!(set.is_empty());
        assert_eq!(set.low_cutoff, None);
    }

    #[test]
    fn targets_round_trip_through_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.csv");
        let employers = vec![
            employer("b", 4.9, 300),
            employer("a", 1.1, 120),
            employer("m", 3.0, 500),
        ];
        let set = select_targets(&employers, &Thresholds::default());
        set.save(&path).unwrap();
        let loaded = TargetSet::load(&path).unwrap();
        assert_eq!(loaded.targets, set.targets);
    }
}
