use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Serialize;

use crate::error::{HarvestError, Result};
use crate::resume_manager::CheckpointStore;
use crate::selector::TargetSet;
use crate::types::{CollectionState, Signal};

#[derive(Debug, Serialize)]
struct CorpusRow<'a> {
    employer_id: &'a str,
    review_id: &'a str,
    rating: f64,
    text: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorpusSummary {
    pub employers: usize,
    pub pros_documents: usize,
    pub cons_documents: usize,
    pub pros_path: PathBuf,
    pub cons_path: PathBuf,
}

/// Merges every worker's committed reviews into the pros and cons corpora.
///
/// Refuses to write anything unless each target is exhausted in at least
/// one worker directory.
pub fn assemble(target_set: &TargetSet, worker_dirs: &[PathBuf], out_dir: &Path) -> Result<CorpusSummary> {
    let stores: Vec<CheckpointStore> = worker_dirs
        .iter()
        .filter(|d| d.is_dir())
        .map(CheckpointStore::new)
        .collect::<Result<_>>()?;

    // employer id -> stores that hold data for it
    let mut holders: HashMap<String, Vec<usize>> = HashMap::new();
    let mut exhausted: HashSet<String> = HashSet::new();
    for (i, store) in stores.iter().enumerate() {
        for cp in store.list_checkpoints()? {
            if cp.state == CollectionState::Exhausted {
                exhausted.insert(cp.employer_id.clone());
            }
            holders.entry(cp.employer_id).or_default().push(i);
        }
    }

    let unfinished: Vec<String> = target_set
        .targets
        .iter()
        .filter(|t| !exhausted.contains(&t.id))
        .map(|t| t.id.clone())
        .collect();
    if !unfinished.is_empty() {
        warn!("Refusing to assemble: {} employer(s) unfinished", unfinished.len());
        return Err(HarvestError::IncompleteCollection { unfinished });
    }

    fs::create_dir_all(out_dir)?;
    let pros_path = out_dir.join("pros.csv");
    let cons_path = out_dir.join("cons.csv");
    let mut pros = csv::Writer::from_writer(File::create(&pros_path)?);
    let mut cons = csv::Writer::from_writer(File::create(&cons_path)?);
    pros.write_record(["employer_id", "review_id", "rating", "text"])?;
    cons.write_record(["employer_id", "review_id", "rating", "text"])?;

    let mut pros_documents = 0;
    let mut cons_documents = 0;
    for target in &target_set.targets {
        let mut seen = HashSet::new();
        for &i in holders.get(&target.id).map(Vec::as_slice).unwrap_or_default() {
            for record in stores[i].committed_records(&target.id)? {
                if !seen.insert(record.review_id.clone()) {
                    continue;
                }
                let (text, writer, count) = match target.signal {
                    Signal::Positive => (&record.pros, &mut pros, &mut pros_documents),
                    Signal::Negative => (&record.cons, &mut cons, &mut cons_documents),
                };
                if text.trim().is_empty() {
                    continue;
                }
                writer.serialize(CorpusRow {
                    employer_id: &record.employer_id,
                    review_id: &record.review_id,
                    rating: record.rating,
                    text,
                })?;
                *count += 1;
            }
        }
    }
    pros.flush()?;
    cons.flush()?;

    info!(
        "Assembled corpora from {} employers: {} pros, {} cons",
        target_set.len(),
        pros_documents,
        cons_documents
    );
    Ok(CorpusSummary {
        employers: target_set.len(),
        pros_documents,
        cons_documents,
        pros_path,
        cons_path,
    })
}
