//! Durable per-employer progress.
//!
//! Each employer gets a directory under the worker's output root holding
//! `reviews.csv` (append-only records) and `checkpoint.json`. A page commit
//! appends and fsyncs the records first, then atomically replaces the
//! checkpoint. The checkpoint is the commit point: on open, any rows with a
//! page at or past the stored cursor are leftovers of an interrupted commit
//! and are dropped.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{error, info, warn};

use crate::error::{HarvestError, Result};
use crate::types::{Checkpoint, CollectionState, ReviewRecord};

const CHECKPOINT_FILE: &str = "checkpoint.json";
const REVIEWS_FILE: &str = "reviews.csv";

pub struct CheckpointStore {
    root: PathBuf,
}

/// Maps an employer id onto a directory name, one-to-one.
///
/// ASCII alphanumerics and `-` pass through; every other byte becomes
/// `_xx` (lowercase hex), so `_` only ever starts an escape.
fn dir_name(employer_id: &str) -> String {
    let mut name = String::with_capacity(employer_id.len());
    for b in employer_id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' {
            name.push(b as char);
        } else {
            name.push_str(&format!("_{:02x}", b));
        }
    }
    name
}

/// Parses `reviews.csv`, skipping a torn final line and any row that no
/// longer deserializes. Returns the readable records and the skipped count.
fn scan_records(path: &Path) -> Result<(Vec<ReviewRecord>, usize)> {
    let mut bytes = fs::read(path)?;
    let mut skipped = 0;
    if !bytes.is_empty() && !bytes.ends_with(b"\n") {
        let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        warn!("Ignoring torn trailing row in {:?}", path);
        bytes.truncate(keep);
        skipped += 1;
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes.as_slice());
    let headers = reader.headers()?.clone();
    let mut records = Vec::new();
    for row in reader.records() {
        match row.and_then(|r| r.deserialize::<ReviewRecord>(Some(&headers))) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!("Ignoring unreadable row in {:?}: {}", path, e);
                skipped += 1;
            }
        }
    }
    Ok((records, skipped))
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(CheckpointStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn employer_dir(&self, employer_id: &str) -> PathBuf {
        self.root.join(dir_name(employer_id))
    }

    pub fn checkpoint_path(&self, employer_id: &str) -> PathBuf {
        self.employer_dir(employer_id).join(CHECKPOINT_FILE)
    }

    pub fn reviews_path(&self, employer_id: &str) -> PathBuf {
        self.employer_dir(employer_id).join(REVIEWS_FILE)
    }

    pub fn load(&self, employer_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.checkpoint_path(employer_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&content).map_err(|e| {
            error!("Failed to parse checkpoint {:?}: {}", path, e);
            e
        })?;
        if checkpoint.employer_id != employer_id {
            return Err(HarvestError::Input(format!(
                "checkpoint {:?} belongs to '{}', not '{}'",
                path, checkpoint.employer_id, employer_id
            )));
        }
        Ok(Some(checkpoint))
    }

    /// Loads (or creates) the checkpoint and trims uncommitted rows.
    pub fn open(&self, employer_id: &str) -> Result<Checkpoint> {
        fs::create_dir_all(self.employer_dir(employer_id))?;
        let mut checkpoint = match self.load(employer_id)? {
            Some(cp) => {
                info!(
                    "Resuming '{}' at page {} ({} reviews, {})",
                    employer_id, cp.cursor, cp.reviews_collected, cp.state
                );
                cp
            }
            None => Checkpoint::fresh(employer_id),
        };
        self.reconcile(&mut checkpoint)?;
        Ok(checkpoint)
    }

    fn reconcile(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        let path = self.reviews_path(&checkpoint.employer_id);
        if !path.exists() {
            if checkpoint.reviews_collected > 0 {
                error!(
                    "'{}' checkpoint claims {} reviews but {:?} is missing; resetting count",
                    checkpoint.employer_id, checkpoint.reviews_collected, path
                );
                checkpoint.reviews_collected = 0;
                self.save(checkpoint)?;
            }
            return Ok(());
        }

        let (records, skipped) = scan_records(&path)?;
        let total = records.len();
        let kept: Vec<ReviewRecord> = records
            .into_iter()
            .filter(|r| r.page < checkpoint.cursor)
            .collect();

        if kept.len() != total || skipped > 0 {
            warn!(
                "Dropping {} uncommitted review(s) of '{}' past page {}",
                total - kept.len() + skipped,
                checkpoint.employer_id,
                checkpoint.cursor
            );
            let mut writer = csv::Writer::from_writer(Vec::new());
            for record in &kept {
                writer.serialize(record)?;
            }
            let bytes = writer
                .into_inner()
                .map_err(|e| HarvestError::Io(e.into_error()))?;
            write_atomically(&path, &bytes)?;
        }

        if kept.len() as u64 != checkpoint.reviews_collected {
            warn!(
                "'{}' checkpoint count {} disagrees with {} stored reviews; using stored",
                checkpoint.employer_id,
                checkpoint.reviews_collected,
                kept.len()
            );
            checkpoint.reviews_collected = kept.len() as u64;
            self.save(checkpoint)?;
        }
        Ok(())
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let json = serde_json::to_string_pretty(checkpoint)?;
        write_atomically(&self.checkpoint_path(&checkpoint.employer_id), json.as_bytes())
    }

    /// Appends one page of records and advances the cursor past it.
    ///
    /// `page` must equal the stored cursor and every record must carry it.
    pub fn commit_page(&self, checkpoint: &mut Checkpoint, page: u32, records: &[ReviewRecord]) -> Result<()> {
        let stored = self
            .load(&checkpoint.employer_id)?
            .map(|cp| cp.cursor)
            .unwrap_or(0);
        if page != checkpoint.cursor || page != stored {
            return Err(HarvestError::CheckpointConflict {
                employer_id: checkpoint.employer_id.clone(),
                stored,
                attempted: page,
            });
        }
        if let Some(bad) = records
            .iter()
            .find(|r| r.page != page || r.employer_id != checkpoint.employer_id)
        {
            return Err(HarvestError::Input(format!(
                "record '{}' of '{}' page {} does not belong to commit '{}' page {}",
                bad.review_id, bad.employer_id, bad.page, checkpoint.employer_id, page
            )));
        }

        fs::create_dir_all(self.employer_dir(&checkpoint.employer_id))?;
        if !records.is_empty() {
            let path = self.reviews_path(&checkpoint.employer_id);
            let needs_header = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let mut writer = csv::WriterBuilder::new()
                .has_headers(needs_header)
                .from_writer(file);
            for record in records {
                writer.serialize(record)?;
            }
            writer.flush()?;
            let file = writer
                .into_inner()
                .map_err(|e| HarvestError::Io(e.into_error()))?;
            file.sync_all()?;
        }

        let mut next = checkpoint.clone();
        next.cursor = page + 1;
        next.reviews_collected += records.len() as u64;
        next.state = CollectionState::Paging;
        next.last_error = None;
        next.updated_at = Local::now();
        self.save(&next)?;
        *checkpoint = next;
        Ok(())
    }

    /// Persists a state change; the cursor is left alone.
    pub fn set_state(&self, checkpoint: &mut Checkpoint, state: CollectionState, last_error: Option<String>) -> Result<()> {
        checkpoint.state = state;
        checkpoint.last_error = last_error;
        checkpoint.updated_at = Local::now();
        self.save(checkpoint)
    }

    pub fn read_records(&self, employer_id: &str) -> Result<Vec<ReviewRecord>> {
        let path = self.reviews_path(employer_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let (records, _) = scan_records(&path)?;
        Ok(records)
    }

    /// Committed records only; uncommitted tail rows are ignored.
    pub fn committed_records(&self, employer_id: &str) -> Result<Vec<ReviewRecord>> {
        let cursor = match self.load(employer_id)? {
            Some(cp) => cp.cursor,
            None => return Ok(Vec::new()),
        };
        Ok(self
            .read_records(employer_id)?
            .into_iter()
            .filter(|r| r.page < cursor)
            .collect())
    }

    pub fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path().join(CHECKPOINT_FILE);
            if !path.exists() {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str::<Checkpoint>(&content) {
                Ok(cp) => checkpoints.push(cp),
                Err(e) => warn!("Ignoring unreadable checkpoint {:?}: {}", path, e),
            }
        }
        checkpoints.sort_by(|a, b| a.employer_id.cmp(&b.employer_id));
        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(employer: &str, page: u32, n: u32) -> ReviewRecord {
        ReviewRecord {
            employer_id: employer.to_string(),
            review_id: format!("{}-{}-{}", employer, page, n),
            pros: format!("pro {}", n),
            cons: format!("con {}", n),
            rating: 3.0,
            page,
        }
    }

    #[test]
    fn commits_advance_cursor_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let mut cp = store.open("acme").unwrap();
        assert_eq!(cp.state, CollectionState::Pending);

        store
            .commit_page(&mut cp, 0, &[record("acme", 0, 0), record("acme", 0, 1)])
            .unwrap();
        store.commit_page(&mut cp, 1, &[record("acme", 1, 0)]).unwrap();

        let reloaded = store.open("acme").unwrap();
        assert_eq!(reloaded.cursor, 2);
        assert_eq!(reloaded.reviews_collected, 3);
        assert_eq!(store.read_records("acme").unwrap().len(), 3);
    }

    #[test]
    fn stale_or_skipping_commit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let mut cp = store.open("acme").unwrap();
        store.commit_page(&mut cp, 0, &[record("acme", 0, 0)]).unwrap();

        let err = store
            .commit_page(&mut cp, 0, &[record("acme", 0, 0)])
            .unwrap_err();
        assert!(matches!(err, HarvestError::CheckpointConflict { stored: 1, attempted: 0, .. }));

        let mut stale = cp.clone();
        stale.cursor = 3;
        assert!(store.commit_page(&mut stale, 3, &[]).is_err());
        assert_eq!(store.load("acme").unwrap().unwrap().cursor, 1);
    }

    #[test]
    fn rows_past_cursor_are_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let mut cp = store.open("acme").unwrap();
        store.commit_page(&mut cp, 0, &[record("acme", 0, 0)]).unwrap();

        // Simulate a crash between the append and the checkpoint rename.
        let mut f = OpenOptions::new()
            .append(true)
            .open(store.reviews_path("acme"))
            .unwrap();
        writeln!(f, "acme,acme-1-0,orphan,orphan,1.0,1").unwrap();
        drop(f);
        assert_eq!(store.read_records("acme").unwrap().len(), 2);
        assert_eq!(store.committed_records("acme").unwrap().len(), 1);

        let cp = store.open("acme").unwrap();
        assert_eq!(cp.cursor, 1);
        let records = store.read_records("acme").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].review_id, "acme-0-0");
    }

    #[test]
    fn torn_row_from_a_crashed_append_is_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let mut cp = store.open("acme").unwrap();
        store.commit_page(&mut cp, 0, &[record("acme", 0, 0)]).unwrap();

        let mut f = OpenOptions::new()
            .append(true)
            .open(store.reviews_path("acme"))
            .unwrap();
        write!(f, "acme,acme-1-0,half wri").unwrap();
        drop(f);
        assert_eq!(store.committed_records("acme").unwrap().len(), 1);

        let mut cp = store.open("acme").unwrap();
        assert_eq!(cp.cursor, 1);
        assert_eq!(cp.reviews_collected, 1);
        let content = fs::read_to_string(store.reviews_path("acme")).unwrap();
        assert!(!content.contains("half wri"));

        // Later commits append cleanly after the trimmed file.
        store.commit_page(&mut cp, 1, &[record("acme", 1, 0)]).unwrap();
        let ids: Vec<String> = store
            .read_records("acme")
            .unwrap()
            .into_iter()
            .map(|r| r.review_id)
            .collect();
        assert_eq!(ids, vec!["acme-0-0", "acme-1-0"]);
    }

    #[test]
    fn missing_reviews_file_resets_stale_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let mut cp = store.open("acme").unwrap();
        store.commit_page(&mut cp, 0, &[record("acme", 0, 0), record("acme", 0, 1)]).unwrap();
        fs::remove_file(store.reviews_path("acme")).unwrap();

        let cp = store.open("acme").unwrap();
        assert_eq!(cp.cursor, 1);
        assert_eq!(cp.reviews_collected, 0);
        assert_eq!(store.load("acme").unwrap().unwrap().reviews_collected, 0);
    }

    #[test]
    fn similar_ids_get_separate_checkpoints() {
        assert_ne!(dir_name("a/b"), dir_name("a_b"));
        assert_ne!(dir_name("a.b"), dir_name("a_2eb"));
        assert_eq!(dir_name("Acme-42"), "Acme-42");

        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let mut cp = store.open("a/b").unwrap();
        store.commit_page(&mut cp, 0, &[record("a/b", 0, 0)]).unwrap();

        let other = store.open("a_b").unwrap();
        assert_eq!(other.employer_id, "a_b");
        assert_eq!(other.cursor, 0);
        assert_eq!(store.load("a/b").unwrap().unwrap().cursor, 1);
    }

    #[test]
    fn checkpoint_for_another_employer_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let mut cp = store.open("acme").unwrap();
        store.commit_page(&mut cp, 0, &[]).unwrap();
        let mut foreign = store.load("acme").unwrap().unwrap();
        foreign.employer_id = "globex".to_string();
        fs::write(
            store.checkpoint_path("acme"),
            serde_json::to_string(&foreign).unwrap(),
        )
        .unwrap();

        assert!(matches!(store.open("acme"), Err(HarvestError::Input(_))));
    }

    #[test]
    fn state_changes_keep_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let mut cp = store.open("a/b").unwrap();
        store.commit_page(&mut cp, 0, &[record("a/b", 0, 0)]).unwrap();
        store
            .set_state(&mut cp, CollectionState::Blocked, None)
            .unwrap();
        let loaded = store.load("a/b").unwrap().unwrap();
        assert_eq!(loaded.state, CollectionState::Blocked);
        assert_eq!(loaded.cursor, 1);
        assert_eq!(store.list_checkpoints().unwrap().len(), 1);
    }
}
