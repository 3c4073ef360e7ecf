use std::fs::File;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Reader};
use log::{error, info, warn};
use serde::Deserialize;

use crate::directory::EmployerSource;
use crate::error::{HarvestError, Result};
use crate::types::Employer;

/// Employer row of an exported listing file.
#[derive(Debug, Deserialize, Clone)]
pub struct ListingRecord {
    #[serde(rename = "id", alias = "Id", alias = "ID", alias = "employer_id", alias = "Employer Id")]
    pub id: String,
    #[serde(rename = "name", alias = "Name", alias = "Company", alias = "company", alias = "Employer")]
    pub name: String,
    #[serde(rename = "score", alias = "Score", alias = "rating", alias = "Rating", alias = "overallRating")]
    pub score: f64,
    #[serde(
        rename = "review_count",
        alias = "Reviews",
        alias = "reviews",
        alias = "numberOfRatings",
        alias = "Review Count"
    )]
    pub review_count: u64,
}

impl From<ListingRecord> for Employer {
    fn from(r: ListingRecord) -> Self {
        Employer {
            id: r.id.trim().to_string(),
            name: r.name.trim().to_string(),
            score: r.score,
            review_count: r.review_count,
        }
    }
}

/// Loads an employer listing from CSV or, by extension, a spreadsheet
/// (xlsx, xlsm, xlsb, xls or ods).
pub fn load_employers<P: AsRef<Path>>(filename: P) -> Result<Vec<Employer>> {
    let path_ref = filename.as_ref();

    if !path_ref.exists() {
        error!("Listing file {:?} does not exist.", path_ref);
        return Err(HarvestError::Input(format!("{:?} does not exist", path_ref)));
    }

    let is_excel = path_ref
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| {
            matches!(ext.to_ascii_lowercase().as_str(), "xlsx" | "xlsm" | "xlsb" | "xls" | "ods")
        });

    if is_excel {
        return load_excel(path_ref);
    }
    load_csv(path_ref)
}

fn load_csv(path: &Path) -> Result<Vec<Employer>> {
    let file = File::open(path)?;
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut employers = Vec::new();
    for (line, result) in rdr.deserialize::<ListingRecord>().enumerate() {
        match result {
            Ok(record) => employers.push(record.into()),
            Err(e) => warn!("Skipping listing row {}: {}", line + 2, e),
        }
    }
    info!("Loaded {} employers from CSV {:?}", employers.len(), path);
    Ok(employers)
}

fn load_excel(path: &Path) -> Result<Vec<Employer>> {
    let mut excel = open_workbook_auto(path)
        .map_err(|e| HarvestError::Input(format!("could not open workbook {:?}: {}", path, e)))?;

    let worksheets = excel.worksheets();
    let Some((_name, range)) = worksheets.first() else {
        return Err(HarvestError::Input(format!("workbook {:?} has no sheets", path)));
    };

    let mut id_idx = None;
    let mut name_idx = None;
    let mut score_idx = None;
    let mut count_idx = None;
    let mut employers = Vec::new();

    for (row_idx, row) in range.rows().enumerate() {
        if row_idx == 0 {
            for (col_idx, cell) in row.iter().enumerate() {
                let header = cell.to_string().to_lowercase();
                if header.contains("review") || header.contains("ratings") {
                    count_idx = Some(col_idx);
                } else if header.contains("id") && id_idx.is_none() {
                    id_idx = Some(col_idx);
                } else if header.contains("name") || header.contains("company") || header.contains("employer") {
                    name_idx = Some(col_idx);
                } else if header.contains("score") || header.contains("rating") {
                    score_idx = Some(col_idx);
                }
            }
            if id_idx.is_none() || score_idx.is_none() || count_idx.is_none() {
                return Err(HarvestError::Input(
                    "workbook header needs id, score and review count columns".to_string(),
                ));
            }
            continue;
        }

        let cell = |idx: Option<usize>| {
            idx.and_then(|i| row.get(i))
                .map(|c| c.to_string().trim().to_string())
                .unwrap_or_default()
        };
        let id = cell(id_idx);
        let score = cell(score_idx).parse::<f64>();
        let count = cell(count_idx).parse::<f64>();
        match (id.is_empty(), score, count) {
            (false, Ok(score), Ok(count)) if count >= 0.0 => employers.push(Employer {
                name: cell(name_idx),
                id,
                score,
                review_count: count as u64,
            }),
            _ => warn!("Skipping workbook row {}", row_idx + 1),
        }
    }

    info!("Loaded {} employers from Excel {:?}", employers.len(), path);
    Ok(employers)
}

/// A listing file served as a single-page `EmployerSource`.
pub struct LocalListing {
    path: PathBuf,
    name: String,
}

impl LocalListing {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = path.display().to_string();
        LocalListing { path, name }
    }
}

impl EmployerSource for LocalListing {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch_page(&self, page: u32) -> Result<Vec<Employer>> {
        if page > 0 {
            return Ok(Vec::new());
        }
        load_employers(&self.path).map_err(|e| HarvestError::SourceUnavailable {
            source_name: self.name.clone(),
            reason: e.to_string(),
        })
    }
}
