use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::model::error::{MalformedReason, MalformedRowError};
use crate::model::rows::{MatchStateRow, RawStateRecord};

/// Valid rows plus everything that had to be dropped on the way in.
#[derive(Debug, Default)]
pub struct LoadedRows {
    pub rows: Vec<MatchStateRow>,
    pub rejected: Vec<MalformedRowError>,
}

/// Load match-state rows from a CSV file with a header line.
pub fn load_csv(path: &Path) -> Result<LoadedRows> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open input file: {}", path.display()))?;
    let loaded = read_rows(file)?;
    info!(
        "Loaded {} match-state rows from {} ({} rejected)",
        loaded.rows.len(),
        path.display(),
        loaded.rejected.len()
    );
    Ok(loaded)
}

/// Decode and validate every record. Bad records are dropped and reported;
/// only I/O failures abort the load.
pub fn read_rows<R: Read>(reader: R) -> Result<LoadedRows> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = reader.headers().context("Failed to read CSV header")?.clone();
    let match_id_col = headers.iter().position(|h| h == "match_id");

    let mut loaded = LoadedRows::default();
    let mut record = csv::StringRecord::new();

    loop {
        match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {}
            Err(e) => {
                if matches!(e.kind(), csv::ErrorKind::Io(_)) {
                    return Err(e).context("Failed to read CSV record");
                }
                let line = e.position().map(|p| p.line()).unwrap_or(0);
                reject(&mut loaded, String::new(), line, MalformedReason::Decode(e.to_string()));
                continue;
            }
        }

        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let parsed = record
            .deserialize::<RawStateRecord>(Some(&headers))
            .map_err(|e| MalformedRowError {
                match_id: match_id_col
                    .and_then(|i| record.get(i))
                    .unwrap_or_default()
                    .to_string(),
                line,
                reason: MalformedReason::Decode(e.to_string()),
            })
            .and_then(|raw| MatchStateRow::from_raw(raw, line));

        match parsed {
            Ok(row) => loaded.rows.push(row),
            Err(e) => {
                warn!("Dropping {}", e);
                loaded.rejected.push(e);
            }
        }
    }
    Ok(loaded)
}

fn reject(loaded: &mut LoadedRows, match_id: String, line: u64, reason: MalformedReason) {
    let err = MalformedRowError {
        match_id,
        line,
        reason,
    };
    warn!("Dropping {}", err);
    loaded.rejected.push(err);
}
