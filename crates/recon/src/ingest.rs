//! CSV ingestion for uploaded sale/payment exports.

use crate::error::ReconError;
use crate::model::RawRow;

/// Rows per batch used by the upload path and the engine's cancellation checks.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Parse a CSV document (with header row) into raw rows.
///
/// Every cell becomes a JSON string; typing happens later in the normalizer.
/// Empty cells are omitted so that "column absent" and "cell blank" look the
/// same downstream. Short records are tolerated (`flexible`), missing trailing
/// cells simply don't appear in the row.
pub fn load_csv_rows(csv_data: &str) -> Result<Vec<RawRow>, ReconError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(csv_data.as_bytes());

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        return Err(ReconError::InvalidInput("csv has no header row".into()));
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row = RawRow::new();
        for (i, header) in headers.iter().enumerate() {
            match record.get(i) {
                Some(cell) if !cell.is_empty() => {
                    row.insert(header, cell);
                }
                _ => {}
            }
        }
        rows.push(row);
    }

    Ok(rows)
}

/// Split a slice into batches of at most `size` (a zero size is treated as 1).
pub fn chunked<T>(items: &[T], size: usize) -> std::slice::Chunks<'_, T> {
    items.chunks(size.max(1))
}
