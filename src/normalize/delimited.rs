use crate::normalize::{FlatRecord, Scalar, normalize_column_name};
use std::borrow::Cow;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum DelimitedError {
    #[error("malformed delimited row {row}: {message}")]
    Row { row: u64, message: String },
}

const UTF8_BOM: &[u8; 3] = b"\xef\xbb\xbf";

/// Parses a tab-separated flat-file report. Headers are normalized to snake_case;
/// short rows are padded with `""` and surplus cells are ignored.
pub fn parse_tab_separated(bytes: &[u8]) -> Result<Vec<FlatRecord>, DelimitedError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let text = decode_text(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .has_headers(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|err| DelimitedError::Row {
            row: 0,
            message: err.to_string(),
        })?
        .iter()
        .map(normalize_column_name)
        .collect();

    let mut records = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row.map_err(|err| DelimitedError::Row {
            row: index as u64 + 1,
            message: err.to_string(),
        })?;
        if row.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        let record: FlatRecord = headers
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let value = row.get(i).map(str::trim).unwrap_or_default();
                (column.clone(), Scalar::from(value))
            })
            .collect();
        records.push(record);
    }
    Ok(records)
}

/// Flat files are UTF-8 in most marketplaces and Latin-1 (ISO-8859-1) in some.
/// Anything that is not valid UTF-8 is read as Latin-1, which maps every byte.
fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(err) => {
            warn!(
                target = "extractor.delimited",
                valid_up_to = err.valid_up_to(),
                "flat file is not UTF-8, decoding as Latin-1"
            );
            Cow::Owned(bytes.iter().map(|&b| char::from(b)).collect())
        }
    }
}
