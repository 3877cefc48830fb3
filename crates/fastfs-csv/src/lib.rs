//! Newline-aligned block trimming and row filtering for the optional CSV
//! query endpoint.
//!
//! A raw byte range pulled out of the middle of a CSV file almost never
//! starts or ends on a row boundary. `aligned_slice` trims a block down to
//! whole rows: drop everything up to (and including) the first newline
//! when the block isn't the first one in the file, then drop everything
//! after the last newline, so a caller never has to stitch a partial
//! trailing row back together by hand. `memchr::memrchr` does the
//! newline search.

use std::io::Cursor;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CsvFilterError {
    #[error("csv parse error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, CsvFilterError>;

/// Trim `raw` down to a whole number of newline-terminated rows.
///
/// `start_skip` should be `true` for every block except the first one in
/// the file (the first block already starts on a row boundary). Returns an
/// empty slice if no row boundary can be found within `block_size` bytes —
/// the caller should treat that as "this block has no usable rows on its
/// own" rather than an error.
pub fn aligned_slice(raw: &[u8], start_skip: bool, block_size: usize) -> &[u8] {
    let head_len = block_size.min(raw.len());
    let mut start_offset = 0usize;
    if start_skip {
        match memchr::memrchr(b'\n', &raw[..head_len]) {
            Some(idx) => start_offset = idx + 1,
            None => return &[],
        }
    }

    let tail_search_start = start_offset.max(raw.len().saturating_sub(block_size));
    match memchr::memrchr(b'\n', &raw[tail_search_start..]) {
        Some(idx) => &raw[start_offset..tail_search_start + idx],
        None => &[],
    }
}

/// Keeps only the rows of `csv_bytes` whose `column` equals `value`, byte
/// for byte. `csv_bytes` is assumed to already be row-aligned (run it
/// through [`aligned_slice`] first if it came from an arbitrary byte
/// range).
pub fn filter_rows_eq(csv_bytes: &[u8], column: usize, value: &str, has_headers: bool) -> Result<Vec<u8>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_headers)
        .from_reader(Cursor::new(csv_bytes));
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    if has_headers {
        if let Ok(headers) = reader.headers() {
            writer.write_record(headers)?;
        }
    }

    for record in reader.records() {
        let record = record?;
        if record.get(column).map(|v| v == value).unwrap_or(false) {
            writer.write_record(&record)?;
        }
    }

    Ok(writer.into_inner().expect("in-memory writer never fails to flush"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_slice_trims_leading_and_trailing_partial_rows() {
        let raw = b"rtial\nrow1,a\nrow2,b\nrow3,c\npartial";
        let out = aligned_slice(raw, true, raw.len());
        assert_eq!(out, b"row1,a\nrow2,b\nrow3,c");
    }

    #[test]
    fn aligned_slice_keeps_everything_when_no_skip_needed() {
        let raw = b"row1,a\nrow2,b\n";
        let out = aligned_slice(raw, false, raw.len());
        assert_eq!(out, b"row1,a\nrow2,b");
    }

    #[test]
    fn aligned_slice_returns_empty_when_no_boundary_found() {
        let raw = b"nonewlinesatall";
        let out = aligned_slice(raw, true, 5);
        assert!(out.is_empty());
    }

    #[test]
    fn filter_rows_eq_keeps_matching_rows_only() {
        let csv = b"id,status\n1,ok\n2,fail\n3,ok\n";
        let out = filter_rows_eq(csv, 1, "ok", true).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("1,ok"));
        assert!(out.contains("3,ok"));
        assert!(!out.contains("2,fail"));
    }
}
