//! Zip entry selection and delimited-text parsing with per-column type hints.

use std::io::{Cursor, Read};

use encoding_rs::WINDOWS_1252;
use ipeds_core::{Column, ColumnData, ColumnType, ColumnTypes, Table};
use zip::ZipArchive;

use crate::FetchError;

/// Name fragment NCES uses for a revised release of a survey file.
pub const REVISED_MARKER: &str = "_rv";

/// Pick the canonical data entry: CSV entries first (any entry if none are CSV),
/// a revised release over the base file, otherwise the first in archive order.
pub fn select_entry<'a, I>(names: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let files: Vec<&str> = names.into_iter().filter(|n| !n.ends_with('/')).collect();
    let csvs: Vec<&str> = files
        .iter()
        .copied()
        .filter(|n| n.to_ascii_lowercase().ends_with(".csv"))
        .collect();
    let pool = if csvs.is_empty() { files } else { csvs };

    pool.iter()
        .find(|n| n.to_ascii_lowercase().contains(REVISED_MARKER))
        .or_else(|| pool.first())
        .map(|n| n.to_string())
}

/// Open `bytes` as a zip archive and parse its canonical entry. Returns the entry name.
pub fn parse_archive(
    bytes: &[u8],
    column_types: &ColumnTypes,
    missing_value: &str,
) -> Result<(String, Table), FetchError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let entry = select_entry(archive.file_names())
        .ok_or(FetchError::NoDataFile)?;

    let mut raw = Vec::new();
    archive
        .by_name(&entry)?
        .read_to_end(&mut raw)
        .map_err(|source| FetchError::Io {
            entry: entry.clone(),
            source,
        })?;

    // NCES publishes Latin-1 text; a UTF-8 BOM switches the decoder over.
    let (text, _, _) = WINDOWS_1252.decode(&raw);
    let table = parse_delimited(&text, column_types, missing_value)?;
    Ok((entry, table))
}

enum Builder {
    Int(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
}

impl Builder {
    fn new(column_type: ColumnType) -> Self {
        match column_type {
            ColumnType::Int => Self::Int(Vec::new()),
            ColumnType::Float => Self::Float(Vec::new()),
            ColumnType::Text => Self::Text(Vec::new()),
        }
    }

    fn push(&mut self, value: Option<&str>, line: u64, column: &str) -> Result<(), FetchError> {
        let invalid = |expected: &'static str| FetchError::InvalidValue {
            line,
            column: column.to_string(),
            value: value.unwrap_or_default().to_string(),
            expected,
        };
        match self {
            Self::Int(values) => {
                let parsed = match value {
                    None => None,
                    Some(v) => Some(parse_int(v).ok_or_else(|| invalid("integer"))?),
                };
                values.push(parsed);
            }
            Self::Float(values) => {
                let parsed = match value {
                    None => None,
                    Some(v) => Some(
                        v.parse::<f64>()
                            .ok()
                            .filter(|f| f.is_finite())
                            .ok_or_else(|| invalid("number"))?,
                    ),
                };
                values.push(parsed);
            }
            Self::Text(values) => values.push(value.map(ToString::to_string)),
        }
        Ok(())
    }

    fn finish(self) -> ColumnData {
        match self {
            Self::Int(v) => ColumnData::Int(v),
            Self::Float(v) => ColumnData::Float(v),
            Self::Text(v) => ColumnData::Text(v),
        }
    }
}

fn parse_int(value: &str) -> Option<i64> {
    value.parse::<i64>().ok().or_else(|| {
        value
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite() && f.fract() == 0.0)
            .map(|f| f as i64)
    })
}

/// Parse comma-delimited text with a header row. Header names are trimmed and
/// lower-cased; blank header cells (trailing delimiters) are dropped. Cells equal
/// to `missing_value` or blank are nulls. No row index is inferred.
pub fn parse_delimited(
    text: &str,
    column_types: &ColumnTypes,
    missing_value: &str,
) -> Result<Table, FetchError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .from_reader(text.as_bytes());

    let headers: Vec<(usize, String)> = reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(idx, h)| (idx, h.trim().trim_start_matches('\u{feff}').to_ascii_lowercase()))
        .filter(|(_, h)| !h.is_empty())
        .collect();

    let mut builders: Vec<Builder> = headers
        .iter()
        .map(|(_, name)| Builder::new(column_types.get(name)))
        .collect();

    for record in reader.records() {
        let record = record?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        for ((idx, name), builder) in headers.iter().zip(builders.iter_mut()) {
            let value = record
                .get(*idx)
                .map(str::trim)
                .filter(|v| !v.is_empty() && *v != missing_value);
            builder.push(value, line, name)?;
        }
    }

    let columns = headers
        .into_iter()
        .zip(builders)
        .map(|((_, name), builder)| Column::new(name, builder.finish()))
        .collect();
    Ok(Table::from_columns(columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn zip_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .expect("start entry");
            writer.write_all(body).expect("write entry");
        }
        writer.finish().expect("finish zip").into_inner()
    }

    fn hd_hints() -> ColumnTypes {
        ColumnTypes::new()
            .with("unitid", ColumnType::Int)
            .with("locale", ColumnType::Int)
            .with("latitude", ColumnType::Float)
    }

    #[test]
    fn revised_entry_wins_over_base_file() {
        let names = ["hd2015.csv", "hd2015_rv.csv", "hd2015_dict.xlsx"];
        assert_eq!(select_entry(names).as_deref(), Some("hd2015_rv.csv"));
    }

    #[test]
    fn first_csv_is_used_without_revision() {
        let names = ["readme.txt", "EF2015A.csv"];
        assert_eq!(select_entry(names).as_deref(), Some("EF2015A.csv"));
        assert_eq!(select_entry(["data.txt"]).as_deref(), Some("data.txt"));
        assert_eq!(select_entry(Vec::<&str>::new()), None);
    }

    #[test]
    fn headers_are_normalized_and_dots_are_missing() {
        let text = "UNITID, INSTNM ,LOCALE,LATITUDE,\n100001,Test U,23,40.5,\n100002,.,.,,\n";
        let table = parse_delimited(text, &hd_hints(), ".").expect("parse");

        assert_eq!(table.column_names(), vec!["unitid", "instnm", "locale", "latitude"]);
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.column("unitid").unwrap().column_type(), ColumnType::Int);
        assert_eq!(table.column("locale").unwrap().i64_at(0), Some(23));
        assert_eq!(table.column("latitude").unwrap().f64_at(0), Some(40.5));
        assert!(table.column("instnm").unwrap().is_null(1));
        assert!(table.column("locale").unwrap().is_null(1));
        assert!(table.column("latitude").unwrap().is_null(1));
    }

    #[test]
    fn integral_floats_are_accepted_for_integer_hints() {
        let table = parse_delimited("unitid,locale\n1,23.0\n", &hd_hints(), ".").expect("parse");
        assert_eq!(table.column("locale").unwrap().i64_at(0), Some(23));
    }

    #[test]
    fn uncoercible_values_fail_with_location() {
        let err = parse_delimited("unitid,locale\n1,city\n", &hd_hints(), ".").unwrap_err();
        match err {
            FetchError::InvalidValue {
                line,
                column,
                value,
                expected,
            } => {
                assert_eq!(line, 2);
                assert_eq!(column, "locale");
                assert_eq!(value, "city");
                assert_eq!(expected, "integer");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn archive_entry_is_decoded_from_latin1() {
        // 0xE9 is "é" in ISO-8859-1.
        let body = b"UNITID,INSTNM\n100001,Universit\xe9 Test\n";
        let bytes = zip_with(&[("hd2015.csv", body), ("hd2015_rv.csv", body)]);
        let (entry, table) = parse_archive(&bytes, &hd_hints(), ".").expect("parse archive");

        assert_eq!(entry, "hd2015_rv.csv");
        assert_eq!(
            table.column("instnm").unwrap().text_at(0).as_deref(),
            Some("Université Test")
        );
    }

    #[test]
    fn garbage_bytes_are_an_archive_error() {
        let err = parse_archive(b"not a zip", &hd_hints(), ".").unwrap_err();
        assert!(matches!(err, FetchError::Archive(_)));
    }
}
