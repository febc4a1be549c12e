//! Delimited text tracks (`;` or `,`) and table output

use std::io::Write;

use csv::{ReaderBuilder, StringRecord, WriterBuilder};

use crate::core::model::{Route, TrackPoint, Value};
use crate::core::table::Table;
use crate::formats::parse_timestamp;
use crate::{Error, Result};

/// Accepted latitude/longitude header pairs, by priority
const POSITION_COLUMNS: [(&str, &str); 5] = [
    ("latitude", "longitude"),
    ("nav_latitude", "nav_longitude"),
    ("original_latitude", "original_longitude"),
    ("lat", "lon"),
    ("lat", "lng"),
];

/// Row counters written by dataframe exports
const INDEX_COLUMNS: [&str; 2] = ["", "index"];

const OUTPUT_DELIMITER: u8 = b';';

fn detect_delimiter(content: &str) -> u8 {
    let header = content.lines().next().unwrap_or_default();
    if header.matches(';').count() > header.matches(',').count() {
        b';'
    } else {
        b','
    }
}

fn cell<'a>(record: &'a StringRecord, index: usize) -> &'a str {
    record.get(index).map(str::trim).unwrap_or_default()
}

fn parse_number(raw: &str, column: &str, row: usize) -> Result<f64> {
    raw.parse()
        .map_err(|_| Error::Parse(format!("row {row}: '{raw}' in column '{column}' is not a number")))
}

pub fn parse(content: &str, id: &str) -> Result<Route> {
    let mut reader = ReaderBuilder::new()
        .delimiter(detect_delimiter(content))
        .flexible(false)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| Error::Parse(format!("invalid CSV header: {e}")))?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();
    let find = |name: &str| headers.iter().position(|h| h == name);

    let (lat, lon) = POSITION_COLUMNS
        .iter()
        .find_map(|(lat, lon)| Some((find(lat)?, find(lon)?)))
        .ok_or_else(|| Error::Parse(format!("no latitude/longitude columns among: {}", headers.join(", "))))?;
    let timestamp = find("timestamp").or_else(|| find("time"));
    let elevation = find("elevation").or_else(|| find("altitude"));
    let speed = find("speed");

    let records = reader
        .records()
        .collect::<std::result::Result<Vec<StringRecord>, _>>()
        .map_err(|e| Error::Parse(format!("invalid CSV row: {e}")))?;

    let used = [Some(lat), Some(lon), timestamp, elevation, speed];
    let extra: Vec<(usize, &String, bool)> = headers
        .iter()
        .enumerate()
        .filter(|(i, name)| !used.contains(&Some(*i)) && !INDEX_COLUMNS.contains(&name.as_str()))
        .map(|(i, name)| {
            let numeric = records.iter().all(|r| {
                let raw = cell(r, i);
                raw.is_empty() || raw.parse::<f64>().is_ok()
            });
            (i, name, numeric)
        })
        .collect();

    let mut points = Vec::with_capacity(records.len());
    for (row, record) in records.iter().enumerate() {
        let mut point = TrackPoint::new(
            parse_number(cell(record, lat), &headers[lat], row)?,
            parse_number(cell(record, lon), &headers[lon], row)?,
        );
        if let Some(i) = timestamp.filter(|&i| !cell(record, i).is_empty()) {
            point.timestamp = Some(parse_timestamp(cell(record, i))?);
        }
        if let Some(i) = elevation.filter(|&i| !cell(record, i).is_empty()) {
            point.elevation = Some(parse_number(cell(record, i), &headers[i], row)?);
        }
        if let Some(i) = speed.filter(|&i| !cell(record, i).is_empty()) {
            point.speed = Some(parse_number(cell(record, i), &headers[i], row)?);
        }
        for &(i, name, numeric) in &extra {
            let raw = cell(record, i);
            let value = match (raw.is_empty(), numeric) {
                (true, _) => Value::Null,
                (false, true) => Value::Number(parse_number(raw, name, row)?),
                (false, false) => Value::Text(raw.to_string()),
            };
            point.attributes.insert(name.clone(), value);
        }
        points.push(point);
    }

    Route::new(id, points)
}

/// Write a table as `;`-separated CSV with a header row
///
/// Nulls become empty cells, tag maps are written as `key=value|key=value`.
pub fn write_table<W: Write>(table: &Table, writer: W) -> Result<()> {
    let mut out = WriterBuilder::new().delimiter(OUTPUT_DELIMITER).from_writer(writer);
    let to_io = |e: csv::Error| Error::Io(e.into());

    out.write_record(table.column_names()).map_err(to_io)?;
    for row in table.rows() {
        out.write_record(row.iter().map(|v| v.to_string())).map_err(to_io)?;
    }
    out.flush()?;
    Ok(())
}
