/// Readers for access-log files.
///
/// Three input formats are understood:
///
/// - a JSON array of record objects (what most tools dump);
///
/// - JSON Lines, one record object per line;
///
/// - CSV with a header row naming the fields.  Every value arrives as a string and is coerced by
///   the normalizer; an empty cell counts as a missing field.
///
/// NOTE:
///
/// - It's an important feature of this program that a corrupted record is dropped silently (it is
///   counted, and the count is reported).  A half-written last line in a JSON Lines file, or a CSV
///   row with a bad encoding, does not prevent the rest of the file from being analyzed.
///
/// - An I/O error, or a JSON-array file that is not valid JSON as a whole, is an error for the
///   entire file, since we have no way of knowing which records were lost.
use crate::{LogRecord, RecordNormalizer, RejectReason};

use anyhow::{bail, Result};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputFormat {
    /// Decide from the file name, or failing that from the first character of the input.
    Auto,
    Json,
    JsonLines,
    Csv,
}

impl std::str::FromStr for InputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<InputFormat> {
        match s {
            "auto" => Ok(InputFormat::Auto),
            "json" => Ok(InputFormat::Json),
            "jsonl" | "ndjson" => Ok(InputFormat::JsonLines),
            "csv" => Ok(InputFormat::Csv),
            _ => bail!("Unknown input format '{s}', expected auto, json, jsonl or csv"),
        }
    }
}

fn format_from_name(file_name: &str) -> InputFormat {
    match Path::new(file_name).extension().and_then(|e| e.to_str()) {
        Some("jsonl") | Some("ndjson") => InputFormat::JsonLines,
        Some("csv") => InputFormat::Csv,
        _ => InputFormat::Auto,
    }
}

/// Parse a log file and pass every valid record to `sink` in the order encountered.  The file name
/// "-" means stdin.  Bad records are counted by `normalizer` and otherwise skipped.  Return an
/// error in the case of I/O errors or a structurally broken file.

pub fn parse_logfile<F>(
    file_name: &str,
    format: InputFormat,
    normalizer: &mut RecordNormalizer,
    sink: &mut F,
) -> Result<()>
where
    F: FnMut(LogRecord),
{
    let format = if format == InputFormat::Auto {
        format_from_name(file_name)
    } else {
        format
    };
    tracing::debug!("Reading {file_name} as {:?}", format);
    if file_name == "-" {
        parse_records(io::stdin().lock(), format, normalizer, sink)
    } else {
        let file = File::open(file_name)?;
        parse_records(BufReader::new(file), format, normalizer, sink)
    }
}

/// Like parse_logfile, but for any buffered reader.

pub fn parse_records<R, F>(
    mut reader: R,
    format: InputFormat,
    normalizer: &mut RecordNormalizer,
    sink: &mut F,
) -> Result<()>
where
    R: BufRead,
    F: FnMut(LogRecord),
{
    let format = if format == InputFormat::Auto {
        sniff_format(&mut reader)?
    } else {
        format
    };
    match format {
        InputFormat::Json => parse_json_array(reader, normalizer, sink),
        InputFormat::JsonLines => parse_json_lines(reader, normalizer, sink),
        InputFormat::Csv => parse_csv(reader, normalizer, sink),
        InputFormat::Auto => bail!("Could not determine the input format"),
    }
}

// An array is JSON, an object is the first record of JSON Lines.  Anything else is probably CSV
// (the header row).  Empty input is an empty array.
fn sniff_format<R: BufRead>(reader: &mut R) -> Result<InputFormat> {
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(InputFormat::Json);
        }
        let skip = buf.iter().take_while(|c| c.is_ascii_whitespace()).count();
        if skip < buf.len() {
            return Ok(match buf[skip] {
                b'[' => InputFormat::Json,
                b'{' => InputFormat::JsonLines,
                _ => InputFormat::Csv,
            });
        }
        reader.consume(skip);
    }
}

fn parse_json_array<R, F>(mut reader: R, normalizer: &mut RecordNormalizer, sink: &mut F) -> Result<()>
where
    R: Read,
    F: FnMut(LogRecord),
{
    let mut text = String::new();
    reader.read_to_string(&mut text)?;
    if text.trim().is_empty() {
        return Ok(());
    }
    let v: Value = serde_json::from_str(&text)?;
    let Value::Array(objs) = v else {
        bail!("Expected an array of records")
    };
    for obj in &objs {
        if let Some(r) = normalizer.normalize(obj) {
            sink(r);
        }
    }
    Ok(())
}

// Lines are read as bytes so that a line with a bad encoding is one malformed record, not a failed
// file.
fn parse_json_lines<R, F>(mut reader: R, normalizer: &mut RecordNormalizer, sink: &mut F) -> Result<()>
where
    R: BufRead,
    F: FnMut(LogRecord),
{
    let mut line = vec![];
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        if line.iter().all(|c| c.is_ascii_whitespace()) {
            continue;
        }
        match serde_json::from_slice::<Value>(&line) {
            Ok(v) => {
                if let Some(r) = normalizer.normalize(&v) {
                    sink(r);
                }
            }
            Err(_) => normalizer.reject(RejectReason::Malformed),
        }
    }
    Ok(())
}

fn parse_csv<R, F>(reader: R, normalizer: &mut RecordNormalizer, sink: &mut F) -> Result<()>
where
    R: Read,
    F: FnMut(LogRecord),
{
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = csv_reader.headers()?.clone();
    for row in csv_reader.records() {
        match row {
            Ok(row) => {
                let mut fields = Map::new();
                for (name, val) in headers.iter().zip(row.iter()) {
                    if !val.is_empty() {
                        fields.insert(name.to_string(), Value::String(val.to_string()));
                    }
                }
                if let Some(r) = normalizer.normalize(&Value::Object(fields)) {
                    sink(r);
                }
            }
            Err(e) => {
                if e.is_io_error() {
                    return Err(e.into());
                }
                normalizer.reject(RejectReason::Malformed);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
fn read_all(text: &str, format: InputFormat) -> Result<(Vec<LogRecord>, usize)> {
    let mut normalizer = RecordNormalizer::new();
    let mut records = vec![];
    parse_records(
        text.as_bytes(),
        format,
        &mut normalizer,
        &mut |r| records.push(r),
    )?;
    Ok((records, normalizer.rejected()))
}

#[test]
fn test_json_array() {
    let text = r#"[
      {"timestamp": "2025-01-15T10:00:00Z", "endpoint": "/api/users", "method": "GET",
       "response_time_ms": 150, "status_code": 200, "user_id": "u1", "response_size_bytes": 100},
      {"timestamp": "bad-ts", "endpoint": "/api/users", "method": "GET",
       "response_time_ms": 150, "status_code": 200, "user_id": "u1", "response_size_bytes": 100},
      17
    ]"#;
    let (records, rejected) = read_all(text, InputFormat::Auto).unwrap();
    assert!(records.len() == 1);
    assert!(rejected == 2);

    let (records, rejected) = read_all("  ", InputFormat::Auto).unwrap();
    assert!(records.is_empty() && rejected == 0);

    assert!(read_all(r#"[{"timestamp": "#, InputFormat::Json).is_err());
    assert!(read_all(r#"{"a": 1}"#, InputFormat::Json).is_err());
}

#[test]
fn test_json_lines() {
    let text = r#"
{"timestamp": "2025-01-15T10:00:00Z", "endpoint": "/a", "method": "GET", "response_time_ms": 1, "status_code": 200, "user_id": "u1", "response_size_bytes": 1}

{"timestamp": "2025-01-15T10:00:01Z", "endpoint": "/a", "method": "GET", "response_time_ms": 1, "status_code": 500, "user_id": "u1", "response_size_bytes": 1}
{"timestamp": "2025-01-15T10:00:02Z", "endpoint": "/a", "meth
"#;
    let (records, rejected) = read_all(text, InputFormat::Auto).unwrap();
    assert!(records.len() == 2);
    assert!(records[1].status == 500);
    assert!(rejected == 1);
}

#[test]
fn test_json_lines_bad_encoding() {
    let mut text = br#"{"timestamp": "2025-01-15T10:00:00Z", "endpoint": "/a", "method": "GET", "response_time_ms": 1, "status_code": 200, "user_id": "u1", "response_size_bytes": 1}
{"endpoint": ""#
        .to_vec();
    text.extend_from_slice(b"\xff\xfe\"}\n");
    text.extend_from_slice(br#"{"timestamp": "2025-01-15T10:00:02Z", "endpoint": "/b", "method": "GET", "response_time_ms": 1, "status_code": 200, "user_id": "u1", "response_size_bytes": 1}"#);

    let mut normalizer = RecordNormalizer::new();
    let mut records = vec![];
    parse_records(
        text.as_slice(),
        InputFormat::JsonLines,
        &mut normalizer,
        &mut |r| records.push(r),
    )
    .unwrap();
    assert!(records.len() == 2);
    assert!(records[1].endpoint.as_str() == "/b");
    assert!(normalizer.rejected() == 1);
}

#[test]
fn test_csv() {
    let text = "timestamp,endpoint,method,status_code,response_time_ms,response_size_bytes,user_id
2025-01-15T10:00:00Z,/api/users,get,200,120,512,u1
2025-01-15T10:00:05Z,/api/users,GET,200,-5,512,u1
2025-01-15T10:00:09Z,/api/users,GET,,120,512,u1
2025-01-15T10:01:00Z,/api/search,POST,503,480.5,2048,u2
";
    let (records, rejected) = read_all(text, InputFormat::Auto).unwrap();
    assert!(records.len() == 2);
    assert!(rejected == 2);
    assert!(records[0].method.as_str() == "GET");
    assert!(records[1].endpoint.as_str() == "/api/search");
    assert!(records[1].response_time_ms == 480.5);
}

#[test]
fn test_parse_logfile() {
    use std::io::Write;

    let mut f = tempfile::Builder::new().suffix(".jsonl").tempfile().unwrap();
    f.write_all(
        br#"{"timestamp": "2025-01-15T10:00:00Z", "endpoint": "/a", "method": "GET", "response_time_ms": 1, "status_code": 200, "user_id": "u1", "response_size_bytes": 1}
{"timestamp": "2025-01-15T10:00:01Z", "endpoint": "/b", "method": "GET", "response_time_ms": 1, "status_code": 200, "user_id": "u1", "response_size_bytes": 1}
"#,
    )
    .unwrap();
    let mut normalizer = RecordNormalizer::new();
    let mut n = 0;
    parse_logfile(
        f.path().to_str().unwrap(),
        InputFormat::Auto,
        &mut normalizer,
        &mut |_| n += 1,
    )
    .unwrap();
    assert!(n == 2);
    assert!(normalizer.accepted() == 2);

    assert!(parse_logfile(
        "/nonexistent/access.json",
        InputFormat::Auto,
        &mut normalizer,
        &mut |_| {}
    )
    .is_err());
}
