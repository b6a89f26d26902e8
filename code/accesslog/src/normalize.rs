/// Validation and coercion of raw records into LogRecords.
///
/// A raw record is a JSON object (records read from CSV are turned into objects with string values
/// first).  It's an important feature of this program that an unusable record is dropped silently,
/// never stopping the run: the reason is tallied, the tallies are logged at debug level, and the
/// count of rejected records ends up in the report's summary.
///
/// Required fields are `timestamp`, `endpoint`, `method`, `status_code` (`status` is accepted as an
/// alias), `response_time_ms`, `response_size_bytes` and `user_id`.  Other fields are ignored.
use crate::LogRecord;

use logutils::parse_timestamp;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;
use ustr::Ustr;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    #[error("record is not an object")]
    NotAnObject,

    #[error("malformed input")]
    Malformed,

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("empty field '{0}'")]
    EmptyField(&'static str),

    #[error("field '{0}' has the wrong type")]
    WrongType(&'static str),

    #[error("unparseable timestamp")]
    BadTimestamp,

    #[error("field '{0}' is not a finite number")]
    NotANumber(&'static str),

    #[error("field '{0}' is negative")]
    Negative(&'static str),

    #[error("status is not an integer in 0..=999")]
    BadStatus,
}

const STATUS_NAMES: [&str; 2] = ["status_code", "status"];

/// Turn one raw record into a LogRecord, or say why that's not possible.

pub fn normalize_record(raw: &Value) -> Result<LogRecord, RejectReason> {
    let Value::Object(fields) = raw else {
        return Err(RejectReason::NotAnObject);
    };

    // Check for presence first so that the reason reported for a record with several problems is
    // predictable.
    for name in [
        "timestamp",
        "endpoint",
        "method",
        "response_time_ms",
        "response_size_bytes",
        "user_id",
    ] {
        if !fields.contains_key(name) {
            return Err(RejectReason::MissingField(name));
        }
    }
    let status = STATUS_NAMES
        .iter()
        .find_map(|name| fields.get(*name))
        .ok_or(RejectReason::MissingField("status_code"))?;

    let timestamp = match &fields["timestamp"] {
        Value::String(s) => parse_timestamp(s).map_err(|_| RejectReason::BadTimestamp)?,
        _ => return Err(RejectReason::BadTimestamp),
    };
    let endpoint = get_str(fields, "endpoint")?;
    let method = Ustr::from(get_str(fields, "method")?.to_uppercase().as_str());
    let status = get_status(status)?;
    let response_time_ms = get_number(fields, "response_time_ms")?;
    let response_size_bytes = get_number(fields, "response_size_bytes")?;
    let user_id = get_str(fields, "user_id")?;

    Ok(LogRecord {
        timestamp,
        endpoint,
        method,
        status,
        response_time_ms,
        response_size_bytes,
        user_id,
    })
}

fn get_str(fields: &Map<String, Value>, name: &'static str) -> Result<Ustr, RejectReason> {
    match &fields[name] {
        Value::String(s) if s.is_empty() => Err(RejectReason::EmptyField(name)),
        Value::String(s) => Ok(Ustr::from(s.as_str())),
        Value::Number(n) => Ok(Ustr::from(n.to_string().as_str())),
        _ => Err(RejectReason::WrongType(name)),
    }
}

fn get_number(fields: &Map<String, Value>, name: &'static str) -> Result<f64, RejectReason> {
    let n = match &fields[name] {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => f64::from_str(s.trim()).ok(),
        _ => None,
    };
    match n {
        Some(x) if !x.is_finite() => Err(RejectReason::NotANumber(name)),
        Some(x) if x < 0.0 => Err(RejectReason::Negative(name)),
        Some(x) => Ok(x),
        None => Err(RejectReason::NotANumber(name)),
    }
}

fn get_status(v: &Value) -> Result<u16, RejectReason> {
    let n = match v {
        Value::Number(n) => {
            if let Some(k) = n.as_u64() {
                Some(k)
            } else {
                // 200.0 is fine, 200.5 is not.
                n.as_f64()
                    .filter(|x| *x >= 0.0 && x.fract() == 0.0)
                    .map(|x| x as u64)
            }
        }
        Value::String(s) => u64::from_str(s.trim()).ok(),
        _ => None,
    };
    match n {
        Some(k) if k <= 999 => Ok(k as u16),
        _ => Err(RejectReason::BadStatus),
    }
}

/// A RecordNormalizer applies normalize_record and keeps count of what was accepted and rejected,
/// and why.

#[derive(Default)]
pub struct RecordNormalizer {
    accepted: usize,
    rejected: usize,
    reasons: HashMap<RejectReason, usize>,
}

impl RecordNormalizer {
    pub fn new() -> RecordNormalizer {
        Default::default()
    }

    pub fn normalize(&mut self, raw: &Value) -> Option<LogRecord> {
        match normalize_record(raw) {
            Ok(r) => {
                self.accepted += 1;
                Some(r)
            }
            Err(reason) => {
                self.reject(reason);
                None
            }
        }
    }

    /// Count a record that was unusable before it could even be presented as a raw record.

    pub fn reject(&mut self, reason: RejectReason) {
        self.rejected += 1;
        *self.reasons.entry(reason).or_insert(0) += 1;
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// The rejection tallies, most frequent first.

    pub fn reasons(&self) -> Vec<(RejectReason, usize)> {
        let mut v = self
            .reasons
            .iter()
            .map(|(r, n)| (*r, *n))
            .collect::<Vec<(RejectReason, usize)>>();
        v.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.to_string().cmp(&b.0.to_string())));
        v
    }

    pub fn log_tallies(&self) {
        tracing::debug!(
            "Records accepted: {}, rejected: {}",
            self.accepted,
            self.rejected
        );
        for (reason, n) in self.reasons() {
            tracing::debug!("  rejected {n}: {reason}");
        }
    }
}

#[cfg(test)]
fn good_record() -> Value {
    serde_json::json!({
        "timestamp": "2025-01-15T10:00:00Z",
        "endpoint": "/api/users",
        "method": "get",
        "response_time_ms": 150,
        "status_code": 200,
        "user_id": "user_1",
        "request_size_bytes": 512,
        "response_size_bytes": 2048,
    })
}

#[test]
fn test_normalize_good() {
    let r = normalize_record(&good_record()).unwrap();
    assert!(r.endpoint.as_str() == "/api/users");
    assert!(r.method.as_str() == "GET");
    assert!(r.status == 200);
    assert!(r.response_time_ms == 150.0);
    assert!(r.response_size_bytes == 2048.0);
    assert!(r.user_id.as_str() == "user_1");
    assert!(logutils::format_timestamp(r.timestamp) == "2025-01-15T10:00:00Z");
}

#[test]
fn test_normalize_coercions() {
    let mut v = good_record();
    v["timestamp"] = "2025-01-15T12:00:00+02:00".into();
    v["response_time_ms"] = "99.5".into();
    v["status_code"] = "404".into();
    v["user_id"] = 17.into();
    let r = normalize_record(&v).unwrap();
    assert!(logutils::format_timestamp(r.timestamp) == "2025-01-15T10:00:00Z");
    assert!(r.response_time_ms == 99.5);
    assert!(r.status == 404);
    assert!(r.is_error());
    assert!(r.user_id.as_str() == "17");

    // `status` is accepted in place of `status_code`.
    let mut v = good_record();
    let fields = v.as_object_mut().unwrap();
    fields.remove("status_code");
    fields.insert("status".to_string(), 500.0.into());
    assert!(normalize_record(&v).unwrap().status == 500);
}

#[test]
fn test_normalize_rejects() {
    let mut v = good_record();
    v.as_object_mut().unwrap().remove("status_code");
    assert!(normalize_record(&v) == Err(RejectReason::MissingField("status_code")));

    let mut v = good_record();
    v.as_object_mut().unwrap().remove("endpoint");
    assert!(normalize_record(&v) == Err(RejectReason::MissingField("endpoint")));

    let mut v = good_record();
    v["timestamp"] = "bad-ts".into();
    assert!(normalize_record(&v) == Err(RejectReason::BadTimestamp));

    let mut v = good_record();
    v["timestamp"] = 1736935200.into();
    assert!(normalize_record(&v) == Err(RejectReason::BadTimestamp));

    let mut v = good_record();
    v["response_time_ms"] = (-10).into();
    assert!(normalize_record(&v) == Err(RejectReason::Negative("response_time_ms")));

    let mut v = good_record();
    v["response_size_bytes"] = "lots".into();
    assert!(normalize_record(&v) == Err(RejectReason::NotANumber("response_size_bytes")));

    let mut v = good_record();
    v["response_size_bytes"] = Value::Null;
    assert!(normalize_record(&v) == Err(RejectReason::NotANumber("response_size_bytes")));

    let mut v = good_record();
    v["status_code"] = 200.5.into();
    assert!(normalize_record(&v) == Err(RejectReason::BadStatus));

    let mut v = good_record();
    v["status_code"] = 1200.into();
    assert!(normalize_record(&v) == Err(RejectReason::BadStatus));

    let mut v = good_record();
    v["endpoint"] = "".into();
    assert!(normalize_record(&v) == Err(RejectReason::EmptyField("endpoint")));

    let mut v = good_record();
    v["user_id"] = Value::Bool(true);
    assert!(normalize_record(&v) == Err(RejectReason::WrongType("user_id")));

    assert!(normalize_record(&Value::Null) == Err(RejectReason::NotAnObject));
}

#[test]
fn test_normalizer_counts() {
    let mut n = RecordNormalizer::new();
    let mut bad = good_record();
    bad["response_time_ms"] = (-1).into();
    assert!(n.normalize(&good_record()).is_some());
    assert!(n.normalize(&bad).is_none());
    assert!(n.normalize(&bad).is_none());
    n.reject(RejectReason::Malformed);
    assert!(n.accepted() == 1);
    assert!(n.rejected() == 3);
    let reasons = n.reasons();
    assert!(reasons[0] == (RejectReason::Negative("response_time_ms"), 2));
    assert!(reasons[1] == (RejectReason::Malformed, 1));
}
