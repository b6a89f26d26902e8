/// Record filtering for the command line.
///
/// A record passes the filter if every constraint that is present accepts it: its endpoint matches
/// one of the endpoint patterns, its user is among the included users and not among the excluded
/// ones, its method is among the methods, and its timestamp is within [from, to).  Filtered-out
/// records are valid records that we were asked to ignore; they are not counted as rejected.
use accesslog::{EndpointGlobber, LogRecord};
use anyhow::{bail, Result};
use logutils::{now, timestamp_from_ymdhms, Timestamp};
use std::collections::HashSet;
use std::str::FromStr;
use ustr::Ustr;

pub struct RecordFilter {
    endpoints: EndpointGlobber,
    users: HashSet<Ustr>,
    exclude_users: HashSet<Ustr>,
    methods: HashSet<Ustr>,
    from: Option<Timestamp>,
    to: Option<Timestamp>,
}

impl RecordFilter {
    pub fn new(
        endpoint_patterns: &[String],
        users: &[String],
        exclude_users: &[String],
        methods: &[String],
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Result<RecordFilter> {
        let mut endpoints = EndpointGlobber::new(true);
        for p in endpoint_patterns {
            endpoints.insert(p)?;
        }
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                bail!("The --from time is greater than the --to time")
            }
        }
        Ok(RecordFilter {
            endpoints,
            users: users.iter().map(|u| Ustr::from(u.as_str())).collect(),
            exclude_users: exclude_users.iter().map(|u| Ustr::from(u.as_str())).collect(),
            methods: methods
                .iter()
                .map(|m| Ustr::from(m.to_uppercase().as_str()))
                .collect(),
            from,
            to,
        })
    }

    pub fn accepts(&self, r: &LogRecord) -> bool {
        (self.endpoints.is_empty() || self.endpoints.match_endpoint(&r.endpoint))
            && (self.users.is_empty() || self.users.contains(&r.user_id))
            && !self.exclude_users.contains(&r.user_id)
            && (self.methods.is_empty() || self.methods.contains(&r.method))
            && self.from.map_or(true, |from| from <= r.timestamp)
            && self.to.map_or(true, |to| r.timestamp < to)
    }
}

/// Parse the argument to --from or --to.  It is either YYYY-MM-DD, meaning midnight UTC at the
/// start of that day (the end of that day if `end_of_day` is true), or Nd or Nw, meaning N days or
/// weeks before now.

pub fn parse_time(s: &str, end_of_day: bool) -> Result<Timestamp> {
    if let Some(days) = s.strip_suffix('d') {
        if let Ok(n) = i64::from_str(days) {
            return Ok(now() - chrono::Duration::days(n));
        }
    }
    if let Some(weeks) = s.strip_suffix('w') {
        if let Ok(n) = i64::from_str(weeks) {
            return Ok(now() - chrono::Duration::weeks(n));
        }
    }
    let parts = s
        .split('-')
        .map(i32::from_str)
        .collect::<Vec<std::result::Result<i32, std::num::ParseIntError>>>();
    if parts.len() != 3 || parts.iter().any(|p| p.is_err()) {
        bail!("Invalid date syntax: {s}")
    }
    let vals = parts
        .into_iter()
        .flatten()
        .collect::<Vec<i32>>();
    let Some(t) = timestamp_from_ymdhms(vals[0], vals[1] as u32, vals[2] as u32, 0, 0, 0) else {
        bail!("Invalid date: {s}")
    };
    if end_of_day {
        Ok(t + chrono::Duration::days(1))
    } else {
        Ok(t)
    }
}

#[cfg(test)]
fn mkrec(t: &str, endpoint: &str, method: &str, user: &str) -> LogRecord {
    LogRecord {
        timestamp: logutils::parse_timestamp(t).unwrap(),
        endpoint: Ustr::from(endpoint),
        method: Ustr::from(method),
        status: 200,
        response_time_ms: 1.0,
        response_size_bytes: 1.0,
        user_id: Ustr::from(user),
    }
}

#[test]
fn test_filter() {
    let f = RecordFilter::new(&[], &[], &[], &[], None, None).unwrap();
    assert!(f.accepts(&mkrec("2025-01-15T10:00:00Z", "/a", "GET", "u")));

    let f = RecordFilter::new(
        &["/api/users".to_string()],
        &[],
        &["bot".to_string()],
        &["get".to_string()],
        Some(parse_time("2025-01-15", false).unwrap()),
        Some(parse_time("2025-01-15", true).unwrap()),
    )
    .unwrap();
    assert!(f.accepts(&mkrec("2025-01-15T10:00:00Z", "/api/users/17", "GET", "u")));
    assert!(!f.accepts(&mkrec("2025-01-15T10:00:00Z", "/api/orders", "GET", "u")));
    assert!(!f.accepts(&mkrec("2025-01-15T10:00:00Z", "/api/users", "POST", "u")));
    assert!(!f.accepts(&mkrec("2025-01-15T10:00:00Z", "/api/users", "GET", "bot")));
    assert!(!f.accepts(&mkrec("2025-01-16T00:00:00Z", "/api/users", "GET", "u")));
    assert!(f.accepts(&mkrec("2025-01-15T23:59:59Z", "/api/users", "GET", "u")));

    let f = RecordFilter::new(&[], &["alice".to_string()], &[], &[], None, None).unwrap();
    assert!(f.accepts(&mkrec("2025-01-15T10:00:00Z", "/a", "GET", "alice")));
    assert!(!f.accepts(&mkrec("2025-01-15T10:00:00Z", "/a", "GET", "bob")));
}

#[test]
fn test_parse_time() {
    let t = parse_time("2025-01-15", false).unwrap();
    assert!(logutils::format_timestamp(t) == "2025-01-15T00:00:00Z");
    let t = parse_time("2025-01-15", true).unwrap();
    assert!(logutils::format_timestamp(t) == "2025-01-16T00:00:00Z");
    let t = parse_time("3d", false).unwrap();
    assert!(now() - t >= chrono::Duration::days(3));
    assert!(parse_time("2025-13-01", false).is_err());
    assert!(parse_time("yesterday", false).is_err());
    assert!(parse_time("2025-01", false).is_err());
}
