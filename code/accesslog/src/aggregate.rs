/// One-pass aggregation of access-log records.
///
/// The RunningAggregator consumes LogRecords one at a time and keeps, per endpoint, the counters
/// and the ordered sequences that the later analyses need; globally it keeps an hourly histogram
/// and a per-user request count.  Ingestion is O(1) amortized per record.
///
/// The aggregator is the only owner and mutator of the aggregate state.  `finish` consumes it,
/// performs the post-pass (sorting any per-endpoint sequence that arrived out of order), and
/// returns an immutable Aggregates value; every report view is a pure projection of that.  Hence
/// nothing can observe half-ingested state, and the analyses that read Aggregates can share it
/// freely.
///
/// For inputs that are too large for one process, partitions can be aggregated separately and
/// combined with `merge`, which adds counters and concatenates sequences.  The re-sort in `finish`
/// is what makes the merged sequences usable by the window analyses again.
use crate::LogRecord;

use itertools::Itertools;
use logutils::{hour_of_day, serialize_opt_timestamp, Timestamp};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use ustr::Ustr;

/// Per-request data retained for the time-ordered analyses and for post-hoc costing.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub response_time_ms: f64,
    pub response_size_bytes: f64,
}

/// Everything we know about one endpoint.  Created on the endpoint's first record and never
/// deleted.

#[derive(Debug, Clone)]
pub struct EndpointAggregate {
    pub endpoint: Ustr,
    pub count: usize,
    pub time_sum: f64,
    pub time_min: f64,
    pub time_max: f64,

    /// Requests with status >= 400.
    pub error_count: usize,

    pub status_histogram: BTreeMap<u16, usize>,

    /// One sample per request.  After `finish` this is in non-decreasing timestamp order, with
    /// records that have equal timestamps in arrival order.
    pub samples: Vec<Sample>,

    /// The timestamps of the error requests, ordered like `samples`.
    pub error_timestamps: Vec<Timestamp>,

    pub user_counts: HashMap<Ustr, usize>,

    // False once a record arrived with a timestamp earlier than its predecessor's.
    in_order: bool,
}

impl EndpointAggregate {
    fn new(endpoint: Ustr) -> EndpointAggregate {
        EndpointAggregate {
            endpoint,
            count: 0,
            time_sum: 0.0,
            time_min: f64::INFINITY,
            time_max: f64::NEG_INFINITY,
            error_count: 0,
            status_histogram: BTreeMap::new(),
            samples: vec![],
            error_timestamps: vec![],
            user_counts: HashMap::new(),
            in_order: true,
        }
    }

    fn add(&mut self, r: &LogRecord) {
        if let Some(last) = self.samples.last() {
            if r.timestamp < last.timestamp {
                self.in_order = false;
            }
        }
        self.count += 1;
        self.time_sum += r.response_time_ms;
        self.time_min = f64::min(self.time_min, r.response_time_ms);
        self.time_max = f64::max(self.time_max, r.response_time_ms);
        *self.status_histogram.entry(r.status).or_insert(0) += 1;
        if r.is_error() {
            self.error_count += 1;
            self.error_timestamps.push(r.timestamp);
        }
        self.samples.push(Sample {
            timestamp: r.timestamp,
            response_time_ms: r.response_time_ms,
            response_size_bytes: r.response_size_bytes,
        });
        *self.user_counts.entry(r.user_id).or_insert(0) += 1;
    }

    fn absorb(&mut self, other: EndpointAggregate) {
        self.count += other.count;
        self.time_sum += other.time_sum;
        self.time_min = f64::min(self.time_min, other.time_min);
        self.time_max = f64::max(self.time_max, other.time_max);
        self.error_count += other.error_count;
        for (status, n) in other.status_histogram {
            *self.status_histogram.entry(status).or_insert(0) += n;
        }
        self.samples.extend(other.samples);
        self.error_timestamps.extend(other.error_timestamps);
        for (user, n) in other.user_counts {
            *self.user_counts.entry(user).or_insert(0) += n;
        }
        self.in_order = false;
    }

    fn sort_sequences(&mut self) {
        if !self.in_order {
            // Stable, so equal timestamps keep their arrival order.
            self.samples.sort_by_key(|s| s.timestamp);
            self.error_timestamps.sort();
            self.in_order = true;
        }
    }

    pub fn avg_response_time_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.time_sum / self.count as f64
        }
    }

    /// The most frequent status; the lowest status code wins a tie.

    pub fn most_common_status(&self) -> Option<u16> {
        // BTreeMap iterates in ascending status order, and max_by_key returns the last maximum,
        // so iterate in reverse to have the lowest status win.
        self.status_histogram
            .iter()
            .rev()
            .max_by_key(|(_, n)| **n)
            .map(|(s, _)| *s)
    }

    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.samples.first().map(|s| s.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.samples.last().map(|s| s.timestamp)
    }
}

#[derive(Debug, Clone, Copy)]
struct UserTally {
    count: usize,
    // Sequence number of the user's first record, for tie-breaking.
    first_seen: usize,
}

/// The mutable, single-pass aggregation state.  Scoped to one analysis run.

#[derive(Debug, Default)]
pub struct RunningAggregator {
    endpoints: HashMap<Ustr, EndpointAggregate>,
    hourly: [usize; 24],
    users: HashMap<Ustr, UserTally>,
    accepted: usize,
    rejected: usize,
}

impl RunningAggregator {
    pub fn new() -> RunningAggregator {
        Default::default()
    }

    pub fn ingest(&mut self, r: &LogRecord) {
        let seq = self.accepted;
        self.accepted += 1;
        self.endpoints
            .entry(r.endpoint)
            .or_insert_with(|| EndpointAggregate::new(r.endpoint))
            .add(r);
        self.hourly[hour_of_day(r.timestamp)] += 1;
        self.users
            .entry(r.user_id)
            .or_insert(UserTally {
                count: 0,
                first_seen: seq,
            })
            .count += 1;
    }

    /// Record that `n` more records were rejected before they got here, for the summary.

    pub fn add_rejected(&mut self, n: usize) {
        self.rejected += n;
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }

    /// Fold a partition's aggregator into this one.  Users first seen in `other` rank after all
    /// users of `self` when counts tie, as if `other`'s records had been ingested after ours.

    pub fn merge(&mut self, mut other: RunningAggregator) {
        let offset = self.accepted;
        for (endpoint, agg) in other.endpoints.drain() {
            if let Some(mine) = self.endpoints.get_mut(&endpoint) {
                mine.absorb(agg);
            } else {
                self.endpoints.insert(endpoint, agg);
            }
        }
        for h in 0..24 {
            self.hourly[h] += other.hourly[h];
        }
        for (user, tally) in other.users.drain() {
            let mine = self.users.entry(user).or_insert(UserTally {
                count: 0,
                first_seen: offset + tally.first_seen,
            });
            mine.count += tally.count;
        }
        self.accepted += other.accepted;
        self.rejected += other.rejected;
    }

    /// End the pass.  Sequences are sorted by time, endpoints are ordered by key.

    pub fn finish(self) -> Aggregates {
        let endpoints = self
            .endpoints
            .into_values()
            .map(|mut agg| {
                agg.sort_sequences();
                agg
            })
            .sorted_by(|a, b| a.endpoint.as_str().cmp(b.endpoint.as_str()))
            .collect::<Vec<EndpointAggregate>>();
        tracing::debug!(
            "Aggregated {} records over {} endpoints and {} users",
            self.accepted,
            endpoints.len(),
            self.users.len()
        );
        Aggregates {
            endpoints,
            hourly: self.hourly,
            users: self.users,
            accepted: self.accepted,
            rejected: self.rejected,
        }
    }
}

/// The finished, read-only aggregate state.

#[derive(Debug)]
pub struct Aggregates {
    endpoints: Vec<EndpointAggregate>,
    hourly: [usize; 24],
    users: HashMap<Ustr, UserTally>,
    accepted: usize,
    rejected: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TimeRange {
    #[serde(serialize_with = "serialize_opt_timestamp")]
    pub start: Option<Timestamp>,
    #[serde(serialize_with = "serialize_opt_timestamp")]
    pub end: Option<Timestamp>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Summary {
    pub total_requests: usize,
    pub rejected_records: usize,
    pub time_range: TimeRange,
    pub avg_response_time_ms: f64,
    pub min_response_time_ms: f64,
    pub max_response_time_ms: f64,
    pub error_count: usize,
    pub error_rate_percentage: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EndpointStats {
    pub endpoint: Ustr,
    pub request_count: usize,
    pub avg_response_time_ms: f64,
    pub min_response_time_ms: f64,
    pub max_response_time_ms: f64,
    pub error_count: usize,
    pub error_rate_percentage: f64,
    pub most_common_status: Option<u16>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UserCount {
    pub user_id: Ustr,
    pub request_count: usize,
}

/// Round to three decimals, which is the precision of the report.

pub fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

impl Aggregates {
    /// Endpoints in key order.

    pub fn endpoints(&self) -> &[EndpointAggregate] {
        &self.endpoints
    }

    pub fn endpoint(&self, endpoint: &str) -> Option<&EndpointAggregate> {
        self.endpoints
            .binary_search_by(|a| a.endpoint.as_str().cmp(endpoint))
            .ok()
            .map(|ix| &self.endpoints[ix])
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn summary(&self) -> Summary {
        let total = self.accepted;
        let errors = self.endpoints.iter().map(|e| e.error_count).sum::<usize>();
        let time_sum = self.endpoints.iter().map(|e| e.time_sum).sum::<f64>();
        let (min, max) = if total == 0 {
            (0.0, 0.0)
        } else {
            self.endpoints.iter().fold(
                (f64::INFINITY, f64::NEG_INFINITY),
                |(lo, hi), e| (f64::min(lo, e.time_min), f64::max(hi, e.time_max)),
            )
        };
        Summary {
            total_requests: total,
            rejected_records: self.rejected,
            time_range: TimeRange {
                start: self.endpoints.iter().filter_map(|e| e.first_timestamp()).min(),
                end: self.endpoints.iter().filter_map(|e| e.last_timestamp()).max(),
            },
            avg_response_time_ms: if total == 0 {
                0.0
            } else {
                round3(time_sum / total as f64)
            },
            min_response_time_ms: min,
            max_response_time_ms: max,
            error_count: errors,
            error_rate_percentage: round3(percentage(errors, total)),
        }
    }

    pub fn endpoint_stats(&self) -> Vec<EndpointStats> {
        self.endpoints
            .iter()
            .map(|e| EndpointStats {
                endpoint: e.endpoint,
                request_count: e.count,
                avg_response_time_ms: round3(e.avg_response_time_ms()),
                min_response_time_ms: e.time_min,
                max_response_time_ms: e.time_max,
                error_count: e.error_count,
                error_rate_percentage: round3(percentage(e.error_count, e.count)),
                most_common_status: e.most_common_status(),
            })
            .collect()
    }

    /// Exactly 24 buckets labeled "00:00" through "23:00" (UTC), zero-filled.

    pub fn hourly_distribution(&self) -> BTreeMap<String, usize> {
        self.hourly
            .iter()
            .enumerate()
            .map(|(h, n)| (format!("{h:02}:00"), *n))
            .collect()
    }

    /// The `n` users with the most requests; the user seen first wins a tie.

    pub fn top_users(&self, n: usize) -> Vec<UserCount> {
        self.users
            .iter()
            .sorted_by(|(_, a), (_, b)| {
                b.count
                    .cmp(&a.count)
                    .then_with(|| a.first_seen.cmp(&b.first_seen))
            })
            .take(n)
            .map(|(user, t)| UserCount {
                user_id: *user,
                request_count: t.count,
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) fn mkrec(t: &str, endpoint: &str, status: u16, rt: f64, size: f64, user: &str) -> LogRecord {
    LogRecord {
        timestamp: logutils::parse_timestamp(t).unwrap(),
        endpoint: Ustr::from(endpoint),
        method: Ustr::from("GET"),
        status,
        response_time_ms: rt,
        response_size_bytes: size,
        user_id: Ustr::from(user),
    }
}

#[test]
fn test_two_records() {
    let mut a = RunningAggregator::new();
    a.ingest(&mkrec("2025-01-15T10:00:00Z", "/a", 200, 100.0, 500.0, "x"));
    a.ingest(&mkrec("2025-01-15T10:01:00Z", "/a", 500, 100.0, 500.0, "x"));
    let aggs = a.finish();

    let s = aggs.summary();
    assert!(s.total_requests == 2);
    assert!(s.error_count == 1);
    assert!(s.error_rate_percentage == 50.0);
    assert!(s.avg_response_time_ms == 100.0);
    assert!(logutils::format_timestamp(s.time_range.start.unwrap()) == "2025-01-15T10:00:00Z");
    assert!(logutils::format_timestamp(s.time_range.end.unwrap()) == "2025-01-15T10:01:00Z");

    let stats = aggs.endpoint_stats();
    assert!(stats.len() == 1);
    assert!(stats[0].endpoint.as_str() == "/a");
    assert!(stats[0].error_count == 1);
    // 200 and 500 are tied, the lower wins.
    assert!(stats[0].most_common_status == Some(200));

    let top = aggs.top_users(5);
    assert!(top.len() == 1);
    assert!(top[0].user_id.as_str() == "x" && top[0].request_count == 2);
}

#[test]
fn test_empty() {
    let mut a = RunningAggregator::new();
    a.add_rejected(3);
    let aggs = a.finish();
    let s = aggs.summary();
    assert!(s.total_requests == 0);
    assert!(s.rejected_records == 3);
    assert!(s.avg_response_time_ms == 0.0);
    assert!(s.min_response_time_ms == 0.0 && s.max_response_time_ms == 0.0);
    assert!(s.error_rate_percentage == 0.0);
    assert!(s.time_range.start.is_none() && s.time_range.end.is_none());
    assert!(aggs.endpoint_stats().is_empty());
    assert!(aggs.top_users(5).is_empty());
    let hourly = aggs.hourly_distribution();
    assert!(hourly.len() == 24);
    assert!(hourly.values().all(|n| *n == 0));
}

#[test]
fn test_counts_are_consistent() {
    let mut a = RunningAggregator::new();
    let eps = ["/a", "/b", "/c"];
    let users = ["u1", "u2", "u3", "u4"];
    for i in 0..97usize {
        let t = format!("2025-01-15T{:02}:{:02}:00Z", (i * 7) % 24, i % 60);
        let status = if i % 5 == 0 { 503 } else { 200 };
        a.ingest(&mkrec(&t, eps[i % 3], status, (i * 13 % 400) as f64, 100.0, users[i % 4]));
    }
    let aggs = a.finish();
    let s = aggs.summary();
    let stats = aggs.endpoint_stats();
    assert!(s.total_requests == 97);
    assert!(stats.iter().map(|e| e.request_count).sum::<usize>() == 97);
    assert!(stats.iter().all(|e| e.error_count <= e.request_count));
    assert!(stats.iter().map(|e| e.error_count).sum::<usize>() == s.error_count);
    let hourly = aggs.hourly_distribution();
    assert!(hourly.len() == 24);
    assert!(hourly.values().sum::<usize>() == 97);
    assert!(hourly.keys().next().unwrap() == "00:00");
    assert!(hourly.keys().last().unwrap() == "23:00");

    // Sequences are sorted even though the input was not.
    for e in aggs.endpoints() {
        assert!(e.samples.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(e.error_timestamps.windows(2).all(|w| w[0] <= w[1]));
        assert!(e.error_timestamps.len() == e.error_count);
    }
}

#[test]
fn test_top_users_ties() {
    let mut a = RunningAggregator::new();
    for (i, u) in ["c", "a", "b", "a", "c", "d", "e", "f", "g"].iter().enumerate() {
        let t = format!("2025-01-15T10:00:{:02}Z", i);
        a.ingest(&mkrec(&t, "/a", 200, 1.0, 1.0, u));
    }
    let aggs = a.finish();
    let top = aggs
        .top_users(5)
        .iter()
        .map(|u| (u.user_id.to_string(), u.request_count))
        .collect::<Vec<(String, usize)>>();
    assert!(
        top == vec![
            ("c".to_string(), 2),
            ("a".to_string(), 2),
            ("b".to_string(), 1),
            ("d".to_string(), 1),
            ("e".to_string(), 1)
        ]
    );
}

#[test]
fn test_most_common_status() {
    let mut a = RunningAggregator::new();
    for (i, s) in [404u16, 500, 500, 404, 200].iter().enumerate() {
        let t = format!("2025-01-15T10:00:{:02}Z", i);
        a.ingest(&mkrec(&t, "/a", *s, 1.0, 1.0, "u"));
    }
    let aggs = a.finish();
    assert!(aggs.endpoint("/a").unwrap().most_common_status() == Some(404));
    assert!(aggs.endpoint("/b").is_none());
}

#[test]
fn test_hour_buckets_are_utc() {
    let mut a = RunningAggregator::new();
    a.ingest(&mkrec("2025-01-15T10:59:59+02:00", "/a", 200, 1.0, 1.0, "u"));
    a.ingest(&mkrec("2025-01-15T08:00:00Z", "/a", 200, 1.0, 1.0, "u"));
    let aggs = a.finish();
    let hourly = aggs.hourly_distribution();
    assert!(hourly["08:00"] == 2);
    assert!(hourly["10:00"] == 0);
}

#[test]
fn test_merge() {
    let recs = (0..40usize)
        .map(|i| {
            let t = format!("2025-01-15T11:{:02}:00Z", 59 - i);
            let ep = if i % 3 == 0 { "/a" } else { "/b" };
            let status = if i % 4 == 0 { 500 } else { 200 };
            mkrec(&t, ep, status, i as f64, 10.0, if i % 2 == 0 { "u1" } else { "u2" })
        })
        .collect::<Vec<LogRecord>>();

    let mut whole = RunningAggregator::new();
    for r in &recs {
        whole.ingest(r);
    }
    let mut left = RunningAggregator::new();
    let mut right = RunningAggregator::new();
    for r in &recs {
        // Both partitions get records for /b.
        if r.endpoint.as_str() == "/a" || r.response_time_ms < 20.0 {
            left.ingest(r);
        } else {
            right.ingest(r);
        }
    }
    left.merge(right);
    let whole = whole.finish();
    let merged = left.finish();

    assert!(whole.summary() == merged.summary());
    assert!(whole.endpoint_stats() == merged.endpoint_stats());
    assert!(whole.hourly_distribution() == merged.hourly_distribution());
    for (x, y) in whole.endpoints().iter().zip(merged.endpoints().iter()) {
        assert!(x.error_timestamps == y.error_timestamps);
        assert!(
            x.samples.iter().map(|s| s.timestamp).collect::<Vec<Timestamp>>()
                == y.samples.iter().map(|s| s.timestamp).collect::<Vec<Timestamp>>()
        );
    }
}
