/// Anomaly detection.
///
/// For each endpoint, in key order, four independent analyses are run, and their findings are
/// reported in this order:
///
/// - Request spikes: the baseline is the endpoint's average number of requests per window over its
///   observed time span (at least one window).  A window whose count exceeds
///   `spike_multiplier * baseline` is dense.
///
/// - Response-time degradation: the mean response time of the most recent `recent_fraction` of the
///   endpoint's requests (at least one) is compared to the endpoint's overall mean.  This is a
///   coarse heuristic; it knows nothing about trends or time of day.
///
/// - Error clusters: a window over the endpoint's error timestamps whose count reaches
///   `error_cluster_threshold` is dense.  The threshold is absolute, not relative to traffic.
///
/// - Unusual user behavior: a user whose share of the endpoint's requests is strictly above
///   `user_share_threshold`, regardless of volume.
///
/// For spikes and error clusters, overlapping dense windows are merged into one episode, which is
/// reported once (see window.rs).  An endpoint with fewer than two data points gets no spike,
/// degradation or cluster findings.
use crate::issues::Severity;
use crate::window::{count_within, dense_episodes};

use accesslog::{round3, Aggregates, EndpointAggregate};
use itertools::Itertools;
use logutils::{serialize_timestamp, AnomalyConfig, Timestamp};
use serde::Serialize;
use ustr::Ustr;

// A user with more than this share of an endpoint's requests is a high-severity finding.
const HIGH_USER_SHARE: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Finding {
    RequestSpike {
        endpoint: Ustr,
        #[serde(serialize_with = "serialize_timestamp")]
        window_start: Timestamp,
        #[serde(serialize_with = "serialize_timestamp")]
        window_end: Timestamp,
        peak_requests: usize,
        baseline_requests: f64,
        ratio: f64,
        severity: Severity,
    },
    ResponseTimeDegradation {
        endpoint: Ustr,
        #[serde(serialize_with = "serialize_timestamp")]
        window_start: Timestamp,
        #[serde(serialize_with = "serialize_timestamp")]
        window_end: Timestamp,
        recent_avg_ms: f64,
        overall_avg_ms: f64,
        ratio: f64,
        severity: Severity,
    },
    ErrorCluster {
        endpoint: Ustr,
        #[serde(serialize_with = "serialize_timestamp")]
        window_start: Timestamp,
        #[serde(serialize_with = "serialize_timestamp")]
        window_end: Timestamp,
        peak_errors: usize,
        error_count: usize,
        requests_in_window: usize,
        error_rate_percentage: f64,
        severity: Severity,
    },
    UnusualUserBehavior {
        endpoint: Ustr,
        user_id: Ustr,
        #[serde(serialize_with = "serialize_timestamp")]
        window_start: Timestamp,
        #[serde(serialize_with = "serialize_timestamp")]
        window_end: Timestamp,
        user_requests: usize,
        endpoint_requests: usize,
        share_percentage: f64,
        severity: Severity,
    },
}

impl Finding {
    pub fn kind(&self) -> &'static str {
        match self {
            Finding::RequestSpike { .. } => "request_spike",
            Finding::ResponseTimeDegradation { .. } => "response_time_degradation",
            Finding::ErrorCluster { .. } => "error_cluster",
            Finding::UnusualUserBehavior { .. } => "unusual_user_behavior",
        }
    }

    pub fn endpoint(&self) -> Ustr {
        match self {
            Finding::RequestSpike { endpoint, .. }
            | Finding::ResponseTimeDegradation { endpoint, .. }
            | Finding::ErrorCluster { endpoint, .. }
            | Finding::UnusualUserBehavior { endpoint, .. } => *endpoint,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Finding::RequestSpike { severity, .. }
            | Finding::ResponseTimeDegradation { severity, .. }
            | Finding::ErrorCluster { severity, .. }
            | Finding::UnusualUserBehavior { severity, .. } => *severity,
        }
    }

    pub fn window(&self) -> (Timestamp, Timestamp) {
        match self {
            Finding::RequestSpike {
                window_start,
                window_end,
                ..
            }
            | Finding::ResponseTimeDegradation {
                window_start,
                window_end,
                ..
            }
            | Finding::ErrorCluster {
                window_start,
                window_end,
                ..
            }
            | Finding::UnusualUserBehavior {
                window_start,
                window_end,
                ..
            } => (*window_start, *window_end),
        }
    }

    /// A short description of the evidence, for tabular output.

    pub fn evidence(&self) -> String {
        match self {
            Finding::RequestSpike {
                peak_requests,
                baseline_requests,
                ratio,
                ..
            } => format!("{peak_requests} requests/window vs baseline {baseline_requests} ({ratio}x)"),
            Finding::ResponseTimeDegradation {
                recent_avg_ms,
                overall_avg_ms,
                ratio,
                ..
            } => format!("recent avg {recent_avg_ms}ms vs overall {overall_avg_ms}ms ({ratio}x)"),
            Finding::ErrorCluster {
                error_count,
                requests_in_window,
                peak_errors,
                ..
            } => format!(
                "{error_count} errors in {requests_in_window} requests, peak {peak_errors}/window"
            ),
            Finding::UnusualUserBehavior {
                user_id,
                user_requests,
                share_percentage,
                ..
            } => format!("{user_id} made {user_requests} requests ({share_percentage}%)"),
        }
    }
}

pub fn detect_anomalies(aggs: &Aggregates, config: &AnomalyConfig) -> Vec<Finding> {
    let mut findings = vec![];
    for agg in aggs.endpoints() {
        let timestamps = agg.samples.iter().map(|s| s.timestamp).collect::<Vec<Timestamp>>();
        request_spikes(agg, &timestamps, config, &mut findings);
        response_degradation(agg, config, &mut findings);
        error_clusters(agg, &timestamps, config, &mut findings);
        unusual_users(agg, config, &mut findings);
    }
    tracing::debug!("{} anomalies found", findings.len());
    findings
}

fn seconds(d: chrono::Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

fn request_spikes(
    agg: &EndpointAggregate,
    timestamps: &[Timestamp],
    config: &AnomalyConfig,
    findings: &mut Vec<Finding>,
) {
    let n = timestamps.len();
    if n <= 1 {
        return;
    }
    let span = seconds(timestamps[n - 1] - timestamps[0]);
    let windows = f64::max(1.0, span / seconds(config.window));
    let baseline = n as f64 / windows;
    let limit = config.spike_multiplier * baseline;
    for e in dense_episodes(timestamps, config.window, |count| count as f64 > limit) {
        findings.push(Finding::RequestSpike {
            endpoint: agg.endpoint,
            window_start: e.start,
            window_end: e.end,
            peak_requests: e.peak,
            baseline_requests: round3(baseline),
            ratio: round3(e.peak as f64 / baseline),
            severity: if e.peak as f64 > 2.0 * limit {
                Severity::High
            } else {
                Severity::Medium
            },
        });
    }
}

fn response_degradation(agg: &EndpointAggregate, config: &AnomalyConfig, findings: &mut Vec<Finding>) {
    let n = agg.samples.len();
    if n <= 1 {
        return;
    }
    // The epsilon keeps eg 30 * 0.1 = 3.0000000000000004 from becoming 4.
    let recent_len = ((n as f64 * config.recent_fraction - 1e-9).ceil() as usize).clamp(1, n);
    let recent = &agg.samples[n - recent_len..];
    let recent_avg = recent.iter().map(|s| s.response_time_ms).sum::<f64>() / recent_len as f64;
    let overall_avg = agg.avg_response_time_ms();
    let limit = config.degradation_ratio * overall_avg;
    if recent_avg > limit {
        findings.push(Finding::ResponseTimeDegradation {
            endpoint: agg.endpoint,
            window_start: recent[0].timestamp,
            window_end: recent[recent_len - 1].timestamp,
            recent_avg_ms: round3(recent_avg),
            overall_avg_ms: round3(overall_avg),
            ratio: round3(recent_avg / overall_avg),
            severity: if recent_avg > 1.5 * limit {
                Severity::High
            } else {
                Severity::Medium
            },
        });
    }
}

fn error_clusters(
    agg: &EndpointAggregate,
    timestamps: &[Timestamp],
    config: &AnomalyConfig,
    findings: &mut Vec<Finding>,
) {
    let errors = &agg.error_timestamps;
    if errors.len() <= 1 {
        return;
    }
    let threshold = config.error_cluster_threshold;
    for e in dense_episodes(errors, config.window, |count| count >= threshold) {
        let error_count = count_within(errors, e.start, e.end);
        let requests_in_window = count_within(timestamps, e.start, e.end);
        findings.push(Finding::ErrorCluster {
            endpoint: agg.endpoint,
            window_start: e.start,
            window_end: e.end,
            peak_errors: e.peak,
            error_count,
            requests_in_window,
            error_rate_percentage: round3(error_count as f64 / requests_in_window as f64 * 100.0),
            severity: if e.peak >= 2 * threshold {
                Severity::Critical
            } else {
                Severity::High
            },
        });
    }
}

fn unusual_users(agg: &EndpointAggregate, config: &AnomalyConfig, findings: &mut Vec<Finding>) {
    let (Some(first), Some(last)) = (agg.first_timestamp(), agg.last_timestamp()) else {
        return;
    };
    let total = agg.count as f64;
    for (user, n) in agg
        .user_counts
        .iter()
        .sorted_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.as_str().cmp(b.0.as_str())))
    {
        let share = *n as f64 / total;
        if share <= config.user_share_threshold {
            break;
        }
        findings.push(Finding::UnusualUserBehavior {
            endpoint: agg.endpoint,
            user_id: *user,
            window_start: first,
            window_end: last,
            user_requests: *n,
            endpoint_requests: agg.count,
            share_percentage: round3(share * 100.0),
            severity: if share > HIGH_USER_SHARE {
                Severity::High
            } else {
                Severity::Medium
            },
        });
    }
}

#[cfg(test)]
use accesslog::{LogRecord, RunningAggregator};

#[cfg(test)]
fn mkrec(secs: i64, endpoint: &str, status: u16, rt: f64, user: &str) -> LogRecord {
    let base = logutils::timestamp_from_ymdhms(2025, 1, 15, 8, 0, 0).unwrap();
    LogRecord {
        timestamp: base + chrono::Duration::seconds(secs),
        endpoint: Ustr::from(endpoint),
        method: Ustr::from("GET"),
        status,
        response_time_ms: rt,
        response_size_bytes: 100.0,
        user_id: Ustr::from(user),
    }
}

#[cfg(test)]
fn detect(records: &[LogRecord], config: &AnomalyConfig) -> Vec<Finding> {
    let mut a = RunningAggregator::new();
    for r in records {
        a.ingest(r);
    }
    detect_anomalies(&a.finish(), config)
}

#[test]
fn test_request_spike() {
    let users = ["u1", "u2", "u3", "u4"];
    let mut records = vec![];
    // One request every five minutes for two hours, and a burst of six an hour in.
    for i in 0..25 {
        records.push(mkrec(i * 300, "/a", 200, 100.0, users[i as usize % 4]));
    }
    for i in 0..6 {
        records.push(mkrec(3610 + i, "/a", 200, 100.0, users[i as usize % 4]));
    }
    let findings = detect(&records, &AnomalyConfig::default());
    assert!(findings.len() == 1);
    match &findings[0] {
        Finding::RequestSpike {
            endpoint,
            peak_requests,
            ratio,
            severity,
            window_end,
            ..
        } => {
            assert!(endpoint.as_str() == "/a");
            assert!(*peak_requests == 7);
            assert!(*ratio >= 3.0);
            assert!(*severity == Severity::Medium);
            assert!(logutils::format_timestamp(*window_end) == "2025-01-15T09:05:00Z");
        }
        _ => panic!("Expected a spike"),
    }
}

#[test]
fn test_no_spike_in_flat_traffic() {
    let mut records = vec![];
    for i in 0..100 {
        records.push(mkrec(i * 30, "/flat", 200, 100.0, ["a", "b", "c"][i as usize % 3]));
    }
    assert!(detect(&records, &AnomalyConfig::default()).is_empty());
}

#[test]
fn test_single_point() {
    let mut config = AnomalyConfig::default();
    config.error_cluster_threshold = 1;
    let findings = detect(&[mkrec(0, "/a", 500, 99999.0, "x")], &config);
    // Only the user finding is possible, and it fires even for one request.
    assert!(findings.len() == 1);
    assert!(findings[0].kind() == "unusual_user_behavior");
    assert!(findings[0].severity() == Severity::High);

    assert!(detect(&[], &config).is_empty());
}

#[test]
fn test_user_share_boundary() {
    let records = ["u1", "u1", "u2", "u3"]
        .iter()
        .enumerate()
        .map(|(i, u)| mkrec(i as i64, "/a", 200, 1.0, u))
        .collect::<Vec<LogRecord>>();
    assert!(detect(&records, &AnomalyConfig::default()).is_empty());

    let records = (0..10000)
        .map(|i| mkrec(i, "/a", 200, 1.0, if i < 5001 { "heavy" } else { "light" }))
        .collect::<Vec<LogRecord>>();
    let findings = detect(&records, &AnomalyConfig::default());
    assert!(findings.len() == 1);
    match &findings[0] {
        Finding::UnusualUserBehavior {
            user_id,
            share_percentage,
            severity,
            ..
        } => {
            assert!(user_id.as_str() == "heavy");
            assert!(*share_percentage == 50.01);
            assert!(*severity == Severity::Medium);
        }
        _ => panic!("Expected a user finding"),
    }
}

#[test]
fn test_degradation() {
    let users = ["a", "b", "c"];
    let mut records = vec![];
    for i in 0..18 {
        records.push(mkrec(i * 60, "/a", 200, 100.0, users[i as usize % 3]));
    }
    records.push(mkrec(18 * 60, "/a", 200, 1000.0, "a"));
    records.push(mkrec(19 * 60, "/a", 200, 1000.0, "b"));
    let findings = detect(&records, &AnomalyConfig::default());
    assert!(findings.len() == 1);
    match &findings[0] {
        Finding::ResponseTimeDegradation {
            recent_avg_ms,
            overall_avg_ms,
            severity,
            window_start,
            ..
        } => {
            assert!(*recent_avg_ms == 1000.0);
            assert!(*overall_avg_ms == 190.0);
            assert!(*severity == Severity::High);
            assert!(logutils::format_timestamp(*window_start) == "2025-01-15T08:18:00Z");
        }
        _ => panic!("Expected a degradation"),
    }
}

#[test]
fn test_error_cluster() {
    let mut records = vec![];
    for i in 0..12 {
        records.push(mkrec(i * 10, "/pay", 503, 10.0, "u"));
    }
    for i in 0..8 {
        records.push(mkrec(i * 10 + 5, "/pay", 200, 10.0, "u"));
    }
    // Another endpoint, to check ordering.
    records.push(mkrec(0, "/auth", 200, 10.0, "v"));
    records.push(mkrec(1, "/auth", 200, 10.0, "w"));

    let findings = detect(&records, &AnomalyConfig::default());
    let kinds = findings
        .iter()
        .map(|f| (f.endpoint().to_string(), f.kind()))
        .collect::<Vec<(String, &str)>>();
    assert!(
        kinds
            == vec![
                ("/pay".to_string(), "error_cluster"),
                ("/pay".to_string(), "unusual_user_behavior")
            ]
    );
    match &findings[0] {
        Finding::ErrorCluster {
            peak_errors,
            error_count,
            requests_in_window,
            severity,
            ..
        } => {
            assert!(*peak_errors == 12);
            assert!(*error_count == 12);
            assert!(*requests_in_window == 20);
            assert!(*severity == Severity::High);
        }
        _ => panic!("Expected an error cluster"),
    }
}

#[test]
fn test_finding_json() {
    let findings = detect(&[mkrec(0, "/a", 200, 1.0, "x")], &AnomalyConfig::default());
    let v = serde_json::to_value(&findings).unwrap();
    assert!(v[0]["type"] == "unusual_user_behavior");
    assert!(v[0]["window_start"] == "2025-01-15T08:00:00Z");
    assert!(v[0]["share_percentage"] == 100.0);
}
