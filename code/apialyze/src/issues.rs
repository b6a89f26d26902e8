/// Performance issues and the recommendations that follow from them.
///
/// Both are derived from the per-endpoint statistics only.  An endpoint whose average response
/// time is above the medium response-time threshold is a `slow_endpoint`; one whose error rate is
/// above the medium error-rate threshold has a `high_error_rate`.  The severity is the highest
/// level of the ladder that the value strictly exceeds.
///
/// Issues and recommendations come out in endpoint key order, slowness before errors.
use accesslog::{round3, Aggregates};
use logutils::{SeverityLadder, SeverityThresholds};
use serde::Serialize;
use ustr::Ustr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// The severity of `value` on the ladder, or None if it does not exceed even the medium level.

pub fn classify(value: f64, ladder: &SeverityLadder) -> Option<Severity> {
    if value > ladder.critical {
        Some(Severity::Critical)
    } else if value > ladder.high {
        Some(Severity::High)
    } else if value > ladder.medium {
        Some(Severity::Medium)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PerformanceIssue {
    SlowEndpoint {
        endpoint: Ustr,
        avg_response_time_ms: f64,
        threshold_ms: f64,
        severity: Severity,
    },
    HighErrorRate {
        endpoint: Ustr,
        error_rate_percentage: f64,
        threshold_percentage: f64,
        severity: Severity,
    },
}

pub fn find_issues(aggs: &Aggregates, thresholds: &SeverityThresholds) -> Vec<PerformanceIssue> {
    let mut issues = vec![];
    for s in aggs.endpoint_stats() {
        if let Some(severity) = classify(s.avg_response_time_ms, &thresholds.response_time_ms) {
            issues.push(PerformanceIssue::SlowEndpoint {
                endpoint: s.endpoint,
                avg_response_time_ms: s.avg_response_time_ms,
                threshold_ms: thresholds.response_time_ms.medium,
                severity,
            });
        }
        if let Some(severity) = classify(s.error_rate_percentage, &thresholds.error_rate_percent) {
            issues.push(PerformanceIssue::HighErrorRate {
                endpoint: s.endpoint,
                error_rate_percentage: s.error_rate_percentage,
                threshold_percentage: thresholds.error_rate_percent.medium,
                severity,
            });
        }
    }
    issues
}

/// One human-readable line per issue.

pub fn recommendations(issues: &[PerformanceIssue]) -> Vec<String> {
    issues
        .iter()
        .map(|issue| match issue {
            PerformanceIssue::SlowEndpoint {
                endpoint,
                avg_response_time_ms,
                threshold_ms,
                ..
            } => format!(
                "Investigate {endpoint} performance (avg {}ms exceeds {threshold_ms}ms threshold)",
                round3(*avg_response_time_ms)
            ),
            PerformanceIssue::HighErrorRate {
                endpoint,
                error_rate_percentage,
                ..
            } => format!(
                "Alert: {endpoint} has {}% error rate",
                round3(*error_rate_percentage)
            ),
        })
        .collect()
}

#[cfg(test)]
use accesslog::{LogRecord, RunningAggregator};

#[cfg(test)]
fn aggregate(specs: &[(&str, u16, f64)]) -> Aggregates {
    let mut a = RunningAggregator::new();
    for (i, (endpoint, status, rt)) in specs.iter().enumerate() {
        a.ingest(&LogRecord {
            timestamp: logutils::timestamp_from_ymdhms(2025, 1, 15, 10, 0, i as u32 % 60).unwrap(),
            endpoint: Ustr::from(*endpoint),
            method: Ustr::from("GET"),
            status: *status,
            response_time_ms: *rt,
            response_size_bytes: 100.0,
            user_id: Ustr::from("u"),
        });
    }
    a.finish()
}

#[test]
fn test_classify() {
    let ladder = SeverityThresholds::default().response_time_ms;
    assert!(classify(500.0, &ladder).is_none());
    assert!(classify(500.5, &ladder) == Some(Severity::Medium));
    assert!(classify(1000.0, &ladder) == Some(Severity::Medium));
    assert!(classify(1000.1, &ladder) == Some(Severity::High));
    assert!(classify(2000.1, &ladder) == Some(Severity::Critical));
}

#[test]
fn test_issues() {
    let aggs = aggregate(&[
        ("/fast", 200, 100.0),
        ("/fast", 200, 120.0),
        ("/slow", 200, 1500.0),
        ("/slow", 200, 1100.0),
        ("/broken", 500, 10.0),
        ("/broken", 200, 10.0),
        ("/broken", 200, 10.0),
        ("/broken", 200, 10.0),
        ("/broken", 200, 10.0),
        ("/broken", 200, 10.0),
        ("/broken", 200, 10.0),
        ("/broken", 200, 10.0),
    ]);
    let issues = find_issues(&aggs, &SeverityThresholds::default());
    assert!(issues.len() == 2);
    // "/broken" sorts before "/slow"
    match &issues[0] {
        PerformanceIssue::HighErrorRate {
            endpoint,
            error_rate_percentage,
            severity,
            ..
        } => {
            assert!(endpoint.as_str() == "/broken");
            assert!(*error_rate_percentage == 12.5);
            assert!(*severity == Severity::High);
        }
        _ => panic!("Expected an error-rate issue"),
    }
    match &issues[1] {
        PerformanceIssue::SlowEndpoint {
            endpoint,
            avg_response_time_ms,
            severity,
            ..
        } => {
            assert!(endpoint.as_str() == "/slow");
            assert!(*avg_response_time_ms == 1300.0);
            assert!(*severity == Severity::High);
        }
        _ => panic!("Expected a slowness issue"),
    }

    let recs = recommendations(&issues);
    assert!(recs[0] == "Alert: /broken has 12.5% error rate");
    assert!(recs[1] == "Investigate /slow performance (avg 1300ms exceeds 500ms threshold)");
}

#[test]
fn test_issue_json() {
    let aggs = aggregate(&[("/slow", 200, 2500.0)]);
    let issues = find_issues(&aggs, &SeverityThresholds::default());
    let v = serde_json::to_value(&issues).unwrap();
    assert!(v[0]["type"] == "slow_endpoint");
    assert!(v[0]["severity"] == "critical");
    assert!(v[0]["threshold_ms"] == 500.0);
}
