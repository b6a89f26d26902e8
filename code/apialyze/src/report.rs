/// The full analysis report.
///
/// The report is a pure projection of the finished aggregates: the statistical views, the issues and
/// recommendations derived from them, the cost analysis, and the anomaly findings.  The top-level
/// keys are fixed and always present, also for empty input.
use crate::anomaly::{detect_anomalies, Finding};
use crate::cost::{cost_analysis, CostAnalysis, CostModel};
use crate::issues::{find_issues, recommendations, PerformanceIssue};

use accesslog::{Aggregates, EndpointStats, Summary, UserCount};
use logutils::AnalysisConfig;
use serde::Serialize;
use std::collections::BTreeMap;

#[cfg(test)]
use accesslog::{RecordNormalizer, RunningAggregator};
#[cfg(test)]
use serde_json::Value;

pub const TOP_USERS: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub summary: Summary,
    pub endpoint_stats: Vec<EndpointStats>,
    pub performance_issues: Vec<PerformanceIssue>,
    pub recommendations: Vec<String>,
    pub hourly_distribution: BTreeMap<String, usize>,
    pub top_users_by_requests: Vec<UserCount>,
    pub cost_analysis: CostAnalysis,
    pub anomalies: Vec<Finding>,
}

/// Project finished aggregates into a report.  `config` must have been validated.

pub fn build_report(aggs: &Aggregates, config: &AnalysisConfig) -> Report {
    let performance_issues = find_issues(aggs, &config.severity);
    let recommendations = recommendations(&performance_issues);
    let model = CostModel::new(&config.cost);
    Report {
        summary: aggs.summary(),
        endpoint_stats: aggs.endpoint_stats(),
        performance_issues,
        recommendations,
        hourly_distribution: aggs.hourly_distribution(),
        top_users_by_requests: aggs.top_users(TOP_USERS),
        cost_analysis: cost_analysis(aggs, &model, &config.severity.response_time_ms),
        anomalies: detect_anomalies(aggs, &config.anomaly),
    }
}

#[cfg(test)]
fn analyze(raw: &[Value], config: &AnalysisConfig) -> anyhow::Result<Report> {
    config.validate()?;
    let mut normalizer = RecordNormalizer::new();
    let mut aggregator = RunningAggregator::new();
    for r in raw {
        if let Some(record) = normalizer.normalize(r) {
            aggregator.ingest(&record);
        }
    }
    aggregator.add_rejected(normalizer.rejected());
    Ok(build_report(&aggregator.finish(), config))
}

#[cfg(test)]
fn raw(ts: &str, endpoint: &str, status: u16, rt: f64, user: &str) -> Value {
    serde_json::json!({
        "timestamp": ts,
        "endpoint": endpoint,
        "method": "GET",
        "status_code": status,
        "response_time_ms": rt,
        "response_size_bytes": 512,
        "user_id": user,
    })
}

#[test]
fn test_empty_input() {
    let report = analyze(&[], &AnalysisConfig::default()).unwrap();
    assert!(report.summary.total_requests == 0);
    assert!(report.endpoint_stats.is_empty());
    assert!(report.anomalies.is_empty());
    assert!(report.performance_issues.is_empty());
    assert!(report.hourly_distribution.len() == 24);
    assert!(report.cost_analysis.total_cost_usd == 0.0);

    let v = serde_json::to_value(&report).unwrap();
    let keys = v
        .as_object()
        .unwrap()
        .keys()
        .cloned()
        .collect::<Vec<String>>();
    // serde_json's default map is sorted, so compare as sets.
    let mut expected = vec![
        "summary",
        "endpoint_stats",
        "performance_issues",
        "recommendations",
        "hourly_distribution",
        "top_users_by_requests",
        "cost_analysis",
        "anomalies",
    ];
    expected.sort();
    assert!(keys == expected);
    assert!(v["summary"]["time_range"]["start"].is_null());
}

#[test]
fn test_key_order() {
    let report = analyze(&[], &AnalysisConfig::default()).unwrap();
    let s = serde_json::to_string(&report).unwrap();
    let pos = |k: &str| s.find(&format!("\"{k}\":")).unwrap();
    assert!(pos("summary") < pos("endpoint_stats"));
    assert!(pos("endpoint_stats") < pos("performance_issues"));
    assert!(pos("performance_issues") < pos("recommendations"));
    assert!(pos("recommendations") < pos("hourly_distribution"));
    assert!(pos("hourly_distribution") < pos("top_users_by_requests"));
    assert!(pos("top_users_by_requests") < pos("cost_analysis"));
    assert!(pos("cost_analysis") < pos("anomalies"));
}

#[test]
fn test_negative_response_time() {
    let mut records = (0..9)
        .map(|i| raw(&format!("2025-01-15T10:0{i}:00Z"), "/a", 200, 100.0, ["p", "q", "r"][i % 3]))
        .collect::<Vec<Value>>();
    records.push(raw("2025-01-15T10:09:00Z", "/a", 200, -5.0, "p"));
    let report = analyze(&records, &AnalysisConfig::default()).unwrap();
    assert!(report.summary.total_requests == 9);
    assert!(report.summary.rejected_records == 1);
    assert!(report.endpoint_stats[0].request_count == 9);
}

#[test]
fn test_two_records() {
    let records = vec![
        raw("2025-01-15T10:00:00Z", "/a", 200, 100.0, "x"),
        raw("2025-01-15T10:01:00Z", "/a", 500, 100.0, "x"),
    ];
    let report = analyze(&records, &AnalysisConfig::default()).unwrap();
    assert!(report.summary.total_requests == 2);
    assert!(report.summary.error_count == 1);
    assert!(report.top_users_by_requests.len() == 1);
    assert!(report.top_users_by_requests[0].user_id.as_str() == "x");
    assert!(report.top_users_by_requests[0].request_count == 2);
    assert!(report.hourly_distribution["10:00"] == 2);
    assert!(report.hourly_distribution.values().sum::<usize>() == 2);
    // 50% errors on /a
    assert!(report.performance_issues.len() == 1);
    assert!(report.recommendations == vec!["Alert: /a has 50% error rate".to_string()]);
}

#[test]
fn test_bad_config() {
    let mut config = AnalysisConfig::default();
    config.severity.response_time_ms.high = 100.0;
    assert!(analyze(&[raw("2025-01-15T10:00:00Z", "/a", 200, 1.0, "x")], &config).is_err());
}
