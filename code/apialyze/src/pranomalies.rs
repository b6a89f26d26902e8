/// Anomaly printer.
///
/// One row per finding, in report order.  `start` and `end` bound the evidence window; for a spike
/// or an error cluster the start is exclusive.  `evidence` is a short human-readable summary of the
/// numbers behind the finding; use the `report` command to get them as separate values.
use crate::anomaly::Finding;
use crate::format;

use anyhow::Result;
use logutils::format_timestamp;
use std::collections::HashMap;
use std::io;

pub fn print_anomalies(
    output: &mut dyn io::Write,
    fmt: &Option<String>,
    findings: &[Finding],
) -> Result<()> {
    let (formatters, aliases) = my_formatters();
    let spec = fmt.as_deref().unwrap_or(FMT_DEFAULTS);
    let (fields, others) = format::parse_fields(spec, &formatters, &aliases)?;
    let opts = format::standard_options(&others);
    format::format_data(output, &fields, &formatters, &opts, findings)
}

pub fn fmt_help() -> format::Help {
    let (formatters, aliases) = my_formatters();
    format::make_help(&formatters, &aliases, FMT_DEFAULTS)
}

const FMT_DEFAULTS: &str = "endpoint,type,severity,window,evidence";

type Datum<'a> = &'a Finding;

fn my_formatters() -> (
    HashMap<String, &'static dyn Fn(Datum) -> String>,
    HashMap<String, Vec<String>>,
) {
    let mut formatters: HashMap<String, &'static dyn Fn(Datum) -> String> = HashMap::new();
    let mut aliases: HashMap<String, Vec<String>> = HashMap::new();

    formatters.insert("endpoint".to_string(), &format_endpoint);
    formatters.insert("type".to_string(), &format_type);
    formatters.insert("severity".to_string(), &format_severity);
    formatters.insert("start".to_string(), &format_start);
    formatters.insert("end".to_string(), &format_end);
    formatters.insert("evidence".to_string(), &format_evidence);

    aliases.insert(
        "window".to_string(),
        vec!["start".to_string(), "end".to_string()],
    );

    (formatters, aliases)
}

fn format_endpoint(f: Datum) -> String {
    f.endpoint().to_string()
}

fn format_type(f: Datum) -> String {
    f.kind().to_string()
}

fn format_severity(f: Datum) -> String {
    f.severity().as_str().to_string()
}

fn format_start(f: Datum) -> String {
    format_timestamp(f.window().0)
}

fn format_end(f: Datum) -> String {
    format_timestamp(f.window().1)
}

fn format_evidence(f: Datum) -> String {
    f.evidence()
}

#[test]
fn test_print_anomalies() {
    use crate::issues::Severity;
    use ustr::Ustr;

    let t0 = logutils::timestamp_from_ymdhms(2025, 1, 15, 10, 0, 0).unwrap();
    let t1 = logutils::timestamp_from_ymdhms(2025, 1, 15, 10, 5, 0).unwrap();
    let findings = vec![Finding::UnusualUserBehavior {
        endpoint: Ustr::from("/a"),
        user_id: Ustr::from("bot"),
        window_start: t0,
        window_end: t1,
        user_requests: 8,
        endpoint_requests: 10,
        share_percentage: 80.0,
        severity: Severity::High,
    }];
    let mut out = vec![];
    let fmt = Some("endpoint,type,severity,window,evidence,csv".to_string());
    print_anomalies(&mut out, &fmt, &findings).unwrap();
    assert!(
        String::from_utf8(out).unwrap()
            == "/a,unusual_user_behavior,high,2025-01-15T10:00:00Z,2025-01-15T10:05:00Z,bot made 8 requests (80%)\n"
    );
}
