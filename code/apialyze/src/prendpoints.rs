/// Endpoint statistics printer.
///
/// One row per endpoint, in endpoint key order.  The response-time figures are in milliseconds and
/// the error rate is in percent; `status` is the most common status code, or `-` if there is none.
use crate::format;

use accesslog::EndpointStats;
use anyhow::Result;
use std::collections::HashMap;
use std::io;

pub fn print_endpoints(
    output: &mut dyn io::Write,
    fmt: &Option<String>,
    stats: &[EndpointStats],
) -> Result<()> {
    let (formatters, aliases) = my_formatters();
    let spec = fmt.as_deref().unwrap_or(FMT_DEFAULTS);
    let (fields, others) = format::parse_fields(spec, &formatters, &aliases)?;
    let opts = format::standard_options(&others);
    format::format_data(output, &fields, &formatters, &opts, stats)
}

pub fn fmt_help() -> format::Help {
    let (formatters, aliases) = my_formatters();
    format::make_help(&formatters, &aliases, FMT_DEFAULTS)
}

const FMT_DEFAULTS: &str = "endpoint,requests,time,errors,error-rate,status";

type Datum<'a> = &'a EndpointStats;

fn my_formatters() -> (
    HashMap<String, &'static dyn Fn(Datum) -> String>,
    HashMap<String, Vec<String>>,
) {
    let mut formatters: HashMap<String, &'static dyn Fn(Datum) -> String> = HashMap::new();
    let mut aliases: HashMap<String, Vec<String>> = HashMap::new();

    formatters.insert("endpoint".to_string(), &format_endpoint);
    formatters.insert("requests".to_string(), &format_requests);
    formatters.insert("avg".to_string(), &format_avg);
    formatters.insert("min".to_string(), &format_min);
    formatters.insert("max".to_string(), &format_max);
    formatters.insert("errors".to_string(), &format_errors);
    formatters.insert("error-rate".to_string(), &format_error_rate);
    formatters.insert("status".to_string(), &format_status);

    aliases.insert(
        "time".to_string(),
        vec!["avg".to_string(), "min".to_string(), "max".to_string()],
    );
    aliases.insert(
        "std".to_string(),
        vec!["endpoint".to_string(), "requests".to_string()],
    );

    (formatters, aliases)
}

fn format_endpoint(s: Datum) -> String {
    s.endpoint.to_string()
}

fn format_requests(s: Datum) -> String {
    s.request_count.to_string()
}

fn format_avg(s: Datum) -> String {
    s.avg_response_time_ms.to_string()
}

fn format_min(s: Datum) -> String {
    s.min_response_time_ms.to_string()
}

fn format_max(s: Datum) -> String {
    s.max_response_time_ms.to_string()
}

fn format_errors(s: Datum) -> String {
    s.error_count.to_string()
}

fn format_error_rate(s: Datum) -> String {
    s.error_rate_percentage.to_string()
}

fn format_status(s: Datum) -> String {
    s.most_common_status
        .map_or("-".to_string(), |status| status.to_string())
}

#[test]
fn test_print_endpoints() {
    use ustr::Ustr;

    let stats = vec![EndpointStats {
        endpoint: Ustr::from("/api/users"),
        request_count: 3,
        avg_response_time_ms: 120.5,
        min_response_time_ms: 100.0,
        max_response_time_ms: 150.0,
        error_count: 1,
        error_rate_percentage: 33.333,
        most_common_status: Some(200),
    }];
    let mut out = vec![];
    print_endpoints(&mut out, &Some("std,time,status,csv".to_string()), &stats).unwrap();
    assert!(String::from_utf8(out).unwrap() == "/api/users,3,120.5,100,150,200\n");
}
