/// Cost printer.
///
/// One row per endpoint with its estimated cost in USD, followed by a `*total*` row for the whole
/// input.  The total row's `savings` is the optimization potential; it is blank for endpoints.
use crate::cost::{CostAnalysis, EndpointCostView};
use crate::format;

use anyhow::Result;
use std::collections::HashMap;
use std::io;
use ustr::Ustr;

struct Row {
    view: EndpointCostView,
    savings: Option<f64>,
}

pub fn print_cost(
    output: &mut dyn io::Write,
    fmt: &Option<String>,
    analysis: &CostAnalysis,
) -> Result<()> {
    let (formatters, aliases) = my_formatters();
    let spec = fmt.as_deref().unwrap_or(FMT_DEFAULTS);
    let (fields, others) = format::parse_fields(spec, &formatters, &aliases)?;
    let opts = format::standard_options(&others);

    let mut rows = analysis
        .cost_by_endpoint
        .iter()
        .map(|view| Row {
            view: view.clone(),
            savings: None,
        })
        .collect::<Vec<Row>>();
    let requests = rows.iter().map(|r| r.view.request_count).sum::<usize>();
    if requests > 0 {
        let b = &analysis.cost_breakdown;
        rows.push(Row {
            view: EndpointCostView {
                endpoint: Ustr::from("*total*"),
                request_count: requests,
                fixed_cost: b.request_costs,
                execution_cost: b.execution_costs,
                memory_cost: b.memory_costs,
                total_cost: analysis.total_cost_usd,
                cost_per_request: crate::cost::round6(analysis.total_cost_usd / requests as f64),
            },
            savings: Some(analysis.optimization_potential_usd),
        });
    }
    format::format_data(output, &fields, &formatters, &opts, &rows)
}

pub fn fmt_help() -> format::Help {
    let (formatters, aliases) = my_formatters();
    format::make_help(&formatters, &aliases, FMT_DEFAULTS)
}

const FMT_DEFAULTS: &str = "endpoint,requests,breakdown,total,per-request,savings";

type Datum<'a> = &'a Row;

fn my_formatters() -> (
    HashMap<String, &'static dyn Fn(Datum) -> String>,
    HashMap<String, Vec<String>>,
) {
    let mut formatters: HashMap<String, &'static dyn Fn(Datum) -> String> = HashMap::new();
    let mut aliases: HashMap<String, Vec<String>> = HashMap::new();

    formatters.insert("endpoint".to_string(), &format_endpoint);
    formatters.insert("requests".to_string(), &format_requests);
    formatters.insert("fixed".to_string(), &format_fixed);
    formatters.insert("execution".to_string(), &format_execution);
    formatters.insert("memory".to_string(), &format_memory);
    formatters.insert("total".to_string(), &format_total);
    formatters.insert("per-request".to_string(), &format_per_request);
    formatters.insert("savings".to_string(), &format_savings);

    aliases.insert(
        "breakdown".to_string(),
        vec![
            "fixed".to_string(),
            "execution".to_string(),
            "memory".to_string(),
        ],
    );

    (formatters, aliases)
}

fn format_endpoint(r: Datum) -> String {
    r.view.endpoint.to_string()
}

fn format_requests(r: Datum) -> String {
    r.view.request_count.to_string()
}

fn format_fixed(r: Datum) -> String {
    format!("{:.6}", r.view.fixed_cost)
}

fn format_execution(r: Datum) -> String {
    format!("{:.6}", r.view.execution_cost)
}

fn format_memory(r: Datum) -> String {
    format!("{:.6}", r.view.memory_cost)
}

fn format_total(r: Datum) -> String {
    format!("{:.6}", r.view.total_cost)
}

fn format_per_request(r: Datum) -> String {
    format!("{:.6}", r.view.cost_per_request)
}

fn format_savings(r: Datum) -> String {
    r.savings.map_or("".to_string(), |s| format!("{s:.6}"))
}

#[test]
fn test_print_cost() {
    use crate::cost::{cost_analysis, CostModel};
    use accesslog::{LogRecord, RunningAggregator};

    let mut a = RunningAggregator::new();
    for (i, rt) in [400.0, 800.0].iter().enumerate() {
        a.ingest(&LogRecord {
            timestamp: logutils::timestamp_from_ymdhms(2025, 1, 15, 10, 0, i as u32).unwrap(),
            endpoint: Ustr::from("/a"),
            method: Ustr::from("GET"),
            status: 200,
            response_time_ms: *rt,
            response_size_bytes: 100.0,
            user_id: Ustr::from("u"),
        });
    }
    let aggs = a.finish();
    let config = logutils::AnalysisConfig::default();
    let analysis = cost_analysis(
        &aggs,
        &CostModel::new(&config.cost),
        &config.severity.response_time_ms,
    );
    let mut out = vec![];
    print_cost(&mut out, &Some("endpoint,total,savings,csv".to_string()), &analysis).unwrap();
    // 2 * 0.0001 + 1200 * 0.000002 + 2 * 0.00001 = 0.00262, savings 2 * 0.000002 * 100
    assert!(String::from_utf8(out).unwrap() == "/a,0.002620,\n*total*,0.002620,0.000400\n");

    let empty = cost_analysis(
        &RunningAggregator::new().finish(),
        &CostModel::new(&config.cost),
        &config.severity.response_time_ms,
    );
    let mut out = vec![];
    print_cost(&mut out, &Some("endpoint,csv".to_string()), &empty).unwrap();
    assert!(out.is_empty());
}
