/// Cost estimation.
///
/// Every request costs a fixed amount, plus an execution cost proportional to its response time,
/// plus a memory cost taken from a table of response-size brackets.  A size that falls outside
/// every bracket costs nothing.
///
/// Costs can be computed per record as records are read (`cost_for`) or afterwards from an
/// endpoint's aggregate (`cost_for_aggregate`), and the two must agree exactly.  To that end every
/// cost component is rounded once, per request, to an integer number of picodollars, and all sums
/// are integer sums, so the order of summation does not matter.  Conversion back to dollars only
/// happens for presentation.
use crate::issues::classify;

use accesslog::{Aggregates, EndpointAggregate, LogRecord};
use logutils::{CostConfig, MemoryBracket, SeverityLadder};
use serde::Serialize;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use ustr::Ustr;

const PICOS_PER_USD: f64 = 1e12;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cost(u128);

impl Cost {
    /// Negative and NaN amounts become zero.

    pub fn from_usd(usd: f64) -> Cost {
        Cost((usd * PICOS_PER_USD).round() as u128)
    }

    pub fn usd(self) -> f64 {
        self.0 as f64 / PICOS_PER_USD
    }
}

impl Add for Cost {
    type Output = Cost;
    fn add(self, other: Cost) -> Cost {
        Cost(self.0 + other.0)
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, other: Cost) {
        self.0 += other.0
    }
}

impl Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::default(), |a, b| a + b)
    }
}

/// Round dollars to six decimals for the report.

pub fn round6(x: f64) -> f64 {
    (x * 1_000_000.0).round() / 1_000_000.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestCost {
    pub fixed: Cost,
    pub execution: Cost,
    pub memory: Cost,
}

impl RequestCost {
    pub fn total(&self) -> Cost {
        self.fixed + self.execution + self.memory
    }
}

impl AddAssign for RequestCost {
    fn add_assign(&mut self, other: RequestCost) {
        self.fixed += other.fixed;
        self.execution += other.execution;
        self.memory += other.memory;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCost {
    pub endpoint: Ustr,
    pub request_count: usize,
    pub cost: RequestCost,
}

pub struct CostModel {
    fixed: Cost,
    per_ms_usd: f64,
    brackets: Vec<(MemoryBracket, Cost)>,
}

impl CostModel {
    pub fn new(config: &CostConfig) -> CostModel {
        CostModel {
            fixed: Cost::from_usd(config.per_request_usd),
            per_ms_usd: config.per_ms_execution_usd,
            brackets: config
                .memory_brackets
                .iter()
                .map(|b| (*b, Cost::from_usd(b.usd)))
                .collect(),
        }
    }

    fn cost_for_request(&self, response_time_ms: f64, response_size_bytes: f64) -> RequestCost {
        RequestCost {
            fixed: self.fixed,
            execution: Cost::from_usd(self.per_ms_usd * response_time_ms),
            memory: self
                .brackets
                .iter()
                .find(|(b, _)| b.contains(response_size_bytes))
                .map_or(Cost::default(), |(_, c)| *c),
        }
    }

    pub fn cost_for(&self, r: &LogRecord) -> RequestCost {
        self.cost_for_request(r.response_time_ms, r.response_size_bytes)
    }

    pub fn cost_for_aggregate(&self, agg: &EndpointAggregate) -> EndpointCost {
        let mut cost = RequestCost::default();
        for s in &agg.samples {
            cost += self.cost_for_request(s.response_time_ms, s.response_size_bytes);
        }
        EndpointCost {
            endpoint: agg.endpoint,
            request_count: agg.count,
            cost,
        }
    }

    /// What would be saved if every endpoint whose average response time is above the medium
    /// threshold were brought down to it.  Computed from the exact averages, never negative.

    pub fn optimization_potential(&self, aggs: &Aggregates, ladder: &SeverityLadder) -> Cost {
        aggs.endpoints()
            .iter()
            .filter(|agg| classify(agg.avg_response_time_ms(), ladder).is_some())
            .map(|agg| {
                let over = agg.avg_response_time_ms() - ladder.medium;
                Cost::from_usd(agg.count as f64 * self.per_ms_usd * over)
            })
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostBreakdown {
    pub request_costs: f64,
    pub execution_costs: f64,
    pub memory_costs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointCostView {
    pub endpoint: Ustr,
    pub request_count: usize,
    pub fixed_cost: f64,
    pub execution_cost: f64,
    pub memory_cost: f64,
    pub total_cost: f64,
    pub cost_per_request: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostAnalysis {
    pub total_cost_usd: f64,
    pub cost_breakdown: CostBreakdown,
    pub cost_by_endpoint: Vec<EndpointCostView>,
    pub optimization_potential_usd: f64,
}

pub fn cost_analysis(aggs: &Aggregates, model: &CostModel, ladder: &SeverityLadder) -> CostAnalysis {
    let mut totals = RequestCost::default();
    let mut cost_by_endpoint = vec![];
    for agg in aggs.endpoints() {
        let ec = model.cost_for_aggregate(agg);
        totals += ec.cost;
        let total = ec.cost.total().usd();
        cost_by_endpoint.push(EndpointCostView {
            endpoint: ec.endpoint,
            request_count: ec.request_count,
            fixed_cost: round6(ec.cost.fixed.usd()),
            execution_cost: round6(ec.cost.execution.usd()),
            memory_cost: round6(ec.cost.memory.usd()),
            total_cost: round6(total),
            cost_per_request: if ec.request_count == 0 {
                0.0
            } else {
                round6(total / ec.request_count as f64)
            },
        });
    }
    let potential = model.optimization_potential(aggs, ladder);
    tracing::debug!(
        "Estimated cost {} USD, optimization potential {} USD",
        totals.total().usd(),
        potential.usd()
    );
    CostAnalysis {
        total_cost_usd: round6(totals.total().usd()),
        cost_breakdown: CostBreakdown {
            request_costs: round6(totals.fixed.usd()),
            execution_costs: round6(totals.execution.usd()),
            memory_costs: round6(totals.memory.usd()),
        },
        cost_by_endpoint,
        optimization_potential_usd: round6(potential.usd()),
    }
}

#[cfg(test)]
use accesslog::RunningAggregator;

#[cfg(test)]
fn mkrec(sec: u32, endpoint: &str, rt: f64, size: f64) -> LogRecord {
    LogRecord {
        timestamp: logutils::timestamp_from_ymdhms(2025, 1, 15, 10, sec / 60, sec % 60).unwrap(),
        endpoint: Ustr::from(endpoint),
        method: Ustr::from("GET"),
        status: 200,
        response_time_ms: rt,
        response_size_bytes: size,
        user_id: Ustr::from("u"),
    }
}

#[test]
fn test_request_cost() {
    let model = CostModel::new(&CostConfig::default());
    let c = model.cost_for(&mkrec(0, "/a", 150.0, 2048.0));
    assert!(c.fixed == Cost::from_usd(0.0001));
    assert!(c.execution == Cost::from_usd(0.0003));
    assert!(c.memory == Cost::from_usd(0.00005));
    assert!(round6(c.total().usd()) == 0.00045);

    // Bracket edges are [from, to).
    assert!(model.cost_for(&mkrec(0, "/a", 0.0, 1023.0)).memory == Cost::from_usd(0.00001));
    assert!(model.cost_for(&mkrec(0, "/a", 0.0, 1024.0)).memory == Cost::from_usd(0.00005));
    assert!(model.cost_for(&mkrec(0, "/a", 0.0, 1e9)).memory == Cost::from_usd(0.0001));

    // A size outside every bracket costs nothing.
    let mut config = CostConfig::default();
    config.memory_brackets[0].from_bytes = 100.0;
    let model = CostModel::new(&config);
    assert!(model.cost_for(&mkrec(0, "/a", 0.0, 50.0)).memory == Cost::default());
}

#[test]
fn test_incremental_equals_aggregate() {
    let model = CostModel::new(&CostConfig::default());
    let mut agg = RunningAggregator::new();
    let mut incremental = RequestCost::default();
    for i in 0..500u32 {
        let r = mkrec(
            (i * 7919) % 3600,
            ["/a", "/b", "/c"][i as usize % 3],
            (i as f64) * 3.37 + 0.123,
            ((i * 331) % 20000) as f64,
        );
        incremental += model.cost_for(&r);
        agg.ingest(&r);
    }
    let aggs = agg.finish();
    let mut post_hoc = RequestCost::default();
    for a in aggs.endpoints() {
        post_hoc += model.cost_for_aggregate(a).cost;
    }
    assert!(incremental == post_hoc);

    let analysis = cost_analysis(&aggs, &model, &logutils::SeverityThresholds::default().response_time_ms);
    assert!(analysis.total_cost_usd == round6(incremental.total().usd()));
    assert!(analysis.cost_by_endpoint.len() == 3);
    assert!(analysis.cost_by_endpoint.iter().map(|e| e.request_count).sum::<usize>() == 500);
}

#[test]
fn test_optimization_potential() {
    let model = CostModel::new(&CostConfig::default());
    let ladder = logutils::SeverityThresholds::default().response_time_ms;
    let mut agg = RunningAggregator::new();
    // avg 800 on /slow, 3 requests: 3 * 0.000002 * 300 = 0.0018
    agg.ingest(&mkrec(0, "/slow", 700.0, 10.0));
    agg.ingest(&mkrec(1, "/slow", 800.0, 10.0));
    agg.ingest(&mkrec(2, "/slow", 900.0, 10.0));
    // avg exactly 500 contributes nothing
    agg.ingest(&mkrec(3, "/edge", 500.0, 10.0));
    agg.ingest(&mkrec(4, "/fast", 10.0, 10.0));
    let aggs = agg.finish();
    let analysis = cost_analysis(&aggs, &model, &ladder);
    assert!(analysis.optimization_potential_usd == 0.0018);
    assert!(analysis.cost_breakdown.request_costs == 0.0005);

    let empty = RunningAggregator::new().finish();
    let analysis = cost_analysis(&empty, &model, &ladder);
    assert!(analysis.total_cost_usd == 0.0);
    assert!(analysis.optimization_potential_usd == 0.0);
    assert!(analysis.cost_by_endpoint.is_empty());
}
