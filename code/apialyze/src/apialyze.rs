/// `apialyze` -- Analyze API access logs.
///
/// (What follows is the best documentation we have right now.  Do read it, since there are
/// non-obvious aspects.  Also run `apialyze help` and `apialyze <command> --help`.)
///
///
/// QUICK START
///
/// Read one or more log files, filter the records, aggregate them in one pass, and present a view
/// of the aggregates:
///
///   apialyze report access-2025-01-15.jsonl
///   apialyze endpoints --endpoint /api/users access.json
///   apialyze anomalies --window 10m --spike-multiplier 4 access.csv
///   apialyze cost --fmt=endpoint,total,csv access.json
///   cat access.jsonl | apialyze users --top 10
///
///
/// OVERALL USAGE
///
///   apialyze operation [options] [file ...]
///
/// where the operation is one of
///
///  - `report`: print the full analysis report as JSON
///  - `endpoints`: per-endpoint statistics as a table
///  - `anomalies`: anomaly findings as a table
///  - `cost`: per-endpoint cost estimates as a table
///  - `hourly`: requests per hour of day (UTC) as a table
///  - `users`: the users with the most requests as a table
///  - `version`: print the version number
///
/// Run apialyze with the operation and `--help` to get help about options for the operation.
///
///
/// INPUT
///
/// The files are JSON arrays of record objects, JSON Lines, or CSV with a header row.  The format
/// is determined from the file name extension (.jsonl, .ndjson, .csv) or else from the first
/// character of the contents, unless `--format` says otherwise.  `-`, or no file at all, means
/// stdin.
///
/// A record that cannot be used (missing fields, negative numbers, bad timestamps, and so on) is
/// dropped and counted; the count is in the report's summary, and `-v -v` logs the reasons.  An
/// unreadable file, or a JSON array file that is not valid JSON, stops the program.
///
///
/// RECORD FILTER OPTIONS
///
/// All filters are optional.  Records must match all specified filters for the record to be
/// included.
///
///   --endpoint <pattern>
///     Select records whose endpoint matches the pattern.  `*` matches within one path segment, and
///     `[1,3-5]` matches any of the numbers.  A pattern also matches everything below it, so
///     `/api/users` matches `/api/users/1234`.  Repeatable.  Default: all endpoints.
///
///   --user <user>, --exclude-user <user>
///     Select records for the user, or drop records for the user.  Repeatable.
///
///   --method <method>
///     Select records with this HTTP method.  Repeatable.  Default: all methods.
///
///   --from <time>, -f <time>
///   --to <time>, -t <time>
///     Select records in the time range [from, to).  The time is YYYY-MM-DD (UTC; for --to, the
///     end of that day) or Nd or Nw for N days or weeks ago.  Default: unbounded.
///
///
/// CONFIGURATION OPTIONS
///
///   --config-file <filename>
///     Read severity thresholds, cost constants and anomaly thresholds from this JSON file (see
///     logutils/src/configs.rs for the format).  Every setting has a default.
///
///   --window <duration>, --spike-multiplier <number>, --error-cluster-threshold <count>
///     Override the anomaly window (eg `5m`, `1h30m`), the request-spike multiplier, and the number
///     of errors in one window that make an error cluster.
///
/// An invalid configuration (eg thresholds that are not increasing, or negative costs) stops the
/// program before any file is read.
///
///
/// OUTPUT
///
/// The table operations take `--fmt=<field>,...` to select fields and an output form: fixed-width
/// columns with a header (the default), `csv`, `csvnamed`, `json` or `awk`.  Use `--fmt=help` to
/// list the fields for an operation.
mod anomaly;
mod cost;
mod filter;
mod format;
mod issues;
mod pranomalies;
mod prcost;
mod prendpoints;
mod prtraffic;
mod report;
mod window;

use accesslog::{
    parse_logfile, Aggregates, InputFormat, LogRecord, RecordNormalizer, RunningAggregator,
};
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use filter::{parse_time, RecordFilter};
use logutils::{parse_duration, read_analysis_config, AnalysisConfig};
use std::io;
use std::process;
use std::str::FromStr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "apialyze")]
#[command(about = "Analyze API access logs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the full analysis report as JSON
    Report(ReportArgs),

    /// Print per-endpoint statistics
    Endpoints(TableArgs),

    /// Print anomaly findings
    Anomalies(TableArgs),

    /// Print cost estimates per endpoint
    Cost(TableArgs),

    /// Print the number of requests per hour of day (UTC)
    Hourly(TableArgs),

    /// Print the users with the most requests
    Users(UsersArgs),

    /// Print version information
    Version,
}

#[derive(Args, Debug)]
struct ReportArgs {
    #[command(flatten)]
    analysis_args: AnalysisArgs,

    /// Print the report on one line
    #[arg(long, default_value_t = false)]
    compact: bool,
}

#[derive(Args, Debug)]
struct TableArgs {
    #[command(flatten)]
    analysis_args: AnalysisArgs,

    #[command(flatten)]
    print_args: TablePrintArgs,
}

#[derive(Args, Debug)]
struct UsersArgs {
    #[command(flatten)]
    analysis_args: AnalysisArgs,

    #[command(flatten)]
    print_args: TablePrintArgs,

    /// Print this many users
    #[arg(long, default_value_t = report::TOP_USERS)]
    top: usize,
}

#[derive(Args, Debug)]
struct AnalysisArgs {
    #[command(flatten)]
    source_args: SourceArgs,

    #[command(flatten)]
    record_filter_args: RecordFilterArgs,

    #[command(flatten)]
    config_args: ConfigArgs,

    #[command(flatten)]
    meta_args: MetaArgs,
}

#[derive(Args, Debug)]
pub struct SourceArgs {
    /// Input format: auto, json, jsonl or csv [default: auto]
    #[arg(long)]
    format: Option<String>,

    /// Log files to read, `-` for stdin [default: -]
    files: Vec<String>,
}

#[derive(Args, Debug)]
pub struct RecordFilterArgs {
    /// Select records for endpoints matching this pattern (repeatable) [default: all]
    #[arg(long)]
    endpoint: Vec<String>,

    /// Select records for this user (repeatable) [default: all]
    #[arg(long)]
    user: Vec<String>,

    /// Exclude records for this user (repeatable) [default: none]
    #[arg(long)]
    exclude_user: Vec<String>,

    /// Select records with this HTTP method (repeatable) [default: all]
    #[arg(long)]
    method: Vec<String>,

    /// Select records with this time or later, format `YYYY-MM-DD`, `Nd` (days ago) or `Nw`
    /// (weeks ago) [default: unbounded]
    #[arg(long, short)]
    from: Option<String>,

    /// Select records before this time (the end of the day for `YYYY-MM-DD`), format as for --from
    /// [default: unbounded]
    #[arg(long, short)]
    to: Option<String>,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Read analysis configuration from this JSON file
    #[arg(long)]
    config_file: Option<String>,

    /// Sliding window for spikes and error clusters, format `WwDdHhMmSs` with all parts optional
    /// [default: 5m]
    #[arg(long)]
    window: Option<String>,

    /// A window is a request spike if it has more than this many times the baseline requests
    /// [default: 3]
    #[arg(long)]
    spike_multiplier: Option<f64>,

    /// A window with this many errors is an error cluster [default: 10]
    #[arg(long)]
    error_cluster_threshold: Option<usize>,
}

#[derive(Args, Debug)]
pub struct MetaArgs {
    /// Print progress and statistics on stderr; repeat for more detail
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Args, Debug)]
pub struct TablePrintArgs {
    /// Select fields and format for the output [use --fmt=help to get help]
    #[arg(long)]
    fmt: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(msg) = apialyze(&cli) {
        eprintln!("ERROR: {}", msg);
        process::exit(1);
    }
}

fn apialyze(cli: &Cli) -> Result<()> {
    let output = &mut io::stdout();

    match &cli.command {
        Commands::Version => {
            println!("apialyze version {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }

        Commands::Report(args) => {
            let (aggs, config) = load(&args.analysis_args)?;
            let report = report::build_report(&aggs, &config);
            if args.compact {
                serde_json::to_writer(&mut *output, &report)?;
            } else {
                serde_json::to_writer_pretty(&mut *output, &report)?;
            }
            println!();
            Ok(())
        }

        Commands::Endpoints(args) => {
            if format::maybe_help(&args.print_args.fmt, prendpoints::fmt_help) {
                return Ok(());
            }
            let (aggs, _) = load(&args.analysis_args)?;
            prendpoints::print_endpoints(output, &args.print_args.fmt, &aggs.endpoint_stats())
        }

        Commands::Anomalies(args) => {
            if format::maybe_help(&args.print_args.fmt, pranomalies::fmt_help) {
                return Ok(());
            }
            let (aggs, config) = load(&args.analysis_args)?;
            let findings = anomaly::detect_anomalies(&aggs, &config.anomaly);
            pranomalies::print_anomalies(output, &args.print_args.fmt, &findings)
        }

        Commands::Cost(args) => {
            if format::maybe_help(&args.print_args.fmt, prcost::fmt_help) {
                return Ok(());
            }
            let (aggs, config) = load(&args.analysis_args)?;
            let analysis = cost::cost_analysis(
                &aggs,
                &cost::CostModel::new(&config.cost),
                &config.severity.response_time_ms,
            );
            prcost::print_cost(output, &args.print_args.fmt, &analysis)
        }

        Commands::Hourly(args) => {
            if format::maybe_help(&args.print_args.fmt, prtraffic::hourly_help) {
                return Ok(());
            }
            let (aggs, _) = load(&args.analysis_args)?;
            prtraffic::print_hourly(output, &args.print_args.fmt, &aggs.hourly_distribution())
        }

        Commands::Users(args) => {
            if format::maybe_help(&args.print_args.fmt, prtraffic::users_help) {
                return Ok(());
            }
            let (aggs, _) = load(&args.analysis_args)?;
            prtraffic::print_users(output, &args.print_args.fmt, &aggs.top_users(args.top))
        }
    }
}

fn init_logging(meta_args: &MetaArgs) {
    let level = match meta_args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // RUST_LOG, if set, wins.
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init();
}

fn build_config(config_args: &ConfigArgs) -> Result<AnalysisConfig> {
    let mut config = if let Some(ref filename) = config_args.config_file {
        read_analysis_config(filename)?
    } else {
        AnalysisConfig::default()
    };
    if let Some(ref w) = config_args.window {
        config.anomaly.window = parse_duration(w)
            .map_err(|e| anyhow::anyhow!("Bad --window value '{w}': {e}"))?;
    }
    if let Some(m) = config_args.spike_multiplier {
        config.anomaly.spike_multiplier = m;
    }
    if let Some(n) = config_args.error_cluster_threshold {
        config.anomaly.error_cluster_threshold = n;
    }
    config.validate()?;
    Ok(config)
}

fn build_filter(filter_args: &RecordFilterArgs) -> Result<RecordFilter> {
    let from = match filter_args.from {
        Some(ref s) => Some(parse_time(s, false)?),
        None => None,
    };
    let to = match filter_args.to {
        Some(ref s) => Some(parse_time(s, true)?),
        None => None,
    };
    RecordFilter::new(
        &filter_args.endpoint,
        &filter_args.user,
        &filter_args.exclude_user,
        &filter_args.method,
        from,
        to,
    )
}

// Configuration and filter problems are reported before any input is read.  After that, the files
// are read in order and every record that passes the filter is aggregated.

fn load(args: &AnalysisArgs) -> Result<(Aggregates, AnalysisConfig)> {
    init_logging(&args.meta_args);
    let config = build_config(&args.config_args)?;
    let filter = build_filter(&args.record_filter_args)?;
    let format = match args.source_args.format {
        Some(ref f) => InputFormat::from_str(f)?,
        None => InputFormat::Auto,
    };
    let files = if args.source_args.files.is_empty() {
        vec!["-".to_string()]
    } else {
        args.source_args.files.clone()
    };

    let cost_model = cost::CostModel::new(&config.cost);
    let mut running_cost = cost::RequestCost::default();
    let mut normalizer = RecordNormalizer::new();
    let mut aggregator = RunningAggregator::new();
    let mut filtered = 0usize;
    for file in &files {
        tracing::info!("Reading {file}");
        let mut sink = |r: LogRecord| {
            if filter.accepts(&r) {
                running_cost += cost_model.cost_for(&r);
                aggregator.ingest(&r);
            } else {
                filtered += 1;
            }
        };
        parse_logfile(file, format, &mut normalizer, &mut sink)?;
    }
    normalizer.log_tallies();
    tracing::info!(
        "{} records accepted, {} filtered out, {} rejected, estimated cost {} USD",
        aggregator.accepted(),
        filtered,
        normalizer.rejected(),
        cost::round6(running_cost.total().usd())
    );
    aggregator.add_rejected(normalizer.rejected());
    let aggs = aggregator.finish();
    // The report costs the aggregates after the fact; that must agree with the running total.
    debug_assert_eq!(
        running_cost,
        aggs.endpoints()
            .iter()
            .fold(cost::RequestCost::default(), |mut acc, agg| {
                acc += cost_model.cost_for_aggregate(agg).cost;
                acc
            })
    );
    Ok((aggs, config))
}

#[cfg(test)]
fn analysis_args(files: Vec<String>, window: Option<String>) -> AnalysisArgs {
    AnalysisArgs {
        source_args: SourceArgs {
            format: None,
            files,
        },
        record_filter_args: RecordFilterArgs {
            endpoint: vec![],
            user: vec![],
            exclude_user: vec!["bot".to_string()],
            method: vec![],
            from: None,
            to: None,
        },
        config_args: ConfigArgs {
            config_file: None,
            window,
            spike_multiplier: None,
            error_cluster_threshold: None,
        },
        meta_args: MetaArgs { verbose: 0 },
    }
}

#[test]
fn test_load() {
    use std::io::Write;

    let mut f = tempfile::Builder::new().suffix(".jsonl").tempfile().unwrap();
    for (i, (user, rt, size)) in [("u1", 120.0, 100), ("bot", 5.0, 100), ("u2", 640.5, 5000)]
        .iter()
        .enumerate()
    {
        writeln!(
            f,
            r#"{{"timestamp": "2025-01-15T10:00:0{i}Z", "endpoint": "/a", "method": "GET", "status_code": 200, "response_time_ms": {rt}, "response_size_bytes": {size}, "user_id": "{user}"}}"#
        )
        .unwrap();
    }
    writeln!(f, "not json").unwrap();
    let name = f.path().to_str().unwrap().to_string();

    let (aggs, config) = load(&analysis_args(vec![name.clone()], Some("10m".to_string()))).unwrap();
    assert!(aggs.accepted() == 2);
    assert!(aggs.rejected() == 1);
    assert!(config.anomaly.window.num_minutes() == 10);
    let analysis = cost::cost_analysis(
        &aggs,
        &cost::CostModel::new(&config.cost),
        &config.severity.response_time_ms,
    );
    // 2 * 0.0001 + 760.5 * 0.000002 + 0.00001 + 0.00005
    assert!(analysis.total_cost_usd == 0.001781);

    // A window that does not fit is refused before anything is read.
    assert!(load(&analysis_args(vec![name], Some("100000000000000000w".to_string()))).is_err());
    assert!(load(&analysis_args(vec![], Some("5000w".to_string()))).is_err());
}
