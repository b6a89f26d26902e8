/// An access log is a sequence of *log records*, one per HTTP request served by an API: when the
/// request arrived, which endpoint and method it was for, the status returned, how long it took,
/// how large the response was, and which user made it.  Log records are found in *log files*, which
/// are JSON arrays, JSON Lines, or CSV.
///
/// Log files come from many sources and are frequently dirty: fields are missing or of the wrong
/// type, numbers are negative, timestamps are in odd formats or local time, lines are truncated.
/// The file need not be sorted in any particular way.
///
/// This library has as its fundamental task to turn raw log files into a single aggregate view that
/// later analyses can query.  This task breaks down into a number of subtasks:
///
/// - Parse the log files, handling the three formats transparently.
///
/// - Validate and coerce every record into a LogRecord, counting and dropping the ones that cannot
///   be saved.
///
/// - Filter records by endpoint, user, method and time, as the application desires.
///
/// - Aggregate the surviving records in a single pass, per endpoint, per hour of day, and per user,
///   retaining the time-ordered per-endpoint sequences that the window analyses need.
mod aggregate;
mod endpointglob;
mod logentry;
mod logfile;
mod normalize;

// A validated log record, and the error predicate on status codes.

pub use logentry::LogRecord;
pub use logentry::is_error_status;

// Input formats and the readers for them.  A reader passes every valid record to an
// application-defined sink in input order.

pub use logfile::InputFormat;
pub use logfile::parse_logfile;
pub use logfile::parse_records;

// Validation and coercion of raw JSON records, with tallies of what was rejected and why.

pub use normalize::normalize_record;
pub use normalize::RecordNormalizer;
pub use normalize::RejectReason;

// Matching endpoints against glob patterns, for record filtering.

pub use endpointglob::EndpointGlobber;

// Single-pass aggregation.  A RunningAggregator is fed records and then finished into an immutable
// Aggregates, from which all the statistical views are projected.

pub use aggregate::RunningAggregator;
pub use aggregate::Aggregates;
pub use aggregate::EndpointAggregate;
pub use aggregate::Sample;

// The statistical views.

pub use aggregate::EndpointStats;
pub use aggregate::Summary;
pub use aggregate::TimeRange;
pub use aggregate::UserCount;

// Round to the three decimals used throughout the report.

pub use aggregate::round3;
