// Misc utilities useful to both accesslog and apialyze.

mod configs;
mod dates;

// The analysis configuration: severity thresholds, cost constants, anomaly thresholds.  Every field
// has a documented default, so a run never needs a configuration file.

pub use configs::AnalysisConfig;
pub use configs::AnomalyConfig;
pub use configs::CostConfig;
pub use configs::MemoryBracket;
pub use configs::SeverityLadder;
pub use configs::SeverityThresholds;

// Configuration problems that must stop a run before any record is processed.

pub use configs::ConfigError;

// Read a configuration file, starting from the defaults, and validate the result.

pub use configs::read_analysis_config;

// Apply the fields of an already-parsed JSON configuration object to a configuration.

pub use configs::apply_config_json;

// Types and utilities for manipulating timestamps.

pub use dates::Timestamp;

// The time right now.

pub use dates::now;

// Parse a &str into a Timestamp.  Offsets are honored and the result is in UTC; a timestamp without
// an offset is taken to be UTC.

pub use dates::parse_timestamp;

// Given year, month, day, hour, minute, second (all UTC), return a Timestamp.

pub use dates::timestamp_from_ymdhms;

// The UTC hour of the day, 0..24.

pub use dates::hour_of_day;

// Render a timestamp as RFC 3339 with a `Z` suffix, and the serde adapters for doing the same.

pub use dates::format_timestamp;
pub use dates::serialize_timestamp;
pub use dates::serialize_opt_timestamp;

// Parse a duration on the form WwDdHhMmSs, all parts optional but at least one present.

pub use dates::parse_duration;
