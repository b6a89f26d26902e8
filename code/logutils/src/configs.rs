/// Read analysis configuration data from a json file.
///
/// The file holds an object { ... } with the following optional sections, each an object, and
/// optional fields within them.  Every field has a default (given in brackets), so an empty object
/// is a valid configuration, and so is having no file at all.
///
///   severity
///     response_time_ms - object {medium, high, critical}, average response time boundaries
///                        in ms, strictly increasing [500, 1000, 2000]
///     error_rate_percent - object {medium, high, critical}, error rate boundaries in percent,
///                        strictly increasing [5, 10, 15]
///
///   cost
///     per_request_usd - number, fixed cost per request [0.0001]
///     per_ms_execution_usd - number, cost per millisecond of response time [0.000002]
///     memory_brackets - array of objects {from_bytes, to_bytes, usd}, where to_bytes may be
///                       omitted for the last, open-ended bracket.  Brackets are ordered and may not
///                       overlap.  A response size falls in the bracket where
///                       from_bytes <= size < to_bytes.
///                       [0-1KB: 0.00001, 1KB-10KB: 0.00005, 10KB and up: 0.0001]
///
///   anomaly
///     window_minutes - number, the sliding window for spikes and error clusters [5]
///     spike_multiplier - number, how many times the baseline rate a window must exceed [3.0]
///     degradation_ratio - number, how many times the overall mean the recent mean must exceed [2.0]
///     recent_fraction - number in (0,1], the most recent share of requests examined [0.1]
///     error_cluster_threshold - integer, errors within one window that make a cluster [10]
///     user_share_threshold - number in (0,1), the share of an endpoint's traffic above which a
///                            single user is unusual [0.5]
///
/// Any field name starting with '#' is reserved for arbitrary comments.  Unknown fields are ignored.
///
/// Since the input is human-generated and every field is optional, I've opted to use the generic
/// JSON parser followed by explicit decoding of the fields, rather than a (derived) strongly-typed
/// parser.
use anyhow::{bail, Result};
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path;
use thiserror::Error;

// Longest accepted anomaly window.
const MAX_WINDOW_DAYS: i64 = 30;

/// Three boundaries of a severity classification.  A value strictly above `medium` is at least of
/// medium severity, and so on up.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeverityLadder {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeverityThresholds {
    pub response_time_ms: SeverityLadder,
    pub error_rate_percent: SeverityLadder,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryBracket {
    pub from_bytes: f64,
    /// None for the open-ended last bracket.
    pub to_bytes: Option<f64>,
    pub usd: f64,
}

impl MemoryBracket {
    pub fn contains(&self, bytes: f64) -> bool {
        self.from_bytes <= bytes && self.to_bytes.map_or(true, |hi| bytes < hi)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostConfig {
    pub per_request_usd: f64,
    pub per_ms_execution_usd: f64,
    pub memory_brackets: Vec<MemoryBracket>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyConfig {
    pub window: chrono::Duration,
    pub spike_multiplier: f64,
    pub degradation_ratio: f64,
    pub recent_fraction: f64,
    pub error_cluster_threshold: usize,
    pub user_share_threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    pub severity: SeverityThresholds,
    pub cost: CostConfig,
    pub anomaly: AnomalyConfig,
}

impl Default for SeverityThresholds {
    fn default() -> SeverityThresholds {
        SeverityThresholds {
            response_time_ms: SeverityLadder {
                medium: 500.0,
                high: 1000.0,
                critical: 2000.0,
            },
            error_rate_percent: SeverityLadder {
                medium: 5.0,
                high: 10.0,
                critical: 15.0,
            },
        }
    }
}

impl Default for CostConfig {
    fn default() -> CostConfig {
        CostConfig {
            per_request_usd: 0.0001,
            per_ms_execution_usd: 0.000002,
            memory_brackets: vec![
                MemoryBracket {
                    from_bytes: 0.0,
                    to_bytes: Some(1024.0),
                    usd: 0.00001,
                },
                MemoryBracket {
                    from_bytes: 1024.0,
                    to_bytes: Some(10.0 * 1024.0),
                    usd: 0.00005,
                },
                MemoryBracket {
                    from_bytes: 10.0 * 1024.0,
                    to_bytes: None,
                    usd: 0.0001,
                },
            ],
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> AnomalyConfig {
        AnomalyConfig {
            window: chrono::Duration::minutes(5),
            spike_multiplier: 3.0,
            degradation_ratio: 2.0,
            recent_fraction: 0.1,
            error_cluster_threshold: 10,
            user_share_threshold: 0.5,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> AnalysisConfig {
        AnalysisConfig {
            severity: Default::default(),
            cost: Default::default(),
            anomaly: Default::default(),
        }
    }
}

/// Configuration values that would silently corrupt every downstream figure.

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Thresholds for {0} must be finite and strictly increasing (0 <= medium < high < critical)")]
    InvertedThresholds(&'static str),

    #[error("Cost constant '{0}' must be finite and non-negative")]
    NegativeCost(&'static str),

    #[error("Memory bracket {index} is invalid: {reason}")]
    BadBracket { index: usize, reason: &'static str },

    #[error("Anomaly setting '{field}' is {value}, it must be {expected}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: &'static str,
    },
}

impl SeverityLadder {
    fn validate(&self, what: &'static str) -> Result<(), ConfigError> {
        let ok = [self.medium, self.high, self.critical]
            .iter()
            .all(|x| x.is_finite())
            && 0.0 <= self.medium
            && self.medium < self.high
            && self.high < self.critical;
        if ok {
            Ok(())
        } else {
            Err(ConfigError::InvertedThresholds(what))
        }
    }
}

fn max_window() -> chrono::Duration {
    chrono::Duration::days(MAX_WINDOW_DAYS)
}

fn check_cost(value: f64, name: &'static str) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NegativeCost(name))
    }
}

fn check_positive(value: f64, field: &'static str) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            expected: "positive",
        })
    }
}

impl AnalysisConfig {
    /// Check everything that can be checked before the first record is looked at.

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.severity.response_time_ms.validate("response_time_ms")?;
        self.severity.error_rate_percent.validate("error_rate_percent")?;

        check_cost(self.cost.per_request_usd, "per_request_usd")?;
        check_cost(self.cost.per_ms_execution_usd, "per_ms_execution_usd")?;
        let mut prev_end = Some(0.0);
        for (index, b) in self.cost.memory_brackets.iter().enumerate() {
            check_cost(b.usd, "memory_brackets.usd")?;
            if !b.from_bytes.is_finite() || b.from_bytes < 0.0 {
                return Err(ConfigError::BadBracket {
                    index,
                    reason: "from_bytes must be finite and non-negative",
                });
            }
            if let Some(hi) = b.to_bytes {
                if !hi.is_finite() || hi <= b.from_bytes {
                    return Err(ConfigError::BadBracket {
                        index,
                        reason: "to_bytes must be finite and greater than from_bytes",
                    });
                }
            }
            match prev_end {
                None => {
                    return Err(ConfigError::BadBracket {
                        index,
                        reason: "follows an open-ended bracket",
                    })
                }
                Some(end) if index > 0 && b.from_bytes < end => {
                    return Err(ConfigError::BadBracket {
                        index,
                        reason: "overlaps the previous bracket",
                    })
                }
                _ => {}
            }
            prev_end = b.to_bytes;
        }

        let a = &self.anomaly;
        if a.window <= chrono::Duration::zero() || a.window > max_window() {
            return Err(ConfigError::OutOfRange {
                field: "window",
                value: a.window.num_milliseconds() as f64 / 60000.0,
                expected: "positive and at most 30 days",
            });
        }
        check_positive(a.spike_multiplier, "spike_multiplier")?;
        check_positive(a.degradation_ratio, "degradation_ratio")?;
        if !(a.recent_fraction > 0.0 && a.recent_fraction <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "recent_fraction",
                value: a.recent_fraction,
                expected: "in (0,1]",
            });
        }
        if a.error_cluster_threshold == 0 {
            return Err(ConfigError::OutOfRange {
                field: "error_cluster_threshold",
                value: 0.0,
                expected: "at least 1",
            });
        }
        if !(a.user_share_threshold > 0.0 && a.user_share_threshold < 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "user_share_threshold",
                value: a.user_share_threshold,
                expected: "in (0,1)",
            });
        }
        Ok(())
    }
}

/// Returns the default configuration updated with the file's contents, or an error message.  The
/// result has been validated.

pub fn read_analysis_config(filename: &str) -> Result<AnalysisConfig> {
    let file = File::open(path::Path::new(filename))?;
    let reader = BufReader::new(file);
    let v = serde_json::from_reader(reader)?;
    let mut cfg: AnalysisConfig = Default::default();
    apply_config_json(&mut cfg, &v)?;
    cfg.validate()?;
    tracing::debug!("Configuration from {filename}: {:?}", cfg);
    Ok(cfg)
}

/// Update `cfg` with the fields present in `v`.  This does not validate the result.

pub fn apply_config_json(cfg: &mut AnalysisConfig, v: &Value) -> Result<()> {
    let Value::Object(fields) = v else {
        bail!("Expected an object value")
    };
    if let Some(sev) = grab_object_opt(fields, "severity")? {
        if let Some(l) = grab_object_opt(sev, "response_time_ms")? {
            apply_ladder(&mut cfg.severity.response_time_ms, l)?;
        }
        if let Some(l) = grab_object_opt(sev, "error_rate_percent")? {
            apply_ladder(&mut cfg.severity.error_rate_percent, l)?;
        }
    }
    if let Some(cost) = grab_object_opt(fields, "cost")? {
        if let Some(x) = grab_f64_opt(cost, "per_request_usd")? {
            cfg.cost.per_request_usd = x;
        }
        if let Some(x) = grab_f64_opt(cost, "per_ms_execution_usd")? {
            cfg.cost.per_ms_execution_usd = x;
        }
        if let Some(val) = cost.get("memory_brackets") {
            let Value::Array(objs) = val else {
                bail!("Field 'memory_brackets' must have an array value")
            };
            cfg.cost.memory_brackets = process_brackets(objs)?;
        }
    }
    if let Some(anomaly) = grab_object_opt(fields, "anomaly")? {
        let a = &mut cfg.anomaly;
        if let Some(x) = grab_f64_opt(anomaly, "window_minutes")? {
            let Some(w) = chrono::Duration::try_milliseconds((x * 60000.0).round() as i64) else {
                bail!("Field 'window_minutes' is out of range")
            };
            a.window = w;
        }
        if let Some(x) = grab_f64_opt(anomaly, "spike_multiplier")? {
            a.spike_multiplier = x;
        }
        if let Some(x) = grab_f64_opt(anomaly, "degradation_ratio")? {
            a.degradation_ratio = x;
        }
        if let Some(x) = grab_f64_opt(anomaly, "recent_fraction")? {
            a.recent_fraction = x;
        }
        if let Some(x) = grab_usize_opt(anomaly, "error_cluster_threshold")? {
            a.error_cluster_threshold = x;
        }
        if let Some(x) = grab_f64_opt(anomaly, "user_share_threshold")? {
            a.user_share_threshold = x;
        }
    }
    Ok(())
}

fn apply_ladder(ladder: &mut SeverityLadder, fields: &serde_json::Map<String, Value>) -> Result<()> {
    if let Some(x) = grab_f64_opt(fields, "medium")? {
        ladder.medium = x;
    }
    if let Some(x) = grab_f64_opt(fields, "high")? {
        ladder.high = x;
    }
    if let Some(x) = grab_f64_opt(fields, "critical")? {
        ladder.critical = x;
    }
    Ok(())
}

fn process_brackets(objs: &[Value]) -> Result<Vec<MemoryBracket>> {
    let mut brackets = vec![];
    for obj in objs {
        let Value::Object(fields) = obj else {
            bail!("Expected an object value")
        };
        brackets.push(MemoryBracket {
            from_bytes: grab_f64(fields, "from_bytes")?,
            to_bytes: grab_f64_opt(fields, "to_bytes")?,
            usd: grab_f64(fields, "usd")?,
        });
    }
    Ok(brackets)
}

fn grab_object_opt<'a>(
    fields: &'a serde_json::Map<String, Value>,
    name: &str,
) -> Result<Option<&'a serde_json::Map<String, Value>>> {
    match fields.get(name) {
        Some(Value::Object(o)) => Ok(Some(o)),
        Some(_) => bail!("Field '{name}' must have an object value"),
        None => Ok(None),
    }
}

fn grab_f64(fields: &serde_json::Map<String, Value>, name: &str) -> Result<f64> {
    if let Some(n) = grab_f64_opt(fields, name)? {
        Ok(n)
    } else {
        bail!("Field '{name}' must be present and have a numeric value")
    }
}

fn grab_f64_opt(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Option<f64>> {
    match fields.get(name) {
        Some(Value::Number(n)) => {
            if let Some(x) = n.as_f64() {
                Ok(Some(x))
            } else {
                bail!("Field '{name}' must have a numeric value")
            }
        }
        Some(_) => bail!("Field '{name}' must have a numeric value"),
        None => Ok(None),
    }
}

fn grab_usize_opt(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Option<usize>> {
    if let Some(Value::Number(n)) = fields.get(name) {
        if let Some(n) = n.as_u64() {
            match usize::try_from(n) {
                Ok(n) => Ok(Some(n)),
                Err(_e) => {
                    bail!("Field '{name}' must have unsigned integer value")
                }
            }
        } else {
            bail!("Field '{name}' must have unsigned integer value")
        }
    } else if fields.contains_key(name) {
        bail!("Field '{name}' must have unsigned integer value")
    } else {
        Ok(None)
    }
}

#[test]
fn test_defaults_are_valid() {
    let cfg: AnalysisConfig = Default::default();
    assert!(cfg.validate().is_ok());
    assert!(cfg.severity.response_time_ms.medium == 500.0);
    assert!(cfg.anomaly.window.num_minutes() == 5);
    assert!(cfg.cost.memory_brackets.len() == 3);
    assert!(cfg.cost.memory_brackets[0].contains(0.0));
    assert!(!cfg.cost.memory_brackets[0].contains(1024.0));
    assert!(cfg.cost.memory_brackets[1].contains(1024.0));
    assert!(cfg.cost.memory_brackets[2].contains(1.0e12));
}

#[test]
fn test_config_partial() {
    let v: Value = serde_json::from_str(
        r##"{
          "#": "a comment",
          "severity": { "response_time_ms": { "medium": 300 } },
          "cost": { "per_request_usd": 0.001,
                    "memory_brackets": [ {"from_bytes": 0, "to_bytes": 2048, "usd": 0.0002},
                                         {"from_bytes": 2048, "usd": 0.0004} ] },
          "anomaly": { "window_minutes": 10, "error_cluster_threshold": 3, "unknown": true }
        }"##,
    )
    .unwrap();
    let mut cfg: AnalysisConfig = Default::default();
    apply_config_json(&mut cfg, &v).unwrap();
    assert!(cfg.validate().is_ok());
    assert!(cfg.severity.response_time_ms.medium == 300.0);
    assert!(cfg.severity.response_time_ms.high == 1000.0);
    assert!(cfg.cost.per_request_usd == 0.001);
    assert!(cfg.cost.per_ms_execution_usd == 0.000002);
    assert!(cfg.cost.memory_brackets.len() == 2);
    assert!(cfg.cost.memory_brackets[1].to_bytes.is_none());
    assert!(cfg.anomaly.window.num_minutes() == 10);
    assert!(cfg.anomaly.error_cluster_threshold == 3);
    assert!(cfg.anomaly.spike_multiplier == 3.0);
}

#[test]
fn test_config_bad_types() {
    let mut cfg: AnalysisConfig = Default::default();
    let v: Value = serde_json::from_str(r#"{"cost": {"per_request_usd": "cheap"}}"#).unwrap();
    assert!(apply_config_json(&mut cfg, &v).is_err());
    let v: Value = serde_json::from_str(r#"{"anomaly": {"error_cluster_threshold": 2.5}}"#).unwrap();
    assert!(apply_config_json(&mut cfg, &v).is_err());
    let v: Value = serde_json::from_str(r#"{"severity": []}"#).unwrap();
    assert!(apply_config_json(&mut cfg, &v).is_err());
    let v: Value = serde_json::from_str(r#"[]"#).unwrap();
    assert!(apply_config_json(&mut cfg, &v).is_err());
}

#[test]
fn test_config_invalid() {
    let mut cfg: AnalysisConfig = Default::default();
    cfg.severity.response_time_ms.high = 400.0;
    assert!(cfg.validate() == Err(ConfigError::InvertedThresholds("response_time_ms")));

    let mut cfg: AnalysisConfig = Default::default();
    cfg.cost.per_ms_execution_usd = -1.0;
    assert!(cfg.validate() == Err(ConfigError::NegativeCost("per_ms_execution_usd")));

    let mut cfg: AnalysisConfig = Default::default();
    cfg.cost.memory_brackets[1].from_bytes = 512.0;
    assert!(matches!(
        cfg.validate(),
        Err(ConfigError::BadBracket { index: 1, .. })
    ));

    let mut cfg: AnalysisConfig = Default::default();
    cfg.cost.memory_brackets.swap(1, 2);
    assert!(cfg.validate().is_err());

    let mut cfg: AnalysisConfig = Default::default();
    cfg.anomaly.window = chrono::Duration::zero();
    assert!(cfg.validate().is_err());

    let mut cfg: AnalysisConfig = Default::default();
    cfg.anomaly.window = chrono::Duration::days(31);
    assert!(matches!(
        cfg.validate(),
        Err(ConfigError::OutOfRange { field: "window", .. })
    ));

    let mut cfg: AnalysisConfig = Default::default();
    cfg.anomaly.recent_fraction = 1.5;
    assert!(cfg.validate().is_err());

    let mut cfg: AnalysisConfig = Default::default();
    cfg.anomaly.user_share_threshold = 1.0;
    assert!(cfg.validate().is_err());

    let mut cfg: AnalysisConfig = Default::default();
    cfg.anomaly.error_cluster_threshold = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_read_config_file() {
    use std::io::Write;

    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(br#"{"anomaly": {"spike_multiplier": 4.5}}"#).unwrap();
    let cfg = read_analysis_config(f.path().to_str().unwrap()).unwrap();
    assert!(cfg.anomaly.spike_multiplier == 4.5);

    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(br#"{"severity": {"error_rate_percent": {"medium": 20}}}"#)
        .unwrap();
    assert!(read_analysis_config(f.path().to_str().unwrap()).is_err());

    assert!(read_analysis_config("/nonexistent/apialyze-config.json").is_err());
}

#[test]
fn test_config_window_range() {
    let mut cfg: AnalysisConfig = Default::default();
    let v: Value = serde_json::from_str(r#"{"anomaly": {"window_minutes": -1e30}}"#).unwrap();
    assert!(apply_config_json(&mut cfg, &v).is_err());

    let v: Value = serde_json::from_str(r#"{"anomaly": {"window_minutes": 1e12}}"#).unwrap();
    apply_config_json(&mut cfg, &v).unwrap();
    assert!(cfg.validate().is_err());

    let v: Value = serde_json::from_str(r#"{"anomaly": {"window_minutes": 43200}}"#).unwrap();
    apply_config_json(&mut cfg, &v).unwrap();
    assert!(cfg.validate().is_ok());
}
