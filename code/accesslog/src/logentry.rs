use logutils::Timestamp;
use ustr::Ustr;

/// The LogRecord structure holds a validated and normalized access-log record: the timestamp is in
/// UTC, the numeric fields are finite and non-negative, the method is upper-case, and none of the
/// string fields is empty.  Records that could not be brought into this form never get this far;
/// see normalize.rs.
///
/// We allocate very many of these, and the endpoint, method and user strings repeat a lot, so they
/// are interned as Ustr.

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: Timestamp,

    /// The logical route the request was made to, eg `/api/users`.  This is the grouping key for
    /// nearly everything.
    pub endpoint: Ustr,

    pub method: Ustr,

    /// HTTP status code.
    pub status: u16,

    pub response_time_ms: f64,

    pub response_size_bytes: f64,

    pub user_id: Ustr,
}

impl LogRecord {
    pub fn is_error(&self) -> bool {
        is_error_status(self.status)
    }
}

/// Any 4xx or 5xx status (or anything above) counts as an error.

pub fn is_error_status(status: u16) -> bool {
    status >= 400
}

#[test]
fn test_is_error() {
    assert!(!is_error_status(200));
    assert!(!is_error_status(304));
    assert!(is_error_status(400));
    assert!(is_error_status(404));
    assert!(is_error_status(503));
}
