/// Traffic printers: requests by hour of day, and the heaviest users.
///
/// The hourly listing always has 24 rows, `00:00` through `23:00` UTC, including the hours with no
/// requests.  The user listing is ordered by descending request count; users with equal counts are
/// listed in the order they first appeared in the input.
use crate::format;

use accesslog::UserCount;
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::io;

pub fn print_hourly(
    output: &mut dyn io::Write,
    fmt: &Option<String>,
    hourly: &BTreeMap<String, usize>,
) -> Result<()> {
    let (formatters, aliases) = hourly_formatters();
    let spec = fmt.as_deref().unwrap_or(HOURLY_DEFAULTS);
    let (fields, others) = format::parse_fields(spec, &formatters, &aliases)?;
    let opts = format::standard_options(&others);
    let rows = hourly
        .iter()
        .map(|(h, n)| (h.clone(), *n))
        .collect::<Vec<(String, usize)>>();
    format::format_data(output, &fields, &formatters, &opts, &rows)
}

pub fn hourly_help() -> format::Help {
    let (formatters, aliases) = hourly_formatters();
    format::make_help(&formatters, &aliases, HOURLY_DEFAULTS)
}

const HOURLY_DEFAULTS: &str = "hour,requests";

type HourDatum<'a> = &'a (String, usize);

fn hourly_formatters() -> (
    HashMap<String, &'static dyn Fn(HourDatum) -> String>,
    HashMap<String, Vec<String>>,
) {
    let mut formatters: HashMap<String, &'static dyn Fn(HourDatum) -> String> = HashMap::new();
    formatters.insert("hour".to_string(), &format_hour);
    formatters.insert("requests".to_string(), &format_hour_requests);
    (formatters, HashMap::new())
}

fn format_hour(r: HourDatum) -> String {
    r.0.clone()
}

fn format_hour_requests(r: HourDatum) -> String {
    r.1.to_string()
}

pub fn print_users(
    output: &mut dyn io::Write,
    fmt: &Option<String>,
    users: &[UserCount],
) -> Result<()> {
    let (formatters, aliases) = user_formatters();
    let spec = fmt.as_deref().unwrap_or(USER_DEFAULTS);
    let (fields, others) = format::parse_fields(spec, &formatters, &aliases)?;
    let opts = format::standard_options(&others);
    format::format_data(output, &fields, &formatters, &opts, users)
}

pub fn users_help() -> format::Help {
    let (formatters, aliases) = user_formatters();
    format::make_help(&formatters, &aliases, USER_DEFAULTS)
}

const USER_DEFAULTS: &str = "user,requests";

type UserDatum<'a> = &'a UserCount;

fn user_formatters() -> (
    HashMap<String, &'static dyn Fn(UserDatum) -> String>,
    HashMap<String, Vec<String>>,
) {
    let mut formatters: HashMap<String, &'static dyn Fn(UserDatum) -> String> = HashMap::new();
    formatters.insert("user".to_string(), &format_user);
    formatters.insert("requests".to_string(), &format_user_requests);
    (formatters, HashMap::new())
}

fn format_user(u: UserDatum) -> String {
    u.user_id.to_string()
}

fn format_user_requests(u: UserDatum) -> String {
    u.request_count.to_string()
}

#[test]
fn test_print_hourly() {
    let mut hourly = BTreeMap::new();
    for h in 0..24 {
        hourly.insert(format!("{h:02}:00"), if h == 10 { 7 } else { 0 });
    }
    let mut out = vec![];
    print_hourly(&mut out, &Some("awk".to_string()), &hourly).unwrap_err();
    print_hourly(&mut out, &Some("hour,requests,awk".to_string()), &hourly).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.lines().count() == 24);
    assert!(text.lines().nth(10) == Some("10:00 7"));
}

#[test]
fn test_print_users() {
    use ustr::Ustr;

    let users = vec![
        UserCount {
            user_id: Ustr::from("alice"),
            request_count: 12,
        },
        UserCount {
            user_id: Ustr::from("bob"),
            request_count: 3,
        },
    ];
    let mut out = vec![];
    print_users(&mut out, &None, &users).unwrap();
    assert!(String::from_utf8(out).unwrap() == "user   requests\nalice  12\nbob    3\n");
}
