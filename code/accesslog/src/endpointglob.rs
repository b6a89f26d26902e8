/// Matcher for endpoint patterns.
///
/// An endpoint is a path of segments separated by `/`, eg `/api/users/1234`.  A pattern is an
/// endpoint in which
///
/// - `*` matches any run of characters within one segment (never a `/`);
///
/// - `[n,m-k,...]` matches any of the listed decimal numbers or ranges, so `/api/v[1-3]/users`
///   matches three API versions.
///
/// A prefix matcher accepts an endpoint if the pattern matches some whole-segment prefix of it, so
/// `/api/users` as a prefix pattern matches `/api/users` and `/api/users/1234` but not
/// `/api/userspace`.
use anyhow::{bail, Result};
use regex::Regex;

/// An `EndpointGlobber` holds a number of patterns, added with `insert`.  `match_endpoint` returns
/// true if any of them match.

pub struct EndpointGlobber {
    // If true, then the patterns are all constructed to match a prefix of an endpoint.
    is_prefix_matcher: bool,

    // Matcher + source pattern, for posterity.
    matchers: Vec<(Regex, String)>,
}

impl EndpointGlobber {
    /// Create a new, empty filter.

    pub fn new(is_prefix_matcher: bool) -> EndpointGlobber {
        EndpointGlobber {
            is_prefix_matcher,
            matchers: vec![],
        }
    }

    pub fn insert(&mut self, pattern: &str) -> Result<()> {
        self.matchers
            .push(compile_globber(pattern, self.is_prefix_matcher)?);
        Ok(())
    }

    /// Return true iff the filter has no patterns.

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    /// Match s against the patterns and return true iff it matches at least one pattern.

    pub fn match_endpoint(&self, s: &str) -> bool {
        self.matchers.iter().any(|m| m.0.is_match(s))
    }
}

fn compile_globber(p: &str, prefix: bool) -> Result<(Regex, String)> {
    let cs = p.chars().collect::<Vec<char>>();
    let mut i = 0usize;
    let mut r = "^".to_string();
    while i < cs.len() {
        if r.len() > 50000 {
            bail!("Expression too large, use more '*'")
        }
        match cs[i] {
            '*' => {
                i += 1;
                r += "[^/]*";
            }
            '[' => {
                i += 1;
                let mut set = vec![];
                loop {
                    let mut n0;
                    (n0, i) = read_int(&cs, i)?;
                    if i < cs.len() && cs[i] == '-' {
                        i += 1;
                        let n1;
                        (n1, i) = read_int(&cs, i)?;
                        if n0 > n1 {
                            bail!("Invalid range");
                        }
                        while n0 <= n1 {
                            set.push(n0.to_string());
                            n0 += 1;
                            if set.len() > 10000 {
                                bail!("Range too large, use more '*'");
                            }
                        }
                    } else {
                        set.push(n0.to_string());
                    }
                    if i < cs.len() && cs[i] == ']' {
                        i += 1;
                        break;
                    }
                    if i >= cs.len() || cs[i] != ',' {
                        bail!("Expected ','");
                    }
                    i += 1;
                }
                r += "(?:";
                r += &set.join("|");
                r += ")";
            }
            c => {
                r += &regex::escape(&c.to_string());
                i += 1;
            }
        }
    }
    if prefix {
        // A prefix must end at a segment boundary: after it there is either nothing, or a `/`
        // followed by whatever.
        r += "(?:/.*)?$"
    } else {
        r += "$";
    }
    Ok((Regex::new(&r)?, r))
}

fn read_int(cs: &[char], mut i: usize) -> Result<(usize, usize)> {
    let first = i;
    let mut n = 0u64;
    while i < cs.len() && cs[i].is_ascii_digit() {
        n = n * 10 + (u32::from(cs[i]) - 48) as u64;
        if n > 0xFFFFFFFF {
            bail!("Number out of range in glob set");
        }
        i += 1;
    }
    if i == first {
        bail!("Invalid number in glob set");
    }
    Ok((n as usize, i))
}

#[test]
fn test_exact() {
    let mut g = EndpointGlobber::new(false);
    assert!(g.is_empty());
    g.insert("/api/users").unwrap();
    assert!(!g.is_empty());
    assert!(g.match_endpoint("/api/users"));
    assert!(!g.match_endpoint("/api/users/12"));
    assert!(!g.match_endpoint("/api/userz"));
}

#[test]
fn test_wildcards() {
    let mut g = EndpointGlobber::new(false);
    g.insert("/api/*/orders").unwrap();
    assert!(g.match_endpoint("/api/v1/orders"));
    assert!(g.match_endpoint("/api//orders"));
    assert!(!g.match_endpoint("/api/v1/x/orders"));

    let mut g = EndpointGlobber::new(false);
    g.insert("/api/v[1,3-4]/users").unwrap();
    assert!(g.match_endpoint("/api/v1/users"));
    assert!(!g.match_endpoint("/api/v2/users"));
    assert!(g.match_endpoint("/api/v4/users"));

    // Regex specials are literal.
    let mut g = EndpointGlobber::new(false);
    g.insert("/search.json").unwrap();
    assert!(g.match_endpoint("/search.json"));
    assert!(!g.match_endpoint("/searchxjson"));
}

#[test]
fn test_prefix() {
    let mut g = EndpointGlobber::new(true);
    g.insert("/api/users").unwrap();
    g.insert("/health").unwrap();
    assert!(g.match_endpoint("/api/users"));
    assert!(g.match_endpoint("/api/users/1234"));
    assert!(!g.match_endpoint("/api/userspace"));
    assert!(g.match_endpoint("/health"));
    assert!(!g.match_endpoint("/api"));
}

#[test]
fn test_bad_patterns() {
    let mut g = EndpointGlobber::new(false);
    assert!(g.insert("/v[").is_err());
    assert!(g.insert("/v[3-1]").is_err());
    assert!(g.insert("/v[1;2]").is_err());
    assert!(g.insert("/v[x]").is_err());
}
