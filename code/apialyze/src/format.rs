/// Generic formatting code for a set of rows extracted from the report, to be presented columnar,
/// as csv, as json, or awk-friendly, and (except for json and awk) with or without a header and
/// with or without named fields.
///
/// A view supplies a map from field name to a formatting function for one row, a map of aliases
/// (a name standing for several fields), and a default field list.  The user selects fields and
/// control words with `--fmt=a,b,...`.
use anyhow::{bail, Result};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::io;

pub struct Help {
    pub fields: Vec<String>,
    pub aliases: Vec<(String, Vec<String>)>,
    pub defaults: String,
}

/// If the format spec asks for help, print the help produced by `f` and return true.

pub fn maybe_help<F>(fmt: &Option<String>, f: F) -> bool
where
    F: Fn() -> Help,
{
    if let Some(ref s) = fmt {
        if s.starts_with("help") {
            let mut help = f();
            println!("Syntax:\n  --fmt=(field|alias|control),...");
            println!("\nFields:");
            help.fields.sort();
            for f in help.fields {
                println!("  {f}");
            }
            if !help.aliases.is_empty() {
                println!("\nAliases:");
                help.aliases.sort();
                for (name, mut fields) in help.aliases {
                    fields.sort();
                    println!("  {name} --> {}", fields.join(","));
                }
            }
            println!("\nDefaults:\n  {}", help.defaults);
            println!("\nControl:\n  awk\n  csv\n  csvnamed\n  fixed\n  json\n  header\n  noheader\n  tag:<tagvalue>");
            return true;
        }
    }
    false
}

/// Build the Help for a view from its formatter and alias tables.

pub fn make_help<FmtT>(
    formatters: &HashMap<String, FmtT>,
    aliases: &HashMap<String, Vec<String>>,
    defaults: &str,
) -> Help {
    Help {
        fields: formatters.keys().cloned().collect::<Vec<String>>(),
        aliases: aliases
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Vec<(String, Vec<String>)>>(),
        defaults: defaults.to_string(),
    }
}

/// Return a vector of the known fields in `spec` wrt the formatters, and a HashSet of any other
/// strings found in `spec`.  It returns an error if zero output fields were selected.

pub fn parse_fields<'a, FmtT>(
    spec: &'a str,
    formatters: &HashMap<String, FmtT>,
    aliases: &'a HashMap<String, Vec<String>>,
) -> Result<(Vec<&'a str>, HashSet<&'a str>)> {
    let mut others = HashSet::new();
    let mut fields = vec![];
    for x in spec.split(',') {
        if formatters.contains_key(x) {
            fields.push(x);
        } else if let Some(expansion) = aliases.get(x) {
            for name in expansion {
                if formatters.contains_key(name) {
                    fields.push(name.as_ref());
                } else {
                    others.insert(name.as_ref());
                }
            }
        } else {
            others.insert(x);
        }
    }
    if fields.is_empty() {
        bail!("No output fields were selected")
    }
    Ok((fields, others))
}

#[derive(Debug, Default)]
pub struct FormatOptions {
    pub tag: Option<String>,
    pub json: bool,   // json explicitly requested
    pub csv: bool,    // csv or csvnamed explicitly requested
    pub awk: bool,    // awk explicitly requested
    pub named: bool,  // csvnamed explicitly requested
    pub header: bool, // true if nothing requested b/c fixed+header is default
}

pub fn standard_options(others: &HashSet<&str>) -> FormatOptions {
    let csvnamed = others.contains("csvnamed");
    let csv = others.contains("csv") || csvnamed;
    let json = others.contains("json") && !csv;
    let awk = others.contains("awk") && !csv && !json;
    // json and awk get no header, even if one is requested
    let header =
        (!csv && !json && !awk && !others.contains("noheader")) || (csv && others.contains("header"));
    let tag = others
        .iter()
        .find_map(|x| x.strip_prefix("tag:"))
        .map(|t| t.to_string());
    FormatOptions {
        csv,
        json,
        awk,
        header,
        tag,
        named: csvnamed,
    }
}

/// The `fields` are the names of formatting functions to get from the `formatters`, these are
/// applied to the `data`.  Set `opts.header` to true to print a first row with field names as a
/// header (independent of csv).  Set `opts.csv` to true to get CSV output instead of fixed-format.
/// Set `opts.tag` to Some(s) to print a tag=s field in the output.

pub fn format_data<DataT, FmtT>(
    output: &mut dyn io::Write,
    fields: &[&str],
    formatters: &HashMap<String, FmtT>,
    opts: &FormatOptions,
    data: &[DataT],
) -> Result<()>
where
    FmtT: Fn(&DataT) -> String,
{
    // Resolve the formatters once, parse_fields has checked that they exist.
    let fmts = fields
        .iter()
        .filter_map(|kwd| formatters.get(*kwd))
        .collect::<Vec<&FmtT>>();
    let rows = data
        .iter()
        .map(|x| fmts.iter().map(|f| f(x)).collect::<Vec<String>>())
        .collect::<Vec<Vec<String>>>();

    if opts.csv {
        format_csv(output, fields, opts, &rows)
    } else if opts.json {
        format_json(output, fields, opts, &rows)
    } else if opts.awk {
        format_awk(output, opts, &rows);
        Ok(())
    } else {
        format_fixed_width(output, fields, opts, &rows);
        Ok(())
    }
}

fn format_fixed_width(
    output: &mut dyn io::Write,
    fields: &[&str],
    opts: &FormatOptions,
    rows: &[Vec<String>],
) {
    // The column width is the max across all the entries in the column (including header, if
    // present).  If there's a tag, it is printed in the last column.
    let mut widths = vec![0; fields.len()];
    if opts.header {
        for (w, kwd) in widths.iter_mut().zip(fields) {
            *w = usize::max(*w, kwd.len());
        }
    }
    for row in rows {
        for (w, val) in widths.iter_mut().zip(row) {
            *w = usize::max(*w, val.len());
        }
    }
    let tag = opts
        .tag
        .as_ref()
        .map(|t| (t.as_str(), usize::max(t.len(), "tag".len())));

    if opts.header {
        let header_tag = tag.map(|(_, w)| ("tag", w));
        write_fixed_line(output, &widths, fields, header_tag);
    }
    for row in rows {
        let vals = row.iter().map(|v| v.as_str()).collect::<Vec<&str>>();
        write_fixed_line(output, &widths, &vals, tag);
    }
}

fn write_fixed_line(
    output: &mut dyn io::Write,
    widths: &[usize],
    vals: &[&str],
    tag: Option<(&str, usize)>,
) {
    let mut s = "".to_string();
    for (w, val) in widths.iter().zip(vals) {
        s += format!("{:w$}  ", val, w = *w).as_str();
    }
    if let Some((t, w)) = tag {
        s += format!("{:w$}  ", t).as_str();
    }
    // Ignore errors here, they are common for broken pipelines
    let _ = output.write(s.trim_end().as_bytes());
    let _ = output.write(b"\n");
}

fn format_csv(
    output: &mut dyn io::Write,
    fields: &[&str],
    opts: &FormatOptions,
    rows: &[Vec<String>],
) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(output);

    if opts.header {
        let mut out_fields = fields.iter().map(|kwd| kwd.to_string()).collect::<Vec<String>>();
        if opts.tag.is_some() {
            out_fields.push("tag".to_string());
        }
        writer.write_record(out_fields)?;
    }

    for row in rows {
        let mut out_fields = fields
            .iter()
            .zip(row)
            .map(|(kwd, val)| {
                if opts.named {
                    format!("{kwd}={val}")
                } else {
                    val.clone()
                }
            })
            .collect::<Vec<String>>();
        if let Some(ref tag) = opts.tag {
            if opts.named {
                out_fields.push(format!("tag={tag}"));
            } else {
                out_fields.push(tag.clone());
            }
        }
        writer.write_record(out_fields)?;
    }

    writer.flush()?;
    Ok(())
}

fn format_json(
    output: &mut dyn io::Write,
    fields: &[&str],
    opts: &FormatOptions,
    rows: &[Vec<String>],
) -> Result<()> {
    let objects = rows
        .iter()
        .map(|row| {
            let mut obj = Map::new();
            for (kwd, val) in fields.iter().zip(row) {
                obj.insert(kwd.to_string(), Value::String(val.clone()));
            }
            if let Some(ref tag) = opts.tag {
                obj.insert("tag".to_string(), Value::String(tag.clone()));
            }
            Value::Object(obj)
        })
        .collect::<Vec<Value>>();
    serde_json::to_writer(&mut *output, &objects)?;
    output.write_all(b"\n")?;
    Ok(())
}

// awk output: fields are space-separated and spaces are not allowed within fields, they are
// replaced by `_`.

fn format_awk(output: &mut dyn io::Write, opts: &FormatOptions, rows: &[Vec<String>]) {
    for row in rows {
        let mut line = row
            .iter()
            .map(|val| val.replace(' ', "_"))
            .collect::<Vec<String>>()
            .join(" ");
        if let Some(ref tag) = opts.tag {
            if !line.is_empty() {
                line += " ";
            }
            line += tag;
        }
        line += "\n";
        // Ignore errors here, they are common for broken pipelines
        let _ = output.write(line.as_bytes());
    }
}

#[cfg(test)]
type Row = (&'static str, usize);

#[cfg(test)]
fn fmt_name(x: &Row) -> String {
    x.0.to_string()
}

#[cfg(test)]
fn fmt_count(x: &Row) -> String {
    x.1.to_string()
}

#[cfg(test)]
fn test_formatters() -> (
    HashMap<String, &'static dyn Fn(&Row) -> String>,
    HashMap<String, Vec<String>>,
) {
    let mut formatters: HashMap<String, &'static dyn Fn(&Row) -> String> = HashMap::new();
    formatters.insert("name".to_string(), &fmt_name);
    formatters.insert("count".to_string(), &fmt_count);
    let mut aliases = HashMap::new();
    aliases.insert("all".to_string(), vec!["name".to_string(), "count".to_string()]);
    (formatters, aliases)
}

#[cfg(test)]
fn render(spec: &str) -> String {
    let (formatters, aliases) = test_formatters();
    let (fields, others) = parse_fields(spec, &formatters, &aliases).unwrap();
    let opts = standard_options(&others);
    let mut out = vec![];
    format_data(&mut out, &fields, &formatters, &opts, &[("/a", 10), ("/longer", 2)]).unwrap();
    String::from_utf8(out).unwrap()
}

#[test]
fn test_fixed() {
    assert!(render("all") == "name     count\n/a       10\n/longer  2\n");
    assert!(render("count,noheader") == "10\n2\n");
}

#[test]
fn test_csv_json_awk() {
    assert!(render("all,csv") == "/a,10\n/longer,2\n");
    assert!(render("all,csv,header") == "name,count\n/a,10\n/longer,2\n");
    assert!(render("name,csvnamed") == "name=/a\nname=/longer\n");
    assert!(render("all,json,tag:x") == r#"[{"count":"10","name":"/a","tag":"x"},{"count":"2","name":"/longer","tag":"x"}]"#.to_string() + "\n");
    assert!(render("all,awk") == "/a 10\n/longer 2\n");
}

#[test]
fn test_parse_fields() {
    let (formatters, aliases) = test_formatters();
    assert!(parse_fields("fixed,header", &formatters, &aliases).is_err());
    let (fields, others) = parse_fields("count,bogus", &formatters, &aliases).unwrap();
    assert!(fields == vec!["count"]);
    assert!(others.contains("bogus"));
}
