//! Allocation reports
//!
//! An [`AllocationReport`] maps, per hour, an input key (the values of the
//! configured in dimensions) to the output user tag values and fractions the
//! input's cost is split into.
//!
//! File layout: `Hour, Allocation, <in columns...>, <out columns...>`. A
//! `StartDate`/`EndDate` pair may replace `Hour` to cover every hour in
//! `[start, end)`. Fractions need not sum to 1.

use crate::aggregation::AggregationTagGroup;
use crate::config::{AllocationConfig, TagMapConfig};
use crate::error::{PostProcError, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ice_model::time::{format_hour, hour_index, hours_in_month, month_label, parse_date};
use ice_model::{ResourceGroup, TagGroup, TagKey};
use regex::Regex;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const HOUR_COLUMN: &str = "Hour";
pub const ALLOCATION_COLUMN: &str = "Allocation";
pub const START_DATE_COLUMN: &str = "StartDate";
pub const END_DATE_COLUMN: &str = "EndDate";

/// Slack on fraction sums before a key counts as over-allocated
const OVER_ALLOCATION_TOLERANCE: f64 = 1e-4;

const REGEX_PREFIX: &str = "re:";

/// Fixed dimension named by an `_`-prefixed allocation key, case-insensitive
pub fn allocation_tag_key(key: &str) -> Result<TagKey> {
    let name = key.strip_prefix('_').unwrap_or(key);
    TagKey::ALL
        .iter()
        .copied()
        .find(|k| k.name().eq_ignore_ascii_case(name))
        .ok_or_else(|| PostProcError::config(format!("Unknown allocation tag key: {}", key)))
}

/// Input key of an allocation entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationKey(Vec<String>);

impl AllocationKey {
    pub fn new(values: Vec<String>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for AllocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("|"))
    }
}

/// Output values and fraction of one allocation entry
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationValue {
    pub outputs: Vec<String>,
    pub allocation: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InKey {
    Tag(TagKey),
    UserTag(usize),
}

#[derive(Debug, Clone)]
struct InColumn {
    key: String,
    column: String,
    source: InKey,
}

#[derive(Debug, Clone)]
struct OutColumn {
    key: String,
    column: String,
    index: usize,
}

/// Literal values and `re:` patterns of one source key
#[derive(Debug, Clone)]
struct Matcher {
    output: usize,
    literals: Vec<String>,
    patterns: Vec<Regex>,
}

impl Matcher {
    fn matches(&self, outputs: &[String]) -> bool {
        let Some(value) = outputs.get(self.output) else {
            return false;
        };
        self.literals.iter().any(|l| l == value) || self.patterns.iter().any(|p| p.is_match(value))
    }
}

/// Derives a tag value from the other output values of an entry
#[derive(Debug, Clone)]
pub struct Tagger {
    mappings: Vec<(String, Vec<Matcher>)>,
}

impl Tagger {
    fn new(config: &TagMapConfig, out_keys: &[String]) -> Result<Self> {
        let mut mappings = Vec::with_capacity(config.len());
        for (dst, sources) in config {
            let mut matchers = Vec::with_capacity(sources.len());
            for (src_key, values) in sources {
                let output = out_keys.iter().position(|k| k == src_key).ok_or_else(|| {
                    PostProcError::config(format!(
                        "Tag map source key \"{}\" is not an allocation output",
                        src_key
                    ))
                })?;
                let mut literals = Vec::new();
                let mut patterns = Vec::new();
                for value in values {
                    match value.strip_prefix(REGEX_PREFIX) {
                        Some(re) => {
                            let regex = Regex::new(&format!("^(?:{})$", re)).map_err(|e| {
                                PostProcError::config(format!("Bad tag map pattern \"{}\": {}", re, e))
                            })?;
                            patterns.push(regex);
                        },
                        None => literals.push(value.clone()),
                    }
                }
                matchers.push(Matcher {
                    output,
                    literals,
                    patterns,
                });
            }
            mappings.push((dst.clone(), matchers));
        }
        Ok(Self { mappings })
    }

    /// First destination value whose matchers accept the outputs
    pub fn tag(&self, outputs: &[String]) -> Option<&str> {
        self.mappings
            .iter()
            .find(|(_, matchers)| matchers.iter().any(|m| m.matches(outputs)))
            .map(|(dst, _)| dst.as_str())
    }
}

/// Where the hours of a report row come from
enum HourColumns {
    Single(usize),
    Range(usize, usize),
}

/// Hour-indexed allocation table
#[derive(Debug, Clone)]
pub struct AllocationReport {
    start: DateTime<Utc>,
    in_columns: Vec<InColumn>,
    out_columns: Vec<OutColumn>,
    /// Taggers of output keys, by output position
    taggers: Vec<Option<Tagger>>,
    /// Taggers of user tags that are not outputs, by user tag index
    other_taggers: Vec<(usize, Tagger)>,
    num_user_tags: usize,
    data: Vec<FxHashMap<AllocationKey, Vec<AllocationValue>>>,
    parsing_error: bool,
}

impl AllocationReport {
    /// Empty report for the month starting at `start`
    pub fn new(config: &AllocationConfig, start: DateTime<Utc>, user_tag_keys: &[String]) -> Result<Self> {
        let user_tag_index = |key: &str| user_tag_keys.iter().position(|k| k == key);

        let mut in_columns = Vec::with_capacity(config.in_keys.len());
        for (key, column) in &config.in_keys {
            let source = if key.starts_with('_') {
                InKey::Tag(allocation_tag_key(key)?)
            } else {
                InKey::UserTag(user_tag_index(key).ok_or_else(|| {
                    PostProcError::config(format!("Bad input tag index for key: \"{}\"", key))
                })?)
            };
            in_columns.push(InColumn {
                key: key.clone(),
                column: column.clone(),
                source,
            });
        }

        let mut out_columns = Vec::with_capacity(config.out.len());
        for (key, column) in &config.out {
            let index = user_tag_index(key).ok_or_else(|| {
                PostProcError::config(format!("Bad output tag index for key: \"{}\"", key))
            })?;
            out_columns.push(OutColumn {
                key: key.clone(),
                column: column.clone(),
                index,
            });
        }

        let mut seen = HashSet::new();
        for column in [HOUR_COLUMN, ALLOCATION_COLUMN]
            .into_iter()
            .chain(in_columns.iter().map(|c| c.column.as_str()))
            .chain(out_columns.iter().map(|c| c.column.as_str()))
        {
            if !seen.insert(column) {
                return Err(PostProcError::config(format!(
                    "Duplicate allocation report column name: \"{}\"",
                    column
                )));
            }
        }

        let out_keys: Vec<String> = out_columns.iter().map(|c| c.key.clone()).collect();
        let mut taggers = vec![None; out_columns.len()];
        let mut other_taggers = Vec::new();
        for (key, tag_map) in &config.tag_maps {
            let tagger = Tagger::new(tag_map, &out_keys)?;
            if let Some(pos) = out_keys.iter().position(|k| k == key) {
                taggers[pos] = Some(tagger);
            } else if let Some(index) = user_tag_index(key) {
                other_taggers.push((index, tagger));
            } else {
                return Err(PostProcError::config(format!(
                    "Tag map key \"{}\" is not a user tag",
                    key
                )));
            }
        }

        Ok(Self {
            start,
            in_columns,
            out_columns,
            taggers,
            other_taggers,
            num_user_tags: user_tag_keys.len(),
            data: vec![FxHashMap::default(); hours_in_month(&start)],
            parsing_error: false,
        })
    }

    pub fn start(&self) -> &DateTime<Utc> {
        &self.start
    }

    pub fn num_hours(&self) -> usize {
        self.data.len()
    }

    /// Configured in key names, sorted
    pub fn in_keys(&self) -> Vec<&str> {
        self.in_columns.iter().map(|c| c.key.as_str()).collect()
    }

    /// Configured out user tag keys, sorted
    pub fn out_keys(&self) -> Vec<&str> {
        self.out_columns.iter().map(|c| c.key.as_str()).collect()
    }

    /// Column header of the report file
    pub fn header(&self) -> Vec<&str> {
        [HOUR_COLUMN, ALLOCATION_COLUMN]
            .into_iter()
            .chain(self.in_columns.iter().map(|c| c.column.as_str()))
            .chain(self.out_columns.iter().map(|c| c.column.as_str()))
            .collect()
    }

    /// Whether any row had an empty or unparsable allocation
    pub fn is_parsing_error(&self) -> bool {
        self.parsing_error
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(FxHashMap::is_empty)
    }

    /// Input key of a concrete tag group
    pub fn key(&self, tg: &TagGroup) -> AllocationKey {
        AllocationKey(
            self.in_columns
                .iter()
                .map(|c| match c.source {
                    InKey::Tag(k) => tg.value(k).unwrap_or("").to_string(),
                    InKey::UserTag(i) => tg.user_tag(i).to_string(),
                })
                .collect(),
        )
    }

    /// Input key of an aggregation, collapsed dimensions giving ""
    pub fn aggregation_key(&self, atg: &AggregationTagGroup) -> AllocationKey {
        AllocationKey(
            self.in_columns
                .iter()
                .map(|c| match c.source {
                    InKey::Tag(k) => atg.value(k).unwrap_or("").to_string(),
                    InKey::UserTag(i) => atg.user_tag(i).unwrap_or("").to_string(),
                })
                .collect(),
        )
    }

    pub fn get(&self, hour: usize, key: &AllocationKey) -> Option<&[AllocationValue]> {
        self.data
            .get(hour)
            .and_then(|entries| entries.get(key))
            .map(Vec::as_slice)
    }

    /// Append an entry. Entries for the same hour and key accumulate.
    pub fn add(&mut self, hour: usize, allocation: f64, key: AllocationKey, outputs: Vec<String>) {
        if hour >= self.data.len() {
            self.data.resize_with(hour + 1, FxHashMap::default);
        }
        self.data[hour]
            .entry(key)
            .or_default()
            .push(AllocationValue { outputs, allocation });
    }

    /// Tag group receiving an entry's share of `tg`
    ///
    /// Output values overlay the resource group of `tg`. An empty output is
    /// filled from its tag map when one matches.
    pub fn output_tag_group(&self, value: &AllocationValue, tg: &TagGroup) -> TagGroup {
        let mut rg = tg.resource_group.clone().unwrap_or_else(|| ResourceGroup::empty(self.num_user_tags));
        for (pos, column) in self.out_columns.iter().enumerate() {
            let output = value.outputs.get(pos).map(String::as_str).unwrap_or("");
            let tagged = if output.is_empty() {
                self.taggers[pos]
                    .as_ref()
                    .and_then(|t| t.tag(&value.outputs))
                    .unwrap_or("")
            } else {
                output
            };
            rg = rg.with_value(column.index, tagged);
        }
        for (index, tagger) in &self.other_taggers {
            if let Some(tag) = tagger.tag(&value.outputs) {
                rg = rg.with_value(*index, tag);
            }
        }
        tg.with_resource_group(Some(rg))
    }

    /// Keys whose fractions sum past 1 in some hour, with their largest sum
    pub fn over_allocated_keys(&self) -> BTreeMap<AllocationKey, f64> {
        let mut over = BTreeMap::new();
        for entries in &self.data {
            for (key, values) in entries {
                let sum: f64 = values.iter().map(|v| v.allocation).sum();
                if sum > 1.0 + OVER_ALLOCATION_TOLERANCE {
                    let max = over.entry(key.clone()).or_insert(sum);
                    if sum > *max {
                        *max = sum;
                    }
                }
            }
        }
        over
    }

    // ========================================================================
    // File I/O
    // ========================================================================

    /// Location of a rule's report for a month, plain or gzipped
    pub fn locate(dir: &Path, rule_name: &str, start: &DateTime<Utc>) -> Option<PathBuf> {
        let base = format!("{}-{}.csv", rule_name, month_label(start));
        [base.clone(), format!("{}.gz", base)]
            .into_iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    }

    /// Load a report file, decompressing `.gz` files
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        info!("Loading allocation report {}", path.display());
        let file = BufReader::new(File::open(path)?);
        if is_gzip(path) {
            self.load_csv(GzDecoder::new(file))
        } else {
            self.load_csv(file)
        }
    }

    /// Load report rows, adding them to the existing entries
    pub fn load_csv<R: Read>(&mut self, reader: R) -> Result<()> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = rdr.headers()?.clone();
        let find = |name: &str| headers.iter().position(|h| h == name);
        let require = |name: &str| {
            find(name).ok_or_else(|| {
                PostProcError::report(format!("Allocation report is missing column \"{}\"", name))
            })
        };

        let allocation_col = require(ALLOCATION_COLUMN)?;
        let hours = match (find(HOUR_COLUMN), find(START_DATE_COLUMN), find(END_DATE_COLUMN)) {
            (Some(hour), _, _) => HourColumns::Single(hour),
            (None, Some(start), Some(end)) => HourColumns::Range(start, end),
            _ => {
                return Err(PostProcError::report(
                    "Allocation report needs an Hour column or StartDate and EndDate columns",
                ))
            },
        };
        let in_cols = self
            .in_columns
            .iter()
            .map(|c| require(&c.column))
            .collect::<Result<Vec<_>>>()?;
        let out_cols = self
            .out_columns
            .iter()
            .map(|c| require(&c.column))
            .collect::<Result<Vec<_>>>()?;

        let mut rows = 0usize;
        let mut out_of_range = 0usize;
        for (line, record) in rdr.records().enumerate() {
            let record = record?;
            let field = |i: usize| record.get(i).unwrap_or("");

            let allocation = match field(allocation_col).parse::<f64>() {
                Ok(v) if v.is_finite() => v,
                _ => {
                    warn!(
                        "Skipping allocation report line {} with bad allocation \"{}\"",
                        line + 2,
                        field(allocation_col)
                    );
                    self.parsing_error = true;
                    continue;
                },
            };

            let (first, last) = match hours {
                HourColumns::Single(col) => {
                    let hour = hour_index(&self.start, &parse_date(field(col))?);
                    (hour, hour + 1)
                },
                HourColumns::Range(start_col, end_col) => (
                    hour_index(&self.start, &parse_date(field(start_col))?),
                    hour_index(&self.start, &parse_date(field(end_col))?),
                ),
            };

            let key = AllocationKey(in_cols.iter().map(|i| field(*i).to_string()).collect());
            let outputs: Vec<String> = out_cols.iter().map(|i| field(*i).to_string()).collect();
            let num_hours = hours_in_month(&self.start) as i64;
            for hour in first..last {
                if hour < 0 || hour >= num_hours {
                    out_of_range += 1;
                    continue;
                }
                self.add(hour as usize, allocation, key.clone(), outputs.clone());
            }
            rows += 1;
        }

        if out_of_range > 0 {
            warn!(
                "Ignored {} allocation report hours outside of {}",
                out_of_range,
                month_label(&self.start)
            );
        }
        debug!("Loaded {} allocation report rows", rows);
        Ok(())
    }

    /// Write the report as `[Hour, Allocation, in..., out...]` rows
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(self.header())?;
        let mut buffer = ryu::Buffer::new();
        for (hour, entries) in self.data.iter().enumerate() {
            let timestamp = format_hour(&self.start, hour);
            let mut keys: Vec<&AllocationKey> = entries.keys().collect();
            keys.sort();
            for key in keys {
                for value in &entries[key] {
                    let mut record: Vec<&str> = Vec::with_capacity(2 + key.0.len() + value.outputs.len());
                    record.push(&timestamp);
                    record.push(buffer.format(value.allocation));
                    record.extend(key.0.iter().map(String::as_str));
                    record.extend(value.outputs.iter().map(String::as_str));
                    wtr.write_record(&record)?;
                }
            }
        }
        wtr.flush()?;
        Ok(())
    }

    /// Write a gzipped copy of the report to `dir/<name>.csv.gz`
    pub fn archive_report(&self, dir: &Path, name: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.csv.gz", name));
        let mut encoder = GzEncoder::new(File::create(&path)?, Compression::default());
        self.write_csv(&mut encoder)?;
        encoder.finish()?;
        info!("Archived allocation report to {}", path.display());
        Ok(path)
    }
}

pub(crate) fn is_gzip(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("gz")
}
