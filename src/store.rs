//! The persisted, mergeable table of accumulated statistics.
//!
//! The on-disk format is a CSV table with one row per completed
//! `(task, run)` pair:
//!
//! ```text
//!      shots,    errors,  discards, seconds,decoder,strong_id,metadata,custom_counts
//!       1000,        12,         0,   0.250,pymatching,9f2c…,"{""d"":3}",
//! ```
//!
//! Rows are only ever appended. Loading groups rows by strong id and sums
//! them, so a task collected over several runs shows up as several rows and
//! loads as one entry. Numeric fields are padded for readability; loading
//! trims whitespace around every field.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;

use crate::error::{CollectError, Result};
use crate::stats::Stats;
use crate::task::{TaskDescriptor, canonical_json};

/// Columns every store must have.
pub const REQUIRED_COLUMNS: [&str; 7] = [
    "shots",
    "errors",
    "discards",
    "seconds",
    "decoder",
    "strong_id",
    "metadata",
];

/// Columns a store may have.
pub const OPTIONAL_COLUMNS: [&str; 1] = ["custom_counts"];

/// Header written at the top of every new store file.
pub const CSV_HEADER: &str =
    "     shots,    errors,  discards, seconds,decoder,strong_id,metadata,custom_counts";

/// Accumulated statistics for one task, together with its identity fields.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStats {
    pub strong_id: String,
    pub decoder: String,
    pub metadata: Value,
    pub stats: Stats,
}

impl TaskStats {
    pub fn from_task(task: &TaskDescriptor, stats: Stats) -> Result<Self> {
        Ok(Self {
            strong_id: task.strong_id()?.to_string(),
            decoder: task.decoder().ok_or(CollectError::MissingDecoder)?.to_string(),
            metadata: task.metadata().clone(),
            stats,
        })
    }

    /// Render as one CSV row (no trailing newline).
    pub fn to_csv_line(&self) -> String {
        let custom_counts = if self.stats.custom_counts.is_empty() {
            String::new()
        } else {
            // BTreeMap keys serialize in sorted order
            serde_json::to_string(&self.stats.custom_counts).unwrap_or_default()
        };
        format!(
            "{:>10},{:>10},{:>10},{:>8},{},{},{},{}",
            self.stats.shots,
            self.stats.errors,
            self.stats.discards,
            format_seconds(self.stats.seconds()),
            escape_field(&self.decoder),
            escape_field(&self.strong_id),
            escape_field(&canonical_json(&self.metadata)),
            escape_field(&custom_counts),
        )
    }
}

/// `seconds` with 3 decimals below 1, 2 below 10, else 1.
pub fn format_seconds(seconds: f64) -> String {
    if seconds < 1.0 {
        format!("{seconds:.3}")
    } else if seconds < 10.0 {
        format!("{seconds:.2}")
    } else {
        format!("{seconds:.1}")
    }
}

fn escape_field(field: &str) -> String {
    let needs_quotes = field.contains([',', '"', '\n', '\r'])
        || field.starts_with(char::is_whitespace)
        || field.ends_with(char::is_whitespace);
    if needs_quotes {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// In-memory view of a store: strong id → accumulated [`TaskStats`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultStore {
    entries: BTreeMap<String, TaskStats>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a CSV table. An empty input is an empty store.
    pub fn load(mut reader: impl Read) -> Result<Self> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        Self::parse(&text)
    }

    pub fn load_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::load(File::open(path)?)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut records = parse_records(text)?.into_iter();
        let mut store = ResultStore::new();
        let Some(header) = records.next() else {
            return Ok(store);
        };
        let columns = ColumnIndex::from_header(&header.fields)?;

        for record in records {
            let entry = columns.parse_row(&record)?;
            store.add(entry).map_err(|err| match err {
                CollectError::StoreOverflow { .. } => CollectError::StoreParse {
                    line: record.line,
                    message: err.to_string(),
                },
                other => other,
            })?;
        }
        Ok(store)
    }

    /// Fold one entry in, merging with any existing entry for the same strong id.
    pub fn add(&mut self, entry: TaskStats) -> Result<()> {
        match self.entries.get_mut(&entry.strong_id) {
            Some(existing) => {
                if existing.decoder != entry.decoder {
                    return Err(CollectError::StoreMismatch {
                        strong_id: entry.strong_id,
                        field: "decoder",
                    });
                }
                if existing.metadata != entry.metadata {
                    return Err(CollectError::StoreMismatch {
                        strong_id: entry.strong_id,
                        field: "metadata",
                    });
                }
                existing.stats = existing.stats.checked_add(&entry.stats).ok_or_else(|| {
                    CollectError::StoreOverflow {
                        strong_id: entry.strong_id.clone(),
                    }
                })?;
            }
            None => {
                self.entries.insert(entry.strong_id.clone(), entry);
            }
        }
        Ok(())
    }

    /// Fold every entry of `other` into `self`.
    pub fn merge(&mut self, other: ResultStore) -> Result<()> {
        for entry in other.entries.into_values() {
            self.add(entry)?;
        }
        Ok(())
    }

    pub fn get(&self, strong_id: &str) -> Option<&TaskStats> {
        self.entries.get(strong_id)
    }

    /// Accumulated stats for a strong id; zero when unknown.
    pub fn stats_for(&self, strong_id: &str) -> Stats {
        self.get(strong_id)
            .map(|e| e.stats.clone())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskStats> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the whole store (header plus one row per entry).
    pub fn to_csv(&self) -> String {
        let mut out = String::from(CSV_HEADER);
        out.push('\n');
        for entry in self.iter() {
            out.push_str(&entry.to_csv_line());
            out.push('\n');
        }
        out
    }
}

/// Append-only writer for a store file.
pub struct StoreWriter {
    file: BufWriter<File>,
    path: PathBuf,
}

impl StoreWriter {
    /// Open `path` for appending.
    ///
    /// An existing, non-empty file is loaded and returned alongside the
    /// writer; otherwise the file is created and the header written.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, ResultStore)> {
        let path = path.as_ref().to_path_buf();
        let existing = path.metadata().map(|m| m.len() > 0).unwrap_or(false);
        let (file, store) = if existing {
            let store = ResultStore::load_path(&path)?;
            let file = OpenOptions::new().append(true).open(&path)?;
            (file, store)
        } else {
            let mut file = File::create(&path)?;
            writeln!(file, "{CSV_HEADER}")?;
            file.flush()?;
            (file, ResultStore::new())
        };
        tracing::debug!(path = %path.display(), entries = store.len(), "opened store");
        Ok((
            Self {
                file: BufWriter::new(file),
                path,
            },
            store,
        ))
    }

    /// Append one row and flush it to disk.
    pub fn append(&mut self, entry: &TaskStats) -> Result<()> {
        writeln!(self.file, "{}", entry.to_csv_line())?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

struct ColumnIndex {
    index: HashMap<String, usize>,
    width: usize,
}

impl ColumnIndex {
    fn from_header(header: &[String]) -> Result<Self> {
        let actual: BTreeSet<&str> = header.iter().map(String::as_str).collect();
        let allowed: BTreeSet<&str> = REQUIRED_COLUMNS
            .iter()
            .chain(OPTIONAL_COLUMNS.iter())
            .copied()
            .collect();
        let missing = REQUIRED_COLUMNS.iter().any(|c| !actual.contains(c));
        let extra = actual.iter().any(|c| !allowed.contains(c));
        let duplicated = actual.len() != header.len();
        if missing || extra || duplicated {
            return Err(CollectError::StoreColumns {
                expected: REQUIRED_COLUMNS
                    .iter()
                    .chain(OPTIONAL_COLUMNS.iter())
                    .map(|c| c.to_string())
                    .collect(),
                actual: header.to_vec(),
            });
        }
        let index = header
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Ok(Self {
            index,
            width: header.len(),
        })
    }

    fn field<'a>(&self, record: &'a Record, name: &str) -> Option<&'a str> {
        self.index
            .get(name)
            .and_then(|&i| record.fields.get(i))
            .map(String::as_str)
    }

    fn parse_row(&self, record: &Record) -> Result<TaskStats> {
        let line = record.line;
        if record.fields.len() != self.width {
            return Err(CollectError::StoreParse {
                line,
                message: format!(
                    "expected {} fields, got {}",
                    self.width,
                    record.fields.len()
                ),
            });
        }
        let required = |name: &str| self.field(record, name).unwrap_or_default();
        let count = |name: &str| -> Result<u64> {
            required(name).parse().map_err(|e| CollectError::StoreParse {
                line,
                message: format!("bad {name} value {:?}: {e}", required(name)),
            })
        };

        let shots = count("shots")?;
        let errors = count("errors")?;
        let discards = count("discards")?;
        let elapsed = required("seconds")
            .parse::<f64>()
            .ok()
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .ok_or_else(|| CollectError::StoreParse {
                line,
                message: format!("bad seconds value {:?}", required("seconds")),
            })?;
        let metadata: Value =
            serde_json::from_str(required("metadata")).map_err(|e| CollectError::StoreParse {
                line,
                message: format!("metadata is not valid JSON: {e}"),
            })?;

        let mut stats = Stats::new(shots, errors, discards, elapsed);
        match self.field(record, "custom_counts") {
            Some(raw) if !raw.is_empty() => {
                let counts: BTreeMap<String, u64> =
                    serde_json::from_str(raw).map_err(|e| CollectError::StoreParse {
                        line,
                        message: format!("custom_counts is not a JSON object of counts: {e}"),
                    })?;
                for (key, count) in counts {
                    stats = stats.with_custom_count(key, count);
                }
            }
            _ => {}
        }

        Ok(TaskStats {
            strong_id: required("strong_id").to_string(),
            decoder: required("decoder").to_string(),
            metadata,
            stats,
        })
    }
}

struct Record {
    /// 1-indexed line the record starts on.
    line: usize,
    fields: Vec<String>,
}

/// Split CSV text into records. Quoted fields may contain commas, doubled
/// quotes and newlines; unquoted fields are trimmed; blank lines are skipped.
fn parse_records(text: &str) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut chars = text.chars().peekable();

    let finish = |field: &mut String, quoted: bool| -> String {
        let f = std::mem::take(field);
        if quoted { f } else { f.trim().to_string() }
    };

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if !quoted && field.trim().is_empty() => {
                field.clear();
                in_quotes = true;
                quoted = true;
            }
            '"' => {
                return Err(CollectError::StoreParse {
                    line,
                    message: "unexpected quote inside a field".to_string(),
                });
            }
            ',' => {
                fields.push(finish(&mut field, quoted));
                quoted = false;
            }
            '\n' => {
                fields.push(finish(&mut field, quoted));
                quoted = false;
                let blank = fields.len() == 1 && fields[0].is_empty();
                if !blank {
                    records.push(Record {
                        line: record_line,
                        fields: std::mem::take(&mut fields),
                    });
                }
                fields.clear();
                line += 1;
                record_line = line;
            }
            '\r' => {}
            c if quoted => {
                if !c.is_whitespace() {
                    return Err(CollectError::StoreParse {
                        line,
                        message: "characters after a closing quote".to_string(),
                    });
                }
            }
            c => field.push(c),
        }
    }

    if in_quotes {
        return Err(CollectError::StoreParse {
            line: record_line,
            message: "unterminated quoted field".to_string(),
        });
    }
    if quoted || !field.trim().is_empty() || !fields.is_empty() {
        fields.push(finish(&mut field, quoted));
        records.push(Record {
            line: record_line,
            fields,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(id: &str, shots: u64, errors: u64) -> TaskStats {
        TaskStats {
            strong_id: id.to_string(),
            decoder: "pymatching".to_string(),
            metadata: json!({"d": 3, "noise": [0.001, "si1000"]}),
            stats: Stats::new(shots, errors, 0, Duration::from_millis(250)),
        }
    }

    #[test]
    fn rows_render_with_padding_and_quoted_json() {
        let line = entry("abc", 1000, 12).to_csv_line();
        assert_eq!(
            line,
            r#"      1000,        12,         0,   0.250,pymatching,abc,"{""d"":3,""noise"":[0.001,""si1000""]}","#
        );
    }

    #[test]
    fn seconds_precision_depends_on_magnitude() {
        assert_eq!(format_seconds(0.12345), "0.123");
        assert_eq!(format_seconds(3.14159), "3.14");
        assert_eq!(format_seconds(123.456), "123.5");
    }

    #[test]
    fn load_groups_and_sums_rows() {
        let mut text = String::from(CSV_HEADER);
        text.push('\n');
        for e in [entry("a", 100, 1), entry("b", 10, 0), entry("a", 50, 2)] {
            text.push_str(&e.to_csv_line());
            text.push('\n');
        }
        let store = ResultStore::parse(&text).unwrap();
        assert_eq!(store.len(), 2);
        let a = store.get("a").unwrap();
        assert_eq!(a.stats.shots, 150);
        assert_eq!(a.stats.errors, 3);
        assert_eq!(a.stats.elapsed, Duration::from_millis(500));
        assert_eq!(a.metadata, json!({"d": 3, "noise": [0.001, "si1000"]}));
    }

    #[test]
    fn load_tolerates_whitespace_and_column_order() {
        let text = "metadata , strong_id,decoder,seconds,discards,errors,shots\n\
                    \"{}\" ,  x , dec ,  1.5 , 2 , 3 ,  10 \n\
                    \n";
        let store = ResultStore::parse(text).unwrap();
        let x = store.get("x").unwrap();
        assert_eq!(x.decoder, "dec");
        assert_eq!(x.stats, Stats::new(10, 3, 2, Duration::from_millis(1500)));
        assert_eq!(x.metadata, json!({}));
    }

    #[test]
    fn custom_counts_are_summed_and_optional() {
        let text = format!(
            "{CSV_HEADER}\n\
             1,0,0,0,d,x,null,\"{{\"\"w\"\":2}}\"\n\
             1,0,0,0,d,x,null,\n\
             1,0,0,0,d,x,null,\"{{\"\"w\"\":3,\"\"v\"\":1}}\"\n"
        );
        let store = ResultStore::parse(&text).unwrap();
        let stats = store.stats_for("x");
        assert_eq!(stats.shots, 3);
        assert_eq!(stats.custom_counts.get("w"), Some(&5));
        assert_eq!(stats.custom_counts.get("v"), Some(&1));
    }

    #[test]
    fn missing_and_extra_columns_are_reported() {
        let err = ResultStore::parse("shots,errors,decoder\n").unwrap_err();
        match err {
            CollectError::StoreColumns { expected, actual } => {
                assert!(expected.contains(&"strong_id".to_string()));
                assert_eq!(actual, vec!["shots", "errors", "decoder"]);
            }
            other => panic!("unexpected error {other:?}"),
        }

        let extra = format!("{CSV_HEADER},bogus\n");
        assert!(matches!(
            ResultStore::parse(&extra),
            Err(CollectError::StoreColumns { .. })
        ));
    }

    #[test]
    fn malformed_rows_are_errors() {
        let bad_json = format!("{CSV_HEADER}\n1,0,0,0,d,x,{{oops,\n");
        match ResultStore::parse(&bad_json).unwrap_err() {
            CollectError::StoreParse { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error {other:?}"),
        }

        let bad_count = format!("{CSV_HEADER}\n-1,0,0,0,d,x,null,\n");
        assert!(ResultStore::parse(&bad_count).is_err());

        let short = format!("{CSV_HEADER}\n1,0,0\n");
        assert!(ResultStore::parse(&short).is_err());

        let unterminated = format!("{CSV_HEADER}\n1,0,0,0,d,x,\"null,\n");
        assert!(ResultStore::parse(&unterminated).is_err());

        let endless = format!("{CSV_HEADER}\n1,0,0,1e300,d,x,null,\n");
        assert!(matches!(
            ResultStore::parse(&endless),
            Err(CollectError::StoreParse { line: 2, .. })
        ));
    }

    #[test]
    fn overflowing_totals_are_parse_errors() {
        let max = u64::MAX;
        let text = format!("{CSV_HEADER}\n{max},0,0,0,d,x,null,\n1,0,0,0,d,x,null,\n");
        match ResultStore::parse(&text).unwrap_err() {
            CollectError::StoreParse { line, message } => {
                assert_eq!(line, 3);
                assert!(message.contains("overflow"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn quoted_fields_may_span_lines() {
        let text = format!("{CSV_HEADER}\n1,0,0,0,d,x,\"\"\"a\nb\"\"\",\n2,0,0,0,d,y,null,\n");
        let store = ResultStore::parse(&text).unwrap();
        assert_eq!(store.get("x").unwrap().metadata, json!("a\nb"));
        assert_eq!(store.stats_for("y").shots, 2);
    }

    #[test]
    fn merge_sums_shared_keys_and_rejects_mismatches() {
        let mut left = ResultStore::new();
        left.add(entry("a", 10, 1)).unwrap();
        let mut right = ResultStore::new();
        right.add(entry("a", 5, 0)).unwrap();
        right.add(entry("b", 7, 0)).unwrap();
        left.merge(right).unwrap();
        assert_eq!(left.stats_for("a").shots, 15);
        assert_eq!(left.stats_for("b").shots, 7);
        assert_eq!(left.stats_for("missing"), Stats::default());

        let mut conflicting = ResultStore::new();
        conflicting
            .add(TaskStats {
                decoder: "other".to_string(),
                ..entry("a", 1, 0)
            })
            .unwrap();
        assert!(matches!(
            left.merge(conflicting),
            Err(CollectError::StoreMismatch { field: "decoder", .. })
        ));
    }

    #[test]
    fn to_csv_round_trips_through_parse() {
        let mut store = ResultStore::new();
        store.add(entry("a", 10, 1)).unwrap();
        store.add(entry("b", 20, 2)).unwrap();
        assert_eq!(ResultStore::parse(&store.to_csv()).unwrap(), store);
    }

    #[test]
    fn writer_creates_then_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.csv");

        {
            let (mut writer, existing) = StoreWriter::open(&path).unwrap();
            assert!(existing.is_empty());
            writer.append(&entry("a", 10, 1)).unwrap();
        }
        let before = std::fs::read_to_string(&path).unwrap();
        assert!(before.starts_with(CSV_HEADER));

        let (mut writer, existing) = StoreWriter::open(&path).unwrap();
        assert_eq!(existing.stats_for("a").shots, 10);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);

        writer.append(&entry("a", 5, 0)).unwrap();
        let reloaded = ResultStore::load_path(&path).unwrap();
        assert_eq!(reloaded.stats_for("a").shots, 15);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 3);
    }
}
