//! Job Ledger (C2): persistent, single-writer, one row per PU.
//!
//! Stored as CSV with a fixed, documented header. Writes are
//! atomic: write to a sibling temp file, fsync, rename over the canonical
//! path. Null is the empty token; `-1` sentinels for `job_id`/`task_id` are
//! written literally so the file round-trips without silent coercion.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::model::{JobId, LedgerRow, Pu, SchedulerFields, StateCategory, TaskId};

pub const HEADER: &[&str] = &[
    "subject",
    "session",
    "submitted",
    "job_id",
    "task_id",
    "state_category",
    "state_code",
    "runtime_secs",
    "has_results",
    "is_failed",
    "log_basename",
    "last_stdout_line",
    "alert_message",
    "time_limit",
    "nodes",
    "cpus",
    "partition",
    "name",
];

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("io error reading/writing ledger at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("csv error in ledger at {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("ledger row {row} column '{column}' has malformed value '{value}'")]
    MalformedField {
        row: usize,
        column: &'static str,
        value: String,
    },
}

/// In-memory ledger: an ordered list of rows plus an index over PU identity,
/// keeping null handling explicit rather than folding everything into a
/// table; atomic persistence is the only externally visible contract).
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    rows: Vec<LedgerRow>,
}

impl Ledger {
    pub fn new(rows: Vec<LedgerRow>) -> Self {
        Self { rows }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LedgerRow> {
        self.rows.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut LedgerRow> {
        self.rows.iter_mut()
    }

    pub fn into_rows(self) -> Vec<LedgerRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, pu: &Pu) -> Option<&LedgerRow> {
        self.rows.iter().find(|r| &r.pu == pu)
    }

    pub fn get_mut(&mut self, pu: &Pu) -> Option<&mut LedgerRow> {
        self.rows.iter_mut().find(|r| &r.pu == pu)
    }

    /// Insert a row for a new PU, or overwrite the existing row for that PU.
    /// Used by the inclusion resolver's update semantics and
    /// by the reconciler.
    pub fn upsert_row(&mut self, row: LedgerRow) {
        if let Some(existing) = self.rows.iter_mut().find(|r| r.pu == row.pu) {
            *existing = row;
        } else {
            self.rows.push(row);
        }
    }

    /// Remove the row for `pu`, if present. Only valid to call when the PU
    /// never produced results.
    pub fn remove(&mut self, pu: &Pu) {
        self.rows.retain(|r| &r.pu != pu);
    }

    /// Reorder rows to exactly match `order`, dropping rows not present and
    /// leaving `order` entries with no existing row absent (callers insert
    /// declared rows first). Enforces invariant 5: ledger rows equal the
    /// Inclusion List exactly, in order.
    pub fn reorder_to(&mut self, order: &[Pu]) {
        let mut reordered = Vec::with_capacity(order.len());
        for pu in order {
            if let Some(pos) = self.rows.iter().position(|r| &r.pu == pu) {
                reordered.push(self.rows.remove(pos));
            }
        }
        self.rows = reordered;
    }

    /// Apply a freshly re-resolved Inclusion List: declare rows for PUs new
    /// to the ledger, drop PUs that vanished from `list` only if they never
    /// produced results, and reorder to `list` with any surviving
    /// succeeded-but-vanished rows appended after it. Update semantics
    /// clause (c): row-removal must never erase succeeded-PU provenance.
    pub fn apply_inclusion_update(&mut self, list: &[Pu]) {
        for pu in list {
            if self.get(pu).is_none() {
                self.upsert_row(LedgerRow::declared(pu.clone()));
            }
        }

        let kept: std::collections::HashSet<&Pu> = list.iter().collect();
        let vanished_without_results: Vec<Pu> = self
            .rows
            .iter()
            .filter(|r| !kept.contains(&r.pu) && !r.has_results)
            .map(|r| r.pu.clone())
            .collect();
        for pu in &vanished_without_results {
            self.remove(pu);
        }

        let mut order: Vec<Pu> = list.to_vec();
        for row in &self.rows {
            if !kept.contains(&row.pu) {
                order.push(row.pu.clone());
            }
        }
        self.reorder_to(&order);
    }

    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|source| LedgerError::Csv {
                path: path.to_path_buf(),
                source,
            })?;

        let mut rows = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record.map_err(|source| LedgerError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
            rows.push(decode_row(idx, &record)?);
        }
        Ok(Self { rows })
    }

    /// Write to a sibling temp file, fsync, rename over `path`. A crash at
    /// any point leaves either the prior or the new ledger fully intact
    /// (Testable Property 5).
    pub fn save_atomic(&self, path: &Path) -> Result<(), LedgerError> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp_path = dir.join(format!(
            ".{}.tmp-{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("ledger"),
            std::process::id()
        ));

        {
            let mut writer = csv::WriterBuilder::new()
                .from_path(&tmp_path)
                .map_err(|source| LedgerError::Csv {
                    path: tmp_path.clone(),
                    source,
                })?;
            writer
                .write_record(HEADER)
                .map_err(|source| LedgerError::Csv {
                    path: tmp_path.clone(),
                    source,
                })?;
            for row in &self.rows {
                writer
                    .write_record(encode_row(row))
                    .map_err(|source| LedgerError::Csv {
                        path: tmp_path.clone(),
                        source,
                    })?;
            }
            let mut inner = writer.into_inner().map_err(|e| LedgerError::Io {
                path: tmp_path.clone(),
                source: io::Error::other(e.to_string()),
            })?;
            inner.flush().map_err(|source| LedgerError::Io {
                path: tmp_path.clone(),
                source,
            })?;
            inner.sync_all().map_err(|source| LedgerError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        }

        fs::rename(&tmp_path, path).map_err(|source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        if let Ok(dir_file) = File::open(dir) {
            let _ = dir_file.sync_all();
        }

        Ok(())
    }
}

fn encode_opt_string(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn encode_row(row: &LedgerRow) -> Vec<String> {
    vec![
        row.pu.subject.clone(),
        row.pu.session.clone().unwrap_or_default(),
        row.submitted.to_string(),
        row.job_id.0.to_string(),
        row.task_id.0.to_string(),
        row.state_category.map(|s| s.as_str().to_string()).unwrap_or_default(),
        encode_opt_string(&row.state_code),
        row.runtime.map(|d| d.as_secs().to_string()).unwrap_or_default(),
        row.has_results.to_string(),
        row.is_failed.map(|b| b.to_string()).unwrap_or_default(),
        encode_opt_string(&row.log_basename),
        encode_opt_string(&row.last_stdout_line),
        encode_opt_string(&row.alert_message),
        encode_opt_string(&row.scheduler.time_limit),
        encode_opt_string(&row.scheduler.nodes),
        encode_opt_string(&row.scheduler.cpus),
        encode_opt_string(&row.scheduler.partition),
        encode_opt_string(&row.scheduler.name),
    ]
}

fn field(record: &csv::StringRecord, idx: usize) -> &str {
    record.get(idx).unwrap_or("")
}

fn opt_string(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn decode_row(row_idx: usize, record: &csv::StringRecord) -> Result<LedgerRow, LedgerError> {
    let subject = field(record, 0).to_string();
    let session = opt_string(field(record, 1));
    let pu = Pu { subject, session };

    let submitted = parse_bool(row_idx, "submitted", field(record, 2))?;
    let job_id = JobId(parse_i64(row_idx, "job_id", field(record, 3))?);
    let task_id = TaskId(parse_i32(row_idx, "task_id", field(record, 4))?);

    let state_category = match field(record, 5) {
        "" => None,
        s => Some(StateCategory::parse(s).ok_or_else(|| LedgerError::MalformedField {
            row: row_idx,
            column: "state_category",
            value: s.to_string(),
        })?),
    };
    let state_code = opt_string(field(record, 6));
    let runtime = match field(record, 7) {
        "" => None,
        s => Some(Duration::from_secs(parse_u64(row_idx, "runtime_secs", s)?)),
    };
    let has_results = parse_bool(row_idx, "has_results", field(record, 8))?;
    let is_failed = match field(record, 9) {
        "" => None,
        s => Some(parse_bool(row_idx, "is_failed", s)?),
    };
    let log_basename = opt_string(field(record, 10));
    let last_stdout_line = opt_string(field(record, 11));
    let alert_message = opt_string(field(record, 12));
    let scheduler = SchedulerFields {
        time_limit: opt_string(field(record, 13)),
        nodes: opt_string(field(record, 14)),
        cpus: opt_string(field(record, 15)),
        partition: opt_string(field(record, 16)),
        name: opt_string(field(record, 17)),
    };

    Ok(LedgerRow {
        pu,
        submitted,
        job_id,
        task_id,
        state_category,
        state_code,
        runtime,
        has_results,
        is_failed,
        log_basename,
        last_stdout_line,
        alert_message,
        scheduler,
    })
}

fn parse_bool(row: usize, column: &'static str, s: &str) -> Result<bool, LedgerError> {
    match s {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(LedgerError::MalformedField {
            row,
            column,
            value: s.to_string(),
        }),
    }
}

fn parse_i64(row: usize, column: &'static str, s: &str) -> Result<i64, LedgerError> {
    s.parse::<i64>().map_err(|_| LedgerError::MalformedField {
        row,
        column,
        value: s.to_string(),
    })
}

fn parse_i32(row: usize, column: &'static str, s: &str) -> Result<i32, LedgerError> {
    s.parse::<i32>().map_err(|_| LedgerError::MalformedField {
        row,
        column,
        value: s.to_string(),
    })
}

fn parse_u64(row: usize, column: &'static str, s: &str) -> Result<u64, LedgerError> {
    s.parse::<u64>().map_err(|_| LedgerError::MalformedField {
        row,
        column,
        value: s.to_string(),
    })
}
