//! JSONL batch files: one normalized record per line.
//!
//! Every sync writes `batch_{YYYYmmdd_HHMMSS}_{label}.jsonl` (suffixed
//! `_2`, `_3`, ... when that name is taken) under
//! `[output].dir` before anything is uploaded, so a failed upload can be
//! retried from disk or inspected by hand.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::record::{sanitize_filename, RecordMetadata};

const MAX_SAME_SECOND: usize = 1000;

pub struct BatchWriter {
    path: PathBuf,
    out: BufWriter<File>,
    count: usize,
}

impl BatchWriter {
    /// Create a new batch file in `dir`, creating the directory if needed.
    /// Never reuses an existing name: a second batch in the same second gets
    /// a `_2`, `_3`, ... suffix.
    pub fn create(dir: &Path, label: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
        let stem = format!(
            "batch_{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            sanitize_filename(label)
        );

        for n in 1..=MAX_SAME_SECOND {
            let name = if n == 1 {
                format!("{}.jsonl", stem)
            } else {
                format!("{}_{}.jsonl", stem, n)
            };
            let path = dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok(Self::from_file(path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create batch file: {}", path.display()))
                }
            }
        }
        bail!("Too many batch files named {} in {}", stem, dir.display())
    }

    /// Create (or truncate) a batch file at an explicit path.
    pub fn create_at(path: PathBuf) -> Result<Self> {
        let file = File::create(&path)
            .with_context(|| format!("Failed to create batch file: {}", path.display()))?;
        Ok(Self::from_file(path, file))
    }

    fn from_file(path: PathBuf, file: File) -> Self {
        Self {
            path,
            out: BufWriter::new(file),
            count: 0,
        }
    }

    pub fn write(&mut self, record: &RecordMetadata) -> Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.count += 1;
        Ok(())
    }

    /// Flush and return the path and the number of records written.
    pub fn finish(mut self) -> Result<(PathBuf, usize)> {
        self.out
            .flush()
            .with_context(|| format!("Failed to write batch file: {}", self.path.display()))?;
        Ok((self.path, self.count))
    }
}

/// Read every record from a batch file. Blank lines are skipped.
pub fn read_batch(path: &Path) -> Result<Vec<RecordMetadata>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open batch file: {}", path.display()))?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: RecordMetadata = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid record", path.display(), idx + 1))?;
        records.push(record);
    }
    Ok(records)
}
