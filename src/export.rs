//! Export stored records in the batch file format.
//!
//! The output is the same JSONL that `sync` writes per run, so an export can
//! be re-read with [`crate::batch::read_batch`] or fed to other tooling.

use anyhow::Result;
use std::io::Write;
use std::path::Path;

use crate::batch::BatchWriter;
use crate::config::Config;
use crate::db;

/// Export every non-removed record (optionally from one source).
///
/// With `output` the records go to that file; otherwise to stdout.
pub async fn run_export(config: &Config, output: Option<&Path>, source: Option<&str>) -> Result<()> {
    let pool = db::connect(config).await?;
    crate::migrate::ensure_schema(&pool).await?;
    let records = db::load_records(
        &pool,
        &[db::STATUS_PROCESSED, db::STATUS_UPLOADED, db::STATUS_FAILED],
        source,
        None,
    )
    .await;
    pool.close().await;
    let records = records?;

    match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let mut writer = BatchWriter::create_at(path.to_path_buf())?;
            for (record, _) in &records {
                writer.write(record)?;
            }
            let (path, count) = writer.finish()?;
            eprintln!("Exported {} records to {}", count, path.display());
        }
        None => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for (record, _) in &records {
                writeln!(out, "{}", serde_json::to_string(record)?)?;
            }
            out.flush()?;
        }
    }

    Ok(())
}
