//! Database statistics: what has been synced, what reached the vector store,
//! and when each source last advanced its checkpoint.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;

struct SourceStats {
    source: String,
    emails: i64,
    documents: i64,
    attachments: i64,
    uploaded: i64,
    failed: i64,
    last_sync_ts: Option<i64>,
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    crate::migrate::ensure_schema(&pool).await?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE status != ?")
        .bind(db::STATUS_REMOVED)
        .fetch_one(&pool)
        .await?;

    let status_rows = sqlx::query("SELECT status, COUNT(*) AS n FROM records GROUP BY status ORDER BY status")
        .fetch_all(&pool)
        .await?;

    let conversations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("m365-rag database stats");
    println!("=======================");
    println!();
    println!("  Database:      {}", config.db.path.display());
    println!("  Size:          {}", format_bytes(db_size));
    println!();
    println!("  Records:       {}", total);
    for row in &status_rows {
        let status: String = row.get("status");
        let n: i64 = row.get("n");
        println!("    {:<12} {}", status, n);
    }
    println!("  Conversations: {}", conversations);

    let source_rows = sqlx::query(
        r#"
        SELECT
            source,
            SUM(CASE WHEN kind = 'email' THEN 1 ELSE 0 END) AS emails,
            SUM(CASE WHEN kind = 'document' THEN 1 ELSE 0 END) AS documents,
            SUM(CASE WHEN kind = 'attachment' THEN 1 ELSE 0 END) AS attachments,
            SUM(CASE WHEN status = 'uploaded' THEN 1 ELSE 0 END) AS uploaded,
            SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed
        FROM records
        WHERE status != 'removed'
        GROUP BY source
        ORDER BY source
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let checkpoint_rows = sqlx::query("SELECT source, updated_at FROM checkpoints")
        .fetch_all(&pool)
        .await?;

    let source_stats: Vec<SourceStats> = source_rows
        .iter()
        .map(|row| {
            let source: String = row.get("source");
            let last_sync_ts = checkpoint_rows
                .iter()
                .find(|cp| cp.get::<String, _>("source") == source)
                .map(|cp| cp.get::<i64, _>("updated_at"));
            SourceStats {
                source,
                emails: row.get("emails"),
                documents: row.get("documents"),
                attachments: row.get("attachments"),
                uploaded: row.get("uploaded"),
                failed: row.get("failed"),
                last_sync_ts,
            }
        })
        .collect();

    if !source_stats.is_empty() {
        println!();
        println!("  By source:");
        println!(
            "  {:<14} {:>7} {:>9} {:>11} {:>9} {:>7}   {}",
            "SOURCE", "EMAILS", "DOCUMENTS", "ATTACHMENTS", "UPLOADED", "FAILED", "LAST SYNC"
        );
        println!("  {}", "-".repeat(80));
        for s in &source_stats {
            let sync_display = match s.last_sync_ts {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<14} {:>7} {:>9} {:>11} {:>9} {:>7}   {}",
                s.source, s.emails, s.documents, s.attachments, s.uploaded, s.failed, sync_display
            );
        }
    }

    println!();
    pool.close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" for recent timestamps, a date otherwise.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts(ts);
    }
    let plural = |n: i64| if n == 1 { "" } else { "s" };
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        format!("{} min{} ago", delta / 60, plural(delta / 60))
    } else if delta < 86400 {
        format!("{} hour{} ago", delta / 3600, plural(delta / 3600))
    } else if delta < 86400 * 30 {
        format!("{} day{} ago", delta / 86400, plural(delta / 86400))
    } else {
        format_ts(ts)
    }
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
