//! Job store and index overview for `docflow stats`.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::queue::{JobQueue, QueueOptions};

/// Per-batch job counts.
struct BatchStats {
    batch_id: String,
    jobs: i64,
    failed: i64,
    last_update_ms: i64,
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let queue = JobQueue::new(pool.clone(), QueueOptions::from_config(config));
    let counters = queue.counters().await?;

    let parked: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM jobs WHERE status = 'queued' AND parked_until IS NOT NULL",
    )
    .fetch_one(&pool)
    .await?;
    let total_docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(&pool)
        .await?;
    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&pool)
        .await?;
    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("docflow: database stats");
    println!("=======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Jobs:        {}", counters.total());
    println!("    queued:    {} ({} parked)", counters.queued, parked);
    println!("    running:   {}", counters.running);
    println!("    completed: {}", counters.completed);
    println!("    failed:    {}", counters.failed);
    println!();
    println!("  Documents:   {}", total_docs);
    println!("  Chunks:      {}", total_chunks);

    let rows = sqlx::query(
        r#"
        SELECT
            batch_id,
            COUNT(*) AS jobs,
            SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed,
            MAX(updated_at) AS last_update
        FROM jobs
        WHERE batch_id IS NOT NULL AND archived = 0
        GROUP BY batch_id
        ORDER BY last_update DESC
        LIMIT 20
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let batches: Vec<BatchStats> = rows
        .iter()
        .map(|row| BatchStats {
            batch_id: row.get("batch_id"),
            jobs: row.get("jobs"),
            failed: row.get("failed"),
            last_update_ms: row.get("last_update"),
        })
        .collect();

    if !batches.is_empty() {
        println!();
        println!("  By batch:");
        println!("  {:<36} {:>6} {:>7}   {}", "BATCH", "JOBS", "FAILED", "LAST UPDATE");
        println!("  {}", "-".repeat(70));
        for b in &batches {
            println!(
                "  {:<36} {:>6} {:>7}   {}",
                b.batch_id,
                b.jobs,
                b.failed,
                format_ts_relative(b.last_update_ms / 1000)
            );
        }
    }

    println!();
    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
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

/// Format a Unix timestamp (seconds) relative to now, e.g. "3 hours ago".
pub fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
