//! Offline queue commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::SyncClient;
use crate::output::{
    color_status, format_time, print_json, print_success, print_table, print_warning,
    OutputFormat,
};

/// Row for the queue breakdown table
#[derive(Tabled)]
struct CountRow {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Items")]
    items: usize,
}

/// Show what is waiting in the offline queue
pub async fn show_stats(client: &SyncClient, format: OutputFormat) -> Result<()> {
    let queue = client.queue().await?;
    let stats = queue.stats().await;

    match format {
        OutputFormat::Json => print_json(&stats)?,
        OutputFormat::Table => {
            println!("{}", "Offline Queue".bold());
            println!("{}", "=".repeat(40));
            println!("Items:      {} / {}", stats.total, stats.capacity);
            println!("Oldest:     {}", format_time(stats.oldest));
            println!("Newest:     {}", format_time(stats.newest));
            println!();

            if stats.total == 0 {
                return Ok(());
            }

            println!("{}", "By priority".bold());
            let rows: Vec<CountRow> = stats
                .by_priority
                .iter()
                .map(|(priority, items)| CountRow {
                    key: color_status(priority),
                    items: *items,
                })
                .collect();
            print_table(&rows);

            println!("{}", "By record type".bold());
            let rows: Vec<CountRow> = stats
                .by_record_type
                .iter()
                .map(|(record_type, items)| CountRow {
                    key: record_type.clone(),
                    items: *items,
                })
                .collect();
            print_table(&rows);
        }
    }

    Ok(())
}

/// Deliver queued items now
pub async fn flush(client: &SyncClient, batch: Option<usize>, format: OutputFormat) -> Result<()> {
    let queue = client.queue().await?;
    if queue.pending_count().await == 0 {
        print_warning("Offline queue is empty");
        return Ok(());
    }

    let outcome = queue.flush(batch).await?;

    match format {
        OutputFormat::Json => print_json(&outcome)?,
        OutputFormat::Table => {
            print_success(&format!(
                "Flushed queue: {} delivered, {} dropped, {} waiting for retry",
                outcome.success.to_string().green(),
                outcome.failed.to_string().red(),
                outcome.retried.to_string().yellow()
            ));
            println!("Remaining items: {}", queue.pending_count().await);
        }
    }

    Ok(())
}
