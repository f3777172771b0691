//! Sync commands

use anyhow::{Context, Result};
use chrono::Utc;
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use sync_core::{
    models::{RecordType, SyncPhase, SyncProgress},
    sync::SyncOptions,
};
use tabled::Tabled;

use crate::client::SyncClient;
use crate::output::{
    color_status, format_time, parse_lookback, print_info, print_json, print_table,
    print_warning, OutputFormat,
};

/// Row for the per-type result table
#[derive(Tabled)]
struct TypeResultRow {
    #[tabled(rename = "Record Type")]
    record_type: String,
    #[tabled(rename = "Status")]
    status: String,
}

/// Sync exported records for all or the given types
pub async fn run_sync(
    client: &SyncClient,
    data_dir: &Path,
    types: Vec<String>,
    since: Option<String>,
    verbose: bool,
    format: OutputFormat,
) -> Result<()> {
    if client.store().get().await.is_none() && matches!(format, OutputFormat::Table) {
        print_warning("Not signed in, records will be queued until `hcs login`");
    }

    let queue = client.queue().await?;
    let orchestrator = client.orchestrator(data_dir, queue.clone());

    let record_types = if types.is_empty() {
        orchestrator.record_types()
    } else {
        types
            .iter()
            .map(|t| RecordType::parse(t).with_context(|| format!("Unknown record type '{}'", t)))
            .collect::<Result<Vec<_>>>()?
    };

    let now = Utc::now();
    let mut options = SyncOptions {
        from: Some(now - parse_lookback(since.as_deref().unwrap_or("24h"))?),
        to: Some(now),
        on_progress: None,
    };
    if verbose {
        options = options.with_progress(Arc::new(|progress: &SyncProgress| {
            if progress.phase == SyncPhase::Syncing {
                eprintln!(
                    "  [{}/{}] {}",
                    progress.current,
                    progress.total,
                    progress.current_type.as_deref().unwrap_or("-")
                );
            }
        }));
    }

    let summary = orchestrator
        .sync_specific_types(&record_types, options)
        .await;

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Table => {
            println!("{}", "Sync Summary".bold());
            println!("{}", "=".repeat(40));
            println!("Records read:    {}", summary.total);
            println!("Records synced:  {}", summary.synced.to_string().green());
            println!("Completed at:    {}", format_time(Some(summary.timestamp)));
            println!("Queued items:    {}", queue.pending_count().await);
            println!();

            let rows: Vec<TypeResultRow> = record_types
                .iter()
                .map(|t| {
                    let failed = summary.failed_types.iter().any(|f| f == t.as_str());
                    TypeResultRow {
                        record_type: t.to_string(),
                        status: color_status(if failed { "failed" } else { "synced" }),
                    }
                })
                .collect();
            print_table(&rows);

            if !summary.failed_types.is_empty() {
                print_info(
                    "Failed types were queued, run `hcs queue flush` once the service is reachable",
                );
            }
        }
    }

    Ok(())
}
