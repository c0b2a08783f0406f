use std::path::Path;

use serde::Serialize;
use ward_core::db::QueueCounts;
use ward_core::Mutation;

use crate::commands::common::{format_timestamp, open_data, short_id, CliData};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct MutationListItem {
    pub id: String,
    pub collection: String,
    pub operation: String,
    pub doc_id: String,
    pub status: String,
    pub retry_count: u32,
    pub timestamp: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
struct QueueReport {
    pending: u64,
    synced: u64,
    failed_fatal: u64,
    client_rev: u64,
    mutations: Vec<MutationListItem>,
}

pub fn mutation_to_list_item(mutation: &Mutation) -> MutationListItem {
    MutationListItem {
        id: mutation.id.to_string(),
        collection: mutation.collection.to_string(),
        operation: mutation.operation().to_string(),
        doc_id: mutation.doc_id.to_string(),
        status: mutation.status.to_string(),
        retry_count: mutation.retry_count,
        timestamp: mutation.timestamp,
        last_error: mutation.last_error.clone(),
    }
}

pub fn format_mutation_lines(mutations: &[Mutation]) -> Vec<String> {
    mutations
        .iter()
        .map(|mutation| {
            let line = format!(
                "{}  {:<8} {:<6}  {:<13}  retries {}",
                format_timestamp(mutation.timestamp),
                mutation.collection.to_string(),
                mutation.operation().to_string(),
                short_id(&mutation.doc_id),
                mutation.retry_count
            );
            match &mutation.last_error {
                Some(error) => format!("{line}  ({error})"),
                None => line,
            }
        })
        .collect()
}

pub fn format_queue_summary(counts: &QueueCounts, client_rev: u64) -> String {
    format!(
        "pending {}  synced {}  failed {}  (server rev {client_rev})",
        counts.pending, counts.synced, counts.failed_fatal
    )
}

async fn queue_mutations(data: &CliData, failed: bool) -> Result<Vec<Mutation>, CliError> {
    if failed {
        Ok(data.failed_mutations().await?)
    } else {
        Ok(data.pending_mutations().await?)
    }
}

pub async fn run_queue(failed: bool, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    let counts = data.queue_counts().await?;
    let client_rev = data.client_rev().await?;
    let mutations = queue_mutations(&data, failed).await?;

    if as_json {
        let report = QueueReport {
            pending: counts.pending,
            synced: counts.synced,
            failed_fatal: counts.failed_fatal,
            client_rev,
            mutations: mutations.iter().map(mutation_to_list_item).collect(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", format_queue_summary(&counts, client_rev));
    for line in format_mutation_lines(&mutations) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_purge(db_path: &Path) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    let removed = data.engine().purge_synced().await?;
    let noun = if removed == 1 { "entry" } else { "entries" };
    println!("Removed {removed} synced queue {noun}");
    Ok(())
}
