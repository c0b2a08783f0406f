use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use ward_core::models::{Record, RecordId, RecordKind, TrashItem};

use crate::commands::common::{
    format_relative_time, format_timestamp, open_data, require_remote, resolve_record, short_id,
};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct TrashListItem {
    pub id: String,
    pub kind: String,
    pub label: String,
    pub deleted_by: String,
    pub deleted_at: i64,
    pub expires_at: i64,
}

fn record_label(record: &Record) -> String {
    match record {
        Record::Patient(patient) => patient.name.clone(),
        Record::Task(task) => task.title.clone(),
        Record::Ward(ward) => ward.name.clone(),
    }
}

pub fn trash_to_list_item(item: &TrashItem) -> TrashListItem {
    TrashListItem {
        id: item.id.to_string(),
        kind: item.item_type.as_str().to_string(),
        label: record_label(&item.record),
        deleted_by: item.deleted_by.clone(),
        deleted_at: item.deleted_at,
        expires_at: item.expires_at,
    }
}

pub fn format_trash_lines(items: &[TrashItem]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    items
        .iter()
        .map(|item| {
            format!(
                "{:<13}  {:<7}  {:<24}  deleted {}  purged after {}",
                short_id(&item.id),
                item.item_type.as_str(),
                record_label(&item.record),
                format_relative_time(item.deleted_at, now_ms),
                format_timestamp(item.expires_at)
            )
        })
        .collect()
}

pub async fn run_trash_list(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    let items = data.list_trash().await?;

    if as_json {
        let json_items = items
            .iter()
            .map(trash_to_list_item)
            .collect::<Vec<TrashListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("Trash is empty.");
        return Ok(());
    }

    for line in format_trash_lines(&items) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_trash_move(
    kind: RecordKind,
    queries: &[String],
    db_path: &Path,
) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    require_remote(&data)?;
    let ids = queries
        .iter()
        .map(|query| resolve_record(&data, kind, query).map(|record| record.id().clone()))
        .collect::<Result<Vec<_>, _>>()?;
    let moved = data.move_to_trash(kind, &ids).await?;
    println!("Moved {moved} {kind} to trash");
    Ok(())
}

pub async fn run_trash_restore(ids: &[String], db_path: &Path) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    require_remote(&data)?;
    let ids = ids
        .iter()
        .map(|id| RecordId::from(id.trim()))
        .collect::<Vec<_>>();
    let restored = data.restore_from_trash(&ids).await?;
    println!("Restored {restored} item(s)");
    Ok(())
}

pub async fn run_trash_empty(ids: &[String], db_path: &Path) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    require_remote(&data)?;
    let selection = if ids.is_empty() {
        None
    } else {
        Some(ids.iter().map(|id| RecordId::from(id.trim())).collect())
    };
    let deleted = data.empty_trash(selection).await?;
    println!("Permanently deleted {deleted} item(s)");
    Ok(())
}
