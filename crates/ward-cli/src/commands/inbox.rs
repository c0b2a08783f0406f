use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use ward_core::models::{InboxItem, RecordId};
use ward_core::util::normalize_text_option;

use crate::commands::common::{
    format_relative_time, open_data, require_remote, resolve_patient, short_id,
};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct InboxListItem {
    pub id: String,
    pub from_user: String,
    pub patient: String,
    pub diagnosis: Option<String>,
    pub note: Option<String>,
    pub status: String,
    pub sent_at: i64,
}

pub fn inbox_to_list_item(item: &InboxItem) -> InboxListItem {
    InboxListItem {
        id: item.id.to_string(),
        from_user: item.from_user.clone(),
        patient: item.patient.name.clone(),
        diagnosis: item.patient.diagnosis.clone(),
        note: item.note.clone(),
        status: item.status.to_string(),
        sent_at: item.sent_at,
    }
}

pub fn format_inbox_lines(items: &[InboxItem]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    items
        .iter()
        .map(|item| {
            let line = format!(
                "{}  from {:<12}  {:<24}  {}",
                item.id,
                item.from_user,
                item.patient.name,
                format_relative_time(item.sent_at, now_ms)
            );
            match &item.note {
                Some(note) => format!("{line}\n    {note}"),
                None => line,
            }
        })
        .collect()
}

pub async fn run_inbox_send(
    to_user: &str,
    patient: &str,
    note: Option<String>,
    db_path: &Path,
) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    require_remote(&data)?;
    let patient = resolve_patient(&data, patient)?;
    let inbox_id = data
        .send_patient(to_user.trim(), &patient.id, normalize_text_option(note))
        .await?;
    println!(
        "Sent {} ({}) to {to_user}; handover {inbox_id}",
        patient.name,
        short_id(&patient.id)
    );
    Ok(())
}

pub async fn run_inbox_check(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    require_remote(&data)?;
    let items = data.check_inbox().await?;

    if as_json {
        let json_items = items
            .iter()
            .map(inbox_to_list_item)
            .collect::<Vec<InboxListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("No pending handovers.");
        return Ok(());
    }

    for line in format_inbox_lines(&items) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_inbox_accept(id: &str, db_path: &Path) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    require_remote(&data)?;
    let patient = data.accept_inbox_patient(&RecordId::from(id.trim())).await?;
    println!("Accepted {} ({})", patient.name, short_id(&patient.id));
    Ok(())
}

pub async fn run_inbox_decline(id: &str, db_path: &Path) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    require_remote(&data)?;
    data.decline_inbox_patient(&RecordId::from(id.trim())).await?;
    println!("Declined handover {}", id.trim());
    Ok(())
}
