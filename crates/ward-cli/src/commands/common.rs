use std::env;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use ward_core::models::{Patient, Record, RecordId, RecordKind, Task, Ward};
use ward_core::{Data, EngineConfig, HttpRemote, LocalStore};

use crate::error::CliError;

/// The coordinator as the CLI uses it: HTTP remote when configured
pub type CliData = Data<HttpRemote>;

const SHORT_ID_LEN: usize = 13;

#[derive(Debug, Serialize)]
pub struct UnitListItem {
    pub id: String,
    pub name: String,
    pub floor: Option<String>,
    pub patients: usize,
    pub updated_at: i64,
    pub relative_time: String,
}

#[derive(Debug, Serialize)]
pub struct PatientListItem {
    pub id: String,
    pub name: String,
    pub unit: Option<String>,
    pub bed: Option<String>,
    pub diagnosis: Option<String>,
    pub status: String,
    pub open_tasks: usize,
    pub updated_at: i64,
    pub relative_time: String,
}

#[derive(Debug, Serialize)]
pub struct TaskListItem {
    pub id: String,
    pub patient_id: String,
    pub patient: Option<String>,
    pub title: String,
    pub done: bool,
    pub priority: String,
    pub updated_at: i64,
    pub relative_time: String,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("WARD_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ward")
        .join("ward.db")
}

/// Open the local database with configuration from the environment
pub async fn open_data(db_path: &Path) -> Result<CliData, CliError> {
    let config = EngineConfig::from_env()?;
    open_data_with(db_path, config).await
}

pub async fn open_data_with(db_path: &Path, config: EngineConfig) -> Result<CliData, CliError> {
    let local = LocalStore::open_path(db_path).await?;
    let remote = match config.remote_url.as_deref() {
        Some(url) => {
            let device_id = local.device_id().await?;
            let remote = HttpRemote::new(url, &config.user, device_id, config.request_timeout)
                .map_err(ward_core::Error::from)?;
            Some(remote)
        }
        None => None,
    };
    Ok(Data::open(local, remote, config).await?)
}

pub fn require_remote(data: &CliData) -> Result<(), CliError> {
    if data.engine().config().is_remote_configured() {
        Ok(())
    } else {
        Err(CliError::RemoteNotConfigured)
    }
}

/// Give a freshly queued write a chance to reach the remote before exit.
///
/// Failures only leave the entry queued for the next `ward sync`.
pub async fn settle(data: &CliData) {
    if !data.engine().is_online() {
        return;
    }
    match data.flush().await {
        Ok(report) if report.failed > 0 => {
            eprintln!(
                "Warning: {} queued change(s) were rejected; see `ward queue --failed`",
                report.failed
            );
        }
        Ok(_) => {}
        Err(error) => tracing::warn!("Flush after write failed: {error}"),
    }
}

/// Join free-form words into a single trimmed value
pub fn normalize_words(words: &[String]) -> Option<String> {
    let joined = words.join(" ");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn short_id(id: &RecordId) -> String {
    id.as_str().chars().take(SHORT_ID_LEN).collect()
}

/// Find an active record by full ID or unique ID prefix
pub fn resolve_record(data: &CliData, kind: RecordKind, query: &str) -> Result<Record, CliError> {
    let query = query.trim();
    let not_found = || CliError::RecordNotFound {
        kind: kind.as_str(),
        query: query.to_string(),
    };
    if query.is_empty() {
        return Err(not_found());
    }

    if let Some(record) = data.store().get_clone(kind, &RecordId::from(query)) {
        return Ok(record);
    }

    let mut matches = data
        .store()
        .select(kind, |record| record.id().as_str().starts_with(query));
    match matches.len() {
        0 => Err(not_found()),
        1 => Ok(matches.remove(0)),
        _ => {
            let options = matches
                .iter()
                .take(3)
                .map(|record| short_id(record.id()))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub fn resolve_patient(data: &CliData, query: &str) -> Result<Patient, CliError> {
    match resolve_record(data, RecordKind::Patient, query)? {
        Record::Patient(patient) => Ok(patient),
        _ => Err(CliError::RecordNotFound {
            kind: "patient",
            query: query.to_string(),
        }),
    }
}

pub fn resolve_task(data: &CliData, query: &str) -> Result<Task, CliError> {
    match resolve_record(data, RecordKind::Task, query)? {
        Record::Task(task) => Ok(task),
        _ => Err(CliError::RecordNotFound {
            kind: "task",
            query: query.to_string(),
        }),
    }
}

pub fn resolve_unit(data: &CliData, query: &str) -> Result<Ward, CliError> {
    match resolve_record(data, RecordKind::Ward, query)? {
        Record::Ward(ward) => Ok(ward),
        _ => Err(CliError::RecordNotFound {
            kind: "ward",
            query: query.to_string(),
        }),
    }
}

pub fn patients(data: &CliData) -> Vec<Patient> {
    data.store().read(RecordKind::Patient, |records| {
        records
            .iter()
            .filter_map(|record| match record {
                Record::Patient(patient) => Some(patient.clone()),
                _ => None,
            })
            .collect()
    })
}

pub fn tasks(data: &CliData) -> Vec<Task> {
    data.store().read(RecordKind::Task, |records| {
        records
            .iter()
            .filter_map(|record| match record {
                Record::Task(task) => Some(task.clone()),
                _ => None,
            })
            .collect()
    })
}

pub fn units(data: &CliData) -> Vec<Ward> {
    data.store().read(RecordKind::Ward, |records| {
        records
            .iter()
            .filter_map(|record| match record {
                Record::Ward(ward) => Some(ward.clone()),
                _ => None,
            })
            .collect()
    })
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

pub fn unit_to_list_item(unit: &Ward, all_patients: &[Patient]) -> UnitListItem {
    let now_ms = Utc::now().timestamp_millis();
    UnitListItem {
        id: unit.id.to_string(),
        name: unit.name.clone(),
        floor: unit.floor.clone(),
        patients: all_patients
            .iter()
            .filter(|patient| patient.unit_id.as_ref() == Some(&unit.id))
            .count(),
        updated_at: unit.updated_at,
        relative_time: format_relative_time(unit.updated_at, now_ms),
    }
}

pub fn patient_to_list_item(
    patient: &Patient,
    all_units: &[Ward],
    all_tasks: &[Task],
) -> PatientListItem {
    let now_ms = Utc::now().timestamp_millis();
    let unit = patient.unit_id.as_ref().and_then(|unit_id| {
        all_units
            .iter()
            .find(|unit| &unit.id == unit_id)
            .map(|unit| unit.name.clone())
    });
    PatientListItem {
        id: patient.id.to_string(),
        name: patient.name.clone(),
        unit,
        bed: patient.bed.clone(),
        diagnosis: patient.diagnosis.clone(),
        status: status_label(patient).to_string(),
        open_tasks: all_tasks
            .iter()
            .filter(|task| task.patient_id == patient.id && !task.done)
            .count(),
        updated_at: patient.updated_at,
        relative_time: format_relative_time(patient.updated_at, now_ms),
    }
}

pub fn task_to_list_item(task: &Task, all_patients: &[Patient]) -> TaskListItem {
    let now_ms = Utc::now().timestamp_millis();
    TaskListItem {
        id: task.id.to_string(),
        patient_id: task.patient_id.to_string(),
        patient: all_patients
            .iter()
            .find(|patient| patient.id == task.patient_id)
            .map(|patient| patient.name.clone()),
        title: task.title.clone(),
        done: task.done,
        priority: priority_label(task).to_string(),
        updated_at: task.updated_at,
        relative_time: format_relative_time(task.updated_at, now_ms),
    }
}

pub fn format_unit_lines(items: &[UnitListItem]) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            let short = item.id.chars().take(SHORT_ID_LEN).collect::<String>();
            let floor = item.floor.as_deref().unwrap_or("-");
            format!(
                "{short:<13}  {:<20}  {floor:<8}  {} patient(s)",
                item.name, item.patients
            )
        })
        .collect()
}

pub fn format_patient_lines(items: &[PatientListItem]) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            let short = item.id.chars().take(SHORT_ID_LEN).collect::<String>();
            let unit = item.unit.as_deref().unwrap_or("-");
            let bed = item.bed.as_deref().unwrap_or("-");
            let line = format!(
                "{short:<13}  {:<24}  {unit:<12}  {bed:<5}  {:<11}  {}",
                item.name, item.status, item.relative_time
            );
            match &item.diagnosis {
                Some(diagnosis) => format!("{line}  {diagnosis}"),
                None => line,
            }
        })
        .collect()
}

pub fn format_task_lines(items: &[TaskListItem]) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            let short = item.id.chars().take(SHORT_ID_LEN).collect::<String>();
            let mark = if item.done { "[x]" } else { "[ ]" };
            let patient = item.patient.as_deref().unwrap_or("?");
            format!(
                "{short:<13}  {mark} {:<32}  {:<6}  {patient}",
                item.title, item.priority
            )
        })
        .collect()
}

const fn status_label(patient: &Patient) -> &'static str {
    use ward_core::models::PatientStatus;
    match patient.status {
        PatientStatus::Admitted => "admitted",
        PatientStatus::Observation => "observation",
        PatientStatus::Critical => "critical",
        PatientStatus::Discharged => "discharged",
    }
}

const fn priority_label(task: &Task) -> &'static str {
    use ward_core::models::TaskPriority;
    match task.priority {
        TaskPriority::Low => "low",
        TaskPriority::Normal => "normal",
        TaskPriority::High => "high",
    }
}
