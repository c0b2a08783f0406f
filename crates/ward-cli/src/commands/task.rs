use std::path::Path;

use ward_core::models::{Task, TaskPriority};

use crate::commands::common::{
    format_task_lines, normalize_words, open_data, patients, resolve_patient, resolve_task,
    settle, short_id, task_to_list_item, tasks, CliData, TaskListItem,
};
use crate::error::CliError;

pub async fn add_task(
    data: &CliData,
    patient: &str,
    title: &[String],
    priority: TaskPriority,
) -> Result<Task, CliError> {
    let title = normalize_words(title).ok_or(CliError::EmptyTitle)?;
    let patient = resolve_patient(data, patient)?;
    let mut task = Task::new(patient.id, title);
    task.priority = priority;
    data.add(task.clone()).await?;
    Ok(task)
}

pub async fn complete_task(data: &CliData, query: &str) -> Result<Task, CliError> {
    let mut task = resolve_task(data, query)?;
    if task.done {
        return Ok(task);
    }
    task.done = true;
    data.update(task.clone()).await?;
    Ok(task)
}

/// Tasks, open ones first, then by priority (high first)
pub fn list_tasks(
    data: &CliData,
    patient: Option<&str>,
    include_done: bool,
) -> Result<Vec<Task>, CliError> {
    let patient_id = patient
        .map(|query| resolve_patient(data, query).map(|patient| patient.id))
        .transpose()?;
    let mut listed = tasks(data)
        .into_iter()
        .filter(|task| include_done || !task.done)
        .filter(|task| patient_id.as_ref().is_none_or(|id| &task.patient_id == id))
        .collect::<Vec<_>>();
    listed.sort_by_key(|task| (task.done, priority_rank(task.priority), task.updated_at));
    Ok(listed)
}

const fn priority_rank(priority: TaskPriority) -> u8 {
    match priority {
        TaskPriority::High => 0,
        TaskPriority::Normal => 1,
        TaskPriority::Low => 2,
    }
}

pub async fn run_task_add(
    patient: &str,
    title: &[String],
    priority: TaskPriority,
    db_path: &Path,
) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    let task = add_task(&data, patient, title, priority).await?;
    settle(&data).await;
    println!("Added task {} ({})", task.title, short_id(&task.id));
    Ok(())
}

pub async fn run_task_done(query: &str, db_path: &Path) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    let task = complete_task(&data, query).await?;
    settle(&data).await;
    println!("Done: {}", task.title);
    Ok(())
}

pub async fn run_task_list(
    patient: Option<&str>,
    include_done: bool,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    let all_patients = patients(&data);
    let items = list_tasks(&data, patient, include_done)?
        .iter()
        .map(|task| task_to_list_item(task, &all_patients))
        .collect::<Vec<TaskListItem>>();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("No open tasks.");
        return Ok(());
    }

    for line in format_task_lines(&items) {
        println!("{line}");
    }
    Ok(())
}
