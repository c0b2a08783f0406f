use std::path::Path;

use ward_core::models::{Patient, PatientStatus, Record, RecordKind};
use ward_core::util::normalize_text_option;

use crate::commands::common::{
    format_patient_lines, normalize_words, open_data, patient_to_list_item, patients,
    resolve_patient, resolve_unit, settle, short_id, tasks, units, CliData, PatientListItem,
};
use crate::error::CliError;

#[derive(Debug, Default)]
pub struct PatientEdit {
    pub bed: Option<String>,
    pub diagnosis: Option<String>,
    pub status: Option<PatientStatus>,
}

impl PatientEdit {
    const fn is_empty(&self) -> bool {
        self.bed.is_none() && self.diagnosis.is_none() && self.status.is_none()
    }
}

pub async fn add_patient(
    data: &CliData,
    name: &[String],
    unit: Option<&str>,
    bed: Option<String>,
    diagnosis: Option<String>,
) -> Result<Patient, CliError> {
    let name = normalize_words(name).ok_or(CliError::EmptyName)?;
    let mut patient = Patient::new(name);
    if let Some(query) = unit {
        patient = patient.in_unit(resolve_unit(data, query)?.id);
    }
    patient.bed = normalize_text_option(bed);
    patient.diagnosis = normalize_text_option(diagnosis);
    data.add(patient.clone()).await?;
    Ok(patient)
}

/// Active patients, optionally limited to one ward, sorted by bed then name
pub async fn list_patients(
    data: &CliData,
    unit: Option<&str>,
) -> Result<Vec<Patient>, CliError> {
    let mut listed = match unit {
        Some(query) => {
            let unit = resolve_unit(data, query)?;
            data.local()
                .records_by_parent(RecordKind::Patient, &unit.id)
                .await?
                .into_iter()
                .filter_map(|record| match record {
                    Record::Patient(patient) => Some(patient),
                    _ => None,
                })
                .collect()
        }
        None => patients(data),
    };
    listed.sort_by(|a, b| a.bed.cmp(&b.bed).then_with(|| a.name.cmp(&b.name)));
    Ok(listed)
}

pub async fn edit_patient(
    data: &CliData,
    query: &str,
    edit: PatientEdit,
) -> Result<Patient, CliError> {
    if edit.is_empty() {
        return Err(CliError::NothingToEdit);
    }
    let mut patient = resolve_patient(data, query)?;
    if let Some(bed) = edit.bed {
        patient.bed = normalize_text_option(Some(bed));
    }
    if let Some(diagnosis) = edit.diagnosis {
        patient.diagnosis = normalize_text_option(Some(diagnosis));
    }
    if let Some(status) = edit.status {
        patient.status = status;
    }
    data.update(patient.clone()).await?;
    Ok(patient)
}

pub async fn remove_patient(data: &CliData, query: &str) -> Result<Patient, CliError> {
    let patient = resolve_patient(data, query)?;
    data.delete(RecordKind::Patient, &patient.id).await?;
    Ok(patient)
}

pub async fn run_patient_add(
    name: &[String],
    unit: Option<&str>,
    bed: Option<String>,
    diagnosis: Option<String>,
    db_path: &Path,
) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    let patient = add_patient(&data, name, unit, bed, diagnosis).await?;
    settle(&data).await;
    println!("Admitted {} ({})", patient.name, short_id(&patient.id));
    Ok(())
}

pub async fn run_patient_list(
    unit: Option<&str>,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    let all_units = units(&data);
    let all_tasks = tasks(&data);
    let items = list_patients(&data, unit)
        .await?
        .iter()
        .map(|patient| patient_to_list_item(patient, &all_units, &all_tasks))
        .collect::<Vec<PatientListItem>>();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("No patients found.");
        return Ok(());
    }

    for line in format_patient_lines(&items) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_patient_edit(
    query: &str,
    edit: PatientEdit,
    db_path: &Path,
) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    let patient = edit_patient(&data, query, edit).await?;
    settle(&data).await;
    println!("Updated {} ({})", patient.name, short_id(&patient.id));
    Ok(())
}

pub async fn run_patient_remove(query: &str, db_path: &Path) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    let patient = remove_patient(&data, query).await?;
    settle(&data).await;
    println!("Removed {} ({})", patient.name, short_id(&patient.id));
    Ok(())
}
