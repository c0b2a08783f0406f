//! Ward record models: patients, tasks and wards (units)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Stable identifier of a record.
///
/// Client-created records use UUID v7 (time-sortable); ids received from the
/// remote are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Create a new unique record ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Entity kinds tracked by the sync engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Patient,
    Task,
    Ward,
}

impl RecordKind {
    /// All kinds, in hydration order (parents first)
    pub const ALL: [Self; 3] = [Self::Ward, Self::Patient, Self::Task];

    /// Remote collection name for this kind
    pub const fn collection(self) -> &'static str {
        match self {
            Self::Patient => "patients",
            Self::Task => "tasks",
            Self::Ward => "units",
        }
    }

    /// Singular name used in the `kind` tag of a record payload
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::Task => "task",
            Self::Ward => "ward",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

impl FromStr for RecordKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "patient" | "patients" => Ok(Self::Patient),
            "task" | "tasks" => Ok(Self::Task),
            "ward" | "wards" | "unit" | "units" => Ok(Self::Ward),
            other => Err(Error::InvalidInput(format!("unknown record kind: {other}"))),
        }
    }
}

/// Clinical status of a patient on the ward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PatientStatus {
    #[default]
    Admitted,
    Observation,
    Critical,
    Discharged,
}

/// Task priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// A patient admitted to a ward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: RecordId,
    /// Ward the patient is assigned to
    #[serde(default)]
    pub unit_id: Option<RecordId>,
    pub name: String,
    #[serde(default)]
    pub bed: Option<String>,
    #[serde(default)]
    pub diagnosis: Option<String>,
    #[serde(default)]
    pub status: PatientStatus,
    #[serde(default)]
    pub notes: Option<String>,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<i64>,
}

impl Patient {
    /// Create a new patient with a fresh id
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: RecordId::new(),
            unit_id: None,
            name: name.into(),
            bed: None,
            diagnosis: None,
            status: PatientStatus::Admitted,
            notes: None,
            updated_at: chrono::Utc::now().timestamp_millis(),
            deleted: false,
            deleted_at: None,
        }
    }

    #[must_use]
    pub fn in_unit(mut self, unit_id: RecordId) -> Self {
        self.unit_id = Some(unit_id);
        self
    }

    #[must_use]
    pub fn with_bed(mut self, bed: impl Into<String>) -> Self {
        self.bed = Some(bed.into());
        self
    }
}

/// A care task attached to a patient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: RecordId,
    pub patient_id: RecordId,
    pub title: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub due_at: Option<i64>,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<i64>,
}

impl Task {
    /// Create a new open task for a patient
    #[must_use]
    pub fn new(patient_id: RecordId, title: impl Into<String>) -> Self {
        Self {
            id: RecordId::new(),
            patient_id,
            title: title.into(),
            done: false,
            due_at: None,
            priority: TaskPriority::Normal,
            updated_at: chrono::Utc::now().timestamp_millis(),
            deleted: false,
            deleted_at: None,
        }
    }
}

/// A ward (unit) grouping patients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ward {
    pub id: RecordId,
    pub name: String,
    #[serde(default)]
    pub floor: Option<String>,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<i64>,
}

impl Ward {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: RecordId::new(),
            name: name.into(),
            floor: None,
            updated_at: chrono::Utc::now().timestamp_millis(),
            deleted: false,
            deleted_at: None,
        }
    }
}

/// Any record the engine can store, tagged by kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Record {
    Patient(Patient),
    Task(Task),
    Ward(Ward),
}

impl Record {
    pub const fn kind(&self) -> RecordKind {
        match self {
            Self::Patient(_) => RecordKind::Patient,
            Self::Task(_) => RecordKind::Task,
            Self::Ward(_) => RecordKind::Ward,
        }
    }

    pub const fn id(&self) -> &RecordId {
        match self {
            Self::Patient(patient) => &patient.id,
            Self::Task(task) => &task.id,
            Self::Ward(ward) => &ward.id,
        }
    }

    pub const fn updated_at(&self) -> i64 {
        match self {
            Self::Patient(patient) => patient.updated_at,
            Self::Task(task) => task.updated_at,
            Self::Ward(ward) => ward.updated_at,
        }
    }

    /// Foreign key used by the mirror's parent index
    ///
    /// Patients point at their ward, tasks at their patient; wards have no parent.
    pub const fn parent_id(&self) -> Option<&RecordId> {
        match self {
            Self::Patient(patient) => patient.unit_id.as_ref(),
            Self::Task(task) => Some(&task.patient_id),
            Self::Ward(_) => None,
        }
    }

    pub const fn is_deleted(&self) -> bool {
        match self {
            Self::Patient(patient) => patient.deleted,
            Self::Task(task) => task.deleted,
            Self::Ward(ward) => ward.deleted,
        }
    }

    /// Stamp a new update time
    pub fn touch(&mut self, at: i64) {
        match self {
            Self::Patient(patient) => patient.updated_at = at,
            Self::Task(task) => task.updated_at = at,
            Self::Ward(ward) => ward.updated_at = at,
        }
    }

    /// Set the soft-delete flag and timestamp
    pub fn mark_deleted(&mut self, at: i64) {
        let (deleted, deleted_at, updated_at) = match self {
            Self::Patient(p) => (&mut p.deleted, &mut p.deleted_at, &mut p.updated_at),
            Self::Task(t) => (&mut t.deleted, &mut t.deleted_at, &mut t.updated_at),
            Self::Ward(w) => (&mut w.deleted, &mut w.deleted_at, &mut w.updated_at),
        };
        *deleted = true;
        *deleted_at = Some(at);
        *updated_at = at;
    }

    /// Clear the soft-delete flag
    pub fn clear_deleted(&mut self, at: i64) {
        let (deleted, deleted_at, updated_at) = match self {
            Self::Patient(p) => (&mut p.deleted, &mut p.deleted_at, &mut p.updated_at),
            Self::Task(t) => (&mut t.deleted, &mut t.deleted_at, &mut t.updated_at),
            Self::Ward(w) => (&mut w.deleted, &mut w.deleted_at, &mut w.updated_at),
        };
        *deleted = false;
        *deleted_at = None;
        *updated_at = at;
    }
}

impl From<Patient> for Record {
    fn from(value: Patient) -> Self {
        Self::Patient(value)
    }
}

impl From<Task> for Record {
    fn from(value: Task) -> Self {
        Self::Task(value)
    }
}

impl From<Ward> for Record {
    fn from(value: Ward) -> Self {
        Self::Ward(value)
    }
}

/// The per-user aggregate document held by the remote store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    #[serde(default)]
    pub patients: Vec<Patient>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub units: Vec<Ward>,
}

impl Aggregate {
    /// Number of live (not soft-deleted) patients
    pub fn patient_count(&self) -> usize {
        self.patients.iter().filter(|p| !p.deleted).count()
    }

    /// Records of one kind, in document order
    pub fn records(&self, kind: RecordKind) -> Vec<Record> {
        match kind {
            RecordKind::Patient => self.patients.iter().cloned().map(Record::from).collect(),
            RecordKind::Task => self.tasks.iter().cloned().map(Record::from).collect(),
            RecordKind::Ward => self.units.iter().cloned().map(Record::from).collect(),
        }
    }

    /// Replace one collection; records of other kinds are ignored
    pub fn set_records(&mut self, kind: RecordKind, records: Vec<Record>) {
        match kind {
            RecordKind::Patient => {
                self.patients = records
                    .into_iter()
                    .filter_map(|record| match record {
                        Record::Patient(patient) => Some(patient),
                        _ => None,
                    })
                    .collect();
            }
            RecordKind::Task => {
                self.tasks = records
                    .into_iter()
                    .filter_map(|record| match record {
                        Record::Task(task) => Some(task),
                        _ => None,
                    })
                    .collect();
            }
            RecordKind::Ward => {
                self.units = records
                    .into_iter()
                    .filter_map(|record| match record {
                        Record::Ward(ward) => Some(ward),
                        _ => None,
                    })
                    .collect();
            }
        }
    }

    /// Insert or replace a record in its collection
    pub fn upsert(&mut self, record: Record) {
        let kind = record.kind();
        let mut records = self.records(kind);
        if let Some(slot) = records.iter_mut().find(|r| r.id() == record.id()) {
            *slot = record;
        } else {
            records.push(record);
        }
        self.set_records(kind, records);
    }

    /// Remove a record; returns it when present
    pub fn remove(&mut self, kind: RecordKind, id: &RecordId) -> Option<Record> {
        let mut records = self.records(kind);
        let position = records.iter().position(|r| r.id() == id)?;
        let removed = records.remove(position);
        self.set_records(kind, records);
        Some(removed)
    }

    pub fn get(&self, kind: RecordKind, id: &RecordId) -> Option<Record> {
        self.records(kind).into_iter().find(|r| r.id() == id)
    }
}
