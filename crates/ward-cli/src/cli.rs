use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use ward_core::models::{PatientStatus, RecordKind, TaskPriority};

#[derive(Parser)]
#[command(name = "ward")]
#[command(about = "Manage ward patients and tasks offline, sync when connected")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage wards (units)
    Unit {
        #[command(subcommand)]
        command: UnitCommands,
    },
    /// Manage patients
    Patient {
        #[command(subcommand)]
        command: PatientCommands,
    },
    /// Manage care tasks
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Show the outbox: queue counts and unsynced mutations
    Queue {
        /// List permanently failed mutations instead of pending ones
        #[arg(long)]
        failed: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Push queued mutations, then pull the latest server state
    Sync {
        /// Save the whole local aggregate instead of draining the queue
        #[arg(long)]
        save: bool,
        /// With --save: overwrite even when the server has moved on
        #[arg(long, requires = "save")]
        force: bool,
        /// With --save: allow replacing a populated patient list with an empty one
        #[arg(long, requires = "save")]
        confirm_wipe: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove synced mutations older than the retention window
    Purge,
    /// Manage the 30-day trash
    Trash {
        #[command(subcommand)]
        command: TrashCommands,
    },
    /// Hand patients over between accounts
    Inbox {
        #[command(subcommand)]
        command: InboxCommands,
    },
}

#[derive(Subcommand)]
pub enum UnitCommands {
    /// Create a ward
    Add {
        /// Ward name
        name: Vec<String>,
        /// Floor or building section
        #[arg(long)]
        floor: Option<String>,
    },
    /// List wards
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum PatientCommands {
    /// Admit a patient
    Add {
        /// Patient name
        name: Vec<String>,
        /// Ward ID or unique ID prefix
        #[arg(long)]
        unit: Option<String>,
        /// Bed label
        #[arg(long)]
        bed: Option<String>,
        /// Working diagnosis
        #[arg(long)]
        diagnosis: Option<String>,
    },
    /// List patients
    List {
        /// Only patients on this ward (ID or unique ID prefix)
        #[arg(long)]
        unit: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change a patient's details
    Edit {
        /// Patient ID or unique ID prefix
        id: String,
        /// Bed label
        #[arg(long)]
        bed: Option<String>,
        /// Working diagnosis
        #[arg(long)]
        diagnosis: Option<String>,
        /// Clinical status
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
    },
    /// Remove a patient (soft delete, synced like any other edit)
    #[command(alias = "rm")]
    Remove {
        /// Patient ID or unique ID prefix
        id: String,
    },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Add a task for a patient
    Add {
        /// Patient ID or unique ID prefix
        patient: String,
        /// Task title
        title: Vec<String>,
        #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
        priority: PriorityArg,
    },
    /// Mark a task as done
    Done {
        /// Task ID or unique ID prefix
        id: String,
    },
    /// List tasks
    List {
        /// Only tasks for this patient (ID or unique ID prefix)
        #[arg(long)]
        patient: Option<String>,
        /// Include completed tasks
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum TrashCommands {
    /// List trashed records
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Move records to the trash
    Move {
        /// Kind of the records
        #[arg(value_enum)]
        kind: KindArg,
        /// Record IDs or unique ID prefixes
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Restore trashed records
    Restore {
        /// Trashed record IDs
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Permanently delete trashed records (all when no IDs are given)
    Empty {
        /// Trashed record IDs
        ids: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum InboxCommands {
    /// Send a copy of a patient to another account
    Send {
        /// Receiving account
        to: String,
        /// Patient ID or unique ID prefix
        patient: String,
        /// Handover note
        #[arg(long)]
        note: Option<String>,
    },
    /// Fetch pending handovers
    Check {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Accept a handover into this account
    Accept {
        /// Inbox item ID
        id: String,
    },
    /// Decline a handover
    Decline {
        /// Inbox item ID
        id: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Patient,
    Task,
    Unit,
}

impl From<KindArg> for RecordKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Patient => Self::Patient,
            KindArg::Task => Self::Task,
            KindArg::Unit => Self::Ward,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    Admitted,
    Observation,
    Critical,
    Discharged,
}

impl From<StatusArg> for PatientStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Admitted => Self::Admitted,
            StatusArg::Observation => Self::Observation,
            StatusArg::Critical => Self::Critical,
            StatusArg::Discharged => Self::Discharged,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    Low,
    Normal,
    High,
}

impl From<PriorityArg> for TaskPriority {
    fn from(value: PriorityArg) -> Self {
        match value {
            PriorityArg::Low => Self::Low,
            PriorityArg::Normal => Self::Normal,
            PriorityArg::High => Self::High,
        }
    }
}
