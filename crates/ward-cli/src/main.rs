//! Ward CLI - manage ward patients and care tasks from the terminal
//!
//! Every write lands in the local database first and syncs when a remote is
//! configured (`WARD_REMOTE_URL`).

mod cli;
mod commands;
mod error;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use ward_core::SaveOptions;

use crate::cli::{
    Cli, Commands, InboxCommands, PatientCommands, TaskCommands, TrashCommands, UnitCommands,
};
use crate::commands::common::resolve_db_path;
use crate::commands::inbox::{
    run_inbox_accept, run_inbox_check, run_inbox_decline, run_inbox_send,
};
use crate::commands::patient::{
    run_patient_add, run_patient_edit, run_patient_list, run_patient_remove, PatientEdit,
};
use crate::commands::queue::{run_purge, run_queue};
use crate::commands::sync::{run_save, run_sync};
use crate::commands::task::{run_task_add, run_task_done, run_task_list};
use crate::commands::trash::{
    run_trash_empty, run_trash_list, run_trash_move, run_trash_restore,
};
use crate::commands::unit::{run_unit_add, run_unit_list};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("ward_cli=info".parse().expect("valid directive"))
                .add_directive("ward_core=warn".parse().expect("valid directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Unit { command } => match command {
            UnitCommands::Add { name, floor } => run_unit_add(&name, floor, &db_path).await,
            UnitCommands::List { json } => run_unit_list(json, &db_path).await,
        },
        Commands::Patient { command } => match command {
            PatientCommands::Add {
                name,
                unit,
                bed,
                diagnosis,
            } => run_patient_add(&name, unit.as_deref(), bed, diagnosis, &db_path).await,
            PatientCommands::List { unit, json } => {
                run_patient_list(unit.as_deref(), json, &db_path).await
            }
            PatientCommands::Edit {
                id,
                bed,
                diagnosis,
                status,
            } => {
                let edit = PatientEdit {
                    bed,
                    diagnosis,
                    status: status.map(Into::into),
                };
                run_patient_edit(&id, edit, &db_path).await
            }
            PatientCommands::Remove { id } => run_patient_remove(&id, &db_path).await,
        },
        Commands::Task { command } => match command {
            TaskCommands::Add {
                patient,
                title,
                priority,
            } => run_task_add(&patient, &title, priority.into(), &db_path).await,
            TaskCommands::Done { id } => run_task_done(&id, &db_path).await,
            TaskCommands::List { patient, all, json } => {
                run_task_list(patient.as_deref(), all, json, &db_path).await
            }
        },
        Commands::Queue { failed, json } => run_queue(failed, json, &db_path).await,
        Commands::Sync {
            save,
            force,
            confirm_wipe,
            json,
        } => {
            if save {
                run_save(SaveOptions { force, confirm_wipe }, &db_path).await
            } else {
                run_sync(json, &db_path).await
            }
        }
        Commands::Purge => run_purge(&db_path).await,
        Commands::Trash { command } => match command {
            TrashCommands::List { json } => run_trash_list(json, &db_path).await,
            TrashCommands::Move { kind, ids } => run_trash_move(kind.into(), &ids, &db_path).await,
            TrashCommands::Restore { ids } => run_trash_restore(&ids, &db_path).await,
            TrashCommands::Empty { ids } => run_trash_empty(&ids, &db_path).await,
        },
        Commands::Inbox { command } => match command {
            InboxCommands::Send { to, patient, note } => {
                run_inbox_send(&to, &patient, note, &db_path).await
            }
            InboxCommands::Check { json } => run_inbox_check(json, &db_path).await,
            InboxCommands::Accept { id } => run_inbox_accept(&id, &db_path).await,
            InboxCommands::Decline { id } => run_inbox_decline(&id, &db_path).await,
        },
    }
}
