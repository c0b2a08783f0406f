use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] ward_core::Error),
    #[error(transparent)]
    Config(#[from] ward_core::ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Name cannot be empty")]
    EmptyName,
    #[error("Task title cannot be empty")]
    EmptyTitle,
    #[error("No {kind} found for id/prefix: {query}")]
    RecordNotFound { kind: &'static str, query: String },
    #[error("{0}")]
    AmbiguousId(String),
    #[error("Nothing to change; pass at least one of --bed, --diagnosis or --status")]
    NothingToEdit,
    #[error(
        "Save rejected: the server is at rev {server_rev} but this device last saw rev {base_rev}. Run `ward sync` to pull, or `ward sync --save --force` to overwrite."
    )]
    SaveConflict { base_rev: u64, server_rev: u64 },
    #[error(
        "Save blocked: it would remove all {0} patient(s) on the server. Re-run with --confirm-wipe if that is intended."
    )]
    SaveBlocked(usize),
    #[error("Remote sync is not configured. Set WARD_REMOTE_URL (and WARD_USER) to enable it.")]
    RemoteNotConfigured,
}
