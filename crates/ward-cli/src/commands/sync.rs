use std::path::Path;

use serde::Serialize;
use ward_core::remote::SaveOutcome;
use ward_core::{FlushReport, PullOutcome, SaveOptions};

use crate::commands::common::{open_data, require_remote, CliData};
use crate::error::CliError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub flush: FlushReport,
    /// Server revision after the pull; `None` when the pull could not run
    pub rev: Option<u64>,
    /// Records replaced by the pull (0 when already up to date)
    pub pulled: usize,
}

/// Drain the queue, then pull whatever the server has beyond our revision
pub async fn sync_once(data: &CliData) -> Result<SyncSummary, CliError> {
    let flush = data.flush().await?;
    let (rev, pulled) = match data.pull().await {
        Ok(PullOutcome::Offline) => (None, 0),
        Ok(PullOutcome::UpToDate { rev }) => (Some(rev), 0),
        Ok(PullOutcome::Updated { rev, records }) => (Some(rev), records),
        Err(ward_core::Error::Remote(error)) => {
            tracing::warn!(%error, "Pull failed");
            (None, 0)
        }
        Err(error) => return Err(error.into()),
    };
    Ok(SyncSummary { flush, rev, pulled })
}

pub fn format_sync_summary(summary: &SyncSummary) -> Vec<String> {
    let flush = &summary.flush;
    let mut lines = vec![format!(
        "Pushed {} change(s); {} retrying, {} deferred, {} rejected",
        flush.synced, flush.retried, flush.deferred, flush.failed
    )];
    match summary.rev {
        Some(rev) if summary.pulled > 0 => {
            lines.push(format!("Pulled {} record(s) at server rev {rev}", summary.pulled));
        }
        Some(rev) => lines.push(format!("Up to date at server rev {rev}")),
        None => lines.push("Remote unreachable; changes stay queued".to_string()),
    }
    if flush.failed > 0 {
        lines.push("Rejected changes were rolled back; see `ward queue --failed`".to_string());
    }
    lines
}

pub async fn run_sync(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    require_remote(&data)?;
    let summary = sync_once(&data).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    for line in format_sync_summary(&summary) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_save(options: SaveOptions, db_path: &Path) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    require_remote(&data)?;
    let base_rev = data.client_rev().await?;

    match data.save_all(options).await? {
        SaveOutcome::Saved { rev } => {
            println!("Saved all records at server rev {rev}");
            Ok(())
        }
        SaveOutcome::Conflict { server_rev, .. } => Err(CliError::SaveConflict {
            base_rev,
            server_rev,
        }),
        SaveOutcome::Safeguard {
            server_patient_count,
        } => Err(CliError::SaveBlocked(server_patient_count)),
    }
}
