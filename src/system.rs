//! Process restart.
//!
//! A restart replaces the running process with a fresh copy of itself, same
//! executable and arguments. Everything is rebuilt from the config file and
//! the persisted state, which is the point.

use color_eyre::{eyre::eyre, Result};
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::Duration;
use tracing::{error, info};

use crate::context::RestartReason;

/// Waits `delay` and re-executes the current binary. Only returns on failure.
pub async fn restart_process(reason: RestartReason, delay: Duration) -> Result<()> {
    info!("Restarting in {:?}: {}", delay, reason);
    tokio::time::sleep(delay).await;

    let exe = std::env::current_exe().map_err(|e| eyre!("Cannot locate own executable: {}", e))?;
    let err = Command::new(&exe).args(std::env::args_os().skip(1)).exec();

    error!("Re-exec of {} failed: {}", exe.display(), err);
    Err(eyre!("Restart failed: {}", err))
}
