use std::io;
use std::thread;

use log::{info, warn};

use lidarbot_core::StopSignal;

/// Raise `stop` on the first Ctrl+C. The listener runs on its own thread with
/// a current-thread runtime and lives until the process exits.
pub fn watch_ctrl_c(stop: StopSignal) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    thread::Builder::new().name("ctrl-c".into()).spawn(move || {
        runtime.block_on(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received, shutting down");
                    stop.raise();
                }
                Err(e) => warn!("cannot listen for Ctrl+C: {}", e),
            }
        })
    })?;
    Ok(())
}
