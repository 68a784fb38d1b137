//! Persona drift monitor for AI roleplay characters.
//!
//! Scores every character reply on calibrated behavioral dimensions, detects
//! statistically significant drift and steers the character back with
//! injected author's notes. The host chat application plugs in through the
//! traits in [`host`] and pushes [`HostEvent`]s into a [`Supervisor`].

pub mod anthropic;
pub mod backend;
pub mod calibration;
pub mod cli_bridge;
pub mod correction;
pub mod db;
pub mod dimensions;
pub mod drift;
pub mod error;
pub mod host;
pub mod logging;
pub mod monitor;
pub mod openai;
pub mod report;
pub mod scoring;
pub mod session;
pub mod settings;

#[cfg(test)]
mod testing;

use std::path::Path;
use std::sync::Arc;

pub use backend::{build_backend, AnalysisBackend};
pub use calibration::calibrate_dimensions;
pub use db::Store;
pub use dimensions::{snap_to_discrete, ActiveDimension, CATALOG};
pub use error::{AnchorError, BackendError, Result};
pub use host::{ChatHost, HostEvent};
pub use monitor::{CycleOutcome, Monitor, Supervisor};
pub use report::{export_index, export_report, SessionReport, Verdict};
pub use settings::Settings;

/// Open the store, load settings, start logging and build a supervisor for
/// `host`.
pub fn start(db_path: &Path, host: Arc<dyn ChatHost>) -> Result<Supervisor> {
    let store = Arc::new(Store::open(db_path)?);
    let settings = store.load_settings()?;

    logging::init_logging(settings.log_dir.as_deref())?;
    match logging::cleanup_old_logs() {
        Ok(0) => {}
        Ok(removed) => logging::log_session(None, &format!("Removed {} old log files", removed)),
        Err(e) => logging::log_error(None, &format!("Log cleanup failed: {}", e)),
    }

    let backend = build_backend(&settings.backend)?;
    logging::log_session(
        None,
        &format!("Starting with {} backend (enabled: {})", backend.name(), settings.enabled),
    );
    Supervisor::new(host, backend, store, settings)
}
