//! Undo of a partially started load.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::Error;
use crate::executor::{run_operation, Recorder};
use crate::lifecycle::{EventKind, Operation, PluginEvent, MANAGER_EVENT_SOURCE};
use crate::plugin::PluginHandle;
use crate::runtime::Runtime;

/// What happened to one plugin during rollback.
#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    /// Plugin ID.
    pub plugin_id: String,
    /// Stop failure, if any.
    pub stop_error: Option<String>,
    /// Resource cleanup failure, if any.
    pub cleanup_error: Option<String>,
    /// Time spent on this plugin.
    pub duration: Duration,
}

impl RollbackOutcome {
    /// True when both stop and cleanup succeeded.
    pub fn succeeded(&self) -> bool {
        self.stop_error.is_none() && self.cleanup_error.is_none()
    }
}

/// Summary of a rollback run.
#[derive(Debug, Clone, Default)]
pub struct RollbackReport {
    /// Plugins the rollback tried to undo.
    pub attempted: usize,
    /// Plugins stopped and cleaned up without error.
    pub succeeded: usize,
    /// Plugins with a stop or cleanup failure.
    pub failed: usize,
    /// Total rollback time.
    pub duration: Duration,
    /// Per-plugin outcomes, in the order they were undone.
    pub outcomes: Vec<RollbackOutcome>,
}

impl RollbackReport {
    /// IDs in the order they were undone.
    pub fn order(&self) -> Vec<&str> {
        self.outcomes.iter().map(|o| o.plugin_id.as_str()).collect()
    }

    /// Outcomes that had a failure.
    pub fn failures(&self) -> impl Iterator<Item = &RollbackOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded())
    }
}

impl fmt::Display for RollbackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rolled back {}/{} plugins, {} failed, in {:?}",
            self.succeeded, self.attempted, self.failed, self.duration
        )
    }
}

/// Tracks plugins that completed start during one load and undoes them on failure.
#[derive(Debug, Default)]
pub(crate) struct RollbackManager {
    started: Mutex<Vec<PluginHandle>>,
}

impl RollbackManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a plugin that just completed start.
    pub(crate) fn record(&self, handle: PluginHandle) {
        self.started.lock().push(handle);
    }

    pub(crate) fn started_ids(&self) -> Vec<String> {
        self.started
            .lock()
            .iter()
            .map(|h| h.id().to_string())
            .collect()
    }

    /// Stop and clean up every started plugin, most recent first.
    ///
    /// Always returns an error wrapping `cause`; which variant depends on
    /// whether the rollback itself was clean.
    pub(crate) fn rollback(
        &self,
        cause: Error,
        runtime: &Runtime,
        stop_timeout: Duration,
        recorder: &Recorder,
    ) -> Error {
        let started = std::mem::take(&mut *self.started.lock());
        let began = Instant::now();
        let mut report = RollbackReport {
            attempted: started.len(),
            ..RollbackReport::default()
        };

        tracing::warn!(plugins = started.len(), cause = %cause, "rolling back started plugins");

        for handle in started.iter().rev() {
            let at = Instant::now();
            let stop_error = run_operation(handle, Operation::Stop, runtime, stop_timeout, recorder)
                .err()
                .map(|e| e.to_string());
            let cleanup_error = runtime
                .resources()
                .cleanup(handle.id())
                .err()
                .map(|e| e.to_string());

            let outcome = RollbackOutcome {
                plugin_id: handle.id().to_string(),
                stop_error,
                cleanup_error,
                duration: at.elapsed(),
            };
            if outcome.succeeded() {
                report.succeeded += 1;
            } else {
                report.failed += 1;
                tracing::error!(
                    plugin_id = %outcome.plugin_id,
                    stop_error = ?outcome.stop_error,
                    cleanup_error = ?outcome.cleanup_error,
                    "rollback of plugin failed"
                );
            }
            report.outcomes.push(outcome);
        }

        report.duration = began.elapsed();
        recorder.rollback(report.failed);

        runtime.emit(
            PluginEvent::new(MANAGER_EVENT_SOURCE, EventKind::RollbackCompleted)
                .with("total", report.attempted as u64)
                .with("successful", report.succeeded as u64)
                .with("failed", report.failed as u64)
                .with("duration_ms", report.duration.as_millis() as u64)
                .with("cause", cause.to_string()),
        );

        if report.failed > 0 {
            tracing::error!(
                attempted = report.attempted,
                failed = report.failed,
                took_ms = report.duration.as_millis() as u64,
                "rollback completed with failures"
            );
            Error::RollbackFailed {
                cause: Box::new(cause),
                report,
            }
        } else {
            tracing::error!(
                attempted = report.attempted,
                took_ms = report.duration.as_millis() as u64,
                "plugin startup aborted, rollback completed"
            );
            Error::StartupAborted {
                cause: Box::new(cause),
                report,
            }
        }
    }
}
