//! Phased concurrent lifecycle execution.
//!
//! Every plugin call runs on its own worker thread and is raced against the
//! operation timeout. A call that misses its deadline is abandoned, not killed:
//! the worker keeps running until the plugin returns and its late completion is
//! logged.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::ExecutionLimits;
use crate::error::{Error, Result};
use crate::lifecycle::{EventKind, LifecycleState, Operation, PluginEvent};
use crate::plugin::{CancelSignal, Plugin, PluginHandle};
use crate::rollback::RollbackManager;
use crate::runtime::{PluginContext, Runtime};

#[cfg(feature = "metrics-prometheus")]
use crate::metrics::PluginMetrics;

thread_local! {
    static CAPTURE_PANICS: Cell<bool> = const { Cell::new(false) };
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook that records a backtrace for lifecycle worker threads
/// and defers to the previous hook everywhere else.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if CAPTURE_PANICS.with(Cell::get) {
                let trace = Backtrace::force_capture().to_string();
                LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            } else {
                previous(info);
            }
        }));
    });
}

fn take_backtrace() -> String {
    LAST_BACKTRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_default()
}

/// Render a panic payload as text.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Counting semaphore bounding in-flight lifecycle calls.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore with `permits` slots (at least one).
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits.max(1)),
            available: Condvar::new(),
        }
    }

    /// Block until a slot is free.
    pub fn acquire(&self) -> SemaphorePermit<'_> {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
        SemaphorePermit { semaphore: self }
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return None;
        }
        *permits -= 1;
        Some(SemaphorePermit { semaphore: self })
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        *self.permits.lock()
    }

    fn release(&self) {
        *self.permits.lock() += 1;
        self.available.notify_one();
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("available", &self.available())
            .finish()
    }
}

/// Slot held until dropped.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Optional metrics sink threaded through execution.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    #[cfg(feature = "metrics-prometheus")]
    metrics: Option<Arc<PluginMetrics>>,
}

impl Recorder {
    #[cfg(feature = "metrics-prometheus")]
    pub(crate) fn new(metrics: Option<Arc<PluginMetrics>>) -> Self {
        Self { metrics }
    }

    #[cfg(feature = "metrics-prometheus")]
    pub(crate) fn operation(&self, operation: Operation, took: Duration, result: &Result<Duration>) {
        if let Some(metrics) = &self.metrics {
            metrics.record_operation(operation, took.as_secs_f64(), result);
        }
    }

    #[cfg(not(feature = "metrics-prometheus"))]
    pub(crate) fn operation(&self, _: Operation, _: Duration, _: &Result<Duration>) {}

    #[cfg(feature = "metrics-prometheus")]
    pub(crate) fn load(&self, took: Duration, succeeded: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_load(took.as_secs_f64(), succeeded);
        }
    }

    #[cfg(not(feature = "metrics-prometheus"))]
    pub(crate) fn load(&self, _: Duration, _: bool) {}

    #[cfg(feature = "metrics-prometheus")]
    pub(crate) fn rollback(&self, failed: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.record_rollback(failed);
        }
    }

    #[cfg(not(feature = "metrics-prometheus"))]
    pub(crate) fn rollback(&self, _: usize) {}
}

fn invoke(
    plugin: &dyn Plugin,
    operation: Operation,
    ctx: &PluginContext,
    cancel: &CancelSignal,
) -> Result<()> {
    match (plugin.as_cancellable(), operation) {
        (Some(c), Operation::Initialize) => c.initialize_with(ctx, cancel),
        (Some(c), Operation::Start) => c.start_with(cancel),
        (Some(c), Operation::Stop) => c.stop_with(cancel),
        (None, Operation::Initialize) => plugin.initialize(ctx),
        (None, Operation::Start) => plugin.start(),
        (None, Operation::Stop) => plugin.stop(),
    }
}

struct PanicReport {
    message: String,
    backtrace: String,
}

/// Run one lifecycle call on a worker thread, bounded by `timeout`.
///
/// Returns how long the call took. Plugin errors come back wrapped in
/// [`Error::Lifecycle`]; panics become [`Error::Panic`] and a missed deadline
/// becomes [`Error::Timeout`].
pub(crate) fn guarded_call(
    plugin: &Arc<dyn Plugin>,
    operation: Operation,
    ctx: &PluginContext,
    timeout: Duration,
) -> Result<Duration> {
    install_panic_hook();

    let id = plugin.id().to_string();
    let cancel = CancelSignal::with_timeout(timeout);
    let (tx, rx) = mpsc::channel::<std::result::Result<Result<()>, PanicReport>>();
    let started = Instant::now();

    let worker_plugin = plugin.clone();
    let worker_ctx = ctx.clone();
    let worker_cancel = cancel.clone();
    let worker_id = id.clone();
    thread::Builder::new()
        .name(format!("{}-{}", operation, id))
        .spawn(move || {
            CAPTURE_PANICS.with(|flag| flag.set(true));
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                invoke(worker_plugin.as_ref(), operation, &worker_ctx, &worker_cancel)
            }))
            .map_err(|payload| PanicReport {
                message: panic_message(payload.as_ref()),
                backtrace: take_backtrace(),
            });

            if tx.send(outcome).is_err() {
                tracing::warn!(
                    plugin_id = %worker_id,
                    operation = %operation,
                    took_ms = started.elapsed().as_millis() as u64,
                    "plugin finished {} after its timeout, result discarded",
                    operation
                );
            }
        })
        .map_err(|e| {
            Error::plugin(format!("failed to spawn {} worker for {}: {}", operation, id, e))
        })?;

    let received = rx.recv_timeout(timeout);
    drop(rx);

    match received {
        Ok(Ok(Ok(()))) => {
            let took = started.elapsed();
            if took > timeout / 2 {
                tracing::warn!(
                    plugin_id = %id,
                    operation = %operation,
                    took_ms = took.as_millis() as u64,
                    timeout_ms = timeout.as_millis() as u64,
                    "slow plugin operation"
                );
            }
            Ok(took)
        }
        Ok(Ok(Err(source))) => Err(Error::Lifecycle {
            plugin: id,
            operation,
            source: Box::new(source),
        }),
        Ok(Err(report)) => Err(Error::Panic {
            plugin: id,
            operation,
            message: report.message,
            backtrace: report.backtrace,
        }),
        Err(RecvTimeoutError::Timeout) => {
            cancel.cancel();
            Err(Error::Timeout {
                plugin: id,
                operation,
                timeout,
            })
        }
        Err(RecvTimeoutError::Disconnected) => Err(Error::Panic {
            plugin: id,
            operation,
            message: "worker exited without reporting a result".to_string(),
            backtrace: String::new(),
        }),
    }
}

/// Drive one plugin through one operation with full state, event, and
/// cleanup bookkeeping.
///
/// A failed initialize or start also releases the plugin's resources; after a
/// failed stop the caller decides.
pub(crate) fn run_operation(
    handle: &PluginHandle,
    operation: Operation,
    runtime: &Runtime,
    timeout: Duration,
    recorder: &Recorder,
) -> Result<()> {
    let plugin = handle.plugin();
    let id = handle.id();
    let ctx_aware = plugin.as_cancellable().is_some();
    tracing::debug!(plugin_id = id, operation = %operation, ctx_aware, "dispatching");

    handle.set_state(operation.in_progress_state());
    runtime.emit(
        PluginEvent::new(id, operation.begin_event())
            .with("plugin_name", plugin.name())
            .with("step", operation.to_string())
            .with("timeout_ms", timeout.as_millis() as u64)
            .with("ctx_aware", ctx_aware),
    );

    let ctx = runtime.for_plugin(id);
    let started = Instant::now();
    let result = guarded_call(plugin, operation, &ctx, timeout);
    recorder.operation(operation, started.elapsed(), &result);

    match result {
        Ok(took) => {
            handle.set_state(operation.success_state());
            let took_ms = took.as_millis() as u64;
            runtime.emit(
                PluginEvent::new(id, operation.end_event())
                    .with("plugin_name", plugin.name())
                    .with("took_ms", took_ms),
            );
            tracing::info!(plugin_id = id, operation = %operation, took_ms, "plugin {} ok", operation);
            Ok(())
        }
        Err(err) => {
            handle.set_state(LifecycleState::Failed);
            if let Error::Panic { backtrace, .. } = &err {
                tracing::error!(plugin_id = id, operation = %operation, error = %err, backtrace = %backtrace, "plugin panicked");
            } else {
                tracing::error!(plugin_id = id, operation = %operation, error = %err, "plugin operation failed");
            }

            if operation != Operation::Stop {
                if let Err(cleanup) = runtime.resources().cleanup(id) {
                    tracing::warn!(plugin_id = id, error = %cleanup, "cleanup after failure had errors");
                }
            }

            let mut event = PluginEvent::new(id, EventKind::ErrorOccurred)
                .with("plugin_name", plugin.name())
                .with("step", operation.to_string())
                .with("error", err.to_string());
            if let Error::Timeout { timeout, .. } = &err {
                event = event.with("timeout_ms", timeout.as_millis() as u64);
            }
            runtime.emit(event);
            Err(err)
        }
    }
}

/// One load run: levels executed in order, plugins within a level in parallel.
pub(crate) struct LoadRun<'a> {
    runtime: &'a Runtime,
    limits: ExecutionLimits,
    semaphore: Semaphore,
    rollback: RollbackManager,
    recorder: &'a Recorder,
}

impl<'a> LoadRun<'a> {
    pub(crate) fn new(runtime: &'a Runtime, limits: ExecutionLimits, recorder: &'a Recorder) -> Self {
        Self {
            runtime,
            limits,
            semaphore: Semaphore::new(limits.start_parallelism()),
            rollback: RollbackManager::new(),
            recorder,
        }
    }

    /// Execute every level; on the first failing level, roll back what started.
    pub(crate) fn execute(&self, levels: &[Vec<PluginHandle>]) -> Result<()> {
        for (level, plugins) in levels.iter().enumerate() {
            let started = Instant::now();
            if let Err(cause) = self.run_level(plugins) {
                tracing::error!(level, error = %cause, "level failed, rolling back");
                return Err(self.rollback.rollback(
                    cause,
                    self.runtime,
                    self.limits.stop_timeout(),
                    self.recorder,
                ));
            }
            tracing::info!(
                level,
                plugins = plugins.len(),
                took_ms = started.elapsed().as_millis() as u64,
                "level started"
            );
        }
        Ok(())
    }

    fn run_level(&self, plugins: &[PluginHandle]) -> Result<()> {
        let first_error: Mutex<Option<Error>> = Mutex::new(None);
        let aborted = AtomicBool::new(false);

        let record = |err: Error| {
            aborted.store(true, Ordering::Release);
            let mut slot = first_error.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        };

        thread::scope(|s| {
            let workers: Vec<_> = plugins
                .iter()
                .map(|handle| {
                    let record = &record;
                    let aborted = &aborted;
                    s.spawn(move || {
                        let _permit = self.semaphore.acquire();
                        if aborted.load(Ordering::Acquire) {
                            tracing::debug!(plugin_id = handle.id(), "level aborted, skipping");
                            return;
                        }
                        if let Err(err) = self.bring_up(handle) {
                            record(err);
                        }
                    })
                })
                .collect();

            // Barrier: every plugin in the level finishes before the next one begins.
            for (handle, worker) in plugins.iter().zip(workers) {
                if let Err(payload) = worker.join() {
                    record(Error::Panic {
                        plugin: handle.id().to_string(),
                        operation: Operation::Start,
                        message: panic_message(payload.as_ref()),
                        backtrace: String::new(),
                    });
                }
            }
        });

        match first_error.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn bring_up(&self, handle: &PluginHandle) -> Result<()> {
        run_operation(
            handle,
            Operation::Initialize,
            self.runtime,
            self.limits.init_timeout(),
            self.recorder,
        )?;
        run_operation(
            handle,
            Operation::Start,
            self.runtime,
            self.limits.start_timeout(),
            self.recorder,
        )?;
        self.rollback.record(handle.clone());
        Ok(())
    }

    /// Plugins that completed start in this run, in completion order.
    #[cfg(test)]
    pub(crate) fn started_ids(&self) -> Vec<String> {
        self.rollback.started_ids()
    }
}
