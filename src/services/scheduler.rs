// Background task scheduler
// Runs a closed set of periodic tasks forever. Runs of one task never overlap,
// overruns are reported by a soft watchdog, and a failing or panicking task
// never takes down its siblings.

use futures_util::FutureExt;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::services::persist_runner::PersistSignals;

// =============================================================================
// TASKS
// =============================================================================

pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type TaskFn = Arc<dyn Fn(RunContext) -> TaskFuture + Send + Sync>;

/// What caused a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Tick,
    Manual,
}

/// Handed to the work function on every run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub trigger: Trigger,
    /// Cancelled when the scheduler stops; honouring it is up to the task
    pub cancel: CancellationToken,
}

/// A periodic job. `name` is the identity used for logs, metrics and
/// serialization, so it must be unique within a scheduler.
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub description: String,
    pub period: Duration,
    work: TaskFn,
}

impl Task {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        period: Duration,
        work: F,
    ) -> Self
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            period,
            work: Arc::new(move |ctx| Box::pin(work(ctx))),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    NotStarted,
    Running,
    Stopped,
}

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Lifecycle of one scheduler, handed to each of its loops
#[derive(Debug)]
struct Lifecycle {
    state: AtomicU8,
    shutdown: CancellationToken,
}

impl Lifecycle {
    fn new(shutdown: CancellationToken) -> Self {
        Self {
            state: AtomicU8::new(NOT_STARTED),
            shutdown,
        }
    }

    fn state(&self) -> SchedulerState {
        match self.state.load(Ordering::Acquire) {
            NOT_STARTED => SchedulerState::NotStarted,
            RUNNING if !self.shutdown.is_cancelled() => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }

    fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// NotStarted -> Running; false if the scheduler was ever started
    fn start(&self) -> bool {
        self.state
            .compare_exchange(NOT_STARTED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn stop(&self) {
        self.state.store(STOPPED, Ordering::Release);
        self.shutdown.cancel();
    }
}

// =============================================================================
// METRICS
// =============================================================================

/// Per-task counters, as seen through the scheduler's metrics registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub runs: u64,
    pub failures: u64,
    pub panics: u64,
    pub overruns: u64,
    pub active: i64,
}

struct SchedulerMetrics {
    registry: Registry,
    runs: IntCounterVec,
    failures: IntCounterVec,
    panics: IntCounterVec,
    overruns: IntCounterVec,
    active: IntGaugeVec,
    duration: HistogramVec,
}

impl SchedulerMetrics {
    fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let labels = &["task"];

        let runs = IntCounterVec::new(
            Opts::new("scheduler_task_runs_total", "Completed task runs"),
            labels,
        )?;
        let failures = IntCounterVec::new(
            Opts::new("scheduler_task_failures_total", "Task runs that returned an error"),
            labels,
        )?;
        let panics = IntCounterVec::new(
            Opts::new("scheduler_task_panics_total", "Task runs that panicked"),
            labels,
        )?;
        let overruns = IntCounterVec::new(
            Opts::new(
                "scheduler_task_overruns_total",
                "Task runs that exceeded the watchdog timeout",
            ),
            labels,
        )?;
        let active = IntGaugeVec::new(
            Opts::new("scheduler_task_active", "Task runs currently executing"),
            labels,
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new("scheduler_task_duration_seconds", "Task run duration"),
            labels,
        )?;

        registry.register(Box::new(runs.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(panics.clone()))?;
        registry.register(Box::new(overruns.clone()))?;
        registry.register(Box::new(active.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            runs,
            failures,
            panics,
            overruns,
            active,
            duration,
        })
    }

    fn stats(&self, task: &str) -> TaskStats {
        TaskStats {
            runs: self.runs.with_label_values(&[task]).get(),
            failures: self.failures.with_label_values(&[task]).get(),
            panics: self.panics.with_label_values(&[task]).get(),
            overruns: self.overruns.with_label_values(&[task]).get(),
            active: self.active.with_label_values(&[task]).get(),
        }
    }
}

// =============================================================================
// SCHEDULER
// =============================================================================

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Soft deadline after which a still-running task is reported
    pub task_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared state handed to every spawned loop
struct Runtime {
    lifecycle: Lifecycle,
    metrics: SchedulerMetrics,
    task_timeout: Duration,
}

pub struct Scheduler {
    runtime: Arc<Runtime>,
    tasks: Mutex<Vec<Task>>,
    manual: Mutex<Option<(String, PersistSignals)>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// `shutdown` is the process-wide stop signal; cancelling it stops the
    /// scheduler just like `stop()`.
    pub fn new(
        settings: SchedulerSettings,
        shutdown: CancellationToken,
    ) -> Result<Self, prometheus::Error> {
        Ok(Self {
            runtime: Arc::new(Runtime {
                lifecycle: Lifecycle::new(shutdown),
                metrics: SchedulerMetrics::new()?,
                task_timeout: settings.task_timeout,
            }),
            tasks: Mutex::new(Vec::new()),
            manual: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> SchedulerState {
        self.runtime.lifecycle.state()
    }

    /// Registry holding the per-task metrics
    pub fn registry(&self) -> Registry {
        self.runtime.metrics.registry.clone()
    }

    pub fn task_stats(&self, task: &str) -> TaskStats {
        self.runtime.metrics.stats(task)
    }

    /// Names of the registered tasks, in registration order
    pub fn task_names(&self) -> Vec<String> {
        lock(&self.tasks).iter().map(|t| t.name.clone()).collect()
    }

    /// Add a task. The task set is closed once the scheduler starts.
    ///
    /// # Panics
    /// After `start`, or when a task with the same name already exists.
    pub fn register(&self, task: Task) {
        self.assert_not_started("register");

        let mut tasks = lock(&self.tasks);
        if tasks.iter().any(|t| t.name == task.name) {
            panic!("scheduler: task {} registered twice", task.name);
        }
        debug!(task = %task.name, period = ?task.period, "Registered task");
        tasks.push(task);
    }

    /// Route persist-runner signals into the named task's queue, so manual and
    /// timer runs of that task are serialized together.
    ///
    /// # Panics
    /// After `start`.
    pub fn with_manual_trigger(&self, task: impl Into<String>, signals: PersistSignals) {
        self.assert_not_started("with_manual_trigger");
        *lock(&self.manual) = Some((task.into(), signals));
    }

    /// Spawn one executor and one timer loop per task, plus the loop serving
    /// the manual trigger. Must run inside a tokio runtime.
    ///
    /// # Panics
    /// When called twice, or when the manual trigger names an unknown task.
    pub fn start(&self) {
        if !self.runtime.lifecycle.start() {
            panic!("scheduler: already started");
        }

        let tasks = lock(&self.tasks).clone();
        let mut manual = lock(&self.manual).take();
        if let Some((name, _)) = &manual {
            if !tasks.iter().any(|t| &t.name == name) {
                panic!("scheduler: manual trigger for unknown task {}", name);
            }
        }

        let mut handles = lock(&self.handles);
        for task in tasks {
            // Capacity 1: a tick arriving while one is already queued is
            // folded into it instead of piling up behind a slow run.
            let (tx, rx) = mpsc::channel(1);

            if manual.as_ref().is_some_and(|(name, _)| *name == task.name) {
                if let Some((_, signals)) = manual.take() {
                    handles.push(tokio::spawn(run_manual_trigger(
                        self.runtime.clone(),
                        task.name.clone(),
                        signals,
                        tx.clone(),
                    )));
                }
            }

            handles.push(tokio::spawn(run_timer(
                self.runtime.clone(),
                task.name.clone(),
                task.period,
                tx,
            )));
            handles.push(tokio::spawn(run_executor(self.runtime.clone(), task, rx)));
        }

        info!(loops = handles.len(), "Scheduler started");
    }

    /// Flag the scheduler as stopped. Loops exit at their next wake-up; an
    /// in-flight run is never interrupted.
    pub fn stop(&self) {
        self.runtime.lifecycle.stop();
    }

    /// Stop and wait for every loop to exit, including in-flight runs
    pub async fn shutdown(&self) {
        self.stop();

        let handles = std::mem::take(&mut *lock(&self.handles));
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Scheduler loop ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }

    fn assert_not_started(&self, op: &str) {
        if self.state() != SchedulerState::NotStarted {
            panic!("scheduler: {} called after start", op);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// LOOPS
// =============================================================================

/// Sleep for one period, then queue a tick
async fn run_timer(
    runtime: Arc<Runtime>,
    name: String,
    period: Duration,
    tx: mpsc::Sender<Trigger>,
) {
    loop {
        tokio::select! {
            _ = runtime.lifecycle.shutdown.cancelled() => break,
            _ = sleep(period) => {},
        }
        if !runtime.lifecycle.is_running() {
            break;
        }

        match tx.try_send(Trigger::Tick) {
            Ok(()) => {},
            Err(TrySendError::Full(_)) => {
                debug!(task = %name, "Previous run still queued, tick coalesced");
            },
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

/// Forward persist-runner signals into the task queue
async fn run_manual_trigger(
    runtime: Arc<Runtime>,
    name: String,
    mut signals: PersistSignals,
    tx: mpsc::Sender<Trigger>,
) {
    loop {
        let signal = tokio::select! {
            _ = runtime.lifecycle.shutdown.cancelled() => break,
            signal = signals.recv() => signal,
        };
        if signal.is_none() {
            debug!(task = %name, "Manual trigger closed");
            break;
        }
        if !runtime.lifecycle.is_running() {
            break;
        }

        debug!(task = %name, "Manual run requested");
        if tx.send(Trigger::Manual).await.is_err() {
            break;
        }
    }
}

/// Single consumer of a task's queue; runs never overlap and execute in the
/// order their triggers were queued
async fn run_executor(runtime: Arc<Runtime>, task: Task, mut rx: mpsc::Receiver<Trigger>) {
    loop {
        let trigger = tokio::select! {
            biased;
            _ = runtime.lifecycle.shutdown.cancelled() => break,
            trigger = rx.recv() => match trigger {
                Some(trigger) => trigger,
                None => break,
            },
        };
        if !runtime.lifecycle.is_running() {
            break;
        }

        execute(&runtime, &task, trigger).await;
    }
    debug!(task = %task.name, "Task loop exited");
}

/// One run: watchdog around the work, errors and panics contained here
async fn execute(runtime: &Runtime, task: &Task, trigger: Trigger) {
    let name = task.name.as_str();
    let metrics = &runtime.metrics;
    let started = Instant::now();

    metrics.active.with_label_values(&[name]).inc();
    debug!(task = name, ?trigger, "Running task");

    let work = Arc::clone(&task.work);
    let ctx = RunContext {
        trigger,
        cancel: runtime.lifecycle.shutdown.child_token(),
    };
    let run = with_watchdog(name, runtime.task_timeout, async move { work(ctx).await });
    let outcome = AssertUnwindSafe(run).catch_unwind().await;

    metrics.active.with_label_values(&[name]).dec();
    metrics
        .duration
        .with_label_values(&[name])
        .observe(started.elapsed().as_secs_f64());

    match outcome {
        Ok((result, overran)) => {
            if overran {
                metrics.overruns.with_label_values(&[name]).inc();
            }
            metrics.runs.with_label_values(&[name]).inc();
            match result {
                Ok(()) => debug!(task = name, elapsed = ?started.elapsed(), "Task finished"),
                Err(e) => {
                    metrics.failures.with_label_values(&[name]).inc();
                    error!(task = name, "Task {} failed: {:#}", task.description, e);
                },
            }
        },
        Err(panic) => {
            metrics.panics.with_label_values(&[name]).inc();
            error!(
                task = name,
                "Task {} panicked, continuing on next tick: {}",
                task.description,
                panic_message(panic.as_ref())
            );
        },
    }
}

/// Await `work`, warning once if it outlives `limit`. The work is never
/// cancelled. Returns the output and whether the limit was exceeded.
async fn with_watchdog<F: Future>(name: &str, limit: Duration, work: F) -> (F::Output, bool) {
    tokio::pin!(work);
    tokio::select! {
        biased;
        output = &mut work => (output, false),
        _ = sleep(limit) => {
            warn!(task = name, "Task {} is taking longer than {:?}", name, limit);
            (work.await, true)
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let lifecycle = Lifecycle::new(CancellationToken::new());
        assert_eq!(lifecycle.state(), SchedulerState::NotStarted);

        assert!(lifecycle.start());
        assert!(!lifecycle.start());
        assert_eq!(lifecycle.state(), SchedulerState::Running);

        lifecycle.stop();
        assert_eq!(lifecycle.state(), SchedulerState::Stopped);
    }

    #[test]
    fn test_external_cancel_stops_lifecycle() {
        let token = CancellationToken::new();
        let lifecycle = Lifecycle::new(token.clone());
        lifecycle.start();

        token.cancel();
        assert!(!lifecycle.is_running());
        assert_eq!(lifecycle.state(), SchedulerState::Stopped);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");

        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_does_not_cancel() {
        let (output, overran) = with_watchdog("slow", Duration::from_millis(10), async {
            sleep(Duration::from_millis(50)).await;
            7
        })
        .await;
        assert_eq!(output, 7);
        assert!(overran);

        let (_, overran) = with_watchdog("fast", Duration::from_millis(10), async {}).await;
        assert!(!overran);
    }

    #[test]
    fn test_task_stats_start_at_zero() {
        let scheduler = Scheduler::new(SchedulerSettings::default(), CancellationToken::new())
            .unwrap();
        assert_eq!(scheduler.task_stats("anything"), TaskStats::default());
    }
}
